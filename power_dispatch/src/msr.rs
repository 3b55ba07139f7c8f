// According to Intel 64 and IA-32 architectures software developer's manual, volume 3B,
// MSR_PKG_ENERGY_STATUS reports the measured energy usage of the package.

use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::prelude::FileExt,
};

use anyhow::Context;

use crate::{EnergyMeasurements, EnergyProbe, RaplDomainType, Topology};

pub type Addr = u64;

/// MSR registers' addresses for Intel RAPL domains and model-specific controls
pub mod intel {
    use super::Addr;

    pub const MSR_RAPL_POWER_UNIT: Addr = 0x00000606;
    pub const MSR_PKG_POWER_LIMIT: Addr = 0x00000610;
    pub const MSR_PKG_ENERGY_STATUS: Addr = 0x00000611;
    pub const MSR_PP0_ENERGY_STATUS: Addr = 0x00000639;
    pub const MSR_PP1_ENERGY_STATUS: Addr = 0x00000641;
    pub const MSR_DRAM_ENERGY_STATUS: Addr = 0x00000619;
    pub const MSR_PLATFORM_ENERGY_STATUS: Addr = 0x0000064D;

    pub const IA32_PERF_STATUS: Addr = 0x00000198;
    pub const IA32_PERF_CTL: Addr = 0x00000199;
    pub const IA32_MISC_ENABLE: Addr = 0x000001A0;
    pub const MSR_TEMPERATURE_TARGET: Addr = 0x000001A2;
    pub const IA32_PACKAGE_THERM_STATUS: Addr = 0x000001B1;

    /// Bit of IA32_MISC_ENABLE that *disables* turbo when set
    pub const TURBO_DISABLE_BIT: u64 = 1 << 38;
}

/// MSR registers' addresses for AMD RAPL domains
pub mod amd {
    use super::Addr;

    pub const MSR_RAPL_POWER_UNIT: Addr = 0xc0010299;
    pub const MSR_CORE_ENERGY_STATUS: Addr = 0xc001029a;
    pub const MSR_PKG_ENERGY_STATUS: Addr = 0xc001029b;
}

/// Mask to apply when reading the energy values
const MSR_ENERGY_MASK: u64 = 0xffffffff;

/// Maximum value of the MSR counter.
/// Note that this technically depends on the exact hardware, but for our purposes it's good enough.
pub const MSR_MAX_ENERGY: u64 = u32::MAX as u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaplVendor {
    Intel,
    Amd,
}

pub fn msr_path(cpu: u32) -> String {
    format!("/dev/cpu/{cpu}/msr")
}

pub fn open_msr(cpu: u32) -> io::Result<File> {
    File::open(msr_path(cpu))
}

pub fn open_msr_rw(cpu: u32) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(msr_path(cpu))
}

pub fn read_msr(msr: &File, at: Addr) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    msr.read_exact_at(&mut buf, at)?;
    Ok(u64::from_ne_bytes(buf))
}

pub fn write_msr(msr: &File, at: Addr, value: u64) -> io::Result<()> {
    msr.write_all_at(&value.to_ne_bytes(), at)
}

/// Units decoded from MSR_RAPL_POWER_UNIT.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RaplUnits {
    /// Watts per unit of the power fields.
    pub power: f64,
    /// Joules per unit of the energy counters.
    pub energy: f64,
}

impl RaplUnits {
    pub fn decode(msr_value: u64) -> RaplUnits {
        // power units at bits 3:0, energy status units at bits 12:8;
        // each unit is 1/(2^value)
        let pu = msr_value & 0xF;
        let esu = (msr_value & 0x1F00) >> 8;
        RaplUnits {
            power: 0.5_f64.powi(pu as i32),
            energy: 0.5_f64.powi(esu as i32),
        }
    }
}

/// Reads MSR_RAPL_POWER_UNIT of the vendor.
///
/// Some server parts use a fixed unit for DRAM that differs from the one returned here.
pub fn read_units(msr: &File, vendor: RaplVendor) -> io::Result<RaplUnits> {
    let offset = match vendor {
        RaplVendor::Intel => intel::MSR_RAPL_POWER_UNIT,
        RaplVendor::Amd => amd::MSR_RAPL_POWER_UNIT,
    };
    Ok(RaplUnits::decode(read_msr(msr, offset)?))
}

pub fn read_energy_counter(msr: &File, addr: Addr) -> io::Result<u64> {
    Ok(read_msr(msr, addr)? & MSR_ENERGY_MASK)
}

pub fn domain_msr_address(domain: RaplDomainType, vendor: RaplVendor) -> Option<Addr> {
    match vendor {
        RaplVendor::Intel => match domain {
            RaplDomainType::Package => Some(intel::MSR_PKG_ENERGY_STATUS),
            RaplDomainType::PP0 => Some(intel::MSR_PP0_ENERGY_STATUS),
            RaplDomainType::PP1 => Some(intel::MSR_PP1_ENERGY_STATUS),
            RaplDomainType::Dram => Some(intel::MSR_DRAM_ENERGY_STATUS),
            RaplDomainType::Platform => Some(intel::MSR_PLATFORM_ENERGY_STATUS),
        },
        RaplVendor::Amd => match domain {
            RaplDomainType::Package => Some(amd::MSR_PKG_ENERGY_STATUS),
            RaplDomainType::PP0 => Some(amd::MSR_CORE_ENERGY_STATUS),
            RaplDomainType::PP1 => None,
            RaplDomainType::Dram => None,
            RaplDomainType::Platform => None,
        },
    }
}

/// Domains sampled by the harness: those that make up the node power.
pub fn sampled_domains(vendor: RaplVendor) -> Vec<RaplDomainType> {
    match vendor {
        RaplVendor::Intel => vec![RaplDomainType::Package, RaplDomainType::Dram],
        RaplVendor::Amd => vec![RaplDomainType::Package],
    }
}

/// Reads the RAPL energy status registers of the first cpu of each socket.
pub struct MsrProbe {
    measurements: EnergyMeasurements,
    sockets: Vec<SocketRegisters>,
    /// `(domain, energy status address)` read on every socket
    registers: Vec<(RaplDomainType, Addr)>,
}

struct SocketRegisters {
    socket_id: u32,
    device: File,
    /// Joules per counter increment, read once from MSR_RAPL_POWER_UNIT
    energy_unit: f64,
}

impl MsrProbe {
    pub fn new(topology: &Topology, vendor: RaplVendor, domains: &[RaplDomainType]) -> anyhow::Result<MsrProbe> {
        let mut registers = Vec::with_capacity(domains.len());
        for domain in domains {
            let addr = domain_msr_address(*domain, vendor)
                .with_context(|| format!("no energy status register for {domain} on {vendor:?}"))?;
            registers.push((*domain, addr));
        }

        let mut sockets = Vec::with_capacity(topology.socket_count());
        for socket in topology.sockets() {
            let cpu = socket.first_cpu();
            let device = open_msr(cpu).with_context(|| format!("open {}", msr_path(cpu)))?;
            let energy_unit = read_units(&device, vendor)
                .with_context(|| format!("read the RAPL units of cpu {cpu}"))?
                .energy;
            sockets.push(SocketRegisters {
                socket_id: socket.id,
                device,
                energy_unit,
            });
        }

        Ok(MsrProbe {
            measurements: EnergyMeasurements::new(topology.socket_count()),
            sockets,
            registers,
        })
    }
}

impl EnergyProbe for MsrProbe {
    fn poll(&mut self) -> anyhow::Result<()> {
        for socket in &self.sockets {
            for (domain, addr) in &self.registers {
                let raw = read_energy_counter(&socket.device, *addr)
                    .with_context(|| format!("read MSR {addr:#x} ({domain}) of socket {}", socket.socket_id))?;
                self.measurements
                    .push(socket.socket_id, *domain, raw, MSR_MAX_ENERGY, socket.energy_unit);
            }
        }
        Ok(())
    }

    fn measurements(&self) -> &EnergyMeasurements {
        &self.measurements
    }

    fn reset(&mut self) {
        self.measurements.clear()
    }
}
