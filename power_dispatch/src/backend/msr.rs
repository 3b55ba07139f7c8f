// Backend reading the model-specific registers directly.
//
// Requires the `msr` kernel module and read (write, for capping) access to
// `/dev/cpu/*/msr`. The thermal, clock and control registers are only decoded
// on Intel; on AMD this backend only provides energy and power.

use std::{fs::File, thread, time::Instant};

use crate::msr::{self, intel, RaplVendor};
use crate::{Backend, BackendError, EnergyMeasurements, EnergyProbe, QueryClass, Reading, Socket, Topology};

use super::sysfs::DEFAULT_POWER_WINDOW;

pub struct MsrBackend {
    vendor: RaplVendor,
}

impl MsrBackend {
    pub fn new(vendor: RaplVendor) -> MsrBackend {
        MsrBackend { vendor }
    }

    fn open(&self, cpu: u32) -> Result<File, BackendError> {
        msr::open_msr(cpu).map_err(|e| BackendError::io(msr::msr_path(cpu), e))
    }

    fn read(&self, fd: &File, cpu: u32, addr: msr::Addr) -> Result<u64, BackendError> {
        msr::read_msr(fd, addr).map_err(|e| BackendError::io(format!("{} @ {addr:#x}", msr::msr_path(cpu)), e))
    }

    fn intel_only(&self, query: QueryClass) -> Result<(), BackendError> {
        match self.vendor {
            RaplVendor::Intel => Ok(()),
            RaplVendor::Amd => Err(self.unsupported(query)),
        }
    }

    /// Read-modify-write of one register on every cpu of the socket.
    fn update_all(&self, socket: &Socket, addr: msr::Addr, update: impl Fn(u64) -> u64) -> Result<(), BackendError> {
        for cpu in &socket.cpus {
            let fd = msr::open_msr_rw(*cpu).map_err(|e| BackendError::io(msr::msr_path(*cpu), e))?;
            let value = self.read(&fd, *cpu, addr)?;
            msr::write_msr(&fd, addr, update(value))
                .map_err(|e| BackendError::io(format!("{} @ {addr:#x}", msr::msr_path(*cpu)), e))?;
        }
        Ok(())
    }
}

impl Backend for MsrBackend {
    fn name(&self) -> &'static str {
        "msr"
    }

    fn power(&self, socket: &Socket) -> Result<Reading, BackendError> {
        let cpu = socket.first_cpu();
        let fd = self.open(cpu)?;
        let units = msr::read_units(&fd, self.vendor).map_err(|e| BackendError::io(msr::msr_path(cpu), e))?;
        let domains: Vec<(crate::RaplDomainType, msr::Addr)> = msr::sampled_domains(self.vendor)
            .into_iter()
            .filter_map(|d| msr::domain_msr_address(d, self.vendor).map(|a| (d, a)))
            .collect();

        let mut measurements = EnergyMeasurements::new(1);
        let started = Instant::now();
        for round in 0..2 {
            if round == 1 {
                thread::sleep(DEFAULT_POWER_WINDOW);
            }
            for (domain, addr) in &domains {
                let counter = msr::read_energy_counter(&fd, *addr).map_err(|e| BackendError::io(msr::msr_path(cpu), e))?;
                measurements.push(0, *domain, counter, msr::MSR_MAX_ENERGY, units.energy);
            }
        }
        let elapsed = started.elapsed().as_secs_f64();

        let mut reading = Reading::new();
        for (domain, _) in &domains {
            if let Some(joules) = measurements.per_socket[0][*domain].joules {
                reading.push(format!("{}_watts", domain.short_name()), joules / elapsed);
            }
        }
        if self.vendor == RaplVendor::Intel {
            // power limit #1 at bits 14:0
            let limit = self.read(&fd, cpu, intel::MSR_PKG_POWER_LIMIT)? & 0x7FFF;
            reading.push("pkg_limit_watts", limit as f64 * units.power);
        }
        Ok(reading)
    }

    fn thermals(&self, socket: &Socket) -> Result<Reading, BackendError> {
        self.intel_only(QueryClass::Thermal)?;
        let cpu = socket.first_cpu();
        let fd = self.open(cpu)?;
        // TjMax at bits 23:16, distance to TjMax at bits 22:16
        let tj_max = (self.read(&fd, cpu, intel::MSR_TEMPERATURE_TARGET)? >> 16) & 0xFF;
        let readout = (self.read(&fd, cpu, intel::IA32_PACKAGE_THERM_STATUS)? >> 16) & 0x7F;
        Ok(Reading::new().with("temp_celsius", tj_max.saturating_sub(readout) as f64))
    }

    fn clocks(&self, socket: &Socket) -> Result<Reading, BackendError> {
        self.intel_only(QueryClass::Clocks)?;
        let mut reading = Reading::new();
        for cpu in &socket.cpus {
            let fd = self.open(*cpu)?;
            // current ratio at bits 15:8, in units of 100 MHz
            let ratio = (self.read(&fd, *cpu, intel::IA32_PERF_STATUS)? >> 8) & 0xFF;
            reading.push(format!("cpu{cpu}_mhz"), ratio * 100);
        }
        Ok(reading)
    }

    fn cap_frequency(&self, socket: &Socket, mhz: u32) -> Result<(), BackendError> {
        self.intel_only(QueryClass::CapFrequency)?;
        let ratio = u64::from(mhz / 100);
        if ratio == 0 || ratio > 0xFF {
            return Err(BackendError::Rejected {
                code: super::sysfs::FREQUENCY_OUT_OF_RANGE,
                reason: format!("{mhz} MHz cannot be encoded as a ratio"),
            });
        }
        self.update_all(socket, intel::IA32_PERF_CTL, |v| (v & !0xFF00) | (ratio << 8))
    }

    fn enable_turbo(&self, socket: &Socket) -> Result<(), BackendError> {
        self.intel_only(QueryClass::EnableTurbo)?;
        self.update_all(socket, intel::IA32_MISC_ENABLE, |v| v & !intel::TURBO_DISABLE_BIT)
    }

    fn energy_probe(&self, topology: &Topology) -> Result<Box<dyn EnergyProbe>, BackendError> {
        let probe = msr::MsrProbe::new(topology, self.vendor, &msr::sampled_domains(self.vendor)).map_err(|e| {
            BackendError::Io {
                path: msr::msr_path(0),
                source: std::io::Error::new(std::io::ErrorKind::Other, format!("{e:#}")),
            }
        })?;
        Ok(Box::new(probe))
    }
}
