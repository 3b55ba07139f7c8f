use std::{fmt::Display, fs, path::Path};

use clap::ValueEnum;
use log::{debug, info};
use regex::Regex;

use crate::backend::msr::MsrBackend;
use crate::backend::SysfsBackend;
use crate::msr::RaplVendor;
use crate::{powercap, Backend, BackendError, QueryClass};

const CPUINFO_PATH: &str = "/proc/cpuinfo";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Intel,
    Amd,
    Arm,
    Unknown,
}

impl Platform {
    /// Reads `/proc/cpuinfo`. An unreadable file gives [`Platform::Unknown`].
    pub fn detect() -> Result<Platform, regex::Error> {
        match fs::read_to_string(CPUINFO_PATH) {
            Ok(cpuinfo) => Platform::from_cpuinfo(&cpuinfo),
            Err(e) => {
                debug!("cannot read {CPUINFO_PATH}: {e}");
                Ok(Platform::Unknown)
            }
        }
    }

    pub fn from_cpuinfo(cpuinfo: &str) -> Result<Platform, regex::Error> {
        let regex = Regex::new(r"(?m)^(?:vendor_id\s*:\s*(?P<vendor>\w+)|CPU implementer\s*:\s*0x[0-9a-fA-F]+)")?;
        let mut platform = Platform::Unknown;
        for caps in regex.captures_iter(cpuinfo) {
            match caps.name("vendor").map(|v| v.as_str()) {
                Some("GenuineIntel") => return Ok(Platform::Intel),
                Some("AuthenticAMD" | "HygonGenuine") => return Ok(Platform::Amd),
                Some(_) => return Ok(Platform::Unknown),
                // any implementer (0x41 ARM, 0x4e NVIDIA, 0xc0 Ampere...) means an Arm core
                None => platform = Platform::Arm,
            }
        }
        Ok(platform)
    }

    pub fn rapl_vendor(&self) -> Option<RaplVendor> {
        match self {
            Platform::Intel => Some(RaplVendor::Intel),
            Platform::Amd => Some(RaplVendor::Amd),
            _ => None,
        }
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (self as &dyn std::fmt::Debug).fmt(f)
    }
}

/// How to access the hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Default)]
pub enum BackendKind {
    /// Choose from the platform and the available interfaces.
    #[default]
    Auto,
    /// Linux sysfs: powercap, hwmon, cpufreq.
    Sysfs,
    /// Model-specific registers through /dev/cpu/*/msr (Intel and AMD).
    Msr,
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            BackendKind::Auto => "auto",
            BackendKind::Sysfs => "sysfs",
            BackendKind::Msr => "msr",
        };
        f.write_str(str)
    }
}

/// Creates the backend for this platform.
pub fn select_backend(kind: BackendKind, platform: Platform) -> Result<Box<dyn Backend>, BackendError> {
    let kind = match kind {
        BackendKind::Auto => {
            let has_powercap = Path::new(powercap::POWERCAP_RAPL_PATH).is_dir();
            let has_msr = Path::new(&crate::msr::msr_path(0)).exists();
            if !has_powercap && has_msr && platform.rapl_vendor().is_some() {
                BackendKind::Msr
            } else {
                BackendKind::Sysfs
            }
        }
        explicit => explicit,
    };
    info!("platform {platform}, using the {kind} backend");

    match kind {
        BackendKind::Msr => {
            let vendor = platform.rapl_vendor().ok_or(BackendError::Unsupported {
                backend: "msr",
                query: QueryClass::Power,
            })?;
            Ok(Box::new(MsrBackend::new(vendor)))
        }
        _ => Ok(Box::new(SysfsBackend::new(platform))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_x86() -> Result<(), regex::Error> {
        let intel = "processor\t: 0\nvendor_id\t: GenuineIntel\ncpu family\t: 6\n";
        assert_eq!(Platform::from_cpuinfo(intel)?, Platform::Intel);
        let amd = "processor\t: 0\nvendor_id\t: AuthenticAMD\n";
        assert_eq!(Platform::from_cpuinfo(amd)?, Platform::Amd);
        assert_eq!(Platform::Amd.rapl_vendor(), Some(RaplVendor::Amd));
        Ok(())
    }

    #[test]
    fn test_detect_arm() -> Result<(), regex::Error> {
        let arm = "processor\t: 0\nBogoMIPS\t: 48.00\nCPU implementer\t: 0x41\nCPU architecture: 8\n";
        assert_eq!(Platform::from_cpuinfo(arm)?, Platform::Arm);
        assert_eq!(Platform::Arm.rapl_vendor(), None);
        Ok(())
    }

    #[test]
    fn test_detect_unknown() -> Result<(), regex::Error> {
        assert_eq!(Platform::from_cpuinfo("cpu\t\t: POWER9\n")?, Platform::Unknown);
        assert_eq!(Platform::from_cpuinfo("")?, Platform::Unknown);
        Ok(())
    }

    #[test]
    fn test_msr_backend_needs_rapl() {
        assert!(select_backend(BackendKind::Msr, Platform::Arm).is_err());
        let b = select_backend(BackendKind::Sysfs, Platform::Arm).unwrap();
        assert_eq!(b.name(), "sysfs");
    }
}
