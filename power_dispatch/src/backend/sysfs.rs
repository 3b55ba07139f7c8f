// Backend based on the generic Linux interfaces: powercap, hwmon, thermal zones and cpufreq.
//
// Works on any platform where the kernel exposes these files. Every path is
// relative to a root directory, `/` on a real node.

use std::{
    fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    thread,
    time::{Duration, Instant},
};

use log::debug;

use crate::powercap::{self, PowerZone, PowercapProbe, POWERCAP_ENERGY_UNIT};
use crate::{Backend, BackendError, EnergyMeasurements, EnergyProbe, Platform, RaplDomainType, Reading, Socket, Topology};

/// Energy is sampled twice, this far apart, to compute a power.
pub const DEFAULT_POWER_WINDOW: Duration = Duration::from_millis(100);

/// `-ERANGE`
pub const FREQUENCY_OUT_OF_RANGE: i32 = -34;

pub struct SysfsBackend {
    platform: Platform,
    cpu_dir: PathBuf,
    powercap_dir: PathBuf,
    hwmon_dir: PathBuf,
    thermal_dir: PathBuf,
    power_window: Duration,
}

impl SysfsBackend {
    pub fn new(platform: Platform) -> SysfsBackend {
        SysfsBackend::with_root(platform, Path::new("/"))
    }

    /// Uses `root` instead of `/` as the base of every sysfs path.
    pub fn with_root(platform: Platform, root: &Path) -> SysfsBackend {
        let powercap_rel = powercap::POWERCAP_RAPL_PATH.trim_start_matches('/');
        SysfsBackend {
            platform,
            cpu_dir: root.join("sys/devices/system/cpu"),
            powercap_dir: root.join(powercap_rel),
            hwmon_dir: root.join("sys/class/hwmon"),
            thermal_dir: root.join("sys/class/thermal"),
            power_window: DEFAULT_POWER_WINDOW,
        }
    }

    pub fn power_window(mut self, window: Duration) -> SysfsBackend {
        self.power_window = window;
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    fn cpufreq(&self, cpu: u32, file: &str) -> PathBuf {
        self.cpu_dir.join(format!("cpu{cpu}/cpufreq/{file}"))
    }

    fn zones(&self) -> Result<powercap::PowerZones, BackendError> {
        powercap::power_zones_in(&self.powercap_dir).map_err(|e| BackendError::Parse {
            path: self.powercap_dir.display().to_string(),
            detail: format!("{e:#}"),
        })
    }

    fn package_temperature(&self, socket: &Socket) -> Result<Option<PathBuf>, BackendError> {
        let hwmons = numbered_entries(&self.hwmon_dir, "hwmon");
        let mut amd_sensors = Vec::new();
        for hwmon in &hwmons {
            let name = read_trimmed(&hwmon.join("name")).unwrap_or_default();
            match name.as_str() {
                "coretemp" => {
                    let label = format!("Package id {}", socket.package_id);
                    for (n, input) in temperature_inputs(hwmon) {
                        let label_path = hwmon.join(format!("temp{n}_label"));
                        if read_trimmed(&label_path).map(|l| l == label).unwrap_or(false) {
                            return Ok(Some(input));
                        }
                    }
                }
                "k10temp" | "zenpower" => amd_sensors.push(hwmon.join("temp1_input")),
                _ => (),
            }
        }
        if let Some(input) = amd_sensors.get(socket.id as usize) {
            return Ok(Some(input.clone()));
        }

        let zones = numbered_entries(&self.thermal_dir, "thermal_zone");
        let pkg_zones: Vec<&PathBuf> = zones
            .iter()
            .filter(|z| read_trimmed(&z.join("type")).map(|t| t == "x86_pkg_temp").unwrap_or(false))
            .collect();
        if let Some(zone) = pkg_zones.get(socket.id as usize) {
            return Ok(Some(zone.join("temp")));
        }
        if socket.id == 0 {
            if let Some(zone) = zones.first() {
                return Ok(Some(zone.join("temp")));
            }
        }
        Ok(None)
    }
}

impl Backend for SysfsBackend {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn power(&self, socket: &Socket) -> Result<Reading, BackendError> {
        let hierarchy = self.zones()?;
        let zones = hierarchy.of_package(socket.package_id);
        if zones.is_empty() {
            return Err(BackendError::NotAvailable {
                path: self.powercap_dir.display().to_string(),
            });
        }

        let mut measurements = EnergyMeasurements::new(1);
        let max_energy: Vec<u64> = zones.iter().map(|z| read_number(&z.max_energy_path())).collect::<Result<_, _>>()?;

        let started = Instant::now();
        push_energy(&mut measurements, &zones, &max_energy)?;
        thread::sleep(self.power_window);
        push_energy(&mut measurements, &zones, &max_energy)?;
        let elapsed = started.elapsed().as_secs_f64();

        let mut reading = Reading::new();
        for zone in &zones {
            let counter = &measurements.per_socket[0][zone.domain];
            if let Some(joules) = counter.joules {
                reading.push(format!("{}_watts", zone.domain.short_name()), joules / elapsed);
            }
        }
        for zone in &zones {
            match read_number::<u64>(&zone.power_limit_path()) {
                Ok(uw) => reading.push(format!("{}_limit_watts", zone.domain.short_name()), uw as f64 / 1e6),
                Err(e) => debug!("no power limit for {}: {e}", zone.name),
            }
        }
        Ok(reading)
    }

    fn thermals(&self, socket: &Socket) -> Result<Reading, BackendError> {
        let input = self.package_temperature(socket)?.ok_or_else(|| BackendError::NotAvailable {
            path: self.hwmon_dir.display().to_string(),
        })?;
        let millidegrees: i64 = read_number(&input)?;
        Ok(Reading::new().with("temp_celsius", millidegrees as f64 / 1000.0))
    }

    fn clocks(&self, socket: &Socket) -> Result<Reading, BackendError> {
        let mut reading = Reading::new();
        for cpu in &socket.cpus {
            let khz: u64 = read_number(&self.cpufreq(*cpu, "scaling_cur_freq"))?;
            reading.push(format!("cpu{cpu}_mhz"), khz / 1000);
        }
        Ok(reading)
    }

    fn frequency(&self, socket: &Socket) -> Result<Reading, BackendError> {
        let mut min = u64::MAX;
        let mut max: u64 = 0;
        let mut scaling_min = u64::MAX;
        let mut scaling_max: u64 = 0;
        let mut current_sum: u64 = 0;
        for cpu in &socket.cpus {
            min = min.min(read_number(&self.cpufreq(*cpu, "cpuinfo_min_freq"))?);
            max = max.max(read_number(&self.cpufreq(*cpu, "cpuinfo_max_freq"))?);
            scaling_min = scaling_min.min(read_number(&self.cpufreq(*cpu, "scaling_min_freq"))?);
            scaling_max = scaling_max.max(read_number(&self.cpufreq(*cpu, "scaling_max_freq"))?);
            current_sum += read_number::<u64>(&self.cpufreq(*cpu, "scaling_cur_freq"))?;
        }
        let current_avg = current_sum / socket.cpus.len().max(1) as u64;
        let governor = read_trimmed(&self.cpufreq(socket.first_cpu(), "scaling_governor")).unwrap_or_default();

        Ok(Reading::new()
            .with("min_mhz", min / 1000)
            .with("max_mhz", max / 1000)
            .with("current_mhz", current_avg / 1000)
            .with("scaling_min_mhz", scaling_min / 1000)
            .with("scaling_max_mhz", scaling_max / 1000)
            .with("governor", governor))
    }

    fn hyperthreading(&self, socket: &Socket) -> Result<Reading, BackendError> {
        let siblings_path = self
            .cpu_dir
            .join(format!("cpu{}/topology/thread_siblings_list", socket.first_cpu()));
        let siblings = read_trimmed(&siblings_path)?;
        let threads_per_core = crate::parse_cpu_list(&siblings)
            .map_err(|e| BackendError::Parse {
                path: siblings_path.display().to_string(),
                detail: e.to_string(),
            })?
            .len()
            .max(1);

        let smt_enabled = match read_trimmed(&self.cpu_dir.join("smt/active")) {
            Ok(active) => active == "1",
            Err(_) => threads_per_core > 1,
        };
        Ok(Reading::new()
            .with("smt_enabled", smt_enabled)
            .with("threads_per_core", threads_per_core as u64)
            .with("logical_cpus", socket.cpus.len() as u64))
    }

    fn cap_frequency(&self, socket: &Socket, mhz: u32) -> Result<(), BackendError> {
        let khz = u64::from(mhz) * 1000;
        // check every cpu before writing anything
        for cpu in &socket.cpus {
            let min: u64 = read_number(&self.cpufreq(*cpu, "cpuinfo_min_freq"))?;
            let max: u64 = read_number(&self.cpufreq(*cpu, "cpuinfo_max_freq"))?;
            if khz < min || khz > max {
                return Err(BackendError::Rejected {
                    code: FREQUENCY_OUT_OF_RANGE,
                    reason: format!("{mhz} MHz is outside of [{}, {}] MHz for cpu{cpu}", min / 1000, max / 1000),
                });
            }
        }
        for cpu in &socket.cpus {
            write_value(&self.cpufreq(*cpu, "scaling_max_freq"), &khz.to_string())?;
        }
        Ok(())
    }

    fn enable_turbo(&self, _socket: &Socket) -> Result<(), BackendError> {
        let no_turbo = self.cpu_dir.join("intel_pstate/no_turbo");
        if no_turbo.exists() {
            return write_value(&no_turbo, "0");
        }
        let boost = self.cpu_dir.join("cpufreq/boost");
        if boost.exists() {
            return write_value(&boost, "1");
        }
        Err(BackendError::NotAvailable {
            path: no_turbo.display().to_string(),
        })
    }

    fn energy_probe(&self, topology: &Topology) -> Result<Box<dyn EnergyProbe>, BackendError> {
        let hierarchy = self.zones()?;
        let zones: Vec<&PowerZone> = hierarchy
            .iter()
            .filter(|z| matches!(z.domain, RaplDomainType::Package | RaplDomainType::Dram))
            .collect();
        let probe = PowercapProbe::new(topology, &zones).map_err(|e| BackendError::Parse {
            path: self.powercap_dir.display().to_string(),
            detail: format!("{e:#}"),
        })?;
        Ok(Box::new(probe))
    }
}

fn push_energy(measurements: &mut EnergyMeasurements, zones: &[&PowerZone], max_energy: &[u64]) -> Result<(), BackendError> {
    for (zone, max) in zones.iter().zip(max_energy) {
        let uj: u64 = read_number(&zone.energy_path())?;
        measurements.push(0, zone.domain, uj, *max, POWERCAP_ENERGY_UNIT);
    }
    Ok(())
}

/// Entries of `dir` named `<prefix><n>`, sorted by `n`.
fn numbered_entries(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut numbered: Vec<(u32, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter_map(|e| {
            let n = e.file_name().to_str()?.strip_prefix(prefix)?.parse().ok()?;
            Some((n, e.path()))
        })
        .collect();
    numbered.sort_by_key(|(n, _)| *n);
    numbered.into_iter().map(|(_, p)| p).collect()
}

/// `(n, path)` of every `temp<n>_input` of a hwmon device, sorted by `n`.
fn temperature_inputs(hwmon: &Path) -> Vec<(u32, PathBuf)> {
    let Ok(entries) = fs::read_dir(hwmon) else {
        return Vec::new();
    };
    let mut inputs: Vec<(u32, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter_map(|e| {
            let name = e.file_name().to_str()?.to_owned();
            let n = name.strip_prefix("temp")?.strip_suffix("_input")?.parse().ok()?;
            Some((n, e.path()))
        })
        .collect();
    inputs.sort_by_key(|(n, _)| *n);
    inputs
}

fn read_trimmed(path: &Path) -> Result<String, BackendError> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(s.trim().to_owned()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BackendError::NotAvailable {
            path: path.display().to_string(),
        }),
        Err(e) => Err(BackendError::io(path.display().to_string(), e)),
    }
}

fn read_number<T: FromStr>(path: &Path) -> Result<T, BackendError> {
    let content = read_trimmed(path)?;
    content.parse().map_err(|_| BackendError::Parse {
        path: path.display().to_string(),
        detail: format!("expected a number, got '{content}'"),
    })
}

fn write_value(path: &Path, value: &str) -> Result<(), BackendError> {
    debug!("writing {value} to {}", path.display());
    fs::write(path, value).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => BackendError::NotAvailable {
            path: path.display().to_string(),
        },
        _ => BackendError::io(path.display().to_string(), e),
    })
}
