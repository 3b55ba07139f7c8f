// See https://www.kernel.org/doc/html/latest/power/powercap/powercap.html
// for an explanation of the Power Capping framework.

use std::{
    fs::{self, File},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use log::debug;

use crate::{EnergyMeasurements, EnergyProbe, RaplDomainType, Topology};

pub const POWERCAP_RAPL_PATH: &str = "/sys/devices/virtual/powercap/intel-rapl";
pub const POWERCAP_ENERGY_UNIT: f64 = 0.000_001; // 1 microJoules

/// A RAPL zone of the powercap tree, for instance `intel-rapl:0` (package-0)
/// or `intel-rapl:0:1` (its dram subzone).
#[derive(Debug, Clone, PartialEq)]
pub struct PowerZone {
    /// Name given by the kernel, `package-0`, `core`, `dram`...
    pub name: String,
    pub domain: RaplDomainType,
    pub path: PathBuf,
    /// Kernel package id of the zone or of its parent. `None` for psys.
    pub package_id: Option<u32>,
}

impl PowerZone {
    pub fn energy_path(&self) -> PathBuf {
        self.path.join("energy_uj")
    }

    pub fn max_energy_path(&self) -> PathBuf {
        self.path.join("max_energy_range_uj")
    }

    /// Long-term power limit, in microwatts.
    pub fn power_limit_path(&self) -> PathBuf {
        self.path.join("constraint_0_power_limit_uw")
    }

    /// Long-term power limit in watts, `None` if the zone has no readable constraint.
    pub fn power_limit_watts(&self) -> Option<f64> {
        read_u64(&self.power_limit_path()).ok().map(|uw| uw as f64 / 1_000_000.0)
    }
}

/// Every RAPL zone found under a powercap control type, sorted by path.
#[derive(Debug, Default)]
pub struct PowerZones {
    zones: Vec<PowerZone>,
}

impl PowerZones {
    pub fn iter(&self) -> impl Iterator<Item = &PowerZone> {
        self.zones.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// The zones that belong to a package: the package zone first, then its subzones.
    pub fn of_package(&self, package_id: u32) -> Vec<&PowerZone> {
        self.zones.iter().filter(|z| z.package_id == Some(package_id)).collect()
    }
}

fn zone_domain(name: &str) -> Option<RaplDomainType> {
    match name {
        "core" => Some(RaplDomainType::PP0),
        "uncore" => Some(RaplDomainType::PP1),
        "dram" => Some(RaplDomainType::Dram),
        "psys" => Some(RaplDomainType::Platform),
        _ if name.starts_with("package-") => Some(RaplDomainType::Package),
        _ => None,
    }
}

/// Discovers the RAPL zones of the node.
pub fn all_power_zones() -> anyhow::Result<PowerZones> {
    power_zones_in(Path::new(POWERCAP_RAPL_PATH))
}

/// Discovers the RAPL zones under `root`. A missing root means no zone.
pub fn power_zones_in(root: &Path) -> anyhow::Result<PowerZones> {
    let mut zones = Vec::new();
    if !root.is_dir() {
        debug!("no powercap tree at {}", root.display());
        return Ok(PowerZones { zones });
    }

    // (directory, package of the parent zone)
    let mut pending: Vec<(PathBuf, Option<u32>)> = vec![(root.to_path_buf(), None)];
    while let Some((dir, parent_package)) = pending.pop() {
        for entry in fs::read_dir(&dir).with_context(|| format!("list {}", dir.display()))? {
            let path = entry?.path();
            let is_zone = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("intel-rapl:"));
            if !is_zone || !path.is_dir() {
                continue;
            }

            let name = fs::read_to_string(path.join("name"))
                .with_context(|| format!("read the name of {}", path.display()))?
                .trim()
                .to_owned();
            let package_id = match (parent_package, name.strip_prefix("package-")) {
                (Some(parent), _) => Some(parent),
                (None, Some(id)) => Some(id.parse().map_err(|_| anyhow!("bad package zone name '{name}'"))?),
                (None, None) => None,
            };
            pending.push((path.clone(), package_id));
            match zone_domain(&name) {
                Some(domain) => zones.push(PowerZone {
                    name,
                    domain,
                    path,
                    package_id,
                }),
                None => debug!("ignoring powercap zone {name} at {}", path.display()),
            }
        }
    }
    zones.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(PowerZones { zones })
}

pub(crate) fn read_u64(path: &Path) -> anyhow::Result<u64> {
    let content = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    content
        .trim_end()
        .parse()
        .with_context(|| format!("parse {}: '{content}'", path.display()))
}

/// Reads the `energy_uj` counters of a set of zones.
pub struct PowercapProbe {
    measurements: EnergyMeasurements,
    counters: Vec<ZoneCounter>,
}

struct ZoneCounter {
    /// Kept open, read with `pread` at offset 0.
    file: File,
    path: PathBuf,
    socket: u32,
    domain: RaplDomainType,
    /// Wrap-around value of the counter, from `max_energy_range_uj`.
    max_uj: u64,
}

impl PowercapProbe {
    /// Opens the counters of `zones`. A zone without package (psys) is accounted to socket 0.
    pub fn new(topology: &Topology, zones: &[&PowerZone]) -> anyhow::Result<PowercapProbe> {
        let counters = zones
            .iter()
            .map(|zone| {
                let path = zone.energy_path();
                let file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
                let socket = zone
                    .package_id
                    .and_then(|p| topology.socket_of_package(p))
                    .map_or(0, |s| s.id);
                Ok(ZoneCounter {
                    file,
                    path,
                    socket,
                    domain: zone.domain,
                    max_uj: read_u64(&zone.max_energy_path())?,
                })
            })
            .collect::<anyhow::Result<Vec<ZoneCounter>>>()?;

        Ok(PowercapProbe {
            measurements: EnergyMeasurements::new(topology.socket_count()),
            counters,
        })
    }

    pub fn zone_count(&self) -> usize {
        self.counters.len()
    }
}

impl EnergyProbe for PowercapProbe {
    fn poll(&mut self) -> anyhow::Result<()> {
        // large enough for a 20-digit counter and its newline
        let mut buf = [0u8; 32];
        for counter in &self.counters {
            let n = counter
                .file
                .read_at(&mut buf, 0)
                .with_context(|| format!("read {}", counter.path.display()))?;
            let text = std::str::from_utf8(&buf[..n])?.trim_end();
            let uj: u64 = text
                .parse()
                .with_context(|| format!("parse {}: '{text}'", counter.path.display()))?;
            self.measurements
                .push(counter.socket, counter.domain, uj, counter.max_uj, POWERCAP_ENERGY_UNIT);
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

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Creates a fake powercap tree with one package zone (and a dram subzone) per package id.
    pub(crate) fn fake_powercap(name: &str, packages: &[u32]) -> PathBuf {
        let root = std::env::temp_dir()
            .join("power_dispatch_test")
            .join(format!("powercap-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        for (i, p) in packages.iter().enumerate() {
            let pkg = root.join(format!("intel-rapl:{i}"));
            let dram = pkg.join(format!("intel-rapl:{i}:0"));
            fs::create_dir_all(&dram).unwrap();
            fs::write(pkg.join("name"), format!("package-{p}\n")).unwrap();
            fs::write(pkg.join("energy_uj"), "1000000\n").unwrap();
            fs::write(pkg.join("max_energy_range_uj"), "262143328850\n").unwrap();
            fs::write(pkg.join("constraint_0_power_limit_uw"), "125000000\n").unwrap();
            fs::write(dram.join("name"), "dram\n").unwrap();
            fs::write(dram.join("energy_uj"), "500000\n").unwrap();
            fs::write(dram.join("max_energy_range_uj"), "65712999613\n").unwrap();
        }
        root
    }

    #[test]
    fn test_zone_discovery() {
        let root = fake_powercap("discovery", &[0, 1]);
        fs::create_dir_all(root.join("intel-rapl:2")).unwrap();
        fs::write(root.join("intel-rapl:2/name"), "psys\n").unwrap();

        let zones = power_zones_in(&root).unwrap();
        assert_eq!(zones.iter().count(), 5);
        let of_1 = zones.of_package(1);
        assert_eq!(of_1.len(), 2);
        assert_eq!(of_1[0].domain, RaplDomainType::Package);
        assert_eq!(of_1[1].domain, RaplDomainType::Dram);
        assert_eq!(of_1[0].power_limit_watts(), Some(125.0));
        assert_eq!(of_1[1].power_limit_watts(), None);
        let psys = zones.iter().find(|z| z.domain == RaplDomainType::Platform).unwrap();
        assert_eq!(psys.package_id, None);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let zones = power_zones_in(Path::new("/nonexistent/powercap")).unwrap();
        assert!(zones.is_empty());
    }

    #[test]
    fn test_probe_poll() {
        let root = fake_powercap("probe", &[0]);
        let zones = power_zones_in(&root).unwrap();
        let topology = Topology::from_packages([(0, vec![0, 1])]);
        let selected: Vec<&PowerZone> = zones.iter().collect();
        let mut probe = PowercapProbe::new(&topology, &selected).unwrap();
        assert_eq!(probe.zone_count(), 2);

        probe.poll().unwrap();
        fs::write(root.join("intel-rapl:0/energy_uj"), "3000000\n").unwrap();
        probe.poll().unwrap();

        let joules = probe.measurements().per_socket[0][RaplDomainType::Package].joules.unwrap();
        assert!((joules - 2.0).abs() < 1e-9);
        let dram = probe.measurements().per_socket[0][RaplDomainType::Dram].joules.unwrap();
        assert_eq!(dram, 0.0);
        let _ = fs::remove_dir_all(&root);
    }
}
