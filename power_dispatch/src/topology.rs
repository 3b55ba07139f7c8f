use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::TopologyError;

const SYSFS_CPU_PATH: &str = "/sys/devices/system/cpu";

/// A physical CPU package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socket {
    /// Dense index, in `0..socket_count`. This is the id accepted by the dispatch layer.
    pub id: u32,
    /// Id reported by the kernel (`physical_package_id`), may be sparse.
    pub package_id: u32,
    /// Logical cpus of this package, in ascending order.
    pub cpus: Vec<u32>,
}

impl Socket {
    /// The cpu used to access per-package registers.
    pub fn first_cpu(&self) -> u32 {
        self.cpus[0]
    }
}

/// Sockets of the node, discovered once and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    sockets: Vec<Socket>,
}

impl Topology {
    pub fn discover() -> Result<Topology, TopologyError> {
        Topology::discover_in(Path::new(SYSFS_CPU_PATH))
    }

    /// Reads the topology from a sysfs cpu directory, for instance `/sys/devices/system/cpu`.
    pub fn discover_in(cpu_dir: &Path) -> Result<Topology, TopologyError> {
        let entries = fs::read_dir(cpu_dir).map_err(|source| TopologyError::Read {
            path: cpu_dir.display().to_string(),
            source,
        })?;

        let mut packages: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        let mut cpus_without_package = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            let file_name = entry.file_name();
            let Some(cpu) = file_name.to_str().and_then(|n| n.strip_prefix("cpu")).and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            let package_path = entry.path().join("topology/physical_package_id");
            match fs::read_to_string(&package_path) {
                Ok(content) => match parse_package_id(&package_path, &content)? {
                    Some(package) => packages.entry(package).or_default().push(cpu),
                    None => cpus_without_package.push(cpu),
                },
                Err(e) => {
                    debug!("no package id for cpu{cpu}: {e}");
                    cpus_without_package.push(cpu);
                }
            }
        }

        if packages.is_empty() {
            let cpus = online_cpus(cpu_dir).unwrap_or(cpus_without_package);
            if cpus.is_empty() {
                return Err(TopologyError::NotFound {
                    path: cpu_dir.display().to_string(),
                });
            }
            warn!("cpu package ids are not readable, assuming a single socket");
            packages.insert(0, cpus);
        }

        Ok(Topology::from_packages(packages))
    }

    /// Builds a topology from a map `package id -> cpus`.
    pub fn from_packages(packages: impl IntoIterator<Item = (u32, Vec<u32>)>) -> Topology {
        let packages: BTreeMap<u32, Vec<u32>> = packages.into_iter().collect();
        let sockets = packages
            .into_iter()
            .enumerate()
            .map(|(i, (package_id, mut cpus))| {
                cpus.sort_unstable();
                cpus.dedup();
                Socket {
                    id: i as u32,
                    package_id,
                    cpus,
                }
            })
            .collect();
        Topology { sockets }
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    pub fn socket_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.sockets.iter().map(|s| s.id)
    }

    /// All the sockets, ordered by id.
    pub fn sockets(&self) -> &[Socket] {
        &self.sockets
    }

    /// Returns the socket with this id, or `None` if `id` is not in `0..socket_count`.
    pub fn socket(&self, id: i32) -> Option<&Socket> {
        usize::try_from(id).ok().and_then(|i| self.sockets.get(i))
    }

    /// Finds the socket of a kernel package id.
    pub fn socket_of_package(&self, package_id: u32) -> Option<&Socket> {
        self.sockets.iter().find(|s| s.package_id == package_id)
    }
}

fn parse_package_id(path: &Path, content: &str) -> Result<Option<u32>, TopologyError> {
    let trimmed = content.trim();
    let id: i64 = trimmed.parse().map_err(|_| TopologyError::Parse {
        path: path.display().to_string(),
        detail: format!("expected a package id, got '{trimmed}'"),
    })?;
    // some virtual cpus report -1
    Ok(u32::try_from(id).ok())
}

fn online_cpus(cpu_dir: &Path) -> Option<Vec<u32>> {
    let path: PathBuf = cpu_dir.join("online");
    let list = fs::read_to_string(path).ok()?;
    crate::parse_cpu_list(&list).ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Creates a fake `/sys/devices/system/cpu` tree. `cpus` is a list of `(cpu, package)`.
    pub(crate) fn fake_cpu_dir(name: &str, cpus: &[(u32, Option<u32>)]) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("power_dispatch_test")
            .join(format!("{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        for (cpu, package) in cpus {
            let topo = dir.join(format!("cpu{cpu}/topology"));
            fs::create_dir_all(&topo).unwrap();
            if let Some(p) = package {
                fs::write(topo.join("physical_package_id"), format!("{p}\n")).unwrap();
            }
        }
        // entries that look like cpus but are not
        fs::create_dir_all(dir.join("cpufreq")).unwrap();
        fs::create_dir_all(dir.join("cpuidle")).unwrap();
        dir
    }

    #[test]
    fn test_discover_two_sockets() {
        let dir = fake_cpu_dir("two", &[(0, Some(0)), (1, Some(1)), (2, Some(0)), (3, Some(1))]);
        let topo = Topology::discover_in(&dir).unwrap();
        assert_eq!(topo.socket_count(), 2);
        assert_eq!(topo.socket_ids().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(topo.sockets()[0].cpus, vec![0, 2]);
        assert_eq!(topo.sockets()[1].cpus, vec![1, 3]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_sparse_package_ids_get_dense_socket_ids() {
        let dir = fake_cpu_dir("sparse", &[(0, Some(3)), (8, Some(7)), (9, Some(7))]);
        let topo = Topology::discover_in(&dir).unwrap();
        let s1 = topo.socket(1).unwrap();
        assert_eq!(s1.package_id, 7);
        assert_eq!(s1.first_cpu(), 8);
        assert_eq!(topo.socket_of_package(3).map(|s| s.id), Some(0));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_fallback_to_single_socket() {
        let dir = fake_cpu_dir("nopkg", &[(0, None), (1, None)]);
        fs::write(dir.join("online"), "0-1\n").unwrap();
        let topo = Topology::discover_in(&dir).unwrap();
        assert_eq!(topo.socket_count(), 1);
        assert_eq!(topo.sockets()[0].cpus, vec![0, 1]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_empty_dir() {
        let dir = fake_cpu_dir("empty", &[]);
        assert!(matches!(Topology::discover_in(&dir), Err(TopologyError::NotFound { .. })));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_socket_bounds() {
        let topo = Topology::from_packages([(0, vec![0, 1]), (1, vec![2, 3])]);
        assert!(topo.socket(-1).is_none());
        assert!(topo.socket(2).is_none());
        assert_eq!(topo.socket(1).map(|s| s.id), Some(1));
    }
}
