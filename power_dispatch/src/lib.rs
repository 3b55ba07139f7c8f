use std::fmt::Display;

use anyhow::Context;
use clap::ValueEnum;
use enum_map::{Enum, EnumMap};

pub mod backend;
pub mod dispatch;
pub mod error;
pub mod msr;
pub mod output;
pub mod platform;
pub mod powercap;
pub mod topology;

pub use backend::{Backend, PowerQueryResult, QueryClass, Reading};
pub use dispatch::{status_of, ArchitectureDispatch, SocketSelector};
pub use error::{BackendError, DispatchError, TopologyError};
pub use output::{Output, OutputMode};
pub use platform::{select_backend, BackendKind, Platform};
pub use topology::{Socket, Topology};

#[derive(Enum, Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum RaplDomainType {
    /// entire socket
    Package,
    /// power plane 0: core
    PP0,
    /// power plane 1: uncore
    PP1,
    ///  DRAM
    Dram,
    /// psys
    Platform,
}

impl RaplDomainType {
    pub const ALL: [RaplDomainType; 5] = [
        RaplDomainType::Package,
        RaplDomainType::PP0,
        RaplDomainType::PP1,
        RaplDomainType::Dram,
        RaplDomainType::Platform,
    ];

    /// Name used as a field prefix in query results, e.g. `pkg_watts`.
    pub fn short_name(&self) -> &'static str {
        match self {
            RaplDomainType::Package => "pkg",
            RaplDomainType::PP0 => "core",
            RaplDomainType::PP1 => "uncore",
            RaplDomainType::Dram => "dram",
            RaplDomainType::Platform => "psys",
        }
    }
}

impl Display for RaplDomainType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        (self as &dyn std::fmt::Debug).fmt(f)
    }
}

/// A source of raw RAPL energy counters, polled by the sampling loop of the harness.
pub trait EnergyProbe: Send {
    /// Reads every counter once and updates [`EnergyProbe::measurements`].
    ///
    /// The counters are 32 bits wide on most parts and wrap around in a few
    /// minutes under load, sometimes less. Only one wrap-around can be corrected
    /// between two polls, so the polling interval must stay well below that.
    fn poll(&mut self) -> anyhow::Result<()>;

    /// The energy consumed between the last two polls.
    fn measurements(&self) -> &EnergyMeasurements;

    /// Forgets the previous counter values.
    fn reset(&mut self);
}

/// Energy consumed per socket and per domain, between two consecutive polls.
#[derive(Debug, Clone)]
pub struct EnergyMeasurements {
    pub per_socket: Vec<EnumMap<RaplDomainType, EnergyCounter>>,
}

#[derive(Debug, Default, Clone)]
pub struct EnergyCounter {
    /// Last raw value, before the energy unit is applied.
    last_raw: Option<u64>,
    /// Set when the counter has wrapped around since the previous poll.
    pub overflowed: bool,
    /// Joules consumed since the previous poll. RAPL units are powers of two,
    /// so the conversion to `f64` is exact.
    pub joules: Option<f64>,
}

impl EnergyCounter {
    fn update(&mut self, raw: u64, max_raw: u64, unit: f64) {
        if let Some(last) = self.last_raw {
            self.overflowed = raw < last;
            // at most one wrap can be detected, the counter goes through max_raw then 0
            let delta = if self.overflowed {
                max_raw.saturating_sub(last).saturating_add(raw).saturating_add(1)
            } else {
                raw - last
            };
            self.joules = Some(delta as f64 * unit);
        }
        self.last_raw = Some(raw);
    }
}

impl EnergyMeasurements {
    pub fn new(socket_count: usize) -> EnergyMeasurements {
        EnergyMeasurements {
            per_socket: vec![EnumMap::default(); socket_count],
        }
    }

    pub fn domains_of_socket(&self, socket_id: u32) -> impl Iterator<Item = (RaplDomainType, &EnergyCounter)> {
        self.per_socket[socket_id as usize].iter()
    }

    /// Records a new raw value of the counter of `domain` on `socket_id`.
    pub fn push(&mut self, socket_id: u32, domain: RaplDomainType, raw: u64, max_raw: u64, energy_unit: f64) {
        self.per_socket[socket_id as usize][domain].update(raw, max_raw, energy_unit);
    }

    pub fn clear(&mut self) {
        self.per_socket.iter_mut().for_each(|s| s.clear());
    }

    /// Sum of the joules of the given domains, over all the sockets.
    pub fn total_joules(&self, domains: &[RaplDomainType]) -> f64 {
        self.per_socket
            .iter()
            .flat_map(|s| domains.iter().filter_map(|d| s[*d].joules))
            .sum()
    }
}

/// Parses a kernel cpulist, for instance `0-3,8,10-11`. An empty list is valid.
pub fn parse_cpu_list(cpulist: &str) -> anyhow::Result<Vec<u32>> {
    let mut cpus = Vec::new();
    for item in cpulist.trim().split(',').filter(|i| !i.is_empty()) {
        match item.split_once('-') {
            Some((first, last)) => {
                let first: u32 = first.parse().with_context(|| format!("invalid cpulist item '{item}'"))?;
                let last: u32 = last.parse().with_context(|| format!("invalid cpulist item '{item}'"))?;
                cpus.extend(first..=last);
            }
            None => cpus.push(item.parse().with_context(|| format!("invalid cpulist item '{item}'"))?),
        }
    }
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_list() -> anyhow::Result<()> {
        assert_eq!(parse_cpu_list("0")?, vec![0]);
        assert_eq!(parse_cpu_list("0,64\n")?, vec![0, 64]);
        assert_eq!(parse_cpu_list("0-1")?, vec![0, 1]);
        assert_eq!(parse_cpu_list("1-3,5-6")?, vec![1, 2, 3, 5, 6]);
        assert_eq!(parse_cpu_list("")?, Vec::<u32>::new());
        assert!(parse_cpu_list("1-2-3").is_err());
        assert!(parse_cpu_list("a").is_err());
        Ok(())
    }

    #[test]
    fn test_push_first_value_has_no_energy() {
        let mut m = EnergyMeasurements::new(1);
        m.push(0, RaplDomainType::Package, 1000, u32::MAX as u64, 0.5);
        assert_eq!(m.per_socket[0][RaplDomainType::Package].joules, None);

        m.push(0, RaplDomainType::Package, 1100, u32::MAX as u64, 0.5);
        let counter = &m.per_socket[0][RaplDomainType::Package];
        assert_eq!(counter.joules, Some(50.0));
        assert!(!counter.overflowed);
    }

    #[test]
    fn test_push_corrects_one_overflow() {
        let mut m = EnergyMeasurements::new(2);
        m.push(1, RaplDomainType::Dram, 90, 100, 1.0);
        m.push(1, RaplDomainType::Dram, 10, 100, 1.0);
        let counter = &m.per_socket[1][RaplDomainType::Dram];
        assert!(counter.overflowed);
        // 90 -> 100 -> 0 -> 10
        assert_eq!(counter.joules, Some(21.0));
        // the other socket is untouched
        assert_eq!(m.per_socket[0][RaplDomainType::Dram].joules, None);
    }

    #[test]
    fn test_push_bogus_value_above_max() {
        let mut m = EnergyMeasurements::new(1);
        m.push(0, RaplDomainType::Package, 150, 100, 1.0);
        m.push(0, RaplDomainType::Package, 10, 100, 1.0);
        let counter = &m.per_socket[0][RaplDomainType::Package];
        assert!(counter.overflowed);
        assert_eq!(counter.joules, Some(11.0));
    }

    #[test]
    fn test_total_joules_and_clear() {
        let mut m = EnergyMeasurements::new(2);
        for (socket, base) in [(0, 0), (1, 100)] {
            m.push(socket, RaplDomainType::Package, base, 1000, 1.0);
            m.push(socket, RaplDomainType::Package, base + 5, 1000, 1.0);
            m.push(socket, RaplDomainType::Dram, base, 1000, 1.0);
            m.push(socket, RaplDomainType::Dram, base + 2, 1000, 1.0);
        }
        assert_eq!(m.total_joules(&[RaplDomainType::Package]), 10.0);
        assert_eq!(m.total_joules(&[RaplDomainType::Package, RaplDomainType::Dram]), 14.0);

        m.clear();
        assert_eq!(m.total_joules(&RaplDomainType::ALL), 0.0);
        m.push(0, RaplDomainType::Package, 7, 1000, 1.0);
        assert_eq!(m.per_socket[0][RaplDomainType::Package].joules, None);
    }
}
