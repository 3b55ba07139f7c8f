use std::fmt::Display;

use serde_json::Value;

use crate::{BackendError, EnergyProbe, Socket, Topology};

pub mod msr;
pub mod sysfs;

pub use sysfs::SysfsBackend;

/// The generic queries routed by [`crate::ArchitectureDispatch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryClass {
    Power,
    Thermal,
    Clocks,
    Frequency,
    CapFrequency,
    EnableTurbo,
    Hyperthreading,
}

impl QueryClass {
    pub const ALL: [QueryClass; 7] = [
        QueryClass::Power,
        QueryClass::Thermal,
        QueryClass::Clocks,
        QueryClass::Frequency,
        QueryClass::CapFrequency,
        QueryClass::EnableTurbo,
        QueryClass::Hyperthreading,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            QueryClass::Power => "power",
            QueryClass::Thermal => "thermal",
            QueryClass::Clocks => "clocks",
            QueryClass::Frequency => "frequency",
            QueryClass::CapFrequency => "cap_frequency",
            QueryClass::EnableTurbo => "enable_turbo",
            QueryClass::Hyperthreading => "hyperthreading",
        }
    }

    /// `true` for the queries that change the hardware state.
    pub fn is_mutating(&self) -> bool {
        matches!(self, QueryClass::CapFrequency | QueryClass::EnableTurbo)
    }
}

impl Display for QueryClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered list of named values returned by a backend for one socket.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reading {
    fields: Vec<(String, Value)>,
}

impl Reading {
    pub fn new() -> Reading {
        Reading::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.push((name.into(), value.into()));
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Reading {
        self.push(name, value);
        self
    }

    pub fn fields(&self) -> &[(String, Value)] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// The result of one query on one socket, consumed immediately by an [`crate::Output`].
#[derive(Debug, Clone, PartialEq)]
pub struct PowerQueryResult {
    pub socket_id: u32,
    pub query: QueryClass,
    pub reading: Reading,
}

/// A set of hardware operations for one platform.
///
/// The dispatch layer only calls these methods with sockets that belong to the
/// topology, so implementations don't need to validate them.
pub trait Backend: Send + Sync {
    /// Short name for logs and error messages.
    fn name(&self) -> &'static str;

    fn power(&self, socket: &Socket) -> Result<Reading, BackendError> {
        let _ = socket;
        Err(self.unsupported(QueryClass::Power))
    }

    fn thermals(&self, socket: &Socket) -> Result<Reading, BackendError> {
        let _ = socket;
        Err(self.unsupported(QueryClass::Thermal))
    }

    /// Current clock of each cpu of the socket.
    fn clocks(&self, socket: &Socket) -> Result<Reading, BackendError> {
        let _ = socket;
        Err(self.unsupported(QueryClass::Clocks))
    }

    /// Frequency range and limits of the socket.
    fn frequency(&self, socket: &Socket) -> Result<Reading, BackendError> {
        let _ = socket;
        Err(self.unsupported(QueryClass::Frequency))
    }

    fn hyperthreading(&self, socket: &Socket) -> Result<Reading, BackendError> {
        let _ = socket;
        Err(self.unsupported(QueryClass::Hyperthreading))
    }

    /// Limits the frequency of all the cpus of the socket, in MHz.
    fn cap_frequency(&self, socket: &Socket, mhz: u32) -> Result<(), BackendError> {
        let _ = (socket, mhz);
        Err(self.unsupported(QueryClass::CapFrequency))
    }

    fn enable_turbo(&self, socket: &Socket) -> Result<(), BackendError> {
        let _ = socket;
        Err(self.unsupported(QueryClass::EnableTurbo))
    }

    /// Creates the probe that reads the raw energy counters of every socket.
    fn energy_probe(&self, topology: &Topology) -> Result<Box<dyn EnergyProbe>, BackendError>;

    fn unsupported(&self, query: QueryClass) -> BackendError {
        BackendError::Unsupported {
            backend: self.name(),
            query,
        }
    }
}
