use log::{debug, info};

use crate::{
    Backend, BackendError, DispatchError, EnergyProbe, Output, PowerQueryResult, QueryClass, Reading, Socket,
    Topology,
};

/// Which sockets a query applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketSelector {
    /// Every socket, in ascending order.
    All,
    /// A single socket id, validated against the topology.
    One(i32),
}

impl From<Option<i32>> for SocketSelector {
    fn from(value: Option<i32>) -> Self {
        match value {
            Some(id) => SocketSelector::One(id),
            None => SocketSelector::All,
        }
    }
}

/// Converts the result of a dispatch call to the integer status of the C-like API:
/// 0 on success, the backend's (or -EINVAL's) non-zero code otherwise.
pub fn status_of(result: &Result<(), DispatchError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.status(),
    }
}

pub struct ArchitectureDispatch {
    topology: Topology,
    backend: Box<dyn Backend>,
}

impl ArchitectureDispatch {
    pub fn new(topology: Topology, backend: Box<dyn Backend>) -> ArchitectureDispatch {
        ArchitectureDispatch { topology, backend }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Creates the energy probe of the backend, for every socket of the node.
    pub fn energy_probe(&self) -> Result<Box<dyn EnergyProbe>, BackendError> {
        self.backend.energy_probe(&self.topology)
    }

    /// Resolves the sockets to visit. No backend call is made if the selector is invalid.
    fn sockets(&self, selector: SocketSelector) -> Result<Vec<&Socket>, DispatchError> {
        match selector {
            SocketSelector::All => Ok(self.topology.sockets().iter().collect()),
            SocketSelector::One(id) => match self.topology.socket(id) {
                Some(socket) => Ok(vec![socket]),
                None => Err(DispatchError::InvalidSocket {
                    id,
                    count: self.topology.socket_count(),
                }),
            },
        }
    }

    fn read(&self, query: QueryClass, selector: SocketSelector, out: &mut Output) -> Result<(), DispatchError> {
        let sockets = self.sockets(selector)?;
        for (i, socket) in sockets.into_iter().enumerate() {
            debug!("{query} on socket {} with the {} backend", socket.id, self.backend.name());
            let reading = self.read_socket(query, socket).map_err(|source| DispatchError::Backend {
                socket: socket.id,
                source,
            })?;
            let result = PowerQueryResult {
                socket_id: socket.id,
                query,
                reading,
            };
            out.emit(&result, i == 0)?;
        }
        Ok(())
    }

    fn read_socket(&self, query: QueryClass, socket: &Socket) -> Result<Reading, BackendError> {
        match query {
            QueryClass::Power => self.backend.power(socket),
            QueryClass::Thermal => self.backend.thermals(socket),
            QueryClass::Clocks => self.backend.clocks(socket),
            QueryClass::Frequency => self.backend.frequency(socket),
            QueryClass::Hyperthreading => self.backend.hyperthreading(socket),
            QueryClass::CapFrequency | QueryClass::EnableTurbo => Err(self.backend.unsupported(query)),
        }
    }

    fn mutate(
        &self,
        query: QueryClass,
        selector: SocketSelector,
        op: impl Fn(&Socket) -> Result<(), BackendError>,
    ) -> Result<(), DispatchError> {
        let sockets = self.sockets(selector)?;
        for socket in sockets {
            op(socket).map_err(|source| DispatchError::Backend {
                socket: socket.id,
                source,
            })?;
            info!("{query} applied to socket {}", socket.id);
        }
        Ok(())
    }

    pub fn power(&self, selector: SocketSelector, out: &mut Output) -> Result<(), DispatchError> {
        self.read(QueryClass::Power, selector, out)
    }

    pub fn thermals(&self, selector: SocketSelector, out: &mut Output) -> Result<(), DispatchError> {
        self.read(QueryClass::Thermal, selector, out)
    }

    pub fn clocks(&self, selector: SocketSelector, out: &mut Output) -> Result<(), DispatchError> {
        self.read(QueryClass::Clocks, selector, out)
    }

    pub fn frequency(&self, selector: SocketSelector, out: &mut Output) -> Result<(), DispatchError> {
        self.read(QueryClass::Frequency, selector, out)
    }

    pub fn hyperthreading(&self, selector: SocketSelector, out: &mut Output) -> Result<(), DispatchError> {
        self.read(QueryClass::Hyperthreading, selector, out)
    }

    /// Limits the frequency of the selected sockets. Stops at the first failure.
    pub fn cap_frequency(&self, selector: SocketSelector, mhz: u32) -> Result<(), DispatchError> {
        self.mutate(QueryClass::CapFrequency, selector, |s| self.backend.cap_frequency(s, mhz))
    }

    pub fn enable_turbo(&self, selector: SocketSelector) -> Result<(), DispatchError> {
        self.mutate(QueryClass::EnableTurbo, selector, |s| self.backend.enable_turbo(s))
    }
}
