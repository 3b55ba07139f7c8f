use std::sync::Mutex;

use power_dispatch::{
    status_of, ArchitectureDispatch, Backend, BackendError, EnergyMeasurements, EnergyProbe, Output, QueryClass,
    Reading, Socket, SocketSelector, Topology,
};
use serde_json::Map;

/// Records every call made by the dispatch layer.
#[derive(Default)]
struct RecordingBackend {
    calls: Mutex<Vec<(QueryClass, u32)>>,
    fail_on: Option<(u32, i32)>,
}

impl RecordingBackend {
    fn record(&self, query: QueryClass, socket: &Socket) -> Result<(), BackendError> {
        self.calls.lock().unwrap().push((query, socket.id));
        match self.fail_on {
            Some((id, code)) if id == socket.id => Err(BackendError::Rejected {
                code,
                reason: String::from("test"),
            }),
            _ => Ok(()),
        }
    }

    fn reading(&self, query: QueryClass, socket: &Socket) -> Result<Reading, BackendError> {
        self.record(query, socket)?;
        Ok(Reading::new().with("value", socket.id * 10))
    }
}

struct StaticProbe(EnergyMeasurements);

impl EnergyProbe for StaticProbe {
    fn poll(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn measurements(&self) -> &EnergyMeasurements {
        &self.0
    }

    fn reset(&mut self) {}
}

/// Forwards to a shared recorder, so that the test keeps access to the calls.
struct Shared(std::sync::Arc<RecordingBackend>);

impl Backend for Shared {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn power(&self, socket: &Socket) -> Result<Reading, BackendError> {
        self.0.reading(QueryClass::Power, socket)
    }

    fn thermals(&self, socket: &Socket) -> Result<Reading, BackendError> {
        self.0.reading(QueryClass::Thermal, socket)
    }

    fn clocks(&self, socket: &Socket) -> Result<Reading, BackendError> {
        self.0.reading(QueryClass::Clocks, socket)
    }

    fn frequency(&self, socket: &Socket) -> Result<Reading, BackendError> {
        self.0.reading(QueryClass::Frequency, socket)
    }

    fn hyperthreading(&self, socket: &Socket) -> Result<Reading, BackendError> {
        self.0.reading(QueryClass::Hyperthreading, socket)
    }

    fn cap_frequency(&self, socket: &Socket, _mhz: u32) -> Result<(), BackendError> {
        self.0.record(QueryClass::CapFrequency, socket)
    }

    fn enable_turbo(&self, socket: &Socket) -> Result<(), BackendError> {
        self.0.record(QueryClass::EnableTurbo, socket)
    }

    fn energy_probe(&self, topology: &Topology) -> Result<Box<dyn EnergyProbe>, BackendError> {
        Ok(Box::new(StaticProbe(EnergyMeasurements::new(topology.socket_count()))))
    }
}

fn setup(sockets: u32, fail_on: Option<(u32, i32)>) -> (ArchitectureDispatch, std::sync::Arc<RecordingBackend>) {
    let topology = Topology::from_packages((0..sockets).map(|p| (p, vec![p * 4, p * 4 + 1])));
    let recorder = std::sync::Arc::new(RecordingBackend {
        fail_on,
        ..Default::default()
    });
    let dispatch = ArchitectureDispatch::new(topology, Box::new(Shared(recorder.clone())));
    (dispatch, recorder)
}

/// Runs one query class, with a console sink for the read queries.
fn run(dispatch: &ArchitectureDispatch, query: QueryClass, selector: SocketSelector) -> i32 {
    let mut sink = Vec::new();
    let mut out = Output::console(&mut sink, false);
    let result = match query {
        QueryClass::Power => dispatch.power(selector, &mut out),
        QueryClass::Thermal => dispatch.thermals(selector, &mut out),
        QueryClass::Clocks => dispatch.clocks(selector, &mut out),
        QueryClass::Frequency => dispatch.frequency(selector, &mut out),
        QueryClass::Hyperthreading => dispatch.hyperthreading(selector, &mut out),
        QueryClass::CapFrequency => dispatch.cap_frequency(selector, 2000),
        QueryClass::EnableTurbo => dispatch.enable_turbo(selector),
    };
    status_of(&result)
}

#[test]
fn invalid_socket_ids_never_reach_the_backend() {
    let (dispatch, recorder) = setup(2, None);
    for query in QueryClass::ALL {
        assert_eq!(run(&dispatch, query, SocketSelector::One(-1)), -22, "{query} with -1");
        assert_eq!(run(&dispatch, query, SocketSelector::One(2)), -22, "{query} with socket_count");
    }
    assert!(recorder.calls.lock().unwrap().is_empty());
}

#[test]
fn all_sockets_are_visited_once_in_order() {
    let (dispatch, recorder) = setup(3, None);
    for query in QueryClass::ALL {
        assert_eq!(run(&dispatch, query, SocketSelector::All), 0);
        let calls: Vec<(QueryClass, u32)> = recorder.calls.lock().unwrap().drain(..).collect();
        assert_eq!(calls, vec![(query, 0), (query, 1), (query, 2)]);
    }
}

#[test]
fn single_socket_is_dispatched_alone() {
    let (dispatch, recorder) = setup(2, None);
    assert_eq!(run(&dispatch, QueryClass::Thermal, SocketSelector::One(1)), 0);
    assert_eq!(*recorder.calls.lock().unwrap(), vec![(QueryClass::Thermal, 1)]);
}

#[test]
fn backend_status_is_forwarded_unmodified() {
    let (dispatch, recorder) = setup(3, Some((1, 42)));
    assert_eq!(run(&dispatch, QueryClass::CapFrequency, SocketSelector::All), 42);
    // no retry, no further socket
    assert_eq!(
        *recorder.calls.lock().unwrap(),
        vec![(QueryClass::CapFrequency, 0), (QueryClass::CapFrequency, 1)]
    );
}

#[test]
fn console_and_json_carry_the_same_values() {
    let (dispatch, _) = setup(2, None);
    let mut text = Vec::new();
    dispatch
        .power(SocketSelector::All, &mut Output::console(&mut text, true))
        .unwrap();
    let mut record = Map::new();
    dispatch.power(SocketSelector::All, &mut Output::json(&mut record)).unwrap();

    let text = String::from_utf8(text).unwrap();
    assert_eq!(text, "_POWER Socket: 0, value: 0\n_POWER Socket: 1, value: 10\n");
    assert_eq!(record["power"]["Socket_0"]["value"], 0);
    assert_eq!(record["power"]["Socket_1"]["value"], 10);
}

#[test]
fn energy_probe_covers_every_socket() {
    let (dispatch, _) = setup(2, None);
    let probe = dispatch.energy_probe().unwrap();
    assert_eq!(probe.measurements().per_socket.len(), 2);
}
