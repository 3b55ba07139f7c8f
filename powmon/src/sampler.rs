use std::{
    io::Write,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
    thread,
    time::{Duration, Instant, SystemTime},
};

use anyhow::{anyhow, Context};
use power_dispatch::{EnergyMeasurements, EnergyProbe, RaplDomainType};

/// The domains that make up the node power.
const NODE_DOMAINS: [RaplDomainType; 2] = [RaplDomainType::Package, RaplDomainType::Dram];

/// Running totals of the session.
#[derive(Debug, Clone, Default)]
pub struct SampleAccumulator {
    pub samples: u64,
    pub total_joules: f64,
    pub min_watts: Option<f64>,
    pub max_watts: Option<f64>,
    last_sample: Option<Instant>,
}

impl SampleAccumulator {
    fn record(&mut self, joules: f64, at: Instant) {
        self.samples += 1;
        self.total_joules += joules;
        if let Some(previous) = self.last_sample {
            let elapsed = at.duration_since(previous).as_secs_f64();
            if elapsed > 0.0 {
                let watts = joules / elapsed;
                self.min_watts = Some(self.min_watts.map_or(watts, |w| w.min(watts)));
                self.max_watts = Some(self.max_watts.map_or(watts, |w| w.max(watts)));
            }
        }
        self.last_sample = Some(at);
    }
}

struct SamplingState {
    probe: Box<dyn EnergyProbe>,
    log: Box<dyn Write + Send>,
    accumulator: SampleAccumulator,
}

/// State shared by the supervisory thread and the sampling thread.
pub struct SessionContext {
    armed: AtomicBool,
    state: Mutex<SamplingState>,
}

impl SessionContext {
    pub fn new(probe: Box<dyn EnergyProbe>, log: Box<dyn Write + Send>) -> SessionContext {
        SessionContext {
            armed: AtomicBool::new(false),
            state: Mutex::new(SamplingState {
                probe,
                log,
                accumulator: SampleAccumulator::default(),
            }),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, SamplingState>> {
        self.state.lock().map_err(|_| anyhow!("sampling state poisoned by a panic"))
    }

    /// Captures one reading: polls the probe, logs it, updates the totals.
    pub fn take_sample(&self) -> anyhow::Result<()> {
        let mut state = self.lock()?;
        let SamplingState {
            probe,
            log,
            accumulator,
        } = &mut *state;

        probe.poll().context("refreshing measurements")?;
        let at = Instant::now();
        let measurements = probe.measurements();
        print_measurements(log.as_mut(), measurements, SystemTime::now())?;
        accumulator.record(measurements.total_joules(&NODE_DOMAINS), at);
        Ok(())
    }

    pub fn accumulator(&self) -> anyhow::Result<SampleAccumulator> {
        Ok(self.lock()?.accumulator.clone())
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.lock()?.log.flush().context("flushing the raw log")
    }
}

/// Body of the sampling thread: samples every `interval` while armed.
///
/// The lock is only held by [`SessionContext::take_sample`], never during the sleep.
/// Unparking the thread after [`SessionContext::disarm`] stops it immediately.
pub fn run(ctx: &SessionContext, interval: Duration) -> anyhow::Result<()> {
    while ctx.is_armed() {
        ctx.take_sample()?;
        let deadline = Instant::now() + interval;
        while ctx.is_armed() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
    }
    Ok(())
}

pub(crate) const LOG_COLUMNS: &str = "timestamp_ms;socket;domain;overflow;joules";

fn print_measurements(writer: &mut dyn Write, m: &EnergyMeasurements, timestamp: SystemTime) -> anyhow::Result<()> {
    let timestamp_ms = timestamp.duration_since(SystemTime::UNIX_EPOCH)?.as_millis();

    for (socket_id, domains_of_socket) in m.per_socket.iter().enumerate() {
        for (domain, counter) in domains_of_socket {
            if let Some(consumed) = counter.joules {
                let overflow = counter.overflowed;
                writeln!(writer, "{timestamp_ms};{socket_id};{domain:?};{overflow};{consumed}")?;
            }
        }
    }
    Ok(())
}
