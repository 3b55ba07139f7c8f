use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use log::{info, warn};
use power_dispatch::{select_backend, ArchitectureDispatch, BackendKind, Platform, Topology};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{
    election::{self, Election, Role},
    sampler::{self, SessionContext, LOG_COLUMNS},
    workload::{self, WorkloadOutcome},
};

const WRITER_BUFFER_CAPACITY: usize = 8192 * 10;

pub struct SessionConfig {
    pub key: i32,
    pub interval: Duration,
    pub backend: BackendKind,
    /// Where the artifacts are created.
    pub directory: PathBuf,
}

pub struct MonitorSession {
    pub workload_argv: Vec<String>,
    pub hostname: String,
    pub role: Role,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// Paths of the artifacts written by the leader.
#[derive(Debug, Clone)]
pub struct Artifacts {
    pub log: PathBuf,
    pub summary: PathBuf,
}

impl Artifacts {
    pub fn new(directory: &Path, hostname: &str) -> Artifacts {
        Artifacts {
            log: directory.join(format!("{hostname}.powmon.dat")),
            summary: directory.join(format!("{hostname}.powmon.summary")),
        }
    }
}

pub fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from("localhost"))
}

/// Creates a new file, fails if it already exists.
fn create_exclusive(path: &Path, host: &str) -> anyhow::Result<File> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Fatal Error: powmon on {host} cannot open {}", path.display()))
}

/// Runs the workload, as leader or follower depending on the election.
pub fn run(argv: Vec<String>, config: &SessionConfig) -> anyhow::Result<MonitorSession> {
    if argv.is_empty() {
        return Err(anyhow!("the command given to -a is empty"));
    }
    let election = election::acquire(config.key).context("leader election failed")?;
    let mut session = MonitorSession {
        workload_argv: argv,
        hostname: hostname(),
        role: election.role(),
        start_ms: 0,
        end_ms: 0,
    };
    match session.role {
        Role::Leader => run_leader(&mut session, election, config)?,
        Role::Follower => run_follower(&mut session, election)?,
    }
    Ok(session)
}

fn run_follower(session: &mut MonitorSession, election: Election) -> anyhow::Result<()> {
    session.start_ms = workload::now_ms();
    workload::run(&session.workload_argv, false)?;
    session.end_ms = workload::now_ms();
    election.wait_for_leader();
    election.release()?;
    Ok(())
}

/// The leader's session. If it fails, dropping `election` still signals the
/// followers and removes the segment.
fn run_leader(session: &mut MonitorSession, election: Election, config: &SessionConfig) -> anyhow::Result<()> {
    let host = session.hostname.clone();
    let topology = Topology::discover()?;
    let backend = select_backend(config.backend, Platform::detect()?)?;
    let dispatch = ArchitectureDispatch::new(topology, backend);
    info!(
        "{} socket(s), sampling every {:?} with the {} backend",
        dispatch.topology().socket_count(),
        config.interval,
        dispatch.backend().name()
    );

    // open both artifacts before launching anything
    let artifacts = Artifacts::new(&config.directory, &host);
    let log_file = create_exclusive(&artifacts.log, &host)?;
    let summary_file = match create_exclusive(&artifacts.summary, &host) {
        Ok(f) => f,
        Err(e) => {
            // the log has just been created empty
            let _ = fs::remove_file(&artifacts.log);
            return Err(e);
        }
    };

    let measured = measure(session, &election, &dispatch, config, log_file, summary_file);
    if measured.is_err() {
        // nothing (or a partial record) has been written to the summary
        let _ = fs::remove_file(&artifacts.summary);
    }
    measured?;
    election.release()?;

    println!(
        "Output Files\n  {}\n  {}\n",
        artifacts.log.display(),
        artifacts.summary.display()
    );
    Ok(())
}

/// Samples the energy while the workload runs, then writes the summary.
fn measure(
    session: &mut MonitorSession,
    election: &Election,
    dispatch: &ArchitectureDispatch,
    config: &SessionConfig,
    log_file: File,
    summary_file: File,
) -> anyhow::Result<()> {
    let host = &session.hostname;
    let probe = dispatch.energy_probe().context("cannot create the energy probe")?;
    let mut log = BufWriter::with_capacity(WRITER_BUFFER_CAPACITY, log_file);
    let now = OffsetDateTime::now_utc().format(&Rfc3339)?;
    writeln!(log, "# host: {host}")?;
    writeln!(log, "# backend: {}", dispatch.backend().name())?;
    writeln!(log, "# start: {now}")?;
    writeln!(log, "{LOG_COLUMNS}")?;
    let ctx = SessionContext::new(probe, Box::new(log));

    session.start_ms = workload::now_ms();
    let outcome: anyhow::Result<WorkloadOutcome> = thread::scope(|s| {
        ctx.arm();
        let handle = s.spawn(|| sampler::run(&ctx, config.interval));

        let outcome = workload::run(&session.workload_argv, true);

        ctx.disarm();
        handle.thread().unpark();
        match handle.join() {
            Ok(sampled) => sampled.context("sampling failed")?,
            Err(_) => return Err(anyhow!("the sampling thread panicked")),
        }
        outcome
    });
    let outcome = outcome?;

    // final reading, made synchronously after the sampler has stopped
    ctx.take_sample()?;
    session.end_ms = workload::now_ms();
    ctx.flush()?;
    election.signal_completion();
    info!("completion signaled to {} follower(s)", election.observers());

    let acc = ctx.accumulator()?;
    info!(
        "workload {}: {} samples, {:.3} J, min {:.3} W, max {:.3} W",
        outcome.status,
        acc.samples,
        acc.total_joules,
        acc.min_watts.unwrap_or(0.0),
        acc.max_watts.unwrap_or(0.0)
    );
    if acc.samples > 0 && acc.total_joules == 0.0 {
        warn!("no energy has been measured, are the RAPL counters readable?");
    }

    write_summary(summary_file, session, outcome.pid).context("cannot write the summary")
}

fn write_summary(file: File, session: &MonitorSession, pid: u32) -> anyhow::Result<()> {
    let mut w = BufWriter::new(file);
    writeln!(w, "host: {}", session.hostname)?;
    writeln!(w, "pid: {pid}")?;
    writeln!(w, "runtime ms: {}", session.end_ms.saturating_sub(session.start_ms))?;
    writeln!(w, "start: {}", session.start_ms)?;
    writeln!(w, "end: {}", session.end_ms)?;
    w.flush()?;
    Ok(())
}
