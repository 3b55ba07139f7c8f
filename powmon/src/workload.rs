use std::{
    process::{Command, ExitStatus, Stdio},
    time::SystemTime,
};

use anyhow::{anyhow, Context};
use log::{info, warn};

/// Splits the `-a` string on spaces. Quoting is not supported.
pub fn split_command(app: &str) -> Vec<String> {
    app.split(' ').filter(|s| !s.is_empty()).map(String::from).collect()
}

#[derive(Debug)]
pub struct WorkloadOutcome {
    pub pid: u32,
    pub status: ExitStatus,
}

/// Runs `argv` as a child process that inherits the standard streams, and waits for its termination.
///
/// The wait is restarted if a signal interrupts it, hence this function only returns
/// once the child is gone.
pub fn run(argv: &[String], announce: bool) -> anyhow::Result<WorkloadOutcome> {
    let (program, args) = argv.split_first().ok_or_else(|| anyhow!("empty command"))?;
    if announce {
        println!("Profiling: {}", argv.join(" "));
    }
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("failed to launch {program}"))?;

    let pid = child.id();
    info!("workload {program} started with pid {pid}");
    let status = child.wait().with_context(|| format!("failed to wait for {program} ({pid})"))?;
    if status.success() {
        info!("workload {pid} exited with {status}");
    } else {
        warn!("workload {pid} exited with {status}");
    }
    Ok(WorkloadOutcome { pid, status })
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
