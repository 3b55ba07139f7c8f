use std::time::Duration;

use clap::Parser;
use power_dispatch::BackendKind;

pub const DEFAULT_KEY: &str = "0x706f776d";

pub const USAGE: &str = "
NAME
  powmon - Package and DRAM power monitor
SYNOPSIS
  {prog} [--help | -h] [-c] -a \"<executable> <args> ...\"
OVERVIEW
  Powmon is a utility for sampling and printing the
  power consumption (for package and DRAM) and power
  limit per socket in a node.
OPTIONS
  --help | -h
      Display this help information, then exit.
  -a
      Application and arguments in quotes.
  -c
      Remove stale shared memory.
";

pub fn usage(prog: &str) -> String {
    USAGE.replace("{prog}", prog)
}

#[derive(Parser, Debug)]
#[command(name = "powmon", disable_help_flag = true, disable_version_flag = true)]
pub struct Cli {
    /// Display the help information, then exit.
    #[arg(short = 'h', long = "help")]
    pub help: bool,

    /// Remove stale shared memory, then exit.
    #[arg(short = 'c')]
    pub clean: bool,

    /// Application and arguments in quotes.
    #[arg(short = 'a', allow_hyphen_values = true)]
    pub app: Option<String>,

    /// Key of the shared memory segment used for the leader election.
    #[arg(long, env = "POWMON_KEY", default_value = DEFAULT_KEY, value_parser = parse_key, hide = true)]
    pub key: i32,

    /// Sampling interval, in milliseconds.
    #[arg(long = "interval-ms", env = "POWMON_INTERVAL_MS", default_value_t = 100, hide = true)]
    pub interval_ms: u64,

    /// How to access the hardware.
    #[arg(long, env = "POWMON_BACKEND", value_enum, default_value_t = BackendKind::Auto, hide = true)]
    pub backend: BackendKind,
}

impl Cli {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal key.
fn parse_key(s: &str) -> Result<i32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).map(|k| k as i32),
        None => s.parse::<i32>(),
    };
    parsed.map_err(|e| format!("invalid key '{s}': {e}"))
}

/// True if the first argument asks for the usage, whatever follows it.
pub fn asks_for_help(args: &[String]) -> bool {
    args.get(1)
        .is_some_and(|a| a.starts_with("--help") || a.starts_with("-h"))
}

/// The arguments up to the first `-c`. The options after it are not looked at,
/// so that `-c` works even when they are invalid.
pub fn up_to_clean(args: &[String]) -> Option<&[String]> {
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" => return Some(&args[..=i]),
            "-a" | "--key" | "--interval-ms" | "--backend" => i += 2,
            _ => i += 1,
        }
    }
    None
}

/// The first line of a clap error, without its `error: ` prefix.
pub fn error_summary(e: &clap::Error) -> String {
    let rendered = e.to_string();
    let first = rendered.lines().next().unwrap_or_default();
    first.trim_start_matches("error: ").to_owned()
}
