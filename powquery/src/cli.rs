use clap::{Parser, Subcommand};
use power_dispatch::BackendKind;

/// Queries the power, thermal and clock state of the sockets of this node.
#[derive(Parser)]
#[command(author, version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Print a JSON record instead of a table.
    #[arg(long, global = true)]
    pub json: bool,

    /// Print one `name: value` line per socket.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only query this socket (all the sockets by default).
    #[arg(short, long, global = true, allow_negative_numbers = true)]
    pub socket: Option<i32>,

    /// How to access the hardware.
    #[arg(long, global = true, env = "POWQUERY_BACKEND", value_enum, default_value_t = BackendKind::Auto)]
    pub backend: BackendKind,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Show the sockets and the selected backend, then exit.
    Info,
    /// Power consumption and power limits.
    Power,
    /// Package temperature.
    Thermals,
    /// Current clock of each cpu.
    Clocks,
    /// Frequency range and limits.
    Frequency,
    /// Simultaneous multithreading state.
    Hyperthreading,
    /// Limit the frequency of the cpus.
    CapFrequency {
        /// Maximum frequency, in MHz.
        mhz: u32,
    },
    /// Allow the frequency to go above the base frequency.
    EnableTurbo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_socket_is_accepted() {
        let cli = Cli::try_parse_from(["powquery", "thermals", "--socket", "-1"]).unwrap();
        assert_eq!(cli.command, Commands::Thermals);
        assert_eq!(cli.socket, Some(-1));
    }

    #[test]
    fn test_cap_frequency() {
        let cli = Cli::try_parse_from(["powquery", "--json", "cap-frequency", "1800"]).unwrap();
        assert_eq!(cli.command, Commands::CapFrequency { mhz: 1800 });
        assert!(cli.json);
        assert_eq!(cli.socket, None);
    }
}
