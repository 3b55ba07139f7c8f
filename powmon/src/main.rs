use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use log::debug;

use cli::Cli;
use session::SessionConfig;

mod cli;
mod election;
mod error;
mod sampler;
mod session;
mod workload;

fn main() -> ExitCode {
    // initialize logger
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    let args: Vec<String> = std::env::args().collect();
    let prog = args.first().cloned().unwrap_or_else(|| String::from("powmon"));

    if args.len() == 1 || cli::asks_for_help(&args) {
        print!("{}", cli::usage(&prog));
        return ExitCode::SUCCESS;
    }

    // parse CLI arguments, a `-c` is handled even if invalid options follow it
    let parsed = Cli::try_parse_from(&args).or_else(|e| match cli::up_to_clean(&args) {
        Some(prefix) => Cli::try_parse_from(prefix).map_err(|_| e),
        None => Err(e),
    });
    let cli = match parsed {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("\nError: {}", cli::error_summary(&e));
            eprint!("{}", cli::usage(&prog));
            return ExitCode::from(1);
        }
    };

    if cli.help {
        print!("{}", cli::usage(&prog));
        return ExitCode::SUCCESS;
    }

    if cli.clean {
        return match election::cleanup(cli.key) {
            Ok(removed) => {
                debug!("stale segment removed: {removed}");
                println!("Exiting powmon...");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::from(1)
            }
        };
    }

    let Some(app) = cli.app.as_deref() else {
        eprintln!("\nError: must specify \"-a\"");
        eprint!("{}", cli::usage(&prog));
        return ExitCode::from(1);
    };

    let config = SessionConfig {
        key: cli.key,
        interval: cli.interval(),
        backend: cli.backend,
        directory: PathBuf::from("."),
    };
    match session::run(workload::split_command(app), &config) {
        Ok(session) => {
            debug!(
                "{:?} session of {:?} ended after {} ms",
                session.role,
                session.workload_argv,
                session.end_ms.saturating_sub(session.start_ms)
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}
