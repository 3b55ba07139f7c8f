use std::{io::Write, process::ExitCode};

use anyhow::Context;
use clap::Parser;
use log::debug;
use power_dispatch::{
    powercap::{self, PowerZone},
    select_backend, status_of, ArchitectureDispatch, DispatchError, Output, Platform, SocketSelector, Topology,
};
use serde_json::{json, Map, Value};

use cli::{Cli, Commands};

mod cli;

fn main() -> ExitCode {
    // initialize logger
    let env = env_logger::Env::default().default_filter_or("warn");
    env_logger::init_from_env(env);

    // parse CLI arguments
    let cli = Cli::parse();

    match run(cli) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(status) => exit_code(status),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

/// Maps a non-zero dispatch status to a process exit code (never 0).
fn exit_code(status: i32) -> ExitCode {
    match (status.unsigned_abs() % 256) as u8 {
        0 => ExitCode::from(1),
        code => ExitCode::from(code),
    }
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let platform = Platform::detect()?;
    let topology = Topology::discover().context("cannot discover the sockets")?;
    let backend = select_backend(cli.backend, platform)?;
    let dispatch = ArchitectureDispatch::new(topology, backend);
    let selector = SocketSelector::from(cli.socket);
    debug!("{selector:?} on {platform} with the {} backend", dispatch.backend().name());

    let mut stdout = std::io::stdout().lock();
    let mut record = Map::new();
    let result = {
        let mut out = if cli.json {
            Output::json(&mut record)
        } else {
            Output::console(&mut stdout, cli.verbose)
        };
        debug!("output mode: {:?}", out.mode());
        match cli.command {
            Commands::Info => {
                print_info(&dispatch, platform, &mut out)?;
                Ok(())
            }
            Commands::Power => dispatch.power(selector, &mut out),
            Commands::Thermals => dispatch.thermals(selector, &mut out),
            Commands::Clocks => dispatch.clocks(selector, &mut out),
            Commands::Frequency => dispatch.frequency(selector, &mut out),
            Commands::Hyperthreading => dispatch.hyperthreading(selector, &mut out),
            Commands::CapFrequency { mhz } => dispatch.cap_frequency(selector, mhz),
            Commands::EnableTurbo => dispatch.enable_turbo(selector),
        }
    };

    if cli.json && !record.is_empty() {
        let json = serde_json::to_string_pretty(&Value::Object(record))?;
        writeln!(stdout, "{json}")?;
    }
    report(&result);
    Ok(status_of(&result))
}

fn report(result: &Result<(), DispatchError>) {
    if let Err(e) = result {
        eprintln!("Error: {e} (status {})", e.status());
    }
}

/// Lists the platform, the backend, the sockets and the powercap zones,
/// as text or into the JSON record.
fn print_info(dispatch: &ArchitectureDispatch, platform: Platform, out: &mut Output) -> anyhow::Result<()> {
    let topology = dispatch.topology();
    let zones = powercap::all_power_zones()?;
    match out {
        Output::Json(record) => {
            record.insert("platform".into(), Value::from(platform.to_string()));
            record.insert("backend".into(), Value::from(dispatch.backend().name()));
            let mut sockets = Map::new();
            for socket in topology.sockets() {
                let socket_zones: Vec<Value> = zones.of_package(socket.package_id).into_iter().map(zone_json).collect();
                sockets.insert(
                    format!("Socket_{}", socket.id),
                    json!({
                        "package_id": socket.package_id,
                        "cpus": socket.cpus,
                        "zones": socket_zones,
                    }),
                );
            }
            record.insert("sockets".into(), Value::Object(sockets));
            let node_zones: Vec<Value> = zones.iter().filter(|z| z.package_id.is_none()).map(zone_json).collect();
            record.insert("node_zones".into(), Value::from(node_zones));
        }
        Output::Console { writer, .. } => {
            writeln!(writer, "Platform: {platform}")?;
            writeln!(writer, "Backend: {}", dispatch.backend().name())?;
            writeln!(writer, "Sockets: {}", topology.socket_count())?;
            for socket in topology.sockets() {
                let cpus: Vec<String> = socket.cpus.iter().map(|c| c.to_string()).collect();
                writeln!(writer, "- socket {} (package {}): cpus {}", socket.id, socket.package_id, cpus.join(","))?;
            }
            if zones.is_empty() {
                writeln!(writer, "No powercap zone found.")?;
            } else {
                writeln!(writer, "Powercap zones:")?;
                for zone in zones.iter() {
                    writeln!(writer, "- {} ({:?}): {}", zone.name, zone.domain, zone.path.display())?;
                }
            }
        }
    }
    Ok(())
}

fn zone_json(zone: &PowerZone) -> Value {
    json!({
        "name": zone.name,
        "domain": zone.domain.short_name(),
        "path": zone.path.display().to_string(),
        "power_limit_watts": zone.power_limit_watts(),
    })
}
