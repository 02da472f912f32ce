//! aoremoteclient: worker and coordinator entry point.
//!
//! # Usage
//!
//! ```text
//! aoremoteclient connect head01 --port 1892 --hostname node07
//! aoremoteclient collect observation.ref --config cluster.yaml
//! aoremoteclient version
//! ```
//!
//! `connect` is what the coordinator runs on every node through ssh.

use std::path::Path;
use std::process;

use rfi_cluster_core::cli::{parse_args, Command};
use rfi_cluster_core::config::{local_hostname, ClusterSettings};
use rfi_cluster_core::error::ClusterError;
use rfi_cluster_core::observation::ClusteredObservation;
use rfi_cluster_core::remote::{Client, ProcessCommander};
use rfi_cluster_core::store::json::JsonShardStore;


fn main() {
    let args: Vec<String> = std::env::args().collect();
    let arg_refs: Vec<&str> = args[1..].iter().map(|s| s.as_str()).collect();

    let invocation = match parse_args(&arg_refs) {
        Ok(inv) => inv,
        Err(e) => {
            eprintln!("aoremoteclient: {}", e);
            process::exit(1);
        }
    };

    env_logger::Builder::new()
        .filter_level(invocation.log_level)
        .format_timestamp(None)
        .init();

    let result = match invocation.command {
        Command::Version => {
            println!("aoremoteclient {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Connect { coordinator, port, hostname } => {
            let hostname = hostname.unwrap_or_else(local_hostname);
            run_worker(&coordinator, port, &hostname)
        }
        Command::Collect { observation, config } => run_collect(&observation, config.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("aoremoteclient: {}", e);
        process::exit(1);
    }
}


fn run_worker(coordinator: &str, port: u16, hostname: &str) -> Result<(), String> {
    let mut client = Client::connect(coordinator, port, JsonShardStore::new(), hostname).map_err(|e| e.to_string())?;
    client.run().map_err(|e| e.to_string())?;
    log::info!("served {} request(s)", client.served());
    Ok(())
}


/// Read the quality tables of every shard and print the merged totals.
fn run_collect(observation: &str, config: Option<&str>) -> Result<(), String> {
    let settings = match config {
        Some(path) => ClusterSettings::load(Path::new(path)).map_err(|e| e.to_string())?,
        None => ClusterSettings::default(),
    };
    let observation = ClusteredObservation::load(Path::new(observation)).map_err(|e| e.to_string())?;
    let shard_count = observation.len();
    let hosts = observation.hostnames();

    let mut commander = ProcessCommander::new(observation, settings);
    commander.push_read_quality_tables_task(false);
    commander.run(true).map_err(|e: ClusterError| e.to_string())?;

    let summary = serde_json::json!({
        "shards": shard_count,
        "hosts": hosts,
        "baselines": commander.statistics().map(|s| s.baseline_count()).unwrap_or(0),
        "total": commander.statistics().map(|s| s.total()),
        "errors": commander.errors(),
    });
    let text = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    println!("{}", text);

    if !commander.errors().is_empty() {
        eprintln!("aoremoteclient: {}", commander.error_string());
    }
    Ok(())
}
