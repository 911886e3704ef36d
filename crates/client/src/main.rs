use anyhow::Context;
use clap::{Parser, Subcommand};
use common::ReconciliationOutcome;
use portsyncd::api::{random_port_flag, ClientApi};
use portsyncd::config::{Config, ConfigArgs};
use portsyncd::lease::LeaseSource;
use portsyncd::logging::setup_logging;
use portsyncd::reconciler::{CycleOptions, StatusReport};
use portsyncd::shutdown::shutdown_signal;
use portsyncd::DefaultReconciler;
use serde_json::Value;
use std::process::ExitCode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one reconciliation cycle
    Sync,
    /// Show the forwarded port and the client's port without changing anything
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write the forwarded port to the client even if it already matches
    Force,
    /// Dump configuration, gateway, lease and raw WebUI payloads
    Debug,
    /// Reconcile continuously until interrupted
    Daemon,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match cli.config.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::from(2);
        }
    };

    setup_logging(config.debug, Some(&config.log_file));

    match run(cli.command, &config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: &Config) -> anyhow::Result<ExitCode> {
    let reconciler = portsyncd::build_reconciler(config).context("failed to set up WebUI client")?;

    let code = match command {
        Commands::Sync => exit_for(&reconciler.run_cycle(CycleOptions::one_shot()).await),
        Commands::Force => exit_for(&reconciler.run_cycle(CycleOptions::forced()).await),
        Commands::Status { json } => {
            let report = reconciler.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_status(&report);
            }
            if report.in_sync {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Commands::Debug => {
            debug_dump(&reconciler, config).await?;
            ExitCode::SUCCESS
        }
        Commands::Daemon => {
            reconciler.run(&config.schedule, shutdown_signal()).await;
            ExitCode::SUCCESS
        }
    };
    Ok(code)
}

fn exit_for(outcome: &ReconciliationOutcome) -> ExitCode {
    if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn port_or_dash(port: Option<u16>) -> String {
    port.map_or_else(|| "-".to_string(), |p| p.to_string())
}

fn print_status(report: &StatusReport) {
    match &report.lease {
        Some(lease) => println!(
            "Forwarded port: {} (udp {}, tcp {}, expires {})",
            lease.port,
            port_or_dash(lease.udp_port),
            port_or_dash(lease.tcp_port),
            lease.expires_at().format("%H:%M:%S"),
        ),
        None => println!("Forwarded port: unavailable"),
    }
    match &report.client {
        Some(client) => println!(
            "Client port:    {} (runtime {}, random port {})",
            port_or_dash(client.configured_port),
            port_or_dash(client.runtime_port),
            match client.random_port {
                Some(true) => "on",
                Some(false) => "off",
                None => "unknown",
            },
        ),
        None => println!("Client port:    unavailable"),
    }
    println!("Status:         {}", if report.in_sync { "in sync" } else { "out of sync" });
}

async fn debug_dump(reconciler: &DefaultReconciler, config: &Config) -> anyhow::Result<()> {
    println!("Configuration:\n{config:#?}\n");

    match reconciler.lease_source().resolve_gateway() {
        Ok(gateway) => println!("Gateway: {gateway}"),
        Err(e) => println!("Gateway: {e}"),
    }
    match reconciler.lease_source().renew_lease().await {
        Ok(lease) => println!("Lease:\n{}\n", serde_json::to_string_pretty(&lease)?),
        Err(e) => println!("Lease: {e}\n"),
    }

    let api = reconciler.api();
    println!("WebUI: {}", api.base_url());
    if let Err(e) = api.authenticate().await {
        println!("Login: {e}");
    }
    match api.version().await {
        Ok(version) => println!("Client version: {version}"),
        Err(e) => println!("Client version: {e}"),
    }
    match api.preferences().await {
        Ok(prefs) => {
            println!("Random port mode: {:?}", random_port_flag(&prefs));
            println!("Preferences:\n{}\n", serde_json::to_string_pretty(&prefs)?);
        }
        Err(e) => println!("Preferences: {e}"),
    }
    match api.runtime_status().await {
        Ok(status) => {
            let server_state = status.get("server_state").cloned().unwrap_or(Value::Null);
            println!("Runtime server state:\n{}", serde_json::to_string_pretty(&server_state)?);
        }
        Err(e) => println!("Runtime status: {e}"),
    }
    Ok(())
}
