use clap::Parser;
use portsyncd::config::ConfigArgs;
use portsyncd::logging::setup_logging;
use portsyncd::shutdown::shutdown_signal;
use std::process::ExitCode;
use tracing::{error, info};

/// Keep the BitTorrent client's listening port in sync with the VPN's
/// forwarded port, renewing the NAT-PMP lease on every cycle.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
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
    info!(
        webui = %config.webui.base_url,
        interface = %config.lease.interface,
        "portsyncd starting"
    );

    let reconciler = match portsyncd::build_reconciler(&config) {
        Ok(reconciler) => reconciler,
        Err(e) => {
            error!(error = %e, "failed to set up WebUI client");
            return ExitCode::FAILURE;
        }
    };

    reconciler.run(&config.schedule, shutdown_signal()).await;
    ExitCode::SUCCESS
}
