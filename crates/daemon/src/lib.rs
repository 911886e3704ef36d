//! Keeps a BitTorrent client's listening port in sync with the port a VPN
//! forwards through NAT-PMP.

pub mod api;
pub mod config;
pub mod error;
pub mod lease;
pub mod logging;
pub mod reconciler;
pub mod restart;
pub mod shutdown;
pub mod verify;

#[cfg(test)]
mod mocks;

use api::WebUiClient;
use config::Config;
use error::ApiError;
use lease::LeaseClient;
use reconciler::Reconciler;
use restart::RestartHook;
use verify::PortVerifier;

/// The reconciler wired to real collaborators.
pub type DefaultReconciler = Reconciler<LeaseClient, WebUiClient>;

pub fn build_reconciler(config: &Config) -> Result<DefaultReconciler, ApiError> {
    Ok(Reconciler::new(
        LeaseClient::from_config(&config.lease),
        WebUiClient::new(&config.webui)?,
        RestartHook::from_command(config.restart_command.clone()),
        PortVerifier::from_config(&config.verify),
    ))
}
