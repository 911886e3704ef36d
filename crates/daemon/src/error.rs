//! Error types for every collaborator of a reconciliation cycle.
//!
//! None of these escape a cycle: the reconciler turns each of them into a
//! [`common::FailureReason`] and keeps going.

use common::Protocol;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Errors from renewing the NAT-PMP lease.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// No gateway was configured and none could be derived from the tunnel.
    #[error("no gateway configured and none could be derived from interface {interface}")]
    NoGateway { interface: String },

    /// The gateway or mapping tool did not return a usable mapping.
    #[error("{protocol} mapping failed: {message}")]
    MappingFailed { protocol: Protocol, message: String },

    /// The mapping tool binary is not installed.
    #[error("mapping tool {0} not found")]
    ToolMissing(String),

    #[error("{protocol} mapping timed out after {timeout:?}")]
    Timeout { protocol: Protocol, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the client's WebUI API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Login was rejected or produced no session.
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("request to {endpoint} timed out")]
    Timeout { endpoint: &'static str },

    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{endpoint} returned {status}")]
    Status { endpoint: &'static str, status: StatusCode },

    #[error("{endpoint} returned malformed JSON: {source}")]
    Decode {
        endpoint: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// The HTTP client itself could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl ApiError {
    pub(crate) fn from_reqwest(endpoint: &'static str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            ApiError::Timeout { endpoint }
        } else {
            ApiError::Request { endpoint, source }
        }
    }
}

/// Errors from running an external shell command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("command exited with {}: {stderr}", exit_label(.code))]
    Failed { code: Option<i32>, stderr: String },

    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "signal".to_string(),
    }
}

/// The restart hook failed. Advisory only.
#[derive(Debug, Error)]
#[error("restart command `{command}` failed: {source}")]
pub struct RestartError {
    pub command: String,
    #[source]
    pub source: CommandError,
}

/// The client never reported the expected port within the retry budget.
#[derive(Debug, Error)]
#[error("port {expected} not observed after {attempts} attempts (last seen {last_observed:?})")]
pub struct VerifyError {
    pub expected: u16,
    pub last_observed: Option<u16>,
    pub attempts: u32,
}

/// Errors found while validating the startup configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("a username is configured but no password")]
    MissingPassword,

    #[error("invalid config value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
}
