//! Startup configuration.
//!
//! Flags fall back to environment variables so the same binary works from a
//! service unit, a cron line or a shell. [`ConfigArgs`] is parsed once and
//! turned into an immutable [`Config`] that is handed to every constructor.

use crate::error::ConfigError;
use clap::{Args, ValueEnum};
use common::LEASE_TTL_SECONDS;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Bound on every WebUI request.
pub const API_TIMEOUT: Duration = Duration::from_secs(10);
/// Bound on a single NAT-PMP mapping request.
pub const MAPPING_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on the restart hook.
pub const RESTART_TIMEOUT: Duration = Duration::from_secs(60);
/// Bound on the one-off mapping tool install.
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MapperKind {
    /// Shell out to the `natpmpc` tool.
    Natpmpc,
    /// Speak NAT-PMP over UDP directly.
    Native,
}

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Host of the client's WebUI
    #[arg(long, env = "QBT_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port of the client's WebUI
    #[arg(long = "webui-port", env = "QBT_PORT", default_value_t = 8080)]
    pub webui_port: u16,

    /// Scheme of the client's WebUI (http or https)
    #[arg(long, env = "QBT_SCHEME", default_value = "http")]
    pub scheme: String,

    /// WebUI username, leave unset when authentication is bypassed
    #[arg(long, env = "QBT_USERNAME")]
    pub username: Option<String>,

    /// WebUI password
    #[arg(long, env = "QBT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Shell command that restarts the client after a port change
    #[arg(long, env = "QBT_RESTART_COMMAND")]
    pub restart_command: Option<String>,

    /// VPN tunnel interface used to derive the NAT-PMP gateway
    #[arg(long, env = "VPN_INTERFACE", default_value = "wg0")]
    pub interface: String,

    /// NAT-PMP gateway, overrides derivation from the tunnel interface
    #[arg(long, env = "VPN_GATEWAY")]
    pub gateway: Option<Ipv4Addr>,

    /// How mapping requests are issued
    #[arg(long, env = "PORTSYNC_MAPPER", value_enum, default_value_t = MapperKind::Natpmpc)]
    pub mapper: MapperKind,

    /// Path or name of the natpmpc binary
    #[arg(long, env = "PORTSYNC_NATPMPC", default_value = "natpmpc")]
    pub natpmpc: PathBuf,

    /// Command run once to install natpmpc when it is missing
    #[arg(long, env = "PORTSYNC_INSTALL_COMMAND")]
    pub install_command: Option<String>,

    /// Seconds between reconciliation cycles in daemon mode
    #[arg(long, env = "PORTSYNC_INTERVAL", default_value_t = 45)]
    pub interval: u64,

    /// Seconds between WebUI reachability probes in daemon mode
    #[arg(long, env = "PORTSYNC_HEALTH_INTERVAL", default_value_t = 300)]
    pub health_interval: u64,

    /// Verification polls after a port write
    #[arg(long, env = "PORTSYNC_VERIFY_ATTEMPTS", default_value_t = 5)]
    pub verify_attempts: u32,

    /// Seconds between verification polls
    #[arg(long, env = "PORTSYNC_VERIFY_DELAY", default_value_t = 2)]
    pub verify_delay: u64,

    /// Append-only activity log (default: ~/.portsync/activity.log)
    #[arg(long, env = "PORTSYNC_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, env = "PORTSYNC_DEBUG")]
    pub debug: bool,
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct WebUiConfig {
    pub base_url: String,
    pub credentials: Option<Credentials>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub interface: String,
    pub gateway: Option<Ipv4Addr>,
    pub mapper: MapperKind,
    pub natpmpc: PathBuf,
    pub install_command: Option<String>,
    pub lifetime: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct VerifyConfig {
    pub attempts: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub interval: Duration,
    pub health_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub webui: WebUiConfig,
    pub lease: LeaseConfig,
    pub verify: VerifyConfig,
    pub schedule: Schedule,
    pub restart_command: Option<String>,
    pub log_file: PathBuf,
    pub debug: bool,
}

impl ConfigArgs {
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let credentials = match (non_empty(self.username), non_empty(self.password)) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            (Some(_), None) => return Err(ConfigError::MissingPassword),
            (None, _) => None,
        };

        if self.scheme != "http" && self.scheme != "https" {
            return Err(ConfigError::InvalidValue {
                field: "scheme",
                message: format!("expected http or https, got {}", self.scheme),
            });
        }
        if self.interval == 0 || self.interval >= LEASE_TTL_SECONDS {
            return Err(ConfigError::InvalidValue {
                field: "interval",
                message: format!("must be between 1 and {} seconds", LEASE_TTL_SECONDS - 1),
            });
        }
        if self.verify_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "verify_attempts",
                message: "at least one attempt is required".to_string(),
            });
        }

        Ok(Config {
            webui: WebUiConfig {
                base_url: format!("{}://{}:{}", self.scheme, self.host, self.webui_port),
                credentials,
                timeout: API_TIMEOUT,
            },
            lease: LeaseConfig {
                interface: self.interface,
                gateway: self.gateway,
                mapper: self.mapper,
                natpmpc: self.natpmpc,
                install_command: non_empty(self.install_command),
                lifetime: LEASE_TTL_SECONDS as u32,
                timeout: MAPPING_TIMEOUT,
            },
            verify: VerifyConfig {
                attempts: self.verify_attempts,
                delay: Duration::from_secs(self.verify_delay),
            },
            schedule: Schedule {
                interval: Duration::from_secs(self.interval),
                health_interval: Duration::from_secs(self.health_interval),
            },
            restart_command: non_empty(self.restart_command),
            log_file: self.log_file.unwrap_or_else(default_log_path),
            debug: self.debug,
        })
    }
}

/// Get the default activity log path (~/.portsync/activity.log)
pub fn default_log_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".portsync")
        .join("activity.log")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
