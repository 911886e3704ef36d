//! In-memory collaborators for unit tests.

use crate::api::ClientApi;
use crate::error::{ApiError, CommandError, LeaseError};
use crate::lease::LeaseSource;
use crate::restart::CommandExecutor;
use async_trait::async_trait;
use common::{ExternalPortLease, Protocol, LEASE_TTL_SECONDS};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::subscriber::DefaultGuard;

#[derive(Debug, Default)]
pub struct MockApiState {
    pub reachable: bool,
    pub configured_port: Option<u16>,
    pub runtime_port: Option<u16>,
    pub random_port: Option<bool>,
    pub fail_writes: bool,
    /// Accept writes without ever applying them.
    pub ignore_writes: bool,
    pending_port: Option<u16>,
    /// Preference reads that still return the old port after a write.
    pub stale_reads: u32,
    pub writes: Vec<u16>,
    pub probes: u32,
    pub logins: u32,
    pub preference_reads: u32,
    pub runtime_reads: u32,
}

pub struct MockApi {
    state: Mutex<MockApiState>,
}

impl MockApi {
    pub fn new(configured_port: Option<u16>) -> Self {
        Self {
            state: Mutex::new(MockApiState {
                reachable: true,
                configured_port,
                random_port: Some(false),
                ..Default::default()
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockApiState> {
        self.state.lock().unwrap()
    }

    /// Pretend a write of `port` already happened, visible after `stale` reads.
    pub fn set_port_now_with_stale_reads(&self, port: u16, stale: u32) {
        let mut state = self.state();
        state.pending_port = Some(port);
        state.stale_reads = stale;
    }

    fn unavailable(endpoint: &'static str) -> ApiError {
        ApiError::Status {
            endpoint,
            status: StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[async_trait]
impl ClientApi for MockApi {
    async fn version(&self) -> Result<String, ApiError> {
        let mut state = self.state();
        state.probes += 1;
        if state.reachable {
            Ok("v4.6.2".to_string())
        } else {
            Err(Self::unavailable("version"))
        }
    }

    async fn authenticate(&self) -> Result<(), ApiError> {
        self.state().logins += 1;
        Ok(())
    }

    async fn preferences(&self) -> Result<Value, ApiError> {
        let mut state = self.state();
        state.preference_reads += 1;
        if !state.reachable {
            return Err(Self::unavailable("preferences"));
        }
        if let Some(port) = state.pending_port {
            if state.stale_reads == 0 {
                state.configured_port = Some(port);
                state.random_port = Some(false);
                state.pending_port = None;
            } else {
                state.stale_reads -= 1;
            }
        }
        Ok(json!({
            "listen_port": state.configured_port,
            "use_random_port": state.random_port,
        }))
    }

    async fn runtime_status(&self) -> Result<Value, ApiError> {
        let mut state = self.state();
        state.runtime_reads += 1;
        if !state.reachable {
            return Err(Self::unavailable("maindata"));
        }
        Ok(json!({ "server_state": { "listen_port": state.runtime_port } }))
    }

    async fn set_port(&self, port: u16) -> Result<(), ApiError> {
        let mut state = self.state();
        state.writes.push(port);
        if state.fail_writes || !state.reachable {
            return Err(Self::unavailable("setPreferences"));
        }
        if !state.ignore_writes {
            state.pending_port = Some(port);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockLeaseState {
    pub port: Option<u16>,
    pub calls: u32,
}

pub struct MockLease {
    state: Mutex<MockLeaseState>,
}

impl MockLease {
    pub fn new(port: Option<u16>) -> Self {
        Self {
            state: Mutex::new(MockLeaseState { port, calls: 0 }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockLeaseState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl LeaseSource for MockLease {
    async fn renew_lease(&self) -> Result<ExternalPortLease, LeaseError> {
        let mut state = self.state();
        state.calls += 1;
        state
            .port
            .and_then(|port| {
                ExternalPortLease::from_mappings(Some(port), Some(port), LEASE_TTL_SECONDS)
            })
            .ok_or_else(|| LeaseError::MappingFailed {
                protocol: Protocol::Udp,
                message: "tunnel down".to_string(),
            })
    }
}

#[derive(Debug, Default)]
pub struct MockExecutor {
    pub fail: bool,
    pub commands: Mutex<Vec<String>>,
}

impl MockExecutor {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn runs(&self) -> usize {
        self.commands.lock().unwrap().len()
    }
}

#[async_trait]
impl CommandExecutor for MockExecutor {
    async fn run(&self, command: &str) -> Result<(), CommandError> {
        self.commands.lock().unwrap().push(command.to_string());
        if self.fail {
            Err(CommandError::Failed {
                code: Some(1),
                stderr: "unit qbittorrent.service not found".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// Formatted log output collected for the current thread.
///
/// Only events on the installing thread are captured, so tests using it run
/// on the current-thread runtime.
pub struct CapturedLogs {
    buffer: Arc<Mutex<Vec<u8>>>,
    _guard: DefaultGuard,
}

impl CapturedLogs {
    pub fn install() -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || LogSink(Arc::clone(&sink)))
            .finish();
        Self {
            buffer,
            _guard: tracing::subscriber::set_default(subscriber),
        }
    }

    pub fn warnings(&self) -> Vec<String> {
        let bytes = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter(|line| line.contains(" WARN "))
            .map(str::to_string)
            .collect()
    }

    pub fn has_warning(&self, message: &str) -> bool {
        self.warnings().iter().any(|line| line.contains(message))
    }
}

struct LogSink(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
