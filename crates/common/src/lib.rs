use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Lifetime requested for every NAT-PMP mapping.
pub const LEASE_TTL_SECONDS: u64 = 60;

/// Lowest listening port accepted from the client's WebUI.
pub const MIN_CLIENT_PORT: u16 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The externally forwarded port as reported by one round of mapping requests.
///
/// A lease only exists if at least one protocol returned a port. When UDP and
/// TCP disagree the UDP port is taken. This mirrors what a correctly behaving
/// gateway should never produce and is a compatibility heuristic, not
/// something NAT-PMP guarantees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalPortLease {
    pub port: u16,
    pub udp_port: Option<u16>,
    pub tcp_port: Option<u16>,
    pub public_ip: Option<Ipv4Addr>,
    pub observed_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl ExternalPortLease {
    /// Build a lease from the per-protocol results, or `None` if neither
    /// protocol produced a port.
    pub fn from_mappings(
        udp_port: Option<u16>,
        tcp_port: Option<u16>,
        ttl_seconds: u64,
    ) -> Option<Self> {
        let port = udp_port.or(tcp_port)?;
        Some(Self {
            port,
            udp_port,
            tcp_port,
            public_ip: None,
            observed_at: Utc::now(),
            ttl_seconds,
        })
    }

    /// Both protocols answered with different ports.
    pub fn is_divergent(&self) -> bool {
        matches!((self.udp_port, self.tcp_port), (Some(udp), Some(tcp)) if udp != tcp)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.observed_at + chrono::Duration::seconds(self.ttl_seconds as i64)
    }
}

/// What the client reported about its listening port in one read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPortState {
    pub configured_port: Option<u16>,
    pub runtime_port: Option<u16>,
    /// `None` when the preferences did not carry the flag.
    pub random_port: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ClientUnreachable,
    LeaseUnavailable,
    ClientPortUnknown,
    WriteFailed,
    VerificationTimeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureReason::ClientUnreachable => "client unreachable",
            FailureReason::LeaseUnavailable => "lease unavailable",
            FailureReason::ClientPortUnknown => "client port unknown",
            FailureReason::WriteFailed => "write failed",
            FailureReason::VerificationTimeout => "verification timeout",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum CycleStatus {
    Success,
    PartialFailure(FailureReason),
}

impl CycleStatus {
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            CycleStatus::Success => None,
            CycleStatus::PartialFailure(reason) => Some(*reason),
        }
    }
}

/// Result of one reconciliation cycle. Logged, never retained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationOutcome {
    pub previous_port: Option<u16>,
    pub target_port: Option<u16>,
    pub applied: bool,
    pub verified: bool,
    pub attempts: u32,
    pub status: CycleStatus,
}

impl ReconciliationOutcome {
    pub fn failed(reason: FailureReason) -> Self {
        Self {
            previous_port: None,
            target_port: None,
            applied: false,
            verified: false,
            attempts: 0,
            status: CycleStatus::PartialFailure(reason),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CycleStatus::Success
    }
}
