//! NAT-PMP lease renewal.
//!
//! Requesting a mapping is also what keeps it alive: the gateway drops the
//! forwarded port once its lifetime elapses without a fresh request.

use crate::config::{LeaseConfig, MapperKind, INSTALL_TIMEOUT};
use crate::error::LeaseError;
use crate::restart::{CommandExecutor, ShellExecutor};
use async_trait::async_trait;
use common::{ExternalPortLease, Protocol};
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const NATPMP_PORT: u16 = 5351;
/// Response opcode is the request opcode plus this.
const RESPONSE_FLAG: u8 = 128;
/// Private port 0 lets the gateway pick the internal side.
const PRIVATE_PORT: u16 = 0;
/// Public port 1 asks for any port, or renewal of the existing one.
const PUBLIC_PORT: u16 = 1;

/// One protocol's answer from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub public_port: u16,
    pub public_ip: Option<Ipv4Addr>,
}

/// Issues a single mapping request for one protocol.
#[async_trait]
pub trait PortMapper: Send + Sync {
    async fn map(
        &self,
        gateway: Ipv4Addr,
        protocol: Protocol,
        lifetime: u32,
    ) -> Result<Mapping, LeaseError>;
}

/// Anything that can hand out the current forwarded port.
#[async_trait]
pub trait LeaseSource: Send + Sync {
    async fn renew_lease(&self) -> Result<ExternalPortLease, LeaseError>;
}

pub struct LeaseClient {
    mapper: Box<dyn PortMapper>,
    interface: String,
    gateway: Option<Ipv4Addr>,
    lifetime: u32,
}

impl LeaseClient {
    pub fn new(
        mapper: Box<dyn PortMapper>,
        interface: impl Into<String>,
        gateway: Option<Ipv4Addr>,
        lifetime: u32,
    ) -> Self {
        Self {
            mapper,
            interface: interface.into(),
            gateway,
            lifetime,
        }
    }

    pub fn from_config(config: &LeaseConfig) -> Self {
        let mapper: Box<dyn PortMapper> = match config.mapper {
            MapperKind::Natpmpc => Box::new(NatpmpcMapper::new(
                config.natpmpc.clone(),
                config.install_command.clone(),
                config.timeout,
            )),
            MapperKind::Native => Box::new(NativeMapper::new(config.timeout)),
        };
        Self::new(mapper, config.interface.clone(), config.gateway, config.lifetime)
    }

    /// The configured gateway, or the `.1` address of the tunnel's network.
    pub fn resolve_gateway(&self) -> Result<Ipv4Addr, LeaseError> {
        if let Some(gateway) = self.gateway {
            return Ok(gateway);
        }

        let no_gateway = || LeaseError::NoGateway {
            interface: self.interface.clone(),
        };
        let interfaces = local_ip_address::list_afinet_netifas().map_err(|e| {
            debug!(error = %e, "failed to list network interfaces");
            no_gateway()
        })?;

        interfaces
            .into_iter()
            .find_map(|(name, addr)| match addr {
                IpAddr::V4(v4) if name == self.interface => Some(gateway_for(v4)),
                _ => None,
            })
            .ok_or_else(no_gateway)
    }
}

#[async_trait]
impl LeaseSource for LeaseClient {
    async fn renew_lease(&self) -> Result<ExternalPortLease, LeaseError> {
        let gateway = self.resolve_gateway()?;
        debug!(%gateway, lifetime = self.lifetime, "renewing NAT-PMP mappings");

        let udp = self.mapper.map(gateway, Protocol::Udp, self.lifetime).await;
        let tcp = self.mapper.map(gateway, Protocol::Tcp, self.lifetime).await;

        let (udp, tcp) = match (udp, tcp) {
            (Err(udp_err), Err(tcp_err)) => {
                debug!(error = %tcp_err, "tcp mapping failed as well");
                return Err(udp_err);
            }
            (udp, tcp) => (log_failed(Protocol::Udp, udp), log_failed(Protocol::Tcp, tcp)),
        };

        let mut lease = ExternalPortLease::from_mappings(
            udp.map(|m| m.public_port),
            tcp.map(|m| m.public_port),
            self.lifetime as u64,
        )
        .ok_or_else(|| LeaseError::MappingFailed {
            protocol: Protocol::Udp,
            message: "no protocol returned a port".to_string(),
        })?;
        lease.public_ip = udp.and_then(|m| m.public_ip).or(tcp.and_then(|m| m.public_ip));

        if lease.is_divergent() {
            warn!(
                udp_port = ?lease.udp_port,
                tcp_port = ?lease.tcp_port,
                "gateway returned different ports per protocol, using the udp port"
            );
        }
        debug!(port = lease.port, public_ip = ?lease.public_ip, "lease renewed");
        Ok(lease)
    }
}

fn log_failed(protocol: Protocol, result: Result<Mapping, LeaseError>) -> Option<Mapping> {
    match result {
        Ok(mapping) => Some(mapping),
        Err(e) => {
            warn!(%protocol, error = %e, "mapping request failed");
            None
        }
    }
}

/// Gateway heuristic for point-to-point VPN tunnels: same /24, host `.1`.
pub fn gateway_for(addr: Ipv4Addr) -> Ipv4Addr {
    let o = addr.octets();
    Ipv4Addr::new(o[0], o[1], o[2], 1)
}

/// Drives the `natpmpc` command-line tool.
pub struct NatpmpcMapper {
    binary: PathBuf,
    install_command: Option<String>,
    install_attempted: AtomicBool,
    timeout: Duration,
}

impl NatpmpcMapper {
    pub fn new(binary: PathBuf, install_command: Option<String>, timeout: Duration) -> Self {
        Self {
            binary,
            install_command,
            install_attempted: AtomicBool::new(false),
            timeout,
        }
    }

    async fn invoke(
        &self,
        gateway: Ipv4Addr,
        protocol: Protocol,
        lifetime: u32,
    ) -> Result<Mapping, LeaseError> {
        let mut command = Command::new(&self.binary);
        command
            .arg("-a")
            .arg(PUBLIC_PORT.to_string())
            .arg(PRIVATE_PORT.to_string())
            .arg(protocol.as_str())
            .arg(lifetime.to_string())
            .arg("-g")
            .arg(gateway.to_string())
            .kill_on_drop(true);

        let output = match timeout(self.timeout, command.output()).await {
            Err(_) => {
                return Err(LeaseError::Timeout {
                    protocol,
                    timeout: self.timeout,
                })
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LeaseError::ToolMissing(self.binary.display().to_string()))
            }
            Ok(Err(e)) => return Err(LeaseError::Io(e)),
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_natpmpc_output(&stdout).ok_or_else(|| {
            let stderr = String::from_utf8_lossy(&output.stderr);
            LeaseError::MappingFailed {
                protocol,
                message: format!("natpmpc exited with {}: {}", output.status, stderr.trim()),
            }
        })
    }

    /// Runs the install command at most once per process.
    async fn try_install(&self) -> bool {
        let Some(install) = &self.install_command else {
            return false;
        };
        if self.install_attempted.swap(true, Ordering::SeqCst) {
            return false;
        }

        info!(command = %install, "natpmpc not found, attempting install");
        match ShellExecutor::new(INSTALL_TIMEOUT).run(install).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "natpmpc install failed");
                false
            }
        }
    }
}

#[async_trait]
impl PortMapper for NatpmpcMapper {
    async fn map(
        &self,
        gateway: Ipv4Addr,
        protocol: Protocol,
        lifetime: u32,
    ) -> Result<Mapping, LeaseError> {
        let result = self.invoke(gateway, protocol, lifetime).await;
        if matches!(result, Err(LeaseError::ToolMissing(_))) && self.try_install().await {
            return self.invoke(gateway, protocol, lifetime).await;
        }
        result
    }
}

/// Extract the mapping from natpmpc's human-readable output.
///
/// The lines of interest look like:
/// `Public IP address : 203.0.113.7` and
/// `Mapped public port 51820 protocol UDP to local port 0 lifetime 60`.
pub fn parse_natpmpc_output(output: &str) -> Option<Mapping> {
    let mut public_ip = None;
    let mut public_port = None;

    for line in output.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("Public IP address :") {
            public_ip = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("Mapped public port") {
            public_port = rest.split_whitespace().next().and_then(|p| p.parse::<u16>().ok());
        }
    }

    public_port
        .filter(|port| *port != 0)
        .map(|public_port| Mapping { public_port, public_ip })
}

/// Speaks NAT-PMP (RFC 6886) to the gateway directly.
pub struct NativeMapper {
    gateway_port: u16,
    timeout: Duration,
}

impl NativeMapper {
    pub fn new(timeout: Duration) -> Self {
        Self {
            gateway_port: NATPMP_PORT,
            timeout,
        }
    }

    /// Target a non-standard gateway port.
    pub fn with_gateway_port(mut self, port: u16) -> Self {
        self.gateway_port = port;
        self
    }
}

#[async_trait]
impl PortMapper for NativeMapper {
    async fn map(
        &self,
        gateway: Ipv4Addr,
        protocol: Protocol,
        lifetime: u32,
    ) -> Result<Mapping, LeaseError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let addr = SocketAddrV4::new(gateway, self.gateway_port);
        socket
            .send_to(&encode_request(protocol, PRIVATE_PORT, PUBLIC_PORT, lifetime), addr)
            .await?;

        let mut buf = [0u8; 16];
        let (len, _) = timeout(self.timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| LeaseError::Timeout {
                protocol,
                timeout: self.timeout,
            })??;
        decode_response(&buf[..len], protocol)
    }
}

fn opcode(protocol: Protocol) -> u8 {
    match protocol {
        Protocol::Udp => 1,
        Protocol::Tcp => 2,
    }
}

pub fn encode_request(
    protocol: Protocol,
    private_port: u16,
    public_port: u16,
    lifetime: u32,
) -> [u8; 12] {
    let mut req = [0u8; 12];
    req[1] = opcode(protocol);
    req[4..6].copy_from_slice(&private_port.to_be_bytes());
    req[6..8].copy_from_slice(&public_port.to_be_bytes());
    req[8..12].copy_from_slice(&lifetime.to_be_bytes());
    req
}

pub fn decode_response(data: &[u8], protocol: Protocol) -> Result<Mapping, LeaseError> {
    let failed = |message: String| LeaseError::MappingFailed { protocol, message };

    if data.len() < 16 {
        return Err(failed(format!("short response ({} bytes)", data.len())));
    }
    if data[0] != 0 || data[1] != opcode(protocol) + RESPONSE_FLAG {
        return Err(failed(format!("unexpected version/opcode {}/{}", data[0], data[1])));
    }
    let result_code = u16::from_be_bytes([data[2], data[3]]);
    if result_code != 0 {
        return Err(failed(format!("result code {result_code}")));
    }
    let public_port = u16::from_be_bytes([data[10], data[11]]);
    if public_port == 0 {
        return Err(failed("gateway mapped port 0".to_string()));
    }

    Ok(Mapping {
        public_port,
        public_ip: None,
    })
}
