//! Network printers reached through the backend relay.
//!
//! The relay owns the raw socket; this side only probes and forwards jobs.
//! A session is therefore just a resolved `(address, port)` plus the client.
//! Discovery merges an mDNS browse with a TCP connect scan of configured
//! IPv4 ranges over the usual printer ports.

use super::{AuthorizedDevices, ChunkPolicy, DiscoveredDevice, TransportAdapter, TransportSession};
use crate::config::RelayConfig;
use crate::errors::{LinkError, Result};
use crate::record::TransportKind;
use async_trait::async_trait;
use base64::Engine as _;
use futures_util::stream::{self, StreamExt};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub const DEFAULT_PORT: u16 = 9100;

/// Ports thermal printers usually listen on (raw, LPD, IPP).
pub const THERMAL_PORTS: &[u16] = &[9100, 9101, 9102, 515, 631];

const SERVICE_TYPES: &[&str] = &["_pdl-datastream._tcp.local.", "_printer._tcp.local."];

/// `ip[:port]` of a network printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkAddress {
    pub ip: IpAddr,
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(ip: &str, port: u16) -> Result<Self> {
        let ip: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| LinkError::InvalidRequest(format!("Invalid IP address: {}", ip)))?;
        if port == 0 {
            return Err(LinkError::InvalidRequest("Port must be between 1 and 65535".to_string()));
        }
        if !THERMAL_PORTS.contains(&port) {
            warn!("Port {} is not a typical thermal printer port ({:?})", port, THERMAL_PORTS);
        }
        Ok(Self { ip, port })
    }

    pub fn parse(address: &str) -> Result<Self> {
        match address.rsplit_once(':') {
            Some((ip, port)) if !ip.contains(':') || ip.starts_with('[') => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| LinkError::InvalidRequest(format!("Invalid port in {}", address)))?;
                Self::new(ip.trim_start_matches('[').trim_end_matches(']'), port)
            }
            _ => Self::new(address, DEFAULT_PORT),
        }
    }
}

/// Host addresses of an IPv4 CIDR range. Network and broadcast addresses are skipped below /31.
pub fn parse_cidr(cidr: &str) -> Result<Vec<Ipv4Addr>> {
    let (base, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| LinkError::Config(format!("Invalid CIDR notation: {}", cidr)))?;
    let base: Ipv4Addr = base
        .trim()
        .parse()
        .map_err(|_| LinkError::Config(format!("Invalid IP address: {}", base)))?;
    let prefix: u32 = prefix
        .trim()
        .parse()
        .map_err(|_| LinkError::Config(format!("Invalid prefix length: {}", prefix)))?;
    if !(16..=32).contains(&prefix) {
        return Err(LinkError::Config(format!(
            "Prefix length {} is outside the scannable range /16../32",
            prefix
        )));
    }

    let mask = u32::MAX << (32 - prefix);
    let network = u32::from(base) & mask;
    let broadcast = network | !mask;
    if prefix >= 31 {
        return Ok((network..=broadcast).map(Ipv4Addr::from).collect());
    }
    Ok(((network + 1)..broadcast).map(Ipv4Addr::from).collect())
}

/// TCP-connect every host/port pair, at most `concurrency` at a time. Returns the ones that accepted.
pub async fn scan_ports(
    hosts: &[Ipv4Addr],
    ports: &[u16],
    connect_timeout: Duration,
    concurrency: usize,
) -> Vec<SocketAddr> {
    let targets: Vec<SocketAddr> = hosts
        .iter()
        .flat_map(|ip| ports.iter().map(move |port| SocketAddr::from((*ip, *port))))
        .collect();

    let mut open: Vec<SocketAddr> = stream::iter(targets)
        .map(|target| async move {
            match tokio::time::timeout(connect_timeout, TcpStream::connect(target)).await {
                Ok(Ok(_)) => {
                    debug!("Printer port open at {}", target);
                    Some(target)
                }
                _ => None,
            }
        })
        .buffer_unordered(concurrency.max(1))
        .filter_map(|found| async move { found })
        .collect()
        .await;
    open.sort();
    open
}

struct ScanSettings {
    ranges: Vec<String>,
    local_subnet: bool,
    ports: Vec<u16>,
    connect_timeout: Duration,
    concurrency: usize,
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

#[derive(Debug, Serialize)]
struct ProbeRequest {
    address: String,
    port: u16,
}

#[derive(Debug, Serialize)]
struct PrintRequest<'a> {
    address: String,
    port: u16,
    /// Base64 of the raw print bytes.
    bytes: String,
    label: &'a str,
}

#[derive(Debug, Deserialize)]
struct RelayResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Clone)]
struct RelayClient {
    http: Client,
    probe_url: String,
    print_url: String,
}

impl RelayClient {
    async fn probe(&self, target: NetworkAddress) -> Result<bool> {
        let response = self
            .http
            .post(&self.probe_url)
            .json(&ProbeRequest {
                address: target.ip.to_string(),
                port: target.port,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(LinkError::Relay(format!("probe returned HTTP {}", response.status())));
        }
        let body: RelayResponse = response.json().await?;
        if !body.success {
            debug!(
                "Relay probe for {} failed: {}",
                target,
                body.error.as_deref().unwrap_or("unreachable")
            );
        }
        Ok(body.success)
    }

    async fn print(&self, target: NetworkAddress, bytes: &[u8], label: &str) -> Result<()> {
        let response = self
            .http
            .post(&self.print_url)
            .json(&PrintRequest {
                address: target.ip.to_string(),
                port: target.port,
                bytes: base64::engine::general_purpose::STANDARD.encode(bytes),
                label,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(LinkError::Relay(format!("print returned HTTP {}", response.status())));
        }
        let body: RelayResponse = response.json().await?;
        if body.success {
            Ok(())
        } else {
            Err(LinkError::Relay(body.error.unwrap_or_else(|| "print failed".to_string())))
        }
    }
}

pub struct NetworkAdapter {
    relay: RelayClient,
    browse: Duration,
    scan: ScanSettings,
}

impl NetworkAdapter {
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        let base = config.base_url.trim_end_matches('/');

        Ok(Self {
            relay: RelayClient {
                http,
                probe_url: format!("{}{}", base, config.probe_path),
                print_url: format!("{}{}", base, config.print_path),
            },
            browse: Duration::from_millis(config.mdns_browse_ms),
            scan: ScanSettings {
                ranges: config.scan_ranges.clone(),
                local_subnet: config.scan_local_subnet,
                ports: config.scan_ports.clone(),
                connect_timeout: Duration::from_millis(config.scan_connect_timeout_ms),
                concurrency: config.scan_concurrency,
            },
        })
    }

    /// Port-scan the configured ranges plus, when enabled, this host's own /24.
    async fn scan_subnets(&self) -> Result<Vec<DiscoveredDevice>> {
        let mut ranges = self.scan.ranges.clone();
        if self.scan.local_subnet {
            match local_ip_address::local_ip() {
                Ok(IpAddr::V4(ip)) => {
                    let [a, b, c, _] = ip.octets();
                    ranges.push(format!("{}.{}.{}.0/24", a, b, c));
                }
                Ok(IpAddr::V6(_)) => debug!("Local address is IPv6, skipping local subnet scan"),
                Err(e) => debug!("Could not determine local address: {}", e),
            }
        }

        let mut hosts = BTreeSet::new();
        for range in &ranges {
            hosts.extend(parse_cidr(range)?);
        }
        if hosts.is_empty() || self.scan.ports.is_empty() {
            return Ok(Vec::new());
        }

        let hosts: Vec<Ipv4Addr> = hosts.into_iter().collect();
        info!("Scanning {} hosts on ports {:?}", hosts.len(), self.scan.ports);
        let open = scan_ports(&hosts, &self.scan.ports, self.scan.connect_timeout, self.scan.concurrency).await;
        info!("Subnet scan complete: {} open printer ports", open.len());

        Ok(open
            .into_iter()
            .map(|addr| {
                DiscoveredDevice::new(
                    TransportKind::Network,
                    addr.to_string(),
                    Some(format!("Printer at {}", addr.ip())),
                )
            })
            .collect())
    }

    /// Browse mDNS for raw-port printers.
    async fn browse_mdns(&self) -> Result<Vec<DiscoveredDevice>> {
        let mdns = ServiceDaemon::new()
            .map_err(|e| LinkError::TransportUnavailable(format!("mDNS unavailable: {}", e)))?;
        let mut discovered: HashMap<String, DiscoveredDevice> = HashMap::new();

        for service_type in SERVICE_TYPES {
            let receiver = match mdns.browse(service_type) {
                Ok(receiver) => receiver,
                Err(e) => {
                    warn!("Failed to browse {}: {}", service_type, e);
                    continue;
                }
            };

            let deadline = tokio::time::Instant::now() + self.browse;
            while let Ok(event) = tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                let info = match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => info,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Error receiving mDNS event: {}", e);
                        break;
                    }
                };
                let name = info.get_hostname().trim_end_matches('.').to_string();
                if let Some(ip) = info.get_addresses().iter().next() {
                    let address = format!("{}:{}", ip, info.get_port());
                    info!("Discovered network printer: {} ({})", name, address);
                    discovered
                        .entry(address.clone())
                        .or_insert_with(|| DiscoveredDevice::new(TransportKind::Network, address, Some(name)));
                }
            }

            if let Err(e) = mdns.stop_browse(service_type) {
                debug!("Stopping mDNS browse for {} failed: {}", service_type, e);
            }
        }

        if let Err(e) = mdns.shutdown() {
            debug!("mDNS daemon shutdown failed: {}", e);
        }
        Ok(discovered.into_values().collect())
    }
}

#[async_trait]
impl TransportAdapter for NetworkAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    fn chunking(&self) -> ChunkPolicy {
        ChunkPolicy::unchunked()
    }

    async fn authorized_devices(&self) -> Result<AuthorizedDevices> {
        Ok(AuthorizedDevices::Unsupported)
    }

    async fn scan(&self) -> Result<Vec<DiscoveredDevice>> {
        let mut discovered: HashMap<String, DiscoveredDevice> = HashMap::new();
        if !self.browse.is_zero() {
            match self.browse_mdns().await {
                Ok(found) => discovered.extend(found.into_iter().map(|d| (d.address.clone(), d))),
                Err(e) => warn!("mDNS discovery failed: {}", e),
            }
        }
        for device in self.scan_subnets().await? {
            discovered.entry(device.address.clone()).or_insert(device);
        }

        let mut devices: Vec<DiscoveredDevice> = discovered.into_values().collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(devices)
    }

    async fn probe(&self, device: &DiscoveredDevice) -> Result<bool> {
        self.relay.probe(NetworkAddress::parse(&device.address)?).await
    }

    async fn open(&self, device: &DiscoveredDevice) -> Result<Arc<dyn TransportSession>> {
        Ok(Arc::new(NetworkSession {
            relay: self.relay.clone(),
            target: NetworkAddress::parse(&device.address)?,
        }))
    }
}

struct NetworkSession {
    relay: RelayClient,
    target: NetworkAddress,
}

#[async_trait]
impl TransportSession for NetworkSession {
    async fn write(&self, chunk: &[u8]) -> Result<()> {
        self.write_labeled(chunk, None).await
    }

    async fn write_labeled(&self, chunk: &[u8], label: Option<&str>) -> Result<()> {
        self.relay.print(self.target, chunk, label.unwrap_or("Receipt")).await
    }

    async fn is_alive(&self) -> bool {
        self.relay.probe(self.target).await.unwrap_or(false)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
