//! Alpaca device discovery
//!
//! The host side answers UDP broadcast queries with its HTTP port and the
//! devices it serves. The client side broadcasts a query, collects replies
//! for a bounded time and can then fetch each server's configured devices.

use crate::client::ClientError;
use crate::registry::Registry;
use crate::request::AlpacaResponse;
use crate::{AlpacaDevice, AlpacaDeviceType, ALPACA_DISCOVERY_PORT};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Canonical query payload
pub const DISCOVERY_QUERY: &[u8] = b"alpacadiscovery1";

/// One device in a discovery reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveredDevice {
    /// Kept as text so replies naming unknown types still parse
    pub device_type: String,
    pub device_number: u32,
    #[serde(rename = "UniqueID")]
    pub unique_id: String,
}

/// Discovery response from an Alpaca server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveryReply {
    pub alpaca_port: u16,
    #[serde(default)]
    pub devices: Vec<DiscoveredDevice>,
}

/// A reply received by [`query`], rebuilt on every round
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryRecord {
    pub address: SocketAddr,
    pub alpaca_port: u16,
    pub devices: Vec<DiscoveredDevice>,
}

impl DiscoveryRecord {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.address.ip(), self.alpaca_port)
    }
}

/// Empty, or anything starting with "alpaca" in any case
pub fn is_discovery_query(payload: &[u8]) -> bool {
    payload.is_empty() || payload.get(..6).is_some_and(|prefix| prefix.eq_ignore_ascii_case(b"alpaca"))
}

/// Reply describing every remotely visible device in `registry`
pub fn build_reply(registry: &Registry, alpaca_port: u16) -> DiscoveryReply {
    let devices = registry
        .remote_summaries()
        .into_iter()
        .map(|summary| DiscoveredDevice {
            device_type: summary.device_type.ascom_name().to_string(),
            device_number: summary.device_number,
            unique_id: summary.unique_id.to_string(),
        })
        .collect();
    DiscoveryReply { alpaca_port, devices }
}

/// Background UDP listener answering discovery queries
pub struct DiscoveryResponder {
    socket: UdpSocket,
    registry: Arc<Registry>,
    alpaca_port: u16,
}

impl DiscoveryResponder {
    pub async fn bind(addr: SocketAddr, registry: Arc<Registry>, alpaca_port: u16) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            registry,
            alpaca_port,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn answer(&self, payload: &[u8], peer: SocketAddr) {
        if !is_discovery_query(payload) {
            debug!(%peer, len = payload.len(), "Ignoring non-discovery datagram");
            return;
        }
        let reply = build_reply(&self.registry, self.alpaca_port);
        let bytes = match serde_json::to_vec(&reply) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode discovery reply");
                return;
            }
        };
        match self.socket.send_to(&bytes, peer).await {
            Ok(_) => info!(%peer, devices = reply.devices.len(), "Answered discovery query"),
            Err(e) => warn!(%peer, error = %e, "Failed to send discovery reply"),
        }
    }

    /// Serve until `shutdown` flips to true or its sender goes away.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let port = self.local_addr().map(|a| a.port()).unwrap_or_default();
        info!(port, alpaca_port = self.alpaca_port, "Discovery responder started");
        let mut buf = [0u8; 1024];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => self.answer(&buf[..len], peer).await,
                    Err(e) => warn!(error = %e, "Discovery receive failed"),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(port, "Discovery responder stopped");
    }
}

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Total discovery timeout
    pub discovery_timeout: Duration,
    /// Time to wait for individual responses
    pub response_wait: Duration,
    /// Timeout for HTTP requests to get device info
    pub http_timeout: Duration,
    /// Number of discovery broadcasts to send
    pub broadcast_count: u32,
    /// Delay between broadcasts
    pub broadcast_delay: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(2),
            response_wait: Duration::from_millis(500),
            http_timeout: Duration::from_secs(10),
            broadcast_count: 1,
            broadcast_delay: Duration::from_millis(200),
        }
    }
}

impl DiscoveryConfig {
    /// Create a quick discovery config for fast scans
    pub fn quick() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(1),
            response_wait: Duration::from_millis(200),
            http_timeout: Duration::from_secs(5),
            broadcast_count: 1,
            broadcast_delay: Duration::from_millis(100),
        }
    }

    /// Create a thorough discovery config for comprehensive scans
    pub fn thorough() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(10),
            response_wait: Duration::from_millis(1000),
            http_timeout: Duration::from_secs(15),
            broadcast_count: 5,
            broadcast_delay: Duration::from_millis(500),
        }
    }
}

/// Limited broadcast on the standard discovery port
pub fn broadcast_target() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::BROADCAST, ALPACA_DISCOVERY_PORT))
}

/// Send a query to `target` and collect replies until the timeout.
///
/// Replies are deduplicated by sender address. Socket failures and silence
/// both yield an empty list.
pub async fn query(target: SocketAddr, config: &DiscoveryConfig) -> Vec<DiscoveryRecord> {
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to bind UDP socket for discovery: {}", e);
            return Vec::new();
        }
    };

    if let Err(e) = socket.set_broadcast(true) {
        warn!("Failed to enable broadcast on discovery socket: {}", e);
        return Vec::new();
    }

    for broadcast_num in 0..config.broadcast_count {
        if let Err(e) = socket.send_to(DISCOVERY_QUERY, target).await {
            warn!("Failed to send discovery broadcast {}: {}", broadcast_num + 1, e);
            continue;
        }
        debug!("Sent discovery broadcast {}/{}", broadcast_num + 1, config.broadcast_count);

        if broadcast_num + 1 < config.broadcast_count {
            tokio::time::sleep(config.broadcast_delay).await;
        }
    }

    let mut records: HashMap<SocketAddr, DiscoveryRecord> = HashMap::new();
    let mut buf = [0u8; 4096];
    let deadline = tokio::time::Instant::now() + config.discovery_timeout;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match timeout(remaining.min(config.response_wait), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, address))) => match serde_json::from_slice::<DiscoveryReply>(&buf[..len]) {
                Ok(reply) => {
                    records.entry(address).or_insert_with(|| {
                        debug!(%address, port = reply.alpaca_port, "Discovered Alpaca server");
                        DiscoveryRecord {
                            address,
                            alpaca_port: reply.alpaca_port,
                            devices: reply.devices,
                        }
                    });
                }
                Err(_) => debug!("Received non-JSON response from {}", address),
            },
            Ok(Err(e)) => debug!("Error receiving discovery response: {}", e),
            Err(_) => continue,
        }
    }

    info!(target = %target, servers = records.len(), "Discovery round finished");
    let mut records: Vec<DiscoveryRecord> = records.into_values().collect();
    records.sort_by_key(|record| record.address);
    records
}

/// Configured device from management API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConfiguredDevice {
    #[serde(default)]
    device_name: String,
    device_type: String,
    device_number: u32,
    #[serde(rename = "UniqueID", default)]
    unique_id: String,
}

/// Get configured devices from an Alpaca server
pub async fn get_configured_devices(
    server_ip: &str,
    port: u16,
    timeout_duration: Duration,
) -> Result<Vec<AlpacaDevice>, ClientError> {
    let url = format!("http://{}:{}/management/v1/configureddevices", server_ip, port);

    let client = reqwest::Client::builder()
        .timeout(timeout_duration)
        .build()
        .map_err(|e| ClientError::RequestFailed(e.to_string()))?;

    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(ClientError::HttpError {
            status: response.status().as_u16(),
            message: "Failed to get configured devices".to_string(),
        });
    }

    let envelope: AlpacaResponse = response.json().await?;
    let fields = crate::client::check_envelope(envelope)?;
    let listed: Vec<ConfiguredDevice> = match fields.get("Value") {
        Some(value) => serde_json::from_value(value.clone())?,
        None => Vec::new(),
    };

    let base_url = format!("http://{}:{}", server_ip, port);
    let devices = listed
        .into_iter()
        .filter_map(|d| {
            let Some(device_type) = AlpacaDeviceType::from_str(&d.device_type) else {
                debug!("Unknown device type: {}", d.device_type);
                return None;
            };
            Some(AlpacaDevice {
                device_type,
                device_number: d.device_number,
                server_name: server_ip.to_string(),
                device_name: d.device_name,
                unique_id: d.unique_id,
                base_url: base_url.clone(),
            })
        })
        .collect();

    Ok(devices)
}

/// Query `target`, then fetch every responding server's device list in parallel.
pub async fn discover_all_devices(target: SocketAddr, config: &DiscoveryConfig) -> Vec<AlpacaDevice> {
    let servers = query(target, config).await;

    let fetches = servers.iter().map(|record| {
        let ip = record.address.ip().to_string();
        let port = record.alpaca_port;
        let http_timeout = config.http_timeout;
        async move {
            match get_configured_devices(&ip, port, http_timeout).await {
                Ok(devices) => {
                    info!("Found {} devices at {}:{}", devices.len(), ip, port);
                    devices
                }
                Err(e) => {
                    warn!("Failed to get devices from {}:{}: {}", ip, port, e);
                    Vec::new()
                }
            }
        }
    });

    futures::future::join_all(fetches)
        .await
        .into_iter()
        .flatten()
        .collect()
}
