//! UDP broadcast discovery.
//!
//! A scan broadcasts a single onboarding probe carrying a fresh 2048-bit RSA
//! public key and then listens for replies until its timeout elapses. Each
//! reply is a [`DiscoveryFrame`] whose JSON payload describes one device.
//! Devices that also return an `encrypt_info` block wrap an AES key and IV
//! under the probe's key with RSA-OAEP; the decrypted block is kept on the
//! device as `extra_info`.
//!
//! Discovery is best-effort. A corrupt or unreadable reply is logged at
//! debug level and skipped; it never ends the scan.
//!
//! ```no_run
//! # async fn run() -> tapo_client::Result<()> {
//! use std::time::Duration;
//!
//! let mut scan = tapo_client::discovery::scan(Duration::from_secs(3), "255.255.255.255").await?;
//! while let Some(device) = scan.next().await {
//!     println!("{} {} at {}", device.device_type, device.device_model, device.ip);
//! }
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::Value;
use tapo_protocol::{
    discovery_request, DiscoveryFrame, KeyPair, PassthroughCipher, DISCOVERY_RSA_BITS,
};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use crate::device::DiscoveredDevice;
use crate::error::{ClientError, Result};
use crate::transport::generate_key_pair;

/// Port devices listen on for the onboarding probe.
pub const DEFAULT_DISCOVERY_PORT: u16 = 20002;

/// Limited broadcast address.
pub const DEFAULT_BROADCAST_ADDRESS: &str = "255.255.255.255";

/// Default listen window of a scan.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

const RECV_BUFFER_SIZE: usize = 2048;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const BROADCAST_TTL: u32 = 5;

/// Scans the local network on the default port.
pub async fn scan(timeout: Duration, broadcast_address: &str) -> Result<DiscoveryScan> {
    DiscoveryScanner::new()
        .broadcast_address(broadcast_address)
        .timeout(timeout)
        .scan()
        .await
}

/// Configuration of a discovery scan.
#[derive(Debug, Clone)]
pub struct DiscoveryScanner {
    broadcast_address: String,
    port: u16,
    timeout: Duration,
}

impl Default for DiscoveryScanner {
    fn default() -> Self {
        Self {
            broadcast_address: DEFAULT_BROADCAST_ADDRESS.to_string(),
            port: DEFAULT_DISCOVERY_PORT,
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }
}

impl DiscoveryScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broadcast_address(mut self, address: impl Into<String>) -> Self {
        self.broadcast_address = address.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends the probe and returns the scan that yields the replies.
    ///
    /// Every call opens a new socket with a new key pair.
    pub async fn scan(&self) -> Result<DiscoveryScan> {
        let key_pair = generate_key_pair(DISCOVERY_RSA_BITS).await?;
        let probe = discovery_request(&key_pair.public_key_pem()?)?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        socket.set_ttl(BROADCAST_TTL)?;
        socket
            .send_to(&probe, (self.broadcast_address.as_str(), self.port))
            .await?;
        info!(
            "Discovery probe sent to {}:{}, listening for {:?}",
            self.broadcast_address, self.port, self.timeout
        );

        Ok(DiscoveryScan {
            socket,
            key_pair,
            deadline: Instant::now() + self.timeout,
            buf: vec![0u8; RECV_BUFFER_SIZE],
        })
    }
}

/// An in-progress scan. Yields devices until the timeout elapses.
pub struct DiscoveryScan {
    socket: UdpSocket,
    key_pair: KeyPair,
    deadline: Instant,
    buf: Vec<u8>,
}

impl DiscoveryScan {
    /// Waits for the next device. Returns `None` once the timeout elapses.
    pub async fn next(&mut self) -> Option<DiscoveredDevice> {
        loop {
            let remaining = self.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }

            let wait = remaining.min(POLL_INTERVAL);
            let received = match timeout(wait, self.socket.recv_from(&mut self.buf)).await {
                // Poll interval elapsed with nothing to read.
                Err(_) => continue,
                Ok(Err(e)) if is_timeout_error(&e) => continue,
                Ok(Err(e)) => {
                    debug!("discovery recv error: {}", e);
                    continue;
                }
                Ok(Ok(received)) => received,
            };

            let (len, source) = received;
            match decode_reply(&self.buf[..len], source, &self.key_pair) {
                Ok(Some(device)) => {
                    debug!(
                        "{} {} answered from {}",
                        device.device_type, device.device_model, source
                    );
                    return Some(device);
                }
                Ok(None) => {}
                Err(e) => debug!("Skipping discovery reply from {}: {}", source, e),
            }
        }
    }

    /// Drains the scan into a list.
    pub async fn collect(mut self) -> Vec<DiscoveredDevice> {
        let mut devices = Vec::new();
        while let Some(device) = self.next().await {
            devices.push(device);
        }
        devices
    }
}

/// Decodes one datagram. `Ok(None)` means a well-formed reply that carries
/// no device (non-zero `error_code`). A reply without `error_code` is an
/// error, so the caller skips it.
fn decode_reply(
    datagram: &[u8],
    source: SocketAddr,
    key_pair: &KeyPair,
) -> Result<Option<DiscoveredDevice>> {
    let reply = DiscoveryFrame::decode(datagram)?.json()?;

    let error_code = reply
        .get("error_code")
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            ClientError::MalformedResponse("discovery reply has no error_code".to_string())
        })?;
    if error_code != 0 {
        debug!(error_code, "Discovery reply from {} reports an error", source);
        return Ok(None);
    }

    let mut result = reply.get("result").cloned().ok_or_else(|| {
        ClientError::MalformedResponse("discovery reply has no result".to_string())
    })?;

    if let Some(encrypt_info) = result.get("encrypt_info").filter(|info| !info.is_null()) {
        match decrypt_encrypt_info(encrypt_info, key_pair) {
            Ok(clear) => {
                if let Some(object) = result.as_object_mut() {
                    object.insert("encrypt_info_clear".to_string(), clear);
                }
            }
            Err(e) => debug!("Cannot decrypt encrypt_info from {}: {}", source, e),
        }
    }

    DiscoveredDevice::from_json(&result, Some(source.ip())).map(Some)
}

fn decrypt_encrypt_info(encrypt_info: &Value, key_pair: &KeyPair) -> Result<Value> {
    let field = |name: &str| {
        encrypt_info
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::MalformedResponse(format!("encrypt_info has no {}", name)))
    };

    let wrapped = BASE64
        .decode(field("key")?)
        .map_err(|e| ClientError::MalformedResponse(format!("encrypt_info key: {}", e)))?;
    let session_key = key_pair.decrypt_oaep_sha1(&wrapped)?;
    let clear = PassthroughCipher::from_session_key(&session_key)?.decrypt(field("data")?)?;

    Ok(serde_json::from_str(&clear).unwrap_or(Value::String(clear)))
}

fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
