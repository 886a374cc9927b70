//! Device transports.
//!
//! Two protocols reach the same device family:
//! - secure passthrough (RSA handshake, AES session, bearer token) for older
//!   firmware
//! - KLAP (seed handshake, sequence-signed AES) for newer firmware
//!
//! A client uses exactly one of them at a time, held as a [`Transport`].

pub mod klap;
pub mod passthrough;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tapo_protocol::{KeyPair, TapoRequest, TapoResponse};

use crate::error::{ClientError, Result};
use crate::http::HttpChannel;

pub use klap::{KlapSession, KlapTransport};
pub use passthrough::{PassthroughSession, PassthroughTransport};

/// Sessions are treated as expired this long before the device says so.
pub const SESSION_EXPIRY_MARGIN: Duration = Duration::from_secs(40);

/// Session lifetime assumed when a handshake reply has no `TIMEOUT` cookie.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Wire protocol spoken by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Passthrough,
    Klap,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passthrough => write!(f, "passthrough"),
            Self::Klap => write!(f, "klap"),
        }
    }
}

/// Protocol choice for a client: pinned, or probed on first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolPreference {
    /// Probe passthrough and fall back to KLAP when it is not available.
    #[default]
    Auto,
    Passthrough,
    Klap,
}

impl FromStr for ProtocolPreference {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "passthrough" => Ok(Self::Passthrough),
            "klap" => Ok(Self::Klap),
            other => Err(format!(
                "unknown protocol '{}', expected auto, passthrough or klap",
                other
            )),
        }
    }
}

/// The active transport of a client.
pub enum Transport<C> {
    Passthrough(PassthroughTransport<C>),
    Klap(KlapTransport<C>),
}

impl<C: HttpChannel> Transport<C> {
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Passthrough(_) => Protocol::Passthrough,
            Self::Klap(_) => Protocol::Klap,
        }
    }

    /// Establishes a session unless a live one exists.
    pub async fn ensure_session(&mut self) -> Result<()> {
        match self {
            Self::Passthrough(transport) => transport.ensure_session().await,
            Self::Klap(transport) => transport.ensure_session().await,
        }
    }

    /// Sends a request and returns the device's response envelope.
    pub async fn send(&mut self, request: &TapoRequest) -> Result<TapoResponse> {
        match self {
            Self::Passthrough(transport) => transport.send(request).await,
            Self::Klap(transport) => transport.send(request).await,
        }
    }

    /// Tears the session down so the next send handshakes again.
    pub fn invalidate(&mut self) {
        match self {
            Self::Passthrough(transport) => transport.invalidate(),
            Self::Klap(transport) => transport.invalidate(),
        }
    }
}

/// Generates an RSA key pair off the async executor.
pub(crate) async fn generate_key_pair(bits: usize) -> Result<KeyPair> {
    tokio::task::spawn_blocking(move || KeyPair::generate(bits))
        .await
        .map_err(|e| ClientError::HandshakeFailed(format!("key generation task failed: {}", e)))?
        .map_err(ClientError::from)
}
