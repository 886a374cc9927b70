//! # Tapo Client Library
//!
//! Async client for Tapo smart-home devices on the local network.
//!
//! ## Overview
//!
//! - **Transports**: secure passthrough (RSA handshake, AES session, token)
//!   and KLAP (seed handshake, sequence-signed AES)
//! - **Orchestrator**: picks a transport per device, keeps its session alive
//!   and retries session timeouts and rate limiting a bounded number of times
//! - **Discovery**: UDP broadcast probe with RSA-wrapped replies, or the
//!   device list of the cloud account
//! - **API**: thin JSON helpers over the common device methods
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  ApiClient (raw JSON)                    │
//! ├──────────────────────────────────────────────────────────┤
//! │         TapoClient: protocol selection + retry           │
//! │            Mutex<Option<Transport>> session slot         │
//! ├────────────────────────────┬─────────────────────────────┤
//! │   PassthroughTransport     │       KlapTransport         │
//! ├────────────────────────────┴─────────────────────────────┤
//! │             HttpChannel (reqwest in production)          │
//! └──────────────────────────────────────────────────────────┘
//!
//!   DiscoveryScanner: UDP broadcast, independent of the above
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tapo_client::{ApiClient, ClientOptions, TapoClient};
//! use tapo_protocol::Credential;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let credential = Credential::new("user@example.com", "secret");
//!     let client = TapoClient::new("192.168.1.40", credential, ClientOptions::default())?;
//!
//!     let api = ApiClient::new(client);
//!     let info = api.get_device_info().await?;
//!     println!("{}", info["nickname"]);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`transport`]: Passthrough and KLAP transports
//! - [`orchestrator`]: Protocol selection and retry
//! - [`discovery`]: UDP device discovery
//! - [`cloud`]: Cloud account device list
//! - [`api`]: Device method helpers
//! - [`http`]: HTTP seam used by the transports

pub mod api;
pub mod cloud;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod http;
pub mod orchestrator;
pub mod transport;

// Re-export protocol for convenience
pub use tapo_protocol;

pub use api::ApiClient;
pub use cloud::{CloudClient, CloudDeviceInfo};
pub use config::Config;
pub use device::{DiscoveredDevice, EncryptionScheme};
pub use discovery::{scan, DiscoveryScan, DiscoveryScanner};
pub use error::{ClientError, Result};
pub use http::{HttpChannel, HttpRequest, HttpResponse, ReqwestChannel};
pub use orchestrator::{ClientOptions, TapoClient};
pub use transport::{Protocol, ProtocolPreference, Transport};
