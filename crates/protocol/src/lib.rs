//! # Tapo Protocol Library
//!
//! Synchronous building blocks for talking to Tapo devices: no sockets and
//! no HTTP, only bytes in and bytes out.
//!
//! ## Overview
//!
//! - **Crypto**: RSA key pairs, SHA-1 / SHA-256 / MD5, AES-128-CBC and the
//!   passthrough session cipher
//! - **KLAP**: seed handshake hashes and the sequence-signed stream cipher
//! - **Messages**: request/response envelopes and the device error codes
//! - **Framing**: the CRC32-checked UDP discovery frame
//! - **Request ids**: Snowflake-style id generator
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │     TapoRequest / TapoResponse (JSON)     │
//! ├─────────────────────┬─────────────────────┤
//! │ securePassthrough   │ KLAP                │
//! │ RSA -> AES-CBC      │ seeds -> AES-CBC    │
//! │ base64 in JSON      │ SHA-256 signed body │
//! ├─────────────────────┴─────────────────────┤
//! │                 HTTP POST                 │
//! └───────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use tapo_protocol::{KlapCipher, TapoRequest};
//! use tapo_protocol::klap::auth_hash;
//!
//! let auth = auth_hash("user@example.com", "secret");
//! let mut cipher = KlapCipher::new(&[1u8; 16], &[2u8; 16], &auth);
//!
//! let request = TapoRequest::get_device_info().to_json().unwrap();
//! let (payload, seq) = cipher.encrypt(request.as_bytes()).unwrap();
//! assert_eq!(seq, cipher.sequence());
//! assert_eq!(cipher.decrypt(&payload).unwrap(), request.as_bytes());
//! ```

pub mod crypto;
pub mod error;
pub mod framing;
pub mod klap;
pub mod messages;
pub mod request_id;

pub use crypto::{
    generate_terminal_uuid, KeyPair, PassthroughCipher, DISCOVERY_RSA_BITS, HANDSHAKE_RSA_BITS,
};
pub use error::{ProtocolError, Result};
pub use framing::{discovery_request, DiscoveryFrame, PacketType, FRAME_HEADER_SIZE};
pub use klap::{KlapCipher, KlapHandshakePhase};
pub use messages::{Credential, ErrorCode, LoginParams, LoginVersion, TapoRequest, TapoResponse};
pub use request_id::RequestIdGenerator;
