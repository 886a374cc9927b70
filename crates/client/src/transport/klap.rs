//! KLAP transport.
//!
//! A two-phase seed handshake authenticates both sides against the auth
//! hash, after which every request body is the sequence-signed ciphertext
//! produced by [`KlapCipher`].

use std::sync::Arc;
use std::time::Instant;

use rand::RngCore;
use tapo_protocol::klap::{
    auth_hash_candidates, handshake2_hash, match_auth_hash, split_handshake1_reply, SEED_LENGTH,
};
use tapo_protocol::{Credential, KlapCipher, KlapHandshakePhase, TapoRequest, TapoResponse};
use tracing::{debug, error, warn};

use crate::error::{ClientError, Result};
use crate::http::{HttpChannel, HttpRequest, SESSION_COOKIE};
use crate::transport::{DEFAULT_SESSION_TIMEOUT, SESSION_EXPIRY_MARGIN};

/// KLAP session state.
#[derive(Debug)]
pub struct KlapSession {
    session_cookie: String,
    expires_at: Instant,
    cipher: Option<KlapCipher>,
}

impl KlapSession {
    /// Whether the session is inside the expiry margin.
    pub fn is_expired(&self) -> bool {
        self.expires_at.saturating_duration_since(Instant::now()) <= SESSION_EXPIRY_MARGIN
    }

    /// Sequence of the last encrypted request.
    pub fn sequence(&self) -> Option<i32> {
        self.cipher.as_ref().map(KlapCipher::sequence)
    }
}

/// Transport speaking KLAP.
pub struct KlapTransport<C> {
    channel: Arc<C>,
    url: String,
    credential: Credential,
    phase: KlapHandshakePhase,
    session: Option<KlapSession>,
}

impl<C: HttpChannel> KlapTransport<C> {
    /// Creates a transport whose endpoints live under `url`
    /// (`http://host:port/app`).
    pub fn new(channel: Arc<C>, url: impl Into<String>, credential: Credential) -> Self {
        Self {
            channel,
            url: url.into(),
            credential,
            phase: KlapHandshakePhase::NoSession,
            session: None,
        }
    }

    pub fn phase(&self) -> KlapHandshakePhase {
        self.phase
    }

    pub fn session(&self) -> Option<&KlapSession> {
        self.session.as_ref()
    }

    /// Runs both handshake phases with a random local seed.
    pub async fn handshake(&mut self) -> Result<()> {
        let mut local_seed = [0u8; SEED_LENGTH];
        rand::thread_rng().fill_bytes(&mut local_seed);
        self.handshake_with_seed(local_seed).await
    }

    async fn handshake_with_seed(&mut self, local_seed: [u8; SEED_LENGTH]) -> Result<()> {
        self.phase = KlapHandshakePhase::NoSession;
        self.session = None;
        debug!("Starting KLAP handshake with {}", self.url);

        let reply = self
            .channel
            .post(HttpRequest::binary(
                format!("{}/handshake1", self.url),
                local_seed.to_vec(),
            ))
            .await?;
        self.phase = KlapHandshakePhase::Handshake1Sent;
        if reply.status != 200 {
            self.phase = KlapHandshakePhase::NoSession;
            return Err(ClientError::HandshakeFailed(format!(
                "device answered handshake1 with http {}",
                reply.status
            )));
        }

        let session_cookie = reply
            .cookie(SESSION_COOKIE)
            .ok_or_else(|| ClientError::HandshakeFailed("missing session cookie".to_string()))?
            .to_string();
        let lifetime = reply.session_timeout().unwrap_or(DEFAULT_SESSION_TIMEOUT);
        let (remote_seed, server_hash) = split_handshake1_reply(&reply.body)
            .map_err(|e| ClientError::HandshakeFailed(e.to_string()))?;
        debug!(
            lifetime_secs = lifetime.as_secs(),
            "handshake1 answered, checking candidate credentials"
        );

        let candidates = auth_hash_candidates(&self.credential);
        let Some(auth) = match_auth_hash(&local_seed, remote_seed, server_hash, &candidates) else {
            self.phase = KlapHandshakePhase::NoSession;
            return Err(ClientError::HandshakeFailed(
                "server hash matches no candidate credential".to_string(),
            ));
        };
        if auth != candidates[0] {
            debug!("handshake1 matched a fallback credential");
        }

        let confirmation = handshake2_hash(&local_seed, remote_seed, &auth);
        let reply2 = self
            .channel
            .post(
                HttpRequest::binary(format!("{}/handshake2", self.url), confirmation.to_vec())
                    .with_cookie(SESSION_COOKIE, session_cookie.clone()),
            )
            .await?;
        self.phase = KlapHandshakePhase::Handshake2Sent;
        if reply2.status != 200 {
            self.invalidate();
            return Err(ClientError::HandshakeFailed(format!(
                "device answered handshake2 with http {}",
                reply2.status
            )));
        }

        let cipher = KlapCipher::new(&local_seed, remote_seed, &auth);
        debug!(sequence = cipher.sequence(), "KLAP handshake complete");
        self.session = Some(KlapSession {
            session_cookie,
            expires_at: Instant::now() + lifetime,
            cipher: Some(cipher),
        });
        self.phase = KlapHandshakePhase::Established;
        Ok(())
    }

    /// Makes sure an established, unexpired session exists.
    pub async fn ensure_session(&mut self) -> Result<()> {
        let live = self.phase == KlapHandshakePhase::Established
            && self.session.as_ref().map_or(false, |s| !s.is_expired());
        if !live {
            self.handshake().await?;
        }
        Ok(())
    }

    /// Sends `request` and returns the decrypted response envelope.
    ///
    /// The inner `error_code` is left for the caller to interpret.
    pub async fn send(&mut self, request: &TapoRequest) -> Result<TapoResponse> {
        self.ensure_session().await?;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ClientError::HandshakeFailed("no session after handshake".to_string()))?;
        let cipher = session
            .cipher
            .as_mut()
            .ok_or_else(|| ClientError::HandshakeFailed("session has no cipher".to_string()))?;

        let (payload, seq) = cipher.encrypt(request.to_json()?.as_bytes())?;
        debug!(method = %request.method, seq, "Sending KLAP request");
        let reply = self
            .channel
            .post(
                HttpRequest::binary(format!("{}/request?seq={}", self.url, seq), payload)
                    .with_cookie(SESSION_COOKIE, session.session_cookie.clone()),
            )
            .await?;

        match reply.status {
            200 => {
                let plaintext = cipher.decrypt(&reply.body)?;
                Ok(TapoResponse::from_slice(&plaintext)?)
            }
            403 => {
                error!(seq, "KLAP request forbidden after completed handshake");
                self.invalidate();
                Err(ClientError::ForbiddenAfterHandshake)
            }
            status => {
                error!(seq, status, "KLAP request failed after completed handshake");
                Err(ClientError::Device {
                    code: i32::from(status),
                    message: format!("http status {} for request seq {}", status, seq),
                })
            }
        }
    }

    /// Drops the session; the next send starts a new handshake.
    pub fn invalidate(&mut self) {
        if self.session.is_some() {
            warn!("Invalidating KLAP session");
        }
        self.session = None;
        self.phase = KlapHandshakePhase::NoSession;
    }
}
