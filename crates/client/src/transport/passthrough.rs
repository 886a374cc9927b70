//! Secure passthrough transport.
//!
//! The handshake trades an RSA public key for an AES key and IV; the login
//! then trades the credential for a bearer token. Every request is sent as an
//! encrypted `securePassthrough` envelope and answered by an encrypted inner
//! response.

use std::sync::Arc;
use std::time::Instant;

use tapo_protocol::request_id::current_millis;
use tapo_protocol::{
    generate_terminal_uuid, Credential, ErrorCode, LoginVersion, PassthroughCipher,
    RequestIdGenerator, TapoRequest, TapoResponse, HANDSHAKE_RSA_BITS,
};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::http::{HttpChannel, HttpRequest, SESSION_COOKIE};
use crate::transport::{generate_key_pair, DEFAULT_SESSION_TIMEOUT, SESSION_EXPIRY_MARGIN};

/// Handshakes repeated when the device grants a lifetime inside the margin.
const MAX_HANDSHAKE_ATTEMPTS: usize = 3;

/// State created by a successful handshake.
#[derive(Debug)]
pub struct PassthroughSession {
    cipher: PassthroughCipher,
    session_cookie: String,
    token: Option<String>,
    expires_at: Instant,
    terminal_uuid: String,
    invalidated: bool,
}

impl PassthroughSession {
    /// Whether the session is inside the expiry margin or was invalidated.
    pub fn is_expired(&self) -> bool {
        self.invalidated
            || self
                .expires_at
                .saturating_duration_since(Instant::now())
                <= SESSION_EXPIRY_MARGIN
    }

    /// Whether login has produced a token.
    pub fn is_logged_in(&self) -> bool {
        self.token.is_some()
    }

    pub fn terminal_uuid(&self) -> &str {
        &self.terminal_uuid
    }

    fn invalidate(&mut self) {
        self.invalidated = true;
        self.token = None;
    }
}

/// Transport speaking the secure passthrough protocol.
pub struct PassthroughTransport<C> {
    channel: Arc<C>,
    url: String,
    credential: Credential,
    session: Option<PassthroughSession>,
    request_ids: RequestIdGenerator,
}

impl<C: HttpChannel> PassthroughTransport<C> {
    /// Creates a transport posting to `url` (`http://host:port/app`).
    pub fn new(channel: Arc<C>, url: impl Into<String>, credential: Credential) -> Self {
        Self {
            channel,
            url: url.into(),
            credential,
            session: None,
            request_ids: RequestIdGenerator::default(),
        }
    }

    /// The current session, if any.
    pub fn session(&self) -> Option<&PassthroughSession> {
        self.session.as_ref()
    }

    /// Exchanges a fresh RSA public key for the session cipher.
    ///
    /// The key pair is dropped when this returns, whatever the outcome.
    pub async fn handshake(&self) -> Result<PassthroughSession> {
        debug!("Generating {}-bit handshake key pair", HANDSHAKE_RSA_BITS);
        let key_pair = generate_key_pair(HANDSHAKE_RSA_BITS).await?;

        let request = TapoRequest::handshake(&key_pair.handshake_pem()?);
        let reply = self
            .channel
            .post(HttpRequest::json(self.url.clone(), request.to_json()?))
            .await?;

        let response = TapoResponse::from_slice(&reply.body).map_err(|e| {
            ClientError::HandshakeFailed(format!(
                "unreadable handshake reply (http {}): {}",
                reply.status, e
            ))
        })?;
        match response.error() {
            None => {}
            Some(ErrorCode::TransportNotAvailable) => return Err(ClientError::TransportNotAvailable),
            Some(code) => {
                return Err(ClientError::HandshakeFailed(format!(
                    "device answered handshake with {}",
                    code
                )))
            }
        }

        let session_cookie = reply
            .cookie(SESSION_COOKIE)
            .ok_or_else(|| ClientError::HandshakeFailed("missing session cookie".to_string()))?
            .to_string();
        let lifetime = reply.session_timeout().unwrap_or(DEFAULT_SESSION_TIMEOUT);

        let encoded_key = response
            .result
            .get("key")
            .and_then(|key| key.as_str())
            .ok_or_else(|| ClientError::HandshakeFailed("missing session key".to_string()))?;
        let cipher = PassthroughCipher::from_handshake_key(encoded_key, &key_pair)
            .map_err(|e| ClientError::HandshakeFailed(format!("cannot unwrap session key: {}", e)))?;

        debug!(lifetime_secs = lifetime.as_secs(), "Passthrough handshake complete");
        Ok(PassthroughSession {
            cipher,
            session_cookie,
            token: None,
            expires_at: Instant::now() + lifetime,
            terminal_uuid: generate_terminal_uuid(),
            invalidated: false,
        })
    }

    /// Performs a fresh handshake and logs in with the given encoding.
    pub async fn login(&mut self, version: LoginVersion) -> Result<()> {
        self.session = None;
        let mut session = self.handshake().await?;
        let mut attempts = 1;
        while session.is_expired() {
            if attempts >= MAX_HANDSHAKE_ATTEMPTS {
                return Err(ClientError::HandshakeFailed(
                    "device granted a session shorter than the expiry margin".to_string(),
                ));
            }
            debug!("Handshake session already inside expiry margin, repeating");
            session = self.handshake().await?;
            attempts += 1;
        }

        let request = TapoRequest::login(&self.credential, version)
            .with_request_time_millis(current_millis());
        let response = ClientError::check(self.exchange(&mut session, request).await?)?;
        let token = response
            .result
            .get("token")
            .and_then(|token| token.as_str())
            .ok_or_else(|| ClientError::MalformedResponse("login reply has no token".to_string()))?;

        session.token = Some(token.to_string());
        self.session = Some(session);
        debug!(?version, "Passthrough login succeeded");
        Ok(())
    }

    /// Makes sure a logged-in, unexpired session exists.
    ///
    /// Tries the v1 login first and falls back to v2 when the device rejects
    /// it. Transport failures are returned without trying v2.
    pub async fn ensure_session(&mut self) -> Result<()> {
        if let Some(session) = &self.session {
            if session.is_logged_in() && !session.is_expired() {
                return Ok(());
            }
        }

        match self.login(LoginVersion::V1).await {
            Ok(()) => Ok(()),
            Err(err) if is_login_rejection(&err) => {
                debug!("v1 login rejected ({}), trying v2", err);
                self.login(LoginVersion::V2).await.map_err(|err| match err {
                    ClientError::Device { code, message } => ClientError::AuthenticationFailed(
                        format!("v1 and v2 login rejected: {} ({})", message, code),
                    ),
                    other => other,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Sends `request` and returns the inner response envelope.
    ///
    /// The inner `error_code` is left for the caller to interpret.
    pub async fn send(&mut self, request: &TapoRequest) -> Result<TapoResponse> {
        self.ensure_session().await?;
        let mut session = self
            .session
            .take()
            .ok_or_else(|| ClientError::HandshakeFailed("no session after login".to_string()))?;
        let result = self.exchange(&mut session, request.clone()).await;
        self.session = Some(session);
        result
    }

    /// Marks the session unusable; the next send starts a new handshake.
    pub fn invalidate(&mut self) {
        if let Some(session) = &mut self.session {
            warn!("Invalidating passthrough session");
            session.invalidate();
        }
    }

    async fn exchange(
        &mut self,
        session: &mut PassthroughSession,
        request: TapoRequest,
    ) -> Result<TapoResponse> {
        let request = request
            .with_request_id(self.request_ids.next_id()?)
            .with_request_time_millis(current_millis())
            .with_terminal_uuid(session.terminal_uuid.clone());
        debug!(method = %request.method, "Sending passthrough request");

        let encrypted = session.cipher.encrypt(&request.to_json()?)?;
        let envelope = TapoRequest::secure_passthrough(&encrypted);
        let url = match &session.token {
            Some(token) => format!("{}?token={}", self.url, token),
            None => self.url.clone(),
        };

        let reply = self
            .channel
            .post(
                HttpRequest::json(url, envelope.to_json()?)
                    .with_cookie(SESSION_COOKIE, session.session_cookie.clone()),
            )
            .await?;

        let outer = ClientError::check(TapoResponse::from_slice(&reply.body)?)?;
        let inner = outer
            .result
            .get("response")
            .and_then(|response| response.as_str())
            .ok_or_else(|| {
                ClientError::MalformedResponse("passthrough reply has no response".to_string())
            })?;
        let decrypted = session.cipher.decrypt(inner)?;
        Ok(TapoResponse::from_json(&decrypted)?)
    }
}

fn is_login_rejection(err: &ClientError) -> bool {
    matches!(
        err,
        ClientError::AuthenticationFailed(_) | ClientError::Device { .. }
    )
}
