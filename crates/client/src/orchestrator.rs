//! Client orchestrator: protocol selection and bounded retry.
//!
//! `TapoClient` owns the single active [`Transport`] behind an async mutex.
//! A call holds the lock for its whole ensure-session, send, invalidate and
//! resend sequence, so no other caller on the same client observes a
//! half-invalidated session.

use std::sync::Arc;
use std::time::Duration;

use tapo_protocol::{Credential, TapoRequest, TapoResponse};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::http::{HttpChannel, ReqwestChannel};
use crate::transport::{
    KlapTransport, PassthroughTransport, Protocol, ProtocolPreference, Transport,
};

/// Default number of retries after a recoverable failure.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default HTTP port of the device API.
pub const DEFAULT_PORT: u16 = 80;

/// Connection options for a [`TapoClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// HTTP port of the device.
    pub port: u16,
    /// Protocol to use, or `Auto` to probe.
    pub protocol: ProtocolPreference,
    /// Retries after a recoverable failure.
    pub max_retries: u32,
    /// Timeout applied to every HTTP request.
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            protocol: ProtocolPreference::Auto,
            max_retries: DEFAULT_MAX_RETRIES,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// A client for one device.
pub struct TapoClient<C: HttpChannel = ReqwestChannel> {
    channel: Arc<C>,
    url: String,
    credential: Credential,
    options: ClientOptions,
    transport: Mutex<Option<Transport<C>>>,
}

impl TapoClient<ReqwestChannel> {
    /// Creates a client for `host` over HTTP.
    pub fn new(host: &str, credential: Credential, options: ClientOptions) -> Result<Self> {
        let channel = ReqwestChannel::new(options.request_timeout)?;
        Ok(Self::with_channel(channel, host, credential, options))
    }
}

impl<C: HttpChannel> TapoClient<C> {
    /// Creates a client that posts through `channel`.
    pub fn with_channel(
        channel: C,
        host: &str,
        credential: Credential,
        options: ClientOptions,
    ) -> Self {
        Self {
            channel: Arc::new(channel),
            url: format!("http://{}:{}/app", host, options.port),
            credential,
            options,
            transport: Mutex::new(None),
        }
    }

    /// Base URL of the device API.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The pinned protocol, once one has been chosen.
    pub async fn protocol(&self) -> Option<Protocol> {
        self.transport.lock().await.as_ref().map(Transport::protocol)
    }

    /// Establishes a session without sending a request.
    pub async fn login(&self) -> Result<Protocol> {
        let mut slot = self.transport.lock().await;
        let (transport, probe_failure) = self.pin_transport(&mut slot).await;
        if let Some(err) = probe_failure {
            return Err(err);
        }
        transport.ensure_session().await?;
        Ok(transport.protocol())
    }

    /// Sends `request` with the configured retry budget.
    pub async fn send(&self, request: &TapoRequest) -> Result<TapoResponse> {
        self.send_request(request, self.options.max_retries).await
    }

    /// Sends `request`, retrying up to `max_retries` times on session
    /// timeout or rate limiting with a fresh session each time.
    ///
    /// Any other failure is returned at once. When the budget is exhausted
    /// the last failure is returned.
    pub async fn send_request(
        &self,
        request: &TapoRequest,
        max_retries: u32,
    ) -> Result<TapoResponse> {
        let mut slot = self.transport.lock().await;
        let (transport, mut probe_failure) = self.pin_transport(&mut slot).await;

        let mut retries_left = max_retries;
        loop {
            let outcome = match probe_failure.take() {
                Some(err) => Err(err),
                None => match transport.send(request).await {
                    Ok(response) => ClientError::check(response),
                    Err(err) => Err(err),
                },
            };
            match outcome {
                Ok(response) => return Ok(response),
                Err(err) if err.is_recoverable() && retries_left > 0 => {
                    retries_left -= 1;
                    warn!(
                        method = %request.method,
                        retries_left,
                        "{}, retrying with a new session",
                        err
                    );
                    transport.invalidate();
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Drops the current session. The pinned protocol is kept.
    pub async fn close(&self) {
        if let Some(transport) = self.transport.lock().await.as_mut() {
            transport.invalidate();
        }
    }

    /// Returns the pinned transport, choosing one first if needed.
    ///
    /// When the passthrough probe picks the protocol, its failure (if any)
    /// is handed back so the caller can count it as the first attempt.
    async fn pin_transport<'a>(
        &self,
        slot: &'a mut Option<Transport<C>>,
    ) -> (&'a mut Transport<C>, Option<ClientError>) {
        match slot.take() {
            Some(transport) => (slot.insert(transport), None),
            None => {
                let (transport, probe_failure) = self.select_transport().await;
                (slot.insert(transport), probe_failure)
            }
        }
    }

    async fn select_transport(&self) -> (Transport<C>, Option<ClientError>) {
        let (transport, probe_failure) = match self.options.protocol {
            ProtocolPreference::Passthrough => (Transport::Passthrough(self.passthrough()), None),
            ProtocolPreference::Klap => (Transport::Klap(self.klap()), None),
            ProtocolPreference::Auto => {
                let mut probe = self.passthrough();
                match probe.ensure_session().await {
                    Ok(()) => (Transport::Passthrough(probe), None),
                    Err(ClientError::TransportNotAvailable) => {
                        debug!("Passthrough not available on {}", self.url);
                        (Transport::Klap(self.klap()), None)
                    }
                    Err(err) => {
                        debug!("Passthrough probe failed on {}: {}", self.url, err);
                        (Transport::Passthrough(probe), Some(err))
                    }
                }
            }
        };
        info!("Using {} protocol for {}", transport.protocol(), self.url);
        (transport, probe_failure)
    }

    fn passthrough(&self) -> PassthroughTransport<C> {
        PassthroughTransport::new(
            Arc::clone(&self.channel),
            self.url.clone(),
            self.credential.clone(),
        )
    }

    fn klap(&self) -> KlapTransport<C> {
        KlapTransport::new(
            Arc::clone(&self.channel),
            self.url.clone(),
            self.credential.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = ClientOptions::default();
        assert_eq!(options.port, 80);
        assert_eq!(options.max_retries, 3);
        assert_eq!(options.protocol, ProtocolPreference::Auto);
    }

    #[test]
    fn test_url_includes_port() {
        let client = TapoClient::new(
            "192.168.1.20",
            Credential::new("u", "p"),
            ClientOptions {
                port: 8080,
                ..ClientOptions::default()
            },
        )
        .unwrap();
        assert_eq!(client.url(), "http://192.168.1.20:8080/app");
    }

    #[tokio::test]
    async fn test_protocol_unpinned_before_first_call() {
        let client =
            TapoClient::new("127.0.0.1", Credential::default(), ClientOptions::default()).unwrap();
        assert_eq!(client.protocol().await, None);
    }
}
