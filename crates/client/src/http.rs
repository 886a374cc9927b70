//! HTTP seam between the transports and the network.
//!
//! Transports only ever issue POST requests and read back the status, the
//! cookies and the raw body, so the seam is a single method. The production
//! implementation is [`ReqwestChannel`]; tests plug in an in-process device.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use crate::error::{ClientError, Result};

/// Cookie carrying the device session id.
pub const SESSION_COOKIE: &str = "TP_SESSIONID";

/// Cookie carrying the session lifetime in seconds.
pub const TIMEOUT_COOKIE: &str = "TIMEOUT";

/// Cookie attributes that are not cookies themselves.
const COOKIE_ATTRIBUTES: &[&str] = &[
    "path", "domain", "expires", "max-age", "samesite", "secure", "httponly",
];

/// An outgoing POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Full URL including any query string.
    pub url: String,
    /// Extra headers.
    pub headers: Vec<(&'static str, String)>,
    /// Cookies sent in a single `Cookie` header.
    pub cookies: Vec<(String, String)>,
    /// Raw request body.
    pub body: Bytes,
}

impl HttpRequest {
    /// A JSON POST with the headers the passthrough endpoint expects.
    pub fn json(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            url: url.into(),
            headers: vec![
                ("Content-Type", "application/json".to_string()),
                ("Accept", "application/json".to_string()),
                ("requestByApp", "true".to_string()),
            ],
            cookies: Vec::new(),
            body: body.into(),
        }
    }

    /// A POST with an opaque binary body.
    pub fn binary(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            url: url.into(),
            headers: vec![("Content-Type", "application/octet-stream".to_string())],
            cookies: Vec::new(),
            body: body.into(),
        }
    }

    /// Attaches a cookie.
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    /// Looks up an attached cookie.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// A device reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Cookies set by the reply.
    pub cookies: HashMap<String, String>,
    /// Raw response body.
    pub body: Bytes,
}

impl HttpResponse {
    /// A response with the given status and body and no cookies.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            cookies: HashMap::new(),
            body: body.into(),
        }
    }

    /// Adds a cookie.
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Session lifetime announced by the `TIMEOUT` cookie.
    pub fn session_timeout(&self) -> Option<Duration> {
        self.cookie(TIMEOUT_COOKIE)
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// Parses one `Set-Cookie` header value into `cookies`.
///
/// Devices pack several cookies into one header
/// (`TP_SESSIONID=abc;TIMEOUT=86400`), so every `name=value` pair that is not
/// a cookie attribute is kept.
pub fn parse_set_cookie(header: &str, cookies: &mut HashMap<String, String>) {
    for part in header.split(';') {
        let Some((name, value)) = part.trim().split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() || COOKIE_ATTRIBUTES.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        cookies.insert(name.to_string(), value.trim().to_string());
    }
}

/// Issues HTTP POSTs to a device.
///
/// Implementations must be thread-safe; one channel is shared by every
/// transport a client creates.
pub trait HttpChannel: Send + Sync {
    /// Sends `request` and returns the reply whatever its status.
    fn post<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse>> + Send + 'a>>;
}

/// [`HttpChannel`] backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestChannel {
    client: reqwest::Client,
}

impl ReqwestChannel {
    /// Creates a channel whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Network(format!("failed to build http client: {}", e)))?;
        Ok(Self { client })
    }
}

impl HttpChannel for ReqwestChannel {
    fn post<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse>> + Send + 'a>> {
        Box::pin(async move {
            let mut builder = self.client.post(&request.url);
            for (name, value) in &request.headers {
                builder = builder.header(*name, value.as_str());
            }
            if let Some(cookie) = request.cookie_header() {
                builder = builder.header(reqwest::header::COOKIE, cookie);
            }

            let response = builder
                .body(request.body)
                .send()
                .await
                .map_err(map_reqwest_error)?;

            let status = response.status().as_u16();
            let mut cookies = HashMap::new();
            for value in response.headers().get_all(reqwest::header::SET_COOKIE) {
                if let Ok(value) = value.to_str() {
                    parse_set_cookie(value, &mut cookies);
                }
            }
            let body = response.bytes().await.map_err(map_reqwest_error)?;
            debug!(status, bytes = body.len(), "POST {}", strip_query(&request.url));

            Ok(HttpResponse {
                status,
                cookies,
                body,
            })
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ClientError {
    if err.is_timeout() {
        ClientError::Timeout(err.to_string())
    } else {
        ClientError::Network(err.to_string())
    }
}

/// Drops the query string, which may carry the session token.
fn strip_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(path, _)| path)
}
