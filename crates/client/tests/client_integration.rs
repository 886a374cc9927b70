//! Integration tests for the tapo client.
//!
//! These tests drive the real transports against an in-process device that
//! implements the device side of both protocols with the real crypto:
//! - Passthrough handshake, login fallback and request envelope
//! - KLAP handshake, sequence signing and forbidden replies
//! - Protocol selection and bounded retry in the orchestrator
//! - UDP discovery against a loopback responder

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use rand::RngCore;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, Pkcs1v15Encrypt, RsaPublicKey};
use serde_json::{json, Value};
use tapo_client::http::{SESSION_COOKIE, TIMEOUT_COOKIE};
use tapo_client::{
    ApiClient, ClientError, ClientOptions, DiscoveryScanner, HttpChannel, HttpRequest,
    HttpResponse, Protocol, ProtocolPreference, TapoClient,
};
use tapo_protocol::crypto::sha1_hex_base64;
use tapo_protocol::klap::{auth_hash, handshake1_hash, handshake2_hash};
use tapo_protocol::{
    Credential, DiscoveryFrame, KlapCipher, PacketType, PassthroughCipher, TapoRequest,
};
use tokio::net::UdpSocket;

const DEVICE_HOST: &str = "device.test";
const DEVICE_URL: &str = "http://device.test:80/app";

fn account() -> Credential {
    Credential::new("owner@example.com", "correct horse")
}

// =============================================================================
// In-process device
// =============================================================================

struct KlapDeviceSession {
    local_seed: Vec<u8>,
    remote_seed: [u8; 16],
    confirmed: bool,
}

#[derive(Default)]
struct DeviceState {
    next_cookie: u32,
    passthrough_sessions: HashMap<String, PassthroughCipher>,
    tokens: HashMap<String, String>,
    klap_sessions: HashMap<String, KlapDeviceSession>,

    scripted_errors: VecDeque<i32>,
    scripted_login_errors: VecDeque<i32>,
    forbid_next_klap_request: bool,
    stale_klap_replies: bool,

    passthrough_handshakes: usize,
    klap_handshakes: usize,
    logins: Vec<&'static str>,
    requests: Vec<Value>,
    encrypted_requests: Vec<String>,
    klap_sequences: Vec<i32>,
}

impl DeviceState {
    fn new_cookie(&mut self) -> String {
        self.next_cookie += 1;
        format!("SESSION{:04}", self.next_cookie)
    }

    fn reply_for(&mut self, request: &Value) -> Value {
        if let Some(code) = self.scripted_errors.pop_front() {
            return json!({ "error_code": code });
        }
        if request["method"] == "control_child" {
            let child_request = &request["params"]["requestData"]["params"]["requests"][0];
            let child_method = child_request["method"].clone();
            return json!({
                "error_code": 0,
                "result": {
                    "responseData": {
                        "result": {
                            "responses": [
                                {"method": child_method, "result": {"child": true}, "error_code": 0}
                            ]
                        }
                    }
                }
            });
        }
        json!({
            "error_code": 0,
            "result": { "method": request["method"], "nickname": "bGFtcA==" }
        })
    }
}

struct FakeDevice {
    credential: Credential,
    klap_auth: [u8; 32],
    passthrough: bool,
    klap: bool,
    accept_v1: bool,
    session_timeout_secs: u64,
    session_key: Option<[u8; 32]>,
    state: Mutex<DeviceState>,
}

impl FakeDevice {
    fn passthrough(credential: Credential) -> Self {
        Self {
            klap_auth: auth_hash(&credential.username, &credential.password),
            credential,
            passthrough: true,
            klap: false,
            accept_v1: true,
            session_timeout_secs: 86_400,
            session_key: None,
            state: Mutex::new(DeviceState::default()),
        }
    }

    fn klap(credential: Credential) -> Self {
        Self {
            passthrough: false,
            klap: true,
            ..Self::passthrough(credential)
        }
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap()
    }

    fn handle(&self, request: HttpRequest) -> HttpResponse {
        let path = request
            .url
            .strip_prefix(DEVICE_URL)
            .unwrap_or(&request.url)
            .to_string();

        if let Some(seq) = path.strip_prefix("/request?seq=") {
            return self.klap_request(seq, &request);
        }
        match path.as_str() {
            "/handshake1" => self.klap_handshake1(&request),
            "/handshake2" => self.klap_handshake2(&request),
            _ => self.passthrough_call(&path, &request),
        }
    }

    fn passthrough_call(&self, path: &str, request: &HttpRequest) -> HttpResponse {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        match body["method"].as_str() {
            Some("handshake") => self.passthrough_handshake(&body),
            Some("securePassthrough") => self.secure_passthrough(path, request, &body),
            _ => json_reply(json!({ "error_code": -1002 })),
        }
    }

    fn passthrough_handshake(&self, body: &Value) -> HttpResponse {
        if !self.passthrough {
            return json_reply(json!({ "error_code": 1002 }));
        }

        let pem = body["params"]["key"].as_str().unwrap();
        let encoded: String = pem.lines().filter(|line| !line.starts_with("-----")).collect();
        let public_key = RsaPublicKey::from_public_key_der(&BASE64.decode(encoded).unwrap()).unwrap();

        let blob = self.session_key.unwrap_or_else(|| {
            let mut blob = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut blob);
            blob
        });
        let wrapped = public_key
            .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, &blob)
            .unwrap();

        let mut state = self.state();
        state.passthrough_handshakes += 1;
        let cookie = state.new_cookie();
        state
            .passthrough_sessions
            .insert(cookie.clone(), PassthroughCipher::from_session_key(&blob).unwrap());

        json_reply(json!({ "error_code": 0, "result": { "key": BASE64.encode(wrapped) } }))
            .with_cookie(SESSION_COOKIE, cookie)
            .with_cookie(TIMEOUT_COOKIE, self.session_timeout_secs.to_string())
    }

    fn secure_passthrough(&self, path: &str, request: &HttpRequest, body: &Value) -> HttpResponse {
        let cookie = request.cookie(SESSION_COOKIE).unwrap_or_default().to_string();
        let mut state = self.state();
        let Some(cipher) = state.passthrough_sessions.get(&cookie).cloned() else {
            return json_reply(json!({ "error_code": 9999 }));
        };

        let encrypted = body["params"]["request"].as_str().unwrap().to_string();
        let inner: Value = serde_json::from_str(&cipher.decrypt(&encrypted).unwrap()).unwrap();

        let response = if inner["method"] == "login_device" {
            self.login(&mut state, &inner["params"], &cookie)
        } else if path.strip_prefix("?token=") != state.tokens.get(&cookie).map(String::as_str) {
            json!({ "error_code": 9999 })
        } else {
            state.encrypted_requests.push(encrypted);
            state.requests.push(inner.clone());
            state.reply_for(&inner)
        };

        json_reply(json!({
            "error_code": 0,
            "result": { "response": cipher.encrypt(&response.to_string()).unwrap() }
        }))
    }

    fn login(&self, state: &mut DeviceState, params: &Value, cookie: &str) -> Value {
        if let Some(code) = state.scripted_login_errors.pop_front() {
            state.logins.push("scripted");
            return json!({ "error_code": code });
        }
        let username_ok = params["username"] == sha1_hex_base64(&self.credential.username);
        let accepted = if let Some(password) = params["password"].as_str() {
            state.logins.push("v1");
            self.accept_v1
                && username_ok
                && password == BASE64.encode(self.credential.password.as_bytes())
        } else {
            state.logins.push("v2");
            username_ok && params["password2"] == sha1_hex_base64(&self.credential.password)
        };
        if !accepted {
            return json!({ "error_code": -1501 });
        }

        let token = format!("TOKEN-{}", cookie);
        state.tokens.insert(cookie.to_string(), token.clone());
        json!({ "error_code": 0, "result": { "token": token } })
    }

    fn klap_handshake1(&self, request: &HttpRequest) -> HttpResponse {
        if !self.klap {
            return HttpResponse::new(404, Bytes::new());
        }

        let local_seed = request.body.to_vec();
        let mut remote_seed = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut remote_seed);
        let server_hash = handshake1_hash(&local_seed, &remote_seed, &self.klap_auth);

        let mut state = self.state();
        state.klap_handshakes += 1;
        let cookie = state.new_cookie();
        state.klap_sessions.insert(
            cookie.clone(),
            KlapDeviceSession {
                local_seed,
                remote_seed,
                confirmed: false,
            },
        );

        let mut body = remote_seed.to_vec();
        body.extend_from_slice(&server_hash);
        HttpResponse::new(200, body)
            .with_cookie(SESSION_COOKIE, cookie)
            .with_cookie(TIMEOUT_COOKIE, self.session_timeout_secs.to_string())
    }

    fn klap_handshake2(&self, request: &HttpRequest) -> HttpResponse {
        let cookie = request.cookie(SESSION_COOKIE).unwrap_or_default();
        let mut state = self.state();
        let Some(session) = state.klap_sessions.get_mut(cookie) else {
            return HttpResponse::new(400, Bytes::new());
        };

        let expected = handshake2_hash(&session.local_seed, &session.remote_seed, &self.klap_auth);
        if request.body.as_ref() != expected.as_slice() {
            return HttpResponse::new(403, Bytes::new());
        }
        session.confirmed = true;
        HttpResponse::new(200, Bytes::new())
    }

    fn klap_request(&self, seq: &str, request: &HttpRequest) -> HttpResponse {
        let seq: i32 = seq.parse().unwrap();
        let cookie = request.cookie(SESSION_COOKIE).unwrap_or_default();
        let mut state = self.state();

        let cipher = match state.klap_sessions.get(cookie) {
            Some(session) if session.confirmed => {
                KlapCipher::new(&session.local_seed, &session.remote_seed, &self.klap_auth)
            }
            _ => return HttpResponse::new(403, Bytes::new()),
        };
        if state.forbid_next_klap_request {
            state.forbid_next_klap_request = false;
            return HttpResponse::new(403, Bytes::new());
        }

        assert!(cipher.verify(seq, &request.body), "request signature mismatch");
        let inner: Value = serde_json::from_slice(&cipher.open(seq, &request.body).unwrap()).unwrap();
        state.klap_sequences.push(seq);
        state.requests.push(inner.clone());
        let response = state.reply_for(&inner);

        let reply_seq = if state.stale_klap_replies {
            seq.wrapping_sub(1)
        } else {
            seq
        };
        HttpResponse::new(
            200,
            cipher.seal(reply_seq, response.to_string().as_bytes()).unwrap(),
        )
    }
}

fn json_reply(body: Value) -> HttpResponse {
    HttpResponse::new(200, body.to_string())
}

/// Shares one device between a client and the test body.
struct DeviceHandle(Arc<FakeDevice>);

impl HttpChannel for DeviceHandle {
    fn post<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = tapo_client::Result<HttpResponse>> + Send + 'a>> {
        let response = self.0.handle(request);
        Box::pin(async move { Ok(response) })
    }
}

fn client_for(
    device: &Arc<FakeDevice>,
    protocol: ProtocolPreference,
    max_retries: u32,
) -> TapoClient<DeviceHandle> {
    TapoClient::with_channel(
        DeviceHandle(Arc::clone(device)),
        DEVICE_HOST,
        account(),
        ClientOptions {
            protocol,
            max_retries,
            ..ClientOptions::default()
        },
    )
}

// =============================================================================
// Passthrough Tests
// =============================================================================

#[tokio::test]
async fn test_passthrough_round_trip() {
    let device = Arc::new(FakeDevice::passthrough(account()));
    let client = client_for(&device, ProtocolPreference::Passthrough, 3);

    let response = client.send(&TapoRequest::get_device_info()).await.unwrap();

    assert_eq!(response.error_code, 0);
    assert_eq!(response.result["method"], "get_device_info");
    assert_eq!(client.protocol().await, Some(Protocol::Passthrough));

    let state = device.state();
    assert_eq!(state.passthrough_handshakes, 1);
    assert_eq!(state.logins, vec!["v1"]);
}

#[tokio::test]
async fn test_passthrough_requests_carry_metadata() {
    let device = Arc::new(FakeDevice::passthrough(account()));
    let client = client_for(&device, ProtocolPreference::Passthrough, 3);

    client.send(&TapoRequest::get_device_info()).await.unwrap();
    client.send(&TapoRequest::get_device_usage()).await.unwrap();

    let state = device.state();
    assert_eq!(state.requests.len(), 2);
    let (first, second) = (&state.requests[0], &state.requests[1]);
    assert!(first["request_id"].is_i64());
    assert!(first["requestTimeMils"].is_i64());
    assert!(second["request_id"].as_i64() > first["request_id"].as_i64());
    assert!(first["terminalUUID"].is_string());
    assert_eq!(first["terminalUUID"], second["terminalUUID"]);
    // One session serves both calls
    assert_eq!(state.passthrough_handshakes, 1);
}

#[tokio::test]
async fn test_passthrough_uses_handshake_key_blob() {
    let blob: [u8; 32] = std::array::from_fn(|i| i as u8);
    let device = Arc::new(FakeDevice {
        session_key: Some(blob),
        ..FakeDevice::passthrough(account())
    });
    let client = client_for(&device, ProtocolPreference::Passthrough, 3);

    client.send(&TapoRequest::get_device_info()).await.unwrap();

    let state = device.state();
    let sent = &state.encrypted_requests[0];
    let fixture = PassthroughCipher::new(
        std::array::from_fn(|i| i as u8),
        std::array::from_fn(|i| (i + 16) as u8),
    );
    let plaintext = fixture.decrypt(sent).unwrap();
    assert!(plaintext.contains(r#""method":"get_device_info""#));
    // Re-encrypting under the fixture key reproduces the wire bytes exactly
    assert_eq!(&fixture.encrypt(&plaintext).unwrap(), sent);
}

#[tokio::test]
async fn test_login_falls_back_to_v2() {
    let device = Arc::new(FakeDevice {
        accept_v1: false,
        ..FakeDevice::passthrough(account())
    });
    let client = client_for(&device, ProtocolPreference::Passthrough, 3);

    client.send(&TapoRequest::get_device_info()).await.unwrap();

    let state = device.state();
    assert_eq!(state.logins, vec!["v1", "v2"]);
    // Each login runs on a fresh handshake
    assert_eq!(state.passthrough_handshakes, 2);
}

#[tokio::test]
async fn test_login_rejected_by_both_versions() {
    let device = Arc::new(FakeDevice::passthrough(Credential::new(
        "owner@example.com",
        "another password",
    )));
    let client = client_for(&device, ProtocolPreference::Passthrough, 3);

    let err = client.send(&TapoRequest::get_device_info()).await.unwrap_err();

    assert!(matches!(err, ClientError::AuthenticationFailed(_)));
    assert_eq!(device.state().logins, vec!["v1", "v2"]);
}

#[tokio::test]
async fn test_short_session_lifetime_fails_handshake() {
    let device = Arc::new(FakeDevice {
        session_timeout_secs: 30,
        ..FakeDevice::passthrough(account())
    });
    let client = client_for(&device, ProtocolPreference::Passthrough, 3);

    let err = client.send(&TapoRequest::get_device_info()).await.unwrap_err();

    assert!(matches!(err, ClientError::HandshakeFailed(_)));
    assert_eq!(device.state().passthrough_handshakes, 3);
    assert!(device.state().logins.is_empty());
}

#[tokio::test]
async fn test_close_forces_new_handshake() {
    let device = Arc::new(FakeDevice::passthrough(account()));
    let client = client_for(&device, ProtocolPreference::Passthrough, 3);

    client.send(&TapoRequest::get_device_info()).await.unwrap();
    client.close().await;
    client.send(&TapoRequest::get_device_info()).await.unwrap();

    assert_eq!(device.state().passthrough_handshakes, 2);
    assert_eq!(client.protocol().await, Some(Protocol::Passthrough));
}

// =============================================================================
// Retry Tests
// =============================================================================

#[tokio::test]
async fn test_retries_are_bounded() {
    let device = Arc::new(FakeDevice::passthrough(account()));
    device.state().scripted_errors = std::iter::repeat(9999).take(10).collect();
    let client = client_for(&device, ProtocolPreference::Passthrough, 3);

    let err = client.send(&TapoRequest::get_device_info()).await.unwrap_err();

    assert!(matches!(err, ClientError::SessionTimeout));
    let state = device.state();
    // One initial attempt plus three retries, each on a new session
    assert_eq!(state.requests.len(), 4);
    assert_eq!(state.passthrough_handshakes, 4);
}

#[tokio::test]
async fn test_busy_device_recovers_on_retry() {
    let device = Arc::new(FakeDevice::passthrough(account()));
    device.state().scripted_errors = VecDeque::from([-1301]);
    let client = client_for(&device, ProtocolPreference::Passthrough, 3);

    let response = client.send(&TapoRequest::get_device_info()).await.unwrap();

    assert_eq!(response.error_code, 0);
    assert_eq!(device.state().passthrough_handshakes, 2);
}

#[tokio::test]
async fn test_zero_retries_returns_first_failure() {
    let device = Arc::new(FakeDevice::passthrough(account()));
    device.state().scripted_errors = VecDeque::from([9999]);
    let client = client_for(&device, ProtocolPreference::Passthrough, 0);

    let err = client.send(&TapoRequest::get_device_info()).await.unwrap_err();

    assert!(matches!(err, ClientError::SessionTimeout));
    assert_eq!(device.state().requests.len(), 1);
}

#[tokio::test]
async fn test_non_recoverable_error_is_not_retried() {
    let device = Arc::new(FakeDevice::passthrough(account()));
    device.state().scripted_errors = VecDeque::from([-1008]);
    let client = client_for(&device, ProtocolPreference::Passthrough, 3);

    let err = client.send(&TapoRequest::get_device_info()).await.unwrap_err();

    assert!(matches!(err, ClientError::Device { code: -1008, .. }));
    assert_eq!(device.state().passthrough_handshakes, 1);
}

// =============================================================================
// Protocol Selection Tests
// =============================================================================

#[tokio::test]
async fn test_auto_prefers_passthrough() {
    let device = Arc::new(FakeDevice::passthrough(account()));
    let client = client_for(&device, ProtocolPreference::Auto, 3);

    assert_eq!(client.login().await.unwrap(), Protocol::Passthrough);
    client.send(&TapoRequest::get_device_info()).await.unwrap();

    // The probe session is kept for the first call
    assert_eq!(device.state().passthrough_handshakes, 1);
}

#[tokio::test]
async fn test_auto_falls_back_to_klap() {
    let device = Arc::new(FakeDevice::klap(account()));
    let client = client_for(&device, ProtocolPreference::Auto, 3);

    let response = client.send(&TapoRequest::get_device_info()).await.unwrap();

    assert_eq!(response.result["method"], "get_device_info");
    assert_eq!(client.protocol().await, Some(Protocol::Klap));
    let state = device.state();
    assert_eq!(state.passthrough_handshakes, 0);
    assert_eq!(state.klap_handshakes, 1);
}

#[tokio::test]
async fn test_auto_login_failure_pins_passthrough() {
    let device = Arc::new(FakeDevice::passthrough(Credential::new("someone", "else")));
    let client = client_for(&device, ProtocolPreference::Auto, 3);

    assert!(matches!(
        client.send(&TapoRequest::get_device_info()).await,
        Err(ClientError::AuthenticationFailed(_))
    ));
    assert_eq!(client.protocol().await, Some(Protocol::Passthrough));
    assert_eq!(device.state().passthrough_handshakes, 2);
}

#[tokio::test]
async fn test_auto_busy_login_is_retried() {
    let device = Arc::new(FakeDevice::passthrough(account()));
    device.state().scripted_login_errors = VecDeque::from([-1301]);
    let client = client_for(&device, ProtocolPreference::Auto, 3);

    let response = client.send(&TapoRequest::get_device_info()).await.unwrap();

    assert_eq!(response.result["method"], "get_device_info");
    assert_eq!(client.protocol().await, Some(Protocol::Passthrough));
    let state = device.state();
    assert_eq!(state.logins, vec!["scripted", "v1"]);
    assert_eq!(state.passthrough_handshakes, 2);
    assert_eq!(state.klap_handshakes, 0);
}

#[tokio::test]
async fn test_auto_timeouts_share_retry_budget() {
    let device = Arc::new(FakeDevice::passthrough(account()));
    device.state().scripted_login_errors = std::iter::repeat(9999).take(10).collect();
    let client = client_for(&device, ProtocolPreference::Auto, 2);

    let err = client.send(&TapoRequest::get_device_info()).await.unwrap_err();

    assert!(matches!(err, ClientError::SessionTimeout));
    let state = device.state();
    // The detection login counts as the first attempt
    assert_eq!(state.passthrough_handshakes, 3);
    assert!(state.requests.is_empty());
}

// =============================================================================
// KLAP Tests
// =============================================================================

#[tokio::test]
async fn test_klap_sequence_advances_per_request() {
    let device = Arc::new(FakeDevice::klap(account()));
    let client = client_for(&device, ProtocolPreference::Klap, 3);

    client.send(&TapoRequest::get_device_info()).await.unwrap();
    client.send(&TapoRequest::get_current_power()).await.unwrap();

    let state = device.state();
    assert_eq!(state.klap_handshakes, 1);
    assert_eq!(state.klap_sequences.len(), 2);
    assert_eq!(state.klap_sequences[1], state.klap_sequences[0].wrapping_add(1));
    assert_eq!(state.requests[1]["method"], "get_current_power");
}

#[tokio::test]
async fn test_klap_accepts_blank_credential_fallback() {
    let device = Arc::new(FakeDevice {
        klap_auth: auth_hash("", ""),
        ..FakeDevice::klap(account())
    });
    let client = client_for(&device, ProtocolPreference::Klap, 3);

    assert!(client.send(&TapoRequest::get_device_info()).await.is_ok());
}

#[tokio::test]
async fn test_klap_unknown_credential_fails_handshake() {
    let device = Arc::new(FakeDevice {
        klap_auth: auth_hash("stranger@example.com", "nope"),
        ..FakeDevice::klap(account())
    });
    let client = client_for(&device, ProtocolPreference::Klap, 3);

    let err = client.send(&TapoRequest::get_device_info()).await.unwrap_err();

    assert!(matches!(err, ClientError::HandshakeFailed(_)));
    assert_eq!(device.state().klap_handshakes, 1);
}

#[tokio::test]
async fn test_klap_forbidden_invalidates_session() {
    let device = Arc::new(FakeDevice::klap(account()));
    let client = client_for(&device, ProtocolPreference::Klap, 3);
    client.send(&TapoRequest::get_device_info()).await.unwrap();

    device.state().forbid_next_klap_request = true;
    let err = client.send(&TapoRequest::get_device_info()).await.unwrap_err();
    assert!(matches!(err, ClientError::ForbiddenAfterHandshake));

    client.send(&TapoRequest::get_device_info()).await.unwrap();
    assert_eq!(device.state().klap_handshakes, 2);
}

#[tokio::test]
async fn test_klap_reply_under_stale_sequence_is_rejected() {
    let device = Arc::new(FakeDevice::klap(account()));
    device.state().stale_klap_replies = true;
    let client = client_for(&device, ProtocolPreference::Klap, 3);

    let err = client.send(&TapoRequest::get_device_info()).await.unwrap_err();

    assert!(matches!(err, ClientError::MalformedResponse(_)));
}

#[tokio::test]
async fn test_klap_short_session_rehandshakes() {
    let device = Arc::new(FakeDevice {
        session_timeout_secs: 30,
        ..FakeDevice::klap(account())
    });
    let client = client_for(&device, ProtocolPreference::Klap, 3);

    client.send(&TapoRequest::get_device_info()).await.unwrap();
    client.send(&TapoRequest::get_device_info()).await.unwrap();

    assert_eq!(device.state().klap_handshakes, 2);
}

#[tokio::test]
async fn test_klap_retry_uses_new_handshake() {
    let device = Arc::new(FakeDevice::klap(account()));
    device.state().scripted_errors = VecDeque::from([9999]);
    let client = client_for(&device, ProtocolPreference::Klap, 3);

    client.send(&TapoRequest::get_device_info()).await.unwrap();

    assert_eq!(device.state().klap_handshakes, 2);
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_session() {
    let device = Arc::new(FakeDevice::passthrough(account()));
    let client = Arc::new(client_for(&device, ProtocolPreference::Auto, 3));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.send(&TapoRequest::get_device_info()).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let state = device.state();
    assert_eq!(state.passthrough_handshakes, 1);
    assert_eq!(state.requests.len(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_retry_is_atomic() {
    let device = Arc::new(FakeDevice::passthrough(account()));
    device.state().scripted_errors = VecDeque::from([9999]);
    let client = Arc::new(client_for(&device, ProtocolPreference::Passthrough, 3));

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.send(&TapoRequest::get_device_info()).await })
        })
        .collect();
    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }

    // One expired session is replaced exactly once
    assert_eq!(device.state().passthrough_handshakes, 2);
}

// =============================================================================
// Device API Tests
// =============================================================================

#[tokio::test]
async fn test_api_control_child_unwraps_response() {
    let device = Arc::new(FakeDevice::passthrough(account()));
    let api = ApiClient::new(client_for(&device, ProtocolPreference::Passthrough, 3));

    let result = api
        .control_child("child-1", TapoRequest::get_device_info())
        .await
        .unwrap();

    assert_eq!(result, json!({ "child": true }));
    let state = device.state();
    let sent = &state.requests[0];
    assert_eq!(sent["method"], "control_child");
    assert_eq!(sent["params"]["device_id"], "child-1");
    assert_eq!(sent["params"]["requestData"]["method"], "multipleRequest");
}

#[tokio::test]
async fn test_api_get_device_info() {
    let device = Arc::new(FakeDevice::klap(account()));
    let api = ApiClient::new(client_for(&device, ProtocolPreference::Auto, 3));

    let info = api.get_device_info().await.unwrap();

    assert_eq!(info["nickname"], "bGFtcA==");
}

#[tokio::test]
async fn test_api_execute_raw_returns_envelope() {
    let device = Arc::new(FakeDevice::passthrough(account()));
    let api = ApiClient::new(client_for(&device, ProtocolPreference::Passthrough, 3));

    let response = api
        .execute_raw(&TapoRequest::new("get_energy_usage", None))
        .await
        .unwrap();

    assert!(response.is_success());
    assert_eq!(response.result["method"], "get_energy_usage");
}

// =============================================================================
// Discovery Tests
// =============================================================================

/// Answers one probe with a corrupt frame, an error reply and a real reply.
async fn run_responder(socket: UdpSocket) {
    let mut buf = vec![0u8; 4096];
    let (len, probe_source) = socket.recv_from(&mut buf).await.unwrap();

    let probe = DiscoveryFrame::decode(&buf[..len]).unwrap();
    assert_eq!(probe.packet_type, PacketType::Request);
    let pem = probe.json().unwrap()["params"]["rsa_key"]
        .as_str()
        .unwrap()
        .to_string();
    let public_key = RsaPublicKey::from_public_key_pem(&pem).unwrap();

    let blob: Vec<u8> = (100u8..132).collect();
    let wrapped = public_key
        .encrypt(&mut rand::thread_rng(), Oaep::new::<sha1::Sha1>(), &blob)
        .unwrap();
    let data = PassthroughCipher::from_session_key(&blob)
        .unwrap()
        .encrypt(r#"{"nickname":"porch"}"#)
        .unwrap();

    let mut corrupt = DiscoveryFrame::from_json(PacketType::Response, &json!({"error_code": 0}))
        .unwrap()
        .encode()
        .unwrap();
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0xFF;

    let refused = DiscoveryFrame::from_json(
        PacketType::Response,
        &json!({"error_code": -40401, "result": {}}),
    )
    .unwrap()
    .encode()
    .unwrap();

    let device = DiscoveryFrame::from_json(
        PacketType::Response,
        &json!({
            "error_code": 0,
            "result": {
                "device_type": "SMART.TAPOPLUG",
                "device_model": "P110",
                "mac": "AA-BB-CC-DD-EE-FF",
                "device_id": "dev-1",
                "mgt_encrypt_schm": {"encrypt_type": "KLAP", "http_port": 80, "lv": 2},
                "encrypt_info": {"sym_schm": "AES", "key": BASE64.encode(wrapped), "data": data}
            }
        }),
    )
    .unwrap()
    .encode()
    .unwrap();

    for datagram in [corrupt, refused, device] {
        socket.send_to(&datagram, probe_source).await.unwrap();
    }
}

#[tokio::test]
async fn test_discovery_against_loopback_responder() {
    let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = responder.local_addr().unwrap().port();
    let responder_task = tokio::spawn(run_responder(responder));

    let devices = DiscoveryScanner::new()
        .broadcast_address("127.0.0.1")
        .port(port)
        .timeout(Duration::from_secs(2))
        .scan()
        .await
        .unwrap()
        .collect()
        .await;
    responder_task.await.unwrap();

    assert_eq!(devices.len(), 1);
    let device = &devices[0];
    assert_eq!(device.device_model, "P110");
    assert_eq!(device.ip, "127.0.0.1");
    assert!(device.uses_klap());
    assert_eq!(device.extra_info, Some(json!({"nickname": "porch"})));
}

#[tokio::test]
async fn test_discovery_scan_ends_at_timeout() {
    // Nothing listens on the target port
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = silent.local_addr().unwrap().port();

    let started = std::time::Instant::now();
    let devices = DiscoveryScanner::new()
        .broadcast_address("127.0.0.1")
        .port(port)
        .timeout(Duration::from_millis(300))
        .scan()
        .await
        .unwrap()
        .collect()
        .await;

    assert!(devices.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(300));
}
