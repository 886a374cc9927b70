//! Request and response envelopes exchanged with devices.
//!
//! Requests are plain JSON objects `{"method", "params", ...}`. The passthrough
//! protocol wraps them, encrypted, inside an outer `securePassthrough`
//! request; KLAP sends them encrypted as the raw request body. Responses
//! always carry an `error_code`, where zero means success.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::crypto::sha1_hex_base64;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Username and password used to authenticate against a device.
///
/// Opaque to the transports, which derive their own encodings from it.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credential {
    /// Account username, usually an email address.
    pub username: String,
    /// Account password.
    pub password: String,
}

impl Credential {
    /// Creates a credential.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Encoding of the `login_device` parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginVersion {
    /// `{username, password}` with a base64 password.
    V1,
    /// `{username, password2}` with a hashed password.
    V2,
}

/// Parameters of the `login_device` method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginParams {
    /// base64 of the lowercase hex SHA-1 of the username.
    pub username: String,
    /// base64 of the raw password (v1 only).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub password: Option<String>,
    /// base64 of the lowercase hex SHA-1 of the password (v2 only).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub password2: Option<String>,
}

impl LoginParams {
    /// Encodes `credential` for the given login version.
    pub fn new(credential: &Credential, version: LoginVersion) -> Self {
        let username = sha1_hex_base64(&credential.username);
        match version {
            LoginVersion::V1 => Self {
                username,
                password: Some(BASE64.encode(credential.password.as_bytes())),
                password2: None,
            },
            LoginVersion::V2 => Self {
                username,
                password: None,
                password2: Some(sha1_hex_base64(&credential.password)),
            },
        }
    }
}

/// A device method call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapoRequest {
    /// Method name, e.g. `get_device_info`.
    pub method: String,
    /// Method parameters; serialized as `null` when absent.
    #[serde(default)]
    pub params: Option<Value>,
    /// Client clock in milliseconds at the time the request was sent.
    #[serde(
        rename = "requestTimeMils",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub request_time_millis: Option<i64>,
    /// Opaque per-session terminal identifier.
    #[serde(rename = "terminalUUID", skip_serializing_if = "Option::is_none", default)]
    pub terminal_uuid: Option<String>,
    /// Request id from the request id generator.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request_id: Option<i64>,
}

impl TapoRequest {
    /// Creates a request for an arbitrary method.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            request_time_millis: None,
            terminal_uuid: None,
            request_id: None,
        }
    }

    /// The passthrough `handshake` request carrying the client public key.
    pub fn handshake(public_key_pem: &str) -> Self {
        Self::new("handshake", Some(json!({ "key": public_key_pem })))
    }

    /// The `login_device` request.
    pub fn login(credential: &Credential, version: LoginVersion) -> Self {
        Self::new(
            "login_device",
            Some(json!(LoginParams::new(credential, version))),
        )
    }

    /// The outer `securePassthrough` envelope around an encrypted request.
    pub fn secure_passthrough(encrypted_request: &str) -> Self {
        Self::new(
            "securePassthrough",
            Some(json!({ "request": encrypted_request })),
        )
    }

    pub fn get_device_info() -> Self {
        Self::new("get_device_info", None)
    }

    pub fn get_device_usage() -> Self {
        Self::new("get_device_usage", None)
    }

    pub fn get_energy_usage() -> Self {
        Self::new("get_energy_usage", None)
    }

    pub fn get_current_power() -> Self {
        Self::new("get_current_power", None)
    }

    pub fn set_device_info(params: Value) -> Self {
        Self::new("set_device_info", Some(params))
    }

    pub fn get_child_device_list() -> Self {
        Self::new("get_child_device_list", None)
    }

    pub fn get_child_device_component_list() -> Self {
        Self::new("get_child_device_component_list", None)
    }

    /// Batches several requests into one `multipleRequest` call.
    pub fn multiple_request(requests: Vec<TapoRequest>) -> Self {
        Self::new("multipleRequest", Some(json!({ "requests": requests })))
    }

    /// Forwards `request` to the child device `device_id` through a hub.
    pub fn control_child(device_id: &str, request: TapoRequest) -> Self {
        Self::new(
            "control_child",
            Some(json!({ "device_id": device_id, "requestData": request })),
        )
    }

    pub fn with_request_time_millis(mut self, millis: i64) -> Self {
        self.request_time_millis = Some(millis);
        self
    }

    pub fn with_terminal_uuid(mut self, terminal_uuid: impl Into<String>) -> Self {
        self.terminal_uuid = Some(terminal_uuid.into());
        self
    }

    pub fn with_request_id(mut self, request_id: i64) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Serializes the request to a JSON string.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A device reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapoResponse {
    /// Zero on success, otherwise a device error code.
    pub error_code: i32,
    /// Method result, `null` when the device sent none.
    #[serde(default)]
    pub result: Value,
    /// Optional human readable message.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,
}

impl TapoResponse {
    /// A successful response carrying `result`.
    pub fn ok(result: Value) -> Self {
        Self {
            error_code: 0,
            result,
            msg: String::new(),
        }
    }

    /// A failed response with the given code.
    pub fn failure(code: i32) -> Self {
        Self {
            error_code: code,
            result: Value::Null,
            msg: String::new(),
        }
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_slice(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }

    /// The named error code, or `None` on success.
    pub fn error(&self) -> Option<ErrorCode> {
        (!self.is_success()).then(|| ErrorCode::from_code(self.error_code))
    }
}

/// Error codes reported by devices and by the client itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    AesDecodeFail,
    RequestLengthError,
    CloudFailed,
    ParamsError,
    InvalidPublicKey,
    SessionParamsError,
    InvalidCredentials,
    InvalidRequest,
    MalformedJson,
    NullTransport,
    CommandCancelled,
    TransportNotAvailable,
    HandshakeFailed,
    LoginFailed,
    HttpTransportFailed,
    MultiRequestFailed,
    SessionTimeout,
    DeviceBusy,
    Unknown(i32),
}

impl ErrorCode {
    pub fn from_code(code: i32) -> Self {
        match code {
            -1005 => Self::AesDecodeFail,
            -1006 => Self::RequestLengthError,
            -1007 => Self::CloudFailed,
            -1008 => Self::ParamsError,
            -1010 => Self::InvalidPublicKey,
            -1101 => Self::SessionParamsError,
            -1501 => Self::InvalidCredentials,
            -1002 => Self::InvalidRequest,
            -1003 => Self::MalformedJson,
            1000 => Self::NullTransport,
            1001 => Self::CommandCancelled,
            1002 => Self::TransportNotAvailable,
            1100 => Self::HandshakeFailed,
            1111 => Self::LoginFailed,
            1112 => Self::HttpTransportFailed,
            1200 => Self::MultiRequestFailed,
            9999 => Self::SessionTimeout,
            -1301 => Self::DeviceBusy,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::AesDecodeFail => -1005,
            Self::RequestLengthError => -1006,
            Self::CloudFailed => -1007,
            Self::ParamsError => -1008,
            Self::InvalidPublicKey => -1010,
            Self::SessionParamsError => -1101,
            Self::InvalidCredentials => -1501,
            Self::InvalidRequest => -1002,
            Self::MalformedJson => -1003,
            Self::NullTransport => 1000,
            Self::CommandCancelled => 1001,
            Self::TransportNotAvailable => 1002,
            Self::HandshakeFailed => 1100,
            Self::LoginFailed => 1111,
            Self::HttpTransportFailed => 1112,
            Self::MultiRequestFailed => 1200,
            Self::SessionTimeout => 9999,
            Self::DeviceBusy => -1301,
            Self::Unknown(code) => code,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::AesDecodeFail => "AES decode failed",
            Self::RequestLengthError => "request length error",
            Self::CloudFailed => "cloud request failed",
            Self::ParamsError => "invalid request params",
            Self::InvalidPublicKey => "invalid public key length",
            Self::SessionParamsError => "invalid session params",
            Self::InvalidCredentials => "invalid credentials",
            Self::InvalidRequest => "invalid request",
            Self::MalformedJson => "malformed json request",
            Self::NullTransport => "transport is not initialised",
            Self::CommandCancelled => "command cancelled",
            Self::TransportNotAvailable => "transport not available",
            Self::HandshakeFailed => "handshake failed",
            Self::LoginFailed => "login failed",
            Self::HttpTransportFailed => "http transport failed",
            Self::MultiRequestFailed => "multiple request failed",
            Self::SessionTimeout => "session timeout",
            Self::DeviceBusy => "device busy or rate limited",
            Self::Unknown(_) => "unknown error",
        }
    }

    /// Whether a fresh session and a retry may succeed.
    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::SessionTimeout | Self::DeviceBusy)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}
