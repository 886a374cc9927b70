//! Device list from the TP-Link cloud account.
//!
//! Logs in with the account credentials and fetches every device bound to
//! the account. This complements the UDP scan for devices on another subnet
//! or ones that do not answer broadcasts.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tapo_protocol::{Credential, TapoResponse};
use tracing::debug;

use crate::error::{ClientError, Result};
use crate::http::{HttpChannel, HttpRequest, ReqwestChannel};

/// TP-Link cloud API endpoint.
pub const CLOUD_URL: &str = "https://wap.tplinkcloud.com";

/// App type presented on cloud login.
const APP_TYPE: &str = "Tapo_Android";

/// A device registered on the cloud account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudDeviceInfo {
    pub device_type: String,
    pub role: i64,
    pub fw_ver: String,
    pub app_server_url: String,
    pub device_region: String,
    pub device_id: String,
    pub device_name: String,
    pub device_hw_ver: String,
    /// Base64 encoded nickname.
    pub alias: String,
    pub device_mac: String,
    pub oem_id: String,
    pub device_model: String,
    pub hw_id: String,
    pub fw_id: String,
    pub is_same_region: bool,
    pub status: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CloudLoginParams<'a> {
    app_type: &'a str,
    cloud_user_name: &'a str,
    cloud_password: &'a str,
    #[serde(rename = "terminalUUID")]
    terminal_uuid: String,
}

/// Client for the cloud device list.
pub struct CloudClient<C: HttpChannel = ReqwestChannel> {
    channel: C,
    url: String,
}

impl CloudClient<ReqwestChannel> {
    /// Creates a client for [`CLOUD_URL`].
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self::with_channel(ReqwestChannel::new(timeout)?, CLOUD_URL))
    }
}

impl<C: HttpChannel> CloudClient<C> {
    /// Creates a client that posts to `url` through `channel`.
    pub fn with_channel(channel: C, url: impl Into<String>) -> Self {
        Self {
            channel,
            url: url.into(),
        }
    }

    /// Logs in and returns every device on the account.
    ///
    /// Entries that cannot be read are skipped.
    pub async fn get_devices(&self, credential: &Credential) -> Result<Vec<CloudDeviceInfo>> {
        let token = self.login(credential).await?;
        self.device_list(&token).await
    }

    /// Logs in and returns the account token.
    pub async fn login(&self, credential: &Credential) -> Result<String> {
        let params = CloudLoginParams {
            app_type: APP_TYPE,
            cloud_user_name: &credential.username,
            cloud_password: &credential.password,
            terminal_uuid: uuid::Uuid::new_v4().to_string(),
        };
        let body = json!({ "method": "login", "params": params });

        let response = self.call(&self.url, &body).await?;
        if !response.is_success() {
            return Err(ClientError::AuthenticationFailed(format!(
                "cloud login rejected: {} ({})",
                response.msg, response.error_code
            )));
        }

        response
            .result
            .get("token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ClientError::MalformedResponse("cloud login reply has no token".to_string()))
    }

    /// Fetches the devices bound to the account behind `token`.
    pub async fn device_list(&self, token: &str) -> Result<Vec<CloudDeviceInfo>> {
        let url = format!("{}?token={}", self.url, token);
        let response = self.call(&url, &json!({ "method": "getDeviceList" })).await?;
        let response = ClientError::check(response)?;

        let entries = response
            .result
            .get("deviceList")
            .and_then(Value::as_array)
            .ok_or_else(|| ClientError::MalformedResponse("cloud reply has no deviceList".to_string()))?;

        let devices: Vec<CloudDeviceInfo> = entries
            .iter()
            .filter_map(|entry| match serde_json::from_value(entry.clone()) {
                Ok(device) => Some(device),
                Err(e) => {
                    debug!("Skipping unreadable cloud device entry: {}", e);
                    None
                }
            })
            .collect();
        debug!("Cloud account lists {} devices", devices.len());
        Ok(devices)
    }

    async fn call(&self, url: &str, body: &Value) -> Result<TapoResponse> {
        let reply = self
            .channel
            .post(HttpRequest::json(url, serde_json::to_vec(body)?))
            .await?;
        TapoResponse::from_slice(&reply.body).map_err(|e| {
            ClientError::MalformedResponse(format!("cloud reply (http {}): {}", reply.status, e))
        })
    }
}
