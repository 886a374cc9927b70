//! Devices found by a discovery scan.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ClientError, Result};

/// Management encryption scheme advertised in a discovery reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionScheme {
    #[serde(default)]
    pub is_support_https: Option<bool>,
    /// `AES` for passthrough firmware, `KLAP` for newer firmware.
    #[serde(default)]
    pub encrypt_type: Option<String>,
    #[serde(default)]
    pub http_port: Option<u16>,
    /// Login version.
    #[serde(default = "default_login_version")]
    pub lv: Option<u32>,
}

fn default_login_version() -> Option<u32> {
    Some(1)
}

impl Default for EncryptionScheme {
    fn default() -> Self {
        Self {
            is_support_https: None,
            encrypt_type: None,
            http_port: None,
            lv: default_login_version(),
        }
    }
}

/// A device that answered a discovery probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub device_type: String,
    pub device_model: String,
    pub ip: String,
    pub mac: String,
    pub device_id: Option<String>,
    pub owner: Option<String>,
    pub hw_ver: Option<String>,
    pub is_support_iot_cloud: Option<bool>,
    pub obd_src: Option<String>,
    pub factory_default: Option<bool>,
    pub mgt_encrypt_schm: EncryptionScheme,
    /// Decrypted `encrypt_info` block, when the device sent one.
    pub extra_info: Option<Value>,
}

impl DiscoveredDevice {
    /// Builds a device from the `result` object of a discovery reply.
    ///
    /// Firmware generations name some fields differently; the first name
    /// present wins. `source` fills in the address when the reply has none.
    pub fn from_json(result: &Value, source: Option<IpAddr>) -> Result<Self> {
        let ip = string_field(result, &["ip", "alias"])
            .or_else(|| source.map(|addr| addr.to_string()))
            .ok_or_else(|| missing("ip"))?;

        let mgt_encrypt_schm = match result.get("mgt_encrypt_schm") {
            Some(scheme) if !scheme.is_null() => serde_json::from_value(scheme.clone())?,
            _ => EncryptionScheme::default(),
        };

        Ok(Self {
            device_type: string_field(result, &["device_type", "device_type_text"])
                .ok_or_else(|| missing("device_type"))?,
            device_model: string_field(result, &["device_model", "model"])
                .ok_or_else(|| missing("device_model"))?,
            ip,
            mac: string_field(result, &["mac"]).ok_or_else(|| missing("mac"))?,
            device_id: string_field(result, &["device_id", "device_id_hash"]),
            owner: string_field(result, &["owner", "device_owner_hash"]),
            hw_ver: string_field(result, &["hw_ver"]),
            is_support_iot_cloud: result.get("is_support_iot_cloud").and_then(Value::as_bool),
            obd_src: string_field(result, &["obd_src"]),
            factory_default: result.get("factory_default").and_then(Value::as_bool),
            mgt_encrypt_schm,
            extra_info: result.get("encrypt_info_clear").cloned(),
        })
    }

    /// Whether the device advertises KLAP.
    pub fn uses_klap(&self) -> bool {
        self.mgt_encrypt_schm
            .encrypt_type
            .as_deref()
            .map_or(false, |kind| kind.eq_ignore_ascii_case("klap"))
    }
}

fn string_field(value: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| value.get(*name).and_then(Value::as_str))
        .map(str::to_string)
}

fn missing(field: &str) -> ClientError {
    ClientError::MalformedResponse(format!("discovery reply has no {}", field))
}
