//! HTTP client for the Brimble license service.
//!
//! Two endpoints: `GET /v1/license/setup` hands back the (encrypted)
//! database URI, mesh token, and the device cap for the license;
//! `POST /v1/license` validates or registers a single machine and
//! returns the subscription that scopes its host record.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://core.brimble.io";

const LICENSE_KEY_HEADER: &str = "X-Brimble-Key";
const SETUP_TYPE_HEADER: &str = "X-Setup-Type";

/// Setup parameters for a license. `db_uri` and `tailscale_token` are
/// still encrypted; see [`super::crypto::decrypt`].
#[derive(Debug, Clone, Deserialize)]
pub struct SetupConfiguration {
    pub valid: bool,
    pub max_devices: usize,
    #[serde(rename = "dbUri", default)]
    pub db_uri: String,
    #[serde(rename = "tailScaleToken", default)]
    pub tailscale_token: String,
}

/// Subscription a validated device is scoped to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub plan_type: String,
    #[serde(default)]
    pub status: String,
}

/// Per-device validation response.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceLicense {
    pub valid: bool,
    #[serde(default)]
    pub key: String,
    #[serde(rename = "expireIn", default)]
    pub expire_in: Option<String>,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub subscription: Subscription,
}

/// The response used when the service cannot be reached: never valid,
/// so the worker fails closed.
pub fn invalid_license() -> DeviceLicense {
    DeviceLicense {
        valid: false,
        key: String::new(),
        expire_in: None,
        tag: String::new(),
        subscription: Subscription::default(),
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Serialize)]
struct DeviceInfo<'a> {
    #[serde(rename = "deviceId")]
    device_id: &'a str,
    hostname: &'a str,
}

#[derive(Debug, Serialize)]
struct DevicePayload<'a> {
    #[serde(rename = "deviceInfo")]
    device_info: DeviceInfo<'a>,
}

/// Client for the license endpoints, bound to one license key.
#[derive(Clone)]
pub struct LicenseClient {
    http: reqwest::Client,
    base_url: String,
    license_key: String,
}

impl LicenseClient {
    pub fn new(license_key: &str) -> Result<Self> {
        Self::with_base_url(license_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(license_key: &str, base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            license_key: license_key.to_string(),
        })
    }

    pub fn license_key(&self) -> &str {
        &self.license_key
    }

    /// Fetch the setup parameters for this license. An invalid license is
    /// fatal to the run.
    pub async fn setup_configurations(&self) -> Result<SetupConfiguration> {
        let url = format!("{}/v1/license/setup", self.base_url);
        let response: Envelope<SetupConfiguration> = self
            .http
            .get(&url)
            .header("Content-Type", "application/json")
            .header(LICENSE_KEY_HEADER, &self.license_key)
            .header(SETUP_TYPE_HEADER, "installation")
            .send()
            .await
            .context("license setup request failed")?
            .json()
            .await
            .context("failed to decode license setup response")?;

        if !response.data.valid {
            bail!("invalid license key");
        }

        Ok(response.data)
    }

    /// Validate (or register) a machine against the license.
    pub async fn validate_device(
        &self,
        machine_id: &str,
        hostname: &str,
    ) -> Result<DeviceLicense> {
        let url = format!("{}/v1/license", self.base_url);
        let payload = DevicePayload {
            device_info: DeviceInfo {
                device_id: machine_id,
                hostname,
            },
        };

        let response: Envelope<DeviceLicense> = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header(LICENSE_KEY_HEADER, &self.license_key)
            .header(SETUP_TYPE_HEADER, "installation")
            .json(&payload)
            .send()
            .await
            .context("license validation request failed")?
            .json()
            .await
            .context("failed to decode license validation response")?;

        Ok(response.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_response_decodes_wire_shape() {
        let raw = r#"{"data":{"valid":true,"max_devices":5,"dbUri":"enc-db","tailScaleToken":"enc-ts"}}"#;
        let envelope: Envelope<SetupConfiguration> = serde_json::from_str(raw).unwrap();
        assert!(envelope.data.valid);
        assert_eq!(envelope.data.max_devices, 5);
        assert_eq!(envelope.data.db_uri, "enc-db");
        assert_eq!(envelope.data.tailscale_token, "enc-ts");
    }

    #[test]
    fn device_response_decodes_wire_shape() {
        let raw = r#"{"data":{
            "valid": true,
            "key": "brim-key",
            "expireIn": null,
            "tag": "acme",
            "subscription": {"_id": "sub-1", "plan_type": "teams", "status": "active"}
        }}"#;
        let envelope: Envelope<DeviceLicense> = serde_json::from_str(raw).unwrap();
        assert!(envelope.data.valid);
        assert_eq!(envelope.data.tag, "acme");
        assert_eq!(envelope.data.subscription.id, "sub-1");
        assert!(envelope.data.expire_in.is_none());
    }

    #[test]
    fn device_payload_serializes_camel_case() {
        let payload = DevicePayload {
            device_info: DeviceInfo {
                device_id: "machine-1",
                hostname: "node-a",
            },
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(
            json,
            r#"{"deviceInfo":{"deviceId":"machine-1","hostname":"node-a"}}"#
        );
    }

    #[test]
    fn invalid_subscription_defaults_are_empty() {
        let raw = r#"{"data":{"valid":false}}"#;
        let envelope: Envelope<DeviceLicense> = serde_json::from_str(raw).unwrap();
        assert!(!envelope.data.valid);
        assert!(envelope.data.subscription.id.is_empty());
    }
}
