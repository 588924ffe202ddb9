//! Secrets broker client.
//!
//! One job: fetch the symmetric key that decrypts the license-service
//! payload fields. Login or retrieval failure is fatal to the run.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const BROKER_SITE_URL: &str = "https://app.infisical.com";
const PROJECT_ID: &str = "64a5804271976de3e38c59c3";
const ENVIRONMENT: &str = "staging";
const SECRET_NAME: &str = "CLI_DECRYPTION_KEY";

const CLIENT_ID: &str = "881d58d5-44ed-4950-bfd1-b77f04b9a8e4";
const CLIENT_SECRET: &str = "c0ef8cff37718b02a5603c05dbc84ae3109c20edd0b31db2a505602da2295f22";

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    #[serde(rename = "clientId")]
    client_id: &'a str,
    #[serde(rename = "clientSecret")]
    client_secret: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SecretEnvelope {
    secret: SecretBody,
}

#[derive(Debug, Deserialize)]
struct SecretBody {
    #[serde(rename = "secretValue")]
    secret_value: String,
}

/// Authenticate against the broker and fetch the CLI decryption key.
pub async fn retrieve_decryption_key() -> Result<String> {
    retrieve_from(BROKER_SITE_URL).await
}

async fn retrieve_from(site_url: &str) -> Result<String> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;

    let login: LoginResponse = http
        .post(format!("{site_url}/api/v1/auth/universal-auth/login"))
        .json(&LoginRequest {
            client_id: CLIENT_ID,
            client_secret: CLIENT_SECRET,
        })
        .send()
        .await
        .context("secrets broker login failed")?
        .error_for_status()
        .context("secrets broker rejected login")?
        .json()
        .await
        .context("failed to decode broker login response")?;

    let envelope: SecretEnvelope = http
        .get(format!("{site_url}/api/v3/secrets/raw/{SECRET_NAME}"))
        .bearer_auth(&login.access_token)
        .query(&[
            ("workspaceId", PROJECT_ID),
            ("environment", ENVIRONMENT),
            ("secretPath", "/"),
        ])
        .send()
        .await
        .context("secret retrieval failed")?
        .error_for_status()
        .context("secrets broker rejected retrieval")?
        .json()
        .await
        .context("failed to decode secret response")?;

    Ok(envelope.secret.secret_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_envelope_decodes() {
        let raw = r#"{"secret":{"secretValue":"0123456789abcdef0123456789abcdef"}}"#;
        let envelope: SecretEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(
            envelope.secret.secret_value,
            "0123456789abcdef0123456789abcdef"
        );
    }

    #[test]
    fn login_request_serializes_camel_case() {
        let json = serde_json::to_string(&LoginRequest {
            client_id: "id",
            client_secret: "secret",
        })
        .unwrap();
        assert_eq!(json, r#"{"clientId":"id","clientSecret":"secret"}"#);
    }
}
