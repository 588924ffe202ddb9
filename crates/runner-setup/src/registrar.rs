//! Control-plane host registration and tunnel setup.
//!
//! Gathers the host's specs over SSH, registers it with the control
//! plane, and installs the cloudflared tunnel service with the token the
//! registration returns. The stage is done only once
//! `systemctl is-active cloudflared` reports `active`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use runner_core::config::Server;
use runner_ssh::SshClient;

use crate::license::client::DEFAULT_BASE_URL;
use crate::license::DeviceLicense;

#[derive(Debug, Serialize)]
struct ServerSpec {
    cpu: String,
    memory: String,
    disk: String,
    os: String,
}

#[derive(Debug, Serialize)]
struct ServerInfo {
    #[serde(rename = "serverId")]
    server_id: String,
    hostname: String,
    #[serde(rename = "ipAddress")]
    ip_address: String,
    #[serde(rename = "privateIpAddress")]
    private_ip_address: String,
    specification: ServerSpec,
}

#[derive(Debug, Serialize)]
struct ServerRegistration {
    tag: String,
    region: String,
    url: String,
    #[serde(rename = "serverInfo")]
    server_info: ServerInfo,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    data: RegistrationData,
}

#[derive(Debug, Deserialize)]
struct RegistrationData {
    #[serde(rename = "tunnelToken")]
    tunnel_token: String,
}

/// Registers one host with the control plane over its SSH session.
pub struct ServerRegistrar<'a> {
    http: reqwest::Client,
    client: &'a SshClient,
    base_url: String,
    license: &'a DeviceLicense,
}

impl<'a> ServerRegistrar<'a> {
    pub fn new(client: &'a SshClient, license: &'a DeviceLicense) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            license,
        })
    }

    /// Register the host and bring its tunnel up.
    pub async fn register_and_setup_tunnel(&self, server: &Server, tag: &str) -> Result<()> {
        let info = self
            .gather_server_info(server, tag)
            .await
            .context("failed to gather server info")?;

        let response = self
            .register_server(&info)
            .await
            .context("failed to register server")?;

        self.install_cloudflared()
            .await
            .context("failed to install cloudflared")?;

        self.setup_tunnel(&response.data.tunnel_token)
            .await
            .context("failed to setup tunnel")?;

        let status = self
            .client
            .exec_capture("sudo cloudflared tunnel info")
            .await
            .context("tunnel setup complete but status check failed")?;
        info!(host = self.client.host(), "tunnel status: {}", status.trim());

        Ok(())
    }

    async fn gather_server_info(&self, server: &Server, tag: &str) -> Result<ServerRegistration> {
        let cpu = self
            .client
            .exec_capture("lscpu | grep 'Model name' | cut -d ':' -f 2 | xargs")
            .await?;
        let memory = self
            .client
            .exec_capture("free -h | grep Mem: | awk '{print $2}'")
            .await?;
        let disk = self
            .client
            .exec_capture("df -h / | tail -1 | awk '{print $2}'")
            .await?;
        let os = self
            .client
            .exec_capture("lsb_release -d | cut -f 2")
            .await?;
        let hostname = self.client.hostname().await?;
        let public_ip = self.client.exec_capture("curl -s ifconfig.me").await?;
        let private_ip = self
            .client
            .exec_capture("hostname -I | awk '{print $1}'")
            .await?;

        Ok(ServerRegistration {
            tag: tag.to_string(),
            region: server.region.clone(),
            url: format!("http://{}:3000", private_ip.trim()),
            server_info: ServerInfo {
                server_id: format!("srv-{}", uuid::Uuid::new_v4()),
                hostname,
                ip_address: public_ip.trim().to_string(),
                private_ip_address: private_ip.trim().to_string(),
                specification: ServerSpec {
                    cpu: cpu.trim().to_string(),
                    memory: memory.trim().to_string(),
                    disk: disk.trim().to_string(),
                    os: os.trim().to_string(),
                },
            },
        })
    }

    async fn register_server(&self, info: &ServerRegistration) -> Result<RegistrationResponse> {
        let response = self
            .http
            .post(format!("{}/v1/license/server", self.base_url))
            .header("Content-Type", "application/json")
            .header("X-Brimble-Key", &self.license.key)
            .json(info)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("server registration failed with status {status}: {body}");
        }

        Ok(response.json().await?)
    }

    async fn install_cloudflared(&self) -> Result<()> {
        for command in [
            "sudo mkdir -p --mode=0755 /usr/share/keyrings",
            "curl -fsSL https://pkg.cloudflare.com/cloudflare-main.gpg | sudo tee /usr/share/keyrings/cloudflare-main.gpg >/dev/null",
            "echo 'deb [signed-by=/usr/share/keyrings/cloudflare-main.gpg] https://pkg.cloudflare.com/cloudflared focal main' | sudo tee /etc/apt/sources.list.d/cloudflared.list",
            "sudo apt-get update && sudo apt-get install cloudflared -y",
        ] {
            self.client
                .exec(command)
                .await
                .with_context(|| format!("failed to execute command {command:?}"))?;
        }
        Ok(())
    }

    async fn is_cloudflared_running(&self) -> bool {
        match self
            .client
            .exec_capture("sudo systemctl is-active cloudflared")
            .await
        {
            Ok(output) => output.trim() == "active",
            Err(_) => false,
        }
    }

    async fn stop_tunnel(&self) -> Result<()> {
        for command in [
            "sudo cloudflared service uninstall",
            "sudo systemctl stop cloudflared",
            "sudo systemctl disable cloudflared",
        ] {
            if let Err(e) = self.client.exec(command).await {
                warn!(command, error = %e, "tunnel stop command failed");
            }
        }

        if self.is_cloudflared_running().await {
            bail!("failed to stop cloudflared service");
        }
        Ok(())
    }

    async fn setup_tunnel(&self, tunnel_token: &str) -> Result<()> {
        if self.is_cloudflared_running().await {
            self.stop_tunnel()
                .await
                .context("failed to stop existing tunnel")?;
        }

        self.client
            .exec(&format!("sudo cloudflared service install {tunnel_token}"))
            .await
            .context("failed to install tunnel with new token")?;

        self.client
            .exec("sudo systemctl start cloudflared")
            .await
            .context("failed to start cloudflared service")?;

        if !self.is_cloudflared_running().await {
            bail!("cloudflared service failed to start");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_serializes_wire_field_names() {
        let registration = ServerRegistration {
            tag: "acme".to_string(),
            region: "europe-west4".to_string(),
            url: "http://10.0.0.5:3000".to_string(),
            server_info: ServerInfo {
                server_id: "srv-1".to_string(),
                hostname: "node-a".to_string(),
                ip_address: "1.2.3.4".to_string(),
                private_ip_address: "10.0.0.5".to_string(),
                specification: ServerSpec {
                    cpu: "EPYC".to_string(),
                    memory: "64Gi".to_string(),
                    disk: "500G".to_string(),
                    os: "Ubuntu 22.04".to_string(),
                },
            },
        };

        let json = serde_json::to_value(&registration).unwrap();
        assert_eq!(json["serverInfo"]["serverId"], "srv-1");
        assert_eq!(json["serverInfo"]["ipAddress"], "1.2.3.4");
        assert_eq!(json["serverInfo"]["privateIpAddress"], "10.0.0.5");
        assert_eq!(json["serverInfo"]["specification"]["cpu"], "EPYC");
    }

    #[test]
    fn tunnel_token_decodes_from_response() {
        let raw = r#"{"message":"ok","data":{"tunnelToken":"tok-123"}}"#;
        let response: RegistrationResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.data.tunnel_token, "tok-123");
    }
}
