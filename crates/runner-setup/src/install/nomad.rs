//! Nomad agent installation.
//!
//! Purges any previous nomad state, writes `/etc/nomad.d/nomad.hcl` for
//! this host's role set, starts the service, and waits for the agent
//! health endpoint (plus `nomad server members` on server hosts).

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::warn;

use super::Installer;

const HEALTH_ATTEMPTS: u32 = 20;
const HEALTH_INTERVAL: Duration = Duration::from_secs(2);

fn quote_addresses(addresses: &[String]) -> String {
    addresses
        .iter()
        .map(|a| format!("\"{a}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Loopback-joined single-node config for a one-host fleet.
pub(crate) fn single_node_config(consul_token: &str, node_name: &str) -> String {
    format!(
        r#"data_dir = "/opt/nomad/data"

log_level = "INFO"

server {{
  enabled = true
  bootstrap_expect = 1
}}

client {{
  enabled = true
  servers = ["127.0.0.1:4647"]
}}

addresses {{
  http = "0.0.0.0"
}}

ports {{
  http = 4646
  rpc  = 4647
  serf = 4648
}}

consul {{
  address = "127.0.0.1:8500"
  token = "{consul_token}"
  client_service_name = "{node_name}"
  auto_advertise = true
  server_auto_join = true
  client_auto_join = true
}}

plugin "docker" {{
  config {{
    allow_privileged = true
    volumes {{
      enabled = true
    }}
  }}
}}

telemetry {{
  collection_interval = "1s"
  disable_hostname = true
  prometheus_metrics = true
  publish_allocation_metrics = true
  publish_node_metrics = true
}}
"#
    )
}

/// Multi-host config: the server block appears iff the host has the
/// server role, the client block iff it has the client role.
#[allow(clippy::too_many_arguments)]
pub(crate) fn cluster_config(
    datacenter: &str,
    bind_addr: &str,
    is_server: bool,
    is_client: bool,
    server_count: usize,
    server_addresses: &[String],
    consul_token: &str,
    node_name: &str,
) -> String {
    let server_block = if is_server {
        format!(
            "\nserver {{\n  enabled = true\n  bootstrap_expect = {server_count}\n}}\n"
        )
    } else {
        String::new()
    };

    let client_block = if is_client {
        format!(
            "\nclient {{\n  enabled = true\n  servers = [{}]\n}}\n",
            quote_addresses(server_addresses)
        )
    } else {
        String::new()
    };

    format!(
        r#"datacenter = "{datacenter}"
data_dir = "/opt/nomad/data"
bind_addr = "{bind_addr}"

advertise {{
  http = "{bind_addr}:4646"
  rpc = "{bind_addr}:4647"
  serf = "{bind_addr}:4648"
}}
{server_block}{client_block}
consul {{
  address = "127.0.0.1:8500"
  token = "{consul_token}"
  client_service_name = "{node_name}"
  auto_advertise = true
  server_auto_join = true
  client_auto_join = true
}}

plugin "docker" {{
  config {{
    allow_privileged = true
    volumes {{
      enabled = true
    }}
  }}
}}

telemetry {{
  collection_interval = "1s"
  disable_hostname = true
  prometheus_metrics = true
  publish_allocation_metrics = true
  publish_node_metrics = true
}}
"#
    )
}

impl Installer<'_> {
    pub(crate) async fn setup_nomad(&self) -> Result<()> {
        self.cleanup_nomad_state()
            .await
            .context("failed to cleanup nomad state")?;

        let node_name = self.node_name();
        let consul = &self.config.cluster_config.consul;

        let nomad_config = if self.config.servers.len() == 1 {
            single_node_config(&consul.token, &node_name)
        } else {
            cluster_config(
                &consul.datacenter,
                &self.server.public_ip,
                self.is_server(),
                self.is_client(),
                self.server_count(),
                &self.nomad_server_addresses(),
                &consul.token,
                &node_name,
            )
        };

        self.client.exec("sudo mkdir -p /etc/nomad.d").await?;
        self.client
            .exec(&format!(
                "echo '{nomad_config}' | sudo tee /etc/nomad.d/nomad.hcl"
            ))
            .await?;

        let enabled = self
            .client
            .exec_capture("systemctl is-enabled nomad || true")
            .await
            .context("failed to check nomad service status")?;

        let service_commands: &[&str] = if enabled.trim() == "enabled" {
            &["sudo systemctl daemon-reload", "sudo systemctl restart nomad"]
        } else {
            &[
                "sudo systemctl daemon-reload",
                "sudo systemctl enable nomad",
                "sudo systemctl start nomad",
            ]
        };

        for command in service_commands {
            self.client.exec(command).await?;
        }

        self.check_nomad_health()
            .await
            .context("failed to verify nomad health")
    }

    /// Stop and purge any running nomad so a retried stage starts from a
    /// clean slate: jobs purged, service stopped, stray processes killed,
    /// allocation mounts released, data directory recreated.
    async fn cleanup_nomad_state(&self) -> Result<()> {
        let status = self
            .client
            .exec_capture("systemctl is-active nomad || true")
            .await
            .context("failed to check nomad status")?;

        if status.trim() == "active" {
            if let Err(e) = self.client.exec("nomad job stop -purge -yes -detach '*'").await {
                warn!(error = %e, "failed to stop nomad jobs");
            }
            tokio::time::sleep(Duration::from_secs(10)).await;

            self.client
                .exec("sudo systemctl stop nomad")
                .await
                .context("failed to stop nomad")?;
            tokio::time::sleep(Duration::from_secs(5)).await;

            if let Err(e) = self.client.exec("sudo pkill -9 nomad || true").await {
                warn!(error = %e, "failed to force kill nomad processes");
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }

        for command in [
            "for m in $(mount | grep nomad | awk '{print $3}'); do sudo umount $m || true; done",
            "sudo rm -rf /opt/nomad/data/*",
            "sudo rm -f /etc/nomad.d/nomad.hcl",
            "sudo mkdir -p /opt/nomad/data/server",
            "sudo mkdir -p /opt/nomad/data/client",
            "sudo mkdir -p /opt/nomad/data/alloc",
            "sudo chmod -R 700 /opt/nomad/data",
        ] {
            self.client
                .exec(command)
                .await
                .with_context(|| format!("failed to execute cleanup command {command:?}"))?;
        }

        Ok(())
    }

    async fn check_nomad_health(&self) -> Result<()> {
        for _ in 0..HEALTH_ATTEMPTS {
            let status = self
                .client
                .exec_capture("systemctl is-active nomad || true")
                .await
                .unwrap_or_default();
            if status.trim() != "active" {
                tokio::time::sleep(HEALTH_INTERVAL).await;
                continue;
            }

            let health = self
                .client
                .exec_capture("curl -s http://127.0.0.1:4646/v1/agent/health")
                .await
                .unwrap_or_default();

            if health.contains("ok") {
                if self.is_server()
                    && self
                        .client
                        .exec_capture("nomad server members")
                        .await
                        .is_err()
                {
                    tokio::time::sleep(HEALTH_INTERVAL).await;
                    continue;
                }
                return Ok(());
            }

            tokio::time::sleep(HEALTH_INTERVAL).await;
        }

        bail!(
            "nomad failed to become healthy after {} seconds",
            HEALTH_ATTEMPTS as u64 * HEALTH_INTERVAL.as_secs()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_node_config_joins_loopback() {
        let config = single_node_config("tok", "nomad-client-abc");
        assert!(config.contains("bootstrap_expect = 1"));
        assert!(config.contains(r#"servers = ["127.0.0.1:4647"]"#));
        assert!(config.contains(r#"token = "tok""#));
        assert!(config.contains(r#"client_service_name = "nomad-client-abc""#));
    }

    #[test]
    fn server_host_gets_server_and_client_blocks() {
        let addresses = vec!["1.1.1.1:4647".to_string(), "2.2.2.2:4647".to_string()];
        let config = cluster_config(
            "dc1", "1.1.1.1", true, true, 2, &addresses, "tok", "nomad-client-abc",
        );
        assert!(config.contains("bootstrap_expect = 2"));
        assert!(config.contains(r#"servers = ["1.1.1.1:4647", "2.2.2.2:4647"]"#));
        assert!(config.contains(r#"bind_addr = "1.1.1.1""#));
        assert!(config.contains(r#"http = "1.1.1.1:4646""#));
    }

    #[test]
    fn client_only_host_has_no_server_block() {
        let addresses = vec!["1.1.1.1:4647".to_string()];
        let config = cluster_config(
            "dc1", "3.3.3.3", false, true, 1, &addresses, "tok", "nomad-client-abc",
        );
        assert!(!config.contains("bootstrap_expect"));
        assert!(config.contains(r#"servers = ["1.1.1.1:4647"]"#));
    }

    #[test]
    fn consul_stanza_always_points_at_loopback() {
        let config = cluster_config("dc1", "1.1.1.1", true, false, 1, &[], "tok", "n");
        assert!(config.contains(r#"address = "127.0.0.1:8500""#));

        let single = single_node_config("tok", "n");
        assert!(single.contains(r#"address = "127.0.0.1:8500""#));
    }

    #[test]
    fn quoting_joins_with_commas() {
        let addresses = vec!["a:4647".to_string(), "b:4647".to_string()];
        assert_eq!(quote_addresses(&addresses), r#""a:4647", "b:4647""#);
    }
}
