//! Cloud provisioner contract.
//!
//! VM creation itself lives outside this tool; the setup flow only cares
//! about the handoff: a list of reachable hosts with IPs and key paths,
//! saved as a config file the `setup` command consumes.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use runner_core::config::{
    AuthMethod, ClusterConfig, Config, ConsulConfig, MonitoringConfig, RunnerConfig, Server,
    Versions,
};

/// Supported provisioner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionerKind {
    Aws,
    Gcp,
    Hetzner,
    DigitalOcean,
}

/// One machine a backend produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionedHost {
    pub public_ip: String,
    pub private_ip: String,
    pub key_path: String,
    pub region: String,
    pub username: String,
}

/// Contract every backend satisfies. Backends validate their own inputs
/// and hand back reachable hosts; everything after that is the setup
/// flow's job.
#[allow(async_fn_in_trait)]
pub trait Provisioner {
    fn kind(&self) -> ProvisionerKind;
    fn validate(&self) -> Result<()>;
    async fn provision(&self) -> Result<Vec<ProvisionedHost>>;
}

fn default_cluster_config() -> ClusterConfig {
    ClusterConfig {
        consul: ConsulConfig {
            consul_image: "hashicorp/consul:1.16".to_string(),
            datacenter: "dc1".to_string(),
            token: String::new(),
        },
        monitoring: MonitoringConfig {
            grafana_password: "password".to_string(),
            metrics_port: 9100,
        },
        versions: Versions {
            docker: "latest".to_string(),
            nodejs: "20.x".to_string(),
            nomad: "1.6.3".to_string(),
        },
        runner: RunnerConfig { port: 3000, instance: 4 },
    }
}

/// Convert provisioned hosts into a setup config.
pub fn config_from_hosts(hosts: &[ProvisionedHost]) -> Config {
    let servers = hosts
        .iter()
        .enumerate()
        .map(|(index, host)| Server {
            host: format!("instance-{}", index + 1),
            username: host.username.clone(),
            key_path: Some(host.key_path.clone()),
            region: host.region.clone(),
            public_ip: host.public_ip.clone(),
            private_ip: host.private_ip.clone(),
            auth_method: AuthMethod::KeyPath,
        })
        .collect();

    Config {
        servers,
        cluster_config: default_cluster_config(),
    }
}

/// Save the handoff config next to the working directory, named by the
/// current timestamp, and return its path.
pub fn save_config(config: &Config) -> Result<PathBuf> {
    let filename = format!("{}-setup.json", chrono::Utc::now().timestamp());
    let data = serde_json::to_string_pretty(config).context("error marshaling config")?;
    std::fs::write(&filename, data).context("error writing config file")?;
    Ok(PathBuf::from(filename))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(n: u8) -> ProvisionedHost {
        ProvisionedHost {
            public_ip: format!("1.1.1.{n}"),
            private_ip: format!("10.0.0.{n}"),
            key_path: format!("/tmp/key-{n}.pem"),
            region: "europe-west4".to_string(),
            username: "root".to_string(),
        }
    }

    #[test]
    fn hosts_become_key_path_servers() {
        let config = config_from_hosts(&[host(1), host(2)]);
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].host, "instance-1");
        assert_eq!(config.servers[1].host, "instance-2");
        assert_eq!(config.servers[0].auth_method, AuthMethod::KeyPath);
        assert_eq!(config.servers[0].key_path.as_deref(), Some("/tmp/key-1.pem"));
    }

    #[test]
    fn handoff_config_round_trips_through_json() {
        let config = config_from_hosts(&[host(1)]);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.servers[0].public_ip, "1.1.1.1");
        assert_eq!(parsed.cluster_config.consul.consul_image, "hashicorp/consul:1.16");
    }
}
