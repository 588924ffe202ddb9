//! Fleet configuration model and pre-flight validation.
//!
//! The config file is JSON (`--config`, default `./config.json`) and carries
//! the target host list plus cluster-wide settings (consul image, versions,
//! monitoring credentials, runner sizing).

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How the orchestrator authenticates to a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Durable operator key on disk (`key_path` must be set).
    #[default]
    KeyPath,
    /// One-shot ephemeral key generated for this run.
    TempKey,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyPath => write!(f, "key_path"),
            Self::TempKey => write!(f, "temp_key"),
        }
    }
}

/// A single target host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    /// Network-resolvable name or IP used for SSH.
    pub host: String,
    pub username: String,
    /// Present iff `auth_method` is `key_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    pub region: String,
    pub public_ip: String,
    pub private_ip: String,
    #[serde(default)]
    pub auth_method: AuthMethod,
}

/// Consul cluster settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    pub consul_image: String,
    #[serde(default = "default_datacenter")]
    pub datacenter: String,
    #[serde(default)]
    pub token: String,
}

fn default_datacenter() -> String {
    "dc1".to_string()
}

/// Monitoring stack settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub grafana_password: String,
    pub metrics_port: u16,
}

/// Pinned versions for the installed toolchain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Versions {
    pub docker: String,
    pub nodejs: String,
    pub nomad: String,
}

/// Runner service sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub port: u16,
    pub instance: u32,
}

/// Cluster-wide settings shared by every host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub consul: ConsulConfig,
    pub monitoring: MonitoringConfig,
    pub versions: Versions,
    pub runner: RunnerConfig,
}

/// Top-level fleet configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub servers: Vec<Server>,
    pub cluster_config: ClusterConfig,
}

/// Outcome of validating host auth methods against the `--use-temp` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthValidation {
    /// Hosts agree with the flag.
    Ok,
    /// Exactly one host configured with `temp_key` while `--use-temp` is off.
    /// Legal shortcut: the caller still runs the temp-key flow.
    SingleHostTempKey,
}

impl Config {
    /// Load and parse a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("error reading config file {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("error parsing config: {e}")))?;
        Ok(config)
    }

    /// Reject duplicate `host`, `public_ip`, or `private_ip` entries,
    /// naming every offender.
    pub fn validate_unique_hosts(&self) -> Result<()> {
        let mut offenders = Vec::new();

        for (label, key) in [
            ("host", (|s: &Server| s.host.clone()) as fn(&Server) -> String),
            ("public_ip", |s| s.public_ip.clone()),
            ("private_ip", |s| s.private_ip.clone()),
        ] {
            let mut seen: HashMap<String, Vec<&str>> = HashMap::new();
            for server in &self.servers {
                seen.entry(key(server)).or_default().push(&server.host);
            }
            let mut dups: Vec<_> = seen
                .into_iter()
                .filter(|(value, hosts)| !value.is_empty() && hosts.len() > 1)
                .collect();
            dups.sort_by(|a, b| a.0.cmp(&b.0));
            for (value, hosts) in dups {
                offenders.push(format!("duplicate {label} {value} on hosts: {}", hosts.join(", ")));
            }
        }

        if offenders.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(offenders.join("; ")))
        }
    }

    /// Check every host's `auth_method` against the `--use-temp` flag.
    ///
    /// A single-host fleet configured with `temp_key` is accepted even when
    /// the flag is off; the caller must still run the ephemeral-key flow.
    pub fn validate_auth_methods(&self, use_temp: bool) -> Result<AuthValidation> {
        if use_temp {
            for server in &self.servers {
                if server.auth_method == AuthMethod::KeyPath {
                    return Err(Error::Config(format!(
                        "--use-temp is set but host {} is configured with auth_method key_path",
                        server.host
                    )));
                }
            }
            return Ok(AuthValidation::Ok);
        }

        let temp_hosts: Vec<&Server> = self
            .servers
            .iter()
            .filter(|s| s.auth_method == AuthMethod::TempKey)
            .collect();

        if temp_hosts.is_empty() {
            Ok(AuthValidation::Ok)
        } else if self.servers.len() == 1 {
            Ok(AuthValidation::SingleHostTempKey)
        } else {
            Err(Error::Config(format!(
                "host {} is configured with auth_method temp_key but --use-temp is not set",
                temp_hosts[0].host
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(host: &str, public_ip: &str, private_ip: &str, auth: AuthMethod) -> Server {
        Server {
            host: host.to_string(),
            username: "root".to_string(),
            key_path: match auth {
                AuthMethod::KeyPath => Some("~/.ssh/id_rsa".to_string()),
                AuthMethod::TempKey => None,
            },
            region: "europe-west4".to_string(),
            public_ip: public_ip.to_string(),
            private_ip: private_ip.to_string(),
            auth_method: auth,
        }
    }

    fn config(servers: Vec<Server>) -> Config {
        Config {
            servers,
            cluster_config: ClusterConfig {
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
            },
        }
    }

    #[test]
    fn parses_config_json() {
        let raw = r#"{
            "servers": [
                { "host": "10.0.0.1", "username": "root", "key_path": "~/.ssh/id_rsa",
                  "region": "eu", "public_ip": "10.0.0.1", "private_ip": "192.168.0.1",
                  "auth_method": "key_path" }
            ],
            "cluster_config": {
                "consul": { "consul_image": "hashicorp/consul:1.16" },
                "monitoring": { "grafana_password": "x", "metrics_port": 9100 },
                "versions": { "docker": "latest", "nodejs": "20.x", "nomad": "1.6.3" },
                "runner": { "port": 3000, "instance": 4 }
            }
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].auth_method, AuthMethod::KeyPath);
        assert_eq!(config.cluster_config.consul.datacenter, "dc1");
    }

    #[test]
    fn unique_hosts_passes_for_distinct_entries() {
        let cfg = config(vec![
            server("h1", "1.1.1.1", "10.0.0.1", AuthMethod::KeyPath),
            server("h2", "2.2.2.2", "10.0.0.2", AuthMethod::KeyPath),
        ]);
        assert!(cfg.validate_unique_hosts().is_ok());
    }

    #[test]
    fn duplicate_private_ip_names_both_hosts() {
        let cfg = config(vec![
            server("h1", "1.1.1.1", "10.0.0.5", AuthMethod::KeyPath),
            server("h2", "2.2.2.2", "10.0.0.5", AuthMethod::KeyPath),
        ]);
        let err = cfg.validate_unique_hosts().unwrap_err().to_string();
        assert!(err.contains("private_ip 10.0.0.5"));
        assert!(err.contains("h1"));
        assert!(err.contains("h2"));
    }

    #[test]
    fn duplicate_host_rejected() {
        let cfg = config(vec![
            server("h1", "1.1.1.1", "10.0.0.1", AuthMethod::KeyPath),
            server("h1", "2.2.2.2", "10.0.0.2", AuthMethod::KeyPath),
        ]);
        assert!(cfg.validate_unique_hosts().is_err());
    }

    #[test]
    fn use_temp_rejects_key_path_host() {
        let cfg = config(vec![
            server("h1", "1.1.1.1", "10.0.0.1", AuthMethod::TempKey),
            server("h2", "2.2.2.2", "10.0.0.2", AuthMethod::KeyPath),
        ]);
        let err = cfg.validate_auth_methods(true).unwrap_err().to_string();
        assert!(err.contains("h2"));
    }

    #[test]
    fn no_temp_flag_rejects_temp_key_host_in_multi_host_fleet() {
        let cfg = config(vec![
            server("h1", "1.1.1.1", "10.0.0.1", AuthMethod::TempKey),
            server("h2", "2.2.2.2", "10.0.0.2", AuthMethod::KeyPath),
        ]);
        assert!(cfg.validate_auth_methods(false).is_err());
    }

    #[test]
    fn single_host_temp_key_is_a_legal_shortcut() {
        let cfg = config(vec![server("h1", "1.1.1.1", "10.0.0.1", AuthMethod::TempKey)]);
        assert_eq!(
            cfg.validate_auth_methods(false).unwrap(),
            AuthValidation::SingleHostTempKey
        );
    }

    #[test]
    fn matching_methods_pass() {
        let cfg = config(vec![
            server("h1", "1.1.1.1", "10.0.0.1", AuthMethod::KeyPath),
            server("h2", "2.2.2.2", "10.0.0.2", AuthMethod::KeyPath),
        ]);
        assert_eq!(cfg.validate_auth_methods(false).unwrap(), AuthValidation::Ok);

        let cfg = config(vec![
            server("h1", "1.1.1.1", "10.0.0.1", AuthMethod::TempKey),
            server("h2", "2.2.2.2", "10.0.0.2", AuthMethod::TempKey),
        ]);
        assert_eq!(cfg.validate_auth_methods(true).unwrap(), AuthValidation::Ok);
    }
}
