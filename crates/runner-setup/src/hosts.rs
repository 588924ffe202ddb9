//! Working host set resolution.
//!
//! The planner must see the same ordered fleet on every run, so the
//! working set is the union of existing unfinished records (oldest first,
//! as the store returns them) and the configured hosts that no record
//! represents yet, deduplicated by private IP. Hosts that already reached
//! `completed` drop out entirely; their workers would skip every stage
//! anyway.

use runner_core::config::{Config, Server};
use runner_core::store::{HostRecord, InstallStep};

/// Merge existing records with the configured hosts.
pub fn merge_host_set(existing: &[HostRecord], config: &Config) -> Vec<Server> {
    let mut all: Vec<Server> = existing
        .iter()
        .filter(|record| record.step != InstallStep::Completed)
        .map(|record| Server {
            host: record.machine_id.clone(),
            username: String::new(),
            key_path: None,
            region: String::new(),
            public_ip: record.public_ip.clone(),
            private_ip: record.private_ip.clone(),
            auth_method: Default::default(),
        })
        .collect();

    for server in &config.servers {
        if !existing.iter().any(|r| r.private_ip == server.private_ip) {
            all.push(server.clone());
        }
    }

    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use runner_core::config::{
        AuthMethod, ClusterConfig, ConsulConfig, MonitoringConfig, RunnerConfig, Versions,
    };
    use runner_core::store::{HostRole, HostStatus};

    fn record(machine_id: &str, private_ip: &str, step: InstallStep) -> HostRecord {
        HostRecord {
            machine_id: machine_id.to_string(),
            public_ip: format!("pub-{private_ip}"),
            private_ip: private_ip.to_string(),
            role: HostRole::Client,
            status: HostStatus::Active,
            identifier: "sub-1".to_string(),
            step,
            consul_address: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn config_with(servers: Vec<Server>) -> Config {
        Config {
            servers,
            cluster_config: ClusterConfig {
                consul: ConsulConfig {
                    consul_image: "hashicorp/consul:1.16".to_string(),
                    datacenter: "dc1".to_string(),
                    token: String::new(),
                },
                monitoring: MonitoringConfig {
                    grafana_password: "x".to_string(),
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

    fn configured(host: &str, private_ip: &str) -> Server {
        Server {
            host: host.to_string(),
            username: "root".to_string(),
            key_path: Some("~/.ssh/id_rsa".to_string()),
            region: "eu".to_string(),
            public_ip: format!("pub-{private_ip}"),
            private_ip: private_ip.to_string(),
            auth_method: AuthMethod::KeyPath,
        }
    }

    #[test]
    fn fresh_fleet_is_just_the_config() {
        let config = config_with(vec![
            configured("h1", "10.0.0.1"),
            configured("h2", "10.0.0.2"),
            configured("h3", "10.0.0.3"),
        ]);
        let merged = merge_host_set(&[], &config);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].host, "h1");
    }

    #[test]
    fn known_hosts_are_not_double_counted() {
        // A resumed fleet must keep the same size, or positional role
        // assignment would change between runs.
        let existing = vec![
            record("m-1", "10.0.0.1", InstallStep::NomadSetup),
            record("m-2", "10.0.0.2", InstallStep::NomadSetup),
            record("m-3", "10.0.0.3", InstallStep::MonitoringSetup),
        ];
        let config = config_with(vec![
            configured("h1", "10.0.0.1"),
            configured("h2", "10.0.0.2"),
            configured("h3", "10.0.0.3"),
        ]);

        let merged = merge_host_set(&existing, &config);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].host, "m-1");
        assert_eq!(merged[2].host, "m-3");
    }

    #[test]
    fn existing_records_come_before_new_hosts() {
        let existing = vec![record("m-1", "10.0.0.9", InstallStep::NomadSetup)];
        let config = config_with(vec![configured("h1", "10.0.0.1")]);

        let merged = merge_host_set(&existing, &config);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].host, "m-1");
        assert_eq!(merged[1].host, "h1");
    }

    #[test]
    fn completed_hosts_drop_out() {
        let existing = vec![record("m-1", "10.0.0.1", InstallStep::Completed)];
        let config = config_with(vec![configured("h1", "10.0.0.1"), configured("h2", "10.0.0.2")]);

        let merged = merge_host_set(&existing, &config);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].host, "h2");
    }
}
