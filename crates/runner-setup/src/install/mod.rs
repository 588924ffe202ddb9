//! Per-host installation state machine.
//!
//! Each stage is an idempotent shell effect run over SSH; the driver in
//! [`driver`] gates stages on their prerequisites and checkpoints the
//! host record after every success, so a rerun resumes exactly where the
//! last run stopped.

mod base;
mod consul;
mod driver;
mod monitoring;
mod nomad;
mod runner_service;
mod verify;

pub use driver::{stage_label, StageGate, RUNNABLE_STAGES};
pub use runner_service::service_name;

use runner_core::config::{Config, Server};
use runner_core::Database;
use runner_ssh::SshClient;

use crate::cluster::ClusterRole;
use crate::license::DeviceLicense;

/// One host's installation context: the live SSH session plus everything
/// the stage effects need.
pub struct Installer<'a> {
    pub(crate) client: &'a SshClient,
    pub(crate) server: &'a Server,
    pub(crate) roles: &'a [ClusterRole],
    pub(crate) config: &'a Config,
    pub(crate) db: &'a Database,
    pub(crate) license: &'a DeviceLicense,
    pub(crate) machine_id: String,
    pub(crate) license_key: String,
    pub(crate) tailscale_token: String,
    pub(crate) instances: u32,
}

impl Installer<'_> {
    pub(crate) fn is_server(&self) -> bool {
        self.roles.contains(&ClusterRole::Server)
    }

    pub(crate) fn is_client(&self) -> bool {
        self.roles.contains(&ClusterRole::Client)
    }

    /// Node name derived from the machine id, shared by the consul and
    /// nomad configs.
    pub(crate) fn node_name(&self) -> String {
        let prefix: String = self.machine_id.chars().take(10).collect();
        format!("nomad-client-{prefix}")
    }

    /// How many hosts run a nomad/consul server.
    pub(crate) fn server_count(&self) -> usize {
        match self.config.servers.len() {
            0 => 0,
            1 | 2 => 1,
            n => n - 1,
        }
    }

    /// `host:4647` RPC addresses of the server-role hosts, in fleet order.
    pub(crate) fn nomad_server_addresses(&self) -> Vec<String> {
        self.config
            .servers
            .iter()
            .take(self.server_count())
            .map(|s| format!("{}:4647", s.public_ip))
            .collect()
    }
}
