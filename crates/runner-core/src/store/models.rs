//! Row models for the `servers` and `temp_ssh_keys` tables.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Checkpoints of the per-host installation sequence, in execution order.
///
/// The persisted `step` column only ever advances through this order; a
/// failed stage leaves the column at the previous checkpoint so the next
/// run retries the stage from its start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStep {
    Initialized,
    Verified,
    BaseInstalled,
    ConsulSetup,
    NomadSetup,
    MonitoringSetup,
    RunnerStarted,
    Completed,
}

impl InstallStep {
    /// Position in the stage order, 0-based.
    pub const fn order(self) -> u8 {
        match self {
            Self::Initialized => 0,
            Self::Verified => 1,
            Self::BaseInstalled => 2,
            Self::ConsulSetup => 3,
            Self::NomadSetup => 4,
            Self::MonitoringSetup => 5,
            Self::RunnerStarted => 6,
            Self::Completed => 7,
        }
    }

    /// The stage that must have been reached before this one may run.
    ///
    /// Prerequisites are strictly the immediately prior stage;
    /// `Initialized` and `Completed` are not runnable stages.
    pub const fn prerequisite(self) -> Self {
        match self {
            Self::Initialized | Self::Verified => Self::Initialized,
            Self::BaseInstalled => Self::Verified,
            Self::ConsulSetup => Self::BaseInstalled,
            Self::NomadSetup => Self::ConsulSetup,
            Self::MonitoringSetup => Self::NomadSetup,
            Self::RunnerStarted => Self::MonitoringSetup,
            Self::Completed => Self::RunnerStarted,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Verified => "verified",
            Self::BaseInstalled => "base_installed",
            Self::ConsulSetup => "consul_setup",
            Self::NomadSetup => "nomad_setup",
            Self::MonitoringSetup => "monitoring_setup",
            Self::RunnerStarted => "runner_started",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstallStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(Self::Initialized),
            "verified" => Ok(Self::Verified),
            "base_installed" => Ok(Self::BaseInstalled),
            "consul_setup" => Ok(Self::ConsulSetup),
            "nomad_setup" => Ok(Self::NomadSetup),
            "monitoring_setup" => Ok(Self::MonitoringSetup),
            "runner_started" => Ok(Self::RunnerStarted),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown install step: {other}")),
        }
    }
}

/// Cluster role persisted for a host. Server-capable hosts are always
/// also clients, so the stored value is never `server` alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostRole {
    Client,
    Both,
}

impl HostRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Both => "both",
        }
    }
}

impl FromStr for HostRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Self::Client),
            "both" => Ok(Self::Both),
            other => Err(format!("unknown host role: {other}")),
        }
    }
}

/// Lifecycle status of a host record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Active,
    Inactive,
    Failed,
}

impl HostStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for HostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown host status: {other}")),
        }
    }
}

/// Durable per-host record, keyed by machine id.
#[derive(Debug, Clone)]
pub struct HostRecord {
    /// Content of `/etc/machine-id` on the host. Primary key.
    pub machine_id: String,
    pub public_ip: String,
    pub private_ip: String,
    pub role: HostRole,
    pub status: HostStatus,
    /// Subscription identifier from the license service.
    pub identifier: String,
    pub step: InstallStep,
    /// Publicly-reachable address of the consul server this host joins.
    /// Exactly one record in a healthy fleet carries a non-null value.
    pub consul_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of an ephemeral key record. Transitions only move
/// forward: `active -> expired -> cleaned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Expired,
    Cleaned,
}

impl KeyStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Cleaned => "cleaned",
        }
    }
}

impl FromStr for KeyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "cleaned" => Ok(Self::Cleaned),
            other => Err(format!("unknown key status: {other}")),
        }
    }
}

/// Durable record of a one-shot SSH keypair.
#[derive(Debug, Clone)]
pub struct TempKeyRecord {
    pub id: i64,
    /// Unique id, also the last token of the authorized-keys line.
    pub key_id: String,
    /// OpenSSH authorized-keys line (`<pub> <key_id>`).
    pub public_key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: KeyStatus,
    pub cleanup_attempted_at: Option<DateTime<Utc>>,
    /// Host addresses this key was provisioned for.
    pub servers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STEPS: [InstallStep; 8] = [
        InstallStep::Initialized,
        InstallStep::Verified,
        InstallStep::BaseInstalled,
        InstallStep::ConsulSetup,
        InstallStep::NomadSetup,
        InstallStep::MonitoringSetup,
        InstallStep::RunnerStarted,
        InstallStep::Completed,
    ];

    #[test]
    fn step_order_is_total_and_monotonic() {
        for pair in ALL_STEPS.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0].order() + 1, pair[1].order());
        }
    }

    #[test]
    fn prerequisite_is_the_immediately_prior_stage() {
        for pair in ALL_STEPS.windows(2) {
            assert_eq!(pair[1].prerequisite(), pair[0]);
        }
    }

    #[test]
    fn step_roundtrips_through_column_text() {
        for step in ALL_STEPS {
            assert_eq!(step.as_str().parse::<InstallStep>().unwrap(), step);
        }
        assert!("unknown".parse::<InstallStep>().is_err());
    }

    #[test]
    fn role_and_status_parse() {
        assert_eq!("both".parse::<HostRole>().unwrap(), HostRole::Both);
        assert!("server".parse::<HostRole>().is_err());
        assert_eq!("failed".parse::<HostStatus>().unwrap(), HostStatus::Failed);
        assert_eq!("cleaned".parse::<KeyStatus>().unwrap(), KeyStatus::Cleaned);
    }
}
