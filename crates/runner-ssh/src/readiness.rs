//! Readiness polling for operator-installed ephemeral keys.
//!
//! After the key is announced, each host is probed every three seconds
//! with the ephemeral key (and its pinned host key) until an `echo test`
//! round-trip succeeds everywhere or the budget elapses.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info};

use runner_core::config::Server;

use crate::client::DiscardSink;
use crate::error::SshError;
use crate::temp_key::TempKeyManager;

const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Default budget for the whole fleet to become reachable.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(10 * 60);

async fn check_host(manager: Arc<TempKeyManager>, server: Server) -> (String, bool) {
    let result = async {
        let client = manager.connect(&server, Arc::new(DiscardSink)).await?;
        let out = client.exec_capture("echo test").await;
        client.close().await;
        out
    }
    .await;

    match result {
        Ok(_) => (server.host, true),
        Err(e) => {
            debug!(host = %server.host, error = %e, "host not ready yet");
            (server.host, false)
        }
    }
}

/// Block until every host accepts the ephemeral key, or fail with the
/// list of hosts still pending when the budget runs out.
pub async fn wait_for_readiness(
    servers: &[Server],
    manager: Arc<TempKeyManager>,
    budget: Duration,
) -> Result<(), SshError> {
    let deadline = Instant::now() + budget;
    let mut ready: HashSet<String> = HashSet::new();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        ticker.tick().await;

        let mut probes = JoinSet::new();
        for server in servers {
            if !ready.contains(&server.host) {
                probes.spawn(check_host(Arc::clone(&manager), server.clone()));
            }
        }

        while let Some(result) = probes.join_next().await {
            if let Ok((host, true)) = result {
                info!(host, remaining = servers.len() - ready.len() - 1, "ssh access established");
                ready.insert(host);
            }
        }

        if ready.len() == servers.len() {
            info!("ssh setup complete, all servers are accessible");
            return Ok(());
        }

        if Instant::now() >= deadline {
            let pending: Vec<String> = servers
                .iter()
                .filter(|s| !ready.contains(&s.host))
                .map(|s| s.host.clone())
                .collect();
            return Err(SshError::ReadinessTimeout(pending.join(", ")));
        }
    }
}
