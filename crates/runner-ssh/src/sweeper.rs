//! Background sweeper for orphaned ephemeral keys.
//!
//! A run that dies before its per-host cleanup leaves an `active` key past
//! its TTL (or an `expired` one with no cleanup attempt). The sweeper
//! connects with the operator's durable credentials and removes the key
//! line from every host the record names. Failures are logged and retried
//! on the next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use runner_core::config::{Config, Server};
use runner_core::Database;

use crate::client::{DiscardSink, HostKeyPolicy, SshAuth, SshClient};
use crate::error::SshError;

const SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// One sweep pass: scrub every expired-uncleaned key from its hosts and
/// finalize the records.
pub async fn cleanup_expired_keys(db: &Database, config: &Config) -> Result<(), SshError> {
    let keys = db.expired_uncleaned_keys().await?;
    if keys.is_empty() {
        return Ok(());
    }

    let by_host: HashMap<&str, &Server> = config
        .servers
        .iter()
        .map(|s| (s.host.as_str(), s))
        .collect();

    for key in keys {
        for host in &key.servers {
            let Some(server) = by_host.get(host.as_str()) else {
                warn!(host, key_id = %key.key_id, "host not in config, skipping cleanup");
                continue;
            };

            let Some(key_path) = server.key_path.clone() else {
                warn!(host, key_id = %key.key_id, "host has no durable key_path, skipping cleanup");
                continue;
            };

            let client = match SshClient::connect(
                server,
                SshAuth::KeyFile(key_path),
                HostKeyPolicy::AcceptAny,
                Arc::new(DiscardSink),
            )
            .await
            {
                Ok(client) => client,
                Err(e) => {
                    warn!(host, error = %e, "failed to connect for key cleanup");
                    continue;
                }
            };

            let cleanup_cmd = format!("sed -i '/{}/d' ~/.ssh/authorized_keys", key.key_id);
            if let Err(e) = client.exec(&cleanup_cmd).await {
                warn!(host, key_id = %key.key_id, error = %e, "failed to remove stale key");
            } else {
                info!(host, key_id = %key.key_id, "stale key removed");
            }
            client.close().await;
        }

        if let Err(e) = db.mark_key_cleaned(&key.key_id).await {
            warn!(key_id = %key.key_id, error = %e, "failed to mark key as cleaned");
        }
    }

    Ok(())
}

/// Spawn the 15-minute sweeper loop. The first tick is skipped; callers
/// run one sweep inline at startup instead.
pub fn spawn_sweeper(
    db: Database,
    config: Config,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(SWEEP_INTERVAL);
        timer.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = cleanup_expired_keys(&db, &config).await {
                        warn!(error = %e, "error cleaning up expired keys");
                    }
                }
                _ = shutdown.cancelled() => {
                    return;
                }
            }
        }
    })
}
