//! Ephemeral SSH key manager.
//!
//! Owns the one-shot keypair for a run: generation + persistence,
//! operator instructions, pinned-host-key sessions, and the guaranteed
//! scrub of the key from each host's `authorized_keys`.

use std::path::PathBuf;
use std::sync::Arc;

use russh::client;
use tracing::{debug, info, warn};

use runner_core::config::Server;
use runner_core::Database;

use crate::client::{ClientHandler, HostKeyPolicy, OutputSink, SshAuth, SshClient, DIAL_TIMEOUT};
use crate::error::SshError;
use crate::keygen::{self, GeneratedKey};
use crate::known_hosts::KnownHostKeys;

/// Manager for one run's ephemeral keypair.
pub struct TempKeyManager {
    db: Database,
    key: GeneratedKey,
    key_dir: PathBuf,
    servers: Vec<String>,
    known_hosts: KnownHostKeys,
}

impl TempKeyManager {
    /// Generate a fresh keypair, persist its record (2-hour TTL), and
    /// save the PEM under the per-process temp directory with mode 0600.
    ///
    /// Generation, persistence, or PEM write failure is fatal to the run.
    pub async fn generate(db: Database, servers: Vec<String>) -> Result<Self, SshError> {
        let key_id = keygen::generate_key_id();
        let key = keygen::generate_keypair(&key_id)?;

        let key_dir = std::env::temp_dir().join("brimble-ssh");
        std::fs::create_dir_all(&key_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        keygen::save_private_key(&key, &key_dir)?;
        db.create_temp_key(&key_id, &key.authorized_line, &servers)
            .await?;

        info!(key_id, "ephemeral ssh key generated");

        Ok(Self {
            db,
            key,
            key_dir,
            servers,
            known_hosts: KnownHostKeys::new(),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key.key_id
    }

    pub fn authorized_line(&self) -> &str {
        &self.key.authorized_line
    }

    pub fn known_hosts(&self) -> &KnownHostKeys {
        &self.known_hosts
    }

    /// Operator instructions printed before the readiness wait.
    pub fn instructions(&self) -> String {
        format!(
            "\n🔑 Generated temporary SSH key: {key_id}\n\
             📋 Please add this public key to your server:\n\n\
             {line}\n\n\
             You can do this by running:\n\
             echo \"{line}\" >> ~/.ssh/authorized_keys\n",
            key_id = self.key.key_id,
            line = self.key.authorized_line,
        )
    }

    /// Check the key record is still usable (`active`, within TTL).
    pub async fn validate(&self) -> Result<(), SshError> {
        match self.db.get_active_key(&self.key.key_id).await? {
            Some(_) => Ok(()),
            None => Err(SshError::Key(
                "key has expired or been invalidated".to_string(),
            )),
        }
    }

    /// The pinned host key for `host`, fetching it with a pre-connect
    /// dial on first sight (TOFU).
    pub async fn pinned_host_key(&self, host: &str) -> Result<HostKeyPolicy, SshError> {
        if let Some(key) = self.known_hosts.get(host) {
            return Ok(HostKeyPolicy::Pinned(key));
        }

        let config = Arc::new(client::Config::default());
        let handler = ClientHandler::new(host, HostKeyPolicy::Record(self.known_hosts.clone()));
        let addr = format!("{host}:22");

        // A bare dial is enough: the key exchange hands us the host key
        // before any authentication happens.
        let connected =
            tokio::time::timeout(DIAL_TIMEOUT, client::connect(config, addr.as_str(), handler))
                .await
                .map_err(|_| SshError::DialTimeout {
                    host: host.to_string(),
                })?;

        match connected {
            Ok(handle) => drop(handle),
            Err(e) => debug!(host, error = %e, "host key probe dial ended early"),
        }

        let key = self
            .known_hosts
            .get(host)
            .ok_or_else(|| SshError::NoHostKey {
                host: host.to_string(),
            })?;
        Ok(HostKeyPolicy::Pinned(key))
    }

    /// Open a session to `server` with the ephemeral key and its pinned
    /// host key.
    pub async fn connect(
        &self,
        server: &Server,
        sink: Arc<dyn OutputSink>,
    ) -> Result<SshClient, SshError> {
        let policy = self.pinned_host_key(&server.host).await?;
        SshClient::connect(server, SshAuth::Key(self.key.private.clone()), policy, sink).await
    }

    /// Scrub the key from the host behind `client`, finalize the record,
    /// and delete the local PEM. Runs on worker completion, success or
    /// failure.
    pub async fn cleanup(&self, client: &SshClient) -> Result<(), SshError> {
        self.db.mark_key_expired(&self.key.key_id).await?;

        let cleanup_cmd = format!(
            "sed -i '/{}/d' ~/.ssh/authorized_keys",
            self.key.key_id
        );
        client.exec(&cleanup_cmd).await?;

        self.db.mark_key_cleaned(&self.key.key_id).await?;

        let pem_path = self.pem_path();
        if let Err(e) = std::fs::remove_file(&pem_path) {
            warn!(path = %pem_path.display(), error = %e, "failed to remove local private key");
        }

        info!(key_id = %self.key.key_id, host = client.host(), "ephemeral key scrubbed");
        Ok(())
    }

    /// Hosts this key was provisioned for.
    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    fn pem_path(&self) -> PathBuf {
        self.key_dir.join(format!("{}.pem", self.key.key_id))
    }
}
