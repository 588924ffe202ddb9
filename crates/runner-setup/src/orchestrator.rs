//! Fleet orchestrator.
//!
//! Validates the run pre-flight (quota, duplicate addresses, auth-method
//! agreement), prepares the ephemeral-key flow when requested, then fans
//! the per-host installation out across a bounded worker pool. The first
//! fatal worker error cancels the shared token; peers stop at their next
//! stage boundary and the run reports every collected error.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use runner_core::config::{AuthValidation, Config, Server};
use runner_core::store::InstallStep;
use runner_core::Database;
use runner_ssh::readiness::{self, DEFAULT_READINESS_TIMEOUT};
use runner_ssh::sweeper;
use runner_ssh::{HostKeyPolicy, SshAuth, SshClient, SshError, TempKeyManager};

use crate::cluster::{persisted_role, ClusterPlanner};
use crate::hosts::merge_host_set;
use crate::install::Installer;
use crate::license::LicenseClient;
use crate::notify::Notifier;
use crate::ui::StatusReporter;

/// At most this many hosts are driven at once.
const MAX_CONCURRENT_WORKERS: usize = 5;

/// Overall wall-clock budget for a setup run.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Everything a worker needs, shared by reference counting.
struct WorkerContext {
    config: Arc<Config>,
    db: Database,
    license_client: LicenseClient,
    planner: ClusterPlanner,
    temp_manager: Option<Arc<TempKeyManager>>,
    tailscale_token: String,
    instances: u32,
    status: Arc<StatusReporter>,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
}

/// Top-level driver for one `runner setup` invocation.
pub struct Orchestrator {
    pub config: Arc<Config>,
    pub db: Database,
    pub license_client: LicenseClient,
    pub tailscale_token: String,
    pub max_devices: usize,
    pub use_temp: bool,
    pub instances: u32,
    pub status: Arc<StatusReporter>,
    pub notifier: Arc<dyn Notifier>,
}

impl Orchestrator {
    /// Run the whole fleet to completion. Errors out before opening any
    /// SSH session when pre-flight validation fails.
    pub async fn run(self) -> Result<()> {
        if self.config.servers.is_empty() {
            bail!("no servers configured");
        }
        if self.config.servers.len() > self.max_devices {
            bail!(
                "this license key only supports a number: {} devices",
                self.max_devices
            );
        }

        self.config
            .validate_unique_hosts()
            .context("invalid server configuration")?;
        let auth_validation = self
            .config
            .validate_auth_methods(self.use_temp)
            .context("invalid server configuration")?;
        let temp_flow = self.use_temp || auth_validation == AuthValidation::SingleHostTempKey;

        // One sweep at startup regardless of flow, then the background
        // ticker for the rest of the run.
        if let Err(e) = sweeper::cleanup_expired_keys(&self.db, &self.config).await {
            warn!(error = %e, "startup key sweep failed");
        }

        let cancel = CancellationToken::new();
        let sweeper_handle = sweeper::spawn_sweeper(
            self.db.clone(),
            (*self.config).clone(),
            cancel.clone(),
        );

        let temp_manager = if temp_flow {
            Some(self.initialize_temp_ssh().await?)
        } else {
            None
        };

        let existing = self
            .db
            .get_active_hosts()
            .await
            .context("failed to get existing servers")?;
        let working_set = merge_host_set(&existing, &self.config);

        let mut planner = ClusterPlanner::new(&working_set);
        planner.calculate_roles(&self.config.servers);

        let result = self
            .run_workers(planner, temp_manager, cancel.clone())
            .await;

        cancel.cancel();
        sweeper_handle.abort();

        result
    }

    /// Generate the one-shot key, announce it, and wait for the operator
    /// to install it on every target.
    async fn initialize_temp_ssh(&self) -> Result<Arc<TempKeyManager>> {
        let servers: Vec<String> = self
            .config
            .servers
            .iter()
            .map(|s| s.host.clone())
            .collect();

        let manager = Arc::new(
            TempKeyManager::generate(self.db.clone(), servers)
                .await
                .context("failed to generate SSH keys")?,
        );

        self.status.announce("\n🔐 Temporary SSH Setup Required");
        self.status.announce(&manager.instructions());

        readiness::wait_for_readiness(
            &self.config.servers,
            Arc::clone(&manager),
            DEFAULT_READINESS_TIMEOUT,
        )
        .await
        .context("SSH setup failed")?;

        Ok(manager)
    }

    async fn run_workers(
        &self,
        planner: ClusterPlanner,
        temp_manager: Option<Arc<TempKeyManager>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let context = Arc::new(WorkerContext {
            config: Arc::clone(&self.config),
            db: self.db.clone(),
            license_client: self.license_client.clone(),
            planner,
            temp_manager,
            tailscale_token: self.tailscale_token.clone(),
            instances: self.instances,
            status: Arc::clone(&self.status),
            notifier: Arc::clone(&self.notifier),
            cancel,
            semaphore: Arc::new(Semaphore::new(MAX_CONCURRENT_WORKERS)),
        });

        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<anyhow::Error>();

        let mut workers = JoinSet::new();
        for server in self.config.servers.clone() {
            let context = Arc::clone(&context);
            let error_tx = error_tx.clone();
            workers.spawn(async move {
                if let Err(e) = process_server(&context, &server).await {
                    // First fatal error cancels the peers at their next
                    // stage boundary.
                    context.cancel.cancel();
                    let _ = error_tx.send(e);
                }
            });
        }
        drop(error_tx);

        while workers.join_next().await.is_some() {}

        let mut errors = Vec::new();
        while let Ok(e) = error_rx.try_recv() {
            errors.push(format!("{e:#}"));
        }

        if errors.is_empty() {
            info!("infrastructure setup completed");
            Ok(())
        } else {
            Err(anyhow!("setup failed with errors:\n{}", errors.join("\n")))
        }
    }
}

/// Drive one host from connect to `completed`, scrubbing the ephemeral
/// key on the way out whether the install succeeded or not.
async fn process_server(context: &WorkerContext, server: &Server) -> Result<()> {
    let _permit = context
        .semaphore
        .acquire()
        .await
        .map_err(|_| anyhow!("worker pool closed"))?;

    if context.cancel.is_cancelled() {
        return Ok(());
    }

    let sink: Arc<dyn runner_ssh::OutputSink> = context.status.clone();

    let client = match &context.temp_manager {
        Some(manager) => manager
            .connect(server, sink)
            .await
            .map_err(|e| anyhow!("error connecting to {}: {e}", server.host))?,
        None => {
            let key_path = server
                .key_path
                .clone()
                .ok_or_else(|| SshError::MissingKeyPath(server.host.clone()))?;
            SshClient::connect(server, SshAuth::KeyFile(key_path), HostKeyPolicy::AcceptAny, sink)
                .await
                .map_err(|e| anyhow!("error connecting to {}: {e}", server.host))?
        }
    };

    let result = setup_host(context, server, &client).await;

    if let Some(manager) = &context.temp_manager {
        if let Err(e) = manager.cleanup(&client).await {
            warn!(host = %server.host, error = %e, "failed to cleanup SSH key");
        }
    }
    client.close().await;

    result
}

async fn setup_host(
    context: &WorkerContext,
    server: &Server,
    client: &SshClient,
) -> Result<()> {
    let machine_id = client
        .machine_id()
        .await
        .map_err(|e| anyhow!("error getting machine-id from {}: {e}", server.host))?;
    let hostname = client
        .hostname()
        .await
        .map_err(|e| anyhow!("error getting hostname from {}: {e}", server.host))?;

    let license = context
        .license_client
        .validate_device(&machine_id, &hostname)
        .await
        .unwrap_or_else(|e| {
            warn!(host = %server.host, error = %e, "license validation request failed");
            crate::license::client::invalid_license()
        });

    if !license.valid {
        bail!(
            "invalid license for server ({}), reach out to hello@brimble.app for support",
            server.host
        );
    }

    let roles = context.planner.roles_for(&server.host).to_vec();

    let current = match context
        .db
        .get_step(&machine_id, &license.subscription.id)
        .await?
    {
        Some(step) => step,
        None => {
            context
                .db
                .register_host(
                    &machine_id,
                    &server.public_ip,
                    &server.private_ip,
                    persisted_role(&roles),
                    &license.subscription.id,
                    InstallStep::Initialized,
                )
                .await
                .map_err(|e| anyhow!("error registering server {}: {e}", server.host))?;
            InstallStep::Initialized
        }
    };

    info!(host = %server.host, step = %current, "resuming installation");

    let installer = Installer {
        client,
        server,
        roles: &roles,
        config: &context.config,
        db: &context.db,
        license: &license,
        machine_id,
        license_key: context.license_client.license_key().to_string(),
        tailscale_token: context.tailscale_token.clone(),
        instances: context.instances,
    };

    installer
        .run(
            current,
            &context.cancel,
            &context.status,
            context.notifier.as_ref(),
        )
        .await
}
