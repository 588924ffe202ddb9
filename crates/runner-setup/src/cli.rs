//! CLI surface: `runner init`, `runner setup`, `runner provision`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::warn;

use runner_core::{license_file, Config, Database};

use crate::license::{crypto, secrets, LicenseClient};
use crate::notify::{DesktopNotifier, Notifier};
use crate::orchestrator::{Orchestrator, RUN_TIMEOUT};
use crate::ui::StatusReporter;

/// Brimble infrastructure setup and management tool.
#[derive(Debug, Parser)]
#[command(name = "runner", version, about)]
pub struct Cli {
    /// Path to config file
    #[arg(long, global = true, default_value = "./config.json")]
    pub config: PathBuf,

    /// Use a temporary SSH key for this run
    #[arg(long = "use-temp", global = true)]
    pub use_temp: bool,

    /// License key (falls back to the saved key from `runner init`)
    #[arg(long, global = true)]
    pub license_key: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Save and validate a license key
    Init,
    /// Run infrastructure setup against the configured hosts
    Setup(SetupArgs),
    /// Provision cloud machines and hand off a setup config
    Provision,
}

#[derive(Debug, Args)]
pub struct SetupArgs {
    /// Number of runner instances per host
    #[arg(long, default_value_t = 6)]
    pub instances: u32,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match &self.command {
            Commands::Init => run_init().await,
            Commands::Setup(args) => {
                let license_key = self.resolve_license_key()?;
                run_setup(&self.config, license_key, self.use_temp, args.instances).await
            }
            Commands::Provision => {
                let _license_key = self.resolve_license_key()?;
                bail!(
                    "no provisioner backend is bundled with this build; \
                     create the machines with your cloud tooling and run \
                     `runner setup --config <file>` with the generated config"
                );
            }
        }
    }

    /// Flag first, then the saved key from `runner init`.
    fn resolve_license_key(&self) -> Result<String> {
        if let Some(key) = &self.license_key {
            return Ok(key.clone());
        }
        match license_file::load_license_key()? {
            Some(key) if !key.is_empty() => Ok(key),
            _ => bail!(
                "license key not found. Please run 'runner init' to configure your license key"
            ),
        }
    }
}

async fn run_init() -> Result<()> {
    let license_key: String = dialoguer::Input::new()
        .with_prompt("Please enter your license key")
        .interact_text()
        .context("failed to read license key")?;
    let license_key = license_key.trim().to_string();

    let client = LicenseClient::new(&license_key)?;
    client
        .setup_configurations()
        .await
        .context("invalid license key")?;

    license_file::save_license_key(&license_key)?;
    println!("License key successfully saved!");
    Ok(())
}

async fn run_setup(
    config_path: &PathBuf,
    license_key: String,
    use_temp: bool,
    instances: u32,
) -> Result<()> {
    let config = Config::load(config_path)?;
    let notifier: Arc<dyn Notifier> = Arc::new(DesktopNotifier::new());
    let status = Arc::new(StatusReporter::new(false));

    let license_client = LicenseClient::new(&license_key)?;
    let setup = license_client
        .setup_configurations()
        .await
        .context("failed to get setup configuration")?;

    let decryption_key = secrets::retrieve_decryption_key()
        .await
        .context("authentication failed")?;

    if setup.db_uri.is_empty() {
        bail!("unable to setup this installation: missing database connection URL");
    }

    let db_uri = crypto::decrypt(&setup.db_uri, &decryption_key)
        .context("failed to decrypt database URL")?;
    let tailscale_token = crypto::decrypt(&setup.tailscale_token, &decryption_key)
        .context("failed to decrypt tailscale token")?;

    let db = Database::connect(&db_uri)
        .await
        .context("failed to connect to database")?;

    let orchestrator = Orchestrator {
        config: Arc::new(config),
        db: db.clone(),
        license_client,
        tailscale_token,
        max_devices: setup.max_devices,
        use_temp,
        instances,
        status,
        notifier: Arc::clone(&notifier),
    };

    let result = tokio::time::timeout(RUN_TIMEOUT, orchestrator.run())
        .await
        .map_err(|_| anyhow::anyhow!("setup timed out after {} minutes", RUN_TIMEOUT.as_secs() / 60))
        .and_then(|r| r);

    db.close().await;

    match result {
        Ok(()) => {
            println!("Infrastructure setup completed ✅");
            if let Err(e) = notifier.send("Installation Complete", "Brimble is now ready to use !") {
                warn!(error = %e, "failed to send notification");
            }
            Ok(())
        }
        Err(e) => {
            if let Err(notify_err) = notifier.send("Installation Error", &format!("{e:#}")) {
                warn!(error = %notify_err, "failed to send notification");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn setup_defaults() {
        let cli = Cli::parse_from(["runner", "setup"]);
        assert_eq!(cli.config, PathBuf::from("./config.json"));
        assert!(!cli.use_temp);
        assert!(cli.license_key.is_none());
        match cli.command {
            Commands::Setup(args) => assert_eq!(args.instances, 6),
            _ => panic!("expected setup subcommand"),
        }
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::parse_from([
            "runner",
            "setup",
            "--use-temp",
            "--license-key",
            "brim-1",
            "--config",
            "/tmp/fleet.json",
            "--instances",
            "2",
        ]);
        assert!(cli.use_temp);
        assert_eq!(cli.license_key.as_deref(), Some("brim-1"));
        assert_eq!(cli.config, PathBuf::from("/tmp/fleet.json"));
    }
}
