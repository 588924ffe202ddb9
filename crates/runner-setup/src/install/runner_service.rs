//! Runner service installation.
//!
//! The service directory and unit carry an opaque hashed name so casual
//! inspection of `/etc/systemd/system` does not reveal what the box runs.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use super::Installer;

const SERVICE_SEED: &str = "brimble-runner";
const SERVICE_USER: &str = "brimble";

/// Environment keys the runner reads; values are populated out of band.
const ENV_KEYS: [&str; 12] = [
    "DEPLOY_URL",
    "DOCKER_BASEURL",
    "DOCKER_REGISTRY",
    "DOCKER_HUB_USERNAME",
    "DOCKER_HUB_PASSWORD",
    "ENCRYPTION_KEY",
    "NOMAD_ACL_TOKEN",
    "REDIS_HOST",
    "REDIS_PORT",
    "REDIS_PASSWORD",
    "REDIS_TLS",
    "SENTRY_DSN",
];

/// `service-<hex>` where `<hex>` is the first 8 bytes of
/// SHA-256("brimble-runner"). Stable across hosts and runs.
pub fn service_name() -> String {
    use std::fmt::Write as _;

    let hash = Sha256::digest(SERVICE_SEED.as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in &hash[..8] {
        let _ = write!(hex, "{byte:02x}");
    }
    format!("service-{hex}")
}

/// `.env` content with every key present and blank.
pub(crate) fn env_file_content() -> String {
    let mut content = String::new();
    for key in ENV_KEYS {
        content.push_str(key);
        content.push_str("=\n");
    }
    content
}

/// The forking systemd unit that keeps the runner alive under pm2.
pub(crate) fn systemd_unit(service: &str, license_key: &str, instances: u32) -> String {
    format!(
        r"[Unit]
Description=Brimble Runner Service ({service})
After=network.target

[Service]
Type=forking
User={SERVICE_USER}
Group={SERVICE_USER}
WorkingDirectory=/opt/{service}/runner
EnvironmentFile=/opt/{service}/runner/.env
Environment=NODE_ENV=production
Environment=PM2_HOME=/home/{SERVICE_USER}/.pm2
Environment=RUNNER_MODE=service
ExecStart=/usr/local/bin/runner --license-key {license_key} --instances {instances} --service
ExecStop=/usr/local/bin/pm2 delete runner
Restart=always
RestartSec=10

[Install]
WantedBy=multi-user.target
"
    )
}

impl Installer<'_> {
    pub(crate) async fn start_runner(&self) -> Result<()> {
        self.create_daemon_setup()
            .await
            .context("unable to setup runner on machine")?;

        let command = format!(
            "runner --license-key {} --instances {}",
            self.license_key, self.instances
        );
        self.client.exec(&command).await?;
        Ok(())
    }

    async fn create_daemon_setup(&self) -> Result<()> {
        let service = service_name();

        for command in [
            format!("sudo useradd -r -s /bin/false {SERVICE_USER} || true"),
            format!("sudo mkdir -p /opt/{service}/runner"),
            format!("sudo mkdir -p /var/run/{service}"),
            format!("sudo mkdir -p /home/{SERVICE_USER}/.pm2"),
            format!("sudo chown -R {SERVICE_USER}:{SERVICE_USER} /opt/{service}"),
            format!("sudo chown -R {SERVICE_USER}:{SERVICE_USER} /var/run/{service}"),
            format!("sudo chown -R {SERVICE_USER}:{SERVICE_USER} /home/{SERVICE_USER}/.pm2"),
        ] {
            self.client
                .exec(&command)
                .await
                .with_context(|| format!("failed to execute command {command:?}"))?;
        }

        self.write_env_file(&service).await?;
        self.write_systemd_service(&service).await?;
        Ok(())
    }

    async fn write_env_file(&self, service: &str) -> Result<()> {
        let content = env_file_content();
        let command = format!(
            "sudo bash -c 'cat > /opt/{service}/runner/.env << EOL\n{content}EOL'"
        );
        self.client
            .exec(&command)
            .await
            .context("failed to create environment file")?;

        self.client
            .exec(&format!(
                "sudo chown {SERVICE_USER}:{SERVICE_USER} /opt/{service}/runner/.env"
            ))
            .await
            .context("failed to set environment file permissions")?;

        Ok(())
    }

    async fn write_systemd_service(&self, service: &str) -> Result<()> {
        let unit = systemd_unit(service, &self.license_key, self.instances);
        let command = format!(
            "sudo bash -c 'cat > /etc/systemd/system/{service}.service << EOL\n{unit}\nEOL'"
        );
        self.client
            .exec(&command)
            .await
            .context("failed to create service file")?;

        for command in [
            "sudo systemctl daemon-reload".to_string(),
            format!("sudo systemctl enable {service}.service"),
        ] {
            self.client
                .exec(&command)
                .await
                .with_context(|| format!("failed to execute command {command:?}"))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_name_is_the_seed_hash_prefix() {
        // First 8 bytes of SHA-256("brimble-runner").
        assert_eq!(service_name(), "service-3fbc9a2758203664");
    }

    #[test]
    fn service_name_is_stable() {
        assert_eq!(service_name(), service_name());
    }

    #[test]
    fn env_file_lists_every_key_blank() {
        let content = env_file_content();
        assert_eq!(content.lines().count(), ENV_KEYS.len());
        for key in ENV_KEYS {
            assert!(content.contains(&format!("{key}=\n")), "missing {key}");
        }
    }

    #[test]
    fn unit_runs_the_runner_under_pm2() {
        let unit = systemd_unit("service-abc", "brim-key", 6);
        assert!(unit.contains("Type=forking"));
        assert!(unit.contains("User=brimble"));
        assert!(unit.contains(
            "ExecStart=/usr/local/bin/runner --license-key brim-key --instances 6 --service"
        ));
        assert!(unit.contains("ExecStop=/usr/local/bin/pm2 delete runner"));
        assert!(unit.contains("Restart=always"));
        assert!(unit.contains("RestartSec=10"));
        assert!(unit.contains("WorkingDirectory=/opt/service-abc/runner"));
        assert!(unit.contains("EnvironmentFile=/opt/service-abc/runner/.env"));
    }
}
