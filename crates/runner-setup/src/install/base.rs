//! Base package installation.
//!
//! Registers the host with the control plane (which also brings up its
//! cloudflared tunnel), then installs the toolchain every later stage
//! depends on. Each command is written remove-then-create or
//! install-if-missing, so a retried stage converges instead of failing.

use anyhow::{Context, Result};

use crate::registrar::ServerRegistrar;

use super::Installer;

const NVM_VERSION: &str = "v0.40.1";
const NODE_BIN: &str = "/root/.nvm/versions/node/v20.18.1/bin";
const CNI_PLUGIN_VERSION: &str = "v1.5.1";

/// The full base command sequence for a host.
pub(crate) fn base_package_commands(
    nodejs_version: &str,
    license_tag: &str,
    tailscale_token: &str,
) -> Vec<String> {
    let mut commands: Vec<String> = vec![
        "sudo apt-get update".into(),
        "sudo apt-get upgrade -y".into(),
        "sudo apt install -y curl unzip wget ufw coreutils gpg debian-keyring debian-archive-keyring apt-transport-https".into(),
        "sudo apt update -y".into(),
    ];

    commands.push(format!(
        "sudo tailscale up --authkey={tailscale_token} --advertise-tags='tag:client-{license_tag}'"
    ));

    commands.extend([
        "curl -fsSL https://get.docker.com -o get-docker.sh".to_string(),
        "sudo sh get-docker.sh".to_string(),
        "sudo usermod -aG docker $USER".to_string(),
        "sudo apt install -y docker-compose".to_string(),
        format!("curl -fsSL https://deb.nodesource.com/setup_{nodejs_version} | sudo -E bash -"),
        "sudo apt-get install -y nodejs".to_string(),
        "apt-get install -y redis-server".to_string(),
        "systemctl enable redis-server".to_string(),
        "systemctl start redis-server".to_string(),
        format!("curl -o- https://raw.githubusercontent.com/nvm-sh/nvm/{NVM_VERSION}/install.sh | bash"),
        "export NVM_DIR=\"$HOME/.nvm\" && [ -s \"$NVM_DIR/nvm.sh\" ] && . \"$NVM_DIR/nvm.sh\" && nvm install 20 && nvm use 20".to_string(),
        format!("{NODE_BIN}/npm install --global yarn"),
        format!("{NODE_BIN}/npm install -g pm2"),
        "curl -fsSL https://apt.releases.hashicorp.com/gpg | sudo tee /tmp/hashicorp.gpg > /dev/null".to_string(),
        "sudo gpg --batch --yes --dearmor -o /usr/share/keyrings/hashicorp-archive-keyring.gpg /tmp/hashicorp.gpg".to_string(),
        "sudo rm /tmp/hashicorp.gpg".to_string(),
        "echo \"deb [arch=$(dpkg --print-architecture) signed-by=/usr/share/keyrings/hashicorp-archive-keyring.gpg] https://apt.releases.hashicorp.com $(lsb_release -cs) main\" | sudo tee /etc/apt/sources.list.d/hashicorp.list".to_string(),
        "sudo apt update && sudo apt install -y nomad".to_string(),
        "sudo apt-get install -y consul-cni".to_string(),
        "curl -fsSL https://cdn.brimble.io/runner-linux -o runner.sh".to_string(),
        "sudo chmod +x runner.sh".to_string(),
        "sudo mv runner.sh /usr/local/bin/runner".to_string(),
        format!(
            "ARCH_CNI=$( [ $(uname -m) = aarch64 ] && echo arm64 || echo amd64) && \
             curl -L -o cni-plugins.tgz \"https://github.com/containernetworking/plugins/releases/download/{CNI_PLUGIN_VERSION}/cni-plugins-linux-${{ARCH_CNI}}-{CNI_PLUGIN_VERSION}.tgz\" && \
             sudo mkdir -p /opt/cni/bin && sudo tar -C /opt/cni/bin -xzf cni-plugins.tgz"
        ),
    ]);

    commands
}

impl Installer<'_> {
    pub(crate) async fn install_base_packages(&self) -> Result<()> {
        let registrar = ServerRegistrar::new(self.client, self.license)?;
        registrar
            .register_and_setup_tunnel(self.server, &self.license.tag)
            .await
            .context("failed to register server and setup tunnel")?;

        for command in base_package_commands(
            &self.config.cluster_config.versions.nodejs,
            &self.license.tag,
            &self.tailscale_token,
        ) {
            self.client
                .exec(&command)
                .await
                .with_context(|| format!("failed to execute command {command:?}"))?;
        }

        Ok(())
    }
}
