//! Consul server election and client join.
//!
//! The first server-role host to reach this stage with no recorded
//! consul address becomes the cluster's single consul server; everyone
//! (the elected host included) then runs a host-networked client on
//! alternate ports so a colocated server never clashes.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;

use super::Installer;

const LEADER_WAIT_ATTEMPTS: u32 = 30;
const LEADER_WAIT_INTERVAL: Duration = Duration::from_secs(2);

/// Ports the dedicated server binds; anything already squatting on them
/// is killed before the container starts.
const SERVER_PORTS: [&str; 5] = ["8300", "8301", "8302", "8500", "8600"];

pub(crate) fn consul_server_command(image: &str, node_name: &str, public_ip: &str) -> String {
    format!(
        "docker run -d --name consul-server --restart unless-stopped \
         -p 8500:8500 -p 8600:8600/tcp -p 8600:8600/udp \
         -p 8301:8301/tcp -p 8301:8301/udp -p 8302:8302/tcp -p 8302:8302/udp \
         -p 8300:8300 \
         -v /opt/consul/data:/consul/data -v /opt/consul/config:/consul/config \
         {image} agent -server -ui -bootstrap-expect=1 -node={node_name} \
         -client=0.0.0.0 -bind=0.0.0.0 -advertise={public_ip} \
         -serf-wan-port=8302 -serf-lan-port=8301 -server-port=8300 -datacenter=dc1"
    )
}

pub(crate) fn consul_client_command(
    image: &str,
    node_name: &str,
    server_host: &str,
    bind_ip: &str,
    datacenter: &str,
) -> String {
    format!(
        "docker run -d --name consul-client --network host --restart unless-stopped \
         {image} agent -node={node_name} -retry-join={server_host} \
         -client=0.0.0.0 -bind={bind_ip} \
         -serf-lan-port=8311 -serf-wan-port=8312 -server-port=8310 \
         -dns-port=8610 -http-port=8510 -datacenter={datacenter}"
    )
}

impl Installer<'_> {
    /// Elect this host as consul server if no address is recorded yet and
    /// its role set allows it, then join (or rejoin) as a client.
    pub(crate) async fn setup_consul(&self) -> Result<()> {
        let recorded = self.db.get_consul_address().await?;

        if recorded.is_none() && self.is_server() {
            let server_addr = self.setup_consul_server().await?;
            let address = server_addr
                .split(':')
                .next()
                .unwrap_or(server_addr.as_str())
                .to_string();

            self.db
                .save_consul_address(&address, &self.machine_id)
                .await
                .context("failed to record consul server address")?;
        }

        self.setup_consul_client().await
    }

    async fn setup_consul_server(&self) -> Result<String> {
        // Scrub any previous server: free the ports, drop containers and
        // on-disk state, then recreate the data directories.
        for port in SERVER_PORTS {
            let _ = self
                .client
                .exec(&format!("sudo lsof -t -i:{port} | xargs -r sudo kill -9"))
                .await;
            let _ = self
                .client
                .exec(&format!("sudo pkill -f 'consul.*{port}'"))
                .await;
        }
        let _ = self.client.exec("sudo killall -9 consul || true").await;

        for command in [
            "docker stop consul-server || true",
            "docker rm -f consul-server || true",
            "docker network rm -f consul-net || true",
            "docker ps -aq --filter name=consul | xargs -r docker rm -f || true",
            "sudo rm -rf /opt/consul/*",
        ] {
            let _ = self.client.exec(command).await;
        }

        for dir in ["/opt/consul/data", "/opt/consul/config"] {
            self.client
                .exec(&format!("sudo mkdir -p {dir}"))
                .await
                .with_context(|| format!("failed to create directory {dir}"))?;
        }

        self.client
            .exec("docker network create consul-net")
            .await
            .context("failed to create network")?;

        let run_cmd = consul_server_command(
            &self.config.cluster_config.consul.consul_image,
            &self.node_name(),
            &self.server.public_ip,
        );
        self.client
            .exec(&run_cmd)
            .await
            .context("failed to start consul server")?;

        let server_addr = format!("{}:8500", self.server.public_ip);
        let leader_cmd = format!("curl -s http://{server_addr}/v1/status/leader");
        for attempt in 0..LEADER_WAIT_ATTEMPTS {
            if let Ok(output) = self.client.exec_capture(&leader_cmd).await {
                if !output.trim().is_empty() {
                    debug!(attempt, "consul leader elected");
                    return Ok(server_addr);
                }
            }
            tokio::time::sleep(LEADER_WAIT_INTERVAL).await;
        }

        bail!("consul server failed to become ready")
    }

    async fn setup_consul_client(&self) -> Result<()> {
        let server_addr = self
            .db
            .get_consul_address()
            .await?
            .ok_or_else(|| anyhow!("no consul server address recorded"))?;

        let existing = self
            .client
            .exec_capture("docker ps -a --format '{{.Names}}' | grep -w consul-client || true")
            .await
            .context("failed to check consul client container")?;

        if existing.contains("consul-client") {
            for command in ["docker stop consul-client", "docker rm consul-client"] {
                self.client
                    .exec(command)
                    .await
                    .with_context(|| format!("failed to execute command {command:?}"))?;
            }
        }

        let server_host = server_addr
            .split(':')
            .next()
            .unwrap_or(server_addr.as_str());

        let run_cmd = consul_client_command(
            &self.config.cluster_config.consul.consul_image,
            &self.node_name(),
            server_host,
            &self.server.public_ip,
            &self.config.cluster_config.consul.datacenter,
        );

        self.client
            .exec(&run_cmd)
            .await
            .context("failed to start consul client")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_command_bootstraps_a_single_node() {
        let cmd = consul_server_command("hashicorp/consul:1.16", "nomad-client-abc", "1.2.3.4");
        assert!(cmd.contains("-bootstrap-expect=1"));
        assert!(cmd.contains("-advertise=1.2.3.4"));
        assert!(cmd.contains("--name consul-server"));
        assert!(cmd.contains("-p 8500:8500"));
    }

    #[test]
    fn client_command_uses_alternate_ports() {
        let cmd = consul_client_command(
            "hashicorp/consul:1.16",
            "nomad-client-abc",
            "1.2.3.4",
            "5.6.7.8",
            "dc1",
        );
        // Non-default ports so a colocated server is never shadowed.
        for flag in [
            "-serf-lan-port=8311",
            "-serf-wan-port=8312",
            "-server-port=8310",
            "-dns-port=8610",
            "-http-port=8510",
        ] {
            assert!(cmd.contains(flag), "missing {flag} in {cmd}");
        }
        assert!(cmd.contains("-retry-join=1.2.3.4"));
        assert!(cmd.contains("-bind=5.6.7.8"));
        assert!(cmd.contains("--network host"));
    }
}
