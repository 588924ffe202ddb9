//! Monitoring job deployment.
//!
//! Ships the embedded nomad job templates in a fixed order, rewriting
//! each service name to be unique per machine, and submits them through
//! `nomad job run`. Transport is base64 so the HCL survives the shell.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use super::Installer;

const CLUSTER_WAIT_ATTEMPTS: u32 = 30;
const CLUSTER_WAIT_INTERVAL: Duration = Duration::from_secs(10);

/// Deployment order matters: log storage first, scrapers next,
/// dashboards last.
const MONITORING_JOBS: [(&str, &str); 6] = [
    ("loki.nomad", include_str!("../../assets/monitoring/loki.nomad")),
    ("cadvisor.nomad", include_str!("../../assets/monitoring/cadvisor.nomad")),
    (
        "node-exporter.nomad",
        include_str!("../../assets/monitoring/node-exporter.nomad"),
    ),
    ("promtail.nomad", include_str!("../../assets/monitoring/promtail.nomad")),
    ("prometheus.nomad", include_str!("../../assets/monitoring/prometheus.nomad")),
    ("grafana.nomad", include_str!("../../assets/monitoring/grafana.nomad")),
];

/// Suffix every service name with the machine id so a shared consul
/// catalog keeps per-host entries apart. Only lines that set a `name`
/// and mention `service` are touched.
pub(crate) fn rewrite_service_names(job_content: &str, machine_id: &str) -> String {
    let lines: Vec<String> = job_content
        .lines()
        .map(|line| {
            if line.contains("name = ") && line.contains("service") {
                let Some((_, value)) = line.split_once('=') else {
                    return line.to_string();
                };
                let service_name = value.trim().trim_matches(['"', '\'']);
                format!("      name = \"{service_name}-{machine_id}\"")
            } else {
                line.to_string()
            }
        })
        .collect();

    lines.join("\n")
}

impl Installer<'_> {
    pub(crate) async fn setup_monitoring(&self) -> Result<()> {
        self.wait_for_nomad_cluster()
            .await
            .context("nomad not ready")?;

        for (job_name, template) in MONITORING_JOBS {
            let job = rewrite_service_names(template, &self.machine_id);
            let encoded = BASE64.encode(job.as_bytes());
            let temp_file = format!("/tmp/{job_name}");

            self.client
                .exec(&format!("echo '{encoded}' | base64 -d > {temp_file}"))
                .await
                .context("failed to create job file")?;

            self.client
                .exec(&format!("nomad job run {temp_file}"))
                .await
                .with_context(|| format!("failed to run job {job_name}"))?;

            let _ = self.client.exec(&format!("rm {temp_file}")).await;
        }

        Ok(())
    }

    async fn wait_for_nomad_cluster(&self) -> Result<()> {
        for _ in 0..CLUSTER_WAIT_ATTEMPTS {
            if self.client.exec("nomad status").await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(CLUSTER_WAIT_INTERVAL).await;
        }
        bail!("nomad not ready after {CLUSTER_WAIT_ATTEMPTS} attempts")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_name_lines_get_the_machine_suffix() {
        let job = r#"job "loki" {
  group "loki" {
    service {
      name = "loki-service"
      port = "loki"
    }
  }
}"#;
        let rewritten = rewrite_service_names(job, "abc123");
        assert!(rewritten.contains(r#"name = "loki-service-abc123""#));
        // Job and group names are untouched.
        assert!(rewritten.contains(r#"job "loki""#));
        assert!(rewritten.contains(r#"group "loki""#));
    }

    #[test]
    fn unrelated_name_lines_are_untouched() {
        let job = "  name = \"plain\"\n";
        assert_eq!(rewrite_service_names(job, "abc"), "  name = \"plain\"");
    }

    #[test]
    fn every_embedded_job_has_a_rewritable_service_name() {
        for (job_name, template) in MONITORING_JOBS {
            let rewritten = rewrite_service_names(template, "machine-x");
            assert!(
                rewritten.contains("-machine-x\""),
                "{job_name} has no service name line that picks up the machine suffix"
            );
        }
    }

    #[test]
    fn jobs_are_ordered_storage_first_dashboards_last() {
        assert_eq!(MONITORING_JOBS[0].0, "loki.nomad");
        assert_eq!(MONITORING_JOBS[5].0, "grafana.nomad");
    }
}
