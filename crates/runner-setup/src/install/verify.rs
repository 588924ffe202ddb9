//! Machine requirement verification.

use anyhow::{bail, Context, Result};

use super::Installer;

const MIN_CORES: u32 = 2;
const MIN_MEMORY_GIB: u64 = 32;
const MIN_STORAGE_GIB: f64 = 20.0;

/// Check raw probe values against the minimums, surfacing each deficit
/// as a distinct message.
pub(crate) fn check_requirements(cores: u32, memory_kib: u64, storage_kib: u64) -> Result<()> {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let memory_gib = (memory_kib as f64 / 1024.0 / 1024.0).round() as u64;
    let storage_gib = storage_kib as f64 / 1024.0 / 1024.0;

    if cores < MIN_CORES {
        bail!("insufficient CPU cores: have {cores}, need minimum of {MIN_CORES} cores");
    }
    if memory_gib < MIN_MEMORY_GIB {
        bail!("insufficient memory: have {memory_gib} GB, need minimum of {MIN_MEMORY_GIB} GB");
    }
    if storage_gib < MIN_STORAGE_GIB {
        bail!(
            "insufficient storage: have {storage_gib:.2} GB, need minimum of {MIN_STORAGE_GIB:.2} GB"
        );
    }

    Ok(())
}

impl Installer<'_> {
    pub(crate) async fn verify_machine_requirements(&self) -> Result<()> {
        let cores: u32 = self
            .client
            .exec_capture("nproc")
            .await?
            .trim()
            .parse()
            .context("failed to parse core count")?;

        let storage_kib: u64 = self
            .client
            .exec_capture("df -k / | awk 'NR==2{print $4}'")
            .await?
            .trim()
            .parse()
            .context("failed to parse free storage")?;

        let memory_kib: u64 = self
            .client
            .exec_capture("free -k | awk '/^Mem:/ {print $2}'")
            .await?
            .trim()
            .parse()
            .context("failed to parse total memory")?;

        check_requirements(cores, memory_kib, storage_kib)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB_KIB: u64 = 1024 * 1024;

    #[test]
    fn capable_machine_passes() {
        assert!(check_requirements(4, 64 * GIB_KIB, 100 * GIB_KIB).is_ok());
    }

    #[test]
    fn exact_minimums_pass() {
        assert!(check_requirements(2, 32 * GIB_KIB, 20 * GIB_KIB).is_ok());
    }

    #[test]
    fn too_few_cores_names_the_deficit() {
        let err = check_requirements(1, 64 * GIB_KIB, 100 * GIB_KIB)
            .unwrap_err()
            .to_string();
        assert!(err.contains("insufficient CPU cores"), "{err}");
        assert!(err.contains("have 1"), "{err}");
    }

    #[test]
    fn too_little_memory_names_the_deficit() {
        let err = check_requirements(4, 8 * GIB_KIB, 100 * GIB_KIB)
            .unwrap_err()
            .to_string();
        assert!(err.contains("insufficient memory"), "{err}");
        assert!(err.contains("have 8 GB"), "{err}");
    }

    #[test]
    fn too_little_storage_names_the_deficit() {
        let err = check_requirements(4, 64 * GIB_KIB, 10 * GIB_KIB)
            .unwrap_err()
            .to_string();
        assert!(err.contains("insufficient storage"), "{err}");
    }

    #[test]
    fn memory_close_to_threshold_rounds() {
        // 31.6 GiB rounds to 32 and passes.
        let almost = (31.6 * GIB_KIB as f64) as u64;
        assert!(check_requirements(2, almost, 20 * GIB_KIB).is_ok());

        // 31.4 GiB rounds to 31 and fails.
        let short = (31.4 * GIB_KIB as f64) as u64;
        assert!(check_requirements(2, short, 20 * GIB_KIB).is_err());
    }
}
