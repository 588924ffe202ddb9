//! Persistent license key store.
//!
//! `runner init` validates a key against the license service and saves it
//! to `~/.runner-config.json` (mode 0600) so later commands can run
//! without `--license-key`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CONFIG_FILE_NAME: &str = ".runner-config.json";

#[derive(Debug, Serialize, Deserialize)]
struct StoredLicense {
    license_key: String,
}

fn config_path() -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| Error::Config("failed to resolve home directory".to_string()))?;
    Ok(home.join(CONFIG_FILE_NAME))
}

/// Load the saved license key. Returns `None` when no file exists.
pub fn load_license_key() -> Result<Option<String>> {
    load_license_key_from(&config_path()?)
}

/// Save the license key with owner-only permissions.
pub fn save_license_key(license_key: &str) -> Result<()> {
    save_license_key_to(&config_path()?, license_key)
}

fn load_license_key_from(path: &PathBuf) -> Result<Option<String>> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let stored: StoredLicense = serde_json::from_str(&data)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(stored.license_key))
}

fn save_license_key_to(path: &PathBuf, license_key: &str) -> Result<()> {
    let stored = StoredLicense {
        license_key: license_key.to_string(),
    };
    let data = serde_json::to_string_pretty(&stored)?;
    std::fs::write(path, data)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        save_license_key_to(&path, "brim-1234").unwrap();
        assert_eq!(load_license_key_from(&path).unwrap().as_deref(), Some("brim-1234"));
    }

    #[test]
    fn missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        assert!(load_license_key_from(&path).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        save_license_key_to(&path, "brim-1234").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn corrupted_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_license_key_from(&path).is_err());
    }
}
