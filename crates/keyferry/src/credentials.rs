use crate::error::ClientError;
use keyferry_proto::DeviceKey;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use zeroize::Zeroizing;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

#[cfg(unix)]
const CREDENTIALS_FILE_PERMS: u32 = 0o600;

/// What a paired companion needs to reach its agent.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Agent `host:port`.
    pub agent: String,
    /// Device id registered at pairing.
    pub device_id: String,
    /// Key shared with the agent.
    #[serde(rename = "key_hex")]
    pub key: DeviceKey,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("agent", &self.agent)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Reads credentials written by [`Credentials::save`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Credentials`] if the file is missing, readable
    /// by group or others, or malformed.
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        if !path.exists() {
            return Err(ClientError::Credentials(format!(
                "{} not found; run `keyferry pair` first",
                path.display()
            )));
        }

        #[cfg(unix)]
        {
            let mode = fs::metadata(path)?.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(ClientError::Credentials(format!(
                    "{} has overly permissive permissions ({:o}), must be 0600",
                    path.display(),
                    mode & 0o777
                )));
            }
        }

        let data = Zeroizing::new(fs::read(path)?);
        serde_json::from_slice(&data)
            .map_err(|e| ClientError::Credentials(format!("{}: {e}", path.display())))
    }

    /// Writes credentials with owner-only permissions, replacing any
    /// previous file.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the write
    /// fails.
    pub fn save(&self, path: &Path) -> Result<(), ClientError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = Zeroizing::new(
            serde_json::to_vec_pretty(self)
                .map_err(|e| ClientError::Credentials(e.to_string()))?,
        );

        let tmp = path.with_extension("tmp");
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        opts.mode(CREDENTIALS_FILE_PERMS);
        let mut file = opts.open(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_test_path() -> std::path::PathBuf {
        let random_suffix: u64 = rand::random();
        std::env::temp_dir().join(format!("keyferry_test_{random_suffix}"))
    }

    fn sample() -> Credentials {
        Credentials {
            agent: "192.168.1.20:47800".into(),
            device_id: "phone".into(),
            key: DeviceKey::generate(),
        }
    }

    #[test]
    fn save_then_load() {
        let dir = get_test_path();
        let path = dir.join("credentials.json");
        let creds = sample();
        creds.save(&path).unwrap();
        assert_eq!(Credentials::load(&path).unwrap(), creds);
        let _ = fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_owner_only() {
        let dir = get_test_path();
        let path = dir.join("credentials.json");
        sample().save(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let _ = fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn rejects_loose_permissions() {
        let dir = get_test_path();
        let path = dir.join("credentials.json");
        sample().save(&path).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        let err = Credentials::load(&path).unwrap_err().to_string();
        assert!(err.contains("overly permissive permissions"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_points_at_pairing() {
        let err = Credentials::load(&get_test_path().join("nope.json"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("keyferry pair"));
    }

    #[test]
    fn debug_hides_key() {
        let creds = sample();
        let shown = format!("{creds:?}");
        assert!(!shown.contains(creds.key.to_hex().as_str()));
    }
}
