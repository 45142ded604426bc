//! [`SealedDeviceStore`] implementations.
//!
//! The sealed file store is the default. Its data file is
//! `[nonce (24)][XChaCha20-Poly1305 ciphertext]` over the JSON record list,
//! keyed by a 32-byte machine key kept in a separate `0600` file.

use crate::registry::{DeviceRecord, SealedDeviceStore, StoreError};
use keyferry_proto::crypto;
use keyferry_proto::types::{KEY_LEN, NONCE_LEN, TAG_LEN};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};
use zeroize::Zeroizing;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

const SECRET_FILE_PERMS: u32 = 0o600;
const STORE_AAD: &[u8] = b"keyferry-store-v1";

fn unavailable(what: &str, path: &Path, e: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(format!("{what} {}: {e}", path.display()))
}

/// Rejects files readable by group or others.
#[cfg(unix)]
fn check_permissions(path: &Path) -> Result<(), StoreError> {
    let mode = fs::metadata(path)
        .map_err(|e| unavailable("stat", path, e))?
        .permissions()
        .mode();
    if mode & 0o077 != 0 {
        return Err(StoreError::Unavailable(format!(
            "{} has overly permissive permissions ({:o}), must be 0600",
            path.display(),
            mode & 0o777
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

/// Writes `data` to `path` with owner-only permissions via a temp file and
/// rename, so readers never see a partial file.
fn write_private(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| unavailable("create", parent, e))?;
    }
    let tmp = path.with_extension("tmp");
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(SECRET_FILE_PERMS);
    let mut file = opts.open(&tmp).map_err(|e| unavailable("open", &tmp, e))?;
    file.write_all(data)
        .and_then(|()| file.sync_all())
        .map_err(|e| unavailable("write", &tmp, e))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|e| unavailable("rename", path, e))
}

/// Loads the machine key from `path`, generating it on first use.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] if the file has loose permissions,
/// the wrong length, or cannot be read or created.
pub fn load_or_generate_machine_key(path: &Path) -> Result<Zeroizing<[u8; KEY_LEN]>, StoreError> {
    if path.exists() {
        check_permissions(path)?;
        let bytes = Zeroizing::new(fs::read(path).map_err(|e| unavailable("read", path, e))?);
        if bytes.len() != KEY_LEN {
            return Err(StoreError::Unavailable(format!(
                "machine key must contain exactly {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&bytes);
        Ok(key)
    } else {
        let key = Zeroizing::new(crypto::random_bytes::<KEY_LEN>());
        write_private(path, key.as_slice())?;
        info!(path = %path.display(), "generated machine key");
        Ok(key)
    }
}

/// Device records sealed under a machine key.
#[derive(Debug)]
pub struct SealedFileStore {
    data_path: PathBuf,
    key_path: PathBuf,
}

impl SealedFileStore {
    /// Uses `data_path` for the sealed records and `key_path` for the
    /// machine key.
    #[must_use]
    pub fn new(data_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            data_path,
            key_path,
        }
    }
}

impl SealedDeviceStore for SealedFileStore {
    fn load(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        if !self.data_path.exists() {
            return Err(StoreError::NotPaired);
        }
        let key = load_or_generate_machine_key(&self.key_path)?;
        let data = fs::read(&self.data_path).map_err(|e| unavailable("read", &self.data_path, e))?;
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(StoreError::Unavailable("sealed store truncated".into()));
        }
        let (nonce, ct) = data.split_at(NONCE_LEN);
        let mut n = [0u8; NONCE_LEN];
        n.copy_from_slice(nonce);
        let plaintext = crypto::open(&key, &n, ct, STORE_AAD)
            .map_err(|_| StoreError::Unavailable("sealed store failed authentication".into()))?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| StoreError::Unavailable(format!("sealed store corrupt: {e}")))
    }

    fn save(&self, records: &[DeviceRecord]) -> Result<(), StoreError> {
        let key = load_or_generate_machine_key(&self.key_path)?;
        let plaintext = Zeroizing::new(
            serde_json::to_vec(records).map_err(|e| StoreError::Unavailable(e.to_string()))?,
        );
        let nonce = crypto::random_nonce();
        let ct = crypto::seal(&key, &nonce, &plaintext, STORE_AAD)
            .map_err(|_| StoreError::Unavailable("sealing failed".into()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        write_private(&self.data_path, &out)
    }
}

/// Device records as plain `0600` JSON. Only used when the operator opts in
/// to an insecure store.
#[derive(Debug)]
pub struct PlainFileStore {
    path: PathBuf,
}

impl PlainFileStore {
    /// Uses `path` for the JSON file.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        warn!(path = %path.display(), "device keys will be stored unencrypted");
        Self { path }
    }
}

impl SealedDeviceStore for PlainFileStore {
    fn load(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        if !self.path.exists() {
            return Err(StoreError::NotPaired);
        }
        check_permissions(&self.path)?;
        let data = Zeroizing::new(fs::read(&self.path).map_err(|e| unavailable("read", &self.path, e))?);
        serde_json::from_slice(&data)
            .map_err(|e| StoreError::Unavailable(format!("plain store corrupt: {e}")))
    }

    fn save(&self, records: &[DeviceRecord]) -> Result<(), StoreError> {
        let data = Zeroizing::new(
            serde_json::to_vec_pretty(records).map_err(|e| StoreError::Unavailable(e.to_string()))?,
        );
        write_private(&self.path, &data)
    }
}

/// Records held only in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Option<Vec<DeviceRecord>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SealedDeviceStore for MemoryStore {
    fn load(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StoreError::NotPaired)
    }

    fn save(&self, records: &[DeviceRecord]) -> Result<(), StoreError> {
        *self.records.lock().unwrap_or_else(PoisonError::into_inner) = Some(records.to_vec());
        Ok(())
    }
}
