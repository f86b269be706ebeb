use anyhow::{Context, Result, bail};
use mesh_proto::ids::from_hex;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const KEY_BYTES: usize = 32;

/// Name of the fleet-wide fallback encryption key.
pub const FLEET_KEY: &str = "fleet";

/// Directory of per-peer 256-bit keys stored as hex files, owner-only.
/// Used for both signing keys (`config/signing-keys/`) and encryption keys
/// (`config/encryption-keys/`).
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.key"))
    }

    /// Load the key for a peer. `Ok(None)` when no key file exists; an
    /// unreadable or malformed key file is an error, not an absent key.
    pub fn load(&self, name: &str) -> Result<Option<Zeroizing<[u8; KEY_BYTES]>>> {
        let path = self.key_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let hex = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let bytes = from_hex(hex.trim())
            .with_context(|| format!("{} is not valid hex", path.display()))?;
        if bytes.len() != KEY_BYTES {
            bail!(
                "{} holds {} bytes, expected {KEY_BYTES}",
                path.display(),
                bytes.len()
            );
        }
        let mut key = Zeroizing::new([0u8; KEY_BYTES]);
        key.copy_from_slice(&bytes);
        Ok(Some(key))
    }

    /// Load a peer's key, falling back to the fleet-wide key. Encryption
    /// keys use this; signing keys are strictly pairwise.
    pub fn load_or_fleet(&self, name: &str) -> Result<Option<Zeroizing<[u8; KEY_BYTES]>>> {
        if let Some(key) = self.load(name)? {
            return Ok(Some(key));
        }
        self.load(FLEET_KEY)
    }

    /// Persist a key as hex, file tightened to owner-only.
    pub fn store(&self, name: &str, key: &[u8; KEY_BYTES]) -> Result<()> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)
                .with_context(|| format!("failed to create {}", self.dir.display()))?;
        }
        let path = self.key_path(name);
        std::fs::write(&path, mesh_proto::ids::to_hex(key))
            .with_context(|| format!("failed to write {}", path.display()))?;
        #[cfg(unix)]
        {
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to set permissions on {}", path.display()))?;
        }
        Ok(())
    }

    pub fn has(&self, name: &str) -> bool {
        self.key_path(name).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path().join("signing-keys"));
        let key = [0xab; KEY_BYTES];
        store.store("bravo", &key).unwrap();
        let loaded = store.load("bravo").unwrap().unwrap();
        assert_eq!(*loaded, key);
        assert!(store.load("charlie").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path().to_path_buf());
        store.store("bravo", &[0x01; KEY_BYTES]).unwrap();
        let meta = std::fs::metadata(dir.path().join("bravo.key")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn fleet_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path().to_path_buf());
        store.store(FLEET_KEY, &[0x07; KEY_BYTES]).unwrap();
        let key = store.load_or_fleet("bravo").unwrap().unwrap();
        assert_eq!(*key, [0x07; KEY_BYTES]);

        store.store("bravo", &[0x08; KEY_BYTES]).unwrap();
        let key = store.load_or_fleet("bravo").unwrap().unwrap();
        assert_eq!(*key, [0x08; KEY_BYTES]);
    }

    #[test]
    fn truncated_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path().to_path_buf());
        std::fs::write(dir.path().join("bad.key"), "abcd").unwrap();
        assert!(store.load("bad").is_err());
    }
}
