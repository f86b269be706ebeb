use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const DEFAULT_MESH_DIR: &str = ".mesh";

/// Resolve the MESH home directory.
///
/// Priority: `$MESH_HOME` env var, then `~/.mesh`.
pub fn mesh_home() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("MESH_HOME") {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME").context("HOME env var not set")?;
    Ok(PathBuf::from(home).join(DEFAULT_MESH_DIR))
}

/// Directory layout under the MESH home. Shape is normative; the root moves
/// with `$MESH_HOME`.
#[derive(Debug, Clone)]
pub struct MeshPaths {
    pub root: PathBuf,
}

impl MeshPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn identity_file(&self) -> PathBuf {
        self.config_dir().join("identity")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.config_dir().join("agent-registry.json")
    }

    pub fn signing_keys_dir(&self) -> PathBuf {
        self.config_dir().join("signing-keys")
    }

    pub fn encryption_keys_dir(&self) -> PathBuf {
        self.config_dir().join("encryption-keys")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn circuit_file(&self) -> PathBuf {
        self.state_dir().join("circuit-breakers.json")
    }

    pub fn dead_letter_file(&self) -> PathBuf {
        self.state_dir().join("dead-letters.json")
    }

    pub fn peer_health_file(&self) -> PathBuf {
        self.state_dir().join("peer-health.json")
    }

    pub fn routing_file(&self) -> PathBuf {
        self.state_dir().join("routing-table.json")
    }

    pub fn nonce_log_file(&self) -> PathBuf {
        self.state_dir().join("seen-nonces.log")
    }

    pub fn queue_state_file(&self) -> PathBuf {
        self.state_dir().join("queue-state.json")
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.state_dir().join("conversations")
    }

    pub fn conversations_archive_dir(&self) -> PathBuf {
        self.state_dir().join("conversations-archive")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn audit_log_file(&self) -> PathBuf {
        self.logs_dir().join("mesh-audit.jsonl")
    }

    pub fn queue_replay_log_file(&self) -> PathBuf {
        self.logs_dir().join("queue-replay.jsonl")
    }

    pub fn discover_log_file(&self) -> PathBuf {
        self.logs_dir().join("discover.jsonl")
    }

    /// Create every directory in the layout, root restricted to `0700`.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.config_dir(),
            self.signing_keys_dir(),
            self.encryption_keys_dir(),
            self.state_dir(),
            self.conversations_dir(),
            self.conversations_archive_dir(),
            self.sessions_dir(),
            self.logs_dir(),
        ] {
            ensure_dir(&dir)?;
        }
        #[cfg(unix)]
        {
            std::fs::set_permissions(&self.root, std::fs::Permissions::from_mode(0o700))
                .with_context(|| format!("failed to restrict {}", self.root.display()))?;
        }
        Ok(())
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
    }
    Ok(())
}

/// Discover the default control socket path.
///
/// Checks `$MESH_SOCKET` env, then falls back to
/// `$XDG_RUNTIME_DIR/mesh/meshd.sock` or `/tmp/mesh-$UID/meshd.sock`.
pub fn default_socket_path() -> PathBuf {
    if let Ok(p) = std::env::var("MESH_SOCKET") {
        return PathBuf::from(p);
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("mesh").join("meshd.sock");
    }
    // SAFETY: getuid() is always safe to call and has no preconditions
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/mesh-{uid}/meshd.sock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_hangs_off_root() {
        let paths = MeshPaths::new(PathBuf::from("/var/lib/mesh"));
        assert_eq!(
            paths.registry_file(),
            PathBuf::from("/var/lib/mesh/config/agent-registry.json")
        );
        assert_eq!(
            paths.audit_log_file(),
            PathBuf::from("/var/lib/mesh/logs/mesh-audit.jsonl")
        );
        assert_eq!(
            paths.nonce_log_file(),
            PathBuf::from("/var/lib/mesh/state/seen-nonces.log")
        );
    }

    #[test]
    fn ensure_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let paths = MeshPaths::new(dir.path().join("mesh"));
        paths.ensure().unwrap();
        assert!(paths.signing_keys_dir().exists());
        assert!(paths.conversations_archive_dir().exists());
        assert!(paths.sessions_dir().exists());
    }

    #[cfg(unix)]
    #[test]
    fn root_permissions_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let paths = MeshPaths::new(dir.path().join("mesh"));
        paths.ensure().unwrap();
        let meta = std::fs::metadata(&paths.root).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
    }
}
