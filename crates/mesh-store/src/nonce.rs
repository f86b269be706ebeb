use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// How long a nonce is accepted after its envelope timestamp (ms).
pub const DEFAULT_REPLAY_WINDOW_MS: u64 = 300_000;

/// Tolerated forward clock skew on envelope timestamps (ms).
pub const MAX_FUTURE_SKEW_MS: u64 = 60_000;

/// Why an envelope failed the replay gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayVerdict {
    Fresh,
    /// Nonce already seen inside the window.
    Seen,
    /// Envelope timestamp older than the replay window.
    TooOld,
    /// Envelope timestamp too far in the future.
    FutureSkew,
}

/// Append-only log of accepted nonces with their arrival times, backed by
/// `state/seen-nonces.log` (one `epoch_ms nonce` pair per line). Entries are
/// kept in memory for O(1) checks; the file is compacted when trimming drops
/// entries past twice the replay window.
pub struct NonceLog {
    path: PathBuf,
    seen: HashMap<String, u64>,
    window_ms: u64,
}

impl NonceLog {
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_window(path, DEFAULT_REPLAY_WINDOW_MS)
    }

    pub fn load_with_window(path: &Path, window_ms: u64) -> Result<Self> {
        let mut seen = HashMap::new();
        if path.exists() {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            for line in data.lines() {
                let mut parts = line.splitn(2, ' ');
                if let (Some(ts), Some(nonce)) = (parts.next(), parts.next())
                    && let Ok(ts) = ts.parse::<u64>()
                {
                    seen.insert(nonce.to_string(), ts);
                }
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            seen,
            window_ms,
        })
    }

    /// Gate an inbound envelope: checks the timestamp against the replay
    /// window and the nonce against the seen set, recording fresh nonces
    /// with their arrival time.
    pub fn check_and_record(
        &mut self,
        nonce: &str,
        envelope_ts_ms: u64,
        now_ms: u64,
    ) -> Result<ReplayVerdict> {
        if envelope_ts_ms + self.window_ms < now_ms {
            return Ok(ReplayVerdict::TooOld);
        }
        if envelope_ts_ms > now_ms + MAX_FUTURE_SKEW_MS {
            return Ok(ReplayVerdict::FutureSkew);
        }
        if self.seen.contains_key(nonce) {
            return Ok(ReplayVerdict::Seen);
        }
        self.seen.insert(nonce.to_string(), now_ms);
        self.append(nonce, now_ms)?;
        Ok(ReplayVerdict::Fresh)
    }

    /// Drop entries older than twice the replay window and compact the log
    /// file. Returns how many entries were trimmed.
    pub fn trim(&mut self, now_ms: u64) -> Result<usize> {
        let horizon = now_ms.saturating_sub(self.window_ms * 2);
        let before = self.seen.len();
        self.seen.retain(|_, ts| *ts >= horizon);
        let trimmed = before - self.seen.len();
        if trimmed > 0 {
            self.compact()?;
        }
        Ok(trimmed)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn append(&self, nonce: &str, now_ms: u64) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        writeln!(file, "{now_ms} {nonce}")?;
        Ok(())
    }

    fn compact(&self) -> Result<()> {
        let mut out = String::new();
        for (nonce, ts) in &self.seen {
            out.push_str(&format!("{ts} {nonce}\n"));
        }
        crate::fsutil::atomic_write_bytes(&self.path, out.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(dir: &Path) -> NonceLog {
        NonceLog::load(&dir.join("seen-nonces.log")).unwrap()
    }

    #[test]
    fn fresh_then_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let mut nl = log(dir.path());
        let now = 1_000_000;
        assert_eq!(
            nl.check_and_record("n1", now, now).unwrap(),
            ReplayVerdict::Fresh
        );
        assert_eq!(
            nl.check_and_record("n1", now, now + 1000).unwrap(),
            ReplayVerdict::Seen
        );
        assert_eq!(
            nl.check_and_record("n2", now, now).unwrap(),
            ReplayVerdict::Fresh
        );
    }

    #[test]
    fn stale_timestamp_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut nl = log(dir.path());
        let now = 10_000_000;
        assert_eq!(
            nl.check_and_record("n1", now - DEFAULT_REPLAY_WINDOW_MS - 1, now)
                .unwrap(),
            ReplayVerdict::TooOld
        );
    }

    #[test]
    fn future_skew_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut nl = log(dir.path());
        let now = 10_000_000;
        assert_eq!(
            nl.check_and_record("n1", now + MAX_FUTURE_SKEW_MS + 1, now)
                .unwrap(),
            ReplayVerdict::FutureSkew
        );
        // Just inside the skew allowance is fine.
        assert_eq!(
            nl.check_and_record("n2", now + MAX_FUTURE_SKEW_MS, now)
                .unwrap(),
            ReplayVerdict::Fresh
        );
    }

    #[test]
    fn persistence_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let now = 5_000_000;
        {
            let mut nl = log(dir.path());
            nl.check_and_record("n1", now, now).unwrap();
        }
        let mut nl = log(dir.path());
        assert_eq!(
            nl.check_and_record("n1", now, now + 10).unwrap(),
            ReplayVerdict::Seen
        );
    }

    #[test]
    fn trim_drops_past_double_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut nl = log(dir.path());
        let start = 1_000_000;
        nl.check_and_record("old", start, start).unwrap();
        let later = start + DEFAULT_REPLAY_WINDOW_MS * 2 + 1;
        nl.check_and_record("new", later, later).unwrap();

        assert_eq!(nl.trim(later).unwrap(), 1);
        assert_eq!(nl.len(), 1);

        // The trimmed nonce is gone from the reloaded file too.
        let nl2 = log(dir.path());
        assert_eq!(nl2.len(), 1);
    }
}
