//! Version ledger: the record of released versions per release line.
//!
//! Guards against releasing out of order (a proposed patch must build on the
//! line's last release) and against tagging the same version twice.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::ReleaseVersion;

/// Errors raised by the version ledger
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Cannot release a patch on top of {current}: last released version on {line} is {last_released}")]
    InvalidTransition {
        current: ReleaseVersion,
        line: String,
        last_released: ReleaseVersion,
    },

    #[error("Version {version} is older than {last_released}, the last release on its line")]
    NonMonotonic {
        version: ReleaseVersion,
        last_released: ReleaseVersion,
    },

    #[error("Version {0} was already released")]
    DuplicateVersion(ReleaseVersion),

    #[error("Ledger IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// History of one `major.minor` line
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineHistory {
    /// Every committed version on this line
    pub released: BTreeSet<ReleaseVersion>,

    pub updated_at: Option<DateTime<Utc>>,
}

impl LineHistory {
    pub fn last_released(&self) -> Option<ReleaseVersion> {
        self.released.iter().next_back().copied()
    }
}

/// Released versions keyed by line ("0.19")
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionLedger {
    #[serde(default)]
    pub lines: BTreeMap<String, LineHistory>,
}

impl VersionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last released version on the line `version` belongs to
    pub fn last_released(&self, version: &ReleaseVersion) -> Option<ReleaseVersion> {
        self.lines
            .get(&version.line())
            .and_then(LineHistory::last_released)
    }

    pub fn is_released(&self, version: &ReleaseVersion) -> bool {
        self.lines
            .get(&version.line())
            .map(|h| h.released.contains(version))
            .unwrap_or(false)
    }

    /// The next patch after `current`
    ///
    /// `current` must be the line's last release. A line without history
    /// accepts any starting point.
    pub fn propose_patch(&self, current: ReleaseVersion) -> Result<ReleaseVersion, LedgerError> {
        if let Some(last_released) = self.last_released(&current) {
            if last_released != current {
                return Err(LedgerError::InvalidTransition {
                    current,
                    line: current.line(),
                    last_released,
                });
            }
        }

        Ok(current.next_patch())
    }

    /// Record `version` as released
    pub fn commit(&mut self, version: ReleaseVersion) -> Result<(), LedgerError> {
        if self.is_released(&version) {
            return Err(LedgerError::DuplicateVersion(version));
        }

        if let Some(last_released) = self.last_released(&version) {
            if version < last_released {
                return Err(LedgerError::NonMonotonic {
                    version,
                    last_released,
                });
            }
        }

        let history = self.lines.entry(version.line()).or_default();
        history.released.insert(version);
        history.updated_at = Some(Utc::now());
        Ok(())
    }
}

/// File-backed ledger (`<home>/ledger.json`), updated under an exclusive lock
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Ledger at the configured default location
    pub fn open_default() -> anyhow::Result<Self> {
        Ok(Self::new(crate::config::ledger_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the current ledger (empty when no file exists yet)
    pub async fn load(&self) -> Result<VersionLedger, LedgerError> {
        let path = self.path.clone();
        run_blocking(move || read_ledger(&path)).await
    }

    /// Atomically read, modify and write the ledger
    pub async fn update<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut VersionLedger) -> Result<T, LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        run_blocking(move || {
            let _lock = lock_exclusive(&path)?;
            let mut ledger = read_ledger(&path)?;
            let out = f(&mut ledger)?;
            write_ledger(&path, &ledger)?;
            debug!(path = %path.display(), "Ledger updated");
            Ok(out)
        })
        .await
    }

    /// Commit a version to the persisted ledger
    pub async fn commit(&self, version: ReleaseVersion) -> Result<(), LedgerError> {
        self.update(move |ledger| ledger.commit(version)).await?;
        info!(%version, "Version recorded in ledger");
        Ok(())
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, LedgerError>
where
    F: FnOnce() -> Result<T, LedgerError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LedgerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

fn lock_exclusive(path: &Path) -> Result<File, LedgerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let lock = OpenOptions::new()
        .create(true)
        .write(true)
        .open(path.with_extension("lock"))?;
    lock.lock_exclusive()?;
    Ok(lock)
}

fn read_ledger(path: &Path) -> Result<VersionLedger, LedgerError> {
    if !path.exists() {
        return Ok(VersionLedger::new());
    }
    let content = fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(VersionLedger::new());
    }
    Ok(serde_json::from_str(&content)?)
}

fn write_ledger(path: &Path, ledger: &VersionLedger) -> Result<(), LedgerError> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(ledger)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_propose_patch_increments_patch() {
        let ledger = VersionLedger::new();
        let next = ledger.propose_patch(ReleaseVersion::new(0, 19, 3)).unwrap();
        assert_eq!(next, ReleaseVersion::new(0, 19, 4));
    }

    #[test]
    fn test_duplicate_commit_rejected() {
        let mut ledger = VersionLedger::new();
        ledger.commit(ReleaseVersion::new(0, 19, 4)).unwrap();
        let err = ledger.commit(ReleaseVersion::new(0, 19, 4)).unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateVersion(v) if v == ReleaseVersion::new(0, 19, 4)));
    }

    #[test]
    fn test_propose_requires_last_release() {
        let mut ledger = VersionLedger::new();
        ledger.commit(ReleaseVersion::new(0, 19, 3)).unwrap();

        // Out of order: 0.19.2 is not the last release on the line
        let err = ledger.propose_patch(ReleaseVersion::new(0, 19, 2)).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));

        // Other lines are independent
        assert_eq!(
            ledger.propose_patch(ReleaseVersion::new(0, 18, 7)).unwrap(),
            ReleaseVersion::new(0, 18, 8)
        );
    }

    #[test]
    fn test_commit_rejects_regression() {
        let mut ledger = VersionLedger::new();
        ledger.commit(ReleaseVersion::new(1, 2, 5)).unwrap();
        let err = ledger.commit(ReleaseVersion::new(1, 2, 4)).unwrap_err();
        assert!(matches!(err, LedgerError::NonMonotonic { .. }));
        assert_eq!(
            ledger.last_released(&ReleaseVersion::new(1, 2, 0)),
            Some(ReleaseVersion::new(1, 2, 5))
        );
    }

    #[tokio::test]
    async fn test_store_persists_commits() {
        let temp = TempDir::new().unwrap();
        let store = LedgerStore::new(temp.path().join("ledger.json"));

        assert_eq!(store.load().await.unwrap(), VersionLedger::new());

        store.commit(ReleaseVersion::new(0, 19, 4)).await.unwrap();
        let reloaded = LedgerStore::new(temp.path().join("ledger.json"));
        let ledger = reloaded.load().await.unwrap();
        assert!(ledger.is_released(&ReleaseVersion::new(0, 19, 4)));

        let err = reloaded.commit(ReleaseVersion::new(0, 19, 4)).await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateVersion(_)));
    }
}
