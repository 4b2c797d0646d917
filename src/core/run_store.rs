//! File-based persistence for release runs.
//!
//! Layout under the runs directory:
//!
//! ```text
//! <runs>/<run_id>/run.json      snapshot of the ReleaseRun aggregate
//! <runs>/<run_id>/events.jsonl  append-only audit log
//! <runs>/<run_id>/artifacts/    copies of rendered release files
//! <runs>/<run_id>/handles/      in-flight external work per step
//! ```
//!
//! Snapshots are written with compare-and-set on the run's revision while
//! holding an exclusive lock, so two concurrent writers can never interleave;
//! the loser gets `StaleRunState` and must reload.

use std::fs::{self as stdfs, OpenOptions as StdOpenOptions};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;
use uuid::Uuid;

use crate::domain::{Event, ReleaseRun};

const SNAPSHOT_FILE: &str = "run.json";
const EVENTS_FILE: &str = "events.jsonl";
const RUN_LOCK_FILE: &str = "run.lock";
const STORE_LOCK_FILE: &str = ".runs.lock";
const HANDLES_DIR: &str = "handles";

/// Run persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Run {0} not found")]
    NotFound(Uuid),

    #[error("Run {0} already exists")]
    AlreadyExists(Uuid),

    #[error("Stale state for run {run_id}: expected revision {expected}, found {actual}")]
    StaleRunState {
        run_id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("An unfinished run ({run_id}) already exists for branch '{branch}'")]
    ActiveRunExists { branch: String, run_id: Uuid },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable store for release runs
#[derive(Debug, Clone)]
pub struct RunStore {
    base_dir: PathBuf,
}

impl RunStore {
    /// Store rooted at an explicit runs directory
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Store at the configured runs directory ($RELEASE_HOME/runs)
    pub fn open_default() -> anyhow::Result<Self> {
        Ok(Self::new(crate::config::runs_dir()?))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.base_dir.join(run_id.to_string())
    }

    pub fn events_path(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join(EVENTS_FILE)
    }

    pub fn artifacts_dir(&self, run_id: Uuid) -> PathBuf {
        self.run_dir(run_id).join("artifacts")
    }

    /// Persist a brand new run (revision 1)
    ///
    /// Fails if another unfinished run targets the same release branch.
    pub async fn create(&self, run: &mut ReleaseRun) -> Result<(), StoreError> {
        let base_dir = self.base_dir.clone();
        let snapshot = run.clone();

        let written = blocking(move || {
            stdfs::create_dir_all(&base_dir)?;
            let _guard = lock_file(&base_dir.join(STORE_LOCK_FILE))?;

            let branch = &snapshot.manifest.release_branch;
            if let Some(active) = find_active_sync(&base_dir, branch)? {
                return Err(StoreError::ActiveRunExists {
                    branch: branch.clone(),
                    run_id: active,
                });
            }

            let run_dir = base_dir.join(snapshot.run_id.to_string());
            if run_dir.join(SNAPSHOT_FILE).exists() {
                return Err(StoreError::AlreadyExists(snapshot.run_id));
            }
            stdfs::create_dir_all(run_dir.join("artifacts"))?;

            let mut next = snapshot;
            next.revision = 1;
            next.updated_at = Utc::now();
            write_snapshot(&run_dir, &next)?;
            Ok(next)
        })
        .await?;

        *run = written;
        debug!(run_id = %run.run_id, "Run created");
        Ok(())
    }

    /// Load the latest snapshot of a run
    pub async fn load(&self, run_id: Uuid) -> Result<ReleaseRun, StoreError> {
        let run_dir = self.run_dir(run_id);
        blocking(move || read_snapshot(&run_dir)?.ok_or(StoreError::NotFound(run_id))).await
    }

    /// Compare-and-set write of a run snapshot
    ///
    /// Succeeds only if the persisted revision still equals `run.revision`;
    /// on success `run.revision` is bumped to the new persisted revision.
    pub async fn save(&self, run: &mut ReleaseRun) -> Result<(), StoreError> {
        let run_dir = self.run_dir(run.run_id);
        let snapshot = run.clone();

        let written = blocking(move || {
            let _guard = lock_file(&run_dir.join(RUN_LOCK_FILE))?;

            let current = read_snapshot(&run_dir)?.ok_or(StoreError::NotFound(snapshot.run_id))?;
            if current.revision != snapshot.revision {
                return Err(StoreError::StaleRunState {
                    run_id: snapshot.run_id,
                    expected: snapshot.revision,
                    actual: current.revision,
                });
            }

            let mut next = snapshot;
            next.revision += 1;
            next.updated_at = Utc::now();
            write_snapshot(&run_dir, &next)?;
            Ok(next)
        })
        .await?;

        run.revision = written.revision;
        run.updated_at = written.updated_at;
        Ok(())
    }

    /// Append an event to the run's audit log
    pub async fn append(&self, event: &Event) -> anyhow::Result<()> {
        let events_path = self.events_path(event.run_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", events_path.display()))?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all audit events of a run in order
    pub async fn replay(&self, run_id: Uuid) -> anyhow::Result<Vec<Event>> {
        let events_path = self.events_path(run_id);
        if !events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Keep a copy of a rendered release file with the run
    pub async fn store_artifact(
        &self,
        run_id: Uuid,
        relative_path: &str,
        content: &str,
    ) -> anyhow::Result<PathBuf> {
        let artifact_path = self.artifacts_dir(run_id).join(relative_path);
        if let Some(parent) = artifact_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        fs::write(&artifact_path, content)
            .await
            .with_context(|| format!("Failed to write artifact: {}", artifact_path.display()))?;

        Ok(artifact_path)
    }

    /// Where a step's in-flight handle is kept
    pub fn handle_path(&self, run_id: Uuid, step_name: &str) -> PathBuf {
        self.run_dir(run_id)
            .join(HANDLES_DIR)
            .join(format!("{}.json", step_name.replace([':', '/'], "_")))
    }

    /// Remember external work a step started, so a later attempt can pick it up
    pub async fn save_handle<T: Serialize>(
        &self,
        run_id: Uuid,
        step_name: &str,
        handle: &T,
    ) -> anyhow::Result<()> {
        let path = self.handle_path(run_id, step_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(handle)?)
            .await
            .with_context(|| format!("Failed to write handle: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to write handle: {}", path.display()))?;
        Ok(())
    }

    /// Handle saved by an earlier attempt of the step, if any
    pub async fn load_handle<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        step_name: &str,
    ) -> anyhow::Result<Option<T>> {
        let path = self.handle_path(run_id, step_name);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read handle: {}", path.display()))
            }
        };
        let handle = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse handle: {}", path.display()))?;
        Ok(Some(handle))
    }

    /// List all run IDs in the store
    pub async fn list_runs(&self) -> anyhow::Result<Vec<Uuid>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }

    /// Load persisted runs, newest first
    ///
    /// Directories without a snapshot (e.g. a crash during creation) are skipped.
    pub async fn load_recent(&self, limit: Option<usize>) -> anyhow::Result<Vec<ReleaseRun>> {
        let mut runs = Vec::new();
        for run_id in self.list_runs().await? {
            match self.load(run_id).await {
                Ok(run) => runs.push(run),
                Err(StoreError::NotFound(_)) => {
                    debug!(%run_id, "Skipping run directory without snapshot");
                }
                Err(e) => return Err(e.into()),
            }
        }

        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }

    /// Unfinished run targeting `branch`, if any
    pub async fn find_active(&self, branch: &str) -> Result<Option<Uuid>, StoreError> {
        let base_dir = self.base_dir.clone();
        let branch = branch.to_string();
        blocking(move || find_active_sync(&base_dir, &branch)).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

fn lock_file(path: &Path) -> Result<stdfs::File, StoreError> {
    let file = StdOpenOptions::new().create(true).write(true).open(path)?;
    file.lock_exclusive()?;
    Ok(file)
}

fn read_snapshot(run_dir: &Path) -> Result<Option<ReleaseRun>, StoreError> {
    let path = run_dir.join(SNAPSHOT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let content = stdfs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

/// Write via temp file + rename so readers never see a torn snapshot
fn write_snapshot(run_dir: &Path, run: &ReleaseRun) -> Result<(), StoreError> {
    let tmp = run_dir.join(format!("{}.tmp", SNAPSHOT_FILE));
    stdfs::write(&tmp, serde_json::to_string_pretty(run)?)?;
    stdfs::rename(&tmp, run_dir.join(SNAPSHOT_FILE))?;
    Ok(())
}

fn find_active_sync(base_dir: &Path, branch: &str) -> Result<Option<Uuid>, StoreError> {
    if !base_dir.exists() {
        return Ok(None);
    }

    for entry in stdfs::read_dir(base_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(run_id) = entry.file_name().to_str().and_then(|n| Uuid::parse_str(n).ok()) else {
            continue;
        };
        if let Some(run) = read_snapshot(&entry.path())? {
            if run.manifest.release_branch == branch && !run.is_terminal() {
                return Ok(Some(run_id));
            }
        }
    }

    Ok(None)
}

/// Generate an idempotency key for a step side effect within a run
pub fn generate_idempotency_key(run_id: Uuid, step_name: &str, input: &str) -> String {
    let input_hash = hash_input(input);
    format!("{}:{}:{}", run_id, step_name, input_hash)
}

/// Hash input content (first 16 hex chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
