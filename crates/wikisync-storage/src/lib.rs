//! Repository seams over the relational mirror plus the crash-resume checkpoint log.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;
use wikisync_core::{
    Attribution, CheckpointEntry, DeepContent, DeepIntent, DirtyMark, DirtyPage,
    IdentityConflict, Lease, Page, PageMetaStaging, PageState, PageVersion, Phase, QueueSummary,
    Revision, Vote,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "wikisync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("current version of page {page_id} moved (expected {expected:?}, found {found:?})")]
    VersionConflict {
        page_id: i64,
        expected: Option<i64>,
        found: Option<i64>,
    },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity} {key} already exists")]
    Duplicate { entity: &'static str, key: String },
    #[error("stored value could not be decoded: {0}")]
    Codec(String),
}

#[async_trait]
pub trait PageRepo: Send + Sync {
    async fn page(&self, page_id: i64) -> Result<Option<Page>, StoreError>;
    async fn page_by_url(&self, url: &str) -> Result<Option<Page>, StoreError>;
    async fn page_by_upstream_id(&self, upstream_id: i64) -> Result<Option<Page>, StoreError>;
    async fn insert_page(
        &self,
        upstream_id: i64,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<Page, StoreError>;
    async fn update_page_url(
        &self,
        page_id: i64,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    /// Returns false when the same conflict was already on record.
    async fn record_identity_conflict(
        &self,
        conflict: &IdentityConflict,
    ) -> Result<bool, StoreError>;
    async fn identity_conflicts(&self) -> Result<Vec<IdentityConflict>, StoreError>;
}

#[async_trait]
pub trait StagingRepo: Send + Sync {
    async fn clear_staging(&self) -> Result<(), StoreError>;
    async fn upsert_staging(&self, rows: &[PageMetaStaging]) -> Result<(), StoreError>;
    async fn staging_rows(&self) -> Result<Vec<PageMetaStaging>, StoreError>;
}

#[async_trait]
pub trait VersionRepo: Send + Sync {
    async fn current_version(&self, page_id: i64) -> Result<Option<PageVersion>, StoreError>;
    async fn versions(&self, page_id: i64) -> Result<Vec<PageVersion>, StoreError>;
    /// Close `expected_current` at `now` and open a new current version holding `state`.
    ///
    /// Fails with [`StoreError::VersionConflict`] when the open version is not `expected_current`.
    async fn open_version(
        &self,
        page_id: i64,
        expected_current: Option<i64>,
        state: &PageState,
        now: DateTime<Utc>,
    ) -> Result<PageVersion, StoreError>;
    /// First deep hydration of a version that has no source yet.
    async fn fill_deep_fields(
        &self,
        version_id: i64,
        source: Option<&str>,
        text_content: Option<&str>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeCounts {
    pub attributions: usize,
    pub votes: usize,
    pub revisions: usize,
}

#[async_trait]
pub trait ContentRepo: Send + Sync {
    /// Insert records absent from `version_id`; existing rows are never removed or changed.
    async fn merge_deep_content(
        &self,
        version_id: i64,
        content: &DeepContent,
    ) -> Result<MergeCounts, StoreError>;
    async fn attributions(&self, version_id: i64) -> Result<Vec<Attribution>, StoreError>;
    async fn votes(&self, version_id: i64) -> Result<Vec<Vote>, StoreError>;
    async fn revisions(&self, version_id: i64) -> Result<Vec<Revision>, StoreError>;
}

#[async_trait]
pub trait DirtyQueueRepo: Send + Sync {
    async fn mark_dirty(
        &self,
        page_id: i64,
        mark: &DirtyMark,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn dirty_page(&self, page_id: i64) -> Result<Option<DirtyPage>, StoreError>;
    /// Rows pending for `phase`, cheapest first.
    async fn pending(&self, phase: Phase, limit: Option<usize>)
        -> Result<Vec<DirtyPage>, StoreError>;
    /// Atomically take the phase lease when the row is pending and unleased (or the lease expired).
    async fn claim(
        &self,
        page_id: i64,
        phase: Phase,
        lease: Lease,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
    async fn complete_phase_b(
        &self,
        page_id: i64,
        owner: Uuid,
        deep: DeepIntent,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn complete_phase_c(
        &self,
        page_id: i64,
        owner: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    /// Release the lease, leave `done` false, append `previously_failed` and keep the error text.
    async fn record_failure(
        &self,
        page_id: i64,
        phase: Phase,
        owner: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn release(&self, page_id: i64, phase: Phase, owner: Uuid) -> Result<bool, StoreError>;
    async fn queue_summary(&self) -> Result<QueueSummary, StoreError>;
}

/// Everything the sync engine writes, behind one object.
pub trait SyncStore: PageRepo + StagingRepo + VersionRepo + ContentRepo + DirtyQueueRepo {}

impl<T> SyncStore for T where T: PageRepo + StagingRepo + VersionRepo + ContentRepo + DirtyQueueRepo
{}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding checkpoint entry: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("run marker {path} does not hold a run id: {value}")]
    BadMarker { path: PathBuf, value: String },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

const RUN_MARKER: &str = "CURRENT";

/// Append-only, phase-scoped JSONL logs for one run, resumable across restarts.
///
/// Layout: `<root>/CURRENT` names the active run, `<root>/<run_id>/<phase>.jsonl` holds entries.
#[derive(Debug)]
pub struct CheckpointStore {
    root: PathBuf,
    run_id: Uuid,
    run_dir: PathBuf,
    resumed: bool,
    append_lock: Mutex<()>,
}

impl CheckpointStore {
    /// Resume the run named by the marker, or start a new one and write the marker.
    pub async fn open_or_resume(root: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(io_err(&root))?;
        let marker = root.join(RUN_MARKER);

        if fs::try_exists(&marker).await.map_err(io_err(&marker))? {
            let text = fs::read_to_string(&marker).await.map_err(io_err(&marker))?;
            let value = text.trim();
            let run_id = Uuid::parse_str(value).map_err(|_| CheckpointError::BadMarker {
                path: marker.clone(),
                value: value.to_string(),
            })?;
            info!(%run_id, "resuming checkpointed run");
            return Self::open_run(root, run_id, true).await;
        }

        let run_id = Uuid::new_v4();
        write_atomically(&marker, run_id.to_string().as_bytes()).await?;
        Self::open_run(root, run_id, false).await
    }

    async fn open_run(root: PathBuf, run_id: Uuid, resumed: bool) -> Result<Self, CheckpointError> {
        let run_dir = root.join(run_id.to_string());
        fs::create_dir_all(&run_dir).await.map_err(io_err(&run_dir))?;
        Ok(Self {
            root,
            run_id,
            run_dir,
            resumed,
            append_lock: Mutex::new(()),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn phase_path(&self, phase: Phase) -> PathBuf {
        self.run_dir.join(format!("{}.jsonl", phase.as_str()))
    }

    /// Append one line and flush it to disk before returning.
    ///
    /// A torn final line left by a crash is terminated first so the new entry
    /// starts on its own line.
    pub async fn append(&self, entry: &CheckpointEntry) -> Result<(), CheckpointError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let path = self.phase_path(entry.phase);

        let _guard = self.append_lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err(&path))?;
        if ends_mid_line(&mut file).await.map_err(io_err(&path))? {
            warn!(path = %path.display(), "terminating torn checkpoint line before append");
            line.insert(0, b'\n');
        }
        file.write_all(&line).await.map_err(io_err(&path))?;
        file.flush().await.map_err(io_err(&path))?;
        file.sync_data().await.map_err(io_err(&path))?;
        Ok(())
    }

    /// Keys already completed for `phase` in this run. Unreadable lines are skipped.
    pub async fn load_processed(&self, phase: Phase) -> Result<HashSet<String>, CheckpointError> {
        Ok(self
            .read_entries(phase)
            .await?
            .into_iter()
            .map(|e| e.key)
            .collect())
    }

    /// Most recently appended key for `phase`.
    pub async fn last_key(&self, phase: Phase) -> Result<Option<String>, CheckpointError> {
        Ok(self.read_entries(phase).await?.pop().map(|e| e.key))
    }

    async fn read_entries(&self, phase: Phase) -> Result<Vec<CheckpointEntry>, CheckpointError> {
        let path = self.phase_path(phase);
        if !fs::try_exists(&path).await.map_err(io_err(&path))? {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&path).await.map_err(io_err(&path))?;
        let mut lines = BufReader::new(file).lines();
        let mut entries = Vec::new();
        let mut line_no = 0usize;
        while let Some(line) = lines.next_line().await.map_err(io_err(&path))? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CheckpointEntry>(&line) {
                Ok(entry) if entry.phase == phase => entries.push(entry),
                Ok(_) => {}
                Err(err) => {
                    warn!(path = %path.display(), line_no, %err, "skipping unreadable checkpoint line");
                }
            }
        }
        Ok(entries)
    }

    /// Mark the run complete so the next process starts a fresh one.
    pub async fn finish(&self) -> Result<(), CheckpointError> {
        let marker = self.root.join(RUN_MARKER);
        match fs::remove_file(&marker).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(&marker)(err)),
        }
    }
}

/// True when the file is non-empty and its last byte is not a newline.
async fn ends_mid_line(file: &mut fs::File) -> std::io::Result<bool> {
    if file.metadata().await?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

/// Write via temp file + rename so a crash never leaves a torn marker.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err(&temp_path))?;
    file.write_all(bytes).await.map_err(io_err(&temp_path))?;
    file.flush().await.map_err(io_err(&temp_path))?;
    file.sync_all().await.map_err(io_err(&temp_path))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_err(path)(err));
    }
    Ok(())
}
