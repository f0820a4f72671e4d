//! Durable record of circuit breaker transitions.
//!
//! A transition is effective only once it is in the [`BreakerJournal`] or, when
//! the journal cannot be reached, in the local [`TripSpool`]. The spool is an
//! append-only JSON-lines file that is replayed into the journal later
//! (at-least-once; journals deduplicate by transition id).

#![allow(clippy::cast_possible_truncation)]

use crate::circuit_breaker::TripCause;
use async_trait::async_trait;
use ballast_core::error::StorageError;
use ballast_core::types::StrategyId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Kind of breaker transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// Breaker tripped; allocation halted.
    Trip,
    /// Operator reset; allocation resumes.
    Reset,
}

impl TransitionKind {
    /// Lowercase label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trip => "trip",
            Self::Reset => "reset",
        }
    }
}

/// One trip or reset, as journaled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerTransition {
    /// Unique id used for deduplication on replay.
    pub id: Uuid,
    /// Strategy whose breaker changed.
    pub strategy: StrategyId,
    /// Trip or reset.
    pub kind: TransitionKind,
    /// Cause of a trip; `None` for resets.
    pub cause: Option<TripCause>,
    /// When the transition was requested.
    pub at: DateTime<Utc>,
}

impl BreakerTransition {
    /// Creates a trip record.
    #[must_use]
    pub fn trip(strategy: StrategyId, cause: TripCause, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy,
            kind: TransitionKind::Trip,
            cause: Some(cause),
            at,
        }
    }

    /// Creates a reset record.
    #[must_use]
    pub fn reset(strategy: StrategyId, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy,
            kind: TransitionKind::Reset,
            cause: None,
            at,
        }
    }
}

/// Primary durable store for breaker transitions.
#[async_trait]
pub trait BreakerJournal: Send + Sync {
    /// Appends a transition. Appending an id that is already present succeeds
    /// without creating a second record.
    async fn append(&self, transition: &BreakerTransition) -> Result<(), StorageError>;

    /// Loads every transition, in append order.
    async fn load(&self) -> Result<Vec<BreakerTransition>, StorageError>;
}

/// In-memory journal.
///
/// Can be switched unavailable to exercise the spool path.
#[derive(Debug)]
pub struct InMemoryBreakerJournal {
    records: RwLock<Vec<BreakerTransition>>,
    available: AtomicBool,
}

impl Default for InMemoryBreakerJournal {
    fn default() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryBreakerJournal {
    /// Creates an empty, available journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the journal going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored transitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True if nothing has been journaled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Snapshot of the stored transitions.
    #[must_use]
    pub fn records(&self) -> Vec<BreakerTransition> {
        self.records.read().clone()
    }

    fn ensure_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable {
                store: "breaker_journal".to_string(),
                reason: "journal offline".to_string(),
            })
        }
    }
}

#[async_trait]
impl BreakerJournal for InMemoryBreakerJournal {
    async fn append(&self, transition: &BreakerTransition) -> Result<(), StorageError> {
        self.ensure_available()?;
        let mut records = self.records.write();
        if records.iter().any(|r| r.id == transition.id) {
            debug!(id = %transition.id, "transition already journaled");
            return Ok(());
        }
        records.push(transition.clone());
        Ok(())
    }

    async fn load(&self) -> Result<Vec<BreakerTransition>, StorageError> {
        self.ensure_available()?;
        Ok(self.records.read().clone())
    }
}

/// Local JSON-lines spool for transitions the journal did not accept.
///
/// Every append is flushed to disk with `sync_all` before returning, and the
/// whole open, write and sync sequence runs under the spool timeout.
#[derive(Debug)]
pub struct TripSpool {
    path: PathBuf,
    timeout: Duration,
    lock: Mutex<()>,
}

const DEFAULT_SPOOL_TIMEOUT: Duration = Duration::from_secs(5);

impl TripSpool {
    /// Creates a spool at `path`. The file is created on first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: DEFAULT_SPOOL_TIMEOUT,
            lock: Mutex::new(()),
        }
    }

    /// Bounds each append.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Spool file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one transition and syncs the file.
    ///
    /// Fails with [`StorageError::Timeout`] if the disk does not answer
    /// within the spool timeout; the record may then be partially written and
    /// is skipped as malformed on read.
    pub async fn append(&self, transition: &BreakerTransition) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(transition)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        tokio::time::timeout(self.timeout, self.write_line(&line))
            .await
            .map_err(|_| StorageError::Timeout {
                operation: "breaker_spool.append".to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            })?
    }

    async fn write_line(&self, line: &str) -> Result<(), StorageError> {
        let path = self.path.display().to_string();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StorageError::io("open", &path, &e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StorageError::io("write", &path, &e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io("sync", &path, &e))
    }

    /// Transitions currently spooled, oldest first.
    pub async fn pending(&self) -> Result<Vec<BreakerTransition>, StorageError> {
        let _guard = self.lock.lock().await;
        self.read_unlocked().await
    }

    /// Replays spooled transitions into `journal`, oldest first.
    ///
    /// Stops at the first append that fails or exceeds `timeout`; whatever was
    /// not accepted stays in the spool. Returns the number replayed.
    pub async fn drain_into(
        &self,
        journal: &dyn BreakerJournal,
        timeout: Duration,
    ) -> Result<usize, StorageError> {
        let _guard = self.lock.lock().await;
        let pending = self.read_unlocked().await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut flushed = 0;
        for transition in &pending {
            match tokio::time::timeout(timeout, journal.append(transition)).await {
                Ok(Ok(())) => flushed += 1,
                Ok(Err(e)) => {
                    debug!(error = %e, "journal rejected spooled transition");
                    break;
                }
                Err(_) => {
                    debug!(timeout_ms = timeout.as_millis() as u64, "journal append timed out");
                    break;
                }
            }
        }

        let path = self.path.display().to_string();
        if flushed == pending.len() {
            tokio::fs::remove_file(&self.path)
                .await
                .map_err(|e| StorageError::io("remove", &path, &e))?;
        } else if flushed > 0 {
            self.rewrite_unlocked(&pending[flushed..]).await?;
        }

        if flushed > 0 {
            info!(
                flushed,
                remaining = pending.len() - flushed,
                "breaker spool replayed"
            );
        }
        Ok(flushed)
    }

    async fn read_unlocked(&self) -> Result<Vec<BreakerTransition>, StorageError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StorageError::io("read", &self.path.display().to_string(), &e));
            }
        };

        let mut transitions = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BreakerTransition>(line) {
                Ok(t) => transitions.push(t),
                Err(e) => warn!(
                    line = line_no + 1,
                    error = %e,
                    "skipping malformed spool entry"
                ),
            }
        }
        Ok(transitions)
    }

    async fn rewrite_unlocked(&self, remaining: &[BreakerTransition]) -> Result<(), StorageError> {
        let mut body = String::new();
        for transition in remaining {
            body.push_str(&serde_json::to_string(transition)?);
            body.push('\n');
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let tmp_display = tmp.display().to_string();

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| StorageError::io("create", &tmp_display, &e))?;
        file.write_all(body.as_bytes())
            .await
            .map_err(|e| StorageError::io("write", &tmp_display, &e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io("sync", &tmp_display, &e))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StorageError::io("rename", &self.path.display().to_string(), &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn trip(strategy: &str) -> BreakerTransition {
        BreakerTransition::trip(
            StrategyId::new(strategy),
            TripCause::Drawdown {
                observed: -0.4,
                limit: -0.35,
            },
            Utc::now(),
        )
    }

    /// Accepts a fixed number of appends, then fails.
    struct FlakyJournal {
        inner: InMemoryBreakerJournal,
        budget: AtomicUsize,
    }

    #[async_trait]
    impl BreakerJournal for FlakyJournal {
        async fn append(&self, transition: &BreakerTransition) -> Result<(), StorageError> {
            if self
                .budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
                .is_err()
            {
                return Err(StorageError::Unavailable {
                    store: "flaky".to_string(),
                    reason: "budget exhausted".to_string(),
                });
            }
            self.inner.append(transition).await
        }

        async fn load(&self) -> Result<Vec<BreakerTransition>, StorageError> {
            self.inner.load().await
        }
    }

    #[tokio::test]
    async fn test_in_memory_dedups_by_id() {
        let journal = InMemoryBreakerJournal::new();
        let t = trip("carry");
        journal.append(&t).await.unwrap();
        journal.append(&t).await.unwrap();
        assert_eq!(journal.len(), 1);

        journal.set_available(false);
        assert!(journal.append(&trip("carry")).await.is_err());
        assert!(journal.load().await.is_err());
    }

    #[tokio::test]
    async fn test_spool_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let spool = TripSpool::new(dir.path().join("breaker.jsonl"));
        assert!(spool.pending().await.unwrap().is_empty());

        let first = trip("carry");
        let second = BreakerTransition::reset(StrategyId::new("carry"), Utc::now());
        spool.append(&first).await.unwrap();
        spool.append(&second).await.unwrap();

        let pending = spool.pending().await.unwrap();
        assert_eq!(pending, vec![first, second]);
    }

    #[tokio::test]
    async fn test_spool_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("breaker.jsonl");
        let good = trip("carry");
        let body = format!("{{not json\n{}\n", serde_json::to_string(&good).unwrap());
        std::fs::write(&path, body).unwrap();

        let spool = TripSpool::new(&path);
        assert_eq!(spool.pending().await.unwrap(), vec![good]);
    }

    #[tokio::test]
    async fn test_drain_removes_file_on_full_flush() {
        let dir = tempfile::tempdir().unwrap();
        let spool = TripSpool::new(dir.path().join("breaker.jsonl"));
        spool.append(&trip("carry")).await.unwrap();
        spool.append(&trip("trend")).await.unwrap();

        let journal = InMemoryBreakerJournal::new();
        let flushed = spool
            .drain_into(&journal, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(flushed, 2);
        assert_eq!(journal.len(), 2);
        assert!(!spool.path().exists());
    }

    #[tokio::test]
    async fn test_drain_keeps_unflushed_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let spool = TripSpool::new(dir.path().join("breaker.jsonl"));
        let transitions = [trip("a"), trip("b"), trip("c")];
        for t in &transitions {
            spool.append(t).await.unwrap();
        }

        let journal = FlakyJournal {
            inner: InMemoryBreakerJournal::new(),
            budget: AtomicUsize::new(1),
        };
        let flushed = spool
            .drain_into(&journal, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(flushed, 1);
        assert_eq!(spool.pending().await.unwrap(), transitions[1..].to_vec());
    }

    #[tokio::test]
    async fn test_drain_with_journal_down_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let spool = TripSpool::new(dir.path().join("breaker.jsonl"));
        spool.append(&trip("carry")).await.unwrap();

        let journal = InMemoryBreakerJournal::new();
        journal.set_available(false);
        let flushed = spool
            .drain_into(&journal, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(flushed, 0);
        assert_eq!(spool.pending().await.unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spool_append_is_bounded_by_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("breaker.fifo");
        // Opening a FIFO for writing blocks until a reader shows up.
        let made = std::process::Command::new("mkfifo").arg(&fifo).status().unwrap();
        assert!(made.success());

        let spool = TripSpool::new(&fifo).with_timeout(Duration::from_millis(50));
        assert!(matches!(
            spool.append(&trip("carry")).await,
            Err(StorageError::Timeout { .. })
        ));

        // Release the blocked open so the runtime can shut down.
        drop(std::fs::File::open(&fifo).unwrap());
    }

    #[tokio::test]
    async fn test_append_to_unwritable_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending.
        let spool = TripSpool::new(dir.path());
        assert!(matches!(
            spool.append(&trip("carry")).await,
            Err(StorageError::IoError { .. })
        ));
    }
}
