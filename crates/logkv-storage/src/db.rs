//! Database - the Ordered Segment List
//!
//! A [`Database`] owns a directory of segment files named `segment-<n>`
//! and the ordered list of open [`Segment`]s built from them (index 0 is
//! the oldest, the last is the active writable one). It is the only
//! component that mutates the list: `put` appends a fresh tail on
//! rollover, and the compactor swaps the sealed prefix for a merged
//! segment.
//!
//! ## Concurrency Model
//!
//! - Lookups snapshot the segment list under a read lock and then search
//!   newest → oldest without holding it.
//! - `put` holds a database-level write gate across the size check, the
//!   rollover decision and the append itself. Two concurrent puts can
//!   therefore never each create a fresh segment, and no put can land on
//!   a segment that is being sealed. Write throughput was already bounded
//!   by the single append file, so the gate costs nothing extra.
//! - The compactor runs in its own task and communicates through the
//!   shared [`DbShared`] state; shutdown is a watch channel, new sealed
//!   segments are signalled through a `Notify`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use logkv_core::{Entry, Error, Result, TypeTag, Value};

use crate::compaction;
use crate::config::DbConfig;
use crate::segment::Segment;

/// Prefix every segment file name carries; the suffix is a decimal
/// integer >= 0.
pub const SEGMENT_PREFIX: &str = "segment-";

/// Name the compactor writes its output under until the final rename. A
/// leftover is a crash artifact; open resolves it (see
/// [`recover_compaction_temp`]).
pub(crate) const COMPACT_TMP: &str = "compact.tmp";

/// State shared between the database handle and the compactor task.
#[derive(Debug)]
pub(crate) struct DbShared {
    pub(crate) dir: PathBuf,
    pub(crate) config: DbConfig,
    /// Oldest → newest; the last segment is the only writable one.
    pub(crate) segments: RwLock<Vec<Arc<Segment>>>,
    /// Pulsed whenever a rollover seals a segment.
    pub(crate) segments_changed: Notify,
}

/// A log-structured key/value database over one directory.
#[derive(Debug)]
pub struct Database {
    shared: Arc<DbShared>,
    /// Serializes the size-check / rollover / append sequence.
    write_gate: tokio::sync::Mutex<()>,
    next_segment: AtomicU64,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    compactor: Mutex<Option<JoinHandle<()>>>,
}

impl Database {
    /// Open the database in `dir`, creating the directory (and a first
    /// `segment-1`) if needed. Existing files must all match
    /// `segment-<n>`; they are opened oldest → newest by numeric suffix
    /// and the newest becomes the active segment.
    pub async fn open(dir: impl AsRef<Path>, config: DbConfig) -> Result<Database> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io(&dir, e))?;

        recover_compaction_temp(&dir).await?;

        let mut numbers = list_segment_numbers(&dir).await?;
        numbers.sort_unstable();

        let mut segments = Vec::with_capacity(numbers.len().max(1));
        for n in &numbers {
            let name = format!("{SEGMENT_PREFIX}{n}");
            segments.push(Arc::new(Segment::open(&dir, &name).await?));
        }

        let mut next = numbers.last().map(|n| n + 1).unwrap_or(1);
        if segments.is_empty() {
            let name = format!("{SEGMENT_PREFIX}{next}");
            segments.push(Arc::new(Segment::open(&dir, &name).await?));
            next += 1;
        }

        // Historical segments never receive another write.
        for segment in &segments[..segments.len() - 1] {
            segment.seal().await?;
        }

        let active_name = segments.last().map(|s| s.name()).unwrap_or_default();
        info!(
            dir = %dir.display(),
            segments = segments.len(),
            active = %active_name,
            "database opened"
        );

        let shared = Arc::new(DbShared {
            dir,
            config,
            segments: RwLock::new(segments),
            segments_changed: Notify::new(),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let compactor = tokio::spawn(compaction::run(shared.clone(), shutdown_rx));

        Ok(Database {
            shared,
            write_gate: tokio::sync::Mutex::new(()),
            next_segment: AtomicU64::new(next),
            closed: AtomicBool::new(false),
            shutdown_tx,
            compactor: Mutex::new(Some(compactor)),
        })
    }

    /// Look up `key`, searching segments newest → oldest.
    pub async fn get(&self, key: &str) -> Result<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let segments = self.shared.segments.read().await.clone();
        for segment in segments.iter().rev() {
            match segment.get(key).await {
                Err(Error::NotFound) => continue,
                other => return other,
            }
        }
        Err(Error::NotFound)
    }

    /// Look up `key` expecting a string value.
    pub async fn get_string(&self, key: &str) -> Result<String> {
        match self.get(key).await? {
            Value::Str(s) => Ok(s),
            Value::Int64(_) => Err(Error::WrongType {
                stored: TypeTag::Int64,
                requested: TypeTag::Str,
            }),
        }
    }

    /// Look up `key` expecting an int64 value.
    pub async fn get_i64(&self, key: &str) -> Result<i64> {
        match self.get(key).await? {
            Value::Int64(n) => Ok(n),
            Value::Str(_) => Err(Error::WrongType {
                stored: TypeTag::Str,
                requested: TypeTag::Int64,
            }),
        }
    }

    /// Store `value` under `key`, rolling the active segment over first
    /// if it has outgrown the size threshold.
    pub async fn put(&self, key: &str, value: Value) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let _gate = self.write_gate.lock().await;

        let active = {
            let segments = self.shared.segments.read().await;
            segments.last().cloned().ok_or(Error::Closed)?
        };

        // Strictly-greater-than: a segment exactly at the threshold keeps
        // accepting writes; the overrun write triggers the rollover.
        let target = if active.size().await? <= self.shared.config.segment_max_size {
            active
        } else {
            self.roll_over(active).await?
        };

        target.append(&Entry::new(key, value)).await
    }

    pub async fn put_string(&self, key: &str, value: impl Into<String>) -> Result<()> {
        self.put(key, Value::Str(value.into())).await
    }

    pub async fn put_i64(&self, key: &str, value: i64) -> Result<()> {
        self.put(key, Value::Int64(value)).await
    }

    /// Seal the active segment and append a fresh one to the list.
    /// Caller must hold the write gate.
    async fn roll_over(&self, active: Arc<Segment>) -> Result<Arc<Segment>> {
        active.seal().await?;

        let n = self.next_segment.fetch_add(1, Ordering::Relaxed);
        let name = format!("{SEGMENT_PREFIX}{n}");
        let segment = Arc::new(Segment::open(&self.shared.dir, &name).await?);

        {
            let mut segments = self.shared.segments.write().await;
            segments.push(segment.clone());
        }
        self.shared.segments_changed.notify_one();

        info!(
            sealed = %active.name(),
            active = %segment.name(),
            "segment rolled over"
        );
        Ok(segment)
    }

    /// Stop the compactor at its next quiescent point, wait for it, then
    /// seal every segment. In-flight appends either complete or fail with
    /// `Closed`; none are dropped silently.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let _ = self.shutdown_tx.send(true);
        let compactor = self.compactor.lock().take();
        if let Some(handle) = compactor {
            if let Err(e) = handle.await {
                warn!(error = %e, "compactor task panicked");
            }
        }

        let segments = self.shared.segments.read().await.clone();
        for segment in &segments {
            segment.seal().await?;
        }

        debug!(dir = %self.shared.dir.display(), "database closed");
        Ok(())
    }

    /// Number of segments currently in the list. Mostly useful to tests
    /// and operators.
    pub async fn segment_count(&self) -> usize {
        self.shared.segments.read().await.len()
    }
}

impl Drop for Database {
    /// Backstop for a database dropped without [`Database::close`]: the
    /// compactor must not keep the shared state alive forever.
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.compactor.lock().take() {
            handle.abort();
        }
    }
}

/// Resolve a compaction temp file left by an interrupted compaction.
///
/// If `segment-0` exists, the compaction died before its swap completed
/// and every value in the temp file still lives in the sealed inputs, so
/// the temp is redundant and removed. If `segment-0` is absent, the
/// compaction died after deleting its inputs but before the final
/// rename - the temp file holds the only copy of the merged keys and is
/// adopted as `segment-0`. (Adopting a pre-swap temp in this branch is
/// harmless too: it sorts oldest, so newer segments shadow it.)
async fn recover_compaction_temp(dir: &Path) -> Result<()> {
    let tmp = dir.join(COMPACT_TMP);
    match tokio::fs::metadata(&tmp).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io(&tmp, e)),
        Ok(_) => {}
    }

    let merged = dir.join(format!("{SEGMENT_PREFIX}0"));
    if tokio::fs::try_exists(&merged)
        .await
        .map_err(|e| Error::io(&merged, e))?
    {
        warn!(dir = %dir.display(), "removed redundant compaction temp file");
        tokio::fs::remove_file(&tmp)
            .await
            .map_err(|e| Error::io(&tmp, e))
    } else {
        warn!(dir = %dir.display(), "adopting interrupted compaction output as segment-0");
        tokio::fs::rename(&tmp, &merged)
            .await
            .map_err(|e| Error::io(&tmp, e))
    }
}

/// List the directory and parse every file name as `segment-<n>`. Any
/// other name fails the open.
async fn list_segment_numbers(dir: &Path) -> Result<Vec<u64>> {
    let mut numbers = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::io(dir, e))?;

    while let Some(entry) = entries.next_entry().await.map_err(|e| Error::io(dir, e))? {
        let name = entry.file_name().to_string_lossy().into_owned();
        match parse_segment_number(&name) {
            Some(n) => numbers.push(n),
            None => return Err(Error::UnrecognizedFile(name)),
        }
    }
    Ok(numbers)
}

fn parse_segment_number(name: &str) -> Option<u64> {
    let suffix = name.strip_prefix(SEGMENT_PREFIX)?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_segment_number() {
        assert_eq!(parse_segment_number("segment-0"), Some(0));
        assert_eq!(parse_segment_number("segment-17"), Some(17));
        assert_eq!(parse_segment_number("segment-"), None);
        assert_eq!(parse_segment_number("segment-+1"), None);
        assert_eq!(parse_segment_number("segment-1a"), None);
        assert_eq!(parse_segment_number("wal-1"), None);
        assert_eq!(parse_segment_number("compact.tmp"), None);
    }

    #[test]
    fn test_numeric_sort_orders_double_digit_segments() {
        let mut numbers: Vec<u64> = ["segment-10", "segment-2", "segment-1"]
            .iter()
            .filter_map(|n| parse_segment_number(n))
            .collect();
        numbers.sort_unstable();
        assert_eq!(numbers, vec![1, 2, 10]);
    }
}
