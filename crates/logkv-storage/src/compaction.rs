//! Background Segment Compaction
//!
//! The compactor merges every sealed segment into a single deduplicated
//! one, reclaiming the space taken by overwritten keys. It runs as one
//! long-lived task per database:
//!
//! 1. Wait until the list holds at least `min_compaction_segments`
//!    segments (two sealed ones plus the active one by default).
//! 2. Build a fresh temp segment and walk the sealed inputs newest →
//!    oldest, copying each key's latest value the first time the key is
//!    seen. Newest write wins; older duplicates disappear.
//! 3. Atomically swap the inputs out of the segment list, prepending the
//!    merged segment. The active segment is never touched, so writes
//!    never race compaction for the same file.
//! 4. Delete the input files. Live readers keep their open descriptors,
//!    so an in-flight get never observes a deleted file.
//! 5. Rename the temp file to `segment-0`, the canonical name for the
//!    compacted tail.
//!
//! A failed compaction is logged and retried on the next cycle; the list
//! swap is the last mutating step, so a failure before it leaves the
//! database exactly as it was.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use logkv_core::{Entry, Result};

use crate::db::{DbShared, COMPACT_TMP, SEGMENT_PREFIX};
use crate::segment::Segment;

/// Compactor task body: loop until the database closes, waking on
/// rollover signals or on the periodic check interval.
pub(crate) async fn run(shared: Arc<DbShared>, mut shutdown: watch::Receiver<bool>) {
    debug!("compactor started");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = shared.segments_changed.notified() => {}
            _ = tokio::time::sleep(shared.config.compaction_interval) => {}
        }

        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = maybe_compact(&shared).await {
            warn!(error = %e, "compaction failed, will retry");
        }
    }
    debug!("compactor stopped");
}

/// Run one compaction round if enough segments have accumulated.
async fn maybe_compact(shared: &DbShared) -> Result<()> {
    let inputs = {
        let segments = shared.segments.read().await;
        if segments.len() < shared.config.min_compaction_segments {
            return Ok(());
        }
        segments[..segments.len() - 1].to_vec()
    };

    info!(inputs = inputs.len(), "compacting sealed segments");

    // Remnant of a compaction that failed after creating its output.
    let _ = tokio::fs::remove_file(shared.dir.join(COMPACT_TMP)).await;

    let merged = Arc::new(Segment::open(&shared.dir, COMPACT_TMP).await?);
    if let Err(e) = merge_into(&merged, &inputs).await {
        // Release the output file cleanly before giving up.
        let _ = merged.seal().await;
        let _ = merged.delete().await;
        return Err(e);
    }
    merged.seal().await?;

    // Swap: replace the input prefix, keep everything appended since the
    // snapshot (the active segment, plus any segments a concurrent
    // rollover added behind it).
    {
        let mut segments = shared.segments.write().await;
        let tail = segments.split_off(inputs.len());
        let mut next = Vec::with_capacity(tail.len() + 1);
        next.push(merged.clone());
        next.extend(tail);
        *segments = next;
    }

    for segment in &inputs {
        segment.delete().await?;
    }

    merged.rename(shared.dir.join(format!("{SEGMENT_PREFIX}0"))).await?;

    info!(
        merged_keys = merged.keys().len(),
        dropped_segments = inputs.len(),
        "compaction complete"
    );
    Ok(())
}

/// Copy the latest value for every key in `inputs` (newest → oldest) into
/// `merged`; a key already present came from a newer segment and wins.
async fn merge_into(merged: &Segment, inputs: &[Arc<Segment>]) -> Result<()> {
    for segment in inputs.iter().rev() {
        for key in segment.keys() {
            if merged.contains_key(&key) {
                continue;
            }
            let value = segment.get(&key).await?;
            merged.append(&Entry::new(key, value)).await?;
        }
    }
    Ok(())
}
