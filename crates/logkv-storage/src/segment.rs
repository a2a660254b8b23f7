//! Append-Only Segment
//!
//! A [`Segment`] is one append-only file plus an in-memory hash index
//! mapping each key to the byte offset of its most recent frame in that
//! file.
//!
//! ## Single-Writer Discipline
//!
//! Every segment owns exactly one writer task. Callers never touch the
//! file handle; [`Segment::append`] posts the already-encoded frame to the
//! writer's queue and awaits an acknowledgment carrying the offset the
//! frame landed at. Only after the ack does the caller update the index,
//! so a concurrent [`Segment::get`] either sees the new offset with a
//! fully persisted frame behind it, or does not see it at all.
//!
//! ## Read Path
//!
//! The read handle is opened once, when the segment is opened, and every
//! lookup is a seek + read against it. Keeping the descriptor open for the
//! segment's whole lifetime is what makes compaction safe: the compactor
//! may unlink this segment's file while a reader still holds an
//! `Arc<Segment>`, and the open descriptor keeps the data readable until
//! the last reference drops.
//!
//! ## Recovery
//!
//! Opening a segment scans it front to back, decoding every frame and
//! recording the offset of the last-seen frame per key. A torn final
//! frame is not corruption - a crash mid-append produces exactly that -
//! so the scan stops there and the file is truncated back to the last
//! whole frame before appends resume. Structural damage anywhere else
//! fails the open with `CorruptedSegment`.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use logkv_core::entry::MIN_FRAME_LEN;
use logkv_core::{read_value, Entry, Error, Result, Value};

/// Queue depth for the writer task. Appends await their ack anyway, so
/// this only bounds how many callers can be parked in the channel.
const WRITE_QUEUE_DEPTH: usize = 32;

struct WriteRequest {
    frame: Bytes,
    ack: oneshot::Sender<std::io::Result<u64>>,
}

/// One append-only file plus its in-memory hash index.
#[derive(Debug)]
pub struct Segment {
    path: RwLock<PathBuf>,
    /// Read handle opened at open time and kept for the segment's
    /// lifetime; all gets seek + read against it.
    read_file: tokio::sync::Mutex<File>,
    /// key → byte offset of the latest frame for that key in this file.
    index: RwLock<HashMap<String, u64>>,
    /// Present while the segment accepts appends; dropped on seal.
    write_tx: Mutex<Option<mpsc::Sender<WriteRequest>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Segment {
    /// Open (or create) the segment file `name` inside `dir`, rebuild the
    /// in-memory index from its frames, and start the writer task.
    pub async fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let path = dir.as_ref().join(name);

        let append_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::io(&path, e))?;

        let (index, recovered_len) = recover(&path).await?;

        let file_len = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Error::io(&path, e))?
            .len();
        if recovered_len < file_len {
            warn!(
                segment = name,
                recovered = recovered_len,
                file_len,
                "torn frame at end of segment, truncating"
            );
            append_file
                .set_len(recovered_len)
                .await
                .map_err(|e| Error::io(&path, e))?;
        }

        let read_file = File::open(&path)
            .await
            .map_err(|e| Error::io(&path, e))?;

        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let writer = tokio::spawn(run_writer(
            append_file,
            recovered_len,
            write_rx,
            path.clone(),
        ));

        debug!(
            segment = name,
            entries = index.len(),
            size = recovered_len,
            "segment opened"
        );

        Ok(Self {
            path: RwLock::new(path),
            read_file: tokio::sync::Mutex::new(read_file),
            index: RwLock::new(index),
            write_tx: Mutex::new(Some(write_tx)),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Current file name of this segment (a rename during compaction is
    /// reflected here).
    pub fn name(&self) -> String {
        self.path
            .read()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    /// Look up `key` and decode its value, or `NotFound` if this segment
    /// has never seen the key.
    pub async fn get(&self, key: &str) -> Result<Value> {
        let offset = self
            .index
            .read()
            .get(key)
            .copied()
            .ok_or(Error::NotFound)?;

        let frame = {
            let path = self.path();
            let mut file = self.read_file.lock().await;
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| Error::io(&path, e))?;

            let mut size_buf = [0u8; 4];
            file.read_exact(&mut size_buf)
                .await
                .map_err(|e| Error::io(&path, e))?;
            let size = u32::from_le_bytes(size_buf) as usize;
            if size < MIN_FRAME_LEN {
                return Err(Error::CorruptedFrame(format!(
                    "frame at offset {offset} declares impossible size {size}"
                )));
            }

            let mut frame = vec![0u8; size];
            frame[..4].copy_from_slice(&size_buf);
            file.read_exact(&mut frame[4..])
                .await
                .map_err(|e| Error::io(&path, e))?;
            frame
        };

        read_value(&frame)
    }

    /// Append one entry. Returns once the frame is persisted and the
    /// index points at it. Fails with `Closed` after [`Segment::seal`].
    pub async fn append(&self, entry: &Entry) -> Result<()> {
        let tx = self.write_tx.lock().clone().ok_or(Error::Closed)?;

        let (ack_tx, ack_rx) = oneshot::channel();
        tx.send(WriteRequest {
            frame: entry.encode(),
            ack: ack_tx,
        })
        .await
        .map_err(|_| Error::Closed)?;

        let offset = match ack_rx.await {
            Ok(Ok(offset)) => offset,
            Ok(Err(e)) => return Err(Error::io(self.path(), e)),
            // The writer exited before answering; the write did not land.
            Err(_) => return Err(Error::Closed),
        };

        self.index.write().insert(entry.key.clone(), offset);
        Ok(())
    }

    /// Current file size as reported by the filesystem.
    pub async fn size(&self) -> Result<u64> {
        let path = self.path();
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| Error::io(&path, e))?;
        Ok(meta.len())
    }

    /// Stop the writer task, draining any queued appends. The segment
    /// keeps serving reads; further appends fail with `Closed`.
    pub async fn seal(&self) -> Result<()> {
        // Dropping the sender closes the queue; the writer drains what is
        // already enqueued (acks included) and exits.
        drop(self.write_tx.lock().take());

        let handle = self.writer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(segment = %self.name(), error = %e, "segment writer task panicked");
            }
        }
        Ok(())
    }

    /// Remove the segment file from disk. Valid only after [`Segment::seal`];
    /// readers still holding this segment keep their open descriptor. A
    /// file already gone counts as deleted.
    pub async fn delete(&self) -> Result<()> {
        let path = self.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(&path, e)),
        }
        debug!(segment = %self.name(), "segment file deleted");
        Ok(())
    }

    /// Move the segment file, updating the in-memory path.
    pub(crate) async fn rename(&self, new_path: PathBuf) -> Result<()> {
        let old_path = self.path();
        tokio::fs::rename(&old_path, &new_path)
            .await
            .map_err(|e| Error::io(&old_path, e))?;
        *self.path.write() = new_path;
        Ok(())
    }

    /// Snapshot of the keys indexed by this segment.
    pub(crate) fn keys(&self) -> Vec<String> {
        self.index.read().keys().cloned().collect()
    }

    pub(crate) fn contains_key(&self, key: &str) -> bool {
        self.index.read().contains_key(key)
    }
}

/// The writer task: sole owner of the append handle and of the running
/// offset. Acks carry the start offset of the persisted frame, so the
/// index is never updated from a value computed outside this task.
async fn run_writer(
    mut file: File,
    mut offset: u64,
    mut rx: mpsc::Receiver<WriteRequest>,
    path: PathBuf,
) {
    while let Some(req) = rx.recv().await {
        let result = write_frame(&mut file, &req.frame).await;
        let ack = match result {
            Ok(()) => {
                let start = offset;
                offset += req.frame.len() as u64;
                Ok(start)
            }
            Err(e) => Err(e),
        };
        // A caller that gave up on the ack is not an error.
        let _ = req.ack.send(ack);
    }
    debug!(path = %path.display(), "segment writer stopped");
}

async fn write_frame(file: &mut File, frame: &[u8]) -> std::io::Result<()> {
    file.write_all(frame).await?;
    // The ack must mean "persisted": flush forces the write through
    // tokio's deferred file I/O before anyone hears about the offset.
    file.flush().await
}

/// Scan the file front to back, rebuilding the index. Returns the index
/// and the offset just past the last whole frame.
async fn recover(path: &Path) -> Result<(HashMap<String, u64>, u64)> {
    let file = File::open(path).await.map_err(|e| Error::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut index = HashMap::new();
    let mut offset = 0u64;

    loop {
        let mut size_buf = [0u8; 4];
        match reader.read_exact(&mut size_buf).await {
            Ok(_) => {}
            // Clean end of file, or a size field torn mid-append.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(Error::io(path, e)),
        }

        let size = u32::from_le_bytes(size_buf) as usize;
        if size < MIN_FRAME_LEN {
            return Err(Error::CorruptedSegment {
                path: path.to_path_buf(),
                reason: format!("frame at offset {offset} declares impossible size {size}"),
            });
        }

        let mut frame = vec![0u8; size];
        frame[..4].copy_from_slice(&size_buf);
        match reader.read_exact(&mut frame[4..]).await {
            Ok(_) => {}
            // Torn final frame: tolerate, the caller truncates it away.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(Error::io(path, e)),
        }

        let entry = Entry::decode(&frame).map_err(|e| Error::CorruptedSegment {
            path: path.to_path_buf(),
            reason: format!("frame at offset {offset}: {e}"),
        })?;
        index.insert(entry.key, offset);
        offset += size as u64;
    }

    Ok((index, offset))
}
