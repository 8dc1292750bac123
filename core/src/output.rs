//! Job output journal with multi-reader fan-out
//!
//! A job's combined stdout and stderr land in a single append-only byte
//! journal. Any number of readers consume it independently, each with its
//! own cursor. Two signals keep readers parked instead of polling:
//!
//! - a capacity-one notification channel per reader, pushed (and dropped
//!   when already full) on every append; it carries no data, it only
//!   wakes the reader, which then re-reads the authoritative length;
//! - the job's termination latch, which unblocks every reader for a final
//!   drain once the last byte is in the journal.
//!
//! Bytes are immutable once appended; every reader sees every byte exactly
//! once, in order, NUL bytes and invalid UTF-8 included.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::trace;

/// Append-only byte journal shared by one writer and many readers
pub struct OutputLog {
    /// Journal contents; the length doubles as the total-bytes counter
    buf: RwLock<Vec<u8>>,
    /// Wake channels of the currently registered readers, by reader id
    readers: Mutex<HashMap<u64, mpsc::Sender<()>>>,
    next_reader_id: AtomicU64,
    /// The owning job's termination latch
    done: watch::Receiver<bool>,
}

impl OutputLog {
    pub fn new(done: watch::Receiver<bool>) -> Self {
        Self {
            buf: RwLock::new(Vec::new()),
            readers: Mutex::new(HashMap::new()),
            next_reader_id: AtomicU64::new(0),
            done,
        }
    }

    /// Append bytes to the journal and wake every registered reader.
    ///
    /// A full wake channel is skipped: a wake is already pending and the
    /// reader will observe this data when it consults the length. Appends
    /// therefore never block on a slow reader.
    pub fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }

        {
            let mut buf = self.buf.write().unwrap_or_else(PoisonError::into_inner);
            buf.extend_from_slice(bytes);
        }

        let readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
        for tx in readers.values() {
            let _ = tx.try_send(());
        }
    }

    /// Total number of bytes ever appended
    pub fn len(&self) -> usize {
        self.buf
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the full journal contents, for readers attaching after
    /// termination
    pub fn snapshot(&self) -> Vec<u8> {
        self.buf
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of currently registered readers
    pub fn reader_count(&self) -> usize {
        self.readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Register a reader starting at the first byte.
    pub fn register_reader(self: Arc<Self>) -> OutputReader {
        let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);

        self.readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        trace!(reader = id, "registered output reader");

        OutputReader {
            id,
            cursor: 0,
            notify: rx,
            done: self.done.clone(),
            log: self,
        }
    }

    fn unregister_reader(&self, id: u64) {
        self.readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        trace!(reader = id, "unregistered output reader");
    }

    /// Copy up to `dst.len()` bytes starting at `offset` into `dst`.
    fn read_at(&self, offset: usize, dst: &mut [u8]) -> usize {
        let buf = self.buf.read().unwrap_or_else(PoisonError::into_inner);
        if offset >= buf.len() {
            return 0;
        }
        let n = dst.len().min(buf.len() - offset);
        dst[..n].copy_from_slice(&buf[offset..offset + n]);
        n
    }
}

/// An independent cursor over an [`OutputLog`]
///
/// Dropping the reader unregisters it from the journal in O(1) without
/// disturbing other cursors.
pub struct OutputReader {
    id: u64,
    cursor: usize,
    notify: mpsc::Receiver<()>,
    done: watch::Receiver<bool>,
    log: Arc<OutputLog>,
}

impl OutputReader {
    /// Copy the next bytes into `dst`, waiting for new data while the
    /// journal is drained and the job still runs.
    ///
    /// Returns 0 only at end of stream: every byte has been consumed and
    /// the job's termination latch has fired. A missed wake is harmless;
    /// the next append pushes again, and the latch covers the tail.
    pub async fn read(&mut self, dst: &mut [u8]) -> usize {
        if dst.is_empty() {
            return 0;
        }

        loop {
            let n = self.log.read_at(self.cursor, dst);
            if n > 0 {
                self.cursor += n;
                return n;
            }

            tokio::select! {
                _ = self.notify.recv() => {}
                _ = self.done.wait_for(|fired| *fired) => {
                    // One final look: the latch fires only after the last
                    // byte was appended.
                    let n = self.log.read_at(self.cursor, dst);
                    self.cursor += n;
                    return n;
                }
            }
        }
    }
}

impl Drop for OutputReader {
    fn drop(&mut self) {
        self.log.unregister_reader(self.id);
    }
}

/// A stream of job output handed to one subscriber: live while the job
/// runs, a snapshot when it attached after termination.
pub enum OutputStream {
    Live(OutputReader),
    Snapshot { data: Vec<u8>, pos: usize },
}

impl OutputStream {
    pub fn snapshot(data: Vec<u8>) -> Self {
        OutputStream::Snapshot { data, pos: 0 }
    }

    /// Copy the next bytes into `dst`; 0 means end of stream.
    pub async fn read(&mut self, dst: &mut [u8]) -> usize {
        match self {
            OutputStream::Live(reader) => reader.read(dst).await,
            OutputStream::Snapshot { data, pos } => {
                if *pos >= data.len() || dst.is_empty() {
                    return 0;
                }
                let n = dst.len().min(data.len() - *pos);
                dst[..n].copy_from_slice(&data[*pos..*pos + n]);
                *pos += n;
                n
            }
        }
    }

    /// Drain the stream to end of stream, collecting every byte.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = self.read(&mut buf).await;
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn test_log() -> (Arc<OutputLog>, watch::Sender<bool>) {
        let (done_tx, done_rx) = watch::channel(false);
        (Arc::new(OutputLog::new(done_rx)), done_tx)
    }

    #[tokio::test]
    async fn test_append_and_len() {
        let (log, _done) = test_log();
        assert!(log.is_empty());

        log.append(b"hello");
        log.append(b"");
        log.append(b" world");
        assert_eq!(log.len(), 11);
        assert_eq!(log.snapshot(), b"hello world");
    }

    #[tokio::test]
    async fn test_reader_sees_every_byte_in_order() {
        let (log, done) = test_log();
        log.append(b"one ");
        log.append(b"two ");

        let mut reader = Arc::clone(&log).register_reader();
        log.append(b"three");
        done.send(true).unwrap();

        let mut stream = OutputStream::Live(reader);
        assert_eq!(stream.read_to_end().await, b"one two three");

        // A second reader sees the identical sequence after the fact.
        reader = Arc::clone(&log).register_reader();
        let mut stream = OutputStream::Live(reader);
        assert_eq!(stream.read_to_end().await, b"one two three");
    }

    #[tokio::test]
    async fn test_partial_reads_advance_cursor() {
        let (log, done) = test_log();
        log.append(b"abcdef");
        done.send(true).unwrap();

        let mut reader = Arc::clone(&log).register_reader();
        let mut dst = [0u8; 4];
        assert_eq!(reader.read(&mut dst).await, 4);
        assert_eq!(&dst, b"abcd");
        assert_eq!(reader.read(&mut dst).await, 2);
        assert_eq!(&dst[..2], b"ef");
        assert_eq!(reader.read(&mut dst).await, 0);
    }

    #[tokio::test]
    async fn test_read_blocks_until_append() {
        let (log, _done) = test_log();
        let mut reader = Arc::clone(&log).register_reader();

        let writer_log = Arc::clone(&log);
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer_log.append(b"late");
        });

        let mut dst = [0u8; 16];
        let n = timeout(Duration::from_secs(2), reader.read(&mut dst))
            .await
            .expect("reader should wake on append");
        assert_eq!(&dst[..n], b"late");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_missed_wake_is_recovered_by_latch() {
        let (log, done) = test_log();
        let mut reader = Arc::clone(&log).register_reader();

        // Several appends while the reader never drains its wake channel:
        // all but the first push are dropped.
        log.append(b"a");
        log.append(b"b");
        log.append(b"c");
        done.send(true).unwrap();

        let mut stream = OutputStream::Live(reader);
        assert_eq!(stream.read_to_end().await, b"abc");
    }

    #[tokio::test]
    async fn test_eof_after_latch_with_no_data() {
        let (log, done) = test_log();
        let mut reader = Arc::clone(&log).register_reader();

        let latch = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            done.send(true).unwrap();
            done
        });

        let mut dst = [0u8; 8];
        let n = timeout(Duration::from_secs(2), reader.read(&mut dst))
            .await
            .expect("reader should wake on the latch");
        assert_eq!(n, 0);
        latch.await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_unregisters_reader() {
        let (log, _done) = test_log();
        let r1 = Arc::clone(&log).register_reader();
        let r2 = Arc::clone(&log).register_reader();
        assert_eq!(log.reader_count(), 2);

        drop(r1);
        assert_eq!(log.reader_count(), 1);
        drop(r2);
        assert_eq!(log.reader_count(), 0);
    }

    #[tokio::test]
    async fn test_binary_safety() {
        let (log, done) = test_log();
        let payload: Vec<u8> = vec![0x00, 0xff, 0xfe, b'\n', 0x00, 0x80];
        log.append(&payload);
        done.send(true).unwrap();

        let mut stream = OutputStream::Live(Arc::clone(&log).register_reader());
        assert_eq!(stream.read_to_end().await, payload);
    }

    #[tokio::test]
    async fn test_snapshot_stream() {
        let mut stream = OutputStream::snapshot(b"post mortem".to_vec());
        assert_eq!(stream.read_to_end().await, b"post mortem");

        let mut empty = OutputStream::snapshot(Vec::new());
        assert_eq!(empty.read_to_end().await, b"");
    }
}
