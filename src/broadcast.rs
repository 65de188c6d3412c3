//! Per-session build output broadcasting.
//!
//! ```text
//! pipeline stages ──append()──> [crossbeam unbounded queue]
//!                                        |
//!                               [dispatcher thread]
//!                                 |              \
//!                  per-session SessionLog      <log_dir>/sessions/<id>.log
//!                  (VecDeque + watch version)
//!                                 |
//!                 subscribe() ──> cursor-based streams (replay, then live)
//! ```
//!
//! # Ordering
//!
//! A single dispatcher thread drains the queue, so chunks of one session are
//! numbered and stored in exactly the order `append` was called. Subscribers
//! read by sequence number starting at 0, so a late subscriber first replays
//! everything still buffered and then continues live with no gap or duplicate.
//!
//! # Slow consumers
//!
//! `append` only pushes onto an unbounded queue and never waits for a
//! subscriber. Subscribers do not own buffers: each holds a cursor into the
//! shared session log, so a stalled consumer costs nothing.
//!
//! The session log itself is bounded by `max_bytes` (drop-oldest). When a
//! subscriber's cursor points at chunks that have already been evicted it
//! receives one `LogItem::Lagged { skipped }` and resumes at the oldest
//! retained chunk. Order is never violated and nothing is delivered twice.

use crossbeam_channel::{unbounded, Sender};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, watch};

use crate::models::SessionId;

/// One ordered unit of session output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub seq: u64,
    pub text: String,
}

/// Item yielded by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogItem {
    Chunk(LogChunk),
    /// `skipped` chunks were evicted before this subscriber could read them
    Lagged { skipped: u64 },
}

enum Command {
    Append(SessionId, String),
    Close(SessionId),
    Flush(oneshot::Sender<()>),
}

struct Buffer {
    chunks: VecDeque<LogChunk>,
    /// seq of `chunks[0]`, or `next_seq` when empty
    first_seq: u64,
    next_seq: u64,
    bytes: usize,
    closed: bool,
}

enum Read {
    Item(LogItem),
    Pending,
    Closed,
}

struct SessionLog {
    buffer: Mutex<Buffer>,
    version: watch::Sender<u64>,
    max_bytes: usize,
}

impl SessionLog {
    fn new(max_bytes: usize) -> Self {
        let (version, _) = watch::channel(0);
        SessionLog {
            buffer: Mutex::new(Buffer {
                chunks: VecDeque::new(),
                first_seq: 0,
                next_seq: 0,
                bytes: 0,
                closed: false,
            }),
            version,
            max_bytes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns false if the log was already closed.
    fn push(&self, text: String) -> bool {
        {
            let mut buf = self.lock();
            if buf.closed {
                return false;
            }
            let seq = buf.next_seq;
            buf.bytes += text.len();
            buf.chunks.push_back(LogChunk { seq, text });
            buf.next_seq += 1;
            while buf.bytes > self.max_bytes && buf.chunks.len() > 1 {
                if let Some(evicted) = buf.chunks.pop_front() {
                    buf.bytes -= evicted.text.len();
                    buf.first_seq = evicted.seq + 1;
                }
            }
        }
        self.version.send_modify(|v| *v += 1);
        true
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn close(&self) {
        self.lock().closed = true;
        self.version.send_modify(|v| *v += 1);
    }

    fn read_at(&self, cursor: &mut u64) -> Read {
        let buf = self.lock();
        if *cursor < buf.first_seq {
            let skipped = buf.first_seq - *cursor;
            *cursor = buf.first_seq;
            return Read::Item(LogItem::Lagged { skipped });
        }
        if *cursor < buf.next_seq {
            let idx = (*cursor - buf.first_seq) as usize;
            if let Some(chunk) = buf.chunks.get(idx) {
                *cursor += 1;
                return Read::Item(LogItem::Chunk(chunk.clone()));
            }
        }
        if buf.closed {
            Read::Closed
        } else {
            Read::Pending
        }
    }
}

type Registry = Arc<Mutex<HashMap<SessionId, Arc<SessionLog>>>>;

fn lock_registry(registry: &Registry) -> MutexGuard<'_, HashMap<SessionId, Arc<SessionLog>>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Fan-out of per-session output to any number of subscribers.
#[derive(Clone)]
pub struct LogBroadcaster {
    tx: Sender<Command>,
    sessions: Registry,
    max_bytes: usize,
}

/// Per-session log files under the session log dir.
///
/// Persistence is best effort: the first open or write error for a session is
/// logged and that session's file is dropped, while in-memory delivery goes on.
struct SessionFiles {
    dir: Option<PathBuf>,
    open: HashMap<SessionId, File>,
    failed: HashSet<SessionId>,
}

impl SessionFiles {
    fn new(dir: Option<PathBuf>) -> Self {
        SessionFiles {
            dir,
            open: HashMap::new(),
            failed: HashSet::new(),
        }
    }

    fn write(&mut self, id: SessionId, text: &str) {
        let Some(ref dir) = self.dir else {
            return;
        };
        if self.failed.contains(&id) {
            return;
        }
        if !self.open.contains_key(&id) {
            let path = dir.join(format!("{}.log", id));
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => {
                    self.open.insert(id, file);
                }
                Err(e) => {
                    log::warn!("[Broadcast] [{}] Cannot open {}: {}", id, path.display(), e);
                    self.failed.insert(id);
                    return;
                }
            }
        }
        if let Some(file) = self.open.get_mut(&id) {
            if let Err(e) = file.write_all(text.as_bytes()) {
                log::warn!(
                    "[Broadcast] [{}] Session log write failed, no longer persisting: {}",
                    id,
                    e
                );
                self.open.remove(&id);
                self.failed.insert(id);
            }
        }
    }

    fn close(&mut self, id: SessionId) {
        self.failed.remove(&id);
        if let Some(mut file) = self.open.remove(&id) {
            if let Err(e) = file.flush() {
                log::warn!("[Broadcast] [{}] Session log flush failed: {}", id, e);
            }
        }
    }

    fn flush(&mut self) {
        for file in self.open.values_mut() {
            let _ = file.flush();
        }
    }

    #[cfg(test)]
    fn is_persisting(&self, id: SessionId) -> bool {
        self.open.contains_key(&id)
    }
}

impl LogBroadcaster {
    /// `session_log_dir`: when set, each session's output is also appended to
    /// `<dir>/<session id>.log`.
    pub fn new(max_bytes: usize, session_log_dir: Option<PathBuf>) -> Self {
        let (tx, rx) = unbounded::<Command>();
        let sessions: Registry = Arc::new(Mutex::new(HashMap::new()));
        let registry = Arc::clone(&sessions);

        if let Some(ref dir) = session_log_dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                log::warn!("[Broadcast] Cannot create session log dir {}: {}", dir.display(), e);
            }
        }

        let spawned = std::thread::Builder::new()
            .name("rpmforge-broadcast".to_string())
            .spawn(move || {
                let mut files = SessionFiles::new(session_log_dir);
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        Command::Append(id, text) => {
                            let target = lock_registry(&registry).get(&id).cloned();
                            let Some(target) = target.filter(|t| !t.is_closed()) else {
                                continue;
                            };
                            files.write(id, &text);
                            target.push(text);
                        }
                        Command::Close(id) => {
                            files.close(id);
                            if let Some(target) = lock_registry(&registry).get(&id).cloned() {
                                target.close();
                            }
                        }
                        Command::Flush(done) => {
                            files.flush();
                            let _ = done.send(());
                        }
                    }
                }
            });
        if let Err(e) = spawned {
            log::error!("[Broadcast] Failed to spawn dispatcher thread: {}", e);
        }

        LogBroadcaster {
            tx,
            sessions,
            max_bytes,
        }
    }

    /// Register a session. Appends for unregistered sessions are dropped.
    pub fn open(&self, id: SessionId) {
        lock_registry(&self.sessions)
            .entry(id)
            .or_insert_with(|| Arc::new(SessionLog::new(self.max_bytes)));
    }

    /// Queue a chunk. Never blocks.
    pub fn append(&self, id: SessionId, text: impl Into<String>) {
        let _ = self.tx.send(Command::Append(id, text.into()));
    }

    /// Mark the session finished once all earlier appends are applied.
    pub fn close(&self, id: SessionId) {
        let _ = self.tx.send(Command::Close(id));
    }

    /// Resolve once every command queued before this call has been applied.
    pub async fn flush(&self) -> Result<(), String> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(done_tx))
            .map_err(|e| format!("Failed to send flush marker: {}", e))?;
        done_rx
            .await
            .map_err(|e| format!("Flush signal interrupted: {}", e))
    }

    /// Forget a session. Live subscriptions keep draining what they hold.
    pub fn remove(&self, id: SessionId) {
        lock_registry(&self.sessions).remove(&id);
    }

    pub fn contains(&self, id: SessionId) -> bool {
        lock_registry(&self.sessions).contains_key(&id)
    }

    /// Replay from the beginning, then follow live output until closed.
    pub fn subscribe(&self, id: SessionId) -> Option<BoxStream<'static, LogItem>> {
        self.subscribe_from(id, 0)
    }

    /// Like `subscribe`, resuming at `cursor` (the next seq the caller has not seen).
    pub fn subscribe_from(&self, id: SessionId, cursor: u64) -> Option<BoxStream<'static, LogItem>> {
        let session_log = lock_registry(&self.sessions).get(&id).cloned()?;
        let rx = session_log.version.subscribe();

        Some(
            stream::unfold((session_log, cursor, rx), |(session_log, mut cursor, mut rx)| async move {
                loop {
                    rx.borrow_and_update();
                    match session_log.read_at(&mut cursor) {
                        Read::Item(item) => return Some((item, (session_log, cursor, rx))),
                        Read::Closed => return None,
                        Read::Pending => {
                            if rx.changed().await.is_err() {
                                return None;
                            }
                        }
                    }
                }
            })
            .boxed(),
        )
    }

    /// Concatenated text of everything still buffered for a session.
    pub fn buffered_text(&self, id: SessionId) -> Option<String> {
        let session_log = lock_registry(&self.sessions).get(&id).cloned()?;
        let buf = session_log.lock();
        Some(buf.chunks.iter().map(|c| c.text.as_str()).collect())
    }
}

/// Line-oriented writer bound to one session, handed to pipeline stages.
#[derive(Clone)]
pub struct SessionLogSink {
    broadcaster: LogBroadcaster,
    id: SessionId,
}

impl SessionLogSink {
    pub fn new(broadcaster: LogBroadcaster, id: SessionId) -> Self {
        SessionLogSink { broadcaster, id }
    }

    pub fn session_id(&self) -> SessionId {
        self.id
    }

    /// Append `text` as one line, adding the trailing newline if missing.
    pub fn line(&self, text: impl AsRef<str>) {
        let text = text.as_ref();
        if text.ends_with('\n') {
            self.broadcaster.append(self.id, text);
        } else {
            self.broadcaster.append(self.id, format!("{}\n", text));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn texts(items: &[LogItem]) -> Vec<String> {
        items
            .iter()
            .filter_map(|i| match i {
                LogItem::Chunk(c) => Some(c.text.clone()),
                LogItem::Lagged { .. } => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_unknown_session_has_no_stream() {
        let broadcaster = LogBroadcaster::new(1024, None);
        assert!(broadcaster.subscribe(SessionId::new()).is_none());
    }

    #[tokio::test]
    async fn test_late_subscriber_replays_then_follows() {
        let broadcaster = LogBroadcaster::new(1 << 20, None);
        let id = SessionId::new();
        broadcaster.open(id);

        for i in 0..5 {
            broadcaster.append(id, format!("early {}\n", i));
        }
        broadcaster.flush().await.unwrap();

        let mut stream = broadcaster.subscribe(id).unwrap();
        for i in 0..5 {
            broadcaster.append(id, format!("late {}\n", i));
        }
        broadcaster.close(id);

        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item);
        }
        let expected: Vec<String> = (0..5)
            .map(|i| format!("early {}\n", i))
            .chain((0..5).map(|i| format!("late {}\n", i)))
            .collect();
        assert_eq!(texts(&items), expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_subscribers_see_identical_order() {
        let broadcaster = LogBroadcaster::new(1 << 20, None);
        let id = SessionId::new();
        broadcaster.open(id);

        let early = broadcaster.subscribe(id).unwrap();
        let producer = {
            let b = broadcaster.clone();
            std::thread::spawn(move || {
                for i in 0..2000 {
                    b.append(id, format!("{}\n", i));
                }
                b.close(id);
            })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        let late = broadcaster.subscribe(id).unwrap();

        let (a, b) = tokio::join!(early.collect::<Vec<_>>(), late.collect::<Vec<_>>());
        producer.join().unwrap();

        let expected: Vec<String> = (0..2000).map(|i| format!("{}\n", i)).collect();
        assert_eq!(texts(&a), expected);
        assert_eq!(texts(&b), expected);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_gets_single_marker() {
        // room for roughly 10 ten-byte chunks
        let broadcaster = LogBroadcaster::new(100, None);
        let id = SessionId::new();
        broadcaster.open(id);

        let stream = broadcaster.subscribe(id).unwrap();
        for i in 0..50 {
            broadcaster.append(id, format!("chunk-{:03}\n", i));
        }
        broadcaster.close(id);
        broadcaster.flush().await.unwrap();

        let items: Vec<LogItem> = stream.collect().await;
        let lag_markers: Vec<u64> = items
            .iter()
            .filter_map(|i| match i {
                LogItem::Lagged { skipped } => Some(*skipped),
                _ => None,
            })
            .collect();
        assert_eq!(lag_markers.len(), 1);
        assert!(matches!(items[0], LogItem::Lagged { .. }));

        let received = texts(&items);
        assert_eq!(lag_markers[0] as usize + received.len(), 50);
        assert_eq!(received.last().unwrap(), "chunk-049\n");
        let seqs: Vec<u64> = items
            .iter()
            .filter_map(|i| match i {
                LogItem::Chunk(c) => Some(c.seq),
                _ => None,
            })
            .collect();
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[tokio::test]
    async fn test_append_after_close_is_ignored() {
        let broadcaster = LogBroadcaster::new(1024, None);
        let id = SessionId::new();
        broadcaster.open(id);
        broadcaster.append(id, "one\n");
        broadcaster.close(id);
        broadcaster.append(id, "two\n");
        broadcaster.flush().await.unwrap();

        assert_eq!(broadcaster.buffered_text(id).unwrap(), "one\n");
        let items: Vec<LogItem> = broadcaster.subscribe(id).unwrap().collect().await;
        assert_eq!(texts(&items), vec!["one\n".to_string()]);
    }

    #[tokio::test]
    async fn test_subscribe_from_cursor() {
        let broadcaster = LogBroadcaster::new(1024, None);
        let id = SessionId::new();
        broadcaster.open(id);
        for t in ["a\n", "b\n", "c\n"] {
            broadcaster.append(id, t);
        }
        broadcaster.close(id);
        broadcaster.flush().await.unwrap();

        let items: Vec<LogItem> = broadcaster.subscribe_from(id, 2).unwrap().collect().await;
        assert_eq!(texts(&items), vec!["c\n".to_string()]);
    }

    #[tokio::test]
    async fn test_session_output_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let broadcaster = LogBroadcaster::new(1024, Some(dir.path().to_path_buf()));
        let id = SessionId::new();
        broadcaster.open(id);
        broadcaster.append(id, "Wrote: /tmp/x.rpm\n");
        broadcaster.close(id);
        broadcaster.flush().await.unwrap();

        let content = std::fs::read_to_string(dir.path().join(format!("{}.log", id))).unwrap();
        assert_eq!(content, "Wrote: /tmp/x.rpm\n");
    }

    #[test]
    fn test_failed_session_log_write_stops_persisting() {
        let dir = tempfile::tempdir().unwrap();
        let id = SessionId::new();
        let path = dir.path().join(format!("{}.log", id));
        std::fs::write(&path, "").unwrap();

        let mut files = SessionFiles::new(Some(dir.path().to_path_buf()));
        files.open.insert(id, File::open(&path).unwrap());
        files.write(id, "line 1\n");
        assert!(!files.is_persisting(id));

        // No reopen after the failure
        files.write(id, "line 2\n");
        assert!(!files.is_persisting(id));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        let other = SessionId::new();
        files.write(other, "other\n");
        assert!(files.is_persisting(other));
    }

    #[tokio::test]
    async fn test_unwritable_log_dir_keeps_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("logs");
        std::fs::write(&not_a_dir, "occupied").unwrap();

        let broadcaster = LogBroadcaster::new(1024, Some(not_a_dir));
        let id = SessionId::new();
        broadcaster.open(id);
        let stream = broadcaster.subscribe(id).unwrap();
        broadcaster.append(id, "one\n");
        broadcaster.append(id, "two\n");
        broadcaster.close(id);

        let items: Vec<LogItem> = tokio::time::timeout(Duration::from_secs(5), stream.collect())
            .await
            .unwrap();
        assert_eq!(texts(&items), vec!["one\n".to_string(), "two\n".to_string()]);
    }
}
