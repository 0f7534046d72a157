//! The download core: the tiered work-stealing scheduler, the shared buffer
//! pool and the per-file fetch-verify-install pipeline executed by the worker
//! pool.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;

use reqwest::StatusCode;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::cache::DigestCache;
use crate::health::{ErrorKind, Monitor};
use crate::manifest::{Client, Entry, RootDescriptor};
use crate::sync::Cancellation;


/// Extension appended to the destination path while a file is being written.
/// Only verified content is ever renamed over the final path.
pub const TEMP_SUFFIX: &str = ".dtmp";

/// Sizes strictly above this are Large tier.
pub const LARGE_THRESHOLD: u64 = 50 * 1024 * 1024;

/// Sizes from this up to the large threshold are Medium tier, below is Small.
pub const MEDIUM_THRESHOLD: u64 = 5 * 1024 * 1024;

/// Workers affine to each tier.
pub(crate) const LARGE_WORKERS: usize = 16;
pub(crate) const MEDIUM_WORKERS: usize = 6;
pub(crate) const SMALL_WORKERS: usize = 6;

/// Total size of the worker pool.
pub(crate) const TOTAL_WORKERS: usize = LARGE_WORKERS + MEDIUM_WORKERS + SMALL_WORKERS;

/// Granularity of the write+hash loop, also the capacity of rented buffers.
const CHUNK_SIZE: usize = 64 * 1024;

/// Emit at most one progress notification per this many bytes...
const PROGRESS_BYTES_INTERVAL: u64 = 256 * 1024;

/// ...or per this much time, whichever comes first.
const PROGRESS_TIME_INTERVAL: Duration = Duration::from_secs(1);


/// The lifecycle of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Downloading,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

/// One file to bring up to date: a manifest entry, its destination path and the
/// mutable download state. Owned by the scheduler while queued, by a worker
/// while in flight.
#[derive(Debug)]
pub struct Task {
    /// Position in the download set, used to route events.
    pub(crate) index: usize,
    entry: Entry,
    dest: PathBuf,
    pub status: TaskStatus,
    pub bytes_downloaded: u64,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl Task {

    pub(crate) fn new(index: usize, entry: Entry, dest: PathBuf) -> Self {
        Self {
            index,
            entry,
            dest,
            status: TaskStatus::Pending,
            bytes_downloaded: 0,
            retry_count: 0,
            last_error: None,
        }
    }

    /// The manifest entry this task downloads.
    #[inline]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Absolute destination path of the verified file.
    #[inline]
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// The tier this task belongs to, from its expected size.
    #[inline]
    pub fn tier(&self) -> Tier {
        Tier::of(self.entry.size())
    }

}

/// Derive the temporary path a task streams into.
pub(crate) fn temp_path(dest: &Path) -> PathBuf {
    let mut path = dest.as_os_str().to_os_string();
    path.push(TEMP_SUFFIX);
    PathBuf::from(path)
}


/// The three size buckets tasks are scheduled by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Large,
    Medium,
    Small,
}

impl Tier {

    /// The tier for a file of the given expected size.
    pub fn of(size: u64) -> Self {
        if size > LARGE_THRESHOLD {
            Self::Large
        } else if size >= MEDIUM_THRESHOLD {
            Self::Medium
        } else {
            Self::Small
        }
    }

    /// The order a worker affine to this tier polls the queues in: its own tier
    /// first, then stealing from the others.
    fn poll_order(self) -> [Tier; 3] {
        match self {
            Self::Large => [Self::Large, Self::Medium, Self::Small],
            Self::Medium => [Self::Medium, Self::Small, Self::Large],
            Self::Small => [Self::Small, Self::Medium, Self::Large],
        }
    }

}

/// The affinity of the n-th worker of the pool: 16 Large, then 6 Medium, then
/// 6 Small. Pools smaller than the full split take affinities from the head of
/// this list, work-stealing covers the rest.
pub(crate) fn affinity_for(worker_id: usize) -> Tier {
    if worker_id < LARGE_WORKERS {
        Tier::Large
    } else if worker_id < LARGE_WORKERS + MEDIUM_WORKERS {
        Tier::Medium
    } else {
        Tier::Small
    }
}


/// The tiered scheduler: three lock-free queues partitioned by expected size.
/// Large and Medium are filled in descending size so the heaviest transfers
/// start first, Small keeps insertion order.
#[derive(Debug, Default)]
pub struct TieredQueues {
    large: SegQueue<Task>,
    medium: SegQueue<Task>,
    small: SegQueue<Task>,
}

impl TieredQueues {

    pub fn new() -> Self {
        Self::default()
    }

    /// Partition and enqueue a whole download set.
    pub fn enqueue_all(&self, tasks: Vec<Task>) {

        let mut large = Vec::new();
        let mut medium = Vec::new();
        let mut small = Vec::new();

        for task in tasks {
            match task.tier() {
                Tier::Large => large.push(task),
                Tier::Medium => medium.push(task),
                Tier::Small => small.push(task),
            }
        }

        large.sort_by(|a, b| b.entry().size().cmp(&a.entry().size()));
        medium.sort_by(|a, b| b.entry().size().cmp(&a.entry().size()));

        large.into_iter().for_each(|task| self.large.push(task));
        medium.into_iter().for_each(|task| self.medium.push(task));
        small.into_iter().for_each(|task| self.small.push(task));

    }

    /// Put a task back, routed by its size tier regardless of which worker held
    /// it.
    pub fn requeue(&self, task: Task) {
        match task.tier() {
            Tier::Large => self.large.push(task),
            Tier::Medium => self.medium.push(task),
            Tier::Small => self.small.push(task),
        }
    }

    pub fn try_dequeue_large(&self) -> Option<Task> {
        self.large.pop()
    }

    pub fn try_dequeue_medium(&self) -> Option<Task> {
        self.medium.pop()
    }

    pub fn try_dequeue_small(&self) -> Option<Task> {
        self.small.pop()
    }

    /// Poll the queues in the steal order of the given affinity.
    pub(crate) fn try_dequeue_for(&self, affinity: Tier) -> Option<Task> {
        for tier in affinity.poll_order() {
            let task = match tier {
                Tier::Large => self.large.pop(),
                Tier::Medium => self.medium.pop(),
                Tier::Small => self.small.pop(),
            };
            if task.is_some() {
                return task;
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.large.len() + self.medium.len() + self.small.len()
    }

    pub fn is_empty(&self) -> bool {
        self.large.is_empty() && self.medium.is_empty() && self.small.is_empty()
    }

}


/// A shared pool of reusable I/O buffers, rented by workers around each task
/// and returned on every exit path by the rent guard.
#[derive(Debug, Default)]
pub(crate) struct BufferPool {
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {

    /// Rent a cleared buffer with the chunk capacity. The guard keeps the pool
    /// alive, so rented buffers can move into the per-task writer.
    pub fn rent(self: &Arc<Self>) -> PooledBuf {
        let buf = self.bufs.lock().unwrap().pop()
            .unwrap_or_else(|| Vec::with_capacity(CHUNK_SIZE));
        PooledBuf { pool: Arc::clone(self), buf }
    }

}

/// A rented buffer, returned to its pool when dropped.
pub(crate) struct PooledBuf {
    pool: Arc<BufferPool>,
    buf: Vec<u8>,
}

impl std::ops::Deref for PooledBuf {
    type Target = Vec<u8>;
    #[inline]
    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        self.pool.bufs.lock().unwrap().push(buf);
    }
}


/// Classify a non-success HTTP status.
pub(crate) fn classify_status(status: StatusCode) -> ErrorKind {
    if status.is_server_error() {
        ErrorKind::ServerStatus5xx
    } else {
        ErrorKind::ClientStatus4xx
    }
}

/// Classify a reqwest transport error by inspecting it and its source chain.
pub(crate) fn classify_reqwest(error: &reqwest::Error) -> ErrorKind {
    if error.is_timeout() {
        ErrorKind::Timeout
    } else if let Some(kind) = find_io_kind(error) {
        match kind {
            io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
            _ => ErrorKind::OtherSocket,
        }
    } else if error.is_connect() || error.is_request() {
        ErrorKind::OtherSocket
    } else {
        ErrorKind::Unhandled
    }
}

/// Walk an error's source chain looking for an I/O error kind.
fn find_io_kind(error: &(dyn std::error::Error + 'static)) -> Option<io::ErrorKind> {
    let mut source = Some(error);
    while let Some(err) = source {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        source = err.source();
    }
    None
}

/// The backoff slept before the next attempt after an error of the given kind.
pub(crate) fn backoff_delay(kind: ErrorKind) -> Duration {
    match kind {
        ErrorKind::ConnectionReset |
        ErrorKind::Io |
        ErrorKind::DigestMismatch => Duration::from_millis(500),
        ErrorKind::ServerStatus5xx |
        ErrorKind::OtherSocket |
        ErrorKind::Timeout |
        ErrorKind::Unhandled => Duration::from_secs(1),
        ErrorKind::ClientStatus4xx |
        ErrorKind::Forbidden => Duration::from_secs(2),
        ErrorKind::Cancelled => Duration::ZERO,
    }
}


/// One classified failure of a download attempt.
struct AttemptError {
    kind: ErrorKind,
    message: String,
}

impl AttemptError {

    fn new(kind: ErrorKind, message: impl fmt::Display) -> Self {
        Self { kind, message: message.to_string() }
    }

    fn io(error: io::Error, origin: &str) -> Self {
        Self::new(ErrorKind::Io, format_args!("{origin}: {error}"))
    }

}


/// Everything a worker needs, shared across the pool.
pub(crate) struct WorkerContext {
    pub client: Client,
    pub root: RootDescriptor,
    pub queues: TieredQueues,
    pub cache: Arc<DigestCache>,
    pub monitor: Arc<Monitor>,
    pub buffers: Arc<BufferPool>,
    pub cancel: Arc<Cancellation>,
    pub max_retries: u32,
    pub use_backup: bool,
}

/// Events sent from workers back to the orchestrator's driver loop.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Progress {
        worker_id: usize,
        index: usize,
        bytes_done: u64,
        bytes_total: u64,
    },
    Verified {
        worker_id: usize,
        index: usize,
        ok: bool,
    },
    Finished {
        task: Task,
    },
}

/// The loop of one worker: drain the queues in affinity order until every tier
/// is empty or the run is cancelled, then terminate.
pub(crate) async fn run_worker(
    ctx: Arc<WorkerContext>,
    worker_id: usize,
    tx: mpsc::Sender<WorkerEvent>,
) {

    let affinity = affinity_for(worker_id);

    loop {

        if ctx.cancel.is_cancelled() {
            break;
        }

        let Some(task) = ctx.queues.try_dequeue_for(affinity) else { break };
        let task = process_task(&ctx, worker_id, task, &tx).await;
        let _ = tx.send(WorkerEvent::Finished { task }).await;

    }

}

/// Run the whole fetch-verify-install pipeline for one task, retrying with
/// per-kind backoff until success, exhaustion or cancellation.
async fn process_task(
    ctx: &WorkerContext,
    worker_id: usize,
    mut task: Task,
    tx: &mpsc::Sender<WorkerEvent>,
) -> Task {

    task.status = TaskStatus::Downloading;
    let tmp = temp_path(task.dest());

    for attempt in 0..ctx.max_retries.max(1) {

        if ctx.cancel.is_cancelled() {
            task.status = TaskStatus::Cancelled;
            return task;
        }

        task.retry_count = attempt;

        match run_attempt(ctx, worker_id, &mut task, &tmp, tx).await {
            Ok(()) => {
                task.status = TaskStatus::Completed;
                ctx.monitor.notify_success();
                let _ = tx.send(WorkerEvent::Verified {
                    worker_id,
                    index: task.index,
                    ok: true,
                }).await;
                return task;
            }
            Err(e) if e.kind == ErrorKind::Cancelled => {
                // The temporary file is left behind, the next attempt or the
                // next run truncates it.
                task.status = TaskStatus::Cancelled;
                return task;
            }
            Err(e) => {
                tracing::debug!(
                    "worker {worker_id}: attempt {attempt} for {} failed ({}): {}",
                    task.entry().rel_path(), e.kind, e.message,
                );
                task.status = TaskStatus::Downloading;
                task.last_error = Some(format!("{}: {}", e.kind, e.message));
                ctx.monitor.notify_error(e.kind);
                tokio::time::sleep(backoff_delay(e.kind)).await;
            }
        }

    }

    task.status = TaskStatus::Failed;
    task.last_error = Some(format!(
        "exceeded max retries ({}): {}",
        ctx.max_retries,
        task.last_error.as_deref().unwrap_or("unknown error"),
    ));

    let _ = tokio::fs::remove_file(&tmp).await;

    let _ = tx.send(WorkerEvent::Verified {
        worker_id,
        index: task.index,
        ok: false,
    }).await;

    task

}

/// One attempt of the pipeline: stream, hash, write, verify, install, record.
async fn run_attempt(
    ctx: &WorkerContext,
    worker_id: usize,
    task: &mut Task,
    tmp: &Path,
    tx: &mpsc::Sender<WorkerEvent>,
) -> Result<(), AttemptError> {

    let mut resp = ctx.client.open_stream(&ctx.root, task.entry(), ctx.use_backup).await
        .map_err(|e| AttemptError::new(classify_reqwest(&e), e))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(AttemptError::new(classify_status(status), format_args!("status {status}")));
    }

    let expected_len = resp.content_length().unwrap_or(task.entry().size());

    if let Some(parent) = task.dest().parent() {
        tokio::fs::create_dir_all(parent).await
            .map_err(|e| AttemptError::io(e, "create parent directory"))?;
    }

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(tmp).await
        .map_err(|e| AttemptError::io(e, "open temporary file"))?;

    // Preallocating reduces fragmentation for the big tier; the file is
    // truncated back to the actual stream length after end-of-stream.
    if expected_len > 0 {
        file.set_len(expected_len).await
            .map_err(|e| AttemptError::io(e, "preallocate temporary file"))?;
    }

    let mut context = md5::Context::new();

    // Double buffering: each full block is fed to the digest and handed to the
    // writer task, so the write of block N is dispatched concurrently with
    // reading and hashing block N+1. A block's buffer is only reused once its
    // write has completed (through the reuse channel), which keeps at most two
    // blocks in flight, one being written and one being read, and the writes
    // themselves in stream order.
    let (block_tx, mut block_rx) = mpsc::channel::<PooledBuf>(1);
    let (reuse_tx, mut reuse_rx) = mpsc::channel::<PooledBuf>(2);

    let writer = tokio::spawn(async move {
        while let Some(block) = block_rx.recv().await {
            file.write_all(&block).await?;
            // The streaming side may be done with reuses, the block then just
            // drops back into the pool.
            let _ = reuse_tx.send(block).await;
        }
        Ok::<_, io::Error>(file)
    });

    let mut buf = ctx.buffers.rent();
    let mut second_rented = false;

    let mut bytes_done = 0u64;
    let mut last_progress_bytes = 0u64;
    let mut last_progress_at = Instant::now();

    task.bytes_downloaded = 0;

    loop {

        if ctx.cancel.is_cancelled() {
            return Err(AttemptError::new(ErrorKind::Cancelled, "cancelled"));
        }

        let chunk = resp.chunk().await
            .map_err(|e| AttemptError::new(classify_reqwest(&e), e))?;
        let Some(chunk) = chunk else { break };

        let mut rest = &chunk[..];
        while !rest.is_empty() {
            let take = (CHUNK_SIZE - buf.len()).min(rest.len());
            buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if buf.len() == CHUNK_SIZE {
                context.consume(&buf[..]);
                if block_tx.send(buf).await.is_err() {
                    return Err(writer_failure(writer).await);
                }
                buf = if second_rented {
                    // Waits for the previous write to complete before its
                    // buffer is filled again.
                    match reuse_rx.recv().await {
                        Some(block) => block,
                        None => return Err(writer_failure(writer).await),
                    }
                } else {
                    second_rented = true;
                    ctx.buffers.rent()
                };
            }
        }

        bytes_done += chunk.len() as u64;
        task.bytes_downloaded = bytes_done;

        if bytes_done - last_progress_bytes >= PROGRESS_BYTES_INTERVAL
            || last_progress_at.elapsed() >= PROGRESS_TIME_INTERVAL
        {
            last_progress_bytes = bytes_done;
            last_progress_at = Instant::now();
            let _ = tx.send(WorkerEvent::Progress {
                worker_id,
                index: task.index,
                bytes_done,
                bytes_total: expected_len,
            }).await;
        }

    }

    if !buf.is_empty() {
        context.consume(&buf[..]);
        // A send failure surfaces as the writer's own error just below.
        let _ = block_tx.send(buf).await;
    }

    // Closing the channel lets the writer drain and give the handle back.
    drop(block_tx);
    let mut file = match writer.await {
        Ok(Ok(file)) => file,
        Ok(Err(e)) => return Err(AttemptError::io(e, "write block")),
        Err(e) => return Err(AttemptError::new(ErrorKind::Unhandled, e)),
    };

    // Shorter-than-expected streams must not keep the preallocated zero tail.
    file.set_len(bytes_done).await
        .map_err(|e| AttemptError::io(e, "truncate temporary file"))?;
    file.flush().await
        .map_err(|e| AttemptError::io(e, "flush temporary file"))?;
    drop(file);

    task.status = TaskStatus::Verifying;
    let digest = format!("{:x}", context.compute());

    if !digest.eq_ignore_ascii_case(task.entry().md5()) {
        let _ = tokio::fs::remove_file(tmp).await;
        return Err(AttemptError::new(ErrorKind::DigestMismatch, format_args!(
            "expected {}, got {digest}", task.entry().md5(),
        )));
    }

    let _ = tx.send(WorkerEvent::Progress {
        worker_id,
        index: task.index,
        bytes_done,
        bytes_total: bytes_done,
    }).await;

    // A read-only destination would make the rename fail on some platforms.
    if let Ok(meta) = tokio::fs::metadata(task.dest()).await {
        let mut perms = meta.permissions();
        if perms.readonly() {
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(false);
            tokio::fs::set_permissions(task.dest(), perms).await
                .map_err(|e| AttemptError::io(e, "clear read-only attribute"))?;
        }
    }

    tokio::fs::rename(tmp, task.dest()).await
        .map_err(|e| AttemptError::io(e, "install verified file"))?;

    let meta = tokio::fs::metadata(task.dest()).await
        .map_err(|e| AttemptError::io(e, "stat installed file"))?;
    if let Ok(mtime) = meta.modified() {
        ctx.cache.record(task.entry().rel_path(), digest, meta.len(), mtime.into());
    }

    Ok(())

}

/// Collect the writer task's outcome once its channel side has failed.
async fn writer_failure(writer: tokio::task::JoinHandle<io::Result<tokio::fs::File>>) -> AttemptError {
    match writer.await {
        Ok(Err(e)) => AttemptError::io(e, "write block"),
        Err(e) => AttemptError::new(ErrorKind::Unhandled, e),
        // The channel side failed, so the writer can't have ended cleanly.
        Ok(Ok(_)) => AttemptError::new(ErrorKind::Unhandled, "writer stopped unexpectedly"),
    }
}
