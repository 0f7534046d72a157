//! The top-level synchronization procedure: manifest retrieval, scan, tiered
//! download and cache flush, with observable progress events.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::cache::{CACHE_FILE_NAME, DigestCache};
use crate::download::{self, BufferPool, Task, TaskStatus, Tier, TieredQueues, WorkerContext, WorkerEvent};
use crate::health::Monitor;
use crate::manifest::{self, Client, DEFAULT_MANAGEMENT_URL, RootDescriptor, Selection};
use crate::scan::{self, Policy};


/// Name of the game directory under the install root.
pub const GAME_DIR: &str = "PHANTASYSTARONLINE2_JP";

/// Name of the binaries directory under the game directory, the root of every
/// synchronized relative path.
pub const BIN_DIR: &str = "pso2_bin";

/// How often the pool health is observed while downloading.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on the worker count taken from the root descriptor's advisory
/// thread counts. Above 1, the advisory wins over the fixed tier split, capped
/// here.
const MAX_ADVISORY_WORKERS: usize = 16;


/// Block on the given future with a current-thread Tokio runtime with time and
/// I/O enabled. The blocking pool, which carries the scanner's hashing, is
/// capped at the scan concurrency ceiling instead of Tokio's default.
pub(crate) fn block_on<F: Future>(future: F) -> F::Output {

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .enable_io()
        .max_blocking_threads(scan::hash_concurrency())
        .build()
        .unwrap();

    rt.block_on(future)

}


/// A cancellation token shared between a synchronizer, its workers and any
/// external owner such as a Ctrl-C handler. Cancelling is one-way.
#[derive(Debug, Default)]
pub struct Cancellation(AtomicBool);

impl Cancellation {

    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; workers finalize their in-flight task as cancelled
    /// at the next read boundary.
    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

}


/// The synchronizer brings a local game tree into bit-exact agreement with the
/// remote manifest: scan what is present, download what is missing or
/// mismatched, verify every byte stream and install verified files atomically.
#[derive(Debug, Clone)]
pub struct Synchronizer {
    install_root: PathBuf,
    management_url: String,
    selection: Selection,
    policy: Policy,
    use_backup: bool,
    cancel: Arc<Cancellation>,
    running: bool,
}

impl Synchronizer {

    /// Create a new synchronizer with default configuration for the given
    /// install root, under which the game tree lives.
    pub fn new(install_root: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            management_url: DEFAULT_MANAGEMENT_URL.to_string(),
            selection: Selection::default(),
            policy: Policy::default(),
            use_backup: false,
            cancel: Arc::new(Cancellation::new()),
            running: false,
        }
    }

    /// The install root directory.
    #[inline]
    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    /// The directory every synchronized file lives under, derived from the
    /// install root.
    pub fn bin_dir(&self) -> PathBuf {
        self.install_root.join(GAME_DIR).join(BIN_DIR)
    }

    /// The URL of the root descriptor document.
    #[inline]
    pub fn management_url(&self) -> &str {
        &self.management_url
    }

    /// See [`Self::management_url`].
    #[inline]
    pub fn set_management_url(&mut self, url: impl Into<String>) -> &mut Self {
        self.management_url = url.into();
        self
    }

    /// The manifest selection to synchronize.
    #[inline]
    pub fn selection(&self) -> Selection {
        self.selection
    }

    /// See [`Self::selection`].
    #[inline]
    pub fn set_selection(&mut self, selection: Selection) -> &mut Self {
        self.selection = selection;
        self
    }

    /// The scan policy deciding how hard present files are inspected.
    #[inline]
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// See [`Self::policy`].
    #[inline]
    pub fn set_policy(&mut self, policy: Policy) -> &mut Self {
        self.policy = policy;
        self
    }

    /// When enabled, files are fetched from the backup base URLs declared in
    /// the root descriptor.
    #[inline]
    pub fn use_backup(&self) -> bool {
        self.use_backup
    }

    /// See [`Self::use_backup`].
    #[inline]
    pub fn set_use_backup(&mut self, use_backup: bool) -> &mut Self {
        self.use_backup = use_backup;
        self
    }

    /// The cancellation token of this synchronizer, to be shared with whatever
    /// should be able to interrupt the run.
    #[inline]
    pub fn cancellation(&self) -> Arc<Cancellation> {
        Arc::clone(&self.cancel)
    }

    /// Run the whole synchronization, blocking until completion, failure or
    /// cancellation. Partial success is a first-class outcome, reported through
    /// the returned summary and the completion event.
    #[inline]
    pub fn sync(&mut self, mut handler: impl Handler) -> Result<Summary> {
        self.sync_dyn(&mut handler)
    }

    /// Inner sync function to force dyn dispatch.
    #[inline(never)]
    fn sync_dyn(&mut self, handler: &mut dyn Handler) -> Result<Summary> {

        if self.running {
            return Err(Error::AlreadyRunning {  });
        }

        self.running = true;
        let result = block_on(self.sync_impl(handler));
        self.running = false;
        result

    }

    async fn sync_impl(&self, handler: &mut dyn Handler) -> Result<Summary> {

        let bin_dir = self.bin_dir();

        let cache = Arc::new(DigestCache::new(bin_dir.join(CACHE_FILE_NAME)));
        cache.load().await;

        let mut client = Client::new()?;
        let root = client.fetch_root(&self.management_url).await?;
        client.set_timeout(root.timeout);
        handler.on_event(Event::LoadedRoot { root: &root });

        // The advisory thread counts win over the fixed tier split when they
        // say anything meaningful; the affinity list itself never changes.
        let advisory = root.thread_num.max(root.parallel_thread_num) as usize;
        let worker_count = if advisory > 1 {
            advisory.min(MAX_ADVISORY_WORKERS)
        } else {
            download::TOTAL_WORKERS
        };
        let max_retries = root.retry_num;

        let manifest = client.fetch_manifest(&root, self.selection).await?;
        handler.on_event(Event::LoadedManifest { count: manifest.len() });

        let download_set = scan::scan(
            manifest,
            &bin_dir,
            self.policy,
            Arc::clone(&cache),
            |scanned, total| handler.on_event(Event::ScanProgress { scanned, total }),
        ).await;

        if download_set.is_empty() {
            cache.flush().await;
            handler.on_event(Event::DownloadCompleted {
                ok: true,
                succeeded: 0,
                failed: 0,
                cancelled: 0,
            });
            return Ok(Summary::default());
        }

        let total = download_set.len();
        handler.on_event(Event::DownloadStarted { total });

        let mut paths = Vec::with_capacity(total);
        let mut tasks = Vec::with_capacity(total);
        for (index, entry) in download_set.into_iter().enumerate() {
            let dest = scan::dest_path(&bin_dir, entry.rel_path());
            paths.push(Box::<str>::from(entry.rel_path()));
            tasks.push(Task::new(index, entry, dest));
        }

        let queues = TieredQueues::new();
        queues.enqueue_all(tasks);

        let monitor = Arc::new(Monitor::new());
        let ctx = Arc::new(WorkerContext {
            client,
            root,
            queues,
            cache: Arc::clone(&cache),
            monitor: Arc::clone(&monitor),
            buffers: Arc::new(BufferPool::default()),
            cancel: Arc::clone(&self.cancel),
            max_retries,
            use_backup: self.use_backup,
        });

        let (tx, mut rx) = mpsc::channel(worker_count * 2);

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            workers.spawn(download::run_worker(Arc::clone(&ctx), worker_id, tx.clone()));
        }

        // Workers hold the only senders left, so the channel closes with them.
        drop(tx);

        let mut summary = Summary::default();

        let mut health_interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        health_interval.tick().await;

        loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(e)) => tracing::warn!("download worker failed: {e}"),
                    None => break,
                },
                Some(event) = rx.recv() => {
                    handle_worker_event(handler, &paths, &mut summary, event);
                }
                _ = health_interval.tick() => {
                    if monitor.should_reset_pool() {
                        tracing::warn!(
                            "connection pool looks unhealthy ({} errors in the rolling window), consider reducing concurrency",
                            monitor.live_errors(),
                        );
                    }
                }
            }
        }

        while let Ok(event) = rx.try_recv() {
            handle_worker_event(handler, &paths, &mut summary, event);
        }

        // Tasks still queued when the workers unwound were never dispensed,
        // they finalize as cancelled so every task is accounted for.
        while let Some(mut task) = ctx.queues.try_dequeue_for(Tier::Large) {
            task.status = TaskStatus::Cancelled;
            summary.cancelled += 1;
        }

        cache.flush().await;

        handler.on_event(Event::DownloadCompleted {
            ok: summary.ok(),
            succeeded: summary.succeeded,
            failed: summary.failed,
            cancelled: summary.cancelled,
        });

        Ok(summary)

    }

}

/// Forward one worker event to the handler, tallying finished tasks.
fn handle_worker_event(
    handler: &mut dyn Handler,
    paths: &[Box<str>],
    summary: &mut Summary,
    event: WorkerEvent,
) {
    match event {
        WorkerEvent::Progress { worker_id, index, bytes_done, bytes_total } => {
            handler.on_event(Event::DownloadProgress {
                worker_id,
                rel_path: &paths[index],
                bytes_done,
                bytes_total,
            });
        }
        WorkerEvent::Verified { worker_id, index, ok } => {
            handler.on_event(Event::FileVerified {
                worker_id,
                rel_path: &paths[index],
                ok,
            });
        }
        WorkerEvent::Finished { task } => {
            match task.status {
                TaskStatus::Completed => summary.succeeded += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
                _ => summary.failed += 1,
            }
        }
    }
}


/// Counts of the tasks of a finished run, by terminal status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl Summary {

    /// True when every task of the run completed successfully.
    #[inline]
    pub fn ok(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }

}


/// Events happening while synchronizing.
#[derive(Debug)]
#[non_exhaustive]
pub enum Event<'a> {
    /// The root descriptor has been fetched and parsed.
    LoadedRoot { root: &'a RootDescriptor },
    /// The manifest union for the configured selection has been loaded.
    LoadedManifest { count: usize },
    /// The scanner has checked `scanned` of `total` manifest entries.
    ScanProgress { scanned: usize, total: usize },
    /// The scan found work: `total` files will be downloaded.
    DownloadStarted { total: usize },
    /// A worker streamed more bytes of a file.
    DownloadProgress { worker_id: usize, rel_path: &'a str, bytes_done: u64, bytes_total: u64 },
    /// A file finished verification, successfully or not.
    FileVerified { worker_id: usize, rel_path: &'a str, ok: bool },
    /// The run is over, with per-status counts.
    DownloadCompleted { ok: bool, succeeded: usize, failed: usize, cancelled: usize },
}

/// A handle for watching a synchronization.
pub trait Handler {
    /// Handle a single event.
    fn on_event(&mut self, event: Event);
}

// Mutable implementation.
impl<H: Handler + ?Sized> Handler for &mut H {
    #[inline]
    fn on_event(&mut self, event: Event) {
        (**self).on_event(event)
    }
}

impl Handler for () {
    fn on_event(&mut self, event: Event) {
        let _ = event;
    }
}


/// The synchronization could not run at all. Per-file failures are not errors,
/// they are reported through events and the run summary.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A synchronization is already running on this instance.
    #[error("already running")]
    AlreadyRunning {  },
    /// The manifest could not be retrieved or is unusable.
    #[error("manifest: {0}")]
    Manifest(#[from] manifest::Error),
    /// A generic error that originates from internal or third-party
    /// dependencies, associated to an origin string that helps knowing the
    /// location of the issue.
    #[error("internal: {error} @ {origin}")]
    Internal {
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
        origin: Box<str>,
    },
}

/// Type alias for a result with the synchronization error type.
pub type Result<T> = std::result::Result<T, Error>;


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn cancellation_is_one_way() {
        let cancel = Cancellation::new();
        assert!(!cancel.is_cancelled());
        cancel.cancel();
        assert!(cancel.is_cancelled());
        cancel.cancel();
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn summary_ok() {
        assert!(Summary::default().ok());
        assert!(Summary { succeeded: 3, failed: 0, cancelled: 0 }.ok());
        assert!(!Summary { succeeded: 3, failed: 1, cancelled: 0 }.ok());
        assert!(!Summary { succeeded: 3, failed: 0, cancelled: 1 }.ok());
    }

    #[test]
    fn bin_dir_layout() {
        let sync = Synchronizer::new("/games/pso2");
        assert_eq!(sync.bin_dir(), Path::new("/games/pso2/PHANTASYSTARONLINE2_JP/pso2_bin"));
    }

}
