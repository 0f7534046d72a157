//! Connection-health monitoring: lifetime counters and a rolling five-minute
//! window of classified errors, used to signal when the connection pool looks
//! unhealthy.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;


/// Length of the rolling error window.
const WINDOW: Duration = Duration::from_secs(5 * 60);

/// Number of live errors in the window above which the pool is considered
/// unhealthy.
const RESET_ERROR_THRESHOLD: usize = 50;

/// Minimum delay between two unhealthy signals.
const RESET_INTERVAL: Duration = Duration::from_secs(10 * 60);


/// The classification of an error observed by the pipeline. Kinds drive both
/// the retry backoff and the health accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// HTTP 4xx while downloading a file.
    ClientStatus4xx,
    /// HTTP 403 on a manifest document, surfaced to the user and never retried.
    Forbidden,
    /// HTTP 5xx.
    ServerStatus5xx,
    /// The peer reset the connection.
    ConnectionReset,
    /// Any other socket-layer error.
    OtherSocket,
    /// A non-cancellation timeout.
    Timeout,
    /// A local file-system error during write or rename.
    Io,
    /// The computed digest doesn't match the expected one.
    DigestMismatch,
    /// Anything the pipeline didn't anticipate, recorded verbatim in the task's
    /// last error message.
    Unhandled,
    /// User cancellation, terminal.
    Cancelled,
}

impl ErrorKind {

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientStatus4xx => "ClientStatus4xx",
            Self::Forbidden => "Forbidden",
            Self::ServerStatus5xx => "ServerStatus5xx",
            Self::ConnectionReset => "ConnectionReset",
            Self::OtherSocket => "OtherSocket",
            Self::Timeout => "Timeout",
            Self::Io => "IOError",
            Self::DigestMismatch => "DigestMismatch",
            Self::Unhandled => "Unhandled",
            Self::Cancelled => "Cancelled",
        }
    }

}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}


/// The monitor itself. Workers record successes and classified errors through
/// atomic increments and lock-free enqueues; a single observer periodically
/// drains the window and asks for the unhealthy signal.
#[derive(Debug, Default)]
pub struct Monitor {
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    inbox: SegQueue<(Instant, ErrorKind)>,
    observer: Mutex<Observer>,
}

#[derive(Debug, Default)]
struct Observer {
    window: VecDeque<(Instant, ErrorKind)>,
    last_reset: Option<Instant>,
}

impl Monitor {

    pub fn new() -> Self {
        Self::default()
    }

    /// Record one successful request.
    pub fn notify_success(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one failed request with its classification.
    pub fn notify_error(&self, kind: ErrorKind) {
        self.notify_error_at(kind, Instant::now());
    }

    fn notify_error_at(&self, kind: ErrorKind, at: Instant) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        self.inbox.push((at, kind));
    }

    /// Lifetime request count.
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Lifetime error count.
    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    /// Number of errors currently live in the rolling window. Entries older
    /// than the window are dropped at every observation.
    pub fn live_errors(&self) -> usize {
        let mut observer = self.observer.lock().unwrap();
        observer.drain_and_expire(&self.inbox, Instant::now());
        observer.window.len()
    }

    /// True when the pool looks unhealthy: the rolling window holds at least
    /// [`RESET_ERROR_THRESHOLD`] live errors. Returns true at most once per
    /// [`RESET_INTERVAL`], callers are expected to act (or at least log) on it.
    pub fn should_reset_pool(&self) -> bool {

        let now = Instant::now();
        let mut observer = self.observer.lock().unwrap();
        observer.drain_and_expire(&self.inbox, now);

        if observer.window.len() < RESET_ERROR_THRESHOLD {
            return false;
        }

        match observer.last_reset {
            Some(last) if now.duration_since(last) < RESET_INTERVAL => false,
            _ => {
                observer.last_reset = Some(now);
                true
            }
        }

    }

}

impl Observer {

    /// Pull everything the producers enqueued into the window, then expire
    /// entries older than the window length.
    fn drain_and_expire(&mut self, inbox: &SegQueue<(Instant, ErrorKind)>, now: Instant) {
        while let Some(record) = inbox.pop() {
            self.window.push_back(record);
        }
        while let Some(&(at, _)) = self.window.front() {
            if now.duration_since(at) > WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

}
