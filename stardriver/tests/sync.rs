//! End-to-end synchronization tests against a mock patch server.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use mockito::{Mock, ServerGuard};

use tempfile::TempDir;

use stardriver::manifest::{self, Selection};
use stardriver::scan::Policy;
use stardriver::sync::{Error, Event, Handler, Synchronizer};


/// MD5 of "abcd".
const MD5_ABCD: &str = "e2fc714c4727ee9395f324cd2e7f331f";
/// MD5 of the empty string.
const MD5_EMPTY: &str = "d41d8cd98f00b204e9800998ecf8427e";
/// MD5 of "0123456789".
const MD5_DIGITS: &str = "781e5e245d69b566979b86e28d23f2c7";


struct TestSync {
    server: ServerGuard,
    #[allow(unused)]
    dir: TempDir,
    sync: Synchronizer,
}

impl TestSync {

    fn new() -> Self {

        fs::create_dir_all(env!("CARGO_TARGET_TMPDIR")).unwrap();
        let dir = tempfile::Builder::new()
            .prefix("")
            .suffix(".sync")
            .tempdir_in(env!("CARGO_TARGET_TMPDIR"))
            .unwrap();

        let server = mockito::Server::new();

        let mut sync = Synchronizer::new(dir.path());
        sync.set_management_url(format!("{}/management_beta.txt", server.url()));
        sync.set_selection(Selection::LauncherOnly);

        Self { server, dir, sync }

    }

    /// Serve a management document pointing back at this server.
    fn mock_management(&mut self, retry_num: u32) -> Mock {
        let body = format!(
            "PatchURL={0}/patch\nMasterURL={0}/master\nRetryNum={retry_num}\nTimeOut=5000\n",
            self.server.url(),
        );
        self.server.mock("GET", "/management_beta.txt")
            .with_status(200)
            .with_body(body)
            .create()
    }

    /// Serve the launcher list with the given rows.
    fn mock_launcherlist(&mut self, rows: &[(&str, u64, &str)]) -> Mock {
        let body = rows.iter()
            .map(|(name, size, md5)| format!("{name}\t{size}\t{md5}\n"))
            .collect::<String>();
        self.server.mock("GET", "/patch/launcherlist.txt")
            .with_status(200)
            .with_body(body)
            .create()
    }

    /// Serve one file body from the patch base.
    fn mock_file(&mut self, name: &str, body: &'static [u8]) -> Mock {
        self.server.mock("GET", &*format!("/patch/{name}"))
            .with_status(200)
            .with_body(body)
            .create()
    }

    fn bin_dir(&self) -> PathBuf {
        self.sync.bin_dir()
    }

    fn cache_file(&self) -> PathBuf {
        self.bin_dir().join("StarDriver.cache.json")
    }

    /// Parse the persisted cache document and return its entry count.
    fn cache_len(&self) -> usize {
        let text = fs::read_to_string(self.cache_file()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        value.as_object().unwrap().len()
    }

}

/// A handler recording the interesting events for assertions.
#[derive(Debug, Default)]
struct RecordingHandler {
    started: Option<usize>,
    verified: Vec<(String, bool)>,
    completed: Option<(bool, usize, usize, usize)>,
}

impl Handler for RecordingHandler {
    fn on_event(&mut self, event: Event) {
        match event {
            Event::DownloadStarted { total } => {
                self.started = Some(total);
            }
            Event::FileVerified { rel_path, ok, .. } => {
                self.verified.push((rel_path.to_string(), ok));
            }
            Event::DownloadCompleted { ok, succeeded, failed, cancelled } => {
                self.completed = Some((ok, succeeded, failed, cancelled));
            }
            _ => {}
        }
    }
}


#[test]
fn fresh_install() {

    let mut t = TestSync::new();
    t.mock_management(10);
    t.mock_launcherlist(&[
        ("a.bin.pat", 4, MD5_ABCD),
        ("b.bin.pat", 0, MD5_EMPTY),
        ("c.bin.pat", 10, MD5_DIGITS),
    ]);
    t.mock_file("a.bin.pat", b"abcd");
    t.mock_file("b.bin.pat", b"");
    t.mock_file("c.bin.pat", b"0123456789");

    let mut handler = RecordingHandler::default();
    let summary = t.sync.sync(&mut handler).unwrap();

    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.cancelled, 0);
    assert!(summary.ok());

    assert_eq!(handler.started, Some(3));
    assert_eq!(handler.verified.len(), 3);
    assert!(handler.verified.iter().all(|(_, ok)| *ok));
    assert_eq!(handler.completed, Some((true, 3, 0, 0)));

    let bin_dir = t.bin_dir();
    assert_eq!(fs::read(bin_dir.join("a.bin")).unwrap(), b"abcd");
    assert_eq!(fs::read(bin_dir.join("b.bin")).unwrap(), b"");
    assert_eq!(fs::read(bin_dir.join("c.bin")).unwrap(), b"0123456789");

    // No temporary left behind, and every install is in the cache.
    for name in ["a.bin", "b.bin", "c.bin"] {
        assert!(!bin_dir.join(format!("{name}.dtmp")).exists());
    }
    assert_eq!(t.cache_len(), 3);

}

#[test]
fn digest_mismatch_then_recovery() {

    let mut t = TestSync::new();
    t.mock_management(10);
    t.mock_launcherlist(&[("a.bin.pat", 4, MD5_ABCD)]);

    // Wrong bytes on the first attempt, correct ones afterwards.
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_body = Arc::clone(&calls);
    t.server.mock("GET", "/patch/a.bin.pat")
        .with_status(200)
        .with_chunked_body(move |w| {
            if calls_in_body.fetch_add(1, Ordering::SeqCst) == 0 {
                w.write_all(b"xxxx")
            } else {
                w.write_all(b"abcd")
            }
        })
        .create();

    let start = Instant::now();
    let summary = t.sync.sync(()).unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Exactly one retry, separated by the digest-mismatch backoff.
    assert!(start.elapsed() >= Duration::from_millis(500));

    assert_eq!(fs::read(t.bin_dir().join("a.bin")).unwrap(), b"abcd");

}

#[test]
fn forbidden_manifest_aborts() {

    let mut t = TestSync::new();
    t.server.mock("GET", "/management_beta.txt")
        .with_status(403)
        .create();

    let mut handler = RecordingHandler::default();
    let err = t.sync.sync(&mut handler).unwrap_err();

    assert!(matches!(err, Error::Manifest(manifest::Error::Forbidden { .. })));
    assert!(err.to_string().contains("Forbidden"));

    // The worker pool never started.
    assert_eq!(handler.started, None);
    assert!(handler.verified.is_empty());
    assert_eq!(handler.completed, None);

}

#[test]
fn partial_completion() {

    let mut t = TestSync::new();
    t.mock_management(2);
    t.mock_launcherlist(&[
        ("a.bin.pat", 4, MD5_ABCD),
        ("b.bin.pat", 0, MD5_EMPTY),
        ("c.bin.pat", 10, MD5_DIGITS),
        ("d.bin.pat", 4, MD5_ABCD),
        ("e.bin.pat", 4, MD5_ABCD),
    ]);
    t.mock_file("a.bin.pat", b"abcd");
    t.mock_file("b.bin.pat", b"");
    t.mock_file("c.bin.pat", b"0123456789");
    t.mock_file("d.bin.pat", b"abcd");
    let e_mock = t.server.mock("GET", "/patch/e.bin.pat")
        .with_status(500)
        .expect(2)
        .create();

    let mut handler = RecordingHandler::default();
    let summary = t.sync.sync(&mut handler).unwrap();

    // Both configured attempts were spent on the failing file.
    e_mock.assert();

    assert_eq!(summary.succeeded, 4);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.cancelled, 0);
    assert!(!summary.ok());

    assert_eq!(handler.completed, Some((false, 4, 1, 0)));
    assert!(handler.verified.contains(&("e.bin".to_string(), false)));

    let bin_dir = t.bin_dir();
    assert!(!bin_dir.join("e.bin").exists());
    assert!(!bin_dir.join("e.bin.dtmp").exists());
    assert_eq!(t.cache_len(), 4);

}

#[test]
fn cancellation_stops_workers() {

    let mut t = TestSync::new();
    t.mock_management(10);
    t.mock_launcherlist(&[("big.bin.pat", 102400, MD5_ABCD)]);

    // A deliberately slow body, dribbling chunks for several seconds.
    t.server.mock("GET", "/patch/big.bin.pat")
        .with_status(200)
        .with_chunked_body(|w| {
            for _ in 0..100 {
                w.write_all(&[0u8; 1024])?;
                std::thread::sleep(Duration::from_millis(50));
            }
            Ok(())
        })
        .create();

    let cancel = t.sync.cancellation();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(600));
        cancel.cancel();
    });

    let mut handler = RecordingHandler::default();
    let summary = t.sync.sync(&mut handler).unwrap();
    canceller.join().unwrap();

    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.cancelled, 1);

    // Cancelled tasks are never reported as verified and never installed.
    assert!(handler.verified.is_empty());
    assert!(!t.bin_dir().join("big.bin").exists());

}

#[test]
fn selection_union_precedence() {

    let mut t = TestSync::new();
    t.mock_management(10);

    // The same name in every list: the reboot row must win, so only the reboot
    // content verifies. The launcher list only contributes the unseen name.
    t.server.mock("GET", "/patch/patchlist_prologue.txt")
        .with_status(200)
        .with_body(format!("a.bin.pat\t4\t{MD5_ABCD}\nb.bin.pat\t0\t{MD5_EMPTY}\n"))
        .create();
    t.server.mock("GET", "/patch/patchlist_reboot.txt")
        .with_status(200)
        .with_body(format!("a.bin.pat\t10\t{MD5_DIGITS}\n"))
        .create();
    t.server.mock("GET", "/patch/launcherlist.txt")
        .with_status(200)
        .with_body(format!("a.bin.pat\t4\t{MD5_ABCD}\nl.bin.pat\t4\t{MD5_ABCD}\n"))
        .create();

    t.mock_file("a.bin.pat", b"0123456789");
    t.mock_file("b.bin.pat", b"");
    t.mock_file("l.bin.pat", b"abcd");

    t.sync.set_selection(Selection::FullDataset);
    let summary = t.sync.sync(()).unwrap();

    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 0);

    let bin_dir = t.bin_dir();
    assert_eq!(fs::read(bin_dir.join("a.bin")).unwrap(), b"0123456789");
    assert_eq!(fs::read(bin_dir.join("b.bin")).unwrap(), b"");
    assert_eq!(fs::read(bin_dir.join("l.bin")).unwrap(), b"abcd");

}

#[test]
fn rescan_is_idempotent() {

    let mut t = TestSync::new();
    t.mock_management(10);
    t.mock_launcherlist(&[
        ("a.bin.pat", 4, MD5_ABCD),
        ("c.bin.pat", 10, MD5_DIGITS),
    ]);
    let a_mock = t.server.mock("GET", "/patch/a.bin.pat")
        .with_status(200)
        .with_body(b"abcd")
        .expect(1)
        .create();
    let c_mock = t.server.mock("GET", "/patch/c.bin.pat")
        .with_status(200)
        .with_body(b"0123456789")
        .expect(1)
        .create();

    let summary = t.sync.sync(()).unwrap();
    assert_eq!(summary.succeeded, 2);

    // Second pass over an unchanged tree: the cache vouches for both files, so
    // nothing is hashed again and nothing is downloaded.
    t.sync.set_policy(Policy { trust_cache: true, ..Policy::default() });

    let mut handler = RecordingHandler::default();
    let summary = t.sync.sync(&mut handler).unwrap();

    assert_eq!(summary, Default::default());
    assert_eq!(handler.started, None);
    assert_eq!(handler.completed, Some((true, 0, 0, 0)));

    a_mock.assert();
    c_mock.assert();

}
