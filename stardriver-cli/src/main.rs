//! Command line front-end for the StarDriver synchronizer.

mod format;

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{self, ExitCode};

use clap::{Parser, ValueEnum};

use tracing_subscriber::EnvFilter;

use stardriver::manifest::Selection;
use stardriver::scan::Policy;
use stardriver::sync::{Event, Handler, Synchronizer};

use crate::format::BytesFmt;


/// Exit code when some files could not be downloaded.
const EXIT_PARTIAL: u8 = 2;

/// Exit code when the run was cancelled, the conventional 128 + SIGINT.
const EXIT_CANCELLED: u8 = 130;


/// Synchronize the PSO2 game client files from the official patch servers.
///
/// The game tree under the install directory is scanned against the remote
/// manifest, then every missing or mismatched file is downloaded, verified and
/// installed atomically. Re-running after a partial failure only fetches the
/// unfinished files.
#[derive(Debug, Parser)]
#[command(name = "stardriver", version)]
struct CliArgs {
    /// Directory the game is installed under, containing (or receiving) the
    /// PHANTASYSTARONLINE2_JP directory.
    install_dir: PathBuf,
    /// URL of the management document declaring the patch server base URLs.
    #[arg(long)]
    management_url: Option<String>,
    /// Which part of the dataset to synchronize.
    #[arg(long, value_enum, default_value_t = CliSelection::Full)]
    selection: CliSelection,
    /// Only download files that are absent, never inspect present ones.
    #[arg(long)]
    missing_only: bool,
    /// Don't hash present files, only compare their sizes.
    #[arg(long)]
    no_digest: bool,
    /// Skip hashing files the digest cache vouches for.
    #[arg(long)]
    trust_cache: bool,
    /// Rehash every present file, ignoring the digest cache.
    #[arg(long)]
    force_rehash: bool,
    /// Download from the backup base URLs declared by the server.
    #[arg(long)]
    use_backup: bool,
    /// Increase the log verbosity, repeatable.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliSelection {
    /// Prologue, reboot and launcher files.
    Full,
    /// Reboot and launcher files.
    Main,
    /// Launcher files only.
    Launcher,
}

impl From<CliSelection> for Selection {
    fn from(value: CliSelection) -> Self {
        match value {
            CliSelection::Full => Self::FullDataset,
            CliSelection::Main => Self::MainOnly,
            CliSelection::Launcher => Self::LauncherOnly,
        }
    }
}

fn main() -> ExitCode {

    let args = CliArgs::parse();

    let default_filter = match args.verbose {
        0 => "warn",
        1 => "stardriver=info,stardriver_cli=info",
        _ => "debug",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(io::stderr)
        .init();

    let mut policy = Policy::default();
    policy.missing_only = args.missing_only;
    policy.compare_digest = !args.no_digest;
    policy.trust_cache = args.trust_cache;
    policy.force_rehash = args.force_rehash;

    let mut sync = Synchronizer::new(&args.install_dir);
    sync.set_selection(args.selection.into());
    sync.set_policy(policy);
    sync.set_use_backup(args.use_backup);

    if let Some(url) = &args.management_url {
        sync.set_management_url(url);
    }

    // One Ctrl-C requests a clean cancellation, a second one gives up waiting
    // for the workers to unwind.
    let cancel = sync.cancellation();
    ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            process::exit(EXIT_CANCELLED as i32);
        }
        eprintln!("cancelling, press Ctrl-C again to exit immediately...");
        cancel.cancel();
    }).unwrap();

    let summary = match sync.sync(CliHandler::default()) {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if summary.cancelled != 0 {
        ExitCode::from(EXIT_CANCELLED)
    } else if summary.failed != 0 {
        ExitCode::from(EXIT_PARTIAL)
    } else {
        ExitCode::SUCCESS
    }

}

/// The handler printing the synchronization progress to the standard output.
/// Transient progress stays on one line, each verified file gets its own.
#[derive(Debug, Default)]
struct CliHandler {
    /// Length of the last transient line, to blank it before overwriting.
    transient_len: usize,
}

impl CliHandler {

    fn transient(&mut self, line: &str) {
        let blank = self.transient_len.saturating_sub(line.chars().count());
        print!("\r{line}{:blank$}", "");
        self.transient_len = line.chars().count();
        let _ = io::stdout().flush();
    }

    fn persistent(&mut self, line: &str) {
        let blank = self.transient_len;
        println!("\r{line}{:blank$}", "");
        self.transient_len = 0;
    }

}

impl Handler for CliHandler {

    fn on_event(&mut self, event: Event) {
        match event {
            Event::LoadedRoot { root } => {
                tracing::info!("patch base: {}", root.patch_url);
                tracing::info!("master base: {}", root.master_url);
            }
            Event::LoadedManifest { count } => {
                self.persistent(&format!("manifest: {count} files"));
            }
            Event::ScanProgress { scanned, total } => {
                self.transient(&format!("scanning... {scanned}/{total}"));
            }
            Event::DownloadStarted { total } => {
                self.persistent(&format!("downloading {total} files"));
            }
            Event::DownloadProgress { rel_path, bytes_done, bytes_total, .. } => {
                self.transient(&format!(
                    "{rel_path}: {}/{}",
                    BytesFmt(bytes_done), BytesFmt(bytes_total),
                ));
            }
            Event::FileVerified { rel_path, ok, .. } => {
                if ok {
                    self.persistent(&format!("ok     {rel_path}"));
                } else {
                    self.persistent(&format!("failed {rel_path}"));
                }
            }
            Event::DownloadCompleted { ok, succeeded, failed, cancelled } => {
                self.persistent(&format!(
                    "done: {succeeded} succeeded, {failed} failed, {cancelled} cancelled",
                ));
                if !ok && cancelled == 0 {
                    self.persistent("re-run to retry the failed files");
                }
            }
            _ => {}
        }
    }

}
