//! Retrieval and parsing of the patch manifest: the root descriptor, the three
//! manifest sub-lists and the per-file byte streams.

use std::time::Duration;

use indexmap::IndexMap;

use reqwest::header::HOST;
use reqwest::{RequestBuilder, Response, StatusCode};


/// Default URL of the root descriptor on the production patch server.
pub const DEFAULT_MANAGEMENT_URL: &str = "http://patch01.pso2gs.net/patch_prod/patches/management_beta.txt";

/// Name of the sub-list covering the prologue dataset.
pub const PATCHLIST_PROLOGUE: &str = "patchlist_prologue.txt";

/// Name of the sub-list covering the reboot dataset, taking precedence over the
/// prologue list for names present in both.
pub const PATCHLIST_REBOOT: &str = "patchlist_reboot.txt";

/// Name of the sub-list covering the launcher files, only adding names that no
/// other list provided.
pub const LAUNCHERLIST: &str = "launcherlist.txt";

/// The suffix every manifest name carries, stripped to form the relative path of
/// the file on disk.
pub const PATCH_SUFFIX: &str = ".pat";

/// Pause between two manifest sub-list requests, for politeness.
const LIST_FETCH_PAUSE: Duration = Duration::from_millis(500);

/// Default request timeout, used until the root descriptor advises another one.
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30000);

/// How many times a manifest document fetch is attempted before giving up.
/// Forbidden responses are never retried.
const DOCUMENT_ATTEMPTS: u32 = 3;


/// The root descriptor, parsed from the management document: the base URLs files
/// are downloaded from and a few advisory tuning parameters.
#[derive(Debug, Clone)]
pub struct RootDescriptor {
    /// Base URL for patch-channel files, also serving the manifest sub-lists.
    pub patch_url: String,
    /// Base URL for master-channel files.
    pub master_url: String,
    /// Fallback base URL for patch-channel files, if declared.
    pub backup_patch_url: Option<String>,
    /// Fallback base URL for master-channel files, if declared.
    pub backup_master_url: Option<String>,
    /// Advisory worker thread count.
    pub thread_num: u32,
    /// Advisory parallel thread count.
    pub parallel_thread_num: u32,
    /// Advisory retry count for a single file.
    pub retry_num: u32,
    /// Advisory request timeout.
    pub timeout: Duration,
}

impl RootDescriptor {

    /// Parse the root descriptor from its line-oriented `key=value` document.
    /// Unknown keys are ignored, missing numeric keys get defaults, but missing
    /// base URLs are an error because nothing can be downloaded without them.
    pub fn parse(document: &str) -> Result<Self> {

        let mut patch_url = None;
        let mut master_url = None;
        let mut backup_patch_url = None;
        let mut backup_master_url = None;
        let mut thread_num = 1u32;
        let mut parallel_thread_num = 1u32;
        let mut retry_num = 10u32;
        let mut timeout_ms = 30000u64;

        for line in document.lines() {

            let Some((key, value)) = line.split_once('=') else { continue };
            let (key, value) = (key.trim(), value.trim());
            if value.is_empty() {
                continue;
            }

            match key {
                "PatchURL" => patch_url = Some(value.to_string()),
                "MasterURL" => master_url = Some(value.to_string()),
                "BackupPatchURL" => backup_patch_url = Some(value.to_string()),
                "BackupMasterURL" => backup_master_url = Some(value.to_string()),
                "ThreadNum" => parse_num(&mut thread_num, key, value),
                "ParallelThreadNum" => parse_num(&mut parallel_thread_num, key, value),
                "RetryNum" => parse_num(&mut retry_num, key, value),
                "TimeOut" => parse_num(&mut timeout_ms, key, value),
                _ => continue,
            }

        }

        Ok(Self {
            patch_url: patch_url.ok_or(Error::MissingField { field: "PatchURL" })?,
            master_url: master_url.ok_or(Error::MissingField { field: "MasterURL" })?,
            backup_patch_url,
            backup_master_url,
            thread_num,
            parallel_thread_num,
            retry_num,
            timeout: Duration::from_millis(timeout_ms),
        })

    }

    /// Compute the download URL for the given entry, choosing the base URL from
    /// the entry's channel and whether the backup host should be used. A missing
    /// backup URL falls back to the primary one.
    pub fn file_url(&self, entry: &Entry, use_backup: bool) -> String {
        let base = match (entry.channel(), use_backup) {
            (Channel::Master, false) => self.master_url.as_str(),
            (Channel::Master, true) => self.backup_master_url.as_deref().unwrap_or(&self.master_url),
            (_, false) => self.patch_url.as_str(),
            (_, true) => self.backup_patch_url.as_deref().unwrap_or(&self.patch_url),
        };
        join_url(base, entry.name())
    }

}

/// Parse a numeric `key=value` field into `dst`, keeping the default and logging
/// when the value is not a valid number.
fn parse_num<T: std::str::FromStr>(dst: &mut T, key: &str, value: &str) {
    match value.parse::<T>() {
        Ok(num) => *dst = num,
        Err(_) => tracing::warn!("ignoring non-numeric {key}={value} in root descriptor"),
    }
}

/// Join a base URL and a file name with exactly one slash in between.
fn join_url(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name.trim_start_matches('/'))
}


/// The base-URL family a manifest entry must be fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// The row didn't carry a channel marker, fetched from the patch base like
    /// the manifest documents themselves.
    Unknown,
    Patch,
    Master,
}

/// One row of a manifest sub-list: a file the client must possess, with its
/// expected length and MD5 digest. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Raw manifest name, keeping the trailing suffix.
    name: Box<str>,
    /// Relative path of the file on disk, suffix stripped.
    rel_path: Box<str>,
    /// Lowercased relative path, the identity of this entry.
    key: Box<str>,
    /// Expected size of the file, in bytes.
    size: u64,
    /// Expected MD5 digest, lowercase hex.
    md5: Box<str>,
    channel: Channel,
    reboot: bool,
}

impl Entry {

    /// Parse a single TAB-separated manifest row, in one of the two accepted
    /// shapes: `<name>\t<size>\t<md5>` or `<name>\t<md5>\t<size>\t<channel>`.
    /// Returns `None` for rows matching neither.
    pub fn parse(line: &str, reboot: bool) -> Option<Self> {

        let fields = line.split('\t').collect::<Vec<_>>();

        let (name, size, md5, channel) = match fields[..] {
            [name, size, md5] => {
                (name, size.parse::<u64>().ok()?, md5, Channel::Unknown)
            }
            [name, md5, size, channel] => {
                let channel = match channel {
                    "p" => Channel::Patch,
                    _ => Channel::Master,
                };
                (name, size.parse::<u64>().ok()?, md5, channel)
            }
            _ => return None,
        };

        if name.is_empty() || md5.len() != 32 || !md5.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }

        let rel_path = name.strip_suffix(PATCH_SUFFIX).unwrap_or(name);

        Some(Self {
            name: name.into(),
            rel_path: rel_path.into(),
            key: rel_path.to_ascii_lowercase().into(),
            size,
            md5: md5.to_ascii_lowercase().into(),
            channel,
            reboot,
        })

    }

    /// The raw manifest name, with its trailing suffix, as used in URLs.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The relative path of the file on disk, suffix stripped.
    #[inline]
    pub fn rel_path(&self) -> &str {
        &self.rel_path
    }

    /// The normalized (lowercased) relative path used as this entry's identity,
    /// also the key of the digest cache.
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Expected size of the file, in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Expected MD5 digest, lowercase hex.
    #[inline]
    pub fn md5(&self) -> &str {
        &self.md5
    }

    #[inline]
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// True if the entry belongs to the reboot dataset, informational only.
    #[inline]
    pub fn reboot(&self) -> bool {
        self.reboot
    }

}

/// Two entries are the same file iff their normalized relative paths match.
impl PartialEq for Entry {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Entry {}

impl std::hash::Hash for Entry {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

/// Parse a whole manifest sub-list body, skipping blank and unparseable rows.
/// A bad row never aborts the list.
pub fn parse_list(body: &str, reboot: bool) -> Vec<Entry> {
    let mut entries = Vec::new();
    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        match Entry::parse(line, reboot) {
            Some(entry) => entries.push(entry),
            None => tracing::warn!("skipping unparseable manifest row: {line:?}"),
        }
    }
    entries
}


/// Which combination of the three manifest sub-lists forms the dataset to
/// synchronize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Selection {
    /// Prologue, reboot and launcher lists.
    #[default]
    FullDataset,
    /// Reboot and launcher lists.
    MainOnly,
    /// Launcher list alone.
    LauncherOnly,
}

impl Selection {

    /// The sub-lists to union, in precedence order. Each item carries the list
    /// name, whether its entries are tagged as reboot dataset, and whether the
    /// list only adds names not already provided by an earlier list.
    fn lists(self) -> &'static [(&'static str, bool, bool)] {
        match self {
            Self::FullDataset => &[
                (PATCHLIST_PROLOGUE, false, false),
                (PATCHLIST_REBOOT, true, false),
                (LAUNCHERLIST, false, true),
            ],
            Self::MainOnly => &[
                (PATCHLIST_REBOOT, true, false),
                (LAUNCHERLIST, false, true),
            ],
            Self::LauncherOnly => &[
                (LAUNCHERLIST, false, false),
            ],
        }
    }

}

/// Union a sequence of (entries, additive) lists into a manifest de-duplicated
/// on the normalized relative path. Non-additive lists override earlier entries
/// for the same path, additive lists only fill holes.
fn union_lists(lists: Vec<(Vec<Entry>, bool)>) -> Vec<Entry> {

    let mut union = IndexMap::new();

    for (entries, additive) in lists {
        for entry in entries {
            let key = entry.key.clone();
            if additive {
                union.entry(key).or_insert(entry);
            } else {
                union.insert(key, entry);
            }
        }
    }

    union.into_values().collect()

}


/// The manifest client: fetches the root descriptor and the manifest sub-lists,
/// and opens byte streams for individual files. Cheap to clone, all clones share
/// the same connection pool.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    timeout: Duration,
}

impl Client {

    /// Create a new client with the default request timeout.
    pub fn new() -> Result<Self> {
        let http = crate::http::builder()
            .build()
            .map_err(|e| Error::new_reqwest(e, "build http client"))?;
        Ok(Self {
            http,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Set the per-request timeout, typically the advisory one from the root
    /// descriptor.
    #[inline]
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    /// Build a GET request with the timeout and the explicit Host header.
    fn get(&self, url: &str) -> RequestBuilder {

        let mut req = self.http.get(url).timeout(self.timeout);

        // The patch servers expect an explicit Host header, including the port
        // when it is not the scheme default.
        if let Ok(parsed) = reqwest::Url::parse(url) {
            if let Some(host) = parsed.host_str() {
                let host = match parsed.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                };
                req = req.header(HOST, host);
            }
        }

        req

    }

    /// Fetch a manifest document as text, retrying transient failures with a
    /// status-dependent backoff. A Forbidden response aborts immediately.
    async fn fetch_text(&self, url: &str) -> Result<String> {

        let mut last_error = None;

        for attempt in 0..DOCUMENT_ATTEMPTS {

            if attempt > 0 {
                let backoff = match &last_error {
                    Some(Error::Status { status, .. }) if *status >= 500 => Duration::from_secs(1),
                    Some(Error::Status { .. }) => Duration::from_secs(2),
                    _ => Duration::from_secs(1),
                };
                tokio::time::sleep(backoff).await;
            }

            match self.fetch_text_once(url).await {
                Ok(text) => return Ok(text),
                Err(e @ Error::Forbidden { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!("manifest fetch attempt {attempt} failed: {e}");
                    last_error = Some(e);
                }
            }

        }

        Err(last_error.unwrap())

    }

    async fn fetch_text_once(&self, url: &str) -> Result<String> {

        let resp = self.get(url).send().await
            .map_err(|e| Error::new_reqwest(e, url.to_string()))?;

        match resp.status() {
            StatusCode::FORBIDDEN => return Err(Error::Forbidden { url: url.to_string() }),
            status if !status.is_success() => {
                return Err(Error::Status { status: status.as_u16(), url: url.to_string() });
            }
            _ => {}
        }

        resp.text().await
            .map_err(|e| Error::new_reqwest(e, url.to_string()))

    }

    /// Fetch and parse the root descriptor from the given management URL.
    pub async fn fetch_root(&self, management_url: &str) -> Result<RootDescriptor> {
        let document = self.fetch_text(management_url).await?;
        RootDescriptor::parse(&document)
    }

    /// Fetch and parse one manifest sub-list from the patch base URL.
    pub async fn fetch_list(&self, root: &RootDescriptor, name: &str, reboot: bool) -> Result<Vec<Entry>> {
        let url = join_url(&root.patch_url, name);
        let body = self.fetch_text(&url).await?;
        Ok(parse_list(&body, reboot))
    }

    /// Fetch the manifest union for the given selection, de-duplicated on the
    /// normalized relative path. Sub-list requests are spaced out a little.
    pub async fn fetch_manifest(&self, root: &RootDescriptor, selection: Selection) -> Result<Vec<Entry>> {

        let mut lists = Vec::new();

        for (i, &(name, reboot, additive)) in selection.lists().iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(LIST_FETCH_PAUSE).await;
            }
            let entries = self.fetch_list(root, name, reboot).await?;
            lists.push((entries, additive));
        }

        Ok(union_lists(lists))

    }

    /// Open a byte stream for the given entry. The status is intentionally not
    /// checked here, the download pipeline classifies it itself.
    pub async fn open_stream(&self, root: &RootDescriptor, entry: &Entry, use_backup: bool) -> reqwest::Result<Response> {
        let url = root.file_url(entry, use_backup);
        self.get(&url).send().await
    }

}


/// The manifest could not be retrieved or is unusable.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The root descriptor is missing a required field.
    #[error("manifest parse: missing required field {field}")]
    MissingField {
        field: &'static str,
    },
    /// The server answered 403 Forbidden for a manifest document. The patch
    /// servers do this for requests originating outside the supported regions.
    #[error("403 Forbidden: {url} (the server refused the request, the service may not be available in your region)")]
    Forbidden {
        url: String,
    },
    /// Any other non-success status for a manifest document.
    #[error("unexpected status {status}: {url}")]
    Status {
        status: u16,
        url: String,
    },
    /// A generic error that originates from internal or third-party
    /// dependencies, associated to an origin string that helps locating the
    /// issue.
    #[error("internal: {error} @ {origin}")]
    Internal {
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
        origin: Box<str>,
    },
}

/// Type alias for a result with the manifest error type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {

    #[inline]
    pub(crate) fn new_reqwest(error: reqwest::Error, origin: impl Into<Box<str>>) -> Self {
        Self::Internal { error: Box::new(error), origin: origin.into() }
    }

}
