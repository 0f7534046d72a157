//! The persistent file-digest cache, speeding up rescans by letting unchanged
//! files skip rehashing. The cache is best-effort: a lost or corrupt document
//! only costs one full rehash pass, never a wrong skip.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use dashmap::DashMap;

use serde::{Deserialize, Serialize};


/// Name of the cache document, stored next to the synchronized files.
pub const CACHE_FILE_NAME: &str = "StarDriver.cache.json";


/// One cached digest: what the file hashed to, and the size and mtime it had
/// when hashed. A cache entry is only ever written after a verification, so a
/// matching size and mtime means the digest is still good.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// MD5 of the file, lowercase hex.
    pub digest: String,
    /// Size of the file when hashed, in bytes.
    pub size: u64,
    /// Last-modified timestamp of the file when hashed.
    pub mtime: DateTime<Utc>,
}

/// The digest cache: a concurrently mutable in-memory table persisted as a
/// single JSON document. Readers may observe entries the current run has just
/// written, but never a torn document.
#[derive(Debug)]
pub struct DigestCache {
    file: PathBuf,
    entries: DashMap<String, CacheEntry>,
    dirty: AtomicBool,
}

impl DigestCache {

    /// Create an empty cache persisting at the given file.
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            entries: DashMap::new(),
            dirty: AtomicBool::new(false),
        }
    }

    /// The file this cache persists at.
    #[inline]
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Number of entries currently in the table.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load the cache document from disk. An absent file is not an error, and a
    /// corrupt document is discarded with a warning: the cache then just starts
    /// empty.
    pub async fn load(&self) {

        let text = match tokio::fs::read_to_string(&self.file).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!("failed to read digest cache {}: {e}", self.file.display());
                return;
            }
        };

        let mut de = serde_json::Deserializer::from_str(&text);
        let table: BTreeMap<String, CacheEntry> = match serde_path_to_error::deserialize(&mut de) {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!("discarding corrupt digest cache {}: {e}", self.file.display());
                return;
            }
        };

        for (key, entry) in table {
            self.entries.insert(normalize_key(&key), entry);
        }

    }

    /// Look up the entry for the given relative path, if any.
    pub fn lookup(&self, rel_path: &str) -> Option<CacheEntry> {
        self.entries.get(&normalize_key(rel_path)).map(|entry| entry.clone())
    }

    /// True iff an entry exists for the given relative path whose recorded size
    /// and mtime match the given ones exactly.
    pub fn is_fresh(&self, rel_path: &str, mtime: DateTime<Utc>, size: u64) -> bool {
        self.entries.get(&normalize_key(rel_path))
            .map(|entry| entry.size == size && entry.mtime == mtime)
            .unwrap_or(false)
    }

    /// Insert or overwrite the entry for the given relative path, marking the
    /// cache dirty.
    pub fn record(&self, rel_path: &str, digest: impl Into<String>, size: u64, mtime: DateTime<Utc>) {
        self.entries.insert(normalize_key(rel_path), CacheEntry {
            digest: digest.into(),
            size,
            mtime,
        });
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Write the cache document to disk if dirty, creating the parent directory
    /// if missing. I/O errors are logged and swallowed, losing the cache is
    /// tolerated.
    pub async fn flush(&self) {

        if !self.dirty.swap(false, Ordering::Relaxed) {
            return;
        }

        // Snapshot into an ordered map so the document is stable and consistent
        // even if workers keep recording meanwhile.
        let snapshot = self.entries.iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect::<BTreeMap<_, _>>();

        let text = match serde_json::to_string_pretty(&snapshot) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("failed to serialize digest cache: {e}");
                return;
            }
        };

        if let Some(parent) = self.file.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!("failed to create digest cache directory {}: {e}", parent.display());
                return;
            }
        }

        if let Err(e) = tokio::fs::write(&self.file, text).await {
            // Leave the dirty bit set again so a later flush can retry.
            self.dirty.store(true, Ordering::Relaxed);
            tracing::warn!("failed to write digest cache {}: {e}", self.file.display());
        }

    }

}

/// Normalize a relative path into a cache key: lowercase, forward slashes.
fn normalize_key(rel_path: &str) -> String {
    rel_path.replace('\\', "/").to_ascii_lowercase()
}
