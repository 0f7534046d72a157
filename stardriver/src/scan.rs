//! Parallel stat/hash walker over the manifest, deciding which entries need to
//! be downloaded according to a scan policy.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use tokio::task::JoinSet;

use crate::cache::DigestCache;
use crate::manifest::Entry;


/// Chunk size for streaming local files into the digest.
const HASH_CHUNK_SIZE: usize = 80 * 1024;

/// How many entries are checked between two progress notifications.
const PROGRESS_INTERVAL: usize = 100;


/// The scan policy: a set of independent flags deciding how hard the scanner
/// looks at files that are already present. The default compares both size and
/// digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Only download files that are absent, never inspect present ones.
    pub missing_only: bool,
    /// Download files whose size differs from the manifest.
    pub compare_size: bool,
    /// Download files whose MD5 differs from the manifest.
    pub compare_digest: bool,
    /// Rehash every present file, ignoring the digest cache.
    pub force_rehash: bool,
    /// Skip files the digest cache vouches for (size and mtime unchanged since
    /// the last verification).
    pub trust_cache: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            missing_only: false,
            compare_size: true,
            compare_digest: true,
            force_rehash: false,
            trust_cache: false,
        }
    }
}

impl Policy {

    /// The policy that only fills holes, used for the quick-check flow.
    pub fn missing_only() -> Self {
        Self {
            missing_only: true,
            compare_size: false,
            compare_digest: false,
            force_rehash: false,
            trust_cache: false,
        }
    }

}


/// Resolve the absolute destination path of a manifest relative path under the
/// given directory.
pub(crate) fn dest_path(bin_dir: &Path, rel_path: &str) -> PathBuf {
    let mut path = bin_dir.to_path_buf();
    path.extend(rel_path.split(['/', '\\']).filter(|part| !part.is_empty()));
    path
}

/// Concurrency ceiling for local file checks, twice the CPU count. Also caps
/// the runtime's blocking pool, which is what actually carries the hashing.
pub(crate) fn hash_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(4) * 2
}

/// Scan the manifest against the local tree and return the download set, in
/// unspecified order. Entries are checked in parallel with a concurrency
/// ceiling of twice the CPU count; hashing happens on the blocking pool. The
/// progress callback is invoked every few entries and once at completion with
/// `(scanned, total)`.
pub(crate) async fn scan(
    manifest: Vec<Entry>,
    bin_dir: &Path,
    policy: Policy,
    cache: Arc<DigestCache>,
    mut progress: impl FnMut(usize, usize),
) -> Vec<Entry> {

    let total = manifest.len();
    let concurrency = hash_concurrency();

    let manifest = Arc::new(manifest);

    let mut futures = JoinSet::new();
    let mut index = 0;
    let mut scanned = 0;
    let mut download_set = Vec::new();

    progress(0, total);

    while scanned < total {

        while futures.len() < concurrency && index < manifest.len() {
            let manifest = Arc::clone(&manifest);
            let cache = Arc::clone(&cache);
            let dest = dest_path(bin_dir, manifest[index].rel_path());
            futures.spawn(async move {
                let entry = &manifest[index];
                (index, scan_entry(entry, &dest, policy, &cache).await)
            });
            index += 1;
        }

        let Some(joined) = futures.join_next().await else { break };

        let (entry_index, needed) = match joined {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("scan task failed: {e}");
                scanned += 1;
                continue;
            }
        };

        if needed {
            download_set.push(manifest[entry_index].clone());
        }

        scanned += 1;
        if scanned % PROGRESS_INTERVAL == 0 {
            progress(scanned, total);
        }

    }

    progress(total, total);
    download_set

}

/// Decide whether one entry needs to be downloaded. Any failure to stat or hash
/// the present file forces a download.
async fn scan_entry(entry: &Entry, dest: &Path, policy: Policy, cache: &DigestCache) -> bool {

    let meta = match tokio::fs::metadata(dest).await {
        Ok(meta) => meta,
        // Absent, or not statable, either way we want a fresh copy.
        Err(_) => return true,
    };

    if policy.missing_only {
        return false;
    }

    let size = meta.len();
    let mtime = meta.modified().ok().map(DateTime::<Utc>::from);

    if policy.trust_cache && !policy.force_rehash {
        if let Some(mtime) = mtime {
            if cache.is_fresh(entry.rel_path(), mtime, size) {
                return false;
            }
        }
    }

    if policy.compare_size && size != entry.size() {
        return true;
    }

    if policy.compare_digest || policy.force_rehash {

        let digest = {
            let dest = dest.to_path_buf();
            tokio::task::spawn_blocking(move || hash_file(&dest)).await
        };

        let digest = match digest {
            Ok(Ok(digest)) => digest,
            Ok(Err(e)) => {
                tracing::warn!("failed to hash {}: {e}", dest.display());
                return true;
            }
            Err(e) => {
                tracing::warn!("hashing task failed for {}: {e}", dest.display());
                return true;
            }
        };

        if let Some(mtime) = mtime {
            cache.record(entry.rel_path(), digest.clone(), size, mtime);
        }

        return !digest.eq_ignore_ascii_case(entry.md5());

    }

    false

}

/// Stream a local file into an MD5 digest, returned as lowercase hex.
fn hash_file(path: &Path) -> std::io::Result<String> {

    let mut file = std::fs::File::open(path)?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        context.consume(&buf[..read]);
    }

    Ok(format!("{:x}", context.compute()))

}


#[cfg(test)]
mod tests {

    use super::*;

    use std::fs;

    fn entry(name: &str, size: u64, md5: &str) -> Entry {
        Entry::parse(&format!("{name}\t{size}\t{md5}"), false).unwrap()
    }

    fn run_scan(manifest: Vec<Entry>, bin_dir: &Path, policy: Policy, cache: Arc<DigestCache>) -> Vec<Entry> {
        crate::sync::block_on(scan(manifest, bin_dir, policy, cache, |_, _| ()))
    }

    const ABCD_MD5: &str = "e2fc714c4727ee9395f324cd2e7f331f";

    #[test]
    fn missing_file_is_downloaded() {

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DigestCache::new(dir.path().join("cache.json")));

        let manifest = vec![entry("absent.bin.pat", 4, ABCD_MD5)];
        let set = run_scan(manifest, dir.path(), Policy::default(), cache);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].rel_path(), "absent.bin");

    }

    #[test]
    fn matching_file_is_skipped_and_cached() {

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("present.bin"), b"abcd").unwrap();
        let cache = Arc::new(DigestCache::new(dir.path().join("cache.json")));

        let manifest = vec![entry("present.bin.pat", 4, ABCD_MD5)];
        let set = run_scan(manifest, dir.path(), Policy::default(), Arc::clone(&cache));
        assert!(set.is_empty());

        // Hashing recorded the digest for the next pass.
        let cached = cache.lookup("present.bin").unwrap();
        assert_eq!(cached.digest, ABCD_MD5);
        assert_eq!(cached.size, 4);

    }

    #[test]
    fn size_mismatch_short_circuits() {

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("short.bin"), b"ab").unwrap();
        let cache = Arc::new(DigestCache::new(dir.path().join("cache.json")));

        let manifest = vec![entry("short.bin.pat", 4, ABCD_MD5)];
        let set = run_scan(manifest, dir.path(), Policy::default(), Arc::clone(&cache));
        assert_eq!(set.len(), 1);

        // The digest was never computed.
        assert!(cache.lookup("short.bin").is_none());

    }

    #[test]
    fn digest_mismatch_is_downloaded() {

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("wrong.bin"), b"dcba").unwrap();
        let cache = Arc::new(DigestCache::new(dir.path().join("cache.json")));

        let manifest = vec![entry("wrong.bin.pat", 4, ABCD_MD5)];
        let set = run_scan(manifest, dir.path(), Policy::default(), cache);
        assert_eq!(set.len(), 1);

    }

    #[test]
    fn missing_only_ignores_present_files() {

        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("present.bin"), b"totally wrong content").unwrap();
        let cache = Arc::new(DigestCache::new(dir.path().join("cache.json")));

        let manifest = vec![
            entry("present.bin.pat", 4, ABCD_MD5),
            entry("absent.bin.pat", 4, ABCD_MD5),
        ];
        let set = run_scan(manifest, dir.path(), Policy::missing_only(), cache);
        assert_eq!(set.len(), 1);
        assert_eq!(set[0].rel_path(), "absent.bin");

    }

    #[test]
    fn trust_cache_skips_fresh_files() {

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("stale.bin");
        // Content doesn't match the manifest digest, only the cache vouches.
        fs::write(&file, b"dcba").unwrap();

        let meta = fs::metadata(&file).unwrap();
        let mtime = DateTime::<Utc>::from(meta.modified().unwrap());

        let cache = Arc::new(DigestCache::new(dir.path().join("cache.json")));
        cache.record("stale.bin", ABCD_MD5, meta.len(), mtime);

        let policy = Policy { trust_cache: true, ..Policy::default() };
        let manifest = vec![entry("stale.bin.pat", 4, ABCD_MD5)];
        let set = run_scan(manifest.clone(), dir.path(), policy, Arc::clone(&cache));
        assert!(set.is_empty());

        // Force-rehash wins over the cache and finds the mismatch.
        let policy = Policy { trust_cache: true, force_rehash: true, ..Policy::default() };
        let set = run_scan(manifest, dir.path(), policy, cache);
        assert_eq!(set.len(), 1);

    }

    #[test]
    fn dest_path_splits_separators() {
        let base = Path::new("/root");
        assert_eq!(dest_path(base, "data/win32/file.ice"), Path::new("/root/data/win32/file.ice"));
        assert_eq!(dest_path(base, "data\\win32\\file.ice"), Path::new("/root/data/win32/file.ice"));
    }

}
