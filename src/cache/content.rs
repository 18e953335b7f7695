//! Local Content Cache
//!
//! Keeps downloaded files on local disk, bounded by total byte weight with
//! LRU eviction. The index and the files are reclaimed separately: an
//! evicted key disappears from the index right away, while the file itself
//! is deleted by a reaper task no earlier than a grace period later, so a
//! response that is already streaming it is not cut short.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::layout;

/// Default delay between index eviction and file deletion
pub const DEFAULT_GRACE: Duration = Duration::from_secs(1);

/// Index record for one cached file
#[derive(Debug)]
struct ContentEntry {
    /// Size in bytes
    weight: u64,
    /// Number of cache hits served
    hits: AtomicU64,
}

/// Public view of an index record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    pub key: PathBuf,
    pub weight: u64,
    pub hits: u64,
}

/// An evicted key waiting for its file to be deleted
struct Evicted {
    key: PathBuf,
    at: Instant,
}

/// A download being written next to its final cache path
pub struct PendingFile {
    key: PathBuf,
    file: tokio::fs::File,
    temp: TempPath,
    written: u64,
}

impl PendingFile {
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn key(&self) -> &Path {
        &self.key
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }
}

/// Weight-bounded disk cache index
pub struct ContentCache {
    /// Root directory for cached files
    root: PathBuf,
    index: Cache<PathBuf, Arc<ContentEntry>>,
    budget: u64,
}

/// Bytes per weigher unit for a budget
///
/// The weigher returns `u32`, so large budgets are counted in coarser units.
/// Sizes round up, which keeps resident bytes at or below the budget.
fn weight_unit(budget: u64) -> u64 {
    budget.div_ceil(u64::from(u32::MAX)).max(1)
}

fn weigh(bytes: u64, unit: u64) -> u32 {
    bytes.div_ceil(unit).try_into().unwrap_or(u32::MAX)
}

impl ContentCache {
    /// Open the cache rooted at `root` with a `budget` in bytes
    ///
    /// Stale partial downloads are removed and files left by a previous run
    /// are indexed again, oldest first. Must be called inside a tokio runtime.
    pub fn open(root: PathBuf, budget: u64, grace: Duration) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create cache directory: {:?}", root))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let unit = weight_unit(budget);
        let index = Cache::builder()
            .max_capacity(budget / unit)
            .eviction_policy(EvictionPolicy::lru())
            .weigher(move |_key: &PathBuf, entry: &Arc<ContentEntry>| -> u32 {
                weigh(entry.weight, unit)
            })
            .eviction_listener(move |key: Arc<PathBuf>, _entry, cause: RemovalCause| {
                if cause.was_evicted() {
                    // Unbounded send never blocks the evicting caller
                    let _ = tx.send(Evicted {
                        key: (*key).clone(),
                        at: Instant::now(),
                    });
                }
            })
            .name("content_cache")
            .build();

        tokio::spawn(reap(rx, index.clone(), grace));

        let cache = Self {
            root,
            index,
            budget,
        };
        let restored = cache.restore();

        info!(
            cache_dir = %cache.root.display(),
            budget_mb = budget / (1024 * 1024),
            restored = restored,
            "Content cache initialized"
        );

        Ok(cache)
    }

    /// Cache path for a file at `logical_path` named `name`
    pub fn key_for(&self, logical_path: &str, name: &str) -> PathBuf {
        layout::content_path(&self.root, logical_path, name)
    }

    /// Record a hit; returns whether the key is indexed
    pub fn touch(&self, key: &Path) -> bool {
        match self.index.get(key) {
            Some(entry) => {
                entry.hits.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &Path) -> bool {
        self.index.contains_key(key)
    }

    /// Register a new file or add weight to an indexed one
    ///
    /// Eviction runs before this returns, so the budget only ever holds at
    /// entry granularity.
    pub fn add_weight(&self, key: &Path, is_new: bool, size: u64) {
        let entry = match self.index.get(key) {
            Some(existing) if !is_new => ContentEntry {
                weight: existing.weight.saturating_add(size),
                hits: AtomicU64::new(existing.hits.load(Ordering::Relaxed)),
            },
            _ => ContentEntry {
                weight: size,
                hits: AtomicU64::new(0),
            },
        };
        debug!(key = %key.display(), weight = entry.weight, "Indexed cached file");

        self.index.insert(key.to_path_buf(), Arc::new(entry));
        self.index.run_pending_tasks();
    }

    /// Drop a key whose file turned out to be unusable
    pub fn invalidate(&self, key: &Path) {
        self.index.invalidate(key);
        debug!(key = %key.display(), "Invalidated cached file");
    }

    /// Total indexed size in bytes
    pub fn weighted_size(&self) -> u64 {
        self.index.run_pending_tasks();
        self.index.iter().map(|(_, entry)| entry.weight).sum()
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    /// Snapshot of the index, most hit first
    pub fn entries(&self) -> Vec<CachedFile> {
        let mut entries: Vec<CachedFile> = self
            .index
            .iter()
            .map(|(key, entry)| CachedFile {
                key: (*key).clone(),
                weight: entry.weight,
                hits: entry.hits.load(Ordering::Relaxed),
            })
            .collect();
        entries.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.key.cmp(&b.key)));
        entries
    }

    /// Start writing a download destined for `key`
    pub async fn begin_write(&self, key: &Path) -> io::Result<PendingFile> {
        let parent = key
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "cache key has no parent"))?;
        tokio::fs::create_dir_all(parent).await?;

        let (file, temp) = tempfile::Builder::new()
            .prefix(layout::TEMP_PREFIX)
            .tempfile_in(parent)?
            .into_parts();

        Ok(PendingFile {
            key: key.to_path_buf(),
            file: tokio::fs::File::from_std(file),
            temp,
            written: 0,
        })
    }

    /// Publish a finished download and index it
    ///
    /// Fails without touching the index if a file already exists at the key.
    pub async fn commit(&self, mut pending: PendingFile) -> io::Result<u64> {
        pending.file.flush().await?;
        pending.file.sync_all().await?;
        drop(pending.file);

        pending
            .temp
            .persist_noclobber(&pending.key)
            .map_err(|e| e.error)?;

        self.add_weight(&pending.key, true, pending.written);
        Ok(pending.written)
    }

    /// Remove partial files and re-index complete ones
    fn restore(&self) -> usize {
        let mut found: Vec<(SystemTime, PathBuf, u64)> = Vec::new();

        for shard in read_dirs(&self.root) {
            for leaf in read_dirs(&shard) {
                let Ok(read_dir) = fs::read_dir(&leaf) else {
                    continue;
                };
                for entry in read_dir.flatten() {
                    let path = entry.path();
                    if layout::is_temp_file(&path) {
                        debug!(path = %path.display(), "Removing stale temp file");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if let Ok(metadata) = entry.metadata() {
                        if metadata.is_file() {
                            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                            found.push((modified, path, metadata.len()));
                        }
                    }
                }
            }
        }

        found.sort_by(|a, b| a.0.cmp(&b.0));
        let restored = found.len();
        for (_, path, size) in found {
            self.add_weight(&path, true, size);
        }
        restored
    }
}

fn read_dirs(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(read_dir) => read_dir
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Delete evicted files once their grace period has passed
async fn reap(
    mut rx: mpsc::UnboundedReceiver<Evicted>,
    index: Cache<PathBuf, Arc<ContentEntry>>,
    grace: Duration,
) {
    while let Some(evicted) = rx.recv().await {
        tokio::time::sleep_until(tokio::time::Instant::from_std(evicted.at + grace)).await;

        if index.contains_key(&evicted.key) {
            debug!(key = %evicted.key.display(), "Evicted file re-indexed, keeping it");
            continue;
        }

        match tokio::fs::remove_file(&evicted.key).await {
            Ok(()) => debug!(key = %evicted.key.display(), "Deleted evicted file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(key = %evicted.key.display(), error = %e, "Failed to delete evicted file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    const GRACE: Duration = Duration::from_millis(200);

    fn open(dir: &Path, budget: u64) -> ContentCache {
        ContentCache::open(dir.join("cache"), budget, GRACE).unwrap()
    }

    fn put(cache: &ContentCache, name: &str, size: usize) -> PathBuf {
        let key = cache.key_for(&format!("/{}", name), name);
        fs::create_dir_all(key.parent().unwrap()).unwrap();
        fs::write(&key, vec![b'x'; size]).unwrap();
        cache.add_weight(&key, true, size as u64);
        key
    }

    async fn past_grace() {
        tokio::time::sleep(GRACE * 2).await;
    }

    #[tokio::test]
    async fn test_lru_eviction_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 100);

        let a = put(&cache, "a", 40);
        let b = put(&cache, "b", 40);
        let c = put(&cache, "c", 40);

        assert!(!cache.contains(&a));
        assert!(cache.contains(&b));
        assert!(cache.contains(&c));
        assert_eq!(cache.weighted_size(), 80);

        // Index removal is immediate, deletion is not
        assert!(a.exists());
        tokio::time::sleep(GRACE / 2).await;
        assert!(a.exists());
        past_grace().await;
        assert!(!a.exists());
        assert!(b.exists());
        assert!(c.exists());
    }

    #[tokio::test]
    async fn test_touch_refreshes_recency() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 100);

        let a = put(&cache, "a", 40);
        let b = put(&cache, "b", 40);
        assert!(cache.touch(&a));
        let c = put(&cache, "c", 40);

        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
        assert!(!cache.touch(&b));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_open_reader_survives_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 100);

        let a = put(&cache, "a", 60);
        let mut reader = fs::File::open(&a).unwrap();
        put(&cache, "b", 60);
        assert!(!cache.contains(&a));

        past_grace().await;
        assert!(!a.exists());

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf.len(), 60);
    }

    #[tokio::test]
    async fn test_reindexed_file_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 100);

        let a = put(&cache, "a", 60);
        let b = put(&cache, "b", 60);
        assert!(!cache.contains(&a));

        cache.invalidate(&b);
        cache.add_weight(&a, true, 60);
        past_grace().await;
        assert!(a.exists());
        assert!(cache.contains(&a));
    }

    #[tokio::test]
    async fn test_weight_bound() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1000);

        for (i, size) in [300usize, 500, 120, 900, 10, 640, 333, 999, 1, 450]
            .into_iter()
            .enumerate()
        {
            put(&cache, &format!("f{}", i), size);
            assert!(cache.weighted_size() <= cache.budget());
        }
    }

    #[tokio::test]
    async fn test_weight_bound_above_u32_sizes() {
        const GIB: u64 = 1 << 30;
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 20 * GIB);

        for i in 0..5 {
            let key = cache.key_for(&format!("/movie{}.mkv", i), &format!("movie{}.mkv", i));
            cache.add_weight(&key, true, 8 * GIB);
            assert!(cache.weighted_size() <= cache.budget());
        }
        assert_eq!(cache.entries().len(), 2);
        assert_eq!(cache.weighted_size(), 16 * GIB);
    }

    #[test]
    fn test_weight_unit_rounds_up() {
        assert_eq!(weight_unit(0), 1);
        assert_eq!(weight_unit(100), 1);
        assert_eq!(weight_unit(u64::from(u32::MAX)), 1);
        assert_eq!(weight_unit(u64::from(u32::MAX) + 1), 2);
        assert_eq!(weigh(5, 2), 3);
        assert_eq!(weigh(u64::MAX, 1), u32::MAX);
    }

    #[tokio::test]
    async fn test_add_weight_accumulates_and_keeps_hits() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1000);

        let a = put(&cache, "a", 10);
        cache.touch(&a);
        cache.touch(&a);
        cache.add_weight(&a, false, 15);

        assert_eq!(
            cache.entries(),
            vec![CachedFile {
                key: a.clone(),
                weight: 25,
                hits: 2
            }]
        );

        cache.add_weight(&a, true, 5);
        assert_eq!(cache.entries()[0].weight, 5);
        assert_eq!(cache.entries()[0].hits, 0);
    }

    #[tokio::test]
    async fn test_explicit_invalidate_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1000);

        let a = put(&cache, "a", 10);
        cache.invalidate(&a);
        past_grace().await;
        assert!(!cache.contains(&a));
        assert!(a.exists());
    }

    #[tokio::test]
    async fn test_commit_publishes_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1000);
        let key = cache.key_for("/docs/notes.txt", "notes.txt");

        let mut pending = cache.begin_write(&key).await.unwrap();
        pending.write(b"hello ").await.unwrap();
        pending.write(b"world").await.unwrap();
        assert!(!key.exists());

        assert_eq!(cache.commit(pending).await.unwrap(), 11);
        assert_eq!(fs::read(&key).unwrap(), b"hello world");
        assert!(cache.touch(&key));
        assert_eq!(cache.weighted_size(), 11);
    }

    #[tokio::test]
    async fn test_commit_never_clobbers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1000);
        let key = cache.key_for("/a.bin", "a.bin");
        fs::create_dir_all(key.parent().unwrap()).unwrap();
        fs::write(&key, b"original").unwrap();

        let mut pending = cache.begin_write(&key).await.unwrap();
        pending.write(b"replacement").await.unwrap();
        let err = cache.commit(pending).await.unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read(&key).unwrap(), b"original");
        assert!(!cache.contains(&key));
        let leftovers = fs::read_dir(key.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn test_abandoned_write_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1000);
        let key = cache.key_for("/big.iso", "big.iso");

        let mut pending = cache.begin_write(&key).await.unwrap();
        pending.write(&[0u8; 128]).await.unwrap();
        drop(pending);

        assert!(!key.exists());
        assert_eq!(fs::read_dir(key.parent().unwrap()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_restore_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = {
            let cache = open(dir.path(), 1000);
            (put(&cache, "a", 10), put(&cache, "b", 20))
        };
        let stale = a.parent().unwrap().join(".tmpPartial");
        fs::write(&stale, b"partial").unwrap();

        let cache = open(dir.path(), 1000);
        assert!(cache.contains(&a));
        assert!(cache.contains(&b));
        assert_eq!(cache.weighted_size(), 30);
        assert!(!stale.exists());
    }
}
