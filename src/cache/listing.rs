//! Folder Listing Cache
//!
//! Short-lived cache of remote `/children` responses keyed by normalized
//! folder path. Bounded by entry count with LRU eviction. A snapshot is only
//! returned while `now - fetched_at < ttl`; failed listings are cached too so
//! a failing backend is not queried on every page view.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tracing::{debug, trace};

use crate::clock::unix_now;
use crate::graph::Entry;

/// Result of listing one remote folder
#[derive(Debug, Clone)]
pub struct ListingSnapshot {
    /// Normalized folder path
    pub path: String,
    pub entries: Vec<Entry>,
    /// Epoch seconds when the listing was fetched
    pub fetched_at: i64,
    /// User-visible failure message, entries are empty when set
    pub error: Option<String>,
}

impl ListingSnapshot {
    pub fn ok(path: &str, entries: Vec<Entry>, fetched_at: i64) -> Self {
        Self {
            path: normalize_path(path),
            entries,
            fetched_at,
            error: None,
        }
    }

    pub fn failed(path: &str, message: impl Into<String>, fetched_at: i64) -> Self {
        Self {
            path: normalize_path(path),
            entries: Vec::new(),
            fetched_at,
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Find a non-folder entry by name
    pub fn file(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| !e.is_folder && e.name == name)
    }
}

/// Normalize a folder path to `/a/b/` form (root is `/`)
pub fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len() + 2);
    normalized.push('/');
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        normalized.push_str(segment);
        normalized.push('/');
    }
    normalized
}

/// TTL-checked cache of folder listings
pub struct ListingCache {
    cache: Cache<String, Arc<ListingSnapshot>>,
    ttl_secs: i64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ListingCache {
    /// Create a cache holding at most `max_entries` listings for `ttl`
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .eviction_policy(EvictionPolicy::lru())
            .time_to_live(ttl)
            .name("listing_cache")
            .build();

        Self {
            cache,
            ttl_secs: ttl.as_secs() as i64,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a listing that is still within its TTL
    pub fn get(&self, path: &str) -> Option<Arc<ListingSnapshot>> {
        self.get_at(path, unix_now())
    }

    fn get_at(&self, path: &str, now: i64) -> Option<Arc<ListingSnapshot>> {
        let key = normalize_path(path);
        match self.cache.get(&key) {
            Some(snapshot) if now - snapshot.fetched_at < self.ttl_secs => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(path = %key, entries = snapshot.entries.len(), "Cache HIT for listing");
                Some(snapshot)
            }
            Some(_) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(path = %key, "Cache STALE for listing");
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(path = %key, "Cache MISS for listing");
                None
            }
        }
    }

    /// Store a snapshot, superseding any previous one for the same path
    pub fn put(&self, snapshot: ListingSnapshot) -> Arc<ListingSnapshot> {
        let snapshot = Arc::new(snapshot);
        debug!(
            path = %snapshot.path,
            entries = snapshot.entries.len(),
            error = snapshot.error.as_deref().unwrap_or(""),
            "Cached listing"
        );
        self.cache.insert(snapshot.path.clone(), Arc::clone(&snapshot));
        snapshot
    }

    /// Drop the listing for one path
    pub fn invalidate(&self, path: &str) {
        self.cache.invalidate(&normalize_path(path));
    }

    /// Drop every listing, e.g. after the account credentials changed
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    /// Hit/miss counters and the current entry count
    ///
    /// Returns (hits, misses, entries)
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.cache.entry_count(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, is_folder: bool) -> Entry {
        Entry {
            name: name.to_string(),
            size: 10,
            created_at: "2020-01-01T00:00:00Z".to_string(),
            modified_at: "2020-01-02T00:00:00Z".to_string(),
            download_url: format!("https://dl.example/{}", name),
            is_folder,
            child_count: is_folder.then_some(0),
        }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("docs"), "/docs/");
        assert_eq!(normalize_path("/docs//2020/"), "/docs/2020/");
        assert_eq!(normalize_path("//a/b"), "/a/b/");
    }

    #[test]
    fn test_ttl_boundary() {
        let cache = ListingCache::new(32, Duration::from_secs(10));
        cache.put(ListingSnapshot::ok("/docs/", vec![entry("a.txt", false)], 1_000));

        assert!(cache.get_at("/docs/", 1_000).is_some());
        assert!(cache.get_at("docs", 1_009).is_some());
        assert!(cache.get_at("/docs/", 1_010).is_none());
        assert!(cache.get_at("/docs/", 5_000).is_none());

        let (hits, misses, _) = cache.stats();
        assert_eq!(hits, 2);
        assert_eq!(misses, 2);
    }

    #[test]
    fn test_superseded_snapshot() {
        let cache = ListingCache::new(32, Duration::from_secs(10));
        let now = unix_now();
        let first = cache.put(ListingSnapshot::ok("/", vec![entry("a", false)], now));
        cache.put(ListingSnapshot::ok("/", vec![entry("b", false)], now));

        // The old Arc is untouched
        assert_eq!(first.entries[0].name, "a");
        assert_eq!(cache.get("/").unwrap().entries[0].name, "b");
    }

    #[test]
    fn test_error_snapshot_cached() {
        let cache = ListingCache::new(32, Duration::from_secs(10));
        cache.put(ListingSnapshot::failed("/broken", "backend down", unix_now()));

        let snapshot = cache.get("/broken/").unwrap();
        assert!(snapshot.is_error());
        assert_eq!(snapshot.error.as_deref(), Some("backend down"));
        assert!(snapshot.entries.is_empty());
    }

    #[test]
    fn test_lru_entry_bound() {
        let cache = ListingCache::new(2, Duration::from_secs(60));
        let now = unix_now();
        cache.put(ListingSnapshot::ok("/a", vec![], now));
        cache.put(ListingSnapshot::ok("/b", vec![], now));
        cache.cache.run_pending_tasks();

        assert!(cache.get("/a").is_some());
        cache.cache.run_pending_tasks();

        cache.put(ListingSnapshot::ok("/c", vec![], now));
        cache.cache.run_pending_tasks();

        assert!(cache.get("/a").is_some());
        assert!(cache.get("/b").is_none());
        assert!(cache.get("/c").is_some());
    }

    #[test]
    fn test_file_lookup_skips_folders() {
        let snapshot = ListingSnapshot::ok(
            "/",
            vec![entry("same", true), entry("same", false), entry("other", false)],
            0,
        );
        assert!(!snapshot.file("same").unwrap().is_folder);
        assert!(snapshot.file("missing").is_none());
    }

    #[test]
    fn test_invalidate() {
        let cache = ListingCache::new(32, Duration::from_secs(10));
        cache.put(ListingSnapshot::ok("/x", vec![], unix_now()));
        cache.invalidate("/x/");
        assert!(cache.get("/x").is_none());
    }
}
