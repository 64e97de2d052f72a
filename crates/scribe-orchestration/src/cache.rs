//! Capacity-bounded TTL cache with content-addressed keys.
//!
//! Keys are SHA-256 hex digests of the content being memoized (raw audio
//! bytes, or the JSON of text plus options), so the same input maps to the
//! same entry no matter where it came from. Entries expire after their TTL
//! and the least-recently-accessed entry is evicted when a new key would
//! exceed `max_size`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use scribe_settings::CacheSettings;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

const DEFAULT_MAX_SIZE: usize = 100;
const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
/// Characters of the key kept in [`CacheEntrySummary::key`].
const SUMMARY_KEY_LEN: usize = 16;

struct CacheEntry<T> {
    data: T,
    timestamp: Instant,
    ttl: Duration,
    access_count: u64,
    last_accessed: Instant,
    /// Monotonic access sequence, breaks `last_accessed` ties.
    touch: u64,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl.is_zero() || now.duration_since(self.timestamp) > self.ttl
    }
}

struct CacheState<T> {
    entries: HashMap<String, CacheEntry<T>>,
    touch_seq: u64,
}

impl<T> CacheState<T> {
    fn next_touch(&mut self) -> u64 {
        self.touch_seq += 1;
        self.touch_seq
    }

    fn remove_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }

    fn evict_least_recent(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| (e.last_accessed, e.touch))
            .map(|(k, _)| k.clone());
        if let Some(key) = victim {
            debug!(key = %truncate_key(&key), "evicting least recently accessed entry");
            drop(self.entries.remove(&key));
        }
    }
}

/// Generic memoization cache shared across jobs.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct CacheManager<T> {
    state: Mutex<CacheState<T>>,
    max_size: usize,
    default_ttl: Duration,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone> CacheManager<T> {
    /// Create a cache holding at most `max_size` entries.
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                touch_seq: 0,
            }),
            max_size: max_size.max(1),
            default_ttl,
            cleanup_task: Mutex::new(None),
        }
    }

    /// Create a cache from [`CacheSettings`]. Does not start the sweep timer.
    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(settings.max_size, settings.default_ttl())
    }

    /// Look up a live entry, counting the access.
    ///
    /// An expired entry is removed and reported as absent.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        let mut state = self.state.lock();

        if state.entries.get(key)?.is_expired(now) {
            drop(state.entries.remove(key));
            trace!(key = %truncate_key(key), "cache entry expired");
            return None;
        }

        let touch = state.next_touch();
        let entry = state.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_accessed = now;
        entry.touch = touch;
        Some(entry.data.clone())
    }

    /// Store `data` under `key`, using the default TTL when `ttl` is `None`.
    ///
    /// Updating an existing key counts as an access and never evicts.
    /// Inserting a new key into a full cache first drops expired entries,
    /// then the least-recently-accessed one if still full.
    pub fn set(&self, key: impl Into<String>, data: T, ttl: Option<Duration>) {
        let key = key.into();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let now = Instant::now();
        let mut state = self.state.lock();
        let touch = state.next_touch();

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.data = data;
            entry.timestamp = now;
            entry.ttl = ttl;
            entry.access_count += 1;
            entry.last_accessed = now;
            entry.touch = touch;
            return;
        }

        if state.entries.len() >= self.max_size {
            let _ = state.remove_expired(now);
            while state.entries.len() >= self.max_size {
                state.evict_least_recent();
            }
        }

        drop(state.entries.insert(
            key,
            CacheEntry {
                data,
                timestamp: now,
                ttl,
                access_count: 1,
                last_accessed: now,
                touch,
            },
        ));
    }

    /// Whether a live entry exists. Same side effects as [`get`](Self::get).
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

impl<T> CacheManager<T> {
    /// Remove one entry. Returns whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.state.lock().entries.remove(key).is_some()
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    /// Stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// TTL applied when `set` gets `None`.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let removed = self.state.lock().remove_expired(Instant::now());
        if removed > 0 {
            debug!(removed, "cache cleanup removed expired entries");
        }
        removed
    }

    /// Snapshot of size, reuse, and per-entry summaries.
    ///
    /// `hit_rate` is the mean `access_count` across entries, an
    /// approximation of reuse rather than a hit/miss ratio.
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let state = self.state.lock();
        let size = state.entries.len();
        let total_accesses: u64 = state.entries.values().map(|e| e.access_count).sum();

        let mut entries: Vec<CacheEntrySummary> = state
            .entries
            .iter()
            .map(|(key, e)| CacheEntrySummary {
                key: truncate_key(key),
                access_count: e.access_count,
                age_ms: now.duration_since(e.timestamp).as_millis() as u64,
                ttl_ms: e.ttl.as_millis() as u64,
            })
            .collect();
        entries.sort_by(|a, b| b.access_count.cmp(&a.access_count).then_with(|| a.key.cmp(&b.key)));

        CacheStats {
            size,
            max_size: self.max_size,
            hit_rate: if size == 0 {
                0.0
            } else {
                total_accesses as f64 / size as f64
            },
            entries,
        }
    }

    /// Stop the sweep timer and drop all entries.
    ///
    /// Owners call this on teardown; dropping the cache also stops the timer.
    pub fn destroy(&self) {
        if let Some(task) = self.cleanup_task.lock().take() {
            task.abort();
        }
        self.clear();
    }

    /// Whether a sweep timer is running.
    pub fn has_cleanup_task(&self) -> bool {
        self.cleanup_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl<T: Send + 'static> CacheManager<T> {
    /// Spawn a periodic [`cleanup`](Self::cleanup) on the current tokio runtime.
    ///
    /// The task holds a `Weak` reference and exits once the cache is dropped.
    /// Replaces any previously started task.
    pub fn start_cleanup_task(self: &Arc<Self>, interval: Duration) {
        let cache = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            let _ = ticker.tick().await;
            loop {
                let _ = ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let _ = cache.cleanup();
            }
        });

        if let Some(previous) = self.cleanup_task.lock().replace(task) {
            previous.abort();
        }
    }
}

impl<T: Clone> Default for CacheManager<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE, DEFAULT_TTL)
    }
}

impl<T> Drop for CacheManager<T> {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Cache statistics.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Entries stored.
    pub size: usize,
    /// Capacity.
    pub max_size: usize,
    /// Mean access count per entry.
    pub hit_rate: f64,
    /// Entry summaries, most accessed first.
    pub entries: Vec<CacheEntrySummary>,
}

/// Per-entry view in [`CacheStats`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntrySummary {
    /// Key prefix followed by `...`.
    pub key: String,
    /// Reads plus writes.
    pub access_count: u64,
    /// Time since the value was stored.
    pub age_ms: u64,
    /// Entry TTL.
    pub ttl_ms: u64,
}

// ── Key derivation ──────────────────────────────────────────────────────────

/// SHA-256 of `bytes` as 64 lowercase hex characters.
pub fn key_for_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Key for a file's full byte content, independent of its path.
pub async fn generate_file_key(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(key_for_bytes(&bytes))
}

#[derive(Serialize)]
struct ContentKeyInput<'a> {
    content: &'a str,
    options: serde_json::Value,
}

/// Key for `content` combined with the options it is processed with.
///
/// Options are normalized through `serde_json::Value` first, so map
/// ordering in the caller's type never changes the key.
pub fn generate_content_key<O: Serialize + ?Sized>(
    content: &str,
    options: &O,
) -> serde_json::Result<String> {
    let input = ContentKeyInput {
        content,
        options: serde_json::to_value(options)?,
    };
    Ok(key_for_bytes(&serde_json::to_vec(&input)?))
}

fn truncate_key(key: &str) -> String {
    match key.char_indices().nth(SUMMARY_KEY_LEN) {
        Some((idx, _)) => format!("{}...", &key[..idx]),
        None => key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(max_size: usize) -> CacheManager<String> {
        CacheManager::new(max_size, Duration::from_secs(60))
    }

    async fn fill(cache: &CacheManager<String>, n: usize) {
        for i in 0..n {
            cache.set(format!("key{i}"), format!("value{i}"), None);
            tokio::time::advance(Duration::from_millis(1)).await;
        }
    }

    #[test]
    fn huge_capacity_allocates_lazily() {
        let cache = cache(usize::MAX);
        assert_eq!(cache.max_size(), usize::MAX);
        cache.set("k", "v".to_string(), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn set_then_get_round_trip() {
        let cache = cache(10);
        cache.set("k", "v".to_string(), None);
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        assert!(cache.get("missing").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let cache = cache(10);
        cache.set("k", "v".to_string(), Some(Duration::from_millis(50)));
        assert!(cache.has("k"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.get("k").is_none());
        assert_eq!(cache.len(), 0, "expired entry is removed on read");
    }

    #[tokio::test(start_paused = true)]
    async fn entry_alive_until_ttl_passes() {
        let cache = cache(10);
        cache.set("k", "v".to_string(), Some(Duration::from_millis(50)));
        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(cache.has("k"));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!cache.has("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ttl_expires_on_next_read() {
        let cache = cache(10);
        cache.set("k", "v".to_string(), Some(Duration::ZERO));
        assert!(cache.get("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_evicts_least_recently_accessed() {
        let cache = cache(5);
        fill(&cache, 5).await;

        cache.set("key5", "value5".to_string(), None);
        assert_eq!(cache.len(), 5);
        assert!(!cache.has("key0"));
        assert_eq!(cache.get("key5").as_deref(), Some("value5"));
    }

    #[tokio::test(start_paused = true)]
    async fn recent_access_protects_entry_from_eviction() {
        let cache = cache(5);
        fill(&cache, 5).await;

        assert!(cache.get("key0").is_some());
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.set("key5", "value5".to_string(), None);

        assert_eq!(cache.len(), 5);
        assert!(cache.has("key0"));
        assert!(!cache.has("key1"));
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_ties_break_by_access_order() {
        // Paused clock: every entry shares the same instant
        let cache = cache(3);
        cache.set("a", "1".to_string(), None);
        cache.set("b", "2".to_string(), None);
        cache.set("c", "3".to_string(), None);
        assert!(cache.get("a").is_some());

        cache.set("d", "4".to_string(), None);
        assert!(cache.has("a"));
        assert!(!cache.has("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn update_in_place_never_evicts() {
        let cache = cache(5);
        fill(&cache, 5).await;

        cache.set("key2", "updated".to_string(), None);
        assert_eq!(cache.len(), 5);
        for i in 0..5 {
            assert!(cache.has(&format!("key{i}")), "key{i} should survive");
        }
        assert_eq!(cache.get("key2").as_deref(), Some("updated"));
    }

    #[tokio::test(start_paused = true)]
    async fn update_refreshes_timestamp_and_ttl() {
        let cache = cache(5);
        cache.set("k", "v1".to_string(), Some(Duration::from_millis(50)));
        tokio::time::advance(Duration::from_millis(40)).await;
        cache.set("k", "v2".to_string(), Some(Duration::from_millis(50)));
        tokio::time::advance(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k").as_deref(), Some("v2"));
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_prefers_dropping_expired_entries() {
        let cache = cache(3);
        cache.set("short", "s".to_string(), Some(Duration::from_millis(10)));
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.set("a", "1".to_string(), None);
        cache.set("b", "2".to_string(), None);
        assert!(cache.get("short").is_some());

        tokio::time::advance(Duration::from_millis(20)).await;
        cache.set("c", "3".to_string(), None);
        assert!(cache.has("a"));
        assert!(cache.has("b"));
        assert!(cache.has("c"));
    }

    #[test]
    fn access_count_tracks_reads_and_writes() {
        let cache = cache(5);
        cache.set("k", "v".to_string(), None);
        let _ = cache.get("k");
        let _ = cache.get("k");
        cache.set("k", "v2".to_string(), None);

        let stats = cache.stats();
        assert_eq!(stats.entries[0].access_count, 4);
    }

    #[test]
    fn delete_and_clear() {
        let cache = cache(5);
        cache.set("a", "1".to_string(), None);
        cache.set("b", "2".to_string(), None);
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn stats_report_mean_access_and_sorted_entries() {
        let cache = cache(5);
        cache.set("aaaaaaaaaaaaaaaaaaaaaaaa", "1".to_string(), None);
        cache.set("b", "2".to_string(), None);
        for _ in 0..3 {
            let _ = cache.get("b");
        }

        let stats = cache.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.max_size, 5);
        assert!((stats.hit_rate - 2.5).abs() < f64::EPSILON);
        assert_eq!(stats.entries[0].key, "b");
        assert_eq!(stats.entries[0].access_count, 4);
        assert_eq!(stats.entries[1].key, "aaaaaaaaaaaaaaaa...");
    }

    #[test]
    fn stats_on_empty_cache() {
        let stats = cache(5).stats();
        assert_eq!(stats.size, 0);
        assert!(stats.hit_rate.abs() < f64::EPSILON);
        assert!(stats.entries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_cleanup_removes_only_expired() {
        let cache = cache(5);
        cache.set("short", "s".to_string(), Some(Duration::from_millis(10)));
        cache.set("long", "l".to_string(), Some(Duration::from_secs(10)));
        tokio::time::advance(Duration::from_millis(20)).await;

        assert_eq!(cache.cleanup(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.has("long"));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_sweeps_expired_entries() {
        let cache = Arc::new(cache(5));
        cache.start_cleanup_task(Duration::from_millis(100));
        assert!(cache.has_cleanup_task());

        cache.set("k", "v".to_string(), Some(Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_stops_timer_and_clears() {
        let cache = Arc::new(cache(5));
        cache.start_cleanup_task(Duration::from_millis(100));
        cache.set("k", "v".to_string(), None);

        cache.destroy();
        tokio::task::yield_now().await;
        assert!(cache.is_empty());
        assert!(!cache.has_cleanup_task());

        cache.set("k", "v".to_string(), Some(Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(cache.len(), 1, "no sweep after destroy");
    }

    #[test]
    fn from_settings_uses_configured_capacity() {
        let cache: CacheManager<String> = CacheManager::from_settings(&CacheSettings {
            max_size: 7,
            default_ttl_ms: 1234,
            cleanup_interval_ms: 0,
        });
        assert_eq!(cache.max_size(), 7);
        assert_eq!(cache.default_ttl(), Duration::from_millis(1234));
    }

    // ── keys ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn file_key_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.webm");
        std::fs::write(&path, b"audio bytes").unwrap();

        let k1 = generate_file_key(&path).await.unwrap();
        let k2 = generate_file_key(&path).await.unwrap();
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 64);
        assert!(k1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[tokio::test]
    async fn file_key_depends_on_content_not_path() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.webm");
        let b = dir.path().join("b.webm");
        let c = dir.path().join("c.webm");
        std::fs::write(&a, b"first").unwrap();
        std::fs::write(&b, b"second").unwrap();
        std::fs::write(&c, b"first").unwrap();

        let ka = generate_file_key(&a).await.unwrap();
        assert_ne!(ka, generate_file_key(&b).await.unwrap());
        assert_eq!(ka, generate_file_key(&c).await.unwrap());
    }

    #[tokio::test]
    async fn file_key_missing_file_is_error() {
        let err = generate_file_key(Path::new("/nonexistent/audio.webm"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn content_key_changes_with_options() {
        let k1 = generate_content_key("same text", &json!({"temperature": 0.5})).unwrap();
        let k2 = generate_content_key("same text", &json!({"temperature": 0.7})).unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn content_key_equal_for_equal_inputs() {
        let mut a = std::collections::HashMap::new();
        let _ = a.insert("style", "notes");
        let _ = a.insert("language", "en");
        let mut b = std::collections::HashMap::new();
        let _ = b.insert("language", "en");
        let _ = b.insert("style", "notes");

        assert_eq!(
            generate_content_key("text", &a).unwrap(),
            generate_content_key("text", &b).unwrap()
        );
        assert_ne!(
            generate_content_key("text", &a).unwrap(),
            generate_content_key("other", &a).unwrap()
        );
    }

    #[test]
    fn key_for_bytes_matches_known_digest() {
        assert_eq!(
            key_for_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
