//! The Map Engine
//!
//! [`BigMap`] is the public face of the store. It owns an array of
//! [`Segment`]s sharing one [`EntryAllocator`], routes every operation by the
//! hash of its key, and optionally drives a background purge sweeper.
//!
//! ## Routing
//!
//! ```text
//!                 hash_key(key) : u64
//!   ┌──────────── high bits ────────────┬──── low bits ────┐
//!   │          segment index            │   bucket index   │
//!   └───────────────────────────────────┴──────────────────┘
//! ```
//!
//! Segments are selected by the high bits of the hash and buckets inside a
//! segment by the low bits, so growing one segment's bucket array never
//! moves a key into another segment.
//!
//! ## Lifecycle
//!
//! 1. `open`: validate the configuration, map the page directory, re-index
//!    every live slot found on disk (or wipe the directory) and start the
//!    sweeper
//! 2. Operations: each runs under exactly one segment lock
//! 3. `close`: flush, unmap every page, stop the sweeper. Any later
//!    operation returns [`Error::Closed`]

use crate::config::{duration_to_ttl_ms, BigMapConfig};
use crate::error::{Error, Result};
use crate::page::MappedPageFactory;
use crate::storage::allocator::{AllocatorStats, EntryAllocator};
use crate::storage::expiry::PurgeSweeper;
use crate::storage::segment::{Segment, SegmentGuard};
use bytes::Bytes;
use parking_lot::Mutex;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Hashes a key the same way on every run, so recovered slots land in the
/// segment and bucket a fresh insert of the same key would use.
#[inline]
pub fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// State shared between the map handle and the purge sweeper.
#[derive(Debug)]
pub(crate) struct MapCore {
    segments: Vec<Segment>,
    segment_shift: u32,
    segment_mask: usize,
    allocator: Arc<EntryAllocator>,
    closed: AtomicBool,

    /// Statistics: completed purge sweeps
    purge_count: AtomicU64,

    /// Statistics: entries evicted by purge sweeps
    purged_entries: AtomicU64,

    /// Statistics: total GET operations
    get_count: AtomicU64,

    /// Statistics: total PUT and REPLACE operations
    put_count: AtomicU64,

    /// Statistics: total REMOVE operations
    remove_count: AtomicU64,
}

impl MapCore {
    fn new(segments: Vec<Segment>, allocator: Arc<EntryAllocator>) -> Self {
        let count = segments.len();
        Self {
            segment_shift: 64 - count.trailing_zeros(),
            segment_mask: count - 1,
            segments,
            allocator,
            closed: AtomicBool::new(false),
            purge_count: AtomicU64::new(0),
            purged_entries: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            put_count: AtomicU64::new(0),
            remove_count: AtomicU64::new(0),
        }
    }

    #[inline]
    fn segment_for(&self, hash: u64) -> &Segment {
        let index = hash.checked_shr(self.segment_shift).unwrap_or(0) as usize & self.segment_mask;
        &self.segments[index]
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    /// Locks every segment in index order. Holding the result excludes all
    /// single-key operations and purges.
    fn lock_all(&self) -> Vec<SegmentGuard<'_>> {
        self.segments.iter().map(Segment::lock).collect()
    }

    /// Sweeps every segment, one lock at a time.
    ///
    /// A failing segment is logged and skipped; the first error is returned
    /// after all segments have been visited.
    pub(crate) fn purge(&self) -> Result<usize> {
        self.ensure_open()?;

        let mut purged = 0;
        let mut first_error = None;
        for (index, segment) in self.segments.iter().enumerate() {
            if self.is_closed() {
                break;
            }
            match segment.purge() {
                Ok(n) => purged += n,
                Err(e) => {
                    warn!(segment = index, error = %e, "Failed to purge segment");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.purge_count.fetch_add(1, Ordering::Relaxed);
        self.purged_entries
            .fetch_add(purged as u64, Ordering::Relaxed);

        match first_error {
            Some(e) => Err(e),
            None => Ok(purged),
        }
    }

    /// Re-indexes every live slot the allocator finds on disk.
    fn restore(&self) -> Result<usize> {
        let recovered = self.allocator.recover()?;
        for entry in &recovered {
            let hash = hash_key(&entry.key);
            self.segment_for(hash)
                .restore_in_use_map_entry(entry.index, hash);
        }
        Ok(recovered.len())
    }
}

/// A concurrent byte-keyed hash map whose keys and values live in
/// memory-mapped page files instead of the heap.
///
/// Entries may carry an idle timeout: an entry that is neither read nor
/// written for longer than its TTL is treated as absent and its slot is
/// reclaimed, either when an operation touches it or by a purge sweep.
///
/// # Thread Safety
///
/// All operations take `&self`; wrap the map in an `Arc` to share it between
/// threads.
///
/// # Example
///
/// ```
/// use bigmap::{BigMap, BigMapConfig};
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// let dir = tempfile::tempdir().unwrap();
/// let map = BigMap::open(BigMapConfig::new(dir.path(), "doc").with_page_size(64 * 1024)).unwrap();
///
/// map.put(b"name", b"Ariz").unwrap();
/// assert_eq!(map.get(b"name").unwrap(), Some(Bytes::from("Ariz")));
///
/// // Expires after one minute without access
/// map.put_with_ttl(b"session", b"abc123", Duration::from_secs(60)).unwrap();
/// assert_eq!(map.len(), 2);
/// ```
pub struct BigMap {
    core: Arc<MapCore>,
    sweeper: Mutex<Option<PurgeSweeper>>,
    config: BigMapConfig,
    default_ttl_ms: i64,
}

impl std::fmt::Debug for BigMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigMap")
            .field("dir", &self.config.page_dir())
            .field("segments", &self.core.segments.len())
            .field("len", &self.core.len())
            .field("closed", &self.core.is_closed())
            .finish()
    }
}

impl BigMap {
    /// Opens (or creates) the map described by `config`.
    ///
    /// With `recover` enabled, every record still marked in use in the page
    /// files is indexed again; otherwise existing page files are deleted.
    pub fn open(config: BigMapConfig) -> Result<Self> {
        config.validate()?;

        let page_dir = config.page_dir();
        let pages = Arc::new(MappedPageFactory::new(config.page_size, &page_dir)?);
        if !config.recover && !pages.delete_all_pages()? {
            warn!(dir = %page_dir.display(), "Some existing page files could not be deleted");
        }

        let allocator = Arc::new(EntryAllocator::new(pages));
        let capacity = config.segment_capacity();
        let segments = (0..config.effective_segment_count())
            .map(|_| Segment::new(capacity, config.load_factor, Arc::clone(&allocator)))
            .collect();
        let core = Arc::new(MapCore::new(segments, allocator));

        if config.recover {
            let restored = core.restore()?;
            if restored > 0 {
                info!(entries = restored, dir = %page_dir.display(), "Recovered entries from page files");
            }
        }

        let sweeper = match config.purge_interval {
            Some(interval) => Some(PurgeSweeper::start(Arc::clone(&core), interval)?),
            None => None,
        };

        info!(
            dir = %page_dir.display(),
            segments = core.segments.len(),
            page_size = config.page_size,
            "BigMap opened"
        );

        Ok(Self {
            core,
            sweeper: Mutex::new(sweeper),
            default_ttl_ms: config.default_ttl_ms(),
            config,
        })
    }

    /// The configuration this map was opened with.
    pub fn config(&self) -> &BigMapConfig {
        &self.config
    }

    /// Gets the value of a key.
    ///
    /// Returns `None` if the key doesn't exist or has expired. A hit counts
    /// as an access and restarts the entry's idle timeout.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.core.ensure_open()?;
        self.core.get_count.fetch_add(1, Ordering::Relaxed);
        let hash = hash_key(key);
        self.core.segment_for(hash).get(key, hash)
    }

    /// Returns true if the key exists and has not expired.
    ///
    /// Like [`get`](Self::get), this restarts the idle timeout.
    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        self.core.ensure_open()?;
        let hash = hash_key(key);
        self.core.segment_for(hash).contains_key(key, hash)
    }

    /// Stores a key-value pair with the configured default TTL.
    ///
    /// Returns the previous value, if any.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<Option<Bytes>> {
        self.put_ttl_ms(key, value, self.default_ttl_ms, false)
    }

    /// Stores a key-value pair that expires after `ttl` without access.
    ///
    /// A zero `ttl` never expires.
    pub fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<Option<Bytes>> {
        self.put_ttl_ms(key, value, duration_to_ttl_ms(ttl), false)
    }

    /// Stores a key-value pair only if the key is absent.
    ///
    /// Returns the existing value when there is one, in which case nothing
    /// was written.
    pub fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<Option<Bytes>> {
        self.put_ttl_ms(key, value, self.default_ttl_ms, true)
    }

    fn put_ttl_ms(
        &self,
        key: &[u8],
        value: &[u8],
        ttl_ms: i64,
        only_if_absent: bool,
    ) -> Result<Option<Bytes>> {
        self.core.ensure_open()?;
        self.core.put_count.fetch_add(1, Ordering::Relaxed);
        let hash = hash_key(key);
        self.core
            .segment_for(hash)
            .put(key, hash, value, ttl_ms, only_if_absent)
    }

    /// Removes a key, returning its value if it was present.
    pub fn remove(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.core.ensure_open()?;
        self.core.remove_count.fetch_add(1, Ordering::Relaxed);
        let hash = hash_key(key);
        self.core.segment_for(hash).remove(key, hash, None)
    }

    /// Removes a key only if its current value equals `value`.
    pub fn remove_if_equals(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.core.ensure_open()?;
        self.core.remove_count.fetch_add(1, Ordering::Relaxed);
        let hash = hash_key(key);
        let removed = self.core.segment_for(hash).remove(key, hash, Some(value))?;
        Ok(removed.is_some())
    }

    /// Replaces the value of an existing key, using the default TTL.
    ///
    /// Returns the previous value, or `None` (and writes nothing) if the key
    /// is absent.
    pub fn replace(&self, key: &[u8], value: &[u8]) -> Result<Option<Bytes>> {
        self.replace_ttl_ms(key, value, self.default_ttl_ms)
    }

    /// Replaces the value of an existing key with a new TTL.
    pub fn replace_with_ttl(
        &self,
        key: &[u8],
        value: &[u8],
        ttl: Duration,
    ) -> Result<Option<Bytes>> {
        self.replace_ttl_ms(key, value, duration_to_ttl_ms(ttl))
    }

    fn replace_ttl_ms(&self, key: &[u8], value: &[u8], ttl_ms: i64) -> Result<Option<Bytes>> {
        self.core.ensure_open()?;
        self.core.put_count.fetch_add(1, Ordering::Relaxed);
        let hash = hash_key(key);
        self.core.segment_for(hash).replace(key, hash, value, ttl_ms)
    }

    /// Replaces the value of `key` only if it currently equals `old_value`,
    /// using the default TTL.
    pub fn replace_if_equals(&self, key: &[u8], old_value: &[u8], new_value: &[u8]) -> Result<bool> {
        self.replace_if_equals_ttl_ms(key, old_value, new_value, self.default_ttl_ms)
    }

    /// Like [`replace_if_equals`](Self::replace_if_equals) with a new TTL.
    pub fn replace_if_equals_with_ttl(
        &self,
        key: &[u8],
        old_value: &[u8],
        new_value: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        self.replace_if_equals_ttl_ms(key, old_value, new_value, duration_to_ttl_ms(ttl))
    }

    fn replace_if_equals_ttl_ms(
        &self,
        key: &[u8],
        old_value: &[u8],
        new_value: &[u8],
        ttl_ms: i64,
    ) -> Result<bool> {
        self.core.ensure_open()?;
        self.core.put_count.fetch_add(1, Ordering::Relaxed);
        let hash = hash_key(key);
        self.core
            .segment_for(hash)
            .replace_if_equals(key, hash, old_value, new_value, ttl_ms)
    }

    /// Returns the number of entries.
    ///
    /// Expired entries are counted until an operation or a purge sweep
    /// evicts them.
    pub fn len(&self) -> usize {
        self.core.len()
    }

    /// Returns true if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry and returns its slot to the allocator.
    ///
    /// Page files are kept, so the freed slots are reused by later puts.
    pub fn clear(&self) -> Result<()> {
        self.core.ensure_open()?;

        let mut first_error = None;
        let mut released = 0usize;
        for segment in &self.core.segments {
            let mut guard = segment.lock();
            self.core.ensure_open()?;
            for slot in guard.clear() {
                match self.core.allocator.release(slot) {
                    Ok(()) => released += 1,
                    Err(e) => {
                        warn!(slot = slot, error = %e, "Failed to release slot during clear");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        debug!(released = released, "Map cleared");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drops every entry and deletes all page files.
    ///
    /// Every segment stays locked until the allocator has been reset, so an
    /// entry written concurrently lands either before the wipe (and is
    /// removed) or after it (and survives).
    /// Returns false if some page file could not be deleted.
    pub fn remove_all(&self) -> Result<bool> {
        self.core.ensure_open()?;
        let mut guards = self.core.lock_all();
        self.core.ensure_open()?;

        for guard in &mut guards {
            guard.clear();
        }
        let deleted = self.core.allocator.remove_all();
        drop(guards);
        deleted
    }

    /// Runs a purge sweep now, returning the number of evicted entries.
    pub fn purge(&self) -> Result<usize> {
        self.core.purge()
    }

    /// Number of purge sweeps completed so far, scheduled or manual.
    pub fn purge_count(&self) -> u64 {
        self.core.purge_count.load(Ordering::Relaxed)
    }

    /// Total size in bytes of the page files on disk.
    pub fn back_file_size(&self) -> Result<u64> {
        self.core.allocator.back_file_size()
    }

    /// Snapshot of the slot allocator's statistics.
    pub fn allocator_stats(&self) -> AllocatorStats {
        self.core.allocator.stats()
    }

    /// Returns map statistics.
    pub fn stats(&self) -> MapStats {
        MapStats {
            entries: self.core.len() as u64,
            get_ops: self.core.get_count.load(Ordering::Relaxed),
            put_ops: self.core.put_count.load(Ordering::Relaxed),
            remove_ops: self.core.remove_count.load(Ordering::Relaxed),
            purge_sweeps: self.core.purge_count.load(Ordering::Relaxed),
            purged: self.core.purged_entries.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Flushes and unmaps every page, then stops the purge sweeper.
    ///
    /// Operations already holding a segment lock finish first; any that get
    /// the lock afterwards fail with [`Error::Closed`]. Teardown always
    /// completes; a flush failure is logged and returned afterwards. Closing
    /// twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let flushed = {
            let _guards = self.core.lock_all();
            if self.core.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }

            let pages = self.core.allocator.pages();
            let flushed = pages.flush();
            if let Err(e) = &flushed {
                warn!(error = %e, "Flush on close failed");
            }
            pages.close();
            flushed
        };

        if let Some(mut sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }

        info!(dir = %self.config.page_dir().display(), "BigMap closed");
        flushed
    }
}

impl Drop for BigMap {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Error while closing map on drop");
        }
    }
}

/// Map statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapStats {
    /// Number of entries currently indexed
    pub entries: u64,
    /// Total GET operations
    pub get_ops: u64,
    /// Total PUT and REPLACE operations
    pub put_ops: u64,
    /// Total REMOVE operations
    pub remove_ops: u64,
    /// Completed purge sweeps
    pub purge_sweeps: u64,
    /// Entries evicted by purge sweeps
    pub purged: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::{tempdir, TempDir};

    const PAGE_SIZE: usize = 64 * 1024;

    fn open(name: &str) -> (TempDir, BigMap) {
        let dir = tempdir().unwrap();
        let map = BigMap::open(BigMapConfig::new(dir.path(), name).with_page_size(PAGE_SIZE)).unwrap();
        (dir, map)
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_key(b"key"), hash_key(b"key"));
        assert_ne!(hash_key(b"key"), hash_key(b"other"));
    }

    #[test]
    fn test_put_and_get() {
        let (_dir, map) = open("basic");

        assert_eq!(map.put(b"name", b"Ariz").unwrap(), None);
        assert_eq!(map.get(b"name").unwrap(), Some(Bytes::from("Ariz")));
        assert_eq!(map.get(b"nonexistent").unwrap(), None);
        assert_eq!(map.put(b"name", b"Bob").unwrap(), Some(Bytes::from("Ariz")));
        assert_eq!(map.get(b"name").unwrap(), Some(Bytes::from("Bob")));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_round_trip_binary_and_empty() {
        let (_dir, map) = open("binary");
        let binary: Vec<u8> = (0..=255).collect();

        map.put(b"", b"").unwrap();
        map.put(&binary, &binary).unwrap();
        map.put(b"empty-value", b"").unwrap();

        assert_eq!(map.get(b"").unwrap(), Some(Bytes::new()));
        assert_eq!(map.get(&binary).unwrap().unwrap().as_ref(), binary.as_slice());
        assert_eq!(map.get(b"empty-value").unwrap(), Some(Bytes::new()));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_remove() {
        let (_dir, map) = open("remove");

        map.put(b"key", b"value").unwrap();
        assert_eq!(map.remove(b"key").unwrap(), Some(Bytes::from("value")));
        assert_eq!(map.get(b"key").unwrap(), None);
        assert_eq!(map.remove(b"key").unwrap(), None); // Already removed
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn test_remove_if_equals() {
        let (_dir, map) = open("remove-eq");

        map.put(b"key", b"value").unwrap();
        assert!(!map.remove_if_equals(b"key", b"other").unwrap());
        assert!(map.contains_key(b"key").unwrap());
        assert!(map.remove_if_equals(b"key", b"value").unwrap());
        assert!(!map.contains_key(b"key").unwrap());
    }

    #[test]
    fn test_put_if_absent() {
        let (_dir, map) = open("absent");

        assert_eq!(map.put_if_absent(b"key", b"first").unwrap(), None);
        assert_eq!(
            map.put_if_absent(b"key", b"second").unwrap(),
            Some(Bytes::from("first"))
        );
        assert_eq!(map.get(b"key").unwrap(), Some(Bytes::from("first")));
    }

    #[test]
    fn test_replace() {
        let (_dir, map) = open("replace");

        assert_eq!(map.replace(b"key", b"value").unwrap(), None);
        assert!(!map.replace_if_equals(b"key", b"value", b"new").unwrap());
        assert!(!map.contains_key(b"key").unwrap());

        map.put(b"key", b"old").unwrap();
        assert!(!map.replace_if_equals(b"key", b"wrong", b"new").unwrap());
        assert_eq!(map.get(b"key").unwrap(), Some(Bytes::from("old")));
        assert!(map.replace_if_equals(b"key", b"old", b"new").unwrap());
        assert_eq!(map.get(b"key").unwrap(), Some(Bytes::from("new")));
        assert_eq!(
            map.replace(b"key", b"newer").unwrap(),
            Some(Bytes::from("new"))
        );
        assert_eq!(map.get(b"key").unwrap(), Some(Bytes::from("newer")));
    }

    #[test]
    fn test_expiry() {
        let (_dir, map) = open("expiry");

        map.put_with_ttl(b"key", b"value", Duration::from_millis(50))
            .unwrap();
        map.put(b"forever", b"value").unwrap();

        // Key should exist immediately
        assert!(map.contains_key(b"key").unwrap());

        // Wait for expiry
        thread::sleep(Duration::from_millis(150));

        // Key should be gone
        assert_eq!(map.get(b"key").unwrap(), None);
        assert_eq!(map.len(), 1);
        assert_eq!(map.allocator_stats().free_entries, 1);
    }

    #[test]
    fn test_default_ttl_and_replace_with_ttl() {
        let dir = tempdir().unwrap();
        let config = BigMapConfig::new(dir.path(), "default-ttl")
            .with_page_size(PAGE_SIZE)
            .with_default_ttl(Duration::from_millis(50));
        let map = BigMap::open(config).unwrap();

        map.put(b"short", b"v").unwrap();
        map.put(b"long", b"v").unwrap();
        map.replace_with_ttl(b"long", b"v2", Duration::ZERO).unwrap();

        thread::sleep(Duration::from_millis(150));
        assert_eq!(map.get(b"short").unwrap(), None);
        assert_eq!(map.get(b"long").unwrap(), Some(Bytes::from("v2")));
    }

    #[test]
    fn test_manual_purge() {
        let (_dir, map) = open("purge");

        for i in 0..20 {
            let ttl = if i < 5 { 30 } else { 0 };
            map.put_with_ttl(format!("key{}", i).as_bytes(), b"v", Duration::from_millis(ttl))
                .unwrap();
        }
        thread::sleep(Duration::from_millis(100));

        assert_eq!(map.purge().unwrap(), 5);
        assert_eq!(map.len(), 15);
        assert_eq!(map.purge_count(), 1);

        let stats = map.stats();
        assert_eq!(stats.purge_sweeps, 1);
        assert_eq!(stats.purged, 5);
    }

    #[test]
    fn test_entry_too_large() {
        let dir = tempdir().unwrap();
        let map = BigMap::open(BigMapConfig::new(dir.path(), "large").with_page_size(4096)).unwrap();

        let value = vec![7u8; 5000];
        assert!(matches!(
            map.put(b"key", &value),
            Err(Error::EntryTooLarge { .. })
        ));
        assert!(map.is_empty());

        let fits = vec![7u8; 4096 - 32 - 3];
        map.put(b"key", &fits).unwrap();
        assert_eq!(map.get(b"key").unwrap().unwrap().len(), fits.len());
    }

    #[test]
    fn test_clear_keeps_files_and_frees_slots() {
        let (_dir, map) = open("clear");

        for i in 0..10 {
            map.put(format!("key{}", i).as_bytes(), b"value").unwrap();
        }
        map.clear().unwrap();

        assert!(map.is_empty());
        assert_eq!(map.get(b"key0").unwrap(), None);
        assert_eq!(map.allocator_stats().free_entries, 10);
        assert_eq!(map.back_file_size().unwrap(), PAGE_SIZE as u64);

        map.put(b"key0", b"value").unwrap();
        assert_eq!(map.allocator_stats().exact_match_reuses, 1);
    }

    #[test]
    fn test_remove_all_deletes_files() {
        let (dir, map) = open("remove-all");

        for i in 0..10 {
            map.put(format!("key{}", i).as_bytes(), b"value").unwrap();
        }
        assert!(map.remove_all().unwrap());

        assert!(map.is_empty());
        assert_eq!(map.back_file_size().unwrap(), 0);
        assert_eq!(map.allocator_stats(), AllocatorStats::default());
        assert_eq!(std::fs::read_dir(dir.path().join("remove-all")).unwrap().count(), 0);

        map.put(b"again", b"value").unwrap();
        assert_eq!(map.get(b"again").unwrap(), Some(Bytes::from("value")));
    }

    #[test]
    fn test_remove_all_during_puts_leaves_index_consistent() {
        let (_dir, map) = open("remove-all-race");
        let map = Arc::new(map);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..500 {
                        let key = format!("key-{}-{}", t, i);
                        map.put(key.as_bytes(), b"value").unwrap();
                    }
                })
            })
            .collect();

        for _ in 0..20 {
            map.remove_all().unwrap();
            thread::yield_now();
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Every indexed node must still point at a live slot.
        assert!(map.purge().is_ok());
        let stats = map.allocator_stats();
        assert_eq!(map.len() as u64, stats.total_entries - stats.free_entries);
        for t in 0..4 {
            for i in 0..500 {
                let key = format!("key-{}-{}", t, i);
                assert!(map.get(key.as_bytes()).is_ok());
            }
        }
    }

    #[test]
    fn test_close_waits_for_in_flight_writers() {
        let dir = tempdir().unwrap();
        let config = BigMapConfig::new(dir.path(), "close-race")
            .with_page_size(PAGE_SIZE)
            .with_default_ttl(Duration::from_millis(5))
            .with_purge_interval(Duration::from_millis(1));
        let map = Arc::new(BigMap::open(config).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    let mut written = 0usize;
                    loop {
                        let key = format!("key-{}-{}", t, written);
                        match map.put(key.as_bytes(), b"value") {
                            Ok(_) => written += 1,
                            Err(Error::Closed) => return written,
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                    }
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        map.close().unwrap();
        let written: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert!(written > 0);
        let pages = map.core.allocator.pages();
        assert!(pages.is_closed());
        assert_eq!(pages.cache_size(), 0);
        assert!(matches!(pages.acquire_page(0), Err(Error::Closed)));
    }

    #[test]
    fn test_closed_map_rejects_operations() {
        let (_dir, map) = open("closed");

        map.put(b"key", b"value").unwrap();
        map.close().unwrap();
        map.close().unwrap();

        assert!(map.is_closed());
        assert!(matches!(map.get(b"key"), Err(Error::Closed)));
        assert!(matches!(map.put(b"key", b"v"), Err(Error::Closed)));
        assert!(matches!(map.purge(), Err(Error::Closed)));
        assert!(matches!(map.clear(), Err(Error::Closed)));
        assert!(matches!(map.remove_all(), Err(Error::Closed)));
    }

    #[test]
    fn test_reopen_recovers_entries() {
        let dir = tempdir().unwrap();
        let config = BigMapConfig::new(dir.path(), "recover").with_page_size(PAGE_SIZE);

        {
            let map = BigMap::open(config.clone()).unwrap();
            for i in 0..100 {
                map.put(format!("key{}", i).as_bytes(), format!("value{}", i).as_bytes())
                    .unwrap();
            }
            map.remove(b"key42").unwrap();
            map.close().unwrap();
        }

        let map = BigMap::open(config).unwrap();
        assert_eq!(map.len(), 99);
        assert_eq!(map.get(b"key42").unwrap(), None);
        for i in (0..100).filter(|i| *i != 42) {
            assert_eq!(
                map.get(format!("key{}", i).as_bytes()).unwrap(),
                Some(Bytes::from(format!("value{}", i)))
            );
        }
        assert_eq!(map.allocator_stats().free_entries, 1);

        // The freed slot is picked up again.
        map.put(b"key42", b"value42").unwrap();
        assert_eq!(map.allocator_stats().free_entries, 0);
    }

    #[test]
    fn test_reopen_with_other_page_size_fails() {
        let dir = tempdir().unwrap();
        {
            let map = BigMap::open(BigMapConfig::new(dir.path(), "size").with_page_size(PAGE_SIZE))
                .unwrap();
            map.put(b"key", b"value").unwrap();
        }

        let result = BigMap::open(BigMapConfig::new(dir.path(), "size").with_page_size(2 * PAGE_SIZE));
        assert!(matches!(result, Err(Error::PageSizeMismatch { .. })));
    }

    #[test]
    fn test_open_without_recover_wipes_pages() {
        let dir = tempdir().unwrap();
        let config = BigMapConfig::new(dir.path(), "wipe").with_page_size(PAGE_SIZE);
        {
            let map = BigMap::open(config.clone()).unwrap();
            map.put(b"key", b"value").unwrap();
        }

        let map = BigMap::open(config.with_recover(false)).unwrap();
        assert!(map.is_empty());
        assert_eq!(map.get(b"key").unwrap(), None);
        assert_eq!(map.back_file_size().unwrap(), 0);
    }

    #[test]
    fn test_keys_spread_over_segments() {
        let dir = tempdir().unwrap();
        let config = BigMapConfig::new(dir.path(), "spread")
            .with_page_size(PAGE_SIZE)
            .with_segment_count(4);
        let map = BigMap::open(config).unwrap();

        for i in 0..200 {
            map.put(format!("key{}", i).as_bytes(), b"v").unwrap();
        }

        let used = map.core.segments.iter().filter(|s| !s.is_empty()).count();
        assert_eq!(map.core.segments.len(), 4);
        assert!(used > 1);
        assert_eq!(map.len(), 200);
    }

    #[test]
    fn test_single_segment() {
        let dir = tempdir().unwrap();
        let config = BigMapConfig::new(dir.path(), "single")
            .with_page_size(PAGE_SIZE)
            .with_segment_count(1);
        let map = BigMap::open(config).unwrap();

        for i in 0..50 {
            map.put(format!("key{}", i).as_bytes(), b"v").unwrap();
        }
        assert_eq!(map.core.segments[0].len(), 50);
    }

    #[test]
    fn test_concurrent_access() {
        let (_dir, map) = open("concurrent");
        let map = Arc::new(map);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("key-{}-{}", t, i);
                        map.put(key.as_bytes(), key.as_bytes()).unwrap();
                        assert_eq!(map.get(key.as_bytes()).unwrap(), Some(Bytes::from(key)));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(map.len(), 1600);
        let stats = map.allocator_stats();
        assert_eq!(stats.total_entries, 1600);
        assert_eq!(stats.used_slot_size + stats.free_slot_size, stats.total_slot_size);
    }

    #[test]
    fn test_stats() {
        let (_dir, map) = open("stats");

        map.put(b"a", b"1").unwrap();
        map.put(b"b", b"2").unwrap();
        map.get(b"a").unwrap();
        map.get(b"missing").unwrap();
        map.remove(b"b").unwrap();

        let stats = map.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.put_ops, 2);
        assert_eq!(stats.get_ops, 2);
        assert_eq!(stats.remove_ops, 1);
        assert_eq!(stats.purge_sweeps, 0);
    }
}
