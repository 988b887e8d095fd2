//! Page Factory
//!
//! [`MappedPageFactory`] maps page files on demand, caches open mappings by
//! page index and owns the on-disk lifecycle of the page directory.
//!
//! ## File Naming
//!
//! Page `i` lives in `<page_dir>/page-<i>.dat`. [`page_file_name`] and
//! [`parse_page_file_name`] are exact inverses: names that would not be
//! produced by `page_file_name` (leading zeros, signs, other extensions)
//! are not page files.
//!
//! ## Closing
//!
//! [`MappedPageFactory::close`] unmaps every cached page and refuses to map
//! new ones; [`MappedPageFactory::acquire_page`] returns [`Error::Closed`]
//! from then on. Deleting and listing page files still works.
//!
//! ## Deletion
//!
//! Deleting a page always evicts and unmaps the cached mapping first, then
//! removes the file. Removal is retried a bounded number of rounds with a
//! short backoff; if the file still cannot be removed a warning is logged and
//! the file is left in place.

use crate::error::{Error, Result};
use crate::page::mapped_page::MappedPage;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Prefix of every page file name.
pub const PAGE_FILE_PREFIX: &str = "page-";

/// Extension of every page file name.
pub const PAGE_FILE_EXTENSION: &str = "dat";

/// Number of attempts made to delete a page file.
pub const MAX_DELETE_ROUNDS: u32 = 10;

/// Pause between two delete attempts.
pub const DELETE_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Returns the file name of page `index`.
pub fn page_file_name(index: u64) -> String {
    format!("{}{}.{}", PAGE_FILE_PREFIX, index, PAGE_FILE_EXTENSION)
}

/// Parses a page file name back into its index.
pub fn parse_page_file_name(name: &str) -> Option<u64> {
    let digits = name
        .strip_prefix(PAGE_FILE_PREFIX)?
        .strip_suffix(PAGE_FILE_EXTENSION)?
        .strip_suffix('.')?;
    let index: u64 = digits.parse().ok()?;
    // Reject anything the formatter would not have produced ("+1", "007").
    if index.to_string() == digits {
        Some(index)
    } else {
        None
    }
}

/// Creates and caches memory-mapped pages for one page directory.
#[derive(Debug)]
pub struct MappedPageFactory {
    page_size: usize,
    page_dir: PathBuf,
    /// Open mappings by page index. The write lock guards create-on-miss.
    cache: RwLock<HashMap<u64, Arc<MappedPage>>>,
    closed: AtomicBool,
}

impl MappedPageFactory {
    /// Creates a factory for `page_dir`, creating the directory if needed.
    pub fn new(page_size: usize, page_dir: impl Into<PathBuf>) -> Result<Self> {
        let page_dir = page_dir.into();
        fs::create_dir_all(&page_dir)
            .map_err(|e| Error::io("create page directory", &page_dir, e))?;

        Ok(Self {
            page_size,
            page_dir,
            cache: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_dir(&self) -> &Path {
        &self.page_dir
    }

    /// Full path of the file backing page `index`.
    pub fn page_file_path(&self, index: u64) -> PathBuf {
        self.page_dir.join(page_file_name(index))
    }

    /// Number of currently mapped pages.
    pub fn cache_size(&self) -> usize {
        self.cache.read().len()
    }

    /// Returns the mapping of page `index`, creating and mapping the file on
    /// first access. Concurrent callers always get the same mapping.
    pub fn acquire_page(&self, index: u64) -> Result<Arc<MappedPage>> {
        if let Some(page) = self.cache.read().get(&index) {
            return Ok(Arc::clone(page));
        }

        let mut cache = self.cache.write();
        // Checked under the write lock so nothing is cached after close.
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if let Some(page) = cache.get(&index) {
            debug!(page = index, "Hit mapped page in cache");
            return Ok(Arc::clone(page));
        }

        let path = self.page_file_path(index);
        let page = Arc::new(MappedPage::open(index, &path, self.page_size)?);
        cache.insert(index, Arc::clone(&page));
        debug!(page = index, path = %path.display(), "Mapped page created and cached");
        Ok(page)
    }

    /// Evicts page `index` from the cache and unmaps it.
    fn evict(&self, index: u64) {
        let page = self.cache.write().remove(&index);
        if let Some(page) = page {
            page.release();
        }
    }

    /// Unmaps and deletes page `index`.
    ///
    /// Returns true if the file no longer exists afterwards.
    pub fn delete_page(&self, index: u64) -> bool {
        self.evict(index);

        let path = self.page_file_path(index);
        for round in 1..=MAX_DELETE_ROUNDS {
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "Page file deleted");
                    return true;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => return true,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        round,
                        error = %e,
                        "Failed to delete page file"
                    );
                    if round < MAX_DELETE_ROUNDS {
                        thread::sleep(DELETE_RETRY_BACKOFF);
                    }
                }
            }
        }

        warn!(
            path = %path.display(),
            rounds = MAX_DELETE_ROUNDS,
            "Giving up on deleting page file, it may be deleted manually"
        );
        false
    }

    /// Deletes every page in `indexes`, continuing past failures.
    ///
    /// Returns true if all of them were deleted.
    pub fn delete_pages<'a>(&self, indexes: impl IntoIterator<Item = &'a u64>) -> bool {
        let mut all_deleted = true;
        for &index in indexes {
            all_deleted &= self.delete_page(index);
        }
        all_deleted
    }

    /// Unmaps every cached page and deletes every page file in the directory.
    pub fn delete_all_pages(&self) -> Result<bool> {
        self.release_cached_pages();
        let indexes = self.existing_back_file_index_set()?;
        let deleted = self.delete_pages(&indexes);
        debug!(dir = %self.page_dir.display(), deleted, "All page files deleted");
        Ok(deleted)
    }

    /// Deletes every page file last modified before `timestamp`.
    pub fn delete_pages_before(&self, timestamp: SystemTime) -> Result<bool> {
        let indexes = self.page_index_set_before(timestamp)?;
        let deleted = self.delete_pages(&indexes);
        debug!(
            dir = %self.page_dir.display(),
            pages = indexes.len(),
            deleted,
            "Page files older than timestamp deleted"
        );
        Ok(deleted)
    }

    /// Unmaps every cached page without deleting any file.
    pub fn release_cached_pages(&self) {
        let pages: Vec<_> = self.cache.write().drain().map(|(_, page)| page).collect();
        for page in pages {
            page.release();
        }
    }

    /// Unmaps every cached page and stops mapping new ones.
    pub fn close(&self) {
        {
            let _cache = self.cache.write();
            self.closed.store(true, Ordering::Release);
        }
        self.release_cached_pages();
        debug!(dir = %self.page_dir.display(), "Page factory closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Forces pending writes on every cached page.
    ///
    /// Every page is attempted; failures are logged and reported together.
    pub fn flush(&self) -> Result<()> {
        let pages: Vec<_> = self.cache.read().values().cloned().collect();
        let total = pages.len();
        let mut failed = 0;
        for page in pages {
            if let Err(e) = page.flush() {
                warn!(page = page.index(), error = %e, "Failed to flush page");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(Error::FlushFailed { failed, total });
        }
        Ok(())
    }

    /// Visits every page file in the directory as `(index, path)`.
    fn page_files(&self) -> Result<Vec<(u64, PathBuf)>> {
        let entries = fs::read_dir(&self.page_dir)
            .map_err(|e| Error::io("list page directory", &self.page_dir, e))?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("list page directory", &self.page_dir, e))?;
            let name = entry.file_name();
            if let Some(index) = name.to_str().and_then(parse_page_file_name) {
                files.push((index, entry.path()));
            }
        }
        Ok(files)
    }

    /// Indexes of all page files currently on disk.
    pub fn existing_back_file_index_set(&self) -> Result<BTreeSet<u64>> {
        Ok(self.page_files()?.into_iter().map(|(i, _)| i).collect())
    }

    /// Indexes of page files last modified strictly before `timestamp`.
    pub fn page_index_set_before(&self, timestamp: SystemTime) -> Result<BTreeSet<u64>> {
        let mut indexes = BTreeSet::new();
        for (index, path) in self.page_files()? {
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map_err(|e| Error::io("stat page file", &path, e))?;
            if modified < timestamp {
                indexes.insert(index);
            }
        }
        Ok(indexes)
    }

    /// The newest page index among pages last modified before `timestamp`.
    ///
    /// If the set has wrapped around to include `u64::MAX`, the end of the
    /// contiguous run starting at 0 is returned instead.
    pub fn first_page_index_before(&self, timestamp: SystemTime) -> Result<Option<u64>> {
        let indexes = self.page_index_set_before(timestamp)?;
        let Some(&largest) = indexes.last() else {
            return Ok(None);
        };
        if largest != u64::MAX {
            return Ok(Some(largest));
        }
        let mut next = 0u64;
        while indexes.contains(&next) {
            next += 1;
        }
        Ok(Some(if next == 0 { u64::MAX } else { next - 1 }))
    }

    /// Last modification time of page `index`, or None if it has no file.
    pub fn page_file_last_modified_time(&self, index: u64) -> Option<SystemTime> {
        fs::metadata(self.page_file_path(index))
            .and_then(|m| m.modified())
            .ok()
    }

    /// File names of all page files on disk.
    pub fn back_page_file_set(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .page_files()?
            .into_iter()
            .map(|(index, _)| page_file_name(index))
            .collect())
    }

    /// Total size in bytes of all page files on disk.
    pub fn back_page_file_size(&self) -> Result<u64> {
        let mut total = 0;
        for (_, path) in self.page_files()? {
            total += fs::metadata(&path)
                .map_err(|e| Error::io("stat page file", &path, e))?
                .len();
        }
        Ok(total)
    }
}

impl Drop for MappedPageFactory {
    fn drop(&mut self) {
        self.release_cached_pages();
    }
}
