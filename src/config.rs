//! Map Configuration
//!
//! [`BigMapConfig`] collects everything recognized when a map is opened:
//! where the page files live, how the hash index is partitioned, the page
//! size and the TTL/purge behavior.
//!
//! ## Example
//!
//! ```
//! use bigmap::BigMapConfig;
//! use std::time::Duration;
//!
//! let config = BigMapConfig::new("/tmp/bigmap", "sessions")
//!     .with_default_ttl(Duration::from_secs(30))
//!     .with_purge_interval(Duration::from_secs(1))
//!     .with_page_size(1024 * 1024);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.page_dir(), std::path::Path::new("/tmp/bigmap/sessions"));
//! ```

use crate::error::{Error, Result};
use crate::storage::entry::HEADER_SIZE;
use crate::storage::segment::MAXIMUM_CAPACITY;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default page size (32 MB).
pub const DEFAULT_PAGE_SIZE: usize = 32 * 1024 * 1024;

/// Smallest page size accepted.
pub const MIN_PAGE_SIZE: usize = 64;

/// Default number of segments (shards) in the hash index.
pub const DEFAULT_SEGMENT_COUNT: usize = 16;

/// Upper bound on the number of segments.
pub const MAX_SEGMENT_COUNT: usize = 1 << 16;

/// Default total bucket capacity, spread across all segments.
pub const DEFAULT_INITIAL_CAPACITY: usize = 16;

/// Default load factor of every segment's bucket array.
pub const DEFAULT_LOAD_FACTOR: f32 = 0.75;

/// Configuration recognized by [`BigMap::open`](crate::BigMap::open).
#[derive(Debug, Clone)]
pub struct BigMapConfig {
    /// Base directory holding one subdirectory per map instance
    pub dir: PathBuf,

    /// Instance name, used as the subdirectory for this map's page files
    pub name: String,

    /// TTL applied by `put` when no explicit TTL is given (zero = never expires)
    pub default_ttl: Duration,

    /// Number of independently locked segments (rounded up to a power of two)
    pub segment_count: usize,

    /// Total initial bucket capacity across all segments
    pub initial_capacity: usize,

    /// Load factor at which a segment doubles its bucket array
    pub load_factor: f32,

    /// Size of every page file in bytes; must not change across reopens
    pub page_size: usize,

    /// Interval of the background purge sweep (None = no sweeper)
    pub purge_interval: Option<Duration>,

    /// Reload existing page files on open instead of deleting them
    pub recover: bool,
}

impl Default for BigMapConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("bigmap"),
            name: "default".to_string(),
            default_ttl: Duration::ZERO,
            segment_count: DEFAULT_SEGMENT_COUNT,
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            load_factor: DEFAULT_LOAD_FACTOR,
            page_size: DEFAULT_PAGE_SIZE,
            purge_interval: None,
            recover: true,
        }
    }
}

impl BigMapConfig {
    /// Creates a configuration for the instance `name` under `dir`.
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_segment_count(mut self, segment_count: usize) -> Self {
        self.segment_count = segment_count;
        self
    }

    pub fn with_initial_capacity(mut self, initial_capacity: usize) -> Self {
        self.initial_capacity = initial_capacity;
        self
    }

    pub fn with_load_factor(mut self, load_factor: f32) -> Self {
        self.load_factor = load_factor;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval = Some(interval);
        self
    }

    pub fn with_recover(mut self, recover: bool) -> Self {
        self.recover = recover;
        self
    }

    /// Directory holding this instance's page files.
    pub fn page_dir(&self) -> PathBuf {
        self.dir.join(&self.name)
    }

    /// Checks that the configuration describes a usable map.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || Path::new(&self.name).components().count() != 1 {
            return Err(Error::InvalidConfig(format!(
                "instance name '{}' must be a single path component",
                self.name
            )));
        }
        if self.segment_count == 0 || self.segment_count > MAX_SEGMENT_COUNT {
            return Err(Error::InvalidConfig(format!(
                "segment count {} must be between 1 and {}",
                self.segment_count, MAX_SEGMENT_COUNT
            )));
        }
        if !(self.load_factor > 0.0 && self.load_factor.is_finite()) {
            return Err(Error::InvalidConfig(format!(
                "load factor {} must be a positive number",
                self.load_factor
            )));
        }
        if self.page_size < MIN_PAGE_SIZE || self.page_size <= HEADER_SIZE {
            return Err(Error::InvalidConfig(format!(
                "page size {} must be at least {} bytes",
                self.page_size, MIN_PAGE_SIZE
            )));
        }
        if let Some(interval) = self.purge_interval {
            if interval.is_zero() {
                return Err(Error::InvalidConfig(
                    "purge interval must be non-zero".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Segment count rounded up to the next power of two.
    pub(crate) fn effective_segment_count(&self) -> usize {
        self.segment_count.next_power_of_two()
    }

    /// Initial bucket capacity of a single segment: a power of two between 1
    /// and [`MAXIMUM_CAPACITY`].
    pub(crate) fn segment_capacity(&self) -> usize {
        let segments = self.effective_segment_count();
        let per_segment = self.initial_capacity.div_ceil(segments);
        per_segment.clamp(1, MAXIMUM_CAPACITY).next_power_of_two()
    }

    /// Default TTL in milliseconds as stored in slot headers.
    pub(crate) fn default_ttl_ms(&self) -> i64 {
        duration_to_ttl_ms(self.default_ttl)
    }
}

/// Converts a TTL to the millisecond representation stored on disk.
pub(crate) fn duration_to_ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}
