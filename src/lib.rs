//! # BigMap - An Off-Heap Concurrent Hash Map on Memory-Mapped Files
//!
//! BigMap is a concurrent key-value map for byte-array keys and values that
//! keeps its data in memory-mapped page files instead of on the heap. Large
//! working sets stay out of the allocator, and a map reopened on the same
//! directory finds its entries again.
//!
//! ## Features
//!
//! - **Segmented Index**: independent locks partition the hash index
//! - **Slot Reuse**: freed slots are recycled by exact or approximate length
//! - **Idle Timeout**: entries expire after a configurable time without access
//! - **Purge Sweeps**: a background task evicts expired entries eagerly
//! - **Recovery**: live records are re-indexed when a directory is reopened
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               BigMap                                    │
//! │                                                                         │
//! │   hash_key(key) ──> Segment[high bits] ──> bucket[low bits]             │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────┐   ┌────────────────┐  │
//! │  │                  Segments                    │   │  PurgeSweeper  │  │
//! │  │ ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐  │<──│ (Tokio task)   │  │
//! │  │ │Seg 0   │ │Seg 1   │ │Seg 2   │ │...N    │  │   └────────────────┘  │
//! │  │ │Mutex   │ │Mutex   │ │Mutex   │ │        │  │                       │
//! │  │ └────────┘ └────────┘ └────────┘ └────────┘  │                       │
//! │  └──────────────────────┬───────────────────────┘                       │
//! │                         ▼                                               │
//! │  ┌──────────────────────────────────────────────┐                       │
//! │  │ EntryAllocator: slot index -> (page, offset) │                       │
//! │  └──────────────────────┬───────────────────────┘                       │
//! │                         ▼                                               │
//! │  ┌──────────────────────────────────────────────┐                       │
//! │  │ MappedPageFactory: page-0.dat, page-1.dat... │                       │
//! │  └──────────────────────────────────────────────┘                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```
//! use bigmap::{BigMap, BigMapConfig};
//! use std::time::Duration;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let config = BigMapConfig::new(dir.path(), "sessions")
//!     .with_page_size(1024 * 1024)
//!     .with_default_ttl(Duration::from_secs(300))
//!     .with_purge_interval(Duration::from_secs(1));
//!
//! let map = BigMap::open(config).unwrap();
//! map.put(b"user:1", b"token").unwrap();
//! assert!(map.contains_key(b"user:1").unwrap());
//! map.close().unwrap();
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: Map configuration and validation
//! - [`error`]: The crate's error type
//! - [`page`]: Memory-mapped page files and their factory
//! - [`storage`]: Slot allocator, record layout, segments, the map itself
//!   and the purge sweeper
//!
//! ## Design Highlights
//!
//! ### Slot Indexes
//!
//! Every record lives in a slot identified by its virtual byte offset across
//! all pages. The index doubles as the free-list key and the on-disk
//! identity, and translates to `(page, offset)` with one division.
//!
//! ### Lazy + Active Expiry
//!
//! Entries with a TTL are expired in two ways:
//! 1. **Lazy**: When an entry is touched, we check if it's expired
//! 2. **Active**: A background task periodically sweeps every segment
//!
//! This ensures slots are reclaimed even for keys that are never accessed again.

pub mod config;
pub mod error;
pub mod page;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::BigMapConfig;
pub use error::{Error, Result};
pub use page::{MappedPage, MappedPageFactory};
pub use storage::{AllocatorStats, BigMap, EntryAllocator, MapStats, Segment};

/// Version of BigMap
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
