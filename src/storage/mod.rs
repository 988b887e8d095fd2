//! Storage Module
//!
//! Everything between the public [`BigMap`] handle and the page files.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          BigMap                             │
//! │  ┌───────────┐ ┌───────────┐ ┌───────────┐ ┌───────────┐    │
//! │  │ Segment 0 │ │ Segment 1 │ │ Segment 2 │ │ Segment N │    │
//! │  │  Mutex    │ │  Mutex    │ │  Mutex    │ │  Mutex    │    │
//! │  └─────┬─────┘ └─────┬─────┘ └─────┬─────┘ └─────┬─────┘    │
//! │        └─────────────┴──────┬──────┴─────────────┘          │
//! │                             ▼                               │
//! │                      EntryAllocator                         │
//! │              (slot table + free list by length)             │
//! └─────────────────────────────┬───────────────────────────────┘
//!              ▲                ▼
//!              │        MappedPageFactory ──> page-N.dat files
//!   ┌──────────┴──────────┐
//!   │    PurgeSweeper     │
//!   │ (background Tokio)  │
//!   └─────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Off-heap**: keys and values live in memory-mapped page files
//! - **Segmented**: independent locks reduce contention
//! - **Idle Timeout**: entries expire after a period without access
//! - **Lazy Expiry**: expired entries are evicted when touched
//! - **Active Expiry**: the sweeper evicts entries nobody touches
//! - **Recovery**: reopening a directory re-indexes its live records

pub mod allocator;
pub mod engine;
pub mod entry;
mod expiry;
pub mod segment;

// Re-export commonly used types
pub use allocator::{AllocatorStats, EntryAllocator, RecoveredEntry};
pub use engine::{hash_key, BigMap, MapStats};
pub use entry::{MapEntry, SlotHeader, SlotStatus};
pub use segment::Segment;
