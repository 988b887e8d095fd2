//! Slot Allocator
//!
//! [`EntryAllocator`] hands out variable-length slots in page-backed storage
//! and takes them back, reusing freed space before growing the files.
//!
//! ## Slot Indices
//!
//! A slot index is the virtual byte offset of the slot header across all
//! pages, so translation is pure arithmetic:
//!
//! ```text
//! page   = index / page_size
//! offset = index % page_size
//! ```
//!
//! New slots are carved at the allocation frontier. A slot never straddles
//! two pages: if `HEADER_SIZE + length` does not fit into the rest of the
//! current page, the frontier jumps to offset 0 of the next page.
//!
//! ## Reuse
//!
//! `acquire(length)` tries, in order:
//!
//! 1. **Exact match**: a free slot of exactly `length` bytes
//! 2. **Approximate match**: the smallest free slot longer than `length`
//! 3. **New**: extend storage at the frontier
//!
//! Among equal candidates the lowest slot index wins. Slots are never split
//! or merged and freed bytes are not zeroed.
//!
//! ## Wasted Space
//!
//! A free slot remembers the length requested by its last owner. Wasted
//! bytes are the sum over free slots of `capacity - last requested`, which
//! is only non-zero for slots last handed out by an approximate match.

use crate::error::{Error, Result};
use crate::page::MappedPageFactory;
use crate::storage::entry::{MapEntry, SlotHeader, SlotStatus, HEADER_SIZE};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Bookkeeping for one allocated slot.
#[derive(Debug, Clone, Copy)]
struct Slot {
    /// Payload bytes the slot can hold
    capacity: u32,
    /// Payload bytes requested by the current owner, or by the last one
    /// while free
    requested: u32,
    in_use: bool,
}

/// Mutable allocator state, guarded by one lock.
#[derive(Debug, Default)]
struct AllocatorState {
    /// Virtual offset where the next new slot would start
    frontier: u64,
    /// Every slot ever carved, by index
    slots: HashMap<u64, Slot>,
    /// Free slot indexes by slot length
    free: BTreeMap<u32, BTreeSet<u64>>,
    free_count: u64,
    free_bytes: u64,
    used_bytes: u64,
    real_used_bytes: u64,
    /// Surplus of free slots over what their last owner requested
    wasted_bytes: u64,
}

impl AllocatorState {
    fn surplus(&self, index: u64) -> u64 {
        self.slots
            .get(&index)
            .map_or(0, |slot| u64::from(slot.capacity - slot.requested))
    }

    fn take_free(&mut self, length: u32, index: u64) {
        if let Some(set) = self.free.get_mut(&length) {
            set.remove(&index);
            if set.is_empty() {
                self.free.remove(&length);
            }
        }
        self.free_count -= 1;
        self.free_bytes -= u64::from(length);
        self.wasted_bytes -= self.surplus(index);
    }

    fn put_free(&mut self, length: u32, index: u64) {
        self.free.entry(length).or_default().insert(index);
        self.free_count += 1;
        self.free_bytes += u64::from(length);
        self.wasted_bytes += self.surplus(index);
    }

    /// Lowest-index free slot of exactly `length` bytes.
    fn exact_match(&self, length: u32) -> Option<u64> {
        self.free.get(&length).and_then(|set| set.first().copied())
    }

    /// Lowest-index free slot of the smallest length above `length`.
    fn approximate_match(&self, length: u32) -> Option<(u32, u64)> {
        self.free
            .range((Bound::Excluded(length), Bound::Unbounded))
            .find_map(|(&len, set)| set.first().map(|&index| (len, index)))
    }
}

/// Lifetime counters of the allocator.
#[derive(Debug, Default)]
struct Counters {
    acquire: AtomicU64,
    release: AtomicU64,
    exact_match_reuse: AtomicU64,
    approximate_match_reuse: AtomicU64,
    acquire_new: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        self.acquire.store(0, Ordering::Relaxed);
        self.release.store(0, Ordering::Relaxed);
        self.exact_match_reuse.store(0, Ordering::Relaxed);
        self.approximate_match_reuse.store(0, Ordering::Relaxed);
        self.acquire_new.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of allocator statistics.
///
/// All byte figures count slot payload lengths; each slot additionally
/// occupies a fixed header on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Number of free slots
    pub free_entries: u64,
    /// Number of slots ever carved (free + used)
    pub total_entries: u64,
    /// Bytes of all slots (free + used)
    pub total_slot_size: u64,
    /// Bytes of slots holding live records
    pub used_slot_size: u64,
    /// Bytes actually requested by live records
    pub real_used_slot_size: u64,
    /// Bytes of free slots
    pub free_slot_size: u64,
    /// Surplus of free slots over the length their last owner requested
    pub wasted_slot_size: u64,
    /// Total `acquire` calls
    pub acquires: u64,
    /// Total `release` calls
    pub releases: u64,
    /// Acquires served by a free slot of identical length
    pub exact_match_reuses: u64,
    /// Acquires served by a larger free slot
    pub approximate_match_reuses: u64,
    /// Acquires that extended storage
    pub acquire_new: u64,
}

/// A live slot found while scanning page files on reopen.
#[derive(Debug, Clone)]
pub struct RecoveredEntry {
    pub index: u64,
    pub key: Bytes,
}

/// Allocates and releases variable-length slots over page-backed storage.
///
/// Internally synchronized: segments call into it concurrently.
#[derive(Debug)]
pub struct EntryAllocator {
    pages: Arc<MappedPageFactory>,
    page_size: u64,
    state: Mutex<AllocatorState>,
    counters: Counters,
}

impl EntryAllocator {
    pub fn new(pages: Arc<MappedPageFactory>) -> Self {
        let page_size = pages.page_size() as u64;
        Self {
            pages,
            page_size,
            state: Mutex::new(AllocatorState::default()),
            counters: Counters::default(),
        }
    }

    /// The page factory backing this allocator.
    pub fn pages(&self) -> &Arc<MappedPageFactory> {
        &self.pages
    }

    /// Largest payload a single slot can hold.
    pub fn max_entry_length(&self) -> usize {
        (self.page_size as usize - HEADER_SIZE).min(i32::MAX as usize)
    }

    /// Translates a slot index into `(page index, offset within page)`.
    #[inline]
    pub fn locate(&self, index: u64) -> (u64, usize) {
        (index / self.page_size, (index % self.page_size) as usize)
    }

    fn entry_at(&self, index: u64, capacity: u32) -> Result<MapEntry> {
        let (page_index, offset) = self.locate(index);
        let page = self.pages.acquire_page(page_index)?;
        Ok(MapEntry::new(index, capacity, page, offset))
    }

    /// Acquires a slot able to hold `length` payload bytes.
    pub fn acquire(&self, length: usize) -> Result<MapEntry> {
        self.counters.acquire.fetch_add(1, Ordering::Relaxed);
        let max = self.max_entry_length();
        if length > max {
            return Err(Error::EntryTooLarge { length, max });
        }
        let length = length as u32;

        let mut state = self.state.lock();

        if let Some(index) = state.exact_match(length) {
            let entry = self.entry_at(index, length)?;
            state.take_free(length, index);
            self.mark_used(&mut state, index, length, length);
            self.counters.exact_match_reuse.fetch_add(1, Ordering::Relaxed);
            return Ok(entry);
        }

        if let Some((capacity, index)) = state.approximate_match(length) {
            let entry = self.entry_at(index, capacity)?;
            state.take_free(capacity, index);
            self.mark_used(&mut state, index, capacity, length);
            self.counters
                .approximate_match_reuse
                .fetch_add(1, Ordering::Relaxed);
            return Ok(entry);
        }

        let footprint = HEADER_SIZE as u64 + u64::from(length);
        let mut index = state.frontier;
        if index % self.page_size + footprint > self.page_size {
            index += self.page_size - index % self.page_size;
        }

        // Map the page before moving the frontier so a failure leaves no gap.
        let entry = self.entry_at(index, length)?;
        state.frontier = index + footprint;
        state.slots.insert(
            index,
            Slot {
                capacity: length,
                requested: 0,
                in_use: false,
            },
        );
        self.mark_used(&mut state, index, length, length);
        self.counters.acquire_new.fetch_add(1, Ordering::Relaxed);
        Ok(entry)
    }

    fn mark_used(&self, state: &mut AllocatorState, index: u64, capacity: u32, requested: u32) {
        if let Some(slot) = state.slots.get_mut(&index) {
            slot.in_use = true;
            slot.requested = requested;
        }
        state.used_bytes += u64::from(capacity);
        state.real_used_bytes += u64::from(requested);
    }

    /// Returns the slot at `index` to the free list.
    ///
    /// The payload is left in place; only the header status changes.
    pub fn release(&self, index: u64) -> Result<()> {
        let mut state = self.state.lock();
        let slot = match state.slots.get(&index) {
            Some(slot) if slot.in_use => *slot,
            _ => return Err(Error::SlotNotInUse { index }),
        };

        self.entry_at(index, slot.capacity)?.mark_free()?;

        if let Some(slot) = state.slots.get_mut(&index) {
            slot.in_use = false;
        }
        state.used_bytes -= u64::from(slot.capacity);
        state.real_used_bytes -= u64::from(slot.requested);
        state.put_free(slot.capacity, index);
        self.counters.release.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Resolves a live slot index to its entry view.
    pub fn find_map_entry_by_index(&self, index: u64) -> Result<MapEntry> {
        let capacity = match self.state.lock().slots.get(&index) {
            Some(slot) if slot.in_use => slot.capacity,
            _ => return Err(Error::SlotNotInUse { index }),
        };
        self.entry_at(index, capacity)
    }

    /// Forgets every slot, deletes all page files and resets the counters.
    pub fn remove_all(&self) -> Result<bool> {
        let mut state = self.state.lock();
        let deleted = self.pages.delete_all_pages()?;
        *state = AllocatorState::default();
        self.counters.reset();
        info!(dir = %self.pages.page_dir().display(), "Allocator reset, all pages removed");
        Ok(deleted)
    }

    /// Rebuilds the slot table from the page files on disk.
    ///
    /// Returns every live record found so the caller can re-index it. Must be
    /// called on a fresh allocator before any other operation.
    pub fn recover(&self) -> Result<Vec<RecoveredEntry>> {
        let mut state = self.state.lock();
        let mut recovered = Vec::new();

        for page_index in self.pages.existing_back_file_index_set()? {
            let page = self.pages.acquire_page(page_index)?;
            let base = page_index * self.page_size;
            let mut offset = 0usize;

            while offset + HEADER_SIZE <= self.page_size as usize {
                let index = base + offset as u64;
                let mut buf = [0u8; HEADER_SIZE];
                page.read_into(offset, &mut buf)?;
                let header = SlotHeader::decode(index, &buf)?;
                if header.status == SlotStatus::Unwritten {
                    break;
                }

                let end = offset + HEADER_SIZE + header.slot_length as usize;
                if end > self.page_size as usize {
                    return Err(Error::CorruptSlot {
                        index,
                        reason: format!("slot of {} bytes overruns its page", header.slot_length),
                    });
                }

                let capacity = header.slot_length;
                match header.status {
                    SlotStatus::InUse => {
                        let requested = header.key_length + header.value_length;
                        state.slots.insert(
                            index,
                            Slot {
                                capacity,
                                requested,
                                in_use: true,
                            },
                        );
                        state.used_bytes += u64::from(capacity);
                        state.real_used_bytes += u64::from(requested);
                        let key = page.read(offset + HEADER_SIZE, header.key_length as usize)?;
                        recovered.push(RecoveredEntry {
                            index,
                            key: Bytes::from(key),
                        });
                    }
                    _ => {
                        // The last owner's length is not persisted.
                        state.slots.insert(
                            index,
                            Slot {
                                capacity,
                                requested: capacity,
                                in_use: false,
                            },
                        );
                        state.put_free(capacity, index);
                    }
                }

                state.frontier = state.frontier.max(base + end as u64);
                offset = end;
            }
        }

        debug!(
            live = recovered.len(),
            free = state.free_count,
            frontier = state.frontier,
            "Recovered slots from page files"
        );
        Ok(recovered)
    }

    /// Total size in bytes of all page files on disk.
    pub fn back_file_size(&self) -> Result<u64> {
        self.pages.back_page_file_size()
    }

    pub fn free_entry_count(&self) -> u64 {
        self.state.lock().free_count
    }

    pub fn free_entry_count_by_length(&self, length: u32) -> u64 {
        self.state
            .lock()
            .free
            .get(&length)
            .map_or(0, |set| set.len() as u64)
    }

    pub fn total_entry_count(&self) -> u64 {
        self.state.lock().slots.len() as u64
    }

    pub fn total_free_slot_size(&self) -> u64 {
        self.state.lock().free_bytes
    }

    pub fn free_slot_size_by_length(&self, length: u32) -> u64 {
        self.free_entry_count_by_length(length) * u64::from(length)
    }

    pub fn total_slot_size(&self) -> u64 {
        let state = self.state.lock();
        state.used_bytes + state.free_bytes
    }

    pub fn total_used_slot_size(&self) -> u64 {
        self.state.lock().used_bytes
    }

    pub fn total_real_used_slot_size(&self) -> u64 {
        self.state.lock().real_used_bytes
    }

    pub fn total_wasted_slot_size(&self) -> u64 {
        self.state.lock().wasted_bytes
    }

    /// Indexes of all free slots, in ascending order. Testing aid.
    pub fn free_entry_index_set(&self) -> BTreeSet<u64> {
        self.state
            .lock()
            .free
            .values()
            .flat_map(|set| set.iter().copied())
            .collect()
    }

    pub fn total_acquire_counter(&self) -> u64 {
        self.counters.acquire.load(Ordering::Relaxed)
    }

    pub fn total_release_counter(&self) -> u64 {
        self.counters.release.load(Ordering::Relaxed)
    }

    pub fn total_exact_match_reuse_counter(&self) -> u64 {
        self.counters.exact_match_reuse.load(Ordering::Relaxed)
    }

    pub fn total_approximate_match_reuse_counter(&self) -> u64 {
        self.counters.approximate_match_reuse.load(Ordering::Relaxed)
    }

    pub fn total_acquire_new_counter(&self) -> u64 {
        self.counters.acquire_new.load(Ordering::Relaxed)
    }

    /// Consistent snapshot of every statistic.
    pub fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        AllocatorStats {
            free_entries: state.free_count,
            total_entries: state.slots.len() as u64,
            total_slot_size: state.used_bytes + state.free_bytes,
            used_slot_size: state.used_bytes,
            real_used_slot_size: state.real_used_bytes,
            free_slot_size: state.free_bytes,
            wasted_slot_size: state.wasted_bytes,
            acquires: self.counters.acquire.load(Ordering::Relaxed),
            releases: self.counters.release.load(Ordering::Relaxed),
            exact_match_reuses: self.counters.exact_match_reuse.load(Ordering::Relaxed),
            approximate_match_reuses: self
                .counters
                .approximate_match_reuse
                .load(Ordering::Relaxed),
            acquire_new: self.counters.acquire_new.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    const PAGE_SIZE: usize = 256;

    fn allocator() -> (TempDir, EntryAllocator) {
        let dir = tempdir().unwrap();
        let pages = Arc::new(MappedPageFactory::new(PAGE_SIZE, dir.path()).unwrap());
        (dir, EntryAllocator::new(pages))
    }

    fn assert_accounting(alloc: &EntryAllocator) {
        let stats = alloc.stats();
        assert_eq!(
            stats.used_slot_size + stats.free_slot_size,
            stats.total_slot_size
        );
        assert!(stats.real_used_slot_size <= stats.used_slot_size);
    }

    #[test]
    fn test_acquire_new_is_contiguous() {
        let (_dir, alloc) = allocator();

        let a = alloc.acquire(10).unwrap();
        let b = alloc.acquire(20).unwrap();

        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), (HEADER_SIZE + 10) as u64);
        assert_eq!(alloc.total_acquire_new_counter(), 2);
        assert_eq!(alloc.total_slot_size(), 30);
        assert_eq!(alloc.total_entry_count(), 2);
        assert_accounting(&alloc);
    }

    #[test]
    fn test_slot_never_straddles_pages() {
        let (_dir, alloc) = allocator();

        // 32 + 150 = 182 bytes, two of them cannot share a 256-byte page.
        let a = alloc.acquire(150).unwrap();
        let b = alloc.acquire(150).unwrap();

        assert_eq!(alloc.locate(a.index()), (0, 0));
        assert_eq!(alloc.locate(b.index()), (1, 0));
        assert_eq!(alloc.pages().existing_back_file_index_set().unwrap().len(), 2);
    }

    #[test]
    fn test_entry_too_large() {
        let (_dir, alloc) = allocator();

        assert_eq!(alloc.max_entry_length(), PAGE_SIZE - HEADER_SIZE);
        assert!(alloc.acquire(PAGE_SIZE - HEADER_SIZE).is_ok());
        assert!(matches!(
            alloc.acquire(PAGE_SIZE - HEADER_SIZE + 1),
            Err(Error::EntryTooLarge { .. })
        ));
    }

    #[test]
    fn test_exact_match_reuse_does_not_grow() {
        let (_dir, alloc) = allocator();

        let a = alloc.acquire(16).unwrap();
        alloc.acquire(16).unwrap();
        alloc.release(a.index()).unwrap();

        let total_before = alloc.total_slot_size();
        let reused = alloc.acquire(16).unwrap();

        assert_eq!(reused.index(), a.index());
        assert_eq!(alloc.total_slot_size(), total_before);
        assert_eq!(alloc.total_exact_match_reuse_counter(), 1);
        assert_eq!(alloc.free_entry_count(), 0);
        assert_accounting(&alloc);
    }

    #[test]
    fn test_approximate_match_picks_smallest_then_lowest_index() {
        let (_dir, alloc) = allocator();

        let big = alloc.acquire(40).unwrap();
        let mid_a = alloc.acquire(20).unwrap();
        let mid_b = alloc.acquire(20).unwrap();
        alloc.acquire(5).unwrap();

        alloc.release(mid_b.index()).unwrap();
        alloc.release(big.index()).unwrap();
        alloc.release(mid_a.index()).unwrap();

        let e = alloc.acquire(12).unwrap();
        assert_eq!(e.index(), mid_a.index());
        assert_eq!(e.capacity(), 20);
        assert_eq!(alloc.total_approximate_match_reuse_counter(), 1);

        let e = alloc.acquire(12).unwrap();
        assert_eq!(e.index(), mid_b.index());

        let e = alloc.acquire(12).unwrap();
        assert_eq!(e.index(), big.index());
        assert_eq!(alloc.total_real_used_slot_size(), 12 * 3 + 5);
        assert_accounting(&alloc);

        // Live slots carry no waste; a released slot keeps its surplus.
        assert_eq!(alloc.total_wasted_slot_size(), 0);
        alloc.release(big.index()).unwrap();
        assert_eq!(alloc.total_wasted_slot_size(), 28);
        alloc.release(mid_a.index()).unwrap();
        assert_eq!(alloc.total_wasted_slot_size(), 28 + 8);
        assert_eq!(alloc.stats().wasted_slot_size, 36);
        assert_eq!(alloc.free_entry_count_by_length(40), 1);
        assert_eq!(alloc.free_slot_size_by_length(40), 40);

        // Reusing a slot takes its surplus out of the total again.
        alloc.acquire(40).unwrap();
        assert_eq!(alloc.total_wasted_slot_size(), 8);
        alloc.acquire(20).unwrap();
        assert_eq!(alloc.total_wasted_slot_size(), 0);
    }

    #[test]
    fn test_rejected_acquire_is_counted() {
        let (_dir, alloc) = allocator();

        assert!(alloc.acquire(PAGE_SIZE).is_err());
        alloc.acquire(4).unwrap();

        assert_eq!(alloc.total_acquire_counter(), 2);
        assert_eq!(alloc.total_acquire_new_counter(), 1);
        assert_eq!(alloc.total_entry_count(), 1);
    }

    #[test]
    fn test_release_errors() {
        let (_dir, alloc) = allocator();

        let a = alloc.acquire(8).unwrap();
        alloc.release(a.index()).unwrap();

        assert!(matches!(
            alloc.release(a.index()),
            Err(Error::SlotNotInUse { .. })
        ));
        assert!(matches!(
            alloc.release(12345),
            Err(Error::SlotNotInUse { index: 12345 })
        ));
        assert!(alloc.find_map_entry_by_index(a.index()).is_err());
        assert_eq!(alloc.total_release_counter(), 1);
    }

    #[test]
    fn test_find_map_entry_by_index() {
        let (_dir, alloc) = allocator();

        let a = alloc.acquire(8).unwrap();
        a.put_record(b"key", b"value", 0, 0).unwrap();

        let found = alloc.find_map_entry_by_index(a.index()).unwrap();
        assert_eq!(found.value().unwrap(), Bytes::from_static(b"value"));
    }

    #[test]
    fn test_accounting_holds_across_sequence() {
        let (_dir, alloc) = allocator();
        let mut live = Vec::new();

        for round in 0..200usize {
            let length = (round * 7) % 50;
            live.push(alloc.acquire(length).unwrap().index());
            if round % 3 == 0 {
                let index = live.remove(round % live.len());
                alloc.release(index).unwrap();
            }
            assert_accounting(&alloc);
        }

        let stats = alloc.stats();
        assert_eq!(stats.acquires, 200);
        assert_eq!(
            stats.acquires,
            stats.exact_match_reuses + stats.approximate_match_reuses + stats.acquire_new
        );
        assert_eq!(stats.total_entries, stats.acquire_new);
        assert_eq!(stats.free_entries, alloc.free_entry_index_set().len() as u64);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let (_dir, alloc) = allocator();
        let alloc = Arc::new(alloc);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let alloc = Arc::clone(&alloc);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let entry = alloc.acquire(8 + (i % 4)).unwrap();
                        entry.put_record(&[t as u8], b"v", 0, 0).unwrap();
                        alloc.release(entry.index()).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = alloc.stats();
        assert_eq!(stats.acquires, 400);
        assert_eq!(stats.releases, 400);
        assert_eq!(stats.used_slot_size, 0);
        assert_eq!(stats.free_entries, stats.total_entries);
    }

    #[test]
    fn test_remove_all_resets() {
        let (_dir, alloc) = allocator();

        alloc.acquire(100).unwrap();
        alloc.acquire(100).unwrap();
        assert!(alloc.back_file_size().unwrap() > 0);

        assert!(alloc.remove_all().unwrap());

        assert_eq!(alloc.stats(), AllocatorStats::default());
        assert_eq!(alloc.back_file_size().unwrap(), 0);
        assert_eq!(alloc.acquire(4).unwrap().index(), 0);
    }

    #[test]
    fn test_recover_rebuilds_slot_table() {
        let dir = tempdir().unwrap();
        let (live_index, free_index) = {
            let pages = Arc::new(MappedPageFactory::new(PAGE_SIZE, dir.path()).unwrap());
            let alloc = EntryAllocator::new(Arc::clone(&pages));

            let live = alloc.acquire(8).unwrap();
            live.put_record(b"k1", b"value1", 0, 0).unwrap();
            let free = alloc.acquire(10).unwrap();
            free.put_record(b"k2", b"value22", 0, 0).unwrap();
            alloc.release(free.index()).unwrap();
            // Forces a second page.
            let other = alloc.acquire(200).unwrap();
            other.put_record(b"k3", b"v", 0, 0).unwrap();

            assert_eq!(other.index(), PAGE_SIZE as u64);

            pages.flush().unwrap();
            (live.index(), free.index())
        };

        let pages = Arc::new(MappedPageFactory::new(PAGE_SIZE, dir.path()).unwrap());
        let alloc = EntryAllocator::new(pages);
        let recovered = alloc.recover().unwrap();

        let keys: Vec<_> = recovered.iter().map(|r| r.key.clone()).collect();
        assert_eq!(keys, vec![Bytes::from_static(b"k1"), Bytes::from_static(b"k3")]);
        assert_eq!(recovered[0].index, live_index);
        assert_eq!(alloc.free_entry_index_set(), BTreeSet::from([free_index]));
        assert_eq!(alloc.total_real_used_slot_size(), 8 + 3);

        // The free slot is reused; page 1 is full so new slots go to page 2.
        assert_eq!(alloc.acquire(10).unwrap().index(), free_index);
        assert_eq!(alloc.acquire(1).unwrap().index(), 2 * PAGE_SIZE as u64);
    }

    #[test]
    fn test_recover_rejects_corrupt_header() {
        let dir = tempdir().unwrap();
        let pages = Arc::new(MappedPageFactory::new(PAGE_SIZE, dir.path()).unwrap());
        let page = pages.acquire_page(0).unwrap();
        page.write(0, &(-5i32).to_be_bytes()).unwrap();

        let alloc = EntryAllocator::new(pages);
        assert!(matches!(
            alloc.recover(),
            Err(Error::CorruptSlot { index: 0, .. })
        ));
    }
}
