//! Segments of the Hash Index
//!
//! A [`Segment`] is one independently locked partition of the in-memory hash
//! index. Its bucket array holds singly linked chains of
//! `{slot_index, hash, next}` nodes; keys and values live in page-backed
//! slots resolved through the [`EntryAllocator`].
//!
//! ```text
//!  buckets (power-of-two length, masked by the low hash bits)
//!  ┌───┬───┬───┬───┐
//!  │ 0 │ 1 │ 2 │ 3 │ ...
//!  └─┬─┴───┴─┬─┴───┘
//!    ▼       ▼
//!  {slot, hash} ──> {slot, hash}
//! ```
//!
//! Every operation runs entirely under the segment lock, including the
//! allocator calls it makes, so operations on one key are linearizable.
//! Expired records are evicted whenever an operation touches them, and
//! [`Segment::purge`] evicts all of them in one pass.

use crate::error::Result;
use crate::storage::allocator::EntryAllocator;
use crate::storage::entry::{current_time_millis, MapEntry};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Largest bucket array a segment grows to.
pub const MAXIMUM_CAPACITY: usize = 1 << 30;

/// One link of a bucket chain.
#[derive(Debug)]
struct BucketNode {
    slot_index: u64,
    hash: u64,
    next: Option<Box<BucketNode>>,
}

type Link = Option<Box<BucketNode>>;

/// The lock-protected part of a segment.
#[derive(Debug)]
struct SegmentTable {
    buckets: Vec<Link>,
    count: usize,
    threshold: usize,
}

fn threshold_for(capacity: usize, load_factor: f32) -> usize {
    (capacity as f64 * f64::from(load_factor)) as usize
}

impl SegmentTable {
    fn new(capacity: usize, load_factor: f32) -> Self {
        let mut buckets = Vec::with_capacity(capacity);
        buckets.resize_with(capacity, || None);
        Self {
            buckets,
            count: 0,
            threshold: threshold_for(capacity, load_factor),
        }
    }

    #[inline]
    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    /// Finds the node for `key` in `bucket`, returning its chain position
    /// and resolved entry.
    fn find(
        &self,
        allocator: &EntryAllocator,
        bucket: usize,
        key: &[u8],
        hash: u64,
    ) -> Result<Option<(usize, MapEntry)>> {
        let mut position = 0;
        let mut current = self.buckets[bucket].as_deref();
        while let Some(node) = current {
            if node.hash == hash {
                let entry = allocator.find_map_entry_by_index(node.slot_index)?;
                if entry.key_equals(key)? {
                    return Ok(Some((position, entry)));
                }
            }
            position += 1;
            current = node.next.as_deref();
        }
        Ok(None)
    }

    fn node_mut(&mut self, bucket: usize, position: usize) -> Option<&mut BucketNode> {
        let mut node = self.buckets[bucket].as_deref_mut()?;
        for _ in 0..position {
            node = node.next.as_deref_mut()?;
        }
        Some(node)
    }

    /// Unlinks the node at `position` of `bucket`.
    fn unlink(&mut self, bucket: usize, position: usize) -> Option<Box<BucketNode>> {
        let mut link = &mut self.buckets[bucket];
        for _ in 0..position {
            link = &mut link.as_mut()?.next;
        }
        let mut node = link.take()?;
        *link = node.next.take();
        self.count -= 1;
        Some(node)
    }

    fn push_front(&mut self, slot_index: u64, hash: u64) {
        let bucket = self.bucket_of(hash);
        let next = self.buckets[bucket].take();
        self.buckets[bucket] = Some(Box::new(BucketNode {
            slot_index,
            hash,
            next,
        }));
        self.count += 1;
    }

    /// Doubles the bucket array (up to [`MAXIMUM_CAPACITY`]) and relinks
    /// every node by its hash. Chain order is not preserved.
    fn rehash(&mut self, load_factor: f32) {
        let old_capacity = self.buckets.len();
        if old_capacity >= MAXIMUM_CAPACITY {
            return;
        }

        let new_capacity = old_capacity << 1;
        let mut new_buckets: Vec<Link> = Vec::with_capacity(new_capacity);
        new_buckets.resize_with(new_capacity, || None);
        let mask = new_capacity - 1;

        for bucket in self.buckets.iter_mut() {
            let mut current = bucket.take();
            while let Some(mut node) = current {
                current = node.next.take();
                let target = (node.hash as usize) & mask;
                node.next = new_buckets[target].take();
                new_buckets[target] = Some(node);
            }
        }

        self.buckets = new_buckets;
        self.threshold = threshold_for(new_capacity, load_factor);
        trace!(capacity = new_capacity, "Segment rehashed");
    }

    /// Grows the table if one more node would exceed the threshold.
    fn ensure_capacity_for_insert(&mut self, load_factor: f32) {
        if self.count + 1 > self.threshold {
            self.rehash(load_factor);
        }
    }
}

/// One independently locked partition of the hash index.
#[derive(Debug)]
pub struct Segment {
    table: Mutex<SegmentTable>,
    /// Mirror of `table.count`, readable without the lock
    count: AtomicUsize,
    load_factor: f32,
    allocator: Arc<EntryAllocator>,
}

impl Segment {
    /// Creates a segment with `initial_capacity` buckets (rounded up to a
    /// power of two).
    pub fn new(initial_capacity: usize, load_factor: f32, allocator: Arc<EntryAllocator>) -> Self {
        let capacity = initial_capacity
            .clamp(1, MAXIMUM_CAPACITY)
            .next_power_of_two();
        Self {
            table: Mutex::new(SegmentTable::new(capacity, load_factor)),
            count: AtomicUsize::new(0),
            load_factor,
            allocator,
        }
    }

    /// Number of live nodes in this segment.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current bucket array length.
    pub fn capacity(&self) -> usize {
        self.table.lock().buckets.len()
    }

    fn publish_count(&self, table: &SegmentTable) {
        self.count.store(table.count, Ordering::Release);
    }

    /// Runs `op` under the segment lock and publishes the resulting count,
    /// whether or not `op` succeeded.
    fn locked<T>(&self, op: impl FnOnce(&mut SegmentTable) -> Result<T>) -> Result<T> {
        let mut table = self.table.lock();
        let result = op(&mut table);
        self.publish_count(&table);
        result
    }

    /// Releases the slot of a node and unlinks it. A node whose slot cannot
    /// be released stays linked.
    fn evict(&self, table: &mut SegmentTable, bucket: usize, position: usize) -> Result<()> {
        let Some(slot_index) = table.node_mut(bucket, position).map(|node| node.slot_index) else {
            return Ok(());
        };
        self.allocator.release(slot_index)?;
        table.unlink(bucket, position);
        Ok(())
    }

    /// Looks up a non-expired record for `key`, evicting it if it has expired.
    fn find_live(
        &self,
        table: &mut SegmentTable,
        bucket: usize,
        key: &[u8],
        hash: u64,
        now: i64,
    ) -> Result<Option<(usize, MapEntry)>> {
        let Some((position, entry)) = table.find(&self.allocator, bucket, key, hash)? else {
            return Ok(None);
        };
        if entry.is_expired(now)? {
            self.evict(table, bucket, position)?;
            return Ok(None);
        }
        Ok(Some((position, entry)))
    }

    /// Acquires a slot and writes a complete record into it.
    fn write_new_entry(&self, key: &[u8], value: &[u8], ttl_ms: i64, now: i64) -> Result<u64> {
        let entry = self.allocator.acquire(key.len() + value.len())?;
        if let Err(e) = entry.put_record(key, value, ttl_ms, now) {
            self.allocator.release(entry.index())?;
            return Err(e);
        }
        Ok(entry.index())
    }

    /// Moves the existing node for a key onto a fresh slot holding `value`.
    ///
    /// The old slot is released first. If the new record cannot be written
    /// the node is unlinked, so the key is gone rather than pointing at a
    /// freed slot.
    #[allow(clippy::too_many_arguments)]
    fn rewrite(
        &self,
        table: &mut SegmentTable,
        bucket: usize,
        position: usize,
        old: &MapEntry,
        key: &[u8],
        value: &[u8],
        ttl_ms: i64,
        now: i64,
    ) -> Result<()> {
        self.allocator.release(old.index())?;
        match self.write_new_entry(key, value, ttl_ms, now) {
            Ok(slot_index) => {
                if let Some(node) = table.node_mut(bucket, position) {
                    node.slot_index = slot_index;
                }
                Ok(())
            }
            Err(e) => {
                table.unlink(bucket, position);
                Err(e)
            }
        }
    }

    /// Returns the value for `key`, refreshing its last-access time.
    pub fn get(&self, key: &[u8], hash: u64) -> Result<Option<Bytes>> {
        if self.is_empty() {
            return Ok(None);
        }
        self.locked(|table| {
            let bucket = table.bucket_of(hash);
            let now = current_time_millis();
            match self.find_live(table, bucket, key, hash, now)? {
                Some((_, entry)) => {
                    entry.put_last_accessed_time(now)?;
                    Ok(Some(entry.value()?))
                }
                None => Ok(None),
            }
        })
    }

    /// Returns true if `key` maps to a live record, refreshing its
    /// last-access time.
    pub fn contains_key(&self, key: &[u8], hash: u64) -> Result<bool> {
        if self.is_empty() {
            return Ok(false);
        }
        self.locked(|table| {
            let bucket = table.bucket_of(hash);
            let now = current_time_millis();
            match self.find_live(table, bucket, key, hash, now)? {
                Some((_, entry)) => {
                    entry.put_last_accessed_time(now)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    /// Stores `value` under `key`.
    ///
    /// Returns the previous value. With `only_if_absent` an existing live
    /// record is left untouched and its value returned.
    pub fn put(
        &self,
        key: &[u8],
        hash: u64,
        value: &[u8],
        ttl_ms: i64,
        only_if_absent: bool,
    ) -> Result<Option<Bytes>> {
        self.locked(|table| {
            let bucket = table.bucket_of(hash);
            let now = current_time_millis();
            match self.find_live(table, bucket, key, hash, now)? {
                Some((position, entry)) => {
                    let previous = entry.value()?;
                    if !only_if_absent {
                        self.rewrite(table, bucket, position, &entry, key, value, ttl_ms, now)?;
                    }
                    Ok(Some(previous))
                }
                None => {
                    table.ensure_capacity_for_insert(self.load_factor);
                    let slot_index = self.write_new_entry(key, value, ttl_ms, now)?;
                    table.push_front(slot_index, hash);
                    Ok(None)
                }
            }
        })
    }

    /// Replaces the value of `key` only if it currently equals `old_value`.
    pub fn replace_if_equals(
        &self,
        key: &[u8],
        hash: u64,
        old_value: &[u8],
        new_value: &[u8],
        ttl_ms: i64,
    ) -> Result<bool> {
        self.locked(|table| {
            let bucket = table.bucket_of(hash);
            let now = current_time_millis();
            let Some((position, entry)) = self.find_live(table, bucket, key, hash, now)? else {
                return Ok(false);
            };
            if entry.value()?.as_ref() != old_value {
                return Ok(false);
            }
            self.rewrite(table, bucket, position, &entry, key, new_value, ttl_ms, now)?;
            Ok(true)
        })
    }

    /// Replaces the value of `key` if it is present, returning the previous
    /// value.
    pub fn replace(
        &self,
        key: &[u8],
        hash: u64,
        new_value: &[u8],
        ttl_ms: i64,
    ) -> Result<Option<Bytes>> {
        self.locked(|table| {
            let bucket = table.bucket_of(hash);
            let now = current_time_millis();
            let Some((position, entry)) = self.find_live(table, bucket, key, hash, now)? else {
                return Ok(None);
            };
            let previous = entry.value()?;
            self.rewrite(table, bucket, position, &entry, key, new_value, ttl_ms, now)?;
            Ok(Some(previous))
        })
    }

    /// Removes `key`, optionally only if its value equals `value`.
    ///
    /// Returns the removed value. A record that had already expired is still
    /// unlinked and freed but reported as absent.
    pub fn remove(&self, key: &[u8], hash: u64, value: Option<&[u8]>) -> Result<Option<Bytes>> {
        self.locked(|table| {
            let bucket = table.bucket_of(hash);
            let now = current_time_millis();
            let Some((position, entry)) = self.find_live(table, bucket, key, hash, now)? else {
                return Ok(None);
            };
            let current = entry.value()?;
            if value.is_some_and(|v| v != current.as_ref()) {
                return Ok(None);
            }
            self.evict(table, bucket, position)?;
            Ok(Some(current))
        })
    }

    /// Evicts every expired record. Returns the number evicted.
    ///
    /// Cost is proportional to the bucket array plus all chains, so this is
    /// meant for periodic sweeps rather than per-operation use.
    pub fn purge(&self) -> Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        self.locked(|table| {
            let now = current_time_millis();
            let mut purged = 0;
            let mut result = Ok(());
            for chain in table.buckets.iter_mut() {
                result = self.purge_chain(chain, now, &mut purged);
                if result.is_err() {
                    break;
                }
            }
            table.count -= purged;
            result.map(|()| purged)
        })
    }

    /// Releases and unlinks every expired node of one chain, counting them
    /// into `purged` as they are unlinked. A node is only unlinked once its
    /// slot has been released.
    fn purge_chain(&self, chain: &mut Link, now: i64, purged: &mut usize) -> Result<()> {
        let mut link = chain;
        loop {
            let slot_index = match link.as_deref() {
                Some(node) => node.slot_index,
                None => return Ok(()),
            };
            let expired = self
                .allocator
                .find_map_entry_by_index(slot_index)?
                .is_expired(now)?;
            if expired {
                self.allocator.release(slot_index)?;
                if let Some(mut node) = link.take() {
                    *link = node.next.take();
                    *purged += 1;
                }
            } else if let Some(node) = link {
                link = &mut node.next;
            }
        }
    }

    /// Re-indexes a live slot found while reloading page files.
    ///
    /// Grows the table like an insert but allocates nothing.
    pub fn restore_in_use_map_entry(&self, slot_index: u64, hash: u64) {
        let mut table = self.table.lock();
        table.ensure_capacity_for_insert(self.load_factor);
        table.push_front(slot_index, hash);
        self.publish_count(&table);
    }

    /// Drops every node and returns the slot indexes they referenced.
    ///
    /// The slots themselves are not released; that is up to the caller.
    pub fn clear(&self) -> Vec<u64> {
        self.lock().clear()
    }

    /// Holds the segment lock until the guard is dropped.
    ///
    /// Map-wide operations lock every segment in index order before touching
    /// the allocator, so no single-key operation can interleave with them.
    pub(crate) fn lock(&self) -> SegmentGuard<'_> {
        SegmentGuard {
            segment: self,
            table: self.table.lock(),
        }
    }
}

/// Exclusive hold on one segment. See [`Segment::lock`].
pub(crate) struct SegmentGuard<'a> {
    segment: &'a Segment,
    table: MutexGuard<'a, SegmentTable>,
}

impl SegmentGuard<'_> {
    /// Drops every node and returns the slot indexes they referenced.
    pub(crate) fn clear(&mut self) -> Vec<u64> {
        let mut slots = Vec::with_capacity(self.table.count);
        for bucket in self.table.buckets.iter_mut() {
            let mut current = bucket.take();
            while let Some(mut node) = current {
                current = node.next.take();
                slots.push(node.slot_index);
            }
        }
        self.table.count = 0;
        self.segment.publish_count(&self.table);
        slots
    }
}
