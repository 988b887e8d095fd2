//! Slot Records
//!
//! A [`MapEntry`] is a view of one slot inside a mapped page. The slot holds a
//! fixed 32-byte big-endian header followed by the key bytes and the value
//! bytes:
//!
//! ```text
//! offset  size  field
//!      0     4  slot_length         payload capacity of the slot
//!      4     4  key_length
//!      8     4  value_length
//!     12     4  status              0 = never written, IN_USE, FREE
//!     16     8  last_accessed_time  epoch milliseconds
//!     24     8  time_to_live        milliseconds, 0 = never expires
//!     32     …  key bytes, then value bytes
//! ```
//!
//! Only `last_accessed_time` and `status` are ever updated in place; changing
//! a key's content always goes through a fresh slot.

use crate::error::{Error, Result};
use crate::page::MappedPage;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of the slot header in bytes.
pub const HEADER_SIZE: usize = 32;

const STATUS_OFFSET: usize = 12;
const LAST_ACCESSED_OFFSET: usize = 16;

const STATUS_UNWRITTEN: i32 = 0;
const STATUS_IN_USE: i32 = 0x5553_4544; // "USED"
const STATUS_FREE: i32 = 0x4652_4545; // "FREE"

/// Current wall-clock time in epoch milliseconds.
pub fn current_time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Allocation state recorded in a slot header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    /// Zeroed storage past the allocation frontier
    Unwritten,
    /// Holds a live record
    InUse,
    /// Released and available for reuse
    Free,
}

impl SlotStatus {
    fn to_raw(self) -> i32 {
        match self {
            SlotStatus::Unwritten => STATUS_UNWRITTEN,
            SlotStatus::InUse => STATUS_IN_USE,
            SlotStatus::Free => STATUS_FREE,
        }
    }

    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            STATUS_UNWRITTEN => Some(SlotStatus::Unwritten),
            STATUS_IN_USE => Some(SlotStatus::InUse),
            STATUS_FREE => Some(SlotStatus::Free),
            _ => None,
        }
    }
}

/// Decoded slot header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHeader {
    pub slot_length: u32,
    pub key_length: u32,
    pub value_length: u32,
    pub status: SlotStatus,
    pub last_accessed_time: i64,
    pub time_to_live: i64,
}

fn length_field(index: u64, name: &str, raw: i32) -> Result<u32> {
    u32::try_from(raw).map_err(|_| Error::CorruptSlot {
        index,
        reason: format!("negative {} {}", name, raw),
    })
}

fn length_to_i32(length: usize) -> Result<i32> {
    i32::try_from(length).map_err(|_| Error::EntryTooLarge {
        length,
        max: i32::MAX as usize,
    })
}

impl SlotHeader {
    /// Decodes and validates a header read from slot `index`.
    pub fn decode(index: u64, mut buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::CorruptSlot {
                index,
                reason: format!("header truncated to {} bytes", buf.len()),
            });
        }

        let slot_length = length_field(index, "slot length", buf.get_i32())?;
        let key_length = length_field(index, "key length", buf.get_i32())?;
        let value_length = length_field(index, "value length", buf.get_i32())?;
        let raw_status = buf.get_i32();
        let status = SlotStatus::from_raw(raw_status).ok_or_else(|| Error::CorruptSlot {
            index,
            reason: format!("unknown status {:#010x}", raw_status),
        })?;
        let last_accessed_time = buf.get_i64();
        let time_to_live = buf.get_i64();

        let payload = u64::from(key_length) + u64::from(value_length);
        if status == SlotStatus::InUse && payload > u64::from(slot_length) {
            return Err(Error::CorruptSlot {
                index,
                reason: format!(
                    "record of {} bytes overflows slot of {} bytes",
                    payload, slot_length
                ),
            });
        }

        Ok(Self {
            slot_length,
            key_length,
            value_length,
            status,
            last_accessed_time,
            time_to_live,
        })
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.slot_length as i32);
        buf.put_i32(self.key_length as i32);
        buf.put_i32(self.value_length as i32);
        buf.put_i32(self.status.to_raw());
        buf.put_i64(self.last_accessed_time);
        buf.put_i64(self.time_to_live);
    }

    /// Idle-timeout check: expired once unread for longer than the TTL.
    #[inline]
    pub fn is_expired(&self, now: i64) -> bool {
        self.time_to_live > 0 && now.saturating_sub(self.last_accessed_time) > self.time_to_live
    }
}

/// View of one slot in page-backed storage.
///
/// Valid only while its page stays mapped; every access after the page has
/// been released fails with [`Error::PageReleased`].
#[derive(Debug, Clone)]
pub struct MapEntry {
    index: u64,
    capacity: u32,
    page: Arc<MappedPage>,
    offset: usize,
}

impl MapEntry {
    pub(crate) fn new(index: u64, capacity: u32, page: Arc<MappedPage>, offset: usize) -> Self {
        Self {
            index,
            capacity,
            page,
            offset,
        }
    }

    /// Slot index of this entry.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Payload capacity of the slot.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Reads the raw header, whatever its status.
    pub fn header(&self) -> Result<SlotHeader> {
        let mut buf = [0u8; HEADER_SIZE];
        self.page.read_into(self.offset, &mut buf)?;
        SlotHeader::decode(self.index, &buf)
    }

    /// Reads the header of a slot that must hold a live record.
    pub fn live_header(&self) -> Result<SlotHeader> {
        let header = self.header()?;
        if header.status != SlotStatus::InUse {
            return Err(Error::CorruptSlot {
                index: self.index,
                reason: format!("expected a live record, found {:?}", header.status),
            });
        }
        Ok(header)
    }

    pub fn key(&self) -> Result<Bytes> {
        let header = self.live_header()?;
        let key = self
            .page
            .read(self.offset + HEADER_SIZE, header.key_length as usize)?;
        Ok(Bytes::from(key))
    }

    pub fn value(&self) -> Result<Bytes> {
        let header = self.live_header()?;
        let start = self.offset + HEADER_SIZE + header.key_length as usize;
        let value = self.page.read(start, header.value_length as usize)?;
        Ok(Bytes::from(value))
    }

    /// Compares the stored key with `key` without copying on length mismatch.
    pub fn key_equals(&self, key: &[u8]) -> Result<bool> {
        let header = self.live_header()?;
        if header.key_length as usize != key.len() {
            return Ok(false);
        }
        let stored = self.page.read(self.offset + HEADER_SIZE, key.len())?;
        Ok(stored == key)
    }

    /// Writes a complete record (header, key and value) into the slot.
    pub fn put_record(&self, key: &[u8], value: &[u8], ttl_ms: i64, now: i64) -> Result<()> {
        let payload = key.len() + value.len();
        if payload > self.capacity as usize {
            return Err(Error::EntryTooLarge {
                length: payload,
                max: self.capacity as usize,
            });
        }

        let header = SlotHeader {
            slot_length: self.capacity,
            key_length: length_to_i32(key.len())? as u32,
            value_length: length_to_i32(value.len())? as u32,
            status: SlotStatus::InUse,
            last_accessed_time: now,
            time_to_live: ttl_ms.max(0),
        };

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload);
        header.encode(&mut buf);
        buf.put_slice(key);
        buf.put_slice(value);
        self.page.write(self.offset, &buf)
    }

    /// Refreshes the last-access timestamp in place.
    pub fn put_last_accessed_time(&self, now: i64) -> Result<()> {
        self.page
            .write(self.offset + LAST_ACCESSED_OFFSET, &now.to_be_bytes())
    }

    /// Whether the record has been idle longer than its TTL.
    pub fn is_expired(&self, now: i64) -> Result<bool> {
        Ok(self.live_header()?.is_expired(now))
    }

    /// Stamps the slot header with its capacity and the FREE status.
    pub(crate) fn mark_free(&self) -> Result<()> {
        let mut buf = BytesMut::with_capacity(STATUS_OFFSET + 4);
        buf.put_i32(self.capacity as i32);
        buf.put_bytes(0, STATUS_OFFSET - 4);
        buf.put_i32(SlotStatus::Free.to_raw());
        // Only slot_length and status are meaningful for a free slot.
        self.page.write(self.offset, &buf)
    }
}
