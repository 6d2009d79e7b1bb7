//! Journal layer.
//!
//! The journal region is a ring of fixed-size sectors. Sector 0 holds the
//! `START` record: the current `used_start` (oldest live byte) and the CRC
//! chain seed for the first record there. All other sectors hold either
//! packed records or small-write payload bytes.
//!
//! Record format (12-byte header, little-endian):
//! ```text
//! +--------+-------+------+-----+------+---------+
//! | CRC32C | Magic | Type | Pad | Size | Payload |
//! | 4B     | 2B    | 1B   | 1B  | 4B   | var     |
//! +--------+-------+------+-----+------+---------+
//! ```
//! Each record's CRC is chained with the previous record's CRC
//! (`crc32c(prev_crc_le ++ record[4..size])`), so recovery replays
//! records in order and truncates the tail at the first mismatch.
//!
//! Records never span a sector boundary. Small-write payload bytes occupy
//! whole sectors allocated right after the sector their record lives in;
//! the record's `data_offset` points at them.
//!
//! The whole region is mirrored in an in-memory image; reads of
//! journal-resident payloads and flusher copy-out are served from RAM,
//! while the on-disk copy is authoritative for recovery only.

use crate::raw_io::AlignedBuffer;
use crate::ring::{IoRing, Owner, Target};
use blockvault_common::ObjectVersion;
use bytes::{Buf, BufMut};
use std::collections::BTreeMap;

/// Journal record magic.
pub const RECORD_MAGIC: u16 = 0x4256;

/// Fixed record header size.
pub const RECORD_HEADER_SIZE: usize = 12;

/// Slot index meaning "no sector assigned yet".
const UNASSIGNED: u64 = u64::MAX;

/// Journal record types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Start = 1,
    SmallWrite = 2,
    BigWrite = 3,
    Delete = 4,
    Stable = 5,
    Rollback = 6,
    SmallWriteInstant = 7,
    BigWriteInstant = 8,
}

impl RecordType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Start),
            2 => Some(Self::SmallWrite),
            3 => Some(Self::BigWrite),
            4 => Some(Self::Delete),
            5 => Some(Self::Stable),
            6 => Some(Self::Rollback),
            7 => Some(Self::SmallWriteInstant),
            8 => Some(Self::BigWriteInstant),
            _ => None,
        }
    }
}

/// Decoded journal record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordBody {
    Start {
        journal_start: u64,
        crc32_begin: u32,
    },
    SmallWrite {
        ov: ObjectVersion,
        offset: u32,
        len: u32,
        data_offset: u64,
        data_crc32: u32,
        ext_bitmap: Vec<u8>,
        instant: bool,
    },
    BigWrite {
        ov: ObjectVersion,
        offset: u32,
        len: u32,
        location: u64,
        ext_bitmap: Vec<u8>,
        instant: bool,
    },
    Delete {
        ov: ObjectVersion,
    },
    Stable {
        versions: Vec<ObjectVersion>,
    },
    Rollback {
        versions: Vec<ObjectVersion>,
    },
}

impl RecordBody {
    /// Serialized size of this record, header included.
    pub fn size(&self, bitmap_bytes: usize) -> usize {
        RECORD_HEADER_SIZE
            + match self {
                Self::Start { .. } => 12,
                Self::SmallWrite { .. } => 44 + bitmap_bytes,
                Self::BigWrite { .. } => 40 + bitmap_bytes,
                Self::Delete { .. } => ObjectVersion::WIRE_SIZE,
                Self::Stable { versions } | Self::Rollback { versions } => {
                    4 + versions.len() * ObjectVersion::WIRE_SIZE
                }
            }
    }

    fn record_type(&self) -> RecordType {
        match self {
            Self::Start { .. } => RecordType::Start,
            Self::SmallWrite { instant: false, .. } => RecordType::SmallWrite,
            Self::SmallWrite { instant: true, .. } => RecordType::SmallWriteInstant,
            Self::BigWrite { instant: false, .. } => RecordType::BigWrite,
            Self::BigWrite { instant: true, .. } => RecordType::BigWriteInstant,
            Self::Delete { .. } => RecordType::Delete,
            Self::Stable { .. } => RecordType::Stable,
            Self::Rollback { .. } => RecordType::Rollback,
        }
    }
}

/// Continue a chained CRC: the previous record's CRC folded in front of
/// this record's bytes.
fn chain_crc32(prev: u32, bytes: &[u8]) -> u32 {
    crc32c::crc32c_append(crc32c::crc32c(&prev.to_le_bytes()), bytes)
}

/// Encode a record, chaining its CRC from `prev_crc`. Returns the bytes
/// and the record's own CRC (the next link of the chain).
pub fn encode_record(body: &RecordBody, prev_crc: u32, bitmap_bytes: usize) -> (Vec<u8>, u32) {
    let size = body.size(bitmap_bytes);
    let mut buf = Vec::with_capacity(size);
    buf.put_u32_le(0); // CRC placeholder
    buf.put_u16_le(RECORD_MAGIC);
    buf.put_u8(body.record_type() as u8);
    buf.put_u8(0);
    buf.put_u32_le(size as u32);
    match body {
        RecordBody::Start {
            journal_start,
            crc32_begin,
        } => {
            buf.put_u64_le(*journal_start);
            buf.put_u32_le(*crc32_begin);
        }
        RecordBody::SmallWrite {
            ov,
            offset,
            len,
            data_offset,
            data_crc32,
            ext_bitmap,
            ..
        } => {
            ov.put(&mut buf);
            buf.put_u32_le(*offset);
            buf.put_u32_le(*len);
            buf.put_u64_le(*data_offset);
            buf.put_u32_le(*data_crc32);
            put_bitmap(&mut buf, ext_bitmap, bitmap_bytes);
        }
        RecordBody::BigWrite {
            ov,
            offset,
            len,
            location,
            ext_bitmap,
            ..
        } => {
            ov.put(&mut buf);
            buf.put_u32_le(*offset);
            buf.put_u32_le(*len);
            buf.put_u64_le(*location);
            put_bitmap(&mut buf, ext_bitmap, bitmap_bytes);
        }
        RecordBody::Delete { ov } => {
            ov.put(&mut buf);
        }
        RecordBody::Stable { versions } | RecordBody::Rollback { versions } => {
            buf.put_u32_le(versions.len() as u32);
            for v in versions {
                v.put(&mut buf);
            }
        }
    }
    debug_assert_eq!(buf.len(), size);
    let crc = chain_crc32(prev_crc, &buf[4..]);
    buf[0..4].copy_from_slice(&crc.to_le_bytes());
    (buf, crc)
}

fn put_bitmap(buf: &mut Vec<u8>, bitmap: &[u8], bitmap_bytes: usize) {
    let n = bitmap.len().min(bitmap_bytes);
    buf.put_slice(&bitmap[..n]);
    for _ in n..bitmap_bytes {
        buf.put_u8(0);
    }
}

/// Decode one record at the start of `buf`, verifying magic and chained
/// CRC. Returns the record, its size, and its CRC, or `None` when the
/// bytes are not a valid next record (end of log / truncated tail).
pub fn decode_record(
    buf: &[u8],
    prev_crc: u32,
    bitmap_bytes: usize,
) -> Option<(RecordBody, usize, u32)> {
    if buf.len() < RECORD_HEADER_SIZE {
        return None;
    }
    let mut hdr = &buf[..RECORD_HEADER_SIZE];
    let stored_crc = hdr.get_u32_le();
    if hdr.get_u16_le() != RECORD_MAGIC {
        return None;
    }
    let rtype = RecordType::from_u8(hdr.get_u8())?;
    hdr.get_u8();
    let size = hdr.get_u32_le() as usize;
    if size < RECORD_HEADER_SIZE || size > buf.len() {
        return None;
    }
    if chain_crc32(prev_crc, &buf[4..size]) != stored_crc {
        return None;
    }

    let mut p = &buf[RECORD_HEADER_SIZE..size];
    let body = match rtype {
        RecordType::Start => {
            if p.remaining() < 12 {
                return None;
            }
            RecordBody::Start {
                journal_start: p.get_u64_le(),
                crc32_begin: p.get_u32_le(),
            }
        }
        RecordType::SmallWrite | RecordType::SmallWriteInstant => {
            if p.remaining() < 44 + bitmap_bytes {
                return None;
            }
            let ov = ObjectVersion::get(&mut p);
            let offset = p.get_u32_le();
            let len = p.get_u32_le();
            let data_offset = p.get_u64_le();
            let data_crc32 = p.get_u32_le();
            let mut ext_bitmap = vec![0u8; bitmap_bytes];
            p.copy_to_slice(&mut ext_bitmap);
            RecordBody::SmallWrite {
                ov,
                offset,
                len,
                data_offset,
                data_crc32,
                ext_bitmap,
                instant: rtype == RecordType::SmallWriteInstant,
            }
        }
        RecordType::BigWrite | RecordType::BigWriteInstant => {
            if p.remaining() < 40 + bitmap_bytes {
                return None;
            }
            let ov = ObjectVersion::get(&mut p);
            let offset = p.get_u32_le();
            let len = p.get_u32_le();
            let location = p.get_u64_le();
            let mut ext_bitmap = vec![0u8; bitmap_bytes];
            p.copy_to_slice(&mut ext_bitmap);
            RecordBody::BigWrite {
                ov,
                offset,
                len,
                location,
                ext_bitmap,
                instant: rtype == RecordType::BigWriteInstant,
            }
        }
        RecordType::Delete => {
            if p.remaining() < ObjectVersion::WIRE_SIZE {
                return None;
            }
            RecordBody::Delete {
                ov: ObjectVersion::get(&mut p),
            }
        }
        RecordType::Stable | RecordType::Rollback => {
            if p.remaining() < 4 {
                return None;
            }
            let count = p.get_u32_le() as usize;
            if p.remaining() < count * ObjectVersion::WIRE_SIZE {
                return None;
            }
            let versions = (0..count).map(|_| ObjectVersion::get(&mut p)).collect();
            if rtype == RecordType::Stable {
                RecordBody::Stable { versions }
            } else {
                RecordBody::Rollback { versions }
            }
        }
    };
    Some((body, size, stored_crc))
}

/// Why a journal operation cannot proceed right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JournalWait {
    /// Not enough ring space; `used_start` at the time of the check.
    Space(u64),
    /// The next sector buffer is still in flight.
    Buffer,
}

/// One in-flight sector buffer.
#[derive(Debug)]
pub struct SectorSlot {
    /// Journal offset this buffer maps to, [`UNASSIGNED`] when unused.
    pub offset: u64,
    /// Bytes of records formatted into this sector so far.
    pub fill: usize,
    /// Content newer than the last submitted write.
    pub dirty: bool,
    /// In-flight writes of this sector.
    pub flush_count: u32,
}

impl SectorSlot {
    fn new() -> Self {
        Self {
            offset: UNASSIGNED,
            fill: 0,
            dirty: false,
            flush_count: 0,
        }
    }
}

/// The journal ring state.
pub struct Journal {
    /// Region length in bytes.
    pub len: u64,
    /// Sector size in bytes.
    pub sector_size: u64,
    /// Oldest byte offset still needed for recovery.
    pub used_start: u64,
    /// Next allocation position.
    pub next_free: u64,
    /// CRC of the most recently formatted record (the chain head).
    pub crc32_last: u32,
    /// True when no live records exist in the ring.
    pub empty: bool,
    /// The START sector no longer matches `used_start`; it must be
    /// rewritten before (or together with) the next journal fsync.
    pub start_dirty: bool,
    /// In-memory image of the whole region.
    pub buffer: Vec<u8>,
    /// Sector buffer pool.
    pub slots: Vec<SectorSlot>,
    /// Slot currently being filled.
    pub cur_slot: usize,
    /// Ops parked on journal space; biases the flusher toward trimming.
    pub trim_wanted: u32,
    /// Dirty-entry references per record sector offset.
    sector_usage: BTreeMap<u64, u32>,
    /// CRC chain seed at the first record of each live record sector.
    chain_seed: BTreeMap<u64, u32>,
    bitmap_bytes: usize,
}

impl Journal {
    pub fn new(len: u64, sector_size: u64, slot_count: usize, bitmap_bytes: usize) -> Self {
        Self {
            len,
            sector_size,
            used_start: sector_size,
            next_free: sector_size,
            crc32_last: 0,
            empty: true,
            start_dirty: false,
            buffer: vec![0u8; len as usize],
            slots: (0..slot_count).map(|_| SectorSlot::new()).collect(),
            cur_slot: 0,
            trim_wanted: 0,
            sector_usage: BTreeMap::new(),
            chain_seed: BTreeMap::new(),
            bitmap_bytes,
        }
    }

    pub fn bitmap_bytes(&self) -> usize {
        self.bitmap_bytes
    }

    /// First usable ring offset (sector 0 is the START sector).
    fn ring_first(&self) -> u64 {
        self.sector_size
    }

    fn ring_len(&self) -> u64 {
        self.len - self.sector_size
    }

    /// Distance of `offset` from `used_start` in ring order.
    fn ring_dist(&self, offset: u64) -> u64 {
        let from = self.used_start - self.sector_size;
        let to = offset - self.sector_size;
        (to + self.ring_len() - from) % self.ring_len()
    }

    /// Free ring bytes.
    pub fn free_bytes(&self) -> u64 {
        if self.empty {
            self.ring_len()
        } else if self.next_free >= self.used_start {
            (self.len - self.next_free) + (self.used_start - self.ring_first())
        } else {
            self.used_start - self.next_free
        }
    }

    /// Largest contiguous free run.
    fn max_contiguous(&self) -> u64 {
        if self.empty {
            self.ring_len()
        } else if self.next_free >= self.used_start {
            (self.len - self.next_free).max(self.used_start - self.ring_first())
        } else {
            self.used_start - self.next_free
        }
    }

    /// Will `entries` records of `entry_size` bytes plus `data_len` payload
    /// bytes fit without overrunning `used_start`? Conservative: assumes
    /// every record forces a sector switch.
    pub fn check_available(
        &self,
        entries: usize,
        entry_size: usize,
        data_len: u64,
    ) -> std::result::Result<(), JournalWait> {
        debug_assert!(entry_size as u64 <= self.sector_size);
        let data_sectors = data_len.div_ceil(self.sector_size);
        let need = (entries as u64 + data_sectors + 1) * self.sector_size;
        if self.free_bytes() < need
            || self.max_contiguous() < (data_sectors + 1) * self.sector_size
        {
            return Err(JournalWait::Space(self.used_start));
        }
        Ok(())
    }

    /// Allocate `bytes` contiguous ring bytes (whole sectors), wrapping if
    /// needed. Callers must have passed `check_available`.
    fn alloc(&mut self, bytes: u64) -> Option<u64> {
        debug_assert_eq!(bytes % self.sector_size, 0);
        if self.empty {
            // used_start == next_free; continue from there, or wrap the
            // whole empty ring back to its first sector. A wrap moves
            // used_start, so the START sector must be rewritten before
            // the next fsync makes anything at the new position durable.
            let at = if self.next_free + bytes <= self.len {
                self.next_free
            } else {
                self.used_start = self.ring_first();
                self.start_dirty = true;
                self.ring_first()
            };
            if at + bytes > self.len {
                return None;
            }
            self.empty = false;
            self.next_free = at + bytes;
            return Some(at);
        }
        if self.next_free >= self.used_start {
            if self.next_free + bytes <= self.len {
                let at = self.next_free;
                self.next_free += bytes;
                return Some(at);
            }
            // Wrap: the tail is left unused.
            if self.ring_first() + bytes < self.used_start {
                let at = self.ring_first();
                self.next_free = at + bytes;
                return Some(at);
            }
            None
        } else if self.next_free + bytes < self.used_start {
            let at = self.next_free;
            self.next_free += bytes;
            Some(at)
        } else {
            None
        }
    }

    /// Whether the next sector buffer cannot be taken yet.
    pub fn next_slot_busy(&self) -> bool {
        let next = (self.cur_slot + 1) % self.slots.len();
        self.slots[next].flush_count > 0 || self.slots[next].dirty
    }

    /// Consecutive free sector buffers starting at the slot a sector
    /// switch would take next. Formatting `n` records can switch at most
    /// `n` sectors, so a caller needing `n` switches checks `n <= run`.
    pub fn free_slot_run(&self) -> usize {
        let mut run = 0;
        for step in 1..=self.slots.len() {
            let slot = &self.slots[(self.cur_slot + step) % self.slots.len()];
            if slot.flush_count > 0 || slot.dirty {
                break;
            }
            run += 1;
        }
        run
    }

    /// Make sure the current sector can take `size` more record bytes,
    /// advancing to a fresh sector when it cannot.
    fn make_room(&mut self, size: usize) -> std::result::Result<(), JournalWait> {
        let needs_switch = {
            let slot = &self.slots[self.cur_slot];
            slot.offset == UNASSIGNED || slot.fill + size > self.sector_size as usize
        };
        if !needs_switch {
            return Ok(());
        }
        let next = if self.slots[self.cur_slot].offset == UNASSIGNED {
            self.cur_slot
        } else {
            (self.cur_slot + 1) % self.slots.len()
        };
        if self.slots[next].flush_count > 0 || self.slots[next].dirty {
            return Err(JournalWait::Buffer);
        }
        let at = self
            .alloc(self.sector_size)
            .ok_or(JournalWait::Space(self.used_start))?;
        self.buffer[at as usize..(at + self.sector_size) as usize].fill(0);
        self.chain_seed.insert(at, self.crc32_last);
        let slot = &mut self.slots[next];
        slot.offset = at;
        slot.fill = 0;
        slot.dirty = false;
        self.cur_slot = next;
        Ok(())
    }

    /// Ensure the current sector can hold a record of `size` bytes without
    /// any further allocation. Dispatchers reserve record room *before*
    /// placing payload bytes, because the record embeds the payload's
    /// journal offset.
    pub fn reserve_record(&mut self, size: usize) -> std::result::Result<(), JournalWait> {
        self.make_room(size)
    }

    /// Format a record into the current sector (advancing sectors as
    /// needed). Returns the offset of the sector holding the record.
    pub fn push_record(&mut self, body: &RecordBody) -> std::result::Result<u64, JournalWait> {
        let size = body.size(self.bitmap_bytes);
        self.make_room(size)?;
        let (bytes, crc) = encode_record(body, self.crc32_last, self.bitmap_bytes);
        let slot = &mut self.slots[self.cur_slot];
        let pos = slot.offset as usize + slot.fill;
        self.buffer[pos..pos + size].copy_from_slice(&bytes);
        slot.fill += size;
        slot.dirty = true;
        self.crc32_last = crc;
        Ok(slot.offset)
    }

    /// Allocate whole sectors for a small-write payload and copy the bytes
    /// into the journal image. Returns the payload's journal offset.
    pub fn push_data(&mut self, data: &[u8]) -> std::result::Result<u64, JournalWait> {
        let padded = (data.len() as u64).div_ceil(self.sector_size) * self.sector_size;
        let at = self
            .alloc(padded)
            .ok_or(JournalWait::Space(self.used_start))?;
        let start = at as usize;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        self.buffer[start + data.len()..start + padded as usize].fill(0);
        Ok(at)
    }

    /// Submit a write of the given slot's sector. Ring-full returns false.
    #[must_use]
    pub fn submit_sector(
        &mut self,
        slot_idx: usize,
        ring: &mut IoRing,
        owner: Owner,
        tag: u32,
    ) -> bool {
        let (offset, sector) = {
            let slot = &self.slots[slot_idx];
            debug_assert!(slot.offset != UNASSIGNED);
            (slot.offset, self.sector_size as usize)
        };
        let mut buf = AlignedBuffer::new(sector, sector);
        buf.copy_from(&self.buffer[offset as usize..offset as usize + sector]);
        if !ring.push_write(Target::Journal, offset, buf, owner, tag) {
            return false;
        }
        let slot = &mut self.slots[slot_idx];
        slot.dirty = false;
        slot.flush_count += 1;
        true
    }

    /// Submit a write of a payload range previously placed by `push_data`.
    #[must_use]
    pub fn submit_data(
        &mut self,
        offset: u64,
        len: usize,
        ring: &mut IoRing,
        owner: Owner,
        tag: u32,
    ) -> bool {
        let padded = (len as u64).div_ceil(self.sector_size) * self.sector_size;
        let mut buf = AlignedBuffer::new(padded as usize, self.sector_size as usize);
        buf.copy_from(&self.buffer[offset as usize..offset as usize + padded as usize]);
        ring.push_write(Target::Journal, offset, buf, owner, tag)
    }

    /// A sector write completed.
    pub fn sector_write_done(&mut self, slot_idx: usize) {
        let slot = &mut self.slots[slot_idx];
        debug_assert!(slot.flush_count > 0);
        slot.flush_count -= 1;
    }

    /// A dirty entry now relies on the record sector at `offset`.
    pub fn sector_ref(&mut self, offset: u64) {
        *self.sector_usage.entry(offset).or_insert(0) += 1;
    }

    /// A dirty entry at `offset` was erased or rolled back.
    pub fn sector_unref(&mut self, offset: u64) {
        match self.sector_usage.get_mut(&offset) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.sector_usage.remove(&offset);
            }
            None => debug_assert!(false, "unref of unreferenced sector {offset:#x}"),
        }
    }

    /// Dirty-entry references on a sector (for invariant checks).
    pub fn sector_usage_count(&self, offset: u64) -> u32 {
        self.sector_usage.get(&offset).copied().unwrap_or(0)
    }

    /// Where `used_start` could advance to: the oldest position still
    /// pinned by a dirty-entry reference or an active sector buffer, or
    /// `next_free` when nothing is pinned.
    pub fn trim_target(&self) -> u64 {
        let mut best: Option<(u64, u64)> = None;
        let mut consider = |journal: &Self, offset: u64| {
            let dist = journal.ring_dist(offset);
            if best.map_or(true, |(d, _)| dist < d) {
                best = Some((dist, offset));
            }
        };
        for &offset in self.sector_usage.keys() {
            consider(self, offset);
        }
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.offset == UNASSIGNED {
                continue;
            }
            if slot.dirty || slot.flush_count > 0 || idx == self.cur_slot {
                consider(self, slot.offset);
            }
        }
        best.map_or(self.next_free, |(_, offset)| offset)
    }

    /// Apply a trim decided (and made durable via a START rewrite) by the
    /// flusher. Frees ring space and prunes per-sector chain seeds.
    pub fn apply_trim(&mut self, target: u64) {
        self.start_dirty = false;
        if target == self.next_free && self.sector_usage.is_empty() {
            self.used_start = target;
            self.empty = true;
            self.chain_seed.clear();
            return;
        }
        self.used_start = target;
        let used = if self.next_free >= self.used_start {
            self.next_free - self.used_start
        } else {
            self.ring_len() - (self.used_start - self.next_free)
        };
        let keep: Vec<u64> = self
            .chain_seed
            .keys()
            .copied()
            .filter(|&off| self.ring_dist(off) < used.max(1))
            .collect();
        self.chain_seed.retain(|off, _| keep.contains(off));
    }

    /// The chain seed a replay starting at `target` must use.
    pub fn seed_for(&self, target: u64) -> u32 {
        if target == self.next_free {
            self.crc32_last
        } else {
            self.chain_seed.get(&target).copied().unwrap_or(0)
        }
    }

    /// Build the START sector content for the given `used_start`.
    pub fn encode_start_sector(&self, journal_start: u64, crc32_begin: u32) -> AlignedBuffer {
        let body = RecordBody::Start {
            journal_start,
            crc32_begin,
        };
        let (bytes, _) = encode_record(&body, 0, self.bitmap_bytes);
        let mut buf = AlignedBuffer::new(self.sector_size as usize, self.sector_size as usize);
        buf.copy_from(&bytes);
        buf
    }

    /// Restore ring bookkeeping after replay (recovery only).
    pub fn recover_state(
        &mut self,
        used_start: u64,
        next_free: u64,
        crc32_last: u32,
        empty: bool,
        chain_seed: BTreeMap<u64, u32>,
    ) {
        self.used_start = used_start;
        self.next_free = next_free;
        self.crc32_last = crc32_last;
        self.empty = empty;
        self.chain_seed = chain_seed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockvault_common::ObjectId;

    const SECTOR: u64 = 512;

    fn test_journal() -> Journal {
        // 16 sectors of 512 B, 4 slots, 4-byte bitmaps.
        Journal::new(16 * SECTOR, SECTOR, 4, 4)
    }

    fn ov(stripe: u64, version: u64) -> ObjectVersion {
        ObjectVersion::new(ObjectId::new(1, stripe), version)
    }

    #[test]
    fn test_record_roundtrip_chained() {
        let body = RecordBody::BigWrite {
            ov: ov(0, 3),
            offset: 0,
            len: 131072,
            location: 17,
            ext_bitmap: vec![0xFF; 4],
            instant: false,
        };
        let (bytes, crc) = encode_record(&body, 0xDEAD_BEEF, 4);
        let (decoded, size, decoded_crc) = decode_record(&bytes, 0xDEAD_BEEF, 4).unwrap();
        assert_eq!(decoded, body);
        assert_eq!(size, bytes.len());
        assert_eq!(decoded_crc, crc);

        // Wrong chain seed fails.
        assert!(decode_record(&bytes, 0, 4).is_none());
    }

    #[test]
    fn test_stable_record_roundtrip() {
        let body = RecordBody::Stable {
            versions: vec![ov(0, 1), ov(131072, 2)],
        };
        let (bytes, _) = encode_record(&body, 7, 4);
        let (decoded, _, _) = decode_record(&bytes, 7, 4).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_records_pack_into_sector() {
        let mut journal = test_journal();
        let first = journal
            .push_record(&RecordBody::Delete { ov: ov(0, 1) })
            .unwrap();
        let second = journal
            .push_record(&RecordBody::Delete { ov: ov(0, 2) })
            .unwrap();
        // Both 36-byte records fit in one 512-byte sector.
        assert_eq!(first, second);
        assert_eq!(journal.slots[journal.cur_slot].fill, 72);

        // Decode both back from the image, chained.
        let at = first as usize;
        let (r1, s1, crc1) = decode_record(&journal.buffer[at..], 0, 4).unwrap();
        assert_eq!(r1, RecordBody::Delete { ov: ov(0, 1) });
        let (r2, _, _) = decode_record(&journal.buffer[at + s1..], crc1, 4).unwrap();
        assert_eq!(r2, RecordBody::Delete { ov: ov(0, 2) });
    }

    #[test]
    fn test_sector_switch_on_overflow() {
        let mut journal = test_journal();
        // 14 delete records of 36 bytes each: 504 bytes fit, the 15th
        // forces a new sector.
        let mut sectors = std::collections::BTreeSet::new();
        for version in 1..=15 {
            sectors.insert(
                journal
                    .push_record(&RecordBody::Delete { ov: ov(0, version) })
                    .unwrap(),
            );
        }
        assert_eq!(sectors.len(), 2);
    }

    #[test]
    fn test_data_placed_after_record_sector() {
        let mut journal = test_journal();
        let sector = journal
            .push_record(&RecordBody::Delete { ov: ov(0, 1) })
            .unwrap();
        let data = vec![0xCD; 600];
        let at = journal.push_data(&data).unwrap();
        assert_eq!(at, sector + SECTOR);
        assert_eq!(
            &journal.buffer[at as usize..at as usize + 600],
            &data[..]
        );
        // Padded to whole sectors.
        assert_eq!(journal.next_free, at + 2 * SECTOR);
    }

    #[test]
    fn test_space_check_parks_when_full() {
        let mut journal = test_journal();
        journal.check_available(1, 36, 0).unwrap();
        // Consume nearly everything: 12 sectors of payload.
        journal.push_record(&RecordBody::Delete { ov: ov(0, 1) }).unwrap();
        journal.sector_ref(journal.slots[journal.cur_slot].offset);
        journal.push_data(&vec![0u8; 11 * SECTOR as usize]).unwrap();
        match journal.check_available(2, 36, SECTOR) {
            Err(JournalWait::Space(us)) => assert_eq!(us, journal.used_start),
            other => panic!("expected space wait, got {other:?}"),
        }
    }

    #[test]
    fn test_trim_and_wrap() {
        let mut journal = test_journal();
        let first = journal
            .push_record(&RecordBody::Delete { ov: ov(0, 1) })
            .unwrap();
        journal.sector_ref(first);
        journal.push_data(&vec![1u8; 6 * SECTOR as usize]).unwrap();

        // Everything still pinned by the record sector.
        assert_eq!(journal.trim_target(), first);

        journal.sector_unref(first);
        // The active slot still pins its own sector.
        assert_eq!(journal.trim_target(), first);

        // Pretend the slot was flushed and rotated away.
        journal.slots[journal.cur_slot].dirty = false;
        let target = journal.next_free;
        journal.cur_slot = (journal.cur_slot + 1) % journal.slots.len();
        assert_eq!(journal.trim_target(), target);
        journal.apply_trim(target);
        assert!(journal.empty);
        assert_eq!(journal.free_bytes(), journal.len - SECTOR);

        // Allocation after a full trim restarts cleanly.
        let next = journal
            .push_record(&RecordBody::Delete { ov: ov(0, 2) })
            .unwrap();
        assert_eq!(next, journal.used_start);
    }

    #[test]
    fn test_alloc_wraps_around_tail() {
        let mut journal = test_journal();
        // Fill sectors 1..13 (13 sectors): record sector + 12 data sectors.
        let first = journal
            .push_record(&RecordBody::Delete { ov: ov(0, 1) })
            .unwrap();
        journal.sector_ref(first);
        journal.push_data(&vec![0u8; 12 * SECTOR as usize]).unwrap();
        assert_eq!(journal.next_free, 14 * SECTOR);

        // Free everything up to sector 8.
        journal.sector_unref(first);
        journal.slots[journal.cur_slot].dirty = false;
        journal.cur_slot = (journal.cur_slot + 1) % journal.slots.len();
        journal.apply_trim(8 * SECTOR);

        // A 3-sector run does not fit the 2-sector tail; it wraps.
        let at = journal.push_data(&vec![0u8; 3 * SECTOR as usize]).unwrap();
        assert_eq!(at, SECTOR);
        assert_eq!(journal.next_free, 4 * SECTOR);
        assert!(journal.next_free < journal.used_start);
    }

    #[test]
    fn test_empty_wrap_resets_used_start() {
        let mut journal = test_journal();
        // Drive next_free to the very end while empty.
        journal.used_start = 16 * SECTOR;
        journal.next_free = 16 * SECTOR;
        journal.empty = true;
        let s = journal
            .push_record(&RecordBody::Delete { ov: ov(0, 1) })
            .unwrap();
        assert_eq!(s, SECTOR);
        assert_eq!(journal.used_start, SECTOR);
        assert!(journal.start_dirty);
    }

    #[test]
    fn test_usage_counting() {
        let mut journal = test_journal();
        let s = journal
            .push_record(&RecordBody::Delete { ov: ov(0, 1) })
            .unwrap();
        journal.sector_ref(s);
        journal.sector_ref(s);
        assert_eq!(journal.sector_usage_count(s), 2);
        journal.sector_unref(s);
        assert_eq!(journal.sector_usage_count(s), 1);
        journal.sector_unref(s);
        assert_eq!(journal.sector_usage_count(s), 0);
    }
}
