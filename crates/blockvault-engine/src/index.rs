//! In-memory object indexes.
//!
//! `clean_db` holds the stable, metadata-resident state of each object;
//! `dirty_db` holds every pending version, ordered by `(object, version)`
//! so all versions of one object are adjacent. Dirty entries traverse the
//! write state machine stage by stage, become stable (or are rolled back),
//! and are erased once the flusher has materialized them into `clean_db`.

use blockvault_common::{ObjectId, ObjectVersion};
use std::collections::BTreeMap;
use std::ops::Bound;

/// What kind of mutation a dirty entry describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteKind {
    /// Full-block write; bytes already live in a data block.
    Big,
    /// Sub-block write; bytes live inline in the journal.
    Small,
    /// Tombstone.
    Delete,
}

/// How far a dirty entry's persistence has progressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Created, nothing submitted yet.
    InFlight,
    /// Data/journal writes submitted.
    Submitted,
    /// Data persisted (write completed, not yet fsynced).
    Written,
    /// Data device fsynced (big writes only).
    DataSynced,
    /// Journal record durable (small writes and deletes).
    JournalSynced,
    /// Journal record durable and data fsynced: a big write that is ready
    /// for the flusher to materialize into the metadata region.
    MetaSynced,
}

/// Dirty-entry state: kind, persistence stage, and the stable bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirtyState {
    pub kind: WriteKind,
    pub stage: Stage,
    /// No longer revocable.
    pub stable: bool,
}

impl DirtyState {
    pub fn new(kind: WriteKind) -> Self {
        Self {
            kind,
            stage: Stage::InFlight,
            stable: false,
        }
    }

    /// Readable by the overlay read path: the entry's bytes are fully
    /// placed (on disk or in the journal image).
    pub fn is_readable(&self) -> bool {
        self.stage >= Stage::Written
    }

    /// The journal record is durable; STABLE may reference it.
    pub fn is_synced(&self) -> bool {
        self.stage >= Stage::JournalSynced
    }
}

/// A pending version of an object.
#[derive(Clone, Debug)]
pub struct DirtyEntry {
    pub state: DirtyState,
    /// Big: data block index. Small: journal offset of the payload.
    /// Delete: unused.
    pub location: u64,
    /// Byte offset of the write within the block.
    pub offset: u32,
    /// Byte length of the write.
    pub len: u32,
    /// Journal offset of the sector holding this entry's record, once
    /// assigned. Holds a usage reference on that sector until erased.
    pub journal_sector: Option<u64>,
    /// Opaque per-object bytes maintained by the layer above.
    pub ext_bitmap: Vec<u8>,
}

/// The stable, metadata-resident state of an object.
#[derive(Clone, Debug)]
pub struct CleanEntry {
    pub version: u64,
    /// Data block holding the object's bytes.
    pub block: u64,
    /// Which granularity-sized sub-ranges have ever been written.
    pub bitmap: Vec<u8>,
    /// Opaque per-object bytes maintained by the layer above.
    pub ext_bitmap: Vec<u8>,
}

pub type CleanDb = BTreeMap<ObjectId, CleanEntry>;
pub type DirtyDb = BTreeMap<ObjectVersion, DirtyEntry>;

/// Highest dirty version of `oid`, if any.
pub fn latest_dirty_version(dirty: &DirtyDb, oid: ObjectId) -> Option<u64> {
    dirty
        .range((
            Bound::Included(ObjectVersion::new(oid, 0)),
            Bound::Included(ObjectVersion::new(oid, u64::MAX)),
        ))
        .next_back()
        .map(|(ov, _)| ov.version)
}

/// Highest version of `oid` across both databases.
pub fn latest_version(clean: &CleanDb, dirty: &DirtyDb, oid: ObjectId) -> u64 {
    let clean_version = clean.get(&oid).map_or(0, |e| e.version);
    latest_dirty_version(dirty, oid)
        .unwrap_or(0)
        .max(clean_version)
}

/// All dirty versions of `oid`, ascending.
pub fn dirty_versions_of(dirty: &DirtyDb, oid: ObjectId) -> Vec<ObjectVersion> {
    dirty
        .range((
            Bound::Included(ObjectVersion::new(oid, 0)),
            Bound::Included(ObjectVersion::new(oid, u64::MAX)),
        ))
        .map(|(ov, _)| *ov)
        .collect()
}

/// Set the bitmap bits covering `[offset, offset + len)`.
pub fn bitmap_set_range(bitmap: &mut [u8], granularity: u32, offset: u32, len: u32) {
    if len == 0 {
        return;
    }
    let first = offset / granularity;
    let last = (offset + len - 1) / granularity;
    for bit in first..=last {
        bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
    }
}

/// Whether the bit covering byte `offset` is set.
pub fn bitmap_test(bitmap: &[u8], granularity: u32, offset: u32) -> bool {
    let bit = offset / granularity;
    bitmap[(bit / 8) as usize] & (1 << (bit % 8)) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(stripe: u64) -> ObjectId {
        ObjectId::new(1, stripe)
    }

    fn entry(kind: WriteKind) -> DirtyEntry {
        DirtyEntry {
            state: DirtyState::new(kind),
            location: 0,
            offset: 0,
            len: 0,
            journal_sector: None,
            ext_bitmap: Vec::new(),
        }
    }

    #[test]
    fn test_latest_version_spans_both_dbs() {
        let mut clean = CleanDb::new();
        let mut dirty = DirtyDb::new();
        assert_eq!(latest_version(&clean, &dirty, oid(0)), 0);

        clean.insert(
            oid(0),
            CleanEntry {
                version: 3,
                block: 0,
                bitmap: vec![0; 4],
                ext_bitmap: vec![0; 4],
            },
        );
        assert_eq!(latest_version(&clean, &dirty, oid(0)), 3);

        dirty.insert(ObjectVersion::new(oid(0), 5), entry(WriteKind::Small));
        dirty.insert(ObjectVersion::new(oid(0), 4), entry(WriteKind::Small));
        assert_eq!(latest_version(&clean, &dirty, oid(0)), 5);
        assert_eq!(latest_dirty_version(&dirty, oid(0)), Some(5));

        // Another object does not leak into the range.
        dirty.insert(ObjectVersion::new(oid(131072), 9), entry(WriteKind::Big));
        assert_eq!(latest_dirty_version(&dirty, oid(0)), Some(5));
    }

    #[test]
    fn test_stage_ordering() {
        let mut state = DirtyState::new(WriteKind::Big);
        assert!(!state.is_readable());
        state.stage = Stage::Written;
        assert!(state.is_readable());
        assert!(!state.is_synced());
        state.stage = Stage::JournalSynced;
        assert!(state.is_synced());
    }

    #[test]
    fn test_bitmap_ranges() {
        // 128 KiB block, 4 KiB granularity: 32 bits in 4 bytes.
        let mut bitmap = vec![0u8; 4];
        bitmap_set_range(&mut bitmap, 4096, 4096, 4096);
        assert!(!bitmap_test(&bitmap, 4096, 0));
        assert!(bitmap_test(&bitmap, 4096, 4096));
        assert!(bitmap_test(&bitmap, 4096, 8191));
        assert!(!bitmap_test(&bitmap, 4096, 8192));

        bitmap_set_range(&mut bitmap, 4096, 0, 131072);
        assert_eq!(bitmap, vec![0xFF; 4]);
    }
}
