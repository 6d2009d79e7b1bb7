//! Write and delete state machines.
//!
//! `enqueue_write` classifies the write, assigns its version, and creates
//! the dirty entry; `dequeue_write` runs in the loop's produce phase and
//! submits the I/O. A big (aligned, full-block) write goes straight to a
//! freshly allocated data block — its journal record is deferred to the
//! sync step, because the record's durability ordering requires the data
//! fsync to come first. A small write places its bytes inline in the
//! journal; a delete formats a tombstone record.

use crate::engine::{
    Dispatch, Engine, TAG_DATA_WRITE, TAG_JOURNAL_DATA, TAG_SECTOR_BASE,
};
use crate::index::{latest_version, DirtyEntry, DirtyState, Stage, WriteKind};
use crate::journal::{JournalWait, RecordBody};
use crate::op::{MachineState, OpKind, Operation, WaitReason, WriteMachine, WriteStage};
use crate::raw_io::AlignedBuffer;
use crate::ring::{Owner, Target};
use blockvault_common::{Error, ObjectVersion, Result};
use tracing::debug;

impl Engine {
    /// Create the dirty entry for a write/delete and assign its version.
    /// Runs synchronously at enqueue time; the entry is born `InFlight`.
    pub(crate) fn enqueue_write(&mut self, op: &mut Operation) -> Result<()> {
        let (oid, requested, offset, len, stable, ext_bitmap) = match &mut op.kind {
            OpKind::Write {
                oid,
                version,
                offset,
                len,
                stable,
                ext_bitmap,
                ..
            } => (*oid, version, *offset, *len, *stable, ext_bitmap.take()),
            OpKind::Delete { oid, version } => (*oid, version, 0, 0, false, None),
            _ => unreachable!(),
        };

        let latest = latest_version(&self.clean_db, &self.dirty_db, oid);
        let version = if *requested == 0 {
            latest + 1
        } else if *requested != latest + 1 {
            return Err(Error::VersionExists(format!(
                "{oid} at version {latest}, got {}",
                *requested
            )));
        } else {
            *requested
        };
        *requested = version;
        op.version = version;

        let kind = match &op.kind {
            OpKind::Delete { .. } => WriteKind::Delete,
            _ if offset == 0 && len == self.cfg.block_size => WriteKind::Big,
            _ => WriteKind::Small,
        };
        let ov = ObjectVersion::new(oid, version);
        let mut state = DirtyState::new(kind);
        state.stable = stable || kind == WriteKind::Delete;
        self.dirty_db.insert(
            ov,
            DirtyEntry {
                state,
                location: u64::MAX,
                offset,
                len,
                journal_sector: None,
                ext_bitmap: ext_bitmap.unwrap_or_else(|| vec![0; self.cfg.bitmap_bytes()]),
            },
        );
        op.state = MachineState::Write(WriteMachine {
            stage: WriteStage::Pending,
            ov,
        });
        Ok(())
    }

    /// Submit the I/O for a queued write. Returns `Parked` when a
    /// resource is missing, `InFlight` once everything is submitted, or
    /// `Done` on an unrecoverable argument-level failure.
    pub(crate) fn dequeue_write(&mut self, id: u64, op: &mut Operation) -> Dispatch {
        let ov = match &op.state {
            MachineState::Write(machine) => machine.ov,
            _ => unreachable!(),
        };
        let kind = self.dirty_db[&ov].state.kind;
        match kind {
            WriteKind::Big => self.dequeue_big_write(id, op, ov),
            WriteKind::Small => self.dequeue_small_write(id, op, ov),
            WriteKind::Delete => self.dequeue_delete(id, op, ov),
        }
    }

    fn dequeue_big_write(&mut self, id: u64, op: &mut Operation, ov: ObjectVersion) -> Dispatch {
        if self.dirty_db[&ov].location == u64::MAX {
            match self.alloc.allocate() {
                Some(block) => {
                    self.dirty_db.get_mut(&ov).unwrap().location = block;
                }
                None if self.flusher.is_active() => {
                    return self.park(op, WaitReason::Free);
                }
                None => {
                    // Permanently out of space.
                    self.dirty_db.remove(&ov);
                    op.retval = Error::NoSpace.errno();
                    return Dispatch::Done;
                }
            }
        }
        if self.ring.space_left() < 1 {
            return self.park(op, WaitReason::Sqe(1));
        }
        let entry = self.dirty_db.get_mut(&ov).unwrap();
        let block = entry.location;
        let OpKind::Write { data, .. } = &op.kind else {
            unreachable!()
        };
        let mut buf = AlignedBuffer::new(
            self.cfg.block_size as usize,
            self.cfg.disk_alignment as usize,
        );
        buf.copy_from(data);
        let offset = block * u64::from(self.cfg.block_size);
        if !self
            .ring
            .push_write(Target::Data, offset, buf, Owner::Op(id), TAG_DATA_WRITE)
        {
            return self.park(op, WaitReason::Sqe(1));
        }
        entry.state.stage = Stage::Submitted;
        self.set_write_submitted(op);
        debug!(%ov, block, "big write submitted");
        Dispatch::InFlight
    }

    fn dequeue_small_write(&mut self, id: u64, op: &mut Operation, ov: ObjectVersion) -> Dispatch {
        let OpKind::Write { data, offset, len, .. } = &op.kind else {
            unreachable!()
        };
        let (offset, len) = (*offset, *len);
        let entry_size = RecordBody::SmallWrite {
            ov,
            offset,
            len,
            data_offset: 0,
            data_crc32: 0,
            ext_bitmap: Vec::new(),
            instant: false,
        }
        .size(self.cfg.bitmap_bytes());

        if let Err(wait) = self.journal.check_available(1, entry_size, u64::from(len)) {
            return self.park_journal(op, wait);
        }
        // Record room must exist before the payload is placed: the record
        // embeds the payload's journal offset.
        if let Err(wait) = self.journal.reserve_record(entry_size) {
            return self.park_journal(op, wait);
        }
        // Sector write + payload write (+ a START rewrite after a wrap).
        let sqes = if self.journal.start_dirty { 3 } else { 2 };
        if self.ring.space_left() < sqes {
            return self.park(op, WaitReason::Sqe(sqes));
        }

        let data_bytes = data.clone();
        let data_offset = match self.journal.push_data(&data_bytes) {
            Ok(at) => at,
            Err(wait) => return self.park_journal(op, wait),
        };
        let entry = self.dirty_db.get_mut(&ov).unwrap();
        let record = RecordBody::SmallWrite {
            ov,
            offset,
            len,
            data_offset,
            data_crc32: crc32c::crc32c(&data_bytes),
            ext_bitmap: entry.ext_bitmap.clone(),
            instant: entry.state.stable,
        };
        let sector = self
            .journal
            .push_record(&record)
            .expect("record room reserved");
        entry.location = data_offset;
        entry.journal_sector = Some(sector);
        entry.state.stage = Stage::Submitted;
        self.journal.sector_ref(sector);

        let slot = self.journal.cur_slot;
        let submitted = self.journal.submit_sector(
            slot,
            &mut self.ring,
            Owner::Op(id),
            TAG_SECTOR_BASE + slot as u32,
        ) && self.journal.submit_data(
            data_offset,
            len as usize,
            &mut self.ring,
            Owner::Op(id),
            TAG_JOURNAL_DATA,
        );
        debug_assert!(submitted, "ring space was checked");
        op.pending_ios = 2;
        op.pending_ios += self.submit_start_rewrite(id);
        self.set_write_submitted(op);
        debug!(%ov, data_offset, "small write journaled");
        Dispatch::InFlight
    }

    fn dequeue_delete(&mut self, id: u64, op: &mut Operation, ov: ObjectVersion) -> Dispatch {
        let entry_size = RecordBody::Delete { ov }.size(self.cfg.bitmap_bytes());
        if let Err(wait) = self.journal.check_available(1, entry_size, 0) {
            return self.park_journal(op, wait);
        }
        if let Err(wait) = self.journal.reserve_record(entry_size) {
            return self.park_journal(op, wait);
        }
        let sqes = if self.journal.start_dirty { 2 } else { 1 };
        if self.ring.space_left() < sqes {
            return self.park(op, WaitReason::Sqe(sqes));
        }
        let sector = self
            .journal
            .push_record(&RecordBody::Delete { ov })
            .expect("record room reserved");
        let entry = self.dirty_db.get_mut(&ov).unwrap();
        entry.journal_sector = Some(sector);
        entry.state.stage = Stage::Submitted;
        self.journal.sector_ref(sector);

        let slot = self.journal.cur_slot;
        let submitted = self.journal.submit_sector(
            slot,
            &mut self.ring,
            Owner::Op(id),
            TAG_SECTOR_BASE + slot as u32,
        );
        debug_assert!(submitted, "ring space was checked");
        op.pending_ios = 1;
        op.pending_ios += self.submit_start_rewrite(id);
        self.set_write_submitted(op);
        Dispatch::InFlight
    }

    fn set_write_submitted(&mut self, op: &mut Operation) {
        if let MachineState::Write(machine) = &mut op.state {
            machine.stage = WriteStage::Submitted;
        }
        if op.pending_ios == 0 {
            op.pending_ios = 1;
        }
    }

    pub(crate) fn park_journal(&mut self, op: &mut Operation, wait: JournalWait) -> Dispatch {
        match wait {
            JournalWait::Space(used_start) => self.park(op, WaitReason::Journal(used_start)),
            JournalWait::Buffer => self.park(op, WaitReason::JournalBuffer),
        }
    }

    /// All of a write's submissions completed: the entry is `Written`,
    /// becomes visible to reads and joins the unsynced set; the operation
    /// is acknowledged.
    pub(crate) fn write_persisted(&mut self, mut op: Operation) {
        let ov = match &op.state {
            MachineState::Write(machine) => {
                debug_assert_eq!(machine.stage, WriteStage::Submitted);
                machine.ov
            }
            _ => unreachable!(),
        };
        let entry = self
            .dirty_db
            .get_mut(&ov)
            .expect("written entry still dirty");
        entry.state.stage = Stage::Written;
        let kind = entry.state.kind;
        let born_stable = entry.state.stable;
        match kind {
            WriteKind::Big => self.unsynced_big.push(ov),
            WriteKind::Small | WriteKind::Delete => self.unsynced_small.push(ov),
        }
        if !born_stable {
            let latest = self.unstable_writes.entry(ov.oid).or_insert(0);
            *latest = (*latest).max(ov.version);
        }
        op.retval = match &op.kind {
            OpKind::Write { len, .. } => i64::from(*len),
            _ => 0,
        };
        let auto_commit = match kind {
            WriteKind::Big => self.cfg.immediate_commit.covers_big(),
            WriteKind::Small | WriteKind::Delete => self.cfg.immediate_commit.covers_small(),
        };
        self.finish_op(op);
        if auto_commit {
            self.enqueue_inner(Operation::sync(|_| {}), true);
        }
    }

    /// Queue a START-sector rewrite when a ring wrap moved `used_start`.
    /// Returns the number of submissions added (0 or 1).
    pub(crate) fn submit_start_rewrite(&mut self, id: u64) -> u32 {
        if !self.journal.start_dirty {
            return 0;
        }
        let buf = self
            .journal
            .encode_start_sector(self.journal.used_start, self.journal.seed_for(self.journal.used_start));
        let pushed = self.ring.push_write(
            Target::Journal,
            0,
            buf,
            Owner::Op(id),
            crate::engine::TAG_START_WRITE,
        );
        debug_assert!(pushed, "ring space was checked");
        self.journal.start_dirty = false;
        1
    }
}
