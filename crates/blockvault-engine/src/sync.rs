//! Sync state machine.
//!
//! A SYNC captures the current unsynced big and small writes and walks:
//!
//! ```text
//! HAS_BIG   -> DATA_FSYNC_SENT -> DATA_FSYNC_DONE ->
//!              write BIG_WRITE records -> JOURNAL_FSYNC_SENT -> DONE
//! HAS_SMALL -> JOURNAL_FSYNC_SENT -> DONE
//! ```
//!
//! Data-region bytes of big writes are durable before any BIG_WRITE
//! record is written — that ordering is what makes the record safe to
//! replay as an authoritative reference to the data block. Concurrent
//! syncs form a chain: completion callbacks fire in FIFO order.

use crate::engine::{
    Dispatch, Engine, TAG_DATA_FSYNC, TAG_JOURNAL_FSYNC, TAG_SECTOR_BASE,
};
use crate::index::Stage;
use crate::journal::RecordBody;
use crate::op::{MachineState, Operation, SyncMachine, SyncStage, WaitReason};
use crate::ring::{Owner, Target};
use tracing::debug;

impl Engine {
    /// Dispatch a SYNC. The operation stays in the submit queue (`Keep`)
    /// until it is acknowledged through the FIFO chain.
    pub(crate) fn dequeue_sync(&mut self, id: u64, op: &mut Operation) -> Dispatch {
        if op.pending_ios > 0 {
            return Dispatch::Keep;
        }
        if matches!(op.state, MachineState::None) {
            // Capture the unsynced sets and join the chain.
            let big = std::mem::take(&mut self.unsynced_big);
            let small = std::mem::take(&mut self.unsynced_small);
            let machine = SyncMachine {
                stage: SyncStage::Start,
                big,
                small,
                prev_sync_count: self.in_progress_syncs.len(),
            };
            op.state = MachineState::Sync(machine);
            self.in_progress_syncs.push(id);
        }

        let stage = match &op.state {
            MachineState::Sync(machine) => machine.stage,
            _ => unreachable!(),
        };
        match stage {
            SyncStage::Start => self.sync_start(id, op),
            SyncStage::DataSyncDone => self.sync_write_big_records(id, op),
            SyncStage::DataSyncSent | SyncStage::JournalSyncSent => Dispatch::Keep,
            SyncStage::Done => {
                // Complete only from the front of the chain: FIFO
                // durability acknowledgement.
                if self.in_progress_syncs.first() == Some(&id) {
                    if let MachineState::Sync(machine) = &op.state {
                        debug_assert_eq!(machine.prev_sync_count, 0);
                    }
                    self.in_progress_syncs.remove(0);
                    for &later in &self.in_progress_syncs {
                        if let Some(MachineState::Sync(sync)) =
                            self.ops.get_mut(&later).map(|later_op| &mut later_op.state)
                        {
                            sync.prev_sync_count = sync.prev_sync_count.saturating_sub(1);
                        }
                    }
                    op.retval = 0;
                    // Subsequent syncs may have been done already.
                    self.ack_syncs();
                    return Dispatch::Done;
                }
                Dispatch::Keep
            }
        }
    }

    fn sync_start(&mut self, id: u64, op: &mut Operation) -> Dispatch {
        let MachineState::Sync(machine) = &mut op.state else {
            unreachable!()
        };
        if !machine.big.is_empty() {
            // 1st step: fsync the data device.
            if self.ring.space_left() < 1 {
                return self.park(op, WaitReason::Sqe(1));
            }
            let pushed = self
                .ring
                .push_fsync(Target::Data, Owner::Op(id), TAG_DATA_FSYNC);
            debug_assert!(pushed);
            let MachineState::Sync(machine) = &mut op.state else {
                unreachable!()
            };
            machine.stage = SyncStage::DataSyncSent;
            op.pending_ios = 1;
            Dispatch::Keep
        } else if !machine.small.is_empty() || self.journal.start_dirty {
            // No big writes: just make the journal durable.
            let sqes = if self.journal.start_dirty { 2 } else { 1 };
            if self.ring.space_left() < sqes {
                return self.park(op, WaitReason::Sqe(sqes));
            }
            op.pending_ios = self.submit_start_rewrite(id);
            let pushed = self
                .ring
                .push_fsync(Target::Journal, Owner::Op(id), TAG_JOURNAL_FSYNC);
            debug_assert!(pushed);
            op.pending_ios += 1;
            let MachineState::Sync(machine) = &mut op.state else {
                unreachable!()
            };
            machine.stage = SyncStage::JournalSyncSent;
            Dispatch::Keep
        } else {
            // Nothing to sync; completes through the chain front check.
            let MachineState::Sync(machine) = &mut op.state else {
                unreachable!()
            };
            machine.stage = SyncStage::Done;
            self.dequeue_sync(id, op)
        }
    }

    /// Data fsync done: write one BIG_WRITE record per captured big write,
    /// submit the touched journal sectors, then the journal fsync.
    fn sync_write_big_records(&mut self, id: u64, op: &mut Operation) -> Dispatch {
        let big = match &op.state {
            MachineState::Sync(machine) => machine.big.clone(),
            _ => unreachable!(),
        };
        let record_size = RecordBody::BigWrite {
            ov: big[0],
            offset: 0,
            len: 0,
            location: 0,
            ext_bitmap: Vec::new(),
            instant: false,
        }
        .size(self.cfg.bitmap_bytes());
        let count = big.len();

        if let Err(wait) = self.journal.check_available(count, record_size, 0) {
            return self.park_journal(op, wait);
        }
        // Worst case every record lands in a fresh sector; make sure that
        // many sector buffers are available before formatting anything.
        if count > self.journal.free_slot_run() {
            return self.park(op, WaitReason::JournalBuffer);
        }
        // Sector writes + fsync + possible START rewrite.
        let sqes = count + 2;
        if self.ring.space_left() < sqes {
            return self.park(op, WaitReason::Sqe(sqes));
        }

        let mut touched: Vec<usize> = Vec::new();
        for ov in &big {
            let entry = &self.dirty_db[ov];
            let record = RecordBody::BigWrite {
                ov: *ov,
                offset: entry.offset,
                len: entry.len,
                location: entry.location,
                ext_bitmap: entry.ext_bitmap.clone(),
                instant: entry.state.stable,
            };
            // Space and buffers were pre-checked; a failure here would
            // leave half-formatted records behind.
            let sector = self
                .journal
                .push_record(&record)
                .expect("journal space and buffers were checked");
            let entry = self.dirty_db.get_mut(ov).unwrap();
            entry.journal_sector = Some(sector);
            self.journal.sector_ref(sector);
            if touched.last() != Some(&self.journal.cur_slot) {
                touched.push(self.journal.cur_slot);
            }
        }
        let mut pending = 0u32;
        for slot in touched {
            let pushed = self.journal.submit_sector(
                slot,
                &mut self.ring,
                Owner::Op(id),
                TAG_SECTOR_BASE + slot as u32,
            );
            debug_assert!(pushed);
            pending += 1;
        }
        pending += self.submit_start_rewrite(id);
        let pushed = self
            .ring
            .push_fsync(Target::Journal, Owner::Op(id), TAG_JOURNAL_FSYNC);
        debug_assert!(pushed);
        pending += 1;

        op.pending_ios = pending;
        let MachineState::Sync(machine) = &mut op.state else {
            unreachable!()
        };
        machine.stage = SyncStage::JournalSyncSent;
        debug!(big = big.len(), "big-write records journaled");
        Dispatch::Keep
    }

    /// All submissions of the current sync step completed.
    pub(crate) fn sync_io_done(&mut self, id: u64, mut op: Operation) {
        let MachineState::Sync(machine) = &mut op.state else {
            unreachable!()
        };
        match machine.stage {
            SyncStage::DataSyncSent => {
                machine.stage = SyncStage::DataSyncDone;
                for ov in machine.big.clone() {
                    if let Some(entry) = self.dirty_db.get_mut(&ov) {
                        entry.state.stage = Stage::DataSynced;
                    }
                }
                self.ops.insert(id, op);
            }
            SyncStage::JournalSyncSent => {
                machine.stage = SyncStage::Done;
                let big = machine.big.clone();
                let small = machine.small.clone();
                for ov in big {
                    if let Some(entry) = self.dirty_db.get_mut(&ov) {
                        entry.state.stage = Stage::MetaSynced;
                        if entry.state.stable {
                            self.flusher.request_flush(ov.oid);
                        }
                    }
                }
                for ov in small {
                    if let Some(entry) = self.dirty_db.get_mut(&ov) {
                        entry.state.stage = Stage::JournalSynced;
                        if entry.state.stable {
                            self.flusher.request_flush(ov.oid);
                        }
                    }
                }
                self.ops.insert(id, op);
                self.ack_syncs();
            }
            _ => self.fatal("unexpected sync op state"),
        }
    }
}
