//! Stabilize and rollback.
//!
//! The layer above writes tentatively to several replicas and commits a
//! version only once a quorum acknowledges; STABLE promotes the listed
//! versions (making them flusher-eligible), ROLLBACK discards them. Both
//! append a journal record enumerating the versions, fsync the journal,
//! and only then mutate in-memory state.

use crate::engine::{Dispatch, Engine, TAG_JOURNAL_FSYNC, TAG_SECTOR_BASE};
use crate::index::{dirty_versions_of, WriteKind};
use crate::journal::{RecordBody, RECORD_HEADER_SIZE};
use crate::op::{MachineState, OpKind, Operation, StableMachine, SyncMachine, WaitReason};
use crate::ring::{Owner, Target};
use blockvault_common::{Error, ObjectVersion};
use tracing::debug;

/// Versions per STABLE/ROLLBACK record, capped so a record never spans a
/// sector.
fn versions_per_record(sector_size: u64) -> usize {
    (sector_size as usize - RECORD_HEADER_SIZE - 4) / ObjectVersion::WIRE_SIZE
}

impl Engine {
    pub(crate) fn dequeue_stable(&mut self, id: u64, op: &mut Operation) -> Dispatch {
        if !matches!(op.state, MachineState::None) {
            return Dispatch::Keep;
        }
        let OpKind::Stable { versions } = &op.kind else {
            unreachable!()
        };
        // Validate every referenced version before touching the journal.
        let mut todo: Vec<ObjectVersion> = Vec::with_capacity(versions.len());
        for ov in versions {
            match self.dirty_db.get(ov) {
                None => {
                    let clean_version = self.clean_db.get(&ov.oid).map_or(0, |e| e.version);
                    if clean_version < ov.version {
                        op.retval = Error::NoSuchVersion(format!("{ov}")).errno();
                        return Dispatch::Done;
                    }
                    // Already flushed; nothing to do.
                }
                Some(entry) if entry.state.stable => {}
                Some(entry) if !entry.state.is_synced() => {
                    op.retval = Error::Busy(format!("{ov} is not journal-synced")).errno();
                    return Dispatch::Done;
                }
                Some(_) => todo.push(*ov),
            }
        }
        if todo.is_empty() {
            op.retval = 0;
            return Dispatch::Done;
        }
        self.submit_decision(id, op, RecordKind::Stable, todo)
    }

    pub(crate) fn dequeue_rollback(&mut self, id: u64, op: &mut Operation) -> Dispatch {
        if !matches!(op.state, MachineState::None) {
            return Dispatch::Keep;
        }
        let OpKind::Rollback { versions } = &op.kind else {
            unreachable!()
        };
        let mut todo: Vec<ObjectVersion> = Vec::with_capacity(versions.len());
        for ov in versions {
            if self.dirty_db.get(ov).is_none() {
                let clean_version = self.clean_db.get(&ov.oid).map_or(0, |e| e.version);
                if clean_version >= ov.version {
                    continue; // Nothing above this version remains.
                }
                op.retval = Error::NoSuchVersion(format!("{ov}")).errno();
                return Dispatch::Done;
            }
            // Discarding (oid, v) discards every dirty version >= v; all
            // of them must be revocable.
            for victim in dirty_versions_of(&self.dirty_db, ov.oid) {
                if victim.version < ov.version {
                    continue;
                }
                let entry = &self.dirty_db[&victim];
                if entry.state.stable {
                    op.retval = Error::Busy(format!("{victim} is stable")).errno();
                    return Dispatch::Done;
                }
                if !entry.state.is_readable() {
                    op.retval = Error::Busy(format!("{victim} is in flight")).errno();
                    return Dispatch::Done;
                }
                if self.captured_by_sync(victim) {
                    op.retval =
                        Error::Busy(format!("{victim} is captured by a sync")).errno();
                    return Dispatch::Done;
                }
            }
            todo.push(*ov);
        }
        if todo.is_empty() {
            op.retval = 0;
            return Dispatch::Done;
        }
        self.submit_decision(id, op, RecordKind::Rollback, todo)
    }

    fn captured_by_sync(&self, ov: ObjectVersion) -> bool {
        self.in_progress_syncs.iter().any(|id| {
            matches!(
                self.ops.get(id).map(|op| &op.state),
                Some(MachineState::Sync(SyncMachine { big, small, .. }))
                    if big.contains(&ov) || small.contains(&ov)
            )
        })
    }

    /// Format the decision records, submit the touched sectors and a
    /// journal fsync. The decision is applied in-memory only after the
    /// fsync completes.
    fn submit_decision(
        &mut self,
        id: u64,
        op: &mut Operation,
        kind: RecordKind,
        todo: Vec<ObjectVersion>,
    ) -> Dispatch {
        let per_record = versions_per_record(self.journal.sector_size);
        let records = todo.len().div_ceil(per_record);
        let max_record_size = RECORD_HEADER_SIZE + 4 + per_record * ObjectVersion::WIRE_SIZE;

        if let Err(wait) = self.journal.check_available(records, max_record_size, 0) {
            return self.park_journal(op, wait);
        }
        if records > self.journal.free_slot_run() {
            return self.park(op, WaitReason::JournalBuffer);
        }
        let sqes = records + 2;
        if self.ring.space_left() < sqes {
            return self.park(op, WaitReason::Sqe(sqes));
        }

        let mut touched: Vec<usize> = Vec::new();
        for chunk in todo.chunks(per_record) {
            let body = match kind {
                RecordKind::Stable => RecordBody::Stable {
                    versions: chunk.to_vec(),
                },
                RecordKind::Rollback => RecordBody::Rollback {
                    versions: chunk.to_vec(),
                },
            };
            self.journal
                .push_record(&body)
                .expect("journal space and buffers were checked");
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
        op.state = MachineState::Stable(StableMachine);
        debug!(count = todo.len(), ?kind, "decision records journaled");
        // Stash the validated list back; apply uses it on completion.
        match (&mut op.kind, kind) {
            (OpKind::Stable { versions }, RecordKind::Stable)
            | (OpKind::Rollback { versions }, RecordKind::Rollback) => *versions = todo,
            _ => unreachable!(),
        }
        Dispatch::InFlight
    }

    /// The decision records are durable; mutate in-memory state.
    pub(crate) fn stable_io_done(&mut self, mut op: Operation) {
        match &op.kind {
            OpKind::Stable { versions } => {
                for ov in versions.clone() {
                    self.apply_stable(ov);
                }
            }
            OpKind::Rollback { versions } => {
                for ov in versions.clone() {
                    self.apply_rollback(ov);
                }
            }
            _ => unreachable!(),
        }
        op.retval = 0;
        self.finish_op(op);
    }

    /// Promote one version; earlier versions of the object become
    /// obsolete and will be erased by the flusher.
    pub(crate) fn apply_stable(&mut self, ov: ObjectVersion) {
        if let Some(entry) = self.dirty_db.get_mut(&ov) {
            if !entry.state.stable {
                entry.state.stable = true;
            }
            self.flusher.request_flush(ov.oid);
        }
        if let Some(&latest) = self.unstable_writes.get(&ov.oid) {
            if latest <= ov.version {
                self.unstable_writes.remove(&ov.oid);
            }
        }
    }

    /// Discard every dirty version >= the rolled-back one: free big-write
    /// blocks, release journal sector references, drop the entries.
    pub(crate) fn apply_rollback(&mut self, ov: ObjectVersion) {
        let victims: Vec<ObjectVersion> = dirty_versions_of(&self.dirty_db, ov.oid)
            .into_iter()
            .filter(|victim| victim.version >= ov.version)
            .collect();
        for victim in &victims {
            let entry = self.dirty_db.remove(victim).expect("validated victim");
            if entry.state.kind == WriteKind::Big && entry.location != u64::MAX {
                self.alloc.free(entry.location);
            }
            if let Some(sector) = entry.journal_sector {
                self.journal.sector_unref(sector);
            }
        }
        self.unsynced_big.retain(|pending| !victims.contains(pending));
        self.unsynced_small.retain(|pending| !victims.contains(pending));
        // Recompute the object's latest unstable version.
        let remaining = dirty_versions_of(&self.dirty_db, ov.oid)
            .into_iter()
            .filter(|v| {
                self.dirty_db
                    .get(v)
                    .map(|entry| !entry.state.stable)
                    .unwrap_or(false)
            })
            .next_back();
        match remaining {
            Some(latest) => {
                self.unstable_writes.insert(ov.oid, latest.version);
            }
            None => {
                self.unstable_writes.remove(&ov.oid);
            }
        }
        debug!(oid = %ov.oid, from = ov.version, discarded = victims.len(), "rolled back");
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecordKind {
    Stable,
    Rollback,
}
