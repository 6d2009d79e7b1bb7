//! The Engine: a single storage node's journal + metadata + data triad.
//!
//! Single-threaded and cooperative: callers enqueue operations; the loop
//! alternates a produce phase (dispatching queued operations into the
//! submission ring) and a complete phase (reaping completions and
//! advancing the per-operation state machines). The flusher runs
//! cooperatively in the same loop.

use crate::allocator::DataAllocator;
use crate::flusher::Flusher;
use crate::index::{CleanDb, DirtyDb, WriteKind};
use crate::journal::Journal;
use crate::op::{
    ListParams, MachineState, OpKind, Operation, SyncStage, WaitReason,
};
use crate::ring::{Completion, IoRing, Owner, Regions};
use crate::stats::StatsHandle;
use blockvault_common::{EngineConfig, ObjectId, ObjectVersion};
use blockvault_common::config::MIN_BLOCK_SIZE;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use tracing::{debug, error};

// Completion tags for operation-owned I/O.
pub(crate) const TAG_DATA_WRITE: u32 = 0;
pub(crate) const TAG_JOURNAL_DATA: u32 = 1;
pub(crate) const TAG_DATA_FSYNC: u32 = 2;
pub(crate) const TAG_JOURNAL_FSYNC: u32 = 3;
pub(crate) const TAG_START_WRITE: u32 = 4;
/// `TAG_SECTOR_BASE + slot` marks a journal sector write of that slot.
pub(crate) const TAG_SECTOR_BASE: u32 = 0x100;
/// `TAG_READ_BASE + chunk` marks a read-path extent.
pub(crate) const TAG_READ_BASE: u32 = 0x1000;

/// What a dispatch attempt did with an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Dispatch {
    /// Cannot submit; the op stays queued with a wait reason set.
    Parked,
    /// I/O submitted; the op leaves the queue and waits for completions.
    InFlight,
    /// I/O submitted or pending; the op stays in the queue (sync chain).
    Keep,
    /// Finished (successfully or not); fire the callback.
    Done,
}

/// The storage engine of one node.
pub struct Engine {
    pub(crate) cfg: EngineConfig,
    pub(crate) regions: Regions,
    pub(crate) ring: IoRing,
    pub(crate) journal: Journal,
    pub(crate) alloc: DataAllocator,
    pub(crate) clean_db: CleanDb,
    pub(crate) dirty_db: DirtyDb,
    /// Number of data blocks.
    pub(crate) block_count: u64,

    /// Big writes completed but not yet captured by a sync.
    pub(crate) unsynced_big: Vec<ObjectVersion>,
    /// Small writes and deletes completed but not yet captured by a sync.
    pub(crate) unsynced_small: Vec<ObjectVersion>,
    /// Latest unstable version per object (for SYNC_STAB_ALL).
    pub(crate) unstable_writes: BTreeMap<ObjectId, u64>,
    /// Syncs in registration order; completion is FIFO along this chain.
    pub(crate) in_progress_syncs: Vec<u64>,

    pub(crate) ops: HashMap<u64, Operation>,
    pub(crate) submit_queue: VecDeque<u64>,
    pub(crate) next_op_id: u64,

    pub(crate) flusher: Flusher,
    stats: StatsHandle,

    stalled: bool,
    stop_sync_submitted: bool,
}

impl Engine {
    pub(crate) fn assemble(
        cfg: EngineConfig,
        regions: Regions,
        journal: Journal,
        alloc: DataAllocator,
        clean_db: CleanDb,
        dirty_db: DirtyDb,
        block_count: u64,
    ) -> Self {
        let ring = IoRing::new(cfg.ring_depth);
        let flusher = Flusher::new(cfg.flusher_count);
        Self {
            cfg,
            regions,
            ring,
            journal,
            alloc,
            clean_db,
            dirty_db,
            block_count,
            unsynced_big: Vec::new(),
            unsynced_small: Vec::new(),
            unstable_writes: BTreeMap::new(),
            in_progress_syncs: Vec::new(),
            ops: HashMap::new(),
            submit_queue: VecDeque::new(),
            next_op_id: 1,
            flusher,
            stats: StatsHandle::new(),
            stalled: false,
            stop_sync_submitted: false,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    pub fn free_block_count(&self) -> u64 {
        self.alloc.free_count()
    }

    /// Cloneable handle to the per-opcode counters.
    pub fn stats(&self) -> StatsHandle {
        self.stats.clone()
    }

    /// A produce+complete pass made no progress while work remained.
    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// Submit an operation. Basic argument validation happens here; a
    /// failed check fires the callback immediately with a negative errno
    /// and returns 0. Otherwise the queued operation's id is returned; it
    /// can be passed to [`Engine::cancel`] while the op is still parked.
    pub fn enqueue(&mut self, op: Operation) -> u64 {
        self.enqueue_inner(op, false)
    }

    pub(crate) fn enqueue_inner(&mut self, mut op: Operation, internal: bool) -> u64 {
        op.internal = internal;
        op.started = Some(std::time::Instant::now());
        if let Err(e) = self.validate(&op) {
            op.retval = e.errno();
            self.fire_callback(op);
            return 0;
        }
        if op.kind.is_write() {
            if let Err(e) = self.enqueue_write(&mut op) {
                op.retval = e.errno();
                self.fire_callback(op);
                return 0;
            }
        }
        let id = self.next_op_id;
        self.next_op_id += 1;
        self.ops.insert(id, op);
        self.submit_queue.push_back(id);
        id
    }

    /// Drop a parked operation from the queue, undoing any speculative
    /// reservations it made. Only operations waiting on a resource (a
    /// non-empty wait reason) can be cancelled — once submitted to the
    /// ring, an operation runs to completion. The operation is handed
    /// back without its callback having fired.
    pub fn cancel(&mut self, id: u64) -> Option<Operation> {
        let waiting = matches!(
            self.ops.get(&id),
            Some(op) if op.wait != WaitReason::None
        );
        if !waiting {
            return None;
        }
        let mut op = self.ops.remove(&id)?;
        self.submit_queue.retain(|&queued| queued != id);
        if let WaitReason::Journal(_) = op.wait {
            self.journal.trim_wanted = self.journal.trim_wanted.saturating_sub(1);
        }
        op.wait = WaitReason::None;
        if let MachineState::Write(machine) = &op.state {
            if let Some(entry) = self.dirty_db.remove(&machine.ov) {
                if entry.state.kind == WriteKind::Big && entry.location != u64::MAX {
                    self.alloc.free(entry.location);
                }
            }
        }
        Some(op)
    }

    fn validate(&self, op: &Operation) -> blockvault_common::Result<()> {
        use blockvault_common::Error;
        if self.cfg.readonly && op.kind.is_mutating() {
            return Err(Error::ReadOnly);
        }
        let block_size = self.cfg.block_size;
        let align = self.cfg.disk_alignment;
        match &op.kind {
            OpKind::Read { offset, len, .. }
            | OpKind::Write { offset, len, .. } => {
                if *offset >= block_size
                    || *len > block_size - *offset
                    || *len % align != 0
                    || *offset % align != 0
                {
                    return Err(Error::invalid(format!(
                        "offset {offset} / len {len} out of block geometry"
                    )));
                }
                if let OpKind::Write { len, data, .. } = &op.kind {
                    if *len == 0 {
                        return Err(Error::invalid("zero-length write"));
                    }
                    if data.len() != *len as usize {
                        return Err(Error::invalid("write buffer length mismatch"));
                    }
                }
            }
            OpKind::Stable { versions } | OpKind::Rollback { versions } => {
                if versions.is_empty() {
                    return Err(Error::invalid("empty version list"));
                }
            }
            OpKind::List(params) => {
                if params.pg_count != 0
                    && (params.pg_stripe_size < u64::from(MIN_BLOCK_SIZE)
                        || params.pg_index >= params.pg_count)
                {
                    return Err(Error::invalid("bad placement group arguments"));
                }
            }
            OpKind::Delete { .. } | OpKind::Sync | OpKind::SyncStabAll => {}
        }
        Ok(())
    }

    /// Drive the loop until no more progress can be made. Returns with
    /// everything runnable completed; parked operations that need outside
    /// input (journal space, stabilizes) leave the engine stalled.
    pub fn run(&mut self) {
        self.stalled = false;
        loop {
            let progress = self.loop_once();
            if progress {
                continue;
            }
            if self.submit_queue.is_empty() && !self.ring.has_completions() {
                break;
            }
            self.stalled = true;
            debug!(
                queued = self.submit_queue.len(),
                "engine stalled waiting for outside input"
            );
            break;
        }
    }

    /// One produce + flush + submit + complete pass.
    pub fn loop_once(&mut self) -> bool {
        let mut progress = self.produce();
        if !self.cfg.readonly {
            progress |= self.flusher_loop();
        }
        progress |= self.ring.submit(&self.regions) > 0;
        progress |= self.complete();
        progress
    }

    /// Produce phase: walk the submit queue, dispatching every operation
    /// whose wait reason has cleared. Write ordering rule: once one write
    /// fails to submit, later writes in the pass are held back too.
    fn produce(&mut self) -> bool {
        let mut progress = false;
        // 0 = no writes seen, 1 = writes submitted, 2 = a write blocked
        let mut has_writes = 0u8;
        let mut remaining: VecDeque<u64> = VecDeque::with_capacity(self.submit_queue.len());
        let mut stop = false;

        while let Some(id) = self.submit_queue.pop_front() {
            if stop {
                remaining.push_back(id);
                continue;
            }
            let mut op = match self.ops.remove(&id) {
                Some(op) => op,
                // Completed out of band (sync chain ack); purge.
                None => continue,
            };
            if op.wait != WaitReason::None {
                self.check_wait(&mut op);
            }
            match op.wait {
                WaitReason::Sqe(_) => {
                    // Ring exhaustion stops the whole pass.
                    self.ops.insert(id, op);
                    remaining.push_back(id);
                    stop = true;
                    continue;
                }
                WaitReason::None => {}
                _ => {
                    if op.kind.is_write() {
                        has_writes = 2;
                    }
                    self.ops.insert(id, op);
                    remaining.push_back(id);
                    continue;
                }
            }

            let is_write = op.kind.is_write();
            if is_write && has_writes == 2 {
                self.ops.insert(id, op);
                remaining.push_back(id);
                continue;
            }
            if matches!(op.kind, OpKind::Sync | OpKind::SyncStabAll) && has_writes != 0 {
                // A sync cannot overtake unsubmitted writes.
                self.ops.insert(id, op);
                remaining.push_back(id);
                continue;
            }

            let mark = self.ring.save();
            let result = match &op.kind {
                OpKind::Read { .. } => self.dequeue_read(id, &mut op),
                OpKind::Write { .. } | OpKind::Delete { .. } => self.dequeue_write(id, &mut op),
                OpKind::Sync | OpKind::SyncStabAll => self.dequeue_sync(id, &mut op),
                OpKind::Stable { .. } => self.dequeue_stable(id, &mut op),
                OpKind::Rollback { .. } => self.dequeue_rollback(id, &mut op),
                OpKind::List(_) => {
                    self.process_list(&mut op);
                    Dispatch::Done
                }
            };
            match result {
                Dispatch::Done => {
                    progress = true;
                    if matches!(op.kind, OpKind::SyncStabAll) && op.retval >= 0 {
                        self.expand_stab_all(op);
                    } else {
                        self.finish_op(op);
                    }
                }
                Dispatch::InFlight => {
                    progress = true;
                    if is_write {
                        has_writes = 1;
                    }
                    self.ops.insert(id, op);
                }
                Dispatch::Keep => {
                    self.ops.insert(id, op);
                    remaining.push_back(id);
                }
                Dispatch::Parked => {
                    self.ring.restore(mark);
                    if is_write {
                        has_writes = 2;
                    }
                    let sqe_park = matches!(op.wait, WaitReason::Sqe(_));
                    self.ops.insert(id, op);
                    remaining.push_back(id);
                    if sqe_park {
                        stop = true;
                    }
                }
            }
        }
        self.submit_queue = remaining;
        progress
    }

    /// Re-evaluate a parked operation's wait reason.
    fn check_wait(&mut self, op: &mut Operation) {
        match op.wait {
            WaitReason::Sqe(need) => {
                if self.ring.space_left() >= need {
                    op.wait = WaitReason::None;
                }
            }
            WaitReason::Journal(used_start) => {
                if self.journal.used_start != used_start {
                    self.journal.trim_wanted = self.journal.trim_wanted.saturating_sub(1);
                    op.wait = WaitReason::None;
                }
            }
            WaitReason::JournalBuffer => {
                if !self.journal.next_slot_busy() {
                    op.wait = WaitReason::None;
                }
            }
            WaitReason::Free => {
                if self.alloc.free_count() > 0 || !self.flusher.is_active() {
                    op.wait = WaitReason::None;
                }
            }
            WaitReason::None => {}
        }
    }

    /// Park an operation on a wait reason.
    pub(crate) fn park(&mut self, op: &mut Operation, wait: WaitReason) -> Dispatch {
        if let WaitReason::Journal(_) = wait {
            self.journal.trim_wanted += 1;
        }
        op.wait = wait;
        Dispatch::Parked
    }

    fn flusher_loop(&mut self) -> bool {
        let mut flusher = std::mem::take(&mut self.flusher);
        let progress = flusher.step_all(self);
        self.flusher = flusher;
        progress
    }

    /// Complete phase: reap completions and fan them out.
    fn complete(&mut self) -> bool {
        let mut progress = false;
        while let Some(completion) = self.ring.reap() {
            progress = true;
            if completion.result < 0 {
                self.fatal(&format!(
                    "I/O failed with {}: in-memory state can no longer be trusted",
                    completion.result
                ));
            }
            if (TAG_SECTOR_BASE..TAG_READ_BASE).contains(&completion.tag) {
                self.journal
                    .sector_write_done((completion.tag - TAG_SECTOR_BASE) as usize);
            }
            match completion.owner {
                Owner::Op(id) => self.on_op_completion(id, completion),
                Owner::Flusher(actor) => {
                    let mut flusher = std::mem::take(&mut self.flusher);
                    flusher.on_completion(actor, completion, self);
                    self.flusher = flusher;
                }
            }
        }
        progress
    }

    fn on_op_completion(&mut self, id: u64, completion: Completion) {
        let mut op = match self.ops.remove(&id) {
            Some(op) => op,
            None => self.fatal("completion for unknown operation"),
        };
        if completion.tag >= TAG_READ_BASE {
            self.read_chunk_done(&mut op, completion);
        }
        debug_assert!(op.pending_ios > 0);
        op.pending_ios -= 1;
        if op.pending_ios > 0 {
            self.ops.insert(id, op);
            return;
        }
        match &op.state {
            MachineState::Write(_) => self.write_persisted(op),
            MachineState::Sync(_) => self.sync_io_done(id, op),
            MachineState::Stable(_) => self.stable_io_done(op),
            MachineState::Read(_) => self.read_done(op),
            MachineState::None => self.fatal("completion for an idle operation"),
        }
    }

    /// Finish an operation: counters, then the callback.
    pub(crate) fn finish_op(&mut self, mut op: Operation) {
        if !op.internal {
            let usec = op
                .started
                .map(|t| t.elapsed().as_micros() as u64)
                .unwrap_or(0);
            self.stats.record(op.kind.name(), usec, op.retval >= 0);
        }
        self.fire_callback(op);
    }

    fn fire_callback(&mut self, mut op: Operation) {
        if let Some(callback) = op.callback.take() {
            callback(&mut op);
        }
    }

    /// Unrecoverable condition: durability reasoning is broken, abort.
    pub(crate) fn fatal(&self, msg: &str) -> ! {
        error!("fatal: {msg}");
        std::process::abort();
    }

    /// Whether the engine can be torn down right now. Submits one final
    /// internal sync if unsynced writes remain.
    pub fn is_safe_to_stop(&mut self) -> bool {
        if !self.submit_queue.is_empty() || (!self.cfg.readonly && self.flusher.is_active()) {
            return false;
        }
        if !self.unsynced_big.is_empty() || !self.unsynced_small.is_empty() {
            if !self.cfg.readonly && !self.stop_sync_submitted {
                self.enqueue_inner(Operation::sync(|_| {}), true);
                self.stop_sync_submitted = true;
            }
            return false;
        }
        true
    }

    /// LIST: two-partition listing of `(object, version)` pairs — stable
    /// versions first (sorted), then unstable; `op.version` is the split.
    fn process_list(&mut self, op: &mut Operation) {
        let OpKind::List(params) = &op.kind else {
            unreachable!()
        };
        let ListParams {
            pg_index,
            pg_count,
            pg_stripe_size,
            min_inode,
            max_inode,
        } = *params;

        let in_pg = |oid: ObjectId| {
            pg_count == 0
                || ((oid.inode + oid.stripe / pg_stripe_size) % u64::from(pg_count))
                    == u64::from(pg_index)
        };
        let inode_filtered = (min_inode != 0 || max_inode != 0) && min_inode <= max_inode;

        let mut stable: Vec<ObjectVersion> = Vec::new();
        {
            let range = if inode_filtered {
                self.clean_db.range((
                    Bound::Included(ObjectId::new(min_inode, 0)),
                    Bound::Included(ObjectId::new(max_inode, u64::MAX)),
                ))
            } else {
                self.clean_db.range(..)
            };
            for (&oid, entry) in range {
                if in_pg(oid) {
                    stable.push(ObjectVersion::new(oid, entry.version));
                }
            }
        }
        let clean_stable_count = stable.len();

        // Patch a stable entry for `oid` in-place within [lo, hi).
        let replace_stable =
            |list: &mut [ObjectVersion], oid: ObjectId, version: u64, lo: usize, hi: usize| {
                match list[lo..hi].binary_search_by(|probe| probe.oid.cmp(&oid)) {
                    Ok(pos) => {
                        list[lo + pos].version = version;
                        true
                    }
                    Err(_) => false,
                }
            };

        let mut unstable: Vec<ObjectVersion> = Vec::new();
        {
            let range = if inode_filtered {
                self.dirty_db.range((
                    Bound::Included(ObjectVersion::new(ObjectId::new(min_inode, 0), 0)),
                    Bound::Included(ObjectVersion::new(
                        ObjectId::new(max_inode, u64::MAX),
                        u64::MAX,
                    )),
                ))
            } else {
                self.dirty_db.range(..)
            };
            for (&ov, entry) in range {
                if !in_pg(ov.oid) {
                    continue;
                }
                if entry.state.kind == WriteKind::Delete && entry.state.stable {
                    // Deletions erase the object from both partitions.
                    if !replace_stable(&mut stable, ov.oid, 0, 0, clean_stable_count) {
                        let len = stable.len();
                        replace_stable(&mut stable, ov.oid, 0, clean_stable_count, len);
                    }
                } else if entry.state.stable {
                    if !replace_stable(&mut stable, ov.oid, ov.version, 0, clean_stable_count) {
                        // Within the dirty partition the latest stable
                        // version of one object wins.
                        if stable.len() > clean_stable_count
                            && stable.last().map(|last| last.oid) == Some(ov.oid)
                        {
                            stable.last_mut().unwrap().version = ov.version;
                        } else {
                            stable.push(ov);
                        }
                    }
                } else {
                    unstable.push(ov);
                }
            }
        }

        // Compact entries zeroed out by deletions.
        stable.retain(|entry| entry.version != 0);

        let stable_count = stable.len();
        stable.extend(unstable);
        op.version = stable_count as u64;
        op.retval = stable.len() as i64;
        op.list = stable;
    }

    /// Enqueue the follow-up STABLE of a completed SYNC_STAB_ALL.
    pub(crate) fn expand_stab_all(&mut self, mut op: Operation) {
        if op.retval < 0 || self.unstable_writes.is_empty() {
            self.finish_op(op);
            return;
        }
        let versions: Vec<ObjectVersion> = self
            .unstable_writes
            .iter()
            .map(|(&oid, &version)| ObjectVersion::new(oid, version))
            .collect();
        self.unstable_writes.clear();
        let follow_up = Operation::new(
            OpKind::Stable { versions },
            Box::new(move |stable_op| {
                op.retval = stable_op.retval;
                if let Some(callback) = op.callback.take() {
                    callback(&mut op);
                }
            }),
        );
        self.enqueue_inner(follow_up, true);
    }

    /// FIFO acknowledgement of completed syncs: pop and complete from the
    /// front of the chain while the front is done.
    pub(crate) fn ack_syncs(&mut self) {
        while let Some(&front) = self.in_progress_syncs.first() {
            let done = matches!(
                self.ops.get(&front).map(|op| &op.state),
                Some(MachineState::Sync(sync)) if sync.stage == SyncStage::Done
            );
            if !done {
                break;
            }
            self.in_progress_syncs.remove(0);
            for &later in &self.in_progress_syncs {
                if let Some(MachineState::Sync(sync)) =
                    self.ops.get_mut(&later).map(|op| &mut op.state)
                {
                    sync.prev_sync_count = sync.prev_sync_count.saturating_sub(1);
                }
            }
            let mut op = self.ops.remove(&front).expect("sync op in chain");
            op.retval = 0;
            if matches!(op.kind, OpKind::SyncStabAll) {
                self.expand_stab_all(op);
            } else {
                self.finish_op(op);
            }
        }
    }
}
