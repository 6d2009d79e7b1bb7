//! Flusher: migrates stable journal state into the metadata region and
//! reclaims journal space.
//!
//! A pool of cooperative actors each processes one object at a time:
//! gather the object's stable version chain, materialize it into a data
//! block (in place where possible), rewrite the object's clean-entry slot
//! with a read-modify-write of its metadata block, then erase the chain
//! from `dirty_db`, emit a STABLE record for the flushed versions, and
//! advance `used_start` past the now-redundant journal records by
//! rewriting the START sector.
//!
//! The flusher yields while the submission ring is three-quarters full.

use crate::engine::{Engine, TAG_SECTOR_BASE};
use crate::index::{bitmap_set_range, dirty_versions_of, CleanEntry, WriteKind};
use crate::journal::{RecordBody, RECORD_HEADER_SIZE};
use crate::meta::{self, entry_location};
use crate::raw_io::AlignedBuffer;
use crate::ring::{Completion, Owner, Target};
use blockvault_common::{ObjectId, ObjectVersion};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, trace};

const FTAG_DATA: u32 = 1;
const FTAG_DATA_FSYNC: u32 = 2;
const FTAG_META_READ_NEW: u32 = 3;
const FTAG_META_READ_OLD: u32 = 4;
const FTAG_META_WRITE: u32 = 5;
const FTAG_META_FSYNC: u32 = 6;
const FTAG_JOURNAL_FSYNC: u32 = 7;
const FTAG_START: u32 = 8;

/// Ring fill percentage at which the flusher stops taking new work.
const RING_BACKPRESSURE_PERCENT: usize = 75;

/// Outcome of planning a flush.
enum Plan {
    /// A flushable chain exists; run it.
    Flush(Box<FlushCtx>),
    /// Nothing flushable for this object right now.
    Nothing,
    /// Blocked on a resource (free data block); keep the object queued.
    Retry,
}

/// What the flushed chain amounts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    /// The object ends deleted.
    Delete,
    /// The object ends at `target_block`.
    Write,
}

/// Everything one actor needs to flush one object.
struct FlushCtx {
    oid: ObjectId,
    /// Dirty versions being flushed, ascending.
    chain: Vec<ObjectVersion>,
    vmax: u64,
    outcome: Outcome,
    /// Block the object's bytes end up in (Write outcome).
    target_block: u64,
    /// Freshly allocated target: zero-fill before overlaying.
    fresh: bool,
    /// Small writes to copy out of the journal into the target block.
    smalls: Vec<ObjectVersion>,
    /// Superseded clean block to free and whose slot to zero.
    old_block: Option<u64>,
    /// Superseded big-write blocks (not the target) to free.
    extra_free: Vec<u64>,
    bitmap: Vec<u8>,
    ext_bitmap: Vec<u8>,
    /// Metadata block under RMW for the target/deleted slot, if any I/O
    /// is needed at all (an object that never reached the metadata region
    /// deletes without touching it).
    meta_new: Option<u64>,
    meta_old: Option<u64>,
    buf_new: Option<AlignedBuffer>,
    buf_old: Option<AlignedBuffer>,
    /// Trim decided during finalize, applied once the START write and
    /// journal fsync complete.
    trim_target: Option<u64>,
}

enum ActorState {
    Idle,
    DataWrites(FlushCtx),
    DataFsync(FlushCtx),
    MetaRead(FlushCtx),
    MetaWrite(FlushCtx),
    Finalize(FlushCtx),
    /// Standalone trim (no object work): START rewrite + journal fsync.
    Trim { target: u64 },
}

struct FlushActor {
    state: ActorState,
    pending: u32,
}

/// The flusher actor pool.
pub struct Flusher {
    actors: Vec<FlushActor>,
    queue: VecDeque<ObjectId>,
    queued: HashSet<ObjectId>,
    /// Metadata blocks currently under RMW by some actor.
    meta_busy: HashSet<u64>,
    /// A START rewrite is in flight; only one trim at a time.
    trim_lock: bool,
}

impl Default for Flusher {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Flusher {
    pub fn new(actor_count: usize) -> Self {
        Self {
            actors: (0..actor_count)
                .map(|_| FlushActor {
                    state: ActorState::Idle,
                    pending: 0,
                })
                .collect(),
            queue: VecDeque::new(),
            queued: HashSet::new(),
            meta_busy: HashSet::new(),
            trim_lock: false,
        }
    }

    /// An object gained flushable (stable, synced) state.
    pub fn request_flush(&mut self, oid: ObjectId) {
        if self.queued.insert(oid) {
            self.queue.push_back(oid);
        }
    }

    /// Whether the flusher still has or may get work.
    pub fn is_active(&self) -> bool {
        !self.queue.is_empty()
            || self
                .actors
                .iter()
                .any(|actor| !matches!(actor.state, ActorState::Idle))
    }

    /// Produce-phase hook: hand idle actors new work.
    pub fn step_all(&mut self, engine: &mut Engine) -> bool {
        let mut progress = false;
        for idx in 0..self.actors.len() {
            if !matches!(self.actors[idx].state, ActorState::Idle) {
                continue;
            }
            if engine.ring.fill_percent() >= RING_BACKPRESSURE_PERCENT {
                break;
            }
            progress |= self.try_start(idx, engine);
        }
        progress
    }

    fn try_start(&mut self, idx: usize, engine: &mut Engine) -> bool {
        let mut attempts = self.queue.len();
        while attempts > 0 {
            attempts -= 1;
            let Some(oid) = self.queue.pop_front() else {
                break;
            };
            self.queued.remove(&oid);
            let ctx = match self.plan(engine, oid) {
                Plan::Flush(ctx) => *ctx,
                Plan::Nothing => continue,
                Plan::Retry => {
                    // Cannot make progress on this object right now (no
                    // free data block); keep it queued.
                    self.request_flush(oid);
                    continue;
                }
            };
            let busy = ctx
                .meta_new
                .iter()
                .chain(ctx.meta_old.iter())
                .any(|block| self.meta_busy.contains(block));
            if busy {
                self.request_flush(oid);
                continue;
            }
            if let Some(block) = ctx.meta_new {
                self.meta_busy.insert(block);
            }
            if let Some(block) = ctx.meta_old {
                self.meta_busy.insert(block);
            }
            debug!(oid = %ctx.oid, vmax = ctx.vmax, outcome = ?ctx.outcome, "flush start");
            self.enter_data_phase(idx, ctx, engine);
            return true;
        }
        // No object work; reclaim journal space if writers are starved.
        if !self.trim_lock && engine.journal.trim_wanted > 0 {
            let target = engine.journal.trim_target();
            if target != engine.journal.used_start {
                self.submit_trim(idx, target, engine);
                return true;
            }
        }
        false
    }

    /// Build the flush plan for one object.
    fn plan(&self, engine: &mut Engine, oid: ObjectId) -> Plan {
        let versions = dirty_versions_of(&engine.dirty_db, oid);
        // Highest stable synced version with everything below it synced.
        let mut vmax = 0u64;
        for ov in &versions {
            let entry = &engine.dirty_db[ov];
            if !entry.state.is_synced() {
                break;
            }
            if entry.state.stable {
                vmax = ov.version;
            }
        }
        if vmax == 0 {
            return Plan::Nothing;
        }
        let chain: Vec<ObjectVersion> = versions
            .into_iter()
            .filter(|ov| ov.version <= vmax)
            .collect();
        let last = &engine.dirty_db[chain.last().unwrap()];
        let clean = engine.clean_db.get(&oid);
        let bitmap_bytes = engine.cfg.bitmap_bytes();
        let granularity = engine.cfg.bitmap_granularity;

        if last.state.kind == WriteKind::Delete {
            let old_block = clean.map(|c| c.block);
            let extra_free: Vec<u64> = chain
                .iter()
                .filter(|ov| engine.dirty_db[*ov].state.kind == WriteKind::Big)
                .map(|ov| engine.dirty_db[ov].location)
                .collect();
            return Plan::Flush(Box::new(FlushCtx {
                oid,
                chain,
                vmax,
                outcome: Outcome::Delete,
                target_block: 0,
                fresh: false,
                smalls: Vec::new(),
                old_block,
                extra_free,
                bitmap: Vec::new(),
                ext_bitmap: Vec::new(),
                meta_new: old_block.map(|block| entry_location(&engine.cfg, block).0),
                meta_old: None,
                buf_new: None,
                buf_old: None,
                trim_target: None,
            }));
        }

        let big_base = chain
            .iter()
            .rev()
            .find(|ov| engine.dirty_db[*ov].state.kind == WriteKind::Big)
            .copied();
        let (target_block, fresh, base_version, mut bitmap, old_block) = match (big_base, clean) {
            (Some(big), clean) => {
                let location = engine.dirty_db[&big].location;
                (
                    location,
                    false,
                    big.version,
                    vec![0xFF; bitmap_bytes],
                    clean.map(|c| c.block),
                )
            }
            (None, Some(clean)) => (clean.block, false, 0, clean.bitmap.clone(), None),
            (None, None) => {
                // First materialization of this object: needs a block.
                match engine.alloc.allocate() {
                    Some(block) => (block, true, 0, vec![0u8; bitmap_bytes], None),
                    None => return Plan::Retry,
                }
            }
        };
        let smalls: Vec<ObjectVersion> = chain
            .iter()
            .filter(|ov| {
                ov.version > base_version
                    && engine.dirty_db[*ov].state.kind == WriteKind::Small
            })
            .copied()
            .collect();
        for ov in &smalls {
            let entry = &engine.dirty_db[ov];
            bitmap_set_range(&mut bitmap, granularity, entry.offset, entry.len);
        }
        let extra_free: Vec<u64> = chain
            .iter()
            .filter(|ov| {
                engine.dirty_db[*ov].state.kind == WriteKind::Big
                    && engine.dirty_db[*ov].location != target_block
            })
            .map(|ov| engine.dirty_db[ov].location)
            .collect();
        let ext_bitmap = engine.dirty_db[chain.last().unwrap()].ext_bitmap.clone();

        let meta_new = entry_location(&engine.cfg, target_block).0;
        let meta_old = old_block
            .map(|block| entry_location(&engine.cfg, block).0)
            .filter(|&block| block != meta_new);
        Plan::Flush(Box::new(FlushCtx {
            oid,
            chain,
            vmax,
            outcome: Outcome::Write,
            target_block,
            fresh,
            smalls,
            old_block,
            extra_free,
            bitmap,
            ext_bitmap,
            meta_new: Some(meta_new),
            meta_old,
            buf_new: None,
            buf_old: None,
            trim_target: None,
        }))
    }

    /// Copy small-write bytes out of the journal image into the target
    /// block; a fresh block is written whole (zeros + overlays).
    fn enter_data_phase(&mut self, idx: usize, ctx: FlushCtx, engine: &mut Engine) {
        if ctx.outcome == Outcome::Delete || (ctx.smalls.is_empty() && !ctx.fresh) {
            // Pure promotion or delete: data is already in place and
            // durable (big-write data was fsynced by the sync machine).
            self.enter_meta_phase(idx, ctx, engine);
            return;
        }
        let block_size = engine.cfg.block_size as usize;
        let align = engine.cfg.disk_alignment as usize;
        let block_base = ctx.target_block * block_size as u64;
        let mut pending = 0u32;
        if ctx.fresh {
            let mut buf = AlignedBuffer::new(block_size, align);
            for ov in &ctx.smalls {
                let entry = &engine.dirty_db[ov];
                let src = entry.location as usize;
                buf.as_mut_slice()[entry.offset as usize..(entry.offset + entry.len) as usize]
                    .copy_from_slice(&engine.journal.buffer[src..src + entry.len as usize]);
            }
            let pushed = engine.ring.push_write(
                Target::Data,
                block_base,
                buf,
                Owner::Flusher(idx),
                FTAG_DATA,
            );
            debug_assert!(pushed);
            pending += 1;
        } else {
            for ov in &ctx.smalls {
                let entry = &engine.dirty_db[ov];
                let mut buf = AlignedBuffer::new(entry.len as usize, align);
                let src = entry.location as usize;
                buf.copy_from(&engine.journal.buffer[src..src + entry.len as usize]);
                let pushed = engine.ring.push_write(
                    Target::Data,
                    block_base + u64::from(entry.offset),
                    buf,
                    Owner::Flusher(idx),
                    FTAG_DATA,
                );
                debug_assert!(pushed);
                pending += 1;
            }
        }
        self.actors[idx].pending = pending;
        self.actors[idx].state = ActorState::DataWrites(ctx);
    }

    fn enter_data_fsync(&mut self, idx: usize, ctx: FlushCtx, engine: &mut Engine) {
        let pushed = engine
            .ring
            .push_fsync(Target::Data, Owner::Flusher(idx), FTAG_DATA_FSYNC);
        debug_assert!(pushed);
        self.actors[idx].pending = 1;
        self.actors[idx].state = ActorState::DataFsync(ctx);
    }

    fn enter_meta_phase(&mut self, idx: usize, ctx: FlushCtx, engine: &mut Engine) {
        let Some(meta_new) = ctx.meta_new else {
            // Never materialized and now deleted: nothing on disk.
            self.finalize(idx, ctx, engine);
            return;
        };
        let meta_block_size = engine.cfg.meta_block_size as usize;
        let mut pending = 0u32;
        let pushed = engine.ring.push_read(
            Target::Meta,
            meta_new * meta_block_size as u64,
            meta_block_size,
            Owner::Flusher(idx),
            FTAG_META_READ_NEW,
        );
        debug_assert!(pushed);
        pending += 1;
        if let Some(meta_old) = ctx.meta_old {
            let pushed = engine.ring.push_read(
                Target::Meta,
                meta_old * meta_block_size as u64,
                meta_block_size,
                Owner::Flusher(idx),
                FTAG_META_READ_OLD,
            );
            debug_assert!(pushed);
            pending += 1;
        }
        self.actors[idx].pending = pending;
        self.actors[idx].state = ActorState::MetaRead(ctx);
    }

    /// RMW: patch the slots in the read buffers, write them back, fsync.
    fn enter_meta_write(&mut self, idx: usize, mut ctx: FlushCtx, engine: &mut Engine) {
        let cfg = &engine.cfg;
        let entry_size = cfg.clean_entry_size();
        let bitmap_bytes = cfg.bitmap_bytes();
        let meta_block_size = cfg.meta_block_size as usize;
        let meta_new = ctx.meta_new.expect("meta phase requires a slot");

        let mut buf_new = ctx.buf_new.take().expect("meta block was read");
        match ctx.outcome {
            Outcome::Delete => {
                let block = ctx.old_block.expect("delete with a clean entry");
                let (_, offset) = entry_location(cfg, block);
                buf_new.as_mut_slice()[offset..offset + entry_size].fill(0);
            }
            Outcome::Write => {
                let (_, offset) = entry_location(cfg, ctx.target_block);
                meta::encode_entry(
                    &mut buf_new.as_mut_slice()[offset..offset + entry_size],
                    ctx.oid,
                    ctx.vmax,
                    &ctx.bitmap,
                    &ctx.ext_bitmap,
                    bitmap_bytes,
                );
                // A superseded slot in the same metadata block is zeroed
                // in the same write.
                if let Some(old) = ctx.old_block {
                    let (old_meta, old_offset) = entry_location(cfg, old);
                    if old_meta == meta_new {
                        buf_new.as_mut_slice()[old_offset..old_offset + entry_size].fill(0);
                    }
                }
            }
        }
        let mut pending = 0u32;
        let pushed = engine.ring.push_write(
            Target::Meta,
            meta_new * meta_block_size as u64,
            buf_new,
            Owner::Flusher(idx),
            FTAG_META_WRITE,
        );
        debug_assert!(pushed);
        pending += 1;

        if let (Some(meta_old), Some(old)) = (ctx.meta_old, ctx.old_block) {
            let mut buf_old = ctx.buf_old.take().expect("old meta block was read");
            let (_, old_offset) = entry_location(cfg, old);
            buf_old.as_mut_slice()[old_offset..old_offset + entry_size].fill(0);
            let pushed = engine.ring.push_write(
                Target::Meta,
                meta_old * meta_block_size as u64,
                buf_old,
                Owner::Flusher(idx),
                FTAG_META_WRITE,
            );
            debug_assert!(pushed);
            pending += 1;
        }
        let pushed = engine
            .ring
            .push_fsync(Target::Meta, Owner::Flusher(idx), FTAG_META_FSYNC);
        debug_assert!(pushed);
        pending += 1;

        self.actors[idx].pending = pending;
        self.actors[idx].state = ActorState::MetaWrite(ctx);
    }

    /// Metadata is durable: mutate in-memory state, emit a STABLE record
    /// covering the flushed versions, and try to advance `used_start`.
    fn finalize(&mut self, idx: usize, mut ctx: FlushCtx, engine: &mut Engine) {
        match ctx.outcome {
            Outcome::Delete => {
                engine.clean_db.remove(&ctx.oid);
                if let Some(block) = ctx.old_block {
                    engine.alloc.free(block);
                }
            }
            Outcome::Write => {
                engine.clean_db.insert(
                    ctx.oid,
                    CleanEntry {
                        version: ctx.vmax,
                        block: ctx.target_block,
                        bitmap: std::mem::take(&mut ctx.bitmap),
                        ext_bitmap: std::mem::take(&mut ctx.ext_bitmap),
                    },
                );
                if let Some(block) = ctx.old_block {
                    engine.alloc.free(block);
                }
            }
        }
        for &block in &ctx.extra_free {
            engine.alloc.free(block);
        }
        for ov in &ctx.chain {
            if let Some(entry) = engine.dirty_db.remove(ov) {
                if let Some(sector) = entry.journal_sector {
                    engine.journal.sector_unref(sector);
                }
            }
        }
        if let Some(block) = ctx.meta_new.take() {
            self.meta_busy.remove(&block);
        }
        if let Some(block) = ctx.meta_old.take() {
            self.meta_busy.remove(&block);
        }
        debug!(oid = %ctx.oid, vmax = ctx.vmax, "flush applied");

        // Best-effort STABLE record so a replay after a crash sees the
        // flushed versions as already decided.
        let per_record =
            (engine.journal.sector_size as usize - RECORD_HEADER_SIZE - 4) / ObjectVersion::WIRE_SIZE;
        let mut pending = 0u32;
        let mut touched: Vec<usize> = Vec::new();
        let mut emitted = true;
        'emit: for chunk in ctx.chain.chunks(per_record) {
            let body = RecordBody::Stable {
                versions: chunk.to_vec(),
            };
            if engine
                .journal
                .check_available(1, body.size(engine.journal.bitmap_bytes()), 0)
                .is_err()
                || engine.journal.push_record(&body).is_err()
            {
                emitted = false;
                break 'emit;
            }
            if touched.last() != Some(&engine.journal.cur_slot) {
                touched.push(engine.journal.cur_slot);
            }
        }
        if !emitted {
            trace!(oid = %ctx.oid, "journal pressure, flush STABLE record skipped");
        }
        for slot in touched {
            let pushed = engine.journal.submit_sector(
                slot,
                &mut engine.ring,
                Owner::Flusher(idx),
                TAG_SECTOR_BASE + slot as u32,
            );
            debug_assert!(pushed);
            pending += 1;
        }

        // Advance used_start: rewrite the START sector, then apply the
        // trim once it (and everything before it) is durable.
        if !self.trim_lock {
            let target = engine.journal.trim_target();
            if target != engine.journal.used_start {
                self.trim_lock = true;
                let buf = engine
                    .journal
                    .encode_start_sector(target, engine.journal.seed_for(target));
                let pushed =
                    engine
                        .ring
                        .push_write(Target::Journal, 0, buf, Owner::Flusher(idx), FTAG_START);
                debug_assert!(pushed);
                engine.journal.start_dirty = false;
                ctx.trim_target = Some(target);
                pending += 1;
            }
        }
        if pending > 0 {
            let pushed =
                engine
                    .ring
                    .push_fsync(Target::Journal, Owner::Flusher(idx), FTAG_JOURNAL_FSYNC);
            debug_assert!(pushed);
            pending += 1;
            self.actors[idx].pending = pending;
            self.actors[idx].state = ActorState::Finalize(ctx);
        } else {
            self.actors[idx].state = ActorState::Idle;
        }
    }

    fn submit_trim(&mut self, idx: usize, target: u64, engine: &mut Engine) {
        self.trim_lock = true;
        let buf = engine
            .journal
            .encode_start_sector(target, engine.journal.seed_for(target));
        let ok = engine
            .ring
            .push_write(Target::Journal, 0, buf, Owner::Flusher(idx), FTAG_START)
            && engine
                .ring
                .push_fsync(Target::Journal, Owner::Flusher(idx), FTAG_JOURNAL_FSYNC);
        debug_assert!(ok);
        engine.journal.start_dirty = false;
        self.actors[idx].pending = 2;
        self.actors[idx].state = ActorState::Trim { target };
    }

    /// Completion fan-in for flusher-owned I/O.
    pub fn on_completion(&mut self, idx: usize, completion: Completion, engine: &mut Engine) {
        let actor = &mut self.actors[idx];
        match completion.tag {
            FTAG_META_READ_NEW | FTAG_META_READ_OLD => {
                let buf = completion.data.expect("meta read returns data");
                if let ActorState::MetaRead(ctx) = &mut actor.state {
                    if completion.tag == FTAG_META_READ_NEW {
                        ctx.buf_new = Some(buf);
                    } else {
                        ctx.buf_old = Some(buf);
                    }
                }
            }
            _ => {}
        }
        debug_assert!(actor.pending > 0);
        actor.pending -= 1;
        if actor.pending > 0 {
            return;
        }
        let state = std::mem::replace(&mut actor.state, ActorState::Idle);
        match state {
            ActorState::DataWrites(ctx) => self.enter_data_fsync(idx, ctx, engine),
            ActorState::DataFsync(ctx) => self.enter_meta_phase(idx, ctx, engine),
            ActorState::MetaRead(ctx) => self.enter_meta_write(idx, ctx, engine),
            ActorState::MetaWrite(ctx) => self.finalize(idx, ctx, engine),
            ActorState::Finalize(ctx) => {
                if let Some(target) = ctx.trim_target {
                    engine.journal.apply_trim(target);
                    self.trim_lock = false;
                    debug!(used_start = target, "journal trimmed");
                }
            }
            ActorState::Trim { target } => {
                engine.journal.apply_trim(target);
                self.trim_lock = false;
                debug!(used_start = target, "journal trimmed");
            }
            ActorState::Idle => engine.fatal("flusher completion for an idle actor"),
        }
    }
}
