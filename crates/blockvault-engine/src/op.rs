//! Operations: the consumer-facing unit of work.
//!
//! Callers build an [`Operation`] with a completion callback and hand it
//! to the engine. The engine owns the operation until it completes; the
//! callback fires exactly once with `retval` populated (>= 0 on success,
//! negative errno on failure). Read data and LIST results are returned as
//! owned fields of the operation.

use blockvault_common::{ObjectId, ObjectVersion};
use bytes::Bytes;

/// Completion callback. Runs on the engine thread.
pub type Callback = Box<dyn FnOnce(&mut Operation)>;

/// Why a parked operation cannot be dispatched yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitReason {
    None,
    /// Needs this many free submission slots.
    Sqe(usize),
    /// Needs journal space; `used_start` observed when parked. Re-checked
    /// once the flusher has moved `used_start`.
    Journal(u64),
    /// The next journal sector buffer is still in flight.
    JournalBuffer,
    /// No free data block while the flusher still has work.
    Free,
}

/// Arguments of a LIST operation.
#[derive(Clone, Copy, Debug)]
pub struct ListParams {
    /// Placement-group index to filter by (with `pg_count`).
    pub pg_index: u32,
    /// Number of placement groups; 0 disables PG filtering.
    pub pg_count: u32,
    /// Stripe size used by the PG hash.
    pub pg_stripe_size: u64,
    /// Lowest inode to include; 0 with `max_inode == 0` disables the filter.
    pub min_inode: u64,
    /// Highest inode to include.
    pub max_inode: u64,
}

/// What an operation does.
pub enum OpKind {
    Read {
        oid: ObjectId,
        offset: u32,
        len: u32,
    },
    Write {
        oid: ObjectId,
        /// 0 = assign automatically; otherwise must be exactly one past
        /// the object's latest version.
        version: u64,
        offset: u32,
        len: u32,
        data: Bytes,
        ext_bitmap: Option<Vec<u8>>,
        /// WRITE_STABLE: the write is born stable (never revocable).
        stable: bool,
    },
    Delete {
        oid: ObjectId,
        version: u64,
    },
    Sync,
    /// SYNC, then STABLE over every tracked unstable write.
    SyncStabAll,
    Stable {
        versions: Vec<ObjectVersion>,
    },
    Rollback {
        versions: Vec<ObjectVersion>,
    },
    List(ListParams),
}

impl OpKind {
    pub(crate) fn is_write(&self) -> bool {
        matches!(self, Self::Write { .. } | Self::Delete { .. })
    }

    pub(crate) fn is_mutating(&self) -> bool {
        !matches!(self, Self::Read { .. } | Self::List(_))
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Write { stable: false, .. } => "write",
            Self::Write { stable: true, .. } => "write_stable",
            Self::Delete { .. } => "delete",
            Self::Sync => "sync",
            Self::SyncStabAll => "sync_stab_all",
            Self::Stable { .. } => "stable",
            Self::Rollback { .. } => "rollback",
            Self::List(_) => "list",
        }
    }
}

/// One disk extent feeding a read, and where its bytes land in the
/// result buffer.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ReadChunk {
    /// Destination offset in `op.data`.
    pub buf_offset: usize,
    /// Bytes to copy.
    pub len: usize,
}

#[derive(Debug, Default)]
pub(crate) struct ReadMachine {
    pub chunks: Vec<ReadChunk>,
    pub version: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteStage {
    Pending,
    Submitted,
}

#[derive(Debug)]
pub(crate) struct WriteMachine {
    pub stage: WriteStage,
    /// Version assigned in enqueue_write.
    pub ov: ObjectVersion,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncStage {
    Start,
    DataSyncSent,
    DataSyncDone,
    JournalSyncSent,
    Done,
}

#[derive(Debug)]
pub(crate) struct SyncMachine {
    pub stage: SyncStage,
    /// Big writes captured by this sync.
    pub big: Vec<ObjectVersion>,
    /// Small writes (and deletes) captured by this sync.
    pub small: Vec<ObjectVersion>,
    /// Earlier syncs still in progress; completion is withheld until
    /// this reaches zero (FIFO durability acknowledgement).
    pub prev_sync_count: usize,
}

/// Marker for a STABLE/ROLLBACK whose decision records are in flight;
/// the in-memory state mutates only once the journal fsync lands.
#[derive(Debug)]
pub(crate) struct StableMachine;

/// Per-machine private state, carried inside the operation.
pub(crate) enum MachineState {
    None,
    Read(ReadMachine),
    Write(WriteMachine),
    Sync(SyncMachine),
    Stable(StableMachine),
}

/// A submitted operation, owned by the engine until completion.
pub struct Operation {
    pub kind: OpKind,
    /// >= 0 on success, negative errno on failure.
    pub retval: i64,
    /// Out: assigned write version, resolved read version, or the stable
    /// partition length of a LIST.
    pub version: u64,
    /// Out: read payload.
    pub data: Vec<u8>,
    /// Out: LIST results (stable partition first).
    pub list: Vec<ObjectVersion>,

    pub(crate) callback: Option<Callback>,
    pub(crate) wait: WaitReason,
    pub(crate) wait_detail: u64,
    pub(crate) pending_ios: u32,
    pub(crate) state: MachineState,
    /// Enqueued by the engine itself (auto-commit sync, stab-all step).
    pub(crate) internal: bool,
    /// Submission time, for the latency counters.
    pub(crate) started: Option<std::time::Instant>,
}

impl Operation {
    pub fn new(kind: OpKind, callback: Callback) -> Self {
        Self {
            kind,
            retval: 0,
            version: 0,
            data: Vec::new(),
            list: Vec::new(),
            callback: Some(callback),
            wait: WaitReason::None,
            wait_detail: 0,
            pending_ios: 0,
            state: MachineState::None,
            internal: false,
            started: None,
        }
    }

    pub fn read(
        oid: ObjectId,
        offset: u32,
        len: u32,
        callback: impl FnOnce(&mut Operation) + 'static,
    ) -> Self {
        Self::new(OpKind::Read { oid, offset, len }, Box::new(callback))
    }

    pub fn write(
        oid: ObjectId,
        version: u64,
        offset: u32,
        data: Bytes,
        callback: impl FnOnce(&mut Operation) + 'static,
    ) -> Self {
        let len = data.len() as u32;
        Self::new(
            OpKind::Write {
                oid,
                version,
                offset,
                len,
                data,
                ext_bitmap: None,
                stable: false,
            },
            Box::new(callback),
        )
    }

    pub fn write_stable(
        oid: ObjectId,
        version: u64,
        offset: u32,
        data: Bytes,
        callback: impl FnOnce(&mut Operation) + 'static,
    ) -> Self {
        let len = data.len() as u32;
        Self::new(
            OpKind::Write {
                oid,
                version,
                offset,
                len,
                data,
                ext_bitmap: None,
                stable: true,
            },
            Box::new(callback),
        )
    }

    pub fn delete(
        oid: ObjectId,
        version: u64,
        callback: impl FnOnce(&mut Operation) + 'static,
    ) -> Self {
        Self::new(OpKind::Delete { oid, version }, Box::new(callback))
    }

    pub fn sync(callback: impl FnOnce(&mut Operation) + 'static) -> Self {
        Self::new(OpKind::Sync, Box::new(callback))
    }

    pub fn sync_stab_all(callback: impl FnOnce(&mut Operation) + 'static) -> Self {
        Self::new(OpKind::SyncStabAll, Box::new(callback))
    }

    pub fn stable(
        versions: Vec<ObjectVersion>,
        callback: impl FnOnce(&mut Operation) + 'static,
    ) -> Self {
        Self::new(OpKind::Stable { versions }, Box::new(callback))
    }

    pub fn rollback(
        versions: Vec<ObjectVersion>,
        callback: impl FnOnce(&mut Operation) + 'static,
    ) -> Self {
        Self::new(OpKind::Rollback { versions }, Box::new(callback))
    }

    pub fn list(params: ListParams, callback: impl FnOnce(&mut Operation) + 'static) -> Self {
        Self::new(OpKind::List(params), Box::new(callback))
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind.name())
            .field("retval", &self.retval)
            .field("wait", &self.wait)
            .field("pending_ios", &self.pending_ios)
            .finish()
    }
}
