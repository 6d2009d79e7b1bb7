//! Submission ring.
//!
//! A single-threaded cooperative driver with a bounded pool of submission
//! slots. Components format entries into the ring during the produce phase;
//! `submit` performs the queued I/O against the region files and queues a
//! typed [`Completion`] per entry, which the engine loop reaps and fans out
//! to the owning state machine.
//!
//! `save`/`restore` let a dispatcher speculatively format entries and roll
//! them back atomically when a later step of the same dispatch cannot
//! proceed, so partial failures never leak half-issued I/O.

use crate::raw_io::{AlignedBuffer, RawFile};
use std::collections::VecDeque;

/// Which region an entry targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Data,
    Meta,
    Journal,
}

/// Who gets the completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    /// An operation in the submit queue, by id.
    Op(u64),
    /// A flush actor, by index.
    Flusher(usize),
}

/// A reaped completion. `result` is the byte count on success or a
/// negative errno. Reads hand their buffer back through `data`.
#[derive(Debug)]
pub struct Completion {
    pub owner: Owner,
    pub tag: u32,
    pub result: i64,
    pub data: Option<AlignedBuffer>,
}

enum IoKind {
    ReadAt { offset: u64, len: usize },
    WriteAt { offset: u64, buf: AlignedBuffer },
    Fsync,
}

struct Entry {
    target: Target,
    kind: IoKind,
    owner: Owner,
    tag: u32,
}

/// The three region files the ring executes against.
pub struct Regions {
    pub data: RawFile,
    pub meta: RawFile,
    pub journal: RawFile,
}

impl Regions {
    fn file(&self, target: Target) -> &RawFile {
        match target {
            Target::Data => &self.data,
            Target::Meta => &self.meta,
            Target::Journal => &self.journal,
        }
    }
}

/// Bounded submission ring with typed completions.
pub struct IoRing {
    depth: usize,
    queued: Vec<Entry>,
    completions: VecDeque<Completion>,
}

impl IoRing {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            queued: Vec::with_capacity(depth),
            completions: VecDeque::new(),
        }
    }

    /// Free submission slots.
    pub fn space_left(&self) -> usize {
        self.depth - self.queued.len()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Fraction of slots in use, in percent.
    pub fn fill_percent(&self) -> usize {
        self.queued.len() * 100 / self.depth
    }

    /// Checkpoint of the submission position, for `restore`.
    pub fn save(&self) -> usize {
        self.queued.len()
    }

    /// Drop every entry formatted after the matching `save`.
    pub fn restore(&mut self, mark: usize) {
        debug_assert!(mark <= self.queued.len());
        self.queued.truncate(mark);
    }

    /// Queue a read of `len` bytes. Returns false when the ring is full.
    #[must_use]
    pub fn push_read(&mut self, target: Target, offset: u64, len: usize, owner: Owner, tag: u32) -> bool {
        self.push(Entry {
            target,
            kind: IoKind::ReadAt { offset, len },
            owner,
            tag,
        })
    }

    /// Queue a write of an owned aligned buffer.
    #[must_use]
    pub fn push_write(&mut self, target: Target, offset: u64, buf: AlignedBuffer, owner: Owner, tag: u32) -> bool {
        self.push(Entry {
            target,
            kind: IoKind::WriteAt { offset, buf },
            owner,
            tag,
        })
    }

    /// Queue an fdatasync of a region.
    #[must_use]
    pub fn push_fsync(&mut self, target: Target, owner: Owner, tag: u32) -> bool {
        self.push(Entry {
            target,
            kind: IoKind::Fsync,
            owner,
            tag,
        })
    }

    fn push(&mut self, entry: Entry) -> bool {
        if self.queued.len() >= self.depth {
            return false;
        }
        self.queued.push(entry);
        true
    }

    /// Execute all queued entries against the region files. Every entry
    /// produces exactly one completion. Returns how many were submitted.
    pub fn submit(&mut self, regions: &Regions) -> usize {
        let entries = std::mem::take(&mut self.queued);
        let count = entries.len();
        for entry in entries {
            let file = regions.file(entry.target);
            let (result, data) = match entry.kind {
                IoKind::ReadAt { offset, len } => {
                    let mut buf = AlignedBuffer::new(len, file.alignment());
                    match file.read_at(offset, &mut buf.as_mut_slice()[..len]) {
                        Ok(()) => (len as i64, Some(buf)),
                        Err(e) => (e.errno(), None),
                    }
                }
                IoKind::WriteAt { offset, buf } => match file.write_at(offset, buf.as_slice()) {
                    Ok(()) => (buf.len() as i64, None),
                    Err(e) => (e.errno(), None),
                },
                IoKind::Fsync => match file.sync_data() {
                    Ok(()) => (0, None),
                    Err(e) => (e.errno(), None),
                },
            };
            self.completions.push_back(Completion {
                owner: entry.owner,
                tag: entry.tag,
                result,
                data,
            });
        }
        count
    }

    /// Reap the next completion, in submission order.
    pub fn reap(&mut self) -> Option<Completion> {
        self.completions.pop_front()
    }

    pub fn has_queued(&self) -> bool {
        !self.queued.is_empty()
    }

    pub fn has_completions(&self) -> bool {
        !self.completions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_regions(dir: &std::path::Path) -> Regions {
        let mk = |name: &str| {
            RawFile::create(dir.join(name), 64 * 1024, 512, false).unwrap()
        };
        Regions {
            data: mk("data.bin"),
            meta: mk("meta.bin"),
            journal: mk("journal.bin"),
        }
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = tempdir().unwrap();
        let regions = test_regions(dir.path());
        let mut ring = IoRing::new(8);

        let mut buf = AlignedBuffer::new(512, 512);
        buf.copy_from(&[0x5A; 512]);
        assert!(ring.push_write(Target::Data, 1024, buf, Owner::Op(1), 0));
        assert!(ring.push_fsync(Target::Data, Owner::Op(1), 1));
        assert_eq!(ring.submit(&regions), 2);

        let c1 = ring.reap().unwrap();
        assert_eq!(c1.result, 512);
        let c2 = ring.reap().unwrap();
        assert_eq!(c2.tag, 1);
        assert_eq!(c2.result, 0);

        assert!(ring.push_read(Target::Data, 1024, 512, Owner::Op(2), 7));
        ring.submit(&regions);
        let c = ring.reap().unwrap();
        assert_eq!(c.owner, Owner::Op(2));
        assert!(c.data.unwrap().as_slice().iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn test_save_restore_drops_speculative_entries() {
        let dir = tempdir().unwrap();
        let regions = test_regions(dir.path());
        let mut ring = IoRing::new(4);

        let mark = ring.save();
        let buf = AlignedBuffer::new(512, 512);
        assert!(ring.push_write(Target::Journal, 0, buf, Owner::Op(1), 0));
        ring.restore(mark);
        assert_eq!(ring.submit(&regions), 0);
        assert!(ring.reap().is_none());
    }

    #[test]
    fn test_ring_full() {
        let mut ring = IoRing::new(2);
        assert!(ring.push_fsync(Target::Data, Owner::Op(1), 0));
        assert!(ring.push_fsync(Target::Data, Owner::Op(1), 1));
        assert!(!ring.push_fsync(Target::Data, Owner::Op(1), 2));
        assert_eq!(ring.space_left(), 0);
    }
}
