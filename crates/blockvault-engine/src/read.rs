//! Overlay read resolution.
//!
//! A read scans the object's dirty versions from the highest readable one
//! downward, treating each as a potentially overlapping layer: small and
//! big writes contribute their byte ranges, a delete zeroes the rest.
//! Whatever remains uncovered afterwards comes from the clean entry's
//! data block — except sub-ranges whose clean bitmap bit is clear, which
//! were never written and read as zeros without touching the disk.
//!
//! Journal-resident small-write payloads are served from the in-memory
//! journal image; at most one data-region read is issued per contributing
//! extent.

use crate::engine::{Dispatch, Engine, TAG_READ_BASE};
use crate::index::{bitmap_test, WriteKind};
use crate::op::{MachineState, OpKind, Operation, ReadChunk, ReadMachine, WaitReason};
use crate::ring::{Completion, Owner, Target};
use blockvault_common::ObjectVersion;

/// Byte interval `[start, end)` within the block.
type Extent = (u32, u32);

/// Remove `cut` from every interval in `gaps`, splitting as needed.
/// Returns the parts of `cut` that actually overlapped.
fn carve(gaps: &mut Vec<Extent>, cut: Extent) -> Vec<Extent> {
    let mut covered = Vec::new();
    let mut rest = Vec::with_capacity(gaps.len() + 1);
    for &(start, end) in gaps.iter() {
        let overlap_start = start.max(cut.0);
        let overlap_end = end.min(cut.1);
        if overlap_start >= overlap_end {
            rest.push((start, end));
            continue;
        }
        covered.push((overlap_start, overlap_end));
        if start < overlap_start {
            rest.push((start, overlap_start));
        }
        if overlap_end < end {
            rest.push((overlap_end, end));
        }
    }
    *gaps = rest;
    covered
}

impl Engine {
    pub(crate) fn dequeue_read(&mut self, id: u64, op: &mut Operation) -> Dispatch {
        let OpKind::Read { oid, offset, len } = op.kind else {
            unreachable!()
        };
        let mut machine = ReadMachine::default();
        op.data = vec![0u8; len as usize];

        let mut gaps: Vec<Extent> = if len > 0 {
            vec![(offset, offset + len)]
        } else {
            Vec::new()
        };

        // Count the data-region reads first so ring exhaustion parks the
        // op before anything is submitted.
        let mut disk_reads: Vec<(u64, ReadChunk)> = Vec::new();

        let versions: Vec<ObjectVersion> = self
            .dirty_db
            .range(
                ObjectVersion::new(oid, 0)..=ObjectVersion::new(oid, u64::MAX),
            )
            .rev()
            .map(|(&ov, _)| ov)
            .collect();
        for ov in versions {
            if gaps.is_empty() {
                break;
            }
            let entry = &self.dirty_db[&ov];
            if !entry.state.is_readable() {
                // Not yet fully placed; unacknowledged and invisible.
                continue;
            }
            if machine.version == 0 {
                machine.version = ov.version;
            }
            match entry.state.kind {
                WriteKind::Delete => {
                    // Everything below this version reads as zeros.
                    gaps.clear();
                }
                WriteKind::Small => {
                    let span = (entry.offset, entry.offset + entry.len);
                    for (seg_start, seg_end) in carve(&mut gaps, span) {
                        // Serve inline bytes from the journal image.
                        let src = entry.location + u64::from(seg_start - entry.offset);
                        let dst = (seg_start - offset) as usize;
                        let n = (seg_end - seg_start) as usize;
                        op.data[dst..dst + n].copy_from_slice(
                            &self.journal.buffer[src as usize..src as usize + n],
                        );
                    }
                }
                WriteKind::Big => {
                    let span = (entry.offset, entry.offset + entry.len);
                    let block_base = entry.location * u64::from(self.cfg.block_size);
                    for (seg_start, seg_end) in carve(&mut gaps, span) {
                        disk_reads.push((
                            block_base + u64::from(seg_start),
                            ReadChunk {
                                buf_offset: (seg_start - offset) as usize,
                                len: (seg_end - seg_start) as usize,
                            },
                        ));
                    }
                }
            }
        }

        if !gaps.is_empty() {
            if let Some(clean) = self.clean_db.get(&oid) {
                if machine.version == 0 {
                    machine.version = clean.version;
                }
                let granularity = self.cfg.bitmap_granularity;
                let block_base = clean.block * u64::from(self.cfg.block_size);
                for (seg_start, seg_end) in gaps.drain(..) {
                    // Split the segment into runs of written granules;
                    // unwritten granules stay zero without a disk read.
                    let mut run_start: Option<u32> = None;
                    let mut pos = seg_start;
                    while pos < seg_end {
                        let granule_end = (pos / granularity + 1) * granularity;
                        let written = bitmap_test(&clean.bitmap, granularity, pos);
                        if written && run_start.is_none() {
                            run_start = Some(pos);
                        }
                        if !written {
                            if let Some(start) = run_start.take() {
                                disk_reads.push((
                                    block_base + u64::from(start),
                                    ReadChunk {
                                        buf_offset: (start - offset) as usize,
                                        len: (pos - start) as usize,
                                    },
                                ));
                            }
                        }
                        pos = granule_end.min(seg_end);
                    }
                    if let Some(start) = run_start {
                        disk_reads.push((
                            block_base + u64::from(start),
                            ReadChunk {
                                buf_offset: (start - offset) as usize,
                                len: (seg_end - start) as usize,
                            },
                        ));
                    }
                }
            }
            // No clean entry: the remainder reads as zeros.
        }
        if disk_reads.is_empty() {
            op.version = machine.version;
            op.retval = i64::from(len);
            return Dispatch::Done;
        }
        if self.ring.space_left() < disk_reads.len() {
            return self.park(op, WaitReason::Sqe(disk_reads.len()));
        }
        for (index, (disk_offset, chunk)) in disk_reads.iter().enumerate() {
            let pushed = self.ring.push_read(
                Target::Data,
                *disk_offset,
                chunk.len,
                Owner::Op(id),
                TAG_READ_BASE + index as u32,
            );
            debug_assert!(pushed, "ring space was checked");
            machine.chunks.push(*chunk);
        }
        op.pending_ios = disk_reads.len() as u32;
        op.state = MachineState::Read(machine);
        Dispatch::InFlight
    }

    /// Copy one completed extent into the result buffer.
    pub(crate) fn read_chunk_done(&mut self, op: &mut Operation, completion: Completion) {
        let MachineState::Read(machine) = &op.state else {
            self.fatal("read completion for a non-read operation")
        };
        let index = (completion.tag - TAG_READ_BASE) as usize;
        let chunk = machine.chunks[index];
        let data = completion
            .data
            .unwrap_or_else(|| self.fatal("read completion without data"));
        op.data[chunk.buf_offset..chunk.buf_offset + chunk.len]
            .copy_from_slice(&data.as_slice()[..chunk.len]);
    }

    /// All extents landed; acknowledge the read.
    pub(crate) fn read_done(&mut self, mut op: Operation) {
        let MachineState::Read(machine) = &op.state else {
            unreachable!()
        };
        op.version = machine.version;
        op.retval = match op.kind {
            OpKind::Read { len, .. } => i64::from(len),
            _ => unreachable!(),
        };
        self.finish_op(op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_carve_middle() {
        let mut gaps = vec![(0u32, 100u32)];
        let covered = carve(&mut gaps, (40, 60));
        assert_eq!(covered, vec![(40, 60)]);
        assert_eq!(gaps, vec![(0, 40), (60, 100)]);
    }

    #[test]
    fn test_carve_disjoint() {
        let mut gaps = vec![(0u32, 10u32)];
        let covered = carve(&mut gaps, (20, 30));
        assert!(covered.is_empty());
        assert_eq!(gaps, vec![(0, 10)]);
    }

    #[test]
    fn test_carve_spanning_multiple_gaps() {
        let mut gaps = vec![(0u32, 10u32), (20, 30), (40, 50)];
        let covered = carve(&mut gaps, (5, 45));
        assert_eq!(covered, vec![(5, 10), (20, 30), (40, 45)]);
        assert_eq!(gaps, vec![(0, 5), (45, 50)]);
    }
}
