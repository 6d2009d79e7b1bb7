//! Formatting and startup recovery.
//!
//! `Engine::format` lays down the metadata superblock, zeroed clean-entry
//! slots and an empty journal. `Engine::open` rebuilds the in-memory
//! state in two passes: scan the metadata region into `clean_db` and the
//! allocator, then replay the journal from the START record's chained CRC
//! forward, applying each valid record as the live state machines would,
//! and truncating the tail at the first mismatch.

use crate::allocator::DataAllocator;
use crate::engine::Engine;
use crate::index::{CleanDb, CleanEntry, DirtyDb, DirtyEntry, DirtyState, Stage, WriteKind};
use crate::journal::{decode_record, Journal, RecordBody, RECORD_HEADER_SIZE};
use crate::meta::{self, Superblock};
use crate::raw_io::{AlignedBuffer, RawFile};
use crate::ring::Regions;
use blockvault_common::{EngineConfig, Error, ObjectVersion, RegionConfig, Result};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Smallest journal: enough sectors for the START sector plus a ring that
/// can hold a block-sized payload.
const MIN_JOURNAL_SECTORS: u64 = 16;

/// Data/metadata geometry derived from the configuration.
pub(crate) struct Geometry {
    pub block_count: u64,
    pub entry_blocks: u64,
}

pub(crate) fn geometry(cfg: &EngineConfig, regions: &Regions) -> Result<Geometry> {
    let block_count = regions.data.size() / u64::from(cfg.block_size);
    if block_count == 0 {
        return Err(Error::config(format!(
            "data region of {} bytes holds no {}-byte block",
            regions.data.size(),
            cfg.block_size
        )));
    }
    let epb = cfg.entries_per_meta_block() as u64;
    let entry_blocks = block_count.div_ceil(epb);
    let meta_needed = (1 + entry_blocks) * u64::from(cfg.meta_block_size);
    if regions.meta.size() < meta_needed {
        return Err(Error::config(format!(
            "metadata region of {} bytes cannot describe {} data blocks ({} needed)",
            regions.meta.size(),
            block_count,
            meta_needed
        )));
    }
    let journal_sectors = regions.journal.size() / u64::from(cfg.journal_block_size);
    if journal_sectors < MIN_JOURNAL_SECTORS
        || u64::from(cfg.journal_block_size) * (journal_sectors - 2)
            < u64::from(cfg.block_size)
    {
        return Err(Error::config(format!(
            "journal region of {} bytes is too small",
            regions.journal.size()
        )));
    }
    Ok(Geometry {
        block_count,
        entry_blocks,
    })
}

fn open_region(
    rc: &RegionConfig,
    alignment: u32,
    direct: bool,
    write: bool,
    create: bool,
) -> Result<RawFile> {
    if create && !rc.device.exists() {
        if rc.size == 0 {
            return Err(Error::config(format!(
                "cannot create {} without an explicit size",
                rc.device.display()
            )));
        }
        RawFile::create(&rc.device, rc.offset + rc.size, alignment as usize, direct)?;
    }
    RawFile::open(
        &rc.device,
        rc.offset,
        rc.size,
        alignment as usize,
        direct,
        write,
    )
}

pub(crate) fn open_regions(cfg: &EngineConfig, create: bool) -> Result<Regions> {
    let write = create || !cfg.readonly;
    Ok(Regions {
        data: open_region(&cfg.data, cfg.disk_alignment, cfg.direct_io, write, create)?,
        meta: open_region(&cfg.meta, cfg.meta_block_size, cfg.direct_io, write, create)?,
        journal: open_region(
            &cfg.journal,
            cfg.journal_block_size,
            cfg.direct_io,
            write,
            create,
        )?,
    })
}

/// Write zeros over `[offset, offset + len)` in 1 MiB chunks.
fn zero_range(file: &RawFile, offset: u64, len: u64, alignment: usize) -> Result<()> {
    const CHUNK: u64 = 1 << 20;
    let buf = AlignedBuffer::new(CHUNK.min(len) as usize, alignment);
    let mut pos = offset;
    while pos < offset + len {
        let n = (offset + len - pos).min(buf.len() as u64);
        file.write_at(pos, &buf.as_slice()[..n as usize])?;
        pos += n;
    }
    Ok(())
}

impl Engine {
    /// Initialize all three regions. Destroys any previous content.
    pub fn format(cfg: &EngineConfig) -> Result<()> {
        cfg.validate()?;
        let regions = open_regions(cfg, true)?;
        let geo = geometry(cfg, &regions)?;

        // Metadata: superblock + zeroed clean-entry slots.
        let meta_block_size = u64::from(cfg.meta_block_size);
        zero_range(
            &regions.meta,
            0,
            (1 + geo.entry_blocks) * meta_block_size,
            cfg.meta_block_size as usize,
        )?;
        let mut sb_block =
            AlignedBuffer::new(cfg.meta_block_size as usize, cfg.meta_block_size as usize);
        sb_block.copy_from(&Superblock::from_config(cfg).encode());
        regions.meta.write_at(0, sb_block.as_slice())?;
        regions.meta.sync_data()?;

        // Journal: zeroed ring plus the initial START sector.
        let sector = u64::from(cfg.journal_block_size);
        zero_range(
            &regions.journal,
            0,
            regions.journal.size(),
            cfg.journal_block_size as usize,
        )?;
        let journal = Journal::new(
            regions.journal.size(),
            sector,
            cfg.journal_sector_buffer_count,
            cfg.bitmap_bytes(),
        );
        let start = journal.encode_start_sector(sector, 0);
        regions.journal.write_at(0, start.as_slice())?;
        regions.journal.sync_data()?;

        info!(
            blocks = geo.block_count,
            journal_bytes = regions.journal.size(),
            "formatted"
        );
        Ok(())
    }

    /// Open a formatted engine: metadata scan, then journal replay.
    pub fn open(cfg: EngineConfig) -> Result<Engine> {
        cfg.validate()?;
        let regions = open_regions(&cfg, false)?;
        let geo = geometry(&cfg, &regions)?;

        // Superblock.
        let meta_block_size = cfg.meta_block_size as usize;
        let mut sb_block = AlignedBuffer::new(meta_block_size, meta_block_size);
        regions.meta.read_at(0, sb_block.as_mut_slice())?;
        Superblock::decode(sb_block.as_slice())?.check_config(&cfg)?;

        // Pass 1: clean entries and the allocator.
        let mut clean_db = CleanDb::new();
        let mut alloc = DataAllocator::new(geo.block_count);
        let stale = scan_meta(&cfg, &regions, &geo, &mut clean_db, &mut alloc)?;
        if !stale.is_empty() && !cfg.readonly {
            rewrite_stale_slots(&cfg, &regions, &stale)?;
        }
        info!(objects = clean_db.len(), "metadata scan complete");

        // Pass 2: journal replay.
        let mut journal = Journal::new(
            regions.journal.size(),
            u64::from(cfg.journal_block_size),
            cfg.journal_sector_buffer_count,
            cfg.bitmap_bytes(),
        );
        load_journal_image(&regions, &mut journal)?;
        let mut dirty_db = DirtyDb::new();
        replay_journal(&cfg, &mut journal, &mut clean_db, &mut dirty_db, &mut alloc)?;
        info!(pending = dirty_db.len(), "journal replay complete");

        let mut engine = Engine::assemble(
            cfg,
            regions,
            journal,
            alloc,
            clean_db,
            dirty_db,
            geo.block_count,
        );
        // Rebuild the unstable-writes map and requeue flushable objects.
        let mut flushable = Vec::new();
        for (ov, entry) in &engine.dirty_db {
            if entry.state.stable {
                flushable.push(ov.oid);
            } else {
                let latest = engine.unstable_writes.entry(ov.oid).or_insert(0);
                *latest = (*latest).max(ov.version);
            }
        }
        for oid in flushable {
            engine.flusher.request_flush(oid);
        }
        Ok(engine)
    }
}

/// Scan the clean-entry slots. Returns stale slots (older duplicates of
/// an object) that must be zeroed back to disk.
fn scan_meta(
    cfg: &EngineConfig,
    regions: &Regions,
    geo: &Geometry,
    clean_db: &mut CleanDb,
    alloc: &mut DataAllocator,
) -> Result<Vec<u64>> {
    let meta_block_size = cfg.meta_block_size as usize;
    let epb = cfg.entries_per_meta_block();
    let entry_size = cfg.clean_entry_size();
    let bitmap_bytes = cfg.bitmap_bytes();
    const BLOCKS_PER_READ: u64 = 64;

    let mut stale: Vec<u64> = Vec::new();
    let mut meta_block = 1u64;
    while meta_block <= geo.entry_blocks {
        let count = BLOCKS_PER_READ.min(geo.entry_blocks - meta_block + 1);
        let mut buf = AlignedBuffer::new(count as usize * meta_block_size, meta_block_size);
        regions.meta.read_at(
            meta_block * meta_block_size as u64,
            &mut buf.as_mut_slice()[..count as usize * meta_block_size],
        )?;
        for block_in_read in 0..count {
            let base = block_in_read as usize * meta_block_size;
            for slot in 0..epb {
                let data_block =
                    (meta_block + block_in_read - 1) * epb as u64 + slot as u64;
                if data_block >= geo.block_count {
                    break;
                }
                let slot_bytes = &buf.as_slice()[base + slot * entry_size..][..entry_size];
                let Some((oid, version, bitmap, ext_bitmap)) =
                    meta::decode_entry(slot_bytes, bitmap_bytes)
                else {
                    continue;
                };
                match clean_db.get(&oid) {
                    Some(existing) if existing.version >= version => {
                        // Crash between writing a new slot and zeroing
                        // the old one leaves a duplicate.
                        warn!(%oid, version, block = data_block, "stale duplicate clean entry");
                        stale.push(data_block);
                        continue;
                    }
                    Some(existing) => {
                        warn!(%oid, old = existing.version, "superseded clean entry");
                        stale.push(existing.block);
                    }
                    None => {}
                }
                alloc.mark_used(data_block);
                clean_db.insert(
                    oid,
                    CleanEntry {
                        version,
                        block: data_block,
                        bitmap,
                        ext_bitmap,
                    },
                );
            }
        }
        meta_block += count;
    }
    // A superseded entry's block goes back to the free pool.
    for &block in &stale {
        if alloc.is_allocated(block) {
            alloc.free(block);
        }
    }
    Ok(stale)
}

/// Zero the given stale slots on disk so the duplicate cannot resurface.
fn rewrite_stale_slots(cfg: &EngineConfig, regions: &Regions, stale: &[u64]) -> Result<()> {
    let meta_block_size = cfg.meta_block_size as usize;
    let entry_size = cfg.clean_entry_size();
    let mut by_block: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
    for &block in stale {
        let (meta_block, offset) = meta::entry_location(cfg, block);
        by_block.entry(meta_block).or_default().push(offset);
    }
    for (meta_block, offsets) in by_block {
        let mut buf = AlignedBuffer::new(meta_block_size, meta_block_size);
        regions
            .meta
            .read_at(meta_block * meta_block_size as u64, buf.as_mut_slice())?;
        for offset in offsets {
            buf.as_mut_slice()[offset..offset + entry_size].fill(0);
        }
        regions
            .meta
            .write_at(meta_block * meta_block_size as u64, buf.as_slice())?;
    }
    regions.meta.sync_data()?;
    Ok(())
}

/// Read the whole journal region into the in-memory image.
fn load_journal_image(regions: &Regions, journal: &mut Journal) -> Result<()> {
    const CHUNK: usize = 1 << 20;
    let alignment = regions.journal.alignment();
    let len = journal.len as usize;
    let mut buf = AlignedBuffer::new(CHUNK.min(len), alignment);
    let mut pos = 0usize;
    while pos < len {
        let n = (len - pos).min(buf.len());
        regions
            .journal
            .read_at(pos as u64, &mut buf.as_mut_slice()[..n])?;
        journal.buffer[pos..pos + n].copy_from_slice(&buf.as_slice()[..n]);
        pos += n;
    }
    Ok(())
}

/// Replay the journal ring, applying records as the live machines would.
fn replay_journal(
    cfg: &EngineConfig,
    journal: &mut Journal,
    clean_db: &mut CleanDb,
    dirty_db: &mut DirtyDb,
    alloc: &mut DataAllocator,
) -> Result<()> {
    let sector = journal.sector_size;
    let len = journal.len;
    let bitmap_bytes = cfg.bitmap_bytes();

    // The START sector seeds the walk.
    let start_sector = journal.buffer[..sector as usize].to_vec();
    let (start, _, _) = decode_record(&start_sector, 0, bitmap_bytes)
        .ok_or_else(|| Error::Unformatted("journal START sector is invalid".into()))?;
    let RecordBody::Start {
        journal_start,
        crc32_begin,
    } = start
    else {
        return Err(Error::Unformatted("journal does not begin with START".into()));
    };
    if journal_start < sector || journal_start >= len || journal_start % sector != 0 {
        return Err(Error::corruption(format!(
            "journal START points outside the ring: {journal_start:#x}"
        )));
    }

    let mut pos = journal_start;
    let mut crc = crc32_begin;
    // Writer's next_free, reconstructed by simulating its allocator.
    let mut sim_next = pos + sector;
    let mut sim_alloc = |sim_next: &mut u64, bytes: u64| -> u64 {
        let at = if *sim_next + bytes <= len {
            *sim_next
        } else {
            sector
        };
        *sim_next = at + bytes;
        at
    };
    let mut chain_seed: BTreeMap<u64, u32> = BTreeMap::new();
    let mut any_records = false;
    let mut visited = 0u64;
    let mut next_free = journal_start;
    // The last record sector with valid content: the writer resumes
    // filling it, so it becomes the current sector buffer.
    let mut resume: Option<(u64, usize)> = None;

    'ring: loop {
        visited += sector;
        if visited > len {
            warn!("journal replay wrapped past the ring; treating as corrupt tail");
            break;
        }
        chain_seed.insert(pos, crc);
        let mut in_pos = 0usize;
        let mut progressed = false;
        while in_pos + RECORD_HEADER_SIZE <= sector as usize {
            let window = &journal.buffer[(pos + in_pos as u64) as usize..(pos + sector) as usize];
            let Some((body, size, record_crc)) = decode_record(window, crc, bitmap_bytes) else {
                break;
            };
            // Small-write payloads occupy sectors the writer allocated
            // between record sectors; mirror that allocation to validate
            // the recorded payload offset.
            if let RecordBody::SmallWrite {
                len: data_len,
                data_offset,
                data_crc32,
                ..
            } = &body
            {
                let padded = u64::from(*data_len).div_ceil(sector) * sector;
                let sim_save = sim_next;
                let expected = sim_alloc(&mut sim_next, padded);
                if expected != *data_offset {
                    warn!(
                        expected,
                        got = *data_offset,
                        "small-write payload out of place; truncating replay"
                    );
                    sim_next = sim_save;
                    resume = Some((pos, in_pos));
                    next_free = sim_next;
                    break 'ring;
                }
                let payload = &journal.buffer
                    [*data_offset as usize..(*data_offset + u64::from(*data_len)) as usize];
                if crc32c::crc32c(payload) != *data_crc32 {
                    warn!("small-write payload checksum mismatch; truncating replay");
                    sim_next = sim_save;
                    resume = Some((pos, in_pos));
                    next_free = sim_next;
                    break 'ring;
                }
            }
            apply_replayed(body, pos, clean_db, dirty_db, alloc, journal);
            crc = record_crc;
            in_pos += size;
            progressed = true;
            any_records = true;
        }
        if !progressed {
            // Log ends before this sector; it was never allocated.
            chain_seed.remove(&pos);
            next_free = pos;
            break;
        }
        resume = Some((pos, in_pos));
        pos = sim_alloc(&mut sim_next, sector);
        next_free = pos;
    }

    journal.recover_state(journal_start, next_free, crc, !any_records, chain_seed);
    if let Some((offset, fill)) = resume {
        // Writing continues inside the tail sector, overwriting whatever
        // the truncated remainder held.
        journal.slots[0].offset = offset;
        journal.slots[0].fill = fill;
        journal.cur_slot = 0;
    }
    debug!(
        used_start = journal.used_start,
        next_free = journal.next_free,
        "journal state recovered"
    );
    Ok(())
}

fn apply_replayed(
    body: RecordBody,
    record_sector: u64,
    clean_db: &mut CleanDb,
    dirty_db: &mut DirtyDb,
    alloc: &mut DataAllocator,
    journal: &mut Journal,
) {
    let clean_version = |clean_db: &CleanDb, ov: &ObjectVersion| {
        clean_db.get(&ov.oid).map_or(0, |e| e.version)
    };
    match body {
        RecordBody::Start { .. } => {}
        RecordBody::SmallWrite {
            ov,
            offset,
            len,
            data_offset,
            ext_bitmap,
            instant,
            ..
        } => {
            if clean_version(clean_db, &ov) >= ov.version {
                return; // Already flushed to the metadata region.
            }
            let mut state = DirtyState::new(WriteKind::Small);
            state.stage = Stage::JournalSynced;
            state.stable = instant;
            dirty_db.insert(
                ov,
                DirtyEntry {
                    state,
                    location: data_offset,
                    offset,
                    len,
                    journal_sector: Some(record_sector),
                    ext_bitmap,
                },
            );
            journal.sector_ref(record_sector);
        }
        RecordBody::BigWrite {
            ov,
            offset,
            len,
            location,
            ext_bitmap,
            instant,
        } => {
            if clean_version(clean_db, &ov) >= ov.version {
                return;
            }
            let mut state = DirtyState::new(WriteKind::Big);
            state.stage = Stage::MetaSynced;
            state.stable = instant;
            dirty_db.insert(
                ov,
                DirtyEntry {
                    state,
                    location,
                    offset,
                    len,
                    journal_sector: Some(record_sector),
                    ext_bitmap,
                },
            );
            alloc.mark_used(location);
            journal.sector_ref(record_sector);
        }
        RecordBody::Delete { ov } => {
            if clean_version(clean_db, &ov) >= ov.version {
                return;
            }
            let mut state = DirtyState::new(WriteKind::Delete);
            state.stage = Stage::JournalSynced;
            state.stable = true;
            dirty_db.insert(
                ov,
                DirtyEntry {
                    state,
                    location: u64::MAX,
                    offset: 0,
                    len: 0,
                    journal_sector: Some(record_sector),
                    ext_bitmap: Vec::new(),
                },
            );
            journal.sector_ref(record_sector);
        }
        RecordBody::Stable { versions } => {
            for ov in versions {
                if let Some(entry) = dirty_db.get_mut(&ov) {
                    entry.state.stable = true;
                }
                // Versions already flushed (or trimmed) need nothing.
            }
        }
        RecordBody::Rollback { versions } => {
            for target in versions {
                let victims: Vec<ObjectVersion> = dirty_db
                    .range(
                        ObjectVersion::new(target.oid, target.version)
                            ..=ObjectVersion::new(target.oid, u64::MAX),
                    )
                    .map(|(&ov, _)| ov)
                    .collect();
                for victim in victims {
                    if let Some(entry) = dirty_db.remove(&victim) {
                        if entry.state.kind == WriteKind::Big && entry.location != u64::MAX {
                            alloc.free(entry.location);
                        }
                        if let Some(sector) = entry.journal_sector {
                            journal.sector_unref(sector);
                        }
                    }
                }
            }
        }
    }
}
