//! Engine configuration.
//!
//! The engine operates on three regions (data, metadata, journal) that may
//! live on separate devices or at distinct offset/length pairs of a single
//! device. Every knob the engine consumes is a field here; defaults match
//! the common deployment (128 KiB data blocks, 4 KiB metadata blocks,
//! 512 B journal sectors).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Smallest supported data block size.
pub const MIN_BLOCK_SIZE: u32 = 4 * 1024;

/// Largest supported data block size.
pub const MAX_BLOCK_SIZE: u32 = 128 * 1024 * 1024;

/// Default data block size (128 KiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;

/// Default metadata block size (4 KiB).
pub const DEFAULT_META_BLOCK_SIZE: u32 = 4 * 1024;

/// Default journal sector size (512 B).
pub const DEFAULT_JOURNAL_BLOCK_SIZE: u32 = 512;

/// Location of one storage region: a device (or file) plus an
/// offset/length window inside it. `size == 0` means "to end of device".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Path to the device or file backing this region.
    pub device: PathBuf,
    /// Byte offset of the region within the device.
    pub offset: u64,
    /// Byte length of the region (0 = rest of the device).
    pub size: u64,
}

impl RegionConfig {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            offset: 0,
            size: 0,
        }
    }

    pub fn with_window(device: impl Into<PathBuf>, offset: u64, size: u64) -> Self {
        Self {
            device: device.into(),
            offset,
            size,
        }
    }
}

/// Automatic commit policy: which write classes are fsynced by the engine
/// immediately after completion, making an explicit `SYNC` a no-op for them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImmediateCommit {
    /// Writes are made durable only by explicit `SYNC`.
    #[default]
    None,
    /// Small (journaled) writes auto-commit; big writes still need `SYNC`.
    Small,
    /// All writes auto-commit; `SYNC` is a no-op.
    All,
}

impl ImmediateCommit {
    /// Whether a big (full-block) write auto-commits.
    #[must_use]
    pub fn covers_big(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Whether a small (journaled) write auto-commits.
    #[must_use]
    pub fn covers_small(&self) -> bool {
        matches!(self, Self::Small | Self::All)
    }
}

/// Full engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Data region: the array of fixed-size data blocks.
    pub data: RegionConfig,
    /// Metadata region: superblock plus packed clean entries.
    pub meta: RegionConfig,
    /// Journal region: circular log of fixed-size sectors.
    pub journal: RegionConfig,

    /// Data block size in bytes. Must be a power of two.
    pub block_size: u32,
    /// Metadata block size in bytes; clean entries never straddle one.
    pub meta_block_size: u32,
    /// Journal sector size in bytes; records never straddle one.
    pub journal_block_size: u32,

    /// Sub-block addressability unit: one clean-bitmap bit covers this
    /// many bytes of a data block.
    pub bitmap_granularity: u32,
    /// Minimum alignment for write offsets and lengths.
    pub disk_alignment: u32,

    /// Number of cooperative flush actors.
    pub flusher_count: usize,
    /// Number of in-flight journal sector buffers.
    pub journal_sector_buffer_count: usize,
    /// Submission ring depth.
    pub ring_depth: usize,

    /// Reject all mutating opcodes.
    pub readonly: bool,
    /// Automatic commit policy.
    pub immediate_commit: ImmediateCommit,
    /// Open region files with direct I/O (O_DIRECT / F_NOCACHE). Turn off
    /// for filesystems that do not support it (e.g. tmpfs in tests).
    pub direct_io: bool,
}

impl EngineConfig {
    /// Config for the common case of three standalone region files.
    pub fn with_devices(
        data: impl Into<PathBuf>,
        meta: impl Into<PathBuf>,
        journal: impl Into<PathBuf>,
    ) -> Self {
        Self {
            data: RegionConfig::new(data),
            meta: RegionConfig::new(meta),
            journal: RegionConfig::new(journal),
            ..Self::default()
        }
    }

    /// Bytes of one clean-entry bitmap (`block_size / bitmap_granularity`
    /// bits, rounded up to whole bytes).
    #[must_use]
    pub fn bitmap_bytes(&self) -> usize {
        ((self.block_size / self.bitmap_granularity) as usize).div_ceil(8)
    }

    /// On-disk size of one clean entry: 24-byte header plus two bitmaps.
    #[must_use]
    pub fn clean_entry_size(&self) -> usize {
        24 + 2 * self.bitmap_bytes()
    }

    /// Clean entries packed into one metadata block.
    #[must_use]
    pub fn entries_per_meta_block(&self) -> usize {
        self.meta_block_size as usize / self.clean_entry_size()
    }

    /// Validate geometry rules that do not depend on device sizes.
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || self.block_size < MIN_BLOCK_SIZE
            || self.block_size > MAX_BLOCK_SIZE
        {
            return Err(Error::config(format!(
                "block_size {} must be a power of two in [{}, {}]",
                self.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        if !self.journal_block_size.is_power_of_two() || self.journal_block_size < 512 {
            return Err(Error::config(format!(
                "journal_block_size {} must be a power of two >= 512",
                self.journal_block_size
            )));
        }
        if !self.meta_block_size.is_power_of_two() || self.meta_block_size < 512 {
            return Err(Error::config(format!(
                "meta_block_size {} must be a power of two >= 512",
                self.meta_block_size
            )));
        }
        if !self.bitmap_granularity.is_power_of_two()
            || self.bitmap_granularity > self.block_size
        {
            return Err(Error::config(format!(
                "bitmap_granularity {} must be a power of two <= block_size",
                self.bitmap_granularity
            )));
        }
        if !self.disk_alignment.is_power_of_two()
            || self.disk_alignment > self.block_size
            || self.bitmap_granularity % self.disk_alignment != 0
        {
            return Err(Error::config(format!(
                "disk_alignment {} must be a power of two dividing bitmap_granularity",
                self.disk_alignment
            )));
        }
        // A small-write record (12-byte header + 44 bytes + one ext
        // bitmap) must fit a journal sector, records never straddle one.
        if 56 + self.bitmap_bytes() > self.journal_block_size as usize {
            return Err(Error::config(format!(
                "journal_block_size {} cannot hold a small-write record ({} bytes)",
                self.journal_block_size,
                56 + self.bitmap_bytes()
            )));
        }
        if self.entries_per_meta_block() == 0 {
            return Err(Error::config(format!(
                "meta_block_size {} cannot hold a single clean entry ({} bytes)",
                self.meta_block_size,
                self.clean_entry_size()
            )));
        }
        if self.flusher_count == 0 {
            return Err(Error::config("flusher_count must be at least 1"));
        }
        if self.journal_sector_buffer_count < 2 {
            return Err(Error::config(
                "journal_sector_buffer_count must be at least 2",
            ));
        }
        if self.ring_depth < 4 {
            return Err(Error::config("ring_depth must be at least 4"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data: RegionConfig::new("/dev/null"),
            meta: RegionConfig::new("/dev/null"),
            journal: RegionConfig::new("/dev/null"),
            block_size: DEFAULT_BLOCK_SIZE,
            meta_block_size: DEFAULT_META_BLOCK_SIZE,
            journal_block_size: DEFAULT_JOURNAL_BLOCK_SIZE,
            bitmap_granularity: 4096,
            disk_alignment: 512,
            flusher_count: 4,
            journal_sector_buffer_count: 32,
            ring_depth: 512,
            readonly: false,
            immediate_commit: ImmediateCommit::None,
            direct_io: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_clean_entry_geometry() {
        let cfg = EngineConfig::default();
        // 128 KiB block / 4 KiB granularity = 32 bits = 4 bytes per bitmap.
        assert_eq!(cfg.bitmap_bytes(), 4);
        assert_eq!(cfg.clean_entry_size(), 32);
        assert_eq!(cfg.entries_per_meta_block(), 128);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let mut cfg = EngineConfig::default();
        cfg.block_size = 100_000; // not a power of two
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.journal_sector_buffer_count = 1;
        assert!(cfg.validate().is_err());

        let mut cfg = EngineConfig::default();
        cfg.disk_alignment = 8192; // does not divide bitmap_granularity
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_immediate_commit_coverage() {
        assert!(!ImmediateCommit::None.covers_small());
        assert!(ImmediateCommit::Small.covers_small());
        assert!(!ImmediateCommit::Small.covers_big());
        assert!(ImmediateCommit::All.covers_big());
        assert!(ImmediateCommit::All.covers_small());
    }
}
