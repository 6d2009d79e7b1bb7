//! Metadata region layout.
//!
//! Block 0 is the superblock; every following block holds packed clean
//! entries, one slot per data block, so slot *i* describes data block *i*:
//!
//! ```text
//! +-------+---------+---------+--------+------------+
//! | inode | stripe  | version | bitmap | ext_bitmap |
//! | 8B    | 8B      | 8B      | bb     | bb         |
//! +-------+---------+---------+--------+------------+
//! ```
//!
//! `version == 0` marks a free slot. Entries never straddle a metadata
//! block. A region without the superblock sentinel (including the legacy
//! pre-superblock layout) is rejected outright.

use blockvault_common::{EngineConfig, Error, ObjectId, Result};
use bytes::{Buf, BufMut};

/// Superblock magic ("BVMETA1\0").
pub const META_MAGIC: u64 = u64::from_le_bytes(*b"BVMETA1\0");

/// Current metadata format version.
pub const META_FORMAT_VERSION: u64 = 1;

/// Encoded superblock size.
pub const SUPERBLOCK_SIZE: usize = 40;

/// The metadata superblock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Superblock {
    pub meta_block_size: u32,
    pub data_block_size: u32,
    pub bitmap_granularity: u32,
}

impl Superblock {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            meta_block_size: cfg.meta_block_size,
            data_block_size: cfg.block_size,
            bitmap_granularity: cfg.bitmap_granularity,
        }
    }

    pub fn encode(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = Vec::with_capacity(SUPERBLOCK_SIZE);
        buf.put_u64_le(0);
        buf.put_u64_le(META_MAGIC);
        buf.put_u64_le(META_FORMAT_VERSION);
        buf.put_u32_le(self.meta_block_size);
        buf.put_u32_le(self.data_block_size);
        buf.put_u32_le(self.bitmap_granularity);
        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);
        buf.try_into().expect("fixed superblock size")
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < SUPERBLOCK_SIZE {
            return Err(Error::Unformatted("metadata region too small".into()));
        }
        if data.iter().take(SUPERBLOCK_SIZE).all(|&b| b == 0) {
            return Err(Error::Unformatted(
                "metadata superblock is empty (device not formatted?)".into(),
            ));
        }
        let mut p = &data[..SUPERBLOCK_SIZE];
        let zero = p.get_u64_le();
        let magic = p.get_u64_le();
        if zero != 0 || magic != META_MAGIC {
            return Err(Error::Unformatted(
                "bad metadata superblock sentinel (unknown or legacy pre-superblock layout; \
                 legacy layouts are not supported)"
                    .into(),
            ));
        }
        let version = p.get_u64_le();
        if version != META_FORMAT_VERSION {
            return Err(Error::Unformatted(format!(
                "unsupported metadata format version {version}"
            )));
        }
        let meta_block_size = p.get_u32_le();
        let data_block_size = p.get_u32_le();
        let bitmap_granularity = p.get_u32_le();
        let stored_crc = p.get_u32_le();
        if crc32c::crc32c(&data[..SUPERBLOCK_SIZE - 4]) != stored_crc {
            return Err(Error::corruption("metadata superblock checksum mismatch"));
        }
        Ok(Self {
            meta_block_size,
            data_block_size,
            bitmap_granularity,
        })
    }

    /// The superblock's geometry must match the configured one exactly.
    pub fn check_config(&self, cfg: &EngineConfig) -> Result<()> {
        let expected = Self::from_config(cfg);
        if *self != expected {
            return Err(Error::config(format!(
                "on-disk geometry {self:?} does not match configured {expected:?}"
            )));
        }
        Ok(())
    }
}

/// Metadata block index and byte offset of data block `block`'s slot.
pub fn entry_location(cfg: &EngineConfig, block: u64) -> (u64, usize) {
    let epb = cfg.entries_per_meta_block() as u64;
    (1 + block / epb, (block % epb) as usize * cfg.clean_entry_size())
}

/// Write a clean entry into a slot.
pub fn encode_entry(
    slot: &mut [u8],
    oid: ObjectId,
    version: u64,
    bitmap: &[u8],
    ext_bitmap: &[u8],
    bitmap_bytes: usize,
) {
    let mut p = &mut slot[..];
    p.put_u64_le(oid.inode);
    p.put_u64_le(oid.stripe);
    p.put_u64_le(version);
    put_padded(&mut p, bitmap, bitmap_bytes);
    put_padded(&mut p, ext_bitmap, bitmap_bytes);
}

fn put_padded(p: &mut impl BufMut, src: &[u8], want: usize) {
    let n = src.len().min(want);
    p.put_slice(&src[..n]);
    for _ in n..want {
        p.put_u8(0);
    }
}

/// Decode a slot; `None` when the slot is free (version 0).
pub fn decode_entry(
    slot: &[u8],
    bitmap_bytes: usize,
) -> Option<(ObjectId, u64, Vec<u8>, Vec<u8>)> {
    let mut p = slot;
    let inode = p.get_u64_le();
    let stripe = p.get_u64_le();
    let version = p.get_u64_le();
    if version == 0 {
        return None;
    }
    let mut bitmap = vec![0u8; bitmap_bytes];
    p.copy_to_slice(&mut bitmap);
    let mut ext_bitmap = vec![0u8; bitmap_bytes];
    p.copy_to_slice(&mut ext_bitmap);
    Some((ObjectId::new(inode, stripe), version, bitmap, ext_bitmap))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superblock_roundtrip() {
        let cfg = EngineConfig::default();
        let sb = Superblock::from_config(&cfg);
        let bytes = sb.encode();
        let decoded = Superblock::decode(&bytes).unwrap();
        assert_eq!(decoded, sb);
        decoded.check_config(&cfg).unwrap();
    }

    #[test]
    fn test_unformatted_and_legacy_rejected() {
        assert!(matches!(
            Superblock::decode(&[0u8; 64]),
            Err(Error::Unformatted(_))
        ));
        // A legacy layout would have clean entries right at offset 0:
        // nonzero bytes without the sentinel.
        let mut legacy = [0u8; 64];
        legacy[0] = 0x17;
        assert!(matches!(
            Superblock::decode(&legacy),
            Err(Error::Unformatted(_))
        ));
    }

    #[test]
    fn test_corrupt_superblock_rejected() {
        let cfg = EngineConfig::default();
        let mut bytes = Superblock::from_config(&cfg).encode();
        bytes[24] ^= 0xFF; // flip a geometry bit
        assert!(matches!(
            Superblock::decode(&bytes),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_entry_roundtrip_and_slot_math() {
        let cfg = EngineConfig::default();
        let bb = cfg.bitmap_bytes();
        let mut slot = vec![0u8; cfg.clean_entry_size()];
        let oid = ObjectId::new(0x10001, 0x20000);
        encode_entry(&mut slot, oid, 9, &[0xF0; 4], &[0x0F; 4], bb);
        let (got_oid, version, bitmap, ext) = decode_entry(&slot, bb).unwrap();
        assert_eq!(got_oid, oid);
        assert_eq!(version, 9);
        assert_eq!(bitmap, vec![0xF0; 4]);
        assert_eq!(ext, vec![0x0F; 4]);

        // 128 entries per 4 KiB block: block 0 -> meta block 1 slot 0,
        // block 128 -> meta block 2 slot 0.
        assert_eq!(entry_location(&cfg, 0), (1, 0));
        assert_eq!(entry_location(&cfg, 127), (1, 127 * 32));
        assert_eq!(entry_location(&cfg, 128), (2, 0));
    }

    #[test]
    fn test_free_slot_decodes_none() {
        let cfg = EngineConfig::default();
        let slot = vec![0u8; cfg.clean_entry_size()];
        assert!(decode_entry(&slot, cfg.bitmap_bytes()).is_none());
    }
}
