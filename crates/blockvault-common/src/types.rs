//! Core identifier types for the blockvault engine.
//!
//! An object is the engine's unit of allocation and versioning. It is
//! identified by `(inode, stripe)`: `inode` names a logical image (its
//! high bits carry the pool id), `stripe` is the byte offset of the
//! object within that image, quantized by the layer above.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pool identifier, carried in the high bits of an inode number.
pub type PoolId = u16;

/// Number of high inode bits reserved for the pool id.
pub const POOL_ID_BITS: u32 = 16;

/// Extract the pool id from an inode number.
#[must_use]
pub const fn pool_of(inode: u64) -> PoolId {
    (inode >> (64 - POOL_ID_BITS)) as PoolId
}

/// Identifier of a fixed-size stored object.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    /// Logical image id; pool id in the high [`POOL_ID_BITS`] bits.
    pub inode: u64,
    /// Byte offset of the object within the image.
    pub stripe: u64,
}

impl ObjectId {
    /// Wire size of an encoded object id.
    pub const WIRE_SIZE: usize = 16;

    #[must_use]
    pub const fn new(inode: u64, stripe: u64) -> Self {
        Self { inode, stripe }
    }

    /// Pool this object belongs to.
    #[must_use]
    pub const fn pool(&self) -> PoolId {
        pool_of(self.inode)
    }

    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.inode);
        buf.put_u64_le(self.stripe);
    }

    pub fn get(buf: &mut impl Buf) -> Self {
        let inode = buf.get_u64_le();
        let stripe = buf.get_u64_le();
        Self { inode, stripe }
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{:x}", self.inode, self.stripe)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{:x}", self.inode, self.stripe)
    }
}

/// A specific version of an object. Versions are strictly increasing
/// per object; ordering is `(object, version)` so that all versions of
/// one object are adjacent in ordered containers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectVersion {
    pub oid: ObjectId,
    pub version: u64,
}

impl ObjectVersion {
    /// Wire size of an encoded object version.
    pub const WIRE_SIZE: usize = 24;

    #[must_use]
    pub const fn new(oid: ObjectId, version: u64) -> Self {
        Self { oid, version }
    }

    pub fn put(&self, buf: &mut impl BufMut) {
        self.oid.put(buf);
        buf.put_u64_le(self.version);
    }

    pub fn get(buf: &mut impl Buf) -> Self {
        let oid = ObjectId::get(buf);
        let version = buf.get_u64_le();
        Self { oid, version }
    }
}

impl fmt::Debug for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.oid, self.version)
    }
}

impl fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.oid, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_pool_extraction() {
        let inode = (7u64 << 48) | 0x1234;
        assert_eq!(pool_of(inode), 7);
        assert_eq!(ObjectId::new(inode, 0).pool(), 7);
    }

    #[test]
    fn test_object_id_wire() {
        let oid = ObjectId::new(0xDEAD_BEEF, 0x20000);
        let mut buf = BytesMut::new();
        oid.put(&mut buf);
        assert_eq!(buf.len(), ObjectId::WIRE_SIZE);
        assert_eq!(ObjectId::get(&mut buf.freeze()), oid);
    }

    #[test]
    fn test_version_ordering_groups_objects() {
        let a1 = ObjectVersion::new(ObjectId::new(1, 0), 9);
        let a2 = ObjectVersion::new(ObjectId::new(1, 0), 10);
        let b1 = ObjectVersion::new(ObjectId::new(1, 131072), 1);
        assert!(a1 < a2);
        assert!(a2 < b1);
    }
}
