//! Bucket records: the owner/content pair.
//!
//! A bucket is an 80-byte record in a segment. The owner half is a bitmap
//! of width [`NEIGHBORHOOD`](super::NEIGHBORHOOD) recording which of the
//! next H slots hold keys that hashed here. The content half is the
//! `(key, value, state)` triple.
//!
//! Layout, little-endian:
//!
//! ```text
//! +0   owner bitmap        u64
//! +8   state               u64  (0 = clear, 1 = in-use)
//! +16  key slot            32 bytes
//! +48  value slot          32 bytes
//! ```

use super::pstr::{PstrSlot, SLOT_SIZE};
use crate::region::MappedRegion;

/// Size of one bucket record.
pub const BUCKET_SIZE: u64 = 80;

/// Content state: no entry.
pub const STATE_CLEAR: u64 = 0;

/// Content state: live entry.
pub const STATE_IN_USE: u64 = 1;

const OFF_OWNER: u64 = 0;
const OFF_STATE: u64 = 8;
const OFF_KEY: u64 = 16;
const OFF_VALUE: u64 = 48;

/// Byte length of the content half (state + key + value).
pub const CONTENT_SIZE: usize = (BUCKET_SIZE - OFF_STATE) as usize;

/// A bucket record at a fixed region offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRef(pub u64);

impl BucketRef {
    /// Read the owner bitmap.
    #[inline]
    pub fn owner(&self, region: &MappedRegion) -> u64 {
        region.read_u64(self.0 + OFF_OWNER)
    }

    /// Write the owner bitmap. Not durable until fenced.
    #[inline]
    pub fn set_owner(&self, region: &MappedRegion, bits: u64) {
        region.write_u64(self.0 + OFF_OWNER, bits);
    }

    /// Fence the owner word.
    #[inline]
    pub fn persist_owner(&self, region: &MappedRegion) -> Result<(), crate::region::RegionError> {
        region.persist(self.0 + OFF_OWNER, 8)
    }

    /// Read the content state.
    #[inline]
    pub fn state(&self, region: &MappedRegion) -> u64 {
        region.read_u64(self.0 + OFF_STATE)
    }

    /// Write the content state. Not durable until fenced.
    #[inline]
    pub fn set_state(&self, region: &MappedRegion, state: u64) {
        region.write_u64(self.0 + OFF_STATE, state);
    }

    /// Whether the content holds a live entry.
    #[inline]
    pub fn in_use(&self, region: &MappedRegion) -> bool {
        self.state(region) == STATE_IN_USE
    }

    /// The key string slot.
    #[inline]
    pub fn key_slot(&self) -> PstrSlot {
        PstrSlot(self.0 + OFF_KEY)
    }

    /// The value string slot.
    #[inline]
    pub fn value_slot(&self) -> PstrSlot {
        PstrSlot(self.0 + OFF_VALUE)
    }

    /// Region offset of the content half.
    #[inline]
    pub fn content_offset(&self) -> u64 {
        self.0 + OFF_STATE
    }

    /// Copy the content half (state, key, value) from another bucket.
    ///
    /// Ownership of any indirect chunks moves with the raw slot bytes.
    pub fn copy_content_from(&self, region: &MappedRegion, src: BucketRef) {
        let mut buf = [0u8; CONTENT_SIZE];
        region.read_bytes(src.content_offset(), &mut buf);
        region.write_bytes(self.content_offset(), &buf);
    }

    /// Clear the content half without touching owned chunks.
    pub fn clear_content(&self, region: &MappedRegion) {
        region.zero(self.content_offset(), CONTENT_SIZE);
    }

    /// Fence the content half.
    #[inline]
    pub fn persist_content(
        &self,
        region: &MappedRegion,
    ) -> Result<(), crate::region::RegionError> {
        region.persist(self.content_offset(), CONTENT_SIZE)
    }
}

/// Iterate the set bits of an owner bitmap, least-significant first.
///
/// This order is the tie-break order for both lookup and displacement
/// victim choice.
#[derive(Debug, Clone, Copy)]
pub struct OwnerBits(pub u64);

impl Iterator for OwnerBits {
    type Item = u32;

    #[inline]
    fn next(&mut self) -> Option<u32> {
        if self.0 == 0 {
            return None;
        }
        let bit = self.0.trailing_zeros();
        self.0 &= self.0 - 1;
        Some(bit)
    }
}

const _: () = assert!(OFF_KEY as usize + SLOT_SIZE == OFF_VALUE as usize);
const _: () = assert!(OFF_VALUE as usize + SLOT_SIZE == BUCKET_SIZE as usize);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{FreeListAllocator, RegionAllocator};
    use std::sync::Arc;

    fn setup() -> (tempfile::TempDir, Arc<MappedRegion>, FreeListAllocator) {
        let dir = tempfile::tempdir().unwrap();
        let region =
            Arc::new(MappedRegion::create(&dir.path().join("pool"), 1 << 20).unwrap());
        let alloc = FreeListAllocator::create(Arc::clone(&region)).unwrap();
        (dir, region, alloc)
    }

    #[test]
    fn test_owner_bits_order() {
        let bits: Vec<u32> = OwnerBits(0b1010_0101).collect();
        assert_eq!(bits, vec![0, 2, 5, 7]);
        assert_eq!(OwnerBits(0).count(), 0);
        assert_eq!(OwnerBits(1 << 63).collect::<Vec<_>>(), vec![63]);
    }

    #[test]
    fn test_bucket_fields() {
        let (_dir, region, alloc) = setup();
        let off = alloc.allocate(BUCKET_SIZE, 16).unwrap();
        region.zero(off, BUCKET_SIZE as usize);
        let bucket = BucketRef(off);

        assert_eq!(bucket.state(&region), STATE_CLEAR);
        assert!(!bucket.in_use(&region));

        bucket.set_owner(&region, 0b101);
        bucket.set_state(&region, STATE_IN_USE);
        assert_eq!(bucket.owner(&region), 0b101);
        assert!(bucket.in_use(&region));
    }

    #[test]
    fn test_content_copy_moves_slots() {
        let (_dir, region, alloc) = setup();
        let a = BucketRef(alloc.allocate(BUCKET_SIZE, 16).unwrap());
        let b = BucketRef(alloc.allocate(BUCKET_SIZE, 16).unwrap());
        region.zero(a.0, BUCKET_SIZE as usize);
        region.zero(b.0, BUCKET_SIZE as usize);

        a.set_state(&region, STATE_IN_USE);
        a.key_slot().store(&region, &alloc, b"k").unwrap();
        a.value_slot().store(&region, &alloc, b"value").unwrap();

        b.copy_content_from(&region, a);
        a.clear_content(&region);

        assert!(!a.in_use(&region));
        assert!(b.in_use(&region));
        assert_eq!(b.key_slot().bytes(&region), b"k");
        assert_eq!(b.value_slot().bytes(&region), b"value");
    }
}
