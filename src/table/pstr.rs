//! Persist-fixed-string: the inline-or-indirect byte string living in a
//! bucket slot.
//!
//! A slot is 32 bytes. Strings up to [`INLINE_CAP`] bytes are stored in
//! place, length-prefixed; longer strings keep their length and the region
//! offset of an allocated chunk in the slot. Persisted state never contains
//! a virtual address. Each slot is owned by exactly one bucket; releasing
//! the slot returns the chunk to the allocator.

use crate::alloc::{AllocError, RegionAllocator};
use crate::region::MappedRegion;

/// Size of one string slot in a bucket.
pub const SLOT_SIZE: usize = 32;

/// Longest string stored inline.
pub const INLINE_CAP: usize = 23;

/// Tag byte marking an indirect slot.
const TAG_INDIRECT: u8 = 0xFF;

/// Byte offset of the length field in an indirect slot.
const IND_LEN: usize = 8;

/// Byte offset of the chunk offset field in an indirect slot.
const IND_CHUNK: usize = 16;

/// Decoded shape of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotDesc {
    /// String length in bytes.
    pub len: u64,
    /// Chunk offset for indirect strings, `None` when inline.
    pub chunk: Option<u64>,
}

/// Encode an inline slot image. `bytes` must fit [`INLINE_CAP`].
pub fn encode_inline(bytes: &[u8]) -> [u8; SLOT_SIZE] {
    debug_assert!(bytes.len() <= INLINE_CAP);
    let mut raw = [0u8; SLOT_SIZE];
    raw[0] = bytes.len() as u8;
    raw[1..1 + bytes.len()].copy_from_slice(bytes);
    raw
}

/// Encode an indirect slot image.
pub fn encode_indirect(len: u64, chunk: u64) -> [u8; SLOT_SIZE] {
    let mut raw = [0u8; SLOT_SIZE];
    raw[0] = TAG_INDIRECT;
    raw[IND_LEN..IND_LEN + 8].copy_from_slice(&len.to_le_bytes());
    raw[IND_CHUNK..IND_CHUNK + 8].copy_from_slice(&chunk.to_le_bytes());
    raw
}

/// Decode a slot image.
pub fn decode(raw: &[u8]) -> SlotDesc {
    debug_assert!(raw.len() >= SLOT_SIZE);
    if raw[0] == TAG_INDIRECT {
        let len = u64::from_le_bytes(raw[IND_LEN..IND_LEN + 8].try_into().expect("len field"));
        let chunk =
            u64::from_le_bytes(raw[IND_CHUNK..IND_CHUNK + 8].try_into().expect("chunk field"));
        SlotDesc { len, chunk: Some(chunk) }
    } else {
        SlotDesc { len: raw[0] as u64, chunk: None }
    }
}

/// A string slot at a fixed region offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PstrSlot(pub u64);

impl PstrSlot {
    /// Decode the slot.
    #[inline]
    pub fn desc(&self, region: &MappedRegion) -> SlotDesc {
        decode(region.slice(self.0, SLOT_SIZE))
    }

    /// String length in bytes.
    #[inline]
    pub fn len(&self, region: &MappedRegion) -> u64 {
        self.desc(region).len
    }

    /// Whether the string is empty.
    #[inline]
    pub fn is_empty(&self, region: &MappedRegion) -> bool {
        self.len(region) == 0
    }

    /// Region offset of the string bytes.
    #[inline]
    pub fn data_offset(&self, region: &MappedRegion) -> u64 {
        match self.desc(region).chunk {
            Some(chunk) => chunk,
            None => self.0 + 1,
        }
    }

    /// Borrow the string bytes.
    pub fn bytes<'r>(&self, region: &'r MappedRegion) -> &'r [u8] {
        let desc = self.desc(region);
        let offset = match desc.chunk {
            Some(chunk) => chunk,
            None => self.0 + 1,
        };
        region.slice(offset, desc.len as usize)
    }

    /// Equality against a byte string: length first, then bytes.
    pub fn equals(&self, region: &MappedRegion, other: &[u8]) -> bool {
        let desc = self.desc(region);
        desc.len == other.len() as u64 && self.bytes(region) == other
    }

    /// Store `bytes` into the slot, allocating a chunk when the string does
    /// not fit inline. The chunk contents are fenced; the slot image itself
    /// is written but left for the caller's bucket fence.
    pub fn store(
        &self,
        region: &MappedRegion,
        alloc: &dyn RegionAllocator,
        bytes: &[u8],
    ) -> Result<(), AllocError> {
        if bytes.len() <= INLINE_CAP {
            region.write_bytes(self.0, &encode_inline(bytes));
        } else {
            let chunk = alloc.allocate(bytes.len() as u64, 8)?;
            region.write_bytes(chunk, bytes);
            region.persist(chunk, bytes.len())?;
            region.write_bytes(self.0, &encode_indirect(bytes.len() as u64, chunk));
        }
        Ok(())
    }

    /// Store an uninitialized string of `len` bytes (for lock-created
    /// values). The bytes are left as the allocator returned them.
    pub fn store_uninit(
        &self,
        region: &MappedRegion,
        alloc: &dyn RegionAllocator,
        len: u64,
    ) -> Result<(), AllocError> {
        if len as usize <= INLINE_CAP {
            let mut raw = [0u8; SLOT_SIZE];
            raw[0] = len as u8;
            region.write_bytes(self.0, &raw);
        } else {
            let chunk = alloc.allocate(len, 8)?;
            region.write_bytes(self.0, &encode_indirect(len, chunk));
        }
        Ok(())
    }

    /// Release the slot: return the chunk (if any) to the allocator and
    /// zero the slot image.
    pub fn release(
        &self,
        region: &MappedRegion,
        alloc: &dyn RegionAllocator,
    ) -> Result<(), AllocError> {
        let desc = self.desc(region);
        if let Some(chunk) = desc.chunk {
            alloc.deallocate(chunk, desc.len)?;
        }
        region.write_bytes(self.0, &[0u8; SLOT_SIZE]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::FreeListAllocator;
    use crate::region::layout;
    use std::sync::Arc;

    fn setup() -> (tempfile::TempDir, Arc<MappedRegion>, FreeListAllocator) {
        let dir = tempfile::tempdir().unwrap();
        let region =
            Arc::new(MappedRegion::create(&dir.path().join("pool"), 1 << 20).unwrap());
        let alloc = FreeListAllocator::create(Arc::clone(&region)).unwrap();
        (dir, region, alloc)
    }

    #[test]
    fn test_inline_round_trip() {
        let (_dir, region, alloc) = setup();
        let slot_off = alloc.allocate(SLOT_SIZE as u64, 8).unwrap();
        let slot = PstrSlot(slot_off);
        slot.store(&region, &alloc, b"short").unwrap();
        assert_eq!(slot.len(&region), 5);
        assert_eq!(slot.bytes(&region), b"short");
        assert!(slot.desc(&region).chunk.is_none());
        assert!(slot.equals(&region, b"short"));
        assert!(!slot.equals(&region, b"shor"));
        assert!(!slot.equals(&region, b"shore"));
    }

    #[test]
    fn test_inline_boundary() {
        let (_dir, region, alloc) = setup();
        let slot = PstrSlot(alloc.allocate(SLOT_SIZE as u64, 8).unwrap());
        let exactly = vec![7u8; INLINE_CAP];
        slot.store(&region, &alloc, &exactly).unwrap();
        assert!(slot.desc(&region).chunk.is_none());
        assert_eq!(slot.bytes(&region), &exactly[..]);
    }

    #[test]
    fn test_indirect_round_trip_and_release() {
        let (_dir, region, alloc) = setup();
        let slot = PstrSlot(alloc.allocate(SLOT_SIZE as u64, 8).unwrap());
        let long = vec![0xAB; 100];
        slot.store(&region, &alloc, &long).unwrap();
        let desc = slot.desc(&region);
        assert_eq!(desc.len, 100);
        let chunk = desc.chunk.expect("indirect");
        assert_eq!(slot.bytes(&region), &long[..]);
        assert!(slot.equals(&region, &long));

        slot.release(&region, &alloc).unwrap();
        assert!(alloc.contains_free(chunk));
        assert_eq!(slot.len(&region), 0);
    }

    #[test]
    fn test_store_uninit_sizes() {
        let (_dir, region, alloc) = setup();
        let slot = PstrSlot(alloc.allocate(SLOT_SIZE as u64, 8).unwrap());
        slot.store_uninit(&region, &alloc, 8).unwrap();
        assert_eq!(slot.len(&region), 8);
        assert!(slot.desc(&region).chunk.is_none());

        let slot2 = PstrSlot(alloc.allocate(SLOT_SIZE as u64, 8).unwrap());
        slot2.store_uninit(&region, &alloc, 256).unwrap();
        assert_eq!(slot2.len(&region), 256);
        assert!(slot2.desc(&region).chunk.is_some());
    }

    #[test]
    fn test_encode_decode_images() {
        let inline = encode_inline(b"abc");
        assert_eq!(decode(&inline), SlotDesc { len: 3, chunk: None });

        let indirect = encode_indirect(500, layout::HEAP_OFFSET + 64);
        assert_eq!(
            decode(&indirect),
            SlotDesc { len: 500, chunk: Some(layout::HEAP_OFFSET + 64) }
        );
    }
}
