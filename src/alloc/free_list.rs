//! Size-class free-list allocator.
//!
//! Chunk sizes are powers of two from [`MIN_CHUNK`] up. Each size class has
//! a persisted list head in the allocator root; free chunks link to the next
//! free chunk of the class through their first eight bytes, as region
//! offsets. A bump cursor claims fresh heap space when a class is empty.
//!
//! Every list mutation writes the chunk link first, fences it, then
//! publishes the class head (or cursor) with a second fence, so the
//! persisted lists are consistent at any crash point.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{align_up, AllocError, RegionAllocator};
use crate::region::{layout, MappedRegion};

/// Smallest chunk handed out, and the minimum chunk alignment.
pub const MIN_CHUNK: u64 = 64;

/// Number of size classes (64 B .. 2^(6 + NUM_CLASSES - 1) B).
const NUM_CLASSES: usize = 24;

/// Allocator root field offsets, relative to the region start.
const OFF_CURSOR: u64 = layout::OFF_ALLOC_ROOT;
const OFF_CLASS_HEADS: u64 = layout::OFF_ALLOC_ROOT + 8;

const _: () = assert!(8 + NUM_CLASSES as u64 * 8 <= layout::ALLOC_ROOT_SIZE);

/// Size-class free-list allocator over a mapped region.
pub struct FreeListAllocator {
    region: Arc<MappedRegion>,
    heap_end: u64,
    state: Mutex<()>,
}

impl FreeListAllocator {
    /// Initialize a fresh allocator root: empty class lists, cursor at the
    /// heap base.
    pub fn create(region: Arc<MappedRegion>) -> Result<Self, AllocError> {
        region.write_u64(OFF_CURSOR, layout::HEAP_OFFSET);
        for class in 0..NUM_CLASSES {
            region.write_u64(OFF_CLASS_HEADS + class as u64 * 8, 0);
        }
        region.persist(layout::OFF_ALLOC_ROOT, layout::ALLOC_ROOT_SIZE as usize)?;
        Ok(Self::attach(region))
    }

    /// Attach to the allocator root persisted in an existing region.
    pub fn open(region: Arc<MappedRegion>) -> Result<Self, AllocError> {
        Ok(Self::attach(region))
    }

    fn attach(region: Arc<MappedRegion>) -> Self {
        let heap_end = region.len();
        Self {
            region,
            heap_end,
            state: Mutex::new(()),
        }
    }

    /// Chunk size for a request, also its guaranteed alignment.
    fn class_size(size: u64) -> u64 {
        size.max(MIN_CHUNK).next_power_of_two()
    }

    fn class_index(chunk: u64) -> usize {
        (chunk.trailing_zeros() - MIN_CHUNK.trailing_zeros()) as usize
    }

    fn head_offset(class: usize) -> u64 {
        OFF_CLASS_HEADS + class as u64 * 8
    }
}

impl RegionAllocator for FreeListAllocator {
    fn allocate(&self, size: u64, align: u64) -> Result<u64, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError::BadAlignment(align));
        }
        let chunk = Self::class_size(size);
        if align > chunk {
            return Err(AllocError::BadAlignment(align));
        }
        let class = Self::class_index(chunk);
        if class >= NUM_CLASSES {
            return Err(AllocError::OutOfSpace(size));
        }

        let _guard = self.state.lock();
        let head_off = Self::head_offset(class);
        let head = self.region.read_u64(head_off);
        if head != 0 {
            // Pop: the link was fenced when the chunk was freed, so the only
            // mutation is publishing the new head.
            let next = self.region.read_u64(head);
            self.region.write_u64(head_off, next);
            self.region.persist(head_off, 8)?;
            return Ok(head);
        }

        // Bump a fresh chunk, aligned to its own size.
        let cursor = self.region.read_u64(OFF_CURSOR);
        let offset = align_up(cursor, chunk);
        let end = offset
            .checked_add(chunk)
            .ok_or(AllocError::OutOfSpace(size))?;
        if end > self.heap_end {
            return Err(AllocError::OutOfSpace(size));
        }
        self.region.write_u64(OFF_CURSOR, end);
        self.region.persist(OFF_CURSOR, 8)?;
        Ok(offset)
    }

    fn deallocate(&self, offset: u64, size: u64) -> Result<(), AllocError> {
        let chunk = Self::class_size(size);
        let class = Self::class_index(chunk);
        debug_assert!(self.owns(offset));

        let _guard = self.state.lock();
        let head_off = Self::head_offset(class);
        let head = self.region.read_u64(head_off);
        // Shadow: link the chunk to the current head, fence, then publish.
        self.region.write_u64(offset, head);
        self.region.persist(offset, 8)?;
        self.region.write_u64(head_off, offset);
        self.region.persist(head_off, 8)?;
        Ok(())
    }

    fn owns(&self, offset: u64) -> bool {
        (layout::HEAP_OFFSET..self.heap_end).contains(&offset)
    }

    fn contains_free(&self, offset: u64) -> bool {
        let _guard = self.state.lock();
        for class in 0..NUM_CLASSES {
            let mut cursor = self.region.read_u64(Self::head_offset(class));
            while cursor != 0 {
                if cursor == offset {
                    return true;
                }
                cursor = self.region.read_u64(cursor);
            }
        }
        false
    }

    fn persist_free_list(&self) -> Result<(), AllocError> {
        // Links and heads are fenced eagerly on every mutation.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_allocator() -> (tempfile::TempDir, FreeListAllocator) {
        let dir = tempfile::tempdir().unwrap();
        let region =
            Arc::new(MappedRegion::create(&dir.path().join("pool"), 1 << 20).unwrap());
        let alloc = FreeListAllocator::create(region).unwrap();
        (dir, alloc)
    }

    #[test]
    fn test_allocate_aligned_chunks() {
        let (_dir, alloc) = make_allocator();
        let a = alloc.allocate(10, 8).unwrap();
        let b = alloc.allocate(100, 8).unwrap();
        assert_ne!(a, b);
        assert_eq!(a % 64, 0);
        assert_eq!(b % 128, 0);
        assert!(alloc.owns(a));
        assert!(alloc.owns(b));
    }

    #[test]
    fn test_free_then_reuse_same_class() {
        let (_dir, alloc) = make_allocator();
        let a = alloc.allocate(50, 8).unwrap();
        alloc.deallocate(a, 50).unwrap();
        assert!(alloc.contains_free(a));
        let b = alloc.allocate(40, 8).unwrap();
        assert_eq!(a, b);
        assert!(!alloc.contains_free(a));
    }

    #[test]
    fn test_bad_alignment() {
        let (_dir, alloc) = make_allocator();
        assert!(matches!(
            alloc.allocate(8, 3),
            Err(AllocError::BadAlignment(3))
        ));
        assert!(matches!(
            alloc.allocate(8, 1 << 20),
            Err(AllocError::BadAlignment(_))
        ));
    }

    #[test]
    fn test_out_of_space() {
        let (_dir, alloc) = make_allocator();
        assert!(matches!(
            alloc.allocate(1 << 30, 8),
            Err(AllocError::OutOfSpace(_))
        ));
    }

    #[test]
    fn test_free_list_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool");
        let freed;
        {
            let region = Arc::new(MappedRegion::create(&path, 1 << 20).unwrap());
            let alloc = FreeListAllocator::create(region).unwrap();
            freed = alloc.allocate(200, 8).unwrap();
            alloc.allocate(200, 8).unwrap();
            alloc.deallocate(freed, 200).unwrap();
        }
        let region = Arc::new(MappedRegion::open(&path).unwrap());
        let alloc = FreeListAllocator::open(region).unwrap();
        assert!(alloc.contains_free(freed));
        assert_eq!(alloc.allocate(200, 8).unwrap(), freed);
    }
}
