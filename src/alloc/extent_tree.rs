//! Best-fit extent-tree allocator.
//!
//! Free extents are indexed twice in volatile memory: by size for best-fit
//! allocation and by address for neighbor coalescing. The persisted image is
//! an extent table with two slots; publishing writes the inactive slot,
//! fences it, then flips the one-word selector with a second fence. On open
//! the volatile indexes are rebuilt from the active slot.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use super::{align_up, AllocError, RegionAllocator};
use crate::region::{layout, MappedRegion};

/// Extent granularity: sizes round up to this, and it is the minimum
/// alignment of every chunk.
pub const EXTENT_ALIGN: u64 = 16;

/// Bytes reserved for each persisted extent-table slot.
const TABLE_BYTES: u64 = 4096;

/// Allocator root field offsets.
const OFF_SELECTOR: u64 = layout::OFF_ALLOC_ROOT;
const OFF_TABLE_A: u64 = layout::OFF_ALLOC_ROOT + 8;
const OFF_TABLE_B: u64 = layout::OFF_ALLOC_ROOT + 16;
const OFF_CAPACITY: u64 = layout::OFF_ALLOC_ROOT + 24;
const OFF_HEAP_START: u64 = layout::OFF_ALLOC_ROOT + 32;

#[derive(Default)]
struct ExtentIndex {
    /// `(size, offset)` ordered for best-fit scans.
    by_size: BTreeMap<(u64, u64), ()>,
    /// `offset -> size` ordered for coalescing.
    by_addr: BTreeMap<u64, u64>,
}

impl ExtentIndex {
    fn insert(&mut self, offset: u64, size: u64) {
        self.by_size.insert((size, offset), ());
        self.by_addr.insert(offset, size);
    }

    fn remove(&mut self, offset: u64, size: u64) {
        self.by_size.remove(&(size, offset));
        self.by_addr.remove(&offset);
    }
}

/// Best-fit extent allocator over a mapped region.
pub struct ExtentTreeAllocator {
    region: Arc<MappedRegion>,
    heap_start: u64,
    heap_end: u64,
    capacity: u64,
    index: Mutex<ExtentIndex>,
}

impl ExtentTreeAllocator {
    /// Initialize a fresh allocator root and one spanning free extent.
    pub fn create(region: Arc<MappedRegion>) -> Result<Self, AllocError> {
        let table_a = layout::HEAP_OFFSET;
        let table_b = table_a + TABLE_BYTES;
        let heap_start = table_b + TABLE_BYTES;
        let heap_end = region.len();
        let capacity = (TABLE_BYTES - 8) / 16;

        region.write_u64(OFF_SELECTOR, 0);
        region.write_u64(OFF_TABLE_A, table_a);
        region.write_u64(OFF_TABLE_B, table_b);
        region.write_u64(OFF_CAPACITY, capacity);
        region.write_u64(OFF_HEAP_START, heap_start);
        region.persist(layout::OFF_ALLOC_ROOT, layout::ALLOC_ROOT_SIZE as usize)?;

        let mut index = ExtentIndex::default();
        index.insert(heap_start, heap_end - heap_start);

        let alloc = Self {
            region,
            heap_start,
            heap_end,
            capacity,
            index: Mutex::new(index),
        };
        alloc.publish(&mut alloc.index.lock())?;
        Ok(alloc)
    }

    /// Rebuild the volatile extent indexes from the active persisted slot.
    pub fn open(region: Arc<MappedRegion>) -> Result<Self, AllocError> {
        let heap_start = region.read_u64(OFF_HEAP_START);
        let heap_end = region.len();
        let capacity = region.read_u64(OFF_CAPACITY);
        let selector = region.read_u64(OFF_SELECTOR);
        let table = if selector == 0 {
            region.read_u64(OFF_TABLE_A)
        } else {
            region.read_u64(OFF_TABLE_B)
        };

        let mut index = ExtentIndex::default();
        let count = region.read_u64(table);
        for i in 0..count {
            let entry = table + 8 + i * 16;
            let offset = region.read_u64(entry);
            let size = region.read_u64(entry + 8);
            index.insert(offset, size);
        }

        Ok(Self {
            region,
            heap_start,
            heap_end,
            capacity,
            index: Mutex::new(index),
        })
    }

    /// Serialize the free extents into the inactive slot and flip the
    /// selector.
    fn publish(&self, index: &mut ExtentIndex) -> Result<(), AllocError> {
        let selector = self.region.read_u64(OFF_SELECTOR);
        let target = if selector == 0 {
            self.region.read_u64(OFF_TABLE_B)
        } else {
            self.region.read_u64(OFF_TABLE_A)
        };

        let total = index.by_addr.len() as u64;
        let count = total.min(self.capacity);
        if count < total {
            // The dropped extents stay usable in this session but leak on
            // reopen.
            warn!(dropped = total - count, "extent table overflow");
        }
        self.region.write_u64(target, count);
        for (i, (&offset, &size)) in index.by_addr.iter().take(count as usize).enumerate() {
            let entry = target + 8 + i as u64 * 16;
            self.region.write_u64(entry, offset);
            self.region.write_u64(entry + 8, size);
        }
        self.region.persist(target, (8 + count * 16) as usize)?;

        self.region.write_u64(OFF_SELECTOR, 1 - selector);
        self.region.persist(OFF_SELECTOR, 8)?;
        Ok(())
    }
}

impl RegionAllocator for ExtentTreeAllocator {
    fn allocate(&self, size: u64, align: u64) -> Result<u64, AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError::BadAlignment(align));
        }
        let size = align_up(size.max(EXTENT_ALIGN), EXTENT_ALIGN);
        let align = align.max(EXTENT_ALIGN);

        let mut index = self.index.lock();
        // Best fit: smallest extent that still admits the alignment.
        let mut found = None;
        for (&(esize, eoff), _) in index.by_size.range((size, 0)..) {
            let aligned = align_up(eoff, align);
            if aligned + size <= eoff + esize {
                found = Some((eoff, esize, aligned));
                break;
            }
        }
        let (eoff, esize, aligned) = found.ok_or(AllocError::OutOfSpace(size))?;

        index.remove(eoff, esize);
        if aligned > eoff {
            index.insert(eoff, aligned - eoff);
        }
        let tail = (eoff + esize) - (aligned + size);
        if tail > 0 {
            index.insert(aligned + size, tail);
        }
        self.publish(&mut index)?;
        Ok(aligned)
    }

    fn deallocate(&self, offset: u64, size: u64) -> Result<(), AllocError> {
        let size = align_up(size.max(EXTENT_ALIGN), EXTENT_ALIGN);
        debug_assert!(self.owns(offset));

        let mut index = self.index.lock();
        let mut start = offset;
        let mut extent = size;

        if let Some((&prev_off, &prev_size)) = index.by_addr.range(..offset).next_back()
            && prev_off + prev_size == offset
        {
            index.remove(prev_off, prev_size);
            start = prev_off;
            extent += prev_size;
        }
        if let Some(&next_size) = index.by_addr.get(&(offset + size)) {
            index.remove(offset + size, next_size);
            extent += next_size;
        }
        index.insert(start, extent);
        self.publish(&mut index)?;
        Ok(())
    }

    fn owns(&self, offset: u64) -> bool {
        (self.heap_start..self.heap_end).contains(&offset)
    }

    fn contains_free(&self, offset: u64) -> bool {
        let index = self.index.lock();
        index
            .by_addr
            .range(..=offset)
            .next_back()
            .is_some_and(|(&off, &size)| offset < off + size)
    }

    fn persist_free_list(&self) -> Result<(), AllocError> {
        self.publish(&mut self.index.lock())
    }
}
