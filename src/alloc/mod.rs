//! Region-backed allocators.
//!
//! All variants sub-allocate the pool heap below
//! [`layout::HEAP_OFFSET`](crate::region::layout::HEAP_OFFSET) and hand out
//! region-relative offsets, so persisted structures stay valid when the pool
//! is mapped at a different address. Metadata mutations follow the
//! shadow-then-publish pattern: the shadow bytes are written and fenced
//! before the single word that makes them reachable is published and fenced.

mod extent_tree;
mod free_list;

use std::sync::Arc;

pub use extent_tree::ExtentTreeAllocator;
pub use free_list::FreeListAllocator;

use crate::region::{layout, MappedRegion, RegionError};

/// Errors from allocation and free-list persistence.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// No free extent large enough for the request.
    #[error("out of space: requested {0} bytes")]
    OutOfSpace(u64),
    /// Alignment not a power of two or larger than the chunk supports.
    #[error("bad alignment: {0}")]
    BadAlignment(u64),
    /// Durability fence or mapping failure underneath the allocator.
    #[error(transparent)]
    Region(#[from] RegionError),
    /// The allocator root carries an unknown variant tag.
    #[error("unknown allocator variant tag {0}")]
    UnknownVariant(u64),
}

/// Allocator variant recorded in the region header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllocatorVariant {
    /// Size-class free lists linked through the free chunks themselves.
    FreeList,
    /// Best-fit extent tree with address coalescing.
    #[default]
    ExtentTree,
}

impl AllocatorVariant {
    /// Stable tag persisted in the region header.
    pub const fn tag(&self) -> u64 {
        match self {
            AllocatorVariant::FreeList => 1,
            AllocatorVariant::ExtentTree => 2,
        }
    }

    /// Decode a persisted tag.
    pub fn from_tag(tag: u64) -> Result<Self, AllocError> {
        match tag {
            1 => Ok(AllocatorVariant::FreeList),
            2 => Ok(AllocatorVariant::ExtentTree),
            other => Err(AllocError::UnknownVariant(other)),
        }
    }
}

/// Contract shared by every region allocator variant.
pub trait RegionAllocator: Send + Sync {
    /// Allocate `size` bytes aligned to `align`, returning a region offset.
    fn allocate(&self, size: u64, align: u64) -> Result<u64, AllocError>;

    /// Return a chunk previously obtained from [`allocate`](Self::allocate).
    ///
    /// `size` must be the size passed at allocation time.
    fn deallocate(&self, offset: u64, size: u64) -> Result<(), AllocError>;

    /// Whether `offset` lies inside this allocator's heap.
    fn owns(&self, offset: u64) -> bool;

    /// Whether `offset` currently lies inside a free chunk.
    ///
    /// Used by journal recovery to make a replayed deallocation idempotent.
    fn contains_free(&self, offset: u64) -> bool;

    /// Force the free-list image to durable storage.
    fn persist_free_list(&self) -> Result<(), AllocError>;
}

/// Initialize a fresh allocator root in a newly created region.
pub fn create_allocator(
    region: Arc<MappedRegion>,
    variant: AllocatorVariant,
) -> Result<Box<dyn RegionAllocator>, AllocError> {
    region.write_u64(layout::OFF_ALLOC_TAG, variant.tag());
    region.persist(layout::OFF_ALLOC_TAG, 8)?;
    match variant {
        AllocatorVariant::FreeList => Ok(Box::new(FreeListAllocator::create(region)?)),
        AllocatorVariant::ExtentTree => Ok(Box::new(ExtentTreeAllocator::create(region)?)),
    }
}

/// Reconstruct the allocator recorded in an existing region.
pub fn open_allocator(region: Arc<MappedRegion>) -> Result<Box<dyn RegionAllocator>, AllocError> {
    let tag = region.read_u64(layout::OFF_ALLOC_TAG);
    match AllocatorVariant::from_tag(tag)? {
        AllocatorVariant::FreeList => Ok(Box::new(FreeListAllocator::open(region)?)),
        AllocatorVariant::ExtentTree => Ok(Box::new(ExtentTreeAllocator::open(region)?)),
    }
}

/// Align `value` up to `align` (a power of two).
#[inline]
pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}
