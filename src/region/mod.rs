//! Memory-mapped persistent pool regions.
//!
//! A pool is a single file mapped read-write for the lifetime of the open.
//! Everything persisted inside it is addressed by region-relative offsets so
//! the file stays valid when mapped at a different virtual address.

mod mapped;

pub use mapped::MappedRegion;

/// Fixed on-region layout, little-endian at known offsets.
pub mod layout {
    /// Region magic at offset 0.
    pub const MAGIC: [u8; 8] = *b"HSTORE\0\0";
    /// Current layout version.
    pub const VERSION: u64 = 1;

    /// Offset of the magic bytes.
    pub const OFF_MAGIC: u64 = 0x000;
    /// Offset of the layout version.
    pub const OFF_VERSION: u64 = 0x008;
    /// Offset of the recorded region size.
    pub const OFF_REGION_SIZE: u64 = 0x010;
    /// Offset of the allocator variant tag.
    pub const OFF_ALLOC_TAG: u64 = 0x018;
    /// Offset of the allocator root area.
    pub const OFF_ALLOC_ROOT: u64 = 0x020;
    /// Size of the allocator root area in bytes.
    pub const ALLOC_ROOT_SIZE: u64 = 0x0E0;
    /// Offset of the table persist-data root.
    pub const OFF_PERSIST_ROOT: u64 = 0x100;
    /// Offset of the segment directory (array of region offsets).
    pub const OFF_SEGMENT_DIR: u64 = 0x140;
    /// Number of slots in the segment directory.
    pub const SEGMENT_DIR_CAPACITY: usize = 64;
    /// Offset of the first allocatable heap byte.
    pub const HEAP_OFFSET: u64 = 0x1000;
}

/// Errors from region creation, opening and durability fences.
#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    /// I/O error from the underlying file or mapping.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The file does not start with the region magic.
    #[error("region magic mismatch")]
    BadMagic,
    /// The region was written by an unsupported layout version.
    #[error("unsupported layout version {0}")]
    BadVersion(u64),
    /// The requested or recorded size cannot hold the fixed layout.
    #[error("region too small: {0} bytes")]
    TooSmall(u64),
    /// A persisted root is structurally invalid.
    #[error("corrupt persisted root: {0}")]
    CorruptRoot(&'static str),
    /// A durability fence failed because the injected fence budget expired.
    #[error("injected fence fault")]
    FenceFault,
}
