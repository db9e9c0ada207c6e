//! Mapped region over a pool file.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use memmap2::MmapMut;
use tracing::debug;

use super::layout;
use super::RegionError;

/// Injected fence failure state, armed through the store's debug interface.
///
/// While armed, each durability fence consumes one unit of the budget; a
/// fence issued after the budget is exhausted fails, aborting the operation
/// mid-protocol the way a power failure would.
#[derive(Debug, Default)]
struct FenceBudget {
    armed: AtomicBool,
    remaining: AtomicU64,
}

/// A pool file mapped read-write.
///
/// Byte accessors take `&self`; callers serialize overlapping mutation
/// through the bucket and allocator locks. Offsets are validated against the
/// mapping bounds and violations panic, since they indicate corruption
/// rather than a recoverable condition.
pub struct MappedRegion {
    map: MmapMut,
    base: *mut u8,
    len: u64,
    path: PathBuf,
    fences: FenceBudget,
}

// The raw base pointer aliases the mapping owned by `map`; cross-thread use
// is serialized by the callers' locks.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Create a new pool file of `size` bytes and map it.
    ///
    /// Writes and fences the magic, version and size fields; the rest of the
    /// header is left zeroed for the allocator and table roots.
    pub fn create(path: &Path, size: u64) -> Result<Self, RegionError> {
        if size < layout::HEAP_OFFSET * 2 {
            return Err(RegionError::TooSmall(size));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(size)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        let region = Self::from_map(map, size, path.to_path_buf());
        region.write_bytes(layout::OFF_MAGIC, &layout::MAGIC);
        region.write_u64(layout::OFF_VERSION, layout::VERSION);
        region.write_u64(layout::OFF_REGION_SIZE, size);
        region.persist(layout::OFF_MAGIC, 24)?;
        debug!(path = %region.path.display(), size, "created pool region");
        Ok(region)
    }

    /// Map an existing pool file, validating magic, version and size.
    pub fn open(path: &Path) -> Result<Self, RegionError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        if size < layout::HEAP_OFFSET * 2 {
            return Err(RegionError::TooSmall(size));
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        let region = Self::from_map(map, size, path.to_path_buf());
        if region.slice(layout::OFF_MAGIC, 8) != layout::MAGIC {
            return Err(RegionError::BadMagic);
        }
        let version = region.read_u64(layout::OFF_VERSION);
        if version != layout::VERSION {
            return Err(RegionError::BadVersion(version));
        }
        let recorded = region.read_u64(layout::OFF_REGION_SIZE);
        if recorded != size {
            return Err(RegionError::TooSmall(recorded));
        }
        debug!(path = %region.path.display(), size, "opened pool region");
        Ok(region)
    }

    fn from_map(mut map: MmapMut, len: u64, path: PathBuf) -> Self {
        let base = map.as_mut_ptr();
        Self {
            map,
            base,
            len,
            path,
            fences: FenceBudget::default(),
        }
    }

    /// Remove a pool file from disk.
    pub fn delete(path: &Path) -> Result<(), RegionError> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// Region size in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the region has zero length (never true for a valid region).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Path of the backing file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Virtual base address of the mapping for this open.
    #[inline]
    pub fn base_address(&self) -> usize {
        self.base as usize
    }

    #[inline]
    fn check(&self, offset: u64, len: usize) {
        assert!(
            offset.checked_add(len as u64).is_some_and(|end| end <= self.len),
            "region access out of bounds: offset {offset} len {len} region {}",
            self.len
        );
    }

    /// Borrow `len` bytes at `offset`.
    #[inline]
    pub fn slice(&self, offset: u64, len: usize) -> &[u8] {
        self.check(offset, len);
        unsafe { std::slice::from_raw_parts(self.base.add(offset as usize), len) }
    }

    /// Borrow `len` bytes at `offset` mutably.
    ///
    /// # Safety
    /// The caller must hold the exclusive content lock covering the range,
    /// so no other borrow of these bytes exists for the lifetime.
    #[inline]
    pub unsafe fn slice_mut(&self, offset: u64, len: usize) -> &mut [u8] {
        self.check(offset, len);
        unsafe { std::slice::from_raw_parts_mut(self.base.add(offset as usize), len) }
    }

    /// Copy bytes out of the region.
    #[inline]
    pub fn read_bytes(&self, offset: u64, out: &mut [u8]) {
        out.copy_from_slice(self.slice(offset, out.len()));
    }

    /// Copy bytes into the region. Not durable until a fence covers them.
    #[inline]
    pub fn write_bytes(&self, offset: u64, bytes: &[u8]) {
        self.check(offset, bytes.len());
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.add(offset as usize),
                bytes.len(),
            );
        }
    }

    /// Zero `len` bytes at `offset`.
    #[inline]
    pub fn zero(&self, offset: u64, len: usize) {
        self.check(offset, len);
        unsafe {
            std::ptr::write_bytes(self.base.add(offset as usize), 0, len);
        }
    }

    /// Read a little-endian u64 at `offset`.
    #[inline]
    pub fn read_u64(&self, offset: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_bytes(offset, &mut buf);
        u64::from_le_bytes(buf)
    }

    /// Write a little-endian u64 at `offset`.
    #[inline]
    pub fn write_u64(&self, offset: u64, value: u64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// Durability fence over `[offset, offset + len)`.
    ///
    /// Returns [`RegionError::FenceFault`] once an armed fence budget is
    /// exhausted; the bytes written before the failed fence stay in the
    /// mapping, mirroring the undefined durability of a real crash window.
    pub fn persist(&self, offset: u64, len: usize) -> Result<(), RegionError> {
        self.check(offset, len);
        if self.fences.armed.load(Ordering::Relaxed) {
            let mut remaining = self.fences.remaining.load(Ordering::Relaxed);
            loop {
                if remaining == 0 {
                    return Err(RegionError::FenceFault);
                }
                match self.fences.remaining.compare_exchange_weak(
                    remaining,
                    remaining - 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => remaining = actual,
                }
            }
        }
        self.map.flush_range(offset as usize, len)?;
        Ok(())
    }

    /// Arm or disarm the injected fence budget.
    pub fn set_fence_faults(&self, armed: bool) {
        self.fences.armed.store(armed, Ordering::Relaxed);
    }

    /// Set the number of fences that will still succeed while armed.
    pub fn reset_fence_budget(&self, remaining: u64) {
        self.fences.remaining.store(remaining, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_region(name: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    #[test]
    fn test_create_writes_header() {
        let (_dir, path) = temp_region("r0");
        let region = MappedRegion::create(&path, 1 << 20).unwrap();
        assert_eq!(region.slice(0, 8), b"HSTORE\0\0");
        assert_eq!(region.read_u64(layout::OFF_VERSION), layout::VERSION);
        assert_eq!(region.read_u64(layout::OFF_REGION_SIZE), 1 << 20);
    }

    #[test]
    fn test_reopen_round_trip() {
        let (_dir, path) = temp_region("r1");
        {
            let region = MappedRegion::create(&path, 1 << 20).unwrap();
            region.write_u64(layout::HEAP_OFFSET, 0xdead_beef);
            region.persist(layout::HEAP_OFFSET, 8).unwrap();
        }
        let region = MappedRegion::open(&path).unwrap();
        assert_eq!(region.read_u64(layout::HEAP_OFFSET), 0xdead_beef);
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let (_dir, path) = temp_region("r2");
        {
            let region = MappedRegion::create(&path, 1 << 20).unwrap();
            region.write_bytes(0, b"NOTMAGIC");
            region.persist(0, 8).unwrap();
        }
        assert!(matches!(MappedRegion::open(&path), Err(RegionError::BadMagic)));
    }

    #[test]
    fn test_create_rejects_tiny_region() {
        let (_dir, path) = temp_region("r3");
        assert!(matches!(
            MappedRegion::create(&path, 64),
            Err(RegionError::TooSmall(64))
        ));
    }

    #[test]
    fn test_fence_budget_expires() {
        let (_dir, path) = temp_region("r4");
        let region = MappedRegion::create(&path, 1 << 20).unwrap();
        region.set_fence_faults(true);
        region.reset_fence_budget(2);
        assert!(region.persist(0, 8).is_ok());
        assert!(region.persist(0, 8).is_ok());
        assert!(matches!(region.persist(0, 8), Err(RegionError::FenceFault)));
        region.set_fence_faults(false);
        assert!(region.persist(0, 8).is_ok());
    }
}
