//! Per-open-pool runtime state.
//!
//! A session ties together the mapped region, the allocator rooted in it,
//! the journal and the table view. Sessions are never persisted; they are
//! rebuilt from the region on every open.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::PoolId;
use crate::alloc::{self, RegionAllocator};
use crate::atomic::{self, Journal, JournalError};
use crate::region::{MappedRegion, RegionError};
use crate::table::{HopMap, MapError, PersistData};

/// Errors from session construction.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Region creation/open failure.
    #[error(transparent)]
    Region(#[from] RegionError),
    /// Allocator root failure.
    #[error(transparent)]
    Alloc(#[from] alloc::AllocError),
    /// Journal recovery failure.
    #[error(transparent)]
    Journal(#[from] JournalError),
    /// Table construction failure.
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Opaque handle for a held key lock, scoped to its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockToken(u64);

impl LockToken {
    /// Sentinel returned when a lock could not be taken.
    pub const NONE: LockToken = LockToken(0);

    /// Whether this is the failed-lock sentinel.
    #[inline]
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct HeldLock {
    pub slot: u64,
    pub exclusive: bool,
}

#[derive(Default)]
struct HeldLocks {
    slots: Vec<Option<HeldLock>>,
    free: Vec<usize>,
}

/// Runtime state of one open pool.
pub struct Session {
    id: PoolId,
    path: PathBuf,
    region: Arc<MappedRegion>,
    alloc: Arc<dyn RegionAllocator>,
    journal: Arc<Journal>,
    map: HopMap,
    held: Mutex<HeldLocks>,
    closed: AtomicBool,
}

impl Session {
    /// Create a new pool file and build a session over it.
    pub fn create(
        id: PoolId,
        path: &Path,
        size: u64,
        variant: alloc::AllocatorVariant,
        base_buckets: u64,
        load_factor: f64,
    ) -> Result<Self, SessionError> {
        let region = Arc::new(MappedRegion::create(path, size)?);
        let allocator: Arc<dyn RegionAllocator> =
            Arc::from(alloc::create_allocator(Arc::clone(&region), variant)?);
        let journal = Arc::new(Journal::new(
            Arc::clone(&region),
            Arc::clone(&allocator),
            PersistData::new(Arc::clone(&region)),
        ));
        let map = HopMap::create(
            Arc::clone(&region),
            Arc::clone(&allocator),
            Arc::clone(&journal),
            base_buckets,
            load_factor,
        )?;
        Ok(Self {
            id,
            path: path.to_path_buf(),
            region,
            alloc: allocator,
            journal,
            map,
            held: Mutex::new(HeldLocks::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Map an existing pool, replay its journal and rebuild the table view.
    pub fn open(id: PoolId, path: &Path) -> Result<Self, SessionError> {
        let region = Arc::new(MappedRegion::open(path)?);
        let allocator: Arc<dyn RegionAllocator> =
            Arc::from(alloc::open_allocator(Arc::clone(&region))?);
        let journal = Arc::new(Journal::new(
            Arc::clone(&region),
            Arc::clone(&allocator),
            PersistData::new(Arc::clone(&region)),
        ));
        atomic::recover(&journal)?;
        let map = HopMap::open(
            Arc::clone(&region),
            Arc::clone(&allocator),
            Arc::clone(&journal),
        )?;
        Ok(Self {
            id,
            path: path.to_path_buf(),
            region,
            alloc: allocator,
            journal,
            map,
            held: Mutex::new(HeldLocks::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Pool id this session was registered under.
    #[inline]
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Path of the backing pool file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The mapped region.
    #[inline]
    pub fn region(&self) -> &Arc<MappedRegion> {
        &self.region
    }

    /// The region allocator.
    #[inline]
    pub fn alloc(&self) -> &Arc<dyn RegionAllocator> {
        &self.alloc
    }

    /// The journal.
    #[inline]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// The table view.
    #[inline]
    pub fn map(&self) -> &HopMap {
        &self.map
    }

    /// Mark the session closed; cached references become invalid.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether the session was closed out of the registry.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record a held key lock and hand out its token.
    pub(crate) fn register_lock(&self, slot: u64, exclusive: bool) -> LockToken {
        let mut held = self.held.lock();
        let entry = HeldLock { slot, exclusive };
        let index = match held.free.pop() {
            Some(index) => {
                held.slots[index] = Some(entry);
                index
            }
            None => {
                held.slots.push(Some(entry));
                held.slots.len() - 1
            }
        };
        LockToken(index as u64 + 1)
    }

    /// Take a held lock back out of the token table.
    pub(crate) fn take_lock(&self, token: LockToken) -> Option<HeldLock> {
        if token.is_none() {
            return None;
        }
        let index = (token.0 - 1) as usize;
        let mut held = self.held.lock();
        let entry = held.slots.get_mut(index)?.take();
        if entry.is_some() {
            held.free.push(index);
        }
        entry
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::AllocatorVariant;

    #[test]
    fn test_lock_token_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::create(
            PoolId::from_raw(1 << 32),
            &dir.path().join("pool"),
            1 << 20,
            AllocatorVariant::FreeList,
            128,
            0.875,
        )
        .unwrap();

        let a = session.register_lock(3, true);
        let b = session.register_lock(9, false);
        assert_ne!(a, b);
        assert!(!a.is_none());

        let held = session.take_lock(a).unwrap();
        assert_eq!(held.slot, 3);
        assert!(held.exclusive);
        // Double release fails.
        assert!(session.take_lock(a).is_none());
        assert!(session.take_lock(LockToken::NONE).is_none());

        // The freed index is reused.
        let c = session.register_lock(5, false);
        assert_eq!(c, a);
        assert!(session.take_lock(b).is_some());
        assert!(session.take_lock(c).is_some());
    }

    #[test]
    fn test_create_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool");
        {
            let session = Session::create(
                PoolId::from_raw(1 << 32),
                &path,
                1 << 20,
                AllocatorVariant::ExtentTree,
                128,
                0.875,
            )
            .unwrap();
            session.map().insert(b"k", b"v").unwrap();
        }
        let session = Session::open(PoolId::from_raw(2 << 32), &path).unwrap();
        assert_eq!(session.map().element_count(), 1);
        assert!(session.map().find(b"k").is_some());
    }
}
