//! Pool manager: lifecycle, registry and the per-thread session cache.
//!
//! External pool handles are generational indices into a slab guarded by
//! the registry mutex, never raw pointers; a stale handle misses the
//! generation check and reports `pool-not-found` instead of dangling. The
//! hot locate path goes through a thread-local cache of weak session
//! references that invalidates lazily when a session is closed.

mod session;

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

pub use session::{LockToken, Session, SessionError};

use crate::alloc::AllocatorVariant;
use crate::region::MappedRegion;

/// Opaque pool handle: generation in the high half, slab slot in the low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u64);

impl PoolId {
    /// Invalid pool handle.
    pub const NONE: PoolId = PoolId(0);

    fn new(slot: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | slot as u64)
    }

    fn slot(&self) -> u32 {
        self.0 as u32
    }

    fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw 64-bit surface of the handle.
    #[inline]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Rebuild a handle from its raw surface.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Errors from pool lifecycle and lookup.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No pool for this handle or name.
    #[error("pool not found")]
    NotFound,
    /// The pool file already exists.
    #[error("pool already exists: {0}")]
    AlreadyExists(PathBuf),
    /// The pool is already open in this process.
    #[error("pool already open: {0}")]
    AlreadyOpen(PathBuf),
    /// Session construction failure.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// File removal failure.
    #[error(transparent)]
    Region(#[from] crate::region::RegionError),
}

struct PoolSlot {
    generation: u32,
    session: Option<Arc<Session>>,
}

#[derive(Default)]
struct Registry {
    slots: Vec<PoolSlot>,
    free: Vec<u32>,
    open_paths: HashSet<PathBuf>,
}

impl Registry {
    fn reserve(&mut self) -> PoolId {
        match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.slots[slot as usize];
                entry.generation = entry.generation.wrapping_add(1).max(1);
                PoolId::new(slot, entry.generation)
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(PoolSlot { generation: 1, session: None });
                PoolId::new(slot, 1)
            }
        }
    }

    fn release(&mut self, id: PoolId) {
        let entry = &mut self.slots[id.slot() as usize];
        entry.session = None;
        self.free.push(id.slot());
    }

    fn get(&self, id: PoolId) -> Option<&Arc<Session>> {
        let entry = self.slots.get(id.slot() as usize)?;
        if entry.generation != id.generation() {
            return None;
        }
        entry.session.as_ref()
    }
}

thread_local! {
    /// Per-thread short-circuit for session lookup.
    static SESSION_CACHE: RefCell<HashMap<u64, Weak<Session>>> = RefCell::new(HashMap::new());
}

/// Process-wide pool registry.
#[derive(Default)]
pub struct PoolManager {
    registry: Mutex<Registry>,
}

impl PoolManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    fn pool_path(directory: &Path, name: &str) -> PathBuf {
        directory.join(name)
    }

    /// Create a pool file and register its session.
    pub fn create_pool(
        &self,
        directory: &Path,
        name: &str,
        size: u64,
        variant: AllocatorVariant,
        base_buckets: u64,
        load_factor: f64,
    ) -> Result<PoolId, PoolError> {
        let path = Self::pool_path(directory, name);
        let id = {
            let mut registry = self.registry.lock();
            if registry.open_paths.contains(&path) {
                return Err(PoolError::AlreadyOpen(path));
            }
            registry.reserve()
        };

        let built = Session::create(id, &path, size, variant, base_buckets, load_factor);
        self.commit(id, &path, built)
    }

    /// Open an existing pool file and register its session.
    pub fn open_pool(&self, directory: &Path, name: &str) -> Result<PoolId, PoolError> {
        let path = Self::pool_path(directory, name);
        let id = {
            let mut registry = self.registry.lock();
            if registry.open_paths.contains(&path) {
                return Err(PoolError::AlreadyOpen(path));
            }
            registry.reserve()
        };

        let built = Session::open(id, &path);
        self.commit(id, &path, built)
    }

    fn commit(
        &self,
        id: PoolId,
        path: &Path,
        built: Result<Session, SessionError>,
    ) -> Result<PoolId, PoolError> {
        let mut registry = self.registry.lock();
        let session = match built {
            Ok(session) => session,
            Err(err) => {
                registry.release(id);
                return Err(classify(path, err));
            }
        };
        if !registry.open_paths.insert(path.to_path_buf()) {
            // Lost a race for the same pool file.
            registry.release(id);
            return Err(PoolError::AlreadyOpen(path.to_path_buf()));
        }
        registry.slots[id.slot() as usize].session = Some(Arc::new(session));
        debug!(pool = id.raw(), path = %path.display(), "pool registered");
        Ok(id)
    }

    /// Locate the session for a handle: thread cache first, then the locked
    /// registry.
    pub fn locate(&self, id: PoolId) -> Result<Arc<Session>, PoolError> {
        let cached = SESSION_CACHE.with(|cache| {
            let mut cache = cache.borrow_mut();
            match cache.get(&id.raw()).and_then(Weak::upgrade) {
                Some(session) if !session.is_closed() => Some(session),
                _ => {
                    cache.remove(&id.raw());
                    None
                }
            }
        });
        if let Some(session) = cached {
            return Ok(session);
        }

        let registry = self.registry.lock();
        let session = registry.get(id).cloned().ok_or(PoolError::NotFound)?;
        drop(registry);
        SESSION_CACHE.with(|cache| {
            cache.borrow_mut().insert(id.raw(), Arc::downgrade(&session));
        });
        Ok(session)
    }

    /// Close a pool: deregister, mark the session closed and unmap when the
    /// last reference drops. Nothing is written beyond what was already
    /// durable.
    pub fn close_pool(&self, id: PoolId) -> Result<Arc<Session>, PoolError> {
        let mut registry = self.registry.lock();
        let session = registry.get(id).cloned().ok_or(PoolError::NotFound)?;
        registry.open_paths.remove(session.path());
        registry.release(id);
        drop(registry);

        session.mark_closed();
        SESSION_CACHE.with(|cache| {
            cache.borrow_mut().remove(&id.raw());
        });
        debug!(pool = id.raw(), "pool closed");
        Ok(session)
    }

    /// Close a pool and remove its backing file.
    pub fn delete_pool(&self, id: PoolId) -> Result<(), PoolError> {
        let session = self.close_pool(id)?;
        let path = session.path().to_path_buf();
        drop(session);
        MappedRegion::delete(&path)?;
        debug!(path = %path.display(), "pool deleted");
        Ok(())
    }

    /// Remove a pool file by name. The pool must not be open.
    pub fn delete_pool_by_name(&self, directory: &Path, name: &str) -> Result<(), PoolError> {
        let path = Self::pool_path(directory, name);
        {
            let registry = self.registry.lock();
            if registry.open_paths.contains(&path) {
                return Err(PoolError::AlreadyOpen(path));
            }
        }
        if !path.exists() {
            return Err(PoolError::NotFound);
        }
        MappedRegion::delete(&path)?;
        debug!(path = %path.display(), "pool deleted");
        Ok(())
    }
}

fn classify(path: &Path, err: SessionError) -> PoolError {
    if let SessionError::Region(crate::region::RegionError::Io(io)) = &err {
        match io.kind() {
            std::io::ErrorKind::AlreadyExists => {
                return PoolError::AlreadyExists(path.to_path_buf());
            }
            std::io::ErrorKind::NotFound => return PoolError::NotFound,
            _ => {}
        }
    }
    PoolError::Session(err)
}
