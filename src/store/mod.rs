//! The public key-value store façade.
//!
//! [`Hopstore`] exposes the pool-oriented KV contract over the hop-scotch
//! table: pool lifecycle, put/get in both allocating and caller-buffer
//! flavors, erase, counting, key locks, functor application, journaled
//! atomic updates, whole-pool iteration and the debug hooks. Internal
//! errors are mapped onto the stable [`Status`] codes at this boundary.

use std::path::Path;
use std::sync::Arc;

use crate::alloc::{AllocError, AllocatorVariant};
use crate::atomic::{self, JournalError, JournalOp};
use crate::pool::{LockToken, PoolError, PoolId, PoolManager, Session};
use crate::status::{LockType, Operation, Status, ThreadSafety};
use crate::table::pstr::{self, INLINE_CAP};
use crate::table::{InsertOutcome, MapError};

/// Retries for find-then-lock races against a concurrent resize.
const LOOKUP_RETRIES: usize = 16;

/// Runtime store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Buckets in segment 0 (rounded up to a power of two).
    pub base_buckets: u64,
    /// Load-factor threshold that triggers a resize.
    pub load_factor: f64,
    /// Region allocator variant for new pools.
    pub allocator: AllocatorVariant,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_buckets: 128,
            load_factor: 0.875,
            allocator: AllocatorVariant::default(),
        }
    }
}

/// One mapped region backing a pool, as reported by
/// [`get_pool_regions`](Hopstore::get_pool_regions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRegion {
    /// Virtual base address for this open.
    pub base: usize,
    /// Region size in bytes.
    pub size: u64,
    /// Stable region identifier.
    pub region_id: u64,
}

/// The pluggable persistent-memory KV store.
pub struct Hopstore {
    manager: PoolManager,
    config: StoreConfig,
}

impl Default for Hopstore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl Hopstore {
    /// Create a store with the given configuration.
    pub fn new(mut config: StoreConfig) -> Self {
        config.base_buckets = config.base_buckets.max(1).next_power_of_two();
        config.load_factor = config.load_factor.clamp(0.1, 1.0);
        Self {
            manager: PoolManager::new(),
            config,
        }
    }

    /// Report the build-time thread model.
    pub const fn thread_safety(&self) -> ThreadSafety {
        #[cfg(feature = "single-thread")]
        {
            ThreadSafety::SinglePerPool
        }
        #[cfg(not(feature = "single-thread"))]
        {
            ThreadSafety::MultiPerPool
        }
    }

    fn session(&self, pool: PoolId) -> Result<Arc<Session>, Status> {
        self.manager.locate(pool).map_err(pool_status)
    }

    /// Create an object pool of `size` bytes under `directory/name`.
    ///
    /// `flags` are accepted for interface parity; the persistent-memory
    /// backend ignores them.
    pub fn create_pool(
        &self,
        directory: &Path,
        name: &str,
        size: u64,
        _flags: u32,
    ) -> Result<PoolId, Status> {
        self.manager
            .create_pool(
                directory,
                name,
                size,
                self.config.allocator,
                self.config.base_buckets,
                self.config.load_factor,
            )
            .map_err(pool_status)
    }

    /// Open an existing pool.
    pub fn open_pool(&self, directory: &Path, name: &str, _flags: u32) -> Result<PoolId, Status> {
        self.manager.open_pool(directory, name).map_err(pool_status)
    }

    /// Close a pool handle. The region is unmapped once the last internal
    /// reference drops; nothing new is written on close.
    pub fn close_pool(&self, pool: PoolId) -> Status {
        match self.manager.close_pool(pool) {
            Ok(_) => Status::Ok,
            Err(err) => pool_status(err),
        }
    }

    /// Close a pool and delete its backing file.
    pub fn delete_pool(&self, pool: PoolId) -> Status {
        match self.manager.delete_pool(pool) {
            Ok(()) => Status::Ok,
            Err(err) => pool_status(err),
        }
    }

    /// Delete a pool by name. The pool must not be open.
    pub fn delete_pool_by_name(&self, directory: &Path, name: &str) -> Status {
        match self.manager.delete_pool_by_name(directory, name) {
            Ok(()) => Status::Ok,
            Err(err) => pool_status(err),
        }
    }

    /// Mapped memory regions of a pool.
    pub fn get_pool_regions(&self, pool: PoolId) -> Result<Vec<PoolRegion>, Status> {
        let session = self.session(pool)?;
        let region = session.region();
        Ok(vec![PoolRegion {
            base: region.base_address(),
            size: region.len(),
            region_id: pool.raw(),
        }])
    }

    /// Write or overwrite a value.
    ///
    /// An existing value of the same size is overwritten in place through
    /// the journal; a different size reallocates the value.
    pub fn put(&self, pool: PoolId, key: &[u8], value: &[u8]) -> Status {
        let session = match self.session(pool) {
            Ok(session) => session,
            Err(status) => return status,
        };
        match session.map().insert(key, value) {
            Ok(InsertOutcome::Inserted(_)) => Status::Ok,
            Ok(InsertOutcome::Exists(slot)) => self.overwrite(&session, slot, key, value),
            Err(err) => put_status(err),
        }
    }

    /// Zero-copy put. The persistent-memory backend serves this through the
    /// ordinary put path.
    pub fn put_direct(&self, pool: PoolId, key: &[u8], value: &[u8]) -> Status {
        self.put(pool, key, value)
    }

    fn overwrite(&self, session: &Session, slot: u64, key: &[u8], value: &[u8]) -> Status {
        let map = session.map();
        let region = session.region();
        let guard = map.content_guard(slot, true);
        let bucket = map.bucket(slot);
        if !(bucket.in_use(region) && bucket.key_slot().equals(region, key)) {
            // Lost a race with an erase or a migration; redo the put.
            drop(guard);
            return self.put(session.id(), key, value);
        }
        let old_len = bucket.value_slot().len(region);
        if old_len == value.len() as u64 {
            // Same size: replay the difference through the journal.
            let ops = [Operation::Write { offset: 0, bytes: value.to_vec() }];
            self.update_in_place(session, slot, &ops)
        } else {
            self.replace_value(session, slot, value)
        }
    }

    /// Replace the value of a locked slot with a reallocated one.
    ///
    /// The new bytes are fully written and fenced before the journal record
    /// is prepared; the old chunk is released only after the new slot image
    /// is durable.
    fn replace_value(&self, session: &Session, slot: u64, value: &[u8]) -> Status {
        let map = session.map();
        let region = session.region();
        let alloc = session.alloc();
        let journal = session.journal();
        let bucket = map.bucket(slot);
        let value_slot = bucket.value_slot();

        let mut old_image = [0u8; pstr::SLOT_SIZE];
        region.read_bytes(value_slot.0, &mut old_image);

        let new_image = if value.len() <= INLINE_CAP {
            pstr::encode_inline(value)
        } else {
            let chunk = match alloc.allocate(value.len() as u64, 8) {
                Ok(chunk) => chunk,
                Err(err) => return alloc_status(&err, Status::TooLarge),
            };
            region.write_bytes(chunk, value);
            if region.persist(chunk, value.len()).is_err() {
                return Status::Fail;
            }
            pstr::encode_indirect(value.len() as u64, chunk)
        };

        let result: Result<(), JournalError> = (|| {
            let record = journal.append_replace(slot, &old_image, &new_image)?;
            region.write_bytes(value_slot.0, &new_image);
            bucket.persist_content(region)?;
            journal.set_applied(record)?;
            let old = pstr::decode(&old_image);
            if let Some(chunk) = old.chunk {
                alloc.deallocate(chunk, old.len)?;
            }
            journal.retire(record)?;
            Ok(())
        })();
        match result {
            Ok(()) => Status::Ok,
            Err(err) => journal_status(&err),
        }
    }

    /// Read a value into a freshly allocated buffer.
    pub fn get(&self, pool: PoolId, key: &[u8]) -> Result<Vec<u8>, Status> {
        let session = self.session(pool)?;
        let map = session.map();
        let region = session.region();
        for _ in 0..LOOKUP_RETRIES {
            let Some(slot) = map.find(key) else {
                return Err(Status::KeyNotFound);
            };
            let guard = map.content_guard(slot, false);
            let bucket = map.bucket(slot);
            if bucket.in_use(region) && bucket.key_slot().equals(region, key) {
                let bytes = bucket.value_slot().bytes(region).to_vec();
                drop(guard);
                return Ok(bytes);
            }
            drop(guard);
        }
        Err(Status::KeyNotFound)
    }

    /// Read a value into a caller buffer, returning the value length.
    ///
    /// An undersized buffer fails with [`Status::InsufficientBuffer`]; the
    /// required length is not reported.
    pub fn get_direct(&self, pool: PoolId, key: &[u8], out: &mut [u8]) -> Result<usize, Status> {
        let session = self.session(pool)?;
        let map = session.map();
        let region = session.region();
        for _ in 0..LOOKUP_RETRIES {
            let Some(slot) = map.find(key) else {
                return Err(Status::KeyNotFound);
            };
            let guard = map.content_guard(slot, false);
            let bucket = map.bucket(slot);
            if bucket.in_use(region) && bucket.key_slot().equals(region, key) {
                let value = bucket.value_slot().bytes(region);
                if out.len() < value.len() {
                    return Err(Status::InsufficientBuffer);
                }
                let len = value.len();
                out[..len].copy_from_slice(value);
                drop(guard);
                return Ok(len);
            }
            drop(guard);
        }
        Err(Status::KeyNotFound)
    }

    /// Erase an object.
    pub fn erase(&self, pool: PoolId, key: &[u8]) -> Status {
        let session = match self.session(pool) {
            Ok(session) => session,
            Err(status) => return status,
        };
        match session.map().erase(key) {
            Ok(true) => Status::Ok,
            Ok(false) => Status::KeyNotFound,
            Err(err) => map_status(&err),
        }
    }

    /// Number of objects in the pool.
    pub fn count(&self, pool: PoolId) -> Result<u64, Status> {
        Ok(self.session(pool)?.map().element_count())
    }

    /// Take a key lock.
    ///
    /// An absent key is created with an uninitialized value of `size_hint`
    /// bytes. A lock that cannot be taken returns [`LockToken::NONE`] and
    /// creates nothing. Returns the token and the value length.
    pub fn lock(
        &self,
        pool: PoolId,
        key: &[u8],
        lock_type: LockType,
        size_hint: u64,
    ) -> Result<(LockToken, u64), Status> {
        let session = self.session(pool)?;
        let map = session.map();
        let region = session.region();

        let slot = match map.find(key) {
            Some(slot) => slot,
            None => match map.insert_uninit(key, size_hint) {
                Ok(InsertOutcome::Inserted(slot)) | Ok(InsertOutcome::Exists(slot)) => slot,
                Err(_) => return Ok((LockToken::NONE, 0)),
            },
        };

        let exclusive = lock_type == LockType::Write;
        if !map.try_user_lock(slot, exclusive) {
            return Ok((LockToken::NONE, 0));
        }
        let len = map.bucket(slot).value_slot().len(region);
        Ok((session.register_lock(slot, exclusive), len))
    }

    /// Release a key lock. The sentinel token is accepted and ignored.
    pub fn unlock(&self, pool: PoolId, token: LockToken) -> Status {
        if token.is_none() {
            return Status::Ok;
        }
        let session = match self.session(pool) {
            Ok(session) => session,
            Err(status) => return status,
        };
        match session.take_lock(token) {
            Some(held) => {
                session.map().user_unlock(held.slot, held.exclusive);
                Status::Ok
            }
            None => Status::BadParam,
        }
    }

    /// Apply a functor to an object's value bytes, creating the object with
    /// `object_size` uninitialized bytes when absent.
    pub fn apply<F>(
        &self,
        pool: PoolId,
        key: &[u8],
        object_size: u64,
        take_lock: bool,
        f: F,
    ) -> Status
    where
        F: FnOnce(&mut [u8]),
    {
        let session = match self.session(pool) {
            Ok(session) => session,
            Err(status) => return status,
        };
        let map = session.map();
        let region = session.region();

        let slot = match map.find(key) {
            Some(slot) => slot,
            None => match map.insert_uninit(key, object_size) {
                Ok(InsertOutcome::Inserted(slot)) | Ok(InsertOutcome::Exists(slot)) => slot,
                Err(err) => return put_status(err),
            },
        };

        let guard = take_lock.then(|| map.content_guard(slot, true));
        let value = map.bucket(slot).value_slot();
        let len = value.len(region) as usize;
        let offset = value.data_offset(region);
        // The exclusive content guard (or the caller's own key lock when
        // `take_lock` is false) keeps these bytes unaliased.
        let bytes = unsafe { region.slice_mut(offset, len) };
        f(bytes);
        let fenced = region.persist(offset, len);
        drop(guard);
        match fenced {
            Ok(()) => Status::Ok,
            Err(_) => Status::Fail,
        }
    }

    /// Apply a journaled operation sequence to an existing value as one
    /// crash-atomic unit.
    pub fn atomic_update(
        &self,
        pool: PoolId,
        key: &[u8],
        ops: &[Operation],
        take_lock: bool,
    ) -> Status {
        let session = match self.session(pool) {
            Ok(session) => session,
            Err(status) => return status,
        };
        let map = session.map();
        let Some(slot) = map.find(key) else {
            return Status::KeyNotFound;
        };
        if take_lock {
            let _guard = map.content_guard(slot, true);
            self.update_in_place(&session, slot, ops)
        } else {
            self.update_in_place(&session, slot, ops)
        }
    }

    /// Journal and apply `ops`; the caller holds the bucket lock.
    fn update_in_place(&self, session: &Session, slot: u64, ops: &[Operation]) -> Status {
        let map = session.map();
        let region = session.region();
        let journal = session.journal();
        let value = map.bucket(slot).value_slot();
        let value_len = value.len(region);
        let value_off = value.data_offset(region);

        // Arithmetic ops are resolved at prepare time so replay is
        // idempotent; `staged` carries the running u64 value per offset so
        // consecutive increments within one list compound.
        let mut staged: std::collections::HashMap<u64, u64> = std::collections::HashMap::new();
        let mut journaled = Vec::with_capacity(ops.len());
        for op in ops {
            let (offset, len) = (op.offset() as u64, op.len() as u64);
            if offset.checked_add(len).is_none_or(|end| end > value_len) {
                return Status::BadOffset;
            }
            journaled.push(match op {
                Operation::Write { offset, bytes } => JournalOp::Write {
                    offset: *offset as u64,
                    bytes: bytes.clone(),
                },
                Operation::Zero { offset, len } => JournalOp::Zero {
                    offset: *offset as u64,
                    len: *len as u64,
                },
                Operation::IncrementU64 { offset } => {
                    let off = *offset as u64;
                    let current = staged
                        .get(&off)
                        .copied()
                        .unwrap_or_else(|| region.read_u64(value_off + off));
                    let value = current.wrapping_add(1);
                    staged.insert(off, value);
                    JournalOp::PutU64 { offset: off, value }
                }
                Operation::CasU64 { offset, expected, new } => {
                    let off = *offset as u64;
                    let current = staged
                        .get(&off)
                        .copied()
                        .unwrap_or_else(|| region.read_u64(value_off + off));
                    if current == *expected {
                        staged.insert(off, *new);
                    }
                    JournalOp::CasU64 { offset: off, expected: *expected, new: *new }
                }
            });
        }

        let result: Result<(), JournalError> = (|| {
            let record = journal.append_update(slot, &journaled)?;
            atomic::apply_ops(region, value_off, value_len, &journaled)?;
            journal.set_applied(record)?;
            journal.retire(record)?;
            Ok(())
        })();
        match result {
            Ok(()) => Status::Ok,
            Err(err) => journal_status(&err),
        }
    }

    /// Apply a functor to every live entry, in bucket-directory order.
    ///
    /// Iteration order is not stable across resizes.
    pub fn map<F>(&self, pool: PoolId, f: F) -> Status
    where
        F: FnMut(&[u8], &[u8]),
    {
        match self.session(pool) {
            Ok(session) => {
                session.map().for_each(f);
                Status::Ok
            }
            Err(status) => status,
        }
    }

    /// Release a buffer returned by [`get`](Self::get).
    ///
    /// Buffers are owned `Vec`s, so this is a plain drop; the method exists
    /// for interface parity with callers that pair every get with a free.
    pub fn free_memory(&self, buffer: Vec<u8>) {
        drop(buffer);
    }

    /// Debug hooks: `0` arms or disarms fence fault injection, `1` sets the
    /// remaining fence budget, `2` counts live entries by bucket walk.
    pub fn debug(&self, pool: PoolId, cmd: u32, arg: u64) -> Result<u64, Status> {
        let session = self.session(pool)?;
        match cmd {
            0 => {
                session.region().set_fence_faults(arg != 0);
                Ok(0)
            }
            1 => {
                session.region().reset_fence_budget(arg);
                Ok(0)
            }
            2 => {
                let mut live = 0u64;
                session.map().for_each(|_, _| live += 1);
                Ok(live)
            }
            _ => Ok(0),
        }
    }

    /// Control invocation; no commands are currently interpreted.
    pub fn ioctl(&self, _command: &str) -> Status {
        Status::NotSupported
    }

    /// Structural consistency check over a pool's table (diagnostic).
    pub fn check_pool(&self, pool: PoolId) -> Result<(), Status> {
        let session = self.session(pool)?;
        session.map().check_consistency().map_err(|report| {
            tracing::error!(pool = pool.raw(), report = %report, "table consistency violated");
            Status::Fail
        })
    }
}

fn pool_status(err: PoolError) -> Status {
    match err {
        PoolError::NotFound => Status::PoolNotFound,
        PoolError::AlreadyExists(_) | PoolError::AlreadyOpen(_) => Status::AlreadyExists,
        PoolError::Session(_) | PoolError::Region(_) => Status::Fail,
    }
}

/// Status mapping for insert-path failures: allocation exhaustion surfaces
/// as `TooLarge` on put, resize failure as `Fail`.
fn put_status(err: MapError) -> Status {
    match err {
        MapError::Alloc(ref alloc) => alloc_status(alloc, Status::TooLarge),
        MapError::ResizeFailed(_) | MapError::TableFull => Status::Fail,
        MapError::Journal(ref journal) => journal_status(journal),
        MapError::Region(_) => Status::Fail,
    }
}

fn map_status(err: &MapError) -> Status {
    match err {
        MapError::Alloc(alloc) => alloc_status(alloc, Status::Fail),
        MapError::Journal(journal) => journal_status(journal),
        MapError::ResizeFailed(_) | MapError::TableFull | MapError::Region(_) => Status::Fail,
    }
}

fn alloc_status(err: &AllocError, out_of_space: Status) -> Status {
    match err {
        AllocError::OutOfSpace(_) => out_of_space,
        AllocError::BadAlignment(_) => Status::BadAlignment,
        AllocError::Region(_) | AllocError::UnknownVariant(_) => Status::Fail,
    }
}

fn journal_status(err: &JournalError) -> Status {
    match err {
        JournalError::BadOffset { .. } => Status::BadOffset,
        JournalError::Alloc(alloc) => alloc_status(alloc, Status::TooLarge),
        JournalError::Region(_) | JournalError::Corrupt(_) => Status::Fail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, Hopstore, PoolId) {
        let dir = tempfile::tempdir().unwrap();
        let store = Hopstore::default();
        let pool = store.create_pool(dir.path(), "t0", 1 << 20, 0).unwrap();
        (dir, store, pool)
    }

    #[test]
    fn test_thread_safety_report() {
        let store = Hopstore::default();
        #[cfg(not(feature = "single-thread"))]
        assert_eq!(store.thread_safety(), ThreadSafety::MultiPerPool);
        #[cfg(feature = "single-thread")]
        assert_eq!(store.thread_safety(), ThreadSafety::SinglePerPool);
    }

    #[test]
    fn test_config_normalization() {
        let store = Hopstore::new(StoreConfig {
            base_buckets: 100,
            load_factor: 7.0,
            allocator: AllocatorVariant::FreeList,
        });
        assert_eq!(store.config.base_buckets, 128);
        assert_eq!(store.config.load_factor, 1.0);
    }

    #[test]
    fn test_debug_count_matches() {
        let (_dir, store, pool) = store();
        assert_eq!(store.put(pool, b"a", b"1"), Status::Ok);
        assert_eq!(store.put(pool, b"b", b"2"), Status::Ok);
        assert_eq!(store.debug(pool, 2, 0).unwrap(), 2);
        assert_eq!(store.count(pool).unwrap(), 2);
    }

    #[test]
    fn test_ioctl_not_supported() {
        let (_dir, store, _pool) = store();
        assert_eq!(store.ioctl("compact"), Status::NotSupported);
    }

    #[test]
    fn test_pool_not_found_status() {
        let store = Hopstore::default();
        assert_eq!(store.put(PoolId::NONE, b"k", b"v"), Status::PoolNotFound);
        assert_eq!(store.get(PoolId::NONE, b"k"), Err(Status::PoolNotFound));
    }
}
