//! Bucket locking primitives.
//!
//! The store's thread model is chosen at build time: the default build uses a
//! real shared/exclusive lock per bucket (`parking_lot`), while the
//! `single-thread` feature replaces it with a no-op lock of the same shape
//! for single-threaded pool use.

use parking_lot::lock_api::RawRwLock as _;

/// Shared/exclusive lock surface used for bucket owner and content cells.
pub trait SharedMutex: Send + Sync + Default {
    /// Acquire a shared lock, blocking.
    fn lock_shared(&self);
    /// Try to acquire a shared lock without blocking.
    fn try_lock_shared(&self) -> bool;
    /// Release a shared lock.
    ///
    /// The caller must hold a shared lock acquired on this mutex.
    fn unlock_shared(&self);
    /// Acquire an exclusive lock, blocking.
    fn lock_exclusive(&self);
    /// Try to acquire an exclusive lock without blocking.
    fn try_lock_exclusive(&self) -> bool;
    /// Release an exclusive lock.
    ///
    /// The caller must hold the exclusive lock on this mutex.
    fn unlock_exclusive(&self);
}

/// Real shared/exclusive lock backed by `parking_lot`.
pub struct RwSharedMutex(parking_lot::RawRwLock);

impl Default for RwSharedMutex {
    fn default() -> Self {
        Self(<parking_lot::RawRwLock as parking_lot::lock_api::RawRwLock>::INIT)
    }
}

impl SharedMutex for RwSharedMutex {
    #[inline]
    fn lock_shared(&self) {
        self.0.lock_shared();
    }

    #[inline]
    fn try_lock_shared(&self) -> bool {
        self.0.try_lock_shared()
    }

    #[inline]
    fn unlock_shared(&self) {
        // Caller contract: a shared lock is held.
        unsafe { self.0.unlock_shared() }
    }

    #[inline]
    fn lock_exclusive(&self) {
        self.0.lock_exclusive();
    }

    #[inline]
    fn try_lock_exclusive(&self) -> bool {
        self.0.try_lock_exclusive()
    }

    #[inline]
    fn unlock_exclusive(&self) {
        // Caller contract: the exclusive lock is held.
        unsafe { self.0.unlock_exclusive() }
    }
}

/// No-op lock for the single-threaded build.
///
/// Every acquisition succeeds immediately; exclusivity is the caller's
/// problem, exactly as in a single-threaded pool.
#[derive(Default)]
pub struct NoopSharedMutex;

impl SharedMutex for NoopSharedMutex {
    #[inline]
    fn lock_shared(&self) {}

    #[inline]
    fn try_lock_shared(&self) -> bool {
        true
    }

    #[inline]
    fn unlock_shared(&self) {}

    #[inline]
    fn lock_exclusive(&self) {}

    #[inline]
    fn try_lock_exclusive(&self) -> bool {
        true
    }

    #[inline]
    fn unlock_exclusive(&self) {}
}

/// Bucket lock selected by the build-time thread model.
#[cfg(not(feature = "single-thread"))]
pub type BucketMutex = RwSharedMutex;

/// Bucket lock selected by the build-time thread model.
#[cfg(feature = "single-thread")]
pub type BucketMutex = NoopSharedMutex;

/// Lock pair for one bucket.
///
/// Owner and content are locked independently so a neighborhood scan can hold
/// several shared owner locks while taking one exclusive content lock.
#[derive(Default)]
pub struct BucketLockPair {
    /// Protects the owner bitmap.
    pub owner: BucketMutex,
    /// Protects the content triple.
    pub content: BucketMutex,
}

impl BucketLockPair {
    /// Create an unlocked pair.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_excludes_shared() {
        let m = RwSharedMutex::default();
        assert!(m.try_lock_exclusive());
        assert!(!m.try_lock_shared());
        assert!(!m.try_lock_exclusive());
        m.unlock_exclusive();
        assert!(m.try_lock_shared());
        m.unlock_shared();
    }

    #[test]
    fn test_shared_allows_shared() {
        let m = RwSharedMutex::default();
        assert!(m.try_lock_shared());
        assert!(m.try_lock_shared());
        assert!(!m.try_lock_exclusive());
        m.unlock_shared();
        m.unlock_shared();
        assert!(m.try_lock_exclusive());
        m.unlock_exclusive();
    }

    #[test]
    fn test_noop_always_succeeds() {
        let m = NoopSharedMutex;
        assert!(m.try_lock_exclusive());
        assert!(m.try_lock_exclusive());
        assert!(m.try_lock_shared());
    }
}
