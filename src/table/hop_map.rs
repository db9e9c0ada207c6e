//! Hop-scotch hash table over a persistent region.
//!
//! For a key hashing to bucket `h`, the entry lives in one of the buckets
//! `[h, h + H)` where H is [`NEIGHBORHOOD`]; `owner[h]` records which of
//! those slots belong to `h`. Inserts that find no free neighborhood slot
//! probe forward and displace entries toward the neighborhood, journaling
//! each displacement so a crash can complete or discard it. The table grows
//! by appending a segment equal to the current bucket count and rehashing
//! in place behind a persisted cursor.
//!
//! Locking discipline: the resize gate is acquired before any bucket lock;
//! owner locks are acquired in ascending bucket order before content locks;
//! every acquisition that would violate this order is a try-lock that skips
//! or retries instead of blocking.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::bucket::{BucketRef, OwnerBits, BUCKET_SIZE, STATE_CLEAR};
use super::segment::PersistData;
use crate::alloc::{AllocError, RegionAllocator};
use crate::atomic::{self, Journal, JournalError};
use crate::region::{layout, MappedRegion, RegionError};
use crate::sync::{BucketLockPair, SharedMutex};
use crate::utility::hash_bytes;

/// Neighborhood width H: the owner bitmap covers this many slots.
pub const NEIGHBORHOOD: u64 = 64;

/// Errors from table operations.
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// Allocation failure for key or value storage.
    #[error(transparent)]
    Alloc(#[from] AllocError),
    /// Fence or mapping failure.
    #[error(transparent)]
    Region(#[from] RegionError),
    /// Journal failure during a displacement or update.
    #[error(transparent)]
    Journal(#[from] JournalError),
    /// The resize itself could not allocate its segment.
    #[error("failed to grow the table")]
    ResizeFailed(#[source] AllocError),
    /// The segment directory is exhausted or migration found no room.
    #[error("table cannot grow further")]
    TableFull,
}

/// Result of an insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The key was placed at the returned slot.
    Inserted(u64),
    /// An equal key already occupies the returned slot; the caller decides
    /// whether to update it in place.
    Exists(u64),
}

/// Initial value contents for an insert.
#[derive(Clone, Copy)]
pub enum ValueInit<'a> {
    /// Copy these bytes.
    Bytes(&'a [u8]),
    /// Reserve this many bytes, contents uninitialized.
    Uninit(u64),
}

enum RoomError {
    NeedResize,
    Map(MapError),
}

impl From<MapError> for RoomError {
    fn from(err: MapError) -> Self {
        RoomError::Map(err)
    }
}

impl From<JournalError> for RoomError {
    fn from(err: JournalError) -> Self {
        RoomError::Map(err.into())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Cell {
    Owner,
    Content,
}

/// RAII guard over one bucket cell lock.
pub(crate) struct CellGuard {
    seg: Arc<[BucketLockPair]>,
    idx: usize,
    cell: Cell,
    exclusive: bool,
}

impl Drop for CellGuard {
    fn drop(&mut self) {
        let pair = &self.seg[self.idx];
        let lock = match self.cell {
            Cell::Owner => &pair.owner,
            Cell::Content => &pair.content,
        };
        if self.exclusive {
            lock.unlock_exclusive();
        } else {
            lock.unlock_shared();
        }
    }
}

/// The hop-scotch table view over an open pool.
pub struct HopMap {
    region: Arc<MappedRegion>,
    alloc: Arc<dyn RegionAllocator>,
    journal: Arc<Journal>,
    data: PersistData,
    /// One lock array per segment; indexes stay stable because segments
    /// never move.
    locks: RwLock<Vec<Arc<[BucketLockPair]>>>,
    /// Readers are ordinary mutations; the writer is a resize migration.
    gate: RwLock<()>,
}

fn new_lock_segment(buckets: u64) -> Arc<[BucketLockPair]> {
    (0..buckets).map(|_| BucketLockPair::new()).collect::<Vec<_>>().into()
}

impl HopMap {
    /// Build a fresh table in a new pool: persist root, segment 0, locks.
    pub fn create(
        region: Arc<MappedRegion>,
        alloc: Arc<dyn RegionAllocator>,
        journal: Arc<Journal>,
        base_buckets: u64,
        load_factor: f64,
    ) -> Result<Self, MapError> {
        debug_assert!(base_buckets.is_power_of_two());
        let data = PersistData::create(Arc::clone(&region), base_buckets, load_factor)?;
        let map = Self {
            region,
            alloc,
            journal,
            data,
            locks: RwLock::new(Vec::new()),
            gate: RwLock::new(()),
        };
        let bytes = base_buckets * BUCKET_SIZE;
        let seg = map.alloc.allocate(bytes, 64).map_err(MapError::ResizeFailed)?;
        map.region.zero(seg, bytes as usize);
        map.region.persist(seg, bytes as usize)?;
        map.data.set_segment_offset(0, seg)?;
        map.locks.write().push(new_lock_segment(base_buckets));
        map.data.set_segment_count_target(1)?;
        map.data.set_segment_count(1)?;
        Ok(map)
    }

    /// Attach to the table persisted in an opened pool, resuming any
    /// interrupted resize. Journal recovery must already have run.
    pub fn open(
        region: Arc<MappedRegion>,
        alloc: Arc<dyn RegionAllocator>,
        journal: Arc<Journal>,
    ) -> Result<Self, MapError> {
        let data = PersistData::new(Arc::clone(&region));
        let target = data.segment_count_target();
        if target == 0 || !data.base_buckets().is_power_of_two() {
            // A crash between region creation and table initialization
            // leaves a valid magic over a zeroed root.
            return Err(RegionError::CorruptRoot("table root never initialized").into());
        }
        let mut locks = Vec::with_capacity(target as usize);
        for seg in 0..target {
            locks.push(new_lock_segment(data.segment_size(seg)));
        }
        let map = Self {
            region,
            alloc,
            journal,
            data,
            locks: RwLock::new(locks),
            gate: RwLock::new(()),
        };
        if map.data.segment_count_target() > map.data.segment_count() {
            debug!(cursor = map.data.resize_cursor(), "resuming interrupted resize");
            let _g = map.gate.write();
            map.finish_migration()?;
        }
        Ok(map)
    }

    /// The persist-data root.
    pub fn data(&self) -> &PersistData {
        &self.data
    }

    /// The journal shared with the store façade.
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Live entry count.
    pub fn element_count(&self) -> u64 {
        self.data.element_count()
    }

    /// Bucket count of the published geometry.
    pub fn bucket_count(&self) -> u64 {
        self.data.bucket_count_of(self.data.segment_count_target())
    }

    fn pair_for(&self, index: u64) -> (Arc<[BucketLockPair]>, usize) {
        let (seg, within) = self.data.locate(index);
        let locks = self.locks.read();
        (Arc::clone(&locks[seg as usize]), within as usize)
    }

    fn lock_cell(&self, index: u64, cell: Cell, exclusive: bool) -> CellGuard {
        let (seg, idx) = self.pair_for(index);
        {
            let pair = &seg[idx];
            let lock = match cell {
                Cell::Owner => &pair.owner,
                Cell::Content => &pair.content,
            };
            if exclusive {
                lock.lock_exclusive();
            } else {
                lock.lock_shared();
            }
        }
        CellGuard { seg, idx, cell, exclusive }
    }

    fn try_lock_cell(&self, index: u64, cell: Cell, exclusive: bool) -> Option<CellGuard> {
        let (seg, idx) = self.pair_for(index);
        let acquired = {
            let pair = &seg[idx];
            let lock = match cell {
                Cell::Owner => &pair.owner,
                Cell::Content => &pair.content,
            };
            if exclusive {
                lock.try_lock_exclusive()
            } else {
                lock.try_lock_shared()
            }
        };
        acquired.then_some(CellGuard { seg, idx, cell, exclusive })
    }

    /// Blocking content lock for value access; callers hold no other bucket
    /// lock.
    pub(crate) fn content_guard(&self, index: u64, exclusive: bool) -> CellGuard {
        self.lock_cell(index, Cell::Content, exclusive)
    }

    /// Try-lock a content cell on behalf of a store-level key lock; the
    /// lock is held until [`user_unlock`](Self::user_unlock).
    pub fn try_user_lock(&self, index: u64, exclusive: bool) -> bool {
        let (seg, idx) = self.pair_for(index);
        let pair = &seg[idx];
        if exclusive {
            pair.content.try_lock_exclusive()
        } else {
            pair.content.try_lock_shared()
        }
    }

    /// Release a lock taken by [`try_user_lock`](Self::try_user_lock).
    pub fn user_unlock(&self, index: u64, exclusive: bool) {
        let (seg, idx) = self.pair_for(index);
        let pair = &seg[idx];
        if exclusive {
            pair.content.unlock_exclusive();
        } else {
            pair.content.unlock_shared();
        }
    }

    /// The bucket record for a table-wide slot index.
    pub fn bucket(&self, index: u64) -> BucketRef {
        self.data.bucket(index)
    }

    /// Find the slot holding `key`, checking the published geometry first
    /// and the pre-resize geometry while a migration is in flight.
    pub fn find(&self, key: &[u8]) -> Option<u64> {
        let hash = hash_bytes(key);
        let target = self.data.bucket_count_of(self.data.segment_count_target());
        let actual = self.data.bucket_count_of(self.data.segment_count());
        for (pass, count) in [target, actual].into_iter().enumerate() {
            if count == 0 || (pass == 1 && count == target) {
                continue;
            }
            let h = hash % count;
            let _og = self.lock_cell(h, Cell::Owner, false);
            if let Some(slot) = self.scan_neighborhood(h, key) {
                return Some(slot);
            }
        }
        None
    }

    /// Scan the slots owned by `h` for `key`. The caller holds `owner[h]`.
    fn scan_neighborhood(&self, h: u64, key: &[u8]) -> Option<u64> {
        let home = self.data.bucket(h);
        for bit in OwnerBits(home.owner(&self.region)) {
            let j = h + bit as u64;
            let b = self.data.bucket(j);
            if b.in_use(&self.region) && b.key_slot().equals(&self.region, key) {
                return Some(j);
            }
        }
        None
    }

    /// Insert `key` with a copied value.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<InsertOutcome, MapError> {
        self.insert_impl(key, ValueInit::Bytes(value))
    }

    /// Insert `key` with an uninitialized value of `len` bytes.
    pub fn insert_uninit(&self, key: &[u8], len: u64) -> Result<InsertOutcome, MapError> {
        self.insert_impl(key, ValueInit::Uninit(len))
    }

    fn insert_impl(&self, key: &[u8], init: ValueInit<'_>) -> Result<InsertOutcome, MapError> {
        let hash = hash_bytes(key);
        loop {
            {
                let _gate = self.gate.read();
                let count = self.data.bucket_count_of(self.data.segment_count_target());
                let over_loaded = (self.data.element_count() + 1) as f64
                    > self.data.load_factor() * count as f64;
                if !over_loaded {
                    if let Some(slot) = self.find(key) {
                        return Ok(InsertOutcome::Exists(slot));
                    }
                    let h = hash % count;
                    let og = self.lock_cell(h, Cell::Owner, true);
                    if let Some(slot) = self.scan_neighborhood(h, key) {
                        drop(og);
                        return Ok(InsertOutcome::Exists(slot));
                    }
                    match self.make_room(h, count) {
                        Ok((j, cg)) => {
                            let placed = self.place(h, j, key, init);
                            drop(cg);
                            drop(og);
                            placed?;
                            self.data.set_element_count(self.data.element_count() + 1)?;
                            return Ok(InsertOutcome::Inserted(j));
                        }
                        Err(RoomError::Map(e)) => return Err(e),
                        Err(RoomError::NeedResize) => {}
                    }
                }
            }
            // Gate and bucket locks released: grow and retry.
            self.resize()?;
        }
    }

    /// Write content into the claimed slot `j` and publish the owner bit.
    /// The caller holds `owner[h]` exclusive and `content[j]` exclusive.
    fn place(&self, h: u64, j: u64, key: &[u8], init: ValueInit<'_>) -> Result<(), MapError> {
        let target = self.data.bucket(j);
        target.key_slot().store(&self.region, self.alloc.as_ref(), key)?;
        let stored = match init {
            ValueInit::Bytes(value) => {
                target.value_slot().store(&self.region, self.alloc.as_ref(), value)
            }
            ValueInit::Uninit(len) => {
                target.value_slot().store_uninit(&self.region, self.alloc.as_ref(), len)
            }
        };
        if let Err(e) = stored {
            // Roll the key storage back; the slot stays clear.
            target.key_slot().release(&self.region, self.alloc.as_ref())?;
            return Err(e.into());
        }
        target.set_state(&self.region, super::bucket::STATE_IN_USE);
        target.persist_content(&self.region)?;

        let home = self.data.bucket(h);
        home.set_owner(&self.region, home.owner(&self.region) | 1 << (j - h));
        home.persist_owner(&self.region)?;
        Ok(())
    }

    /// Claim `j`'s content lock if the slot is clear.
    fn try_claim_clear(&self, j: u64) -> Option<CellGuard> {
        let guard = self.try_lock_cell(j, Cell::Content, true)?;
        (self.data.bucket(j).state(&self.region) == STATE_CLEAR).then_some(guard)
    }

    /// Find a free slot within `[h, h + H)`, displacing entries toward the
    /// neighborhood if the nearest free slot is farther away. Returns the
    /// slot with its content lock held.
    fn make_room(&self, h: u64, count: u64) -> Result<(u64, CellGuard), RoomError> {
        let limit = (h + NEIGHBORHOOD).min(count);
        for j in h..limit {
            if let Some(guard) = self.try_claim_clear(j) {
                return Ok((j, guard));
            }
        }

        // Linear probe beyond the neighborhood for any free slot.
        let (mut j, mut guard) = {
            let mut probe = h + NEIGHBORHOOD;
            loop {
                if probe >= count {
                    return Err(RoomError::NeedResize);
                }
                if let Some(guard) = self.try_claim_clear(probe) {
                    break (probe, guard);
                }
                probe += 1;
            }
        };

        while j - h >= NEIGHBORHOOD {
            match self.displace_toward(h, j)? {
                Some((closer, closer_guard)) => {
                    j = closer;
                    guard = closer_guard;
                }
                None => return Err(RoomError::NeedResize),
            }
        }
        Ok((j, guard))
    }

    /// Move some entry from a slot `i < j` into the free slot `j`, freeing
    /// `i`. The victim's home `h2` must satisfy `j ∈ [h2, h2 + H)`. Victim
    /// homes are scanned in ascending order and owner bits least-significant
    /// first.
    fn displace_toward(&self, h: u64, j: u64) -> Result<Option<(u64, CellGuard)>, RoomError> {
        let start = (j + 1).saturating_sub(NEIGHBORHOOD).max(h + 1);
        for h2 in start..=j {
            let Some(og2) = self.try_lock_cell(h2, Cell::Owner, true) else {
                continue;
            };
            let owner = self.data.bucket(h2).owner(&self.region);
            for bit in OwnerBits(owner) {
                let i = h2 + bit as u64;
                if i >= j {
                    break;
                }
                let Some(ig) = self.try_lock_cell(i, Cell::Content, true) else {
                    continue;
                };
                let record = self.journal.append_displace(h2, h2, i, j)?;
                atomic::displace_content(&self.region, &self.data, h2, h2, i, j)?;
                self.journal.retire(record)?;
                drop(og2);
                return Ok(Some((i, ig)));
            }
        }
        Ok(None)
    }

    /// Erase `key`. Returns whether an entry was removed.
    pub fn erase(&self, key: &[u8]) -> Result<bool, MapError> {
        let hash = hash_bytes(key);
        'retry: loop {
            let _gate = self.gate.read();
            let target = self.data.bucket_count_of(self.data.segment_count_target());
            let actual = self.data.bucket_count_of(self.data.segment_count());
            for (pass, count) in [target, actual].into_iter().enumerate() {
                if count == 0 || (pass == 1 && count == target) {
                    continue;
                }
                let h = hash % count;
                let og = self.lock_cell(h, Cell::Owner, true);
                let home = self.data.bucket(h);
                let bits = home.owner(&self.region);
                for bit in OwnerBits(bits) {
                    let j = h + bit as u64;
                    let b = self.data.bucket(j);
                    if !(b.in_use(&self.region) && b.key_slot().equals(&self.region, key)) {
                        continue;
                    }
                    let Some(cg) = self.try_lock_cell(j, Cell::Content, true) else {
                        drop(og);
                        std::thread::yield_now();
                        continue 'retry;
                    };
                    b.key_slot().release(&self.region, self.alloc.as_ref())?;
                    b.value_slot().release(&self.region, self.alloc.as_ref())?;
                    b.set_state(&self.region, STATE_CLEAR);
                    b.persist_content(&self.region)?;
                    home.set_owner(&self.region, bits & !(1 << bit));
                    home.persist_owner(&self.region)?;
                    drop(cg);
                    drop(og);
                    self.data.set_element_count(self.data.element_count() - 1)?;
                    return Ok(true);
                }
                drop(og);
            }
            return Ok(false);
        }
    }

    /// Visit every live entry in bucket-directory order.
    ///
    /// The callback runs under the entry's shared content lock; iteration
    /// order is not stable across resizes.
    pub fn for_each<F: FnMut(&[u8], &[u8])>(&self, mut f: F) {
        let count = self.data.bucket_count_of(self.data.segment_count_target());
        for j in 0..count {
            let _cg = self.lock_cell(j, Cell::Content, false);
            let b = self.data.bucket(j);
            if b.in_use(&self.region) {
                f(
                    b.key_slot().bytes(&self.region),
                    b.value_slot().bytes(&self.region),
                );
            }
        }
    }

    /// Grow the table by one segment and migrate in place.
    fn resize(&self) -> Result<(), MapError> {
        let _gate = self.gate.write();
        if self.data.segment_count_target() > self.data.segment_count() {
            return self.finish_migration();
        }
        let actual = self.data.segment_count();
        if actual as usize >= layout::SEGMENT_DIR_CAPACITY {
            return Err(MapError::TableFull);
        }
        let new_buckets = self.data.segment_size(actual);
        let bytes = new_buckets * BUCKET_SIZE;
        let seg = self.alloc.allocate(bytes, 64).map_err(MapError::ResizeFailed)?;
        self.region.zero(seg, bytes as usize);
        self.region.persist(seg, bytes as usize)?;
        self.data.set_segment_offset(actual, seg)?;
        self.locks.write().push(new_lock_segment(new_buckets));
        self.data.set_resize_cursor(0)?;
        self.data.set_segment_count_target(actual + 1)?;
        debug!(
            segments = actual + 1,
            buckets = self.data.bucket_count_of(actual + 1),
            "growing table"
        );
        self.finish_migration()
    }

    /// Advance the migration cursor over every pre-resize bucket, rehashing
    /// entries whose home moved into the new segment.
    fn finish_migration(&self) -> Result<(), MapError> {
        let actual = self.data.segment_count();
        let target = self.data.segment_count_target();
        debug_assert_eq!(target, actual + 1);
        let old_count = self.data.bucket_count_of(actual);
        let new_count = self.data.bucket_count_of(target);
        for h in self.data.resize_cursor()..old_count {
            self.data.set_resize_cursor(h)?;
            self.migrate_bucket(h, new_count)?;
        }
        self.data.set_segment_count(target)?;
        self.data.set_resize_cursor(0)?;
        Ok(())
    }

    /// Rehash every entry owned by `h` under the new bucket count.
    fn migrate_bucket(&self, h: u64, new_count: u64) -> Result<(), MapError> {
        let og = self.lock_cell(h, Cell::Owner, true);
        let home = self.data.bucket(h);
        let mut stays = 0u64;
        'rescan: loop {
            let pending = home.owner(&self.region) & !stays;
            for bit in OwnerBits(pending) {
                let src = h + bit as u64;
                let b = self.data.bucket(src);
                if !b.in_use(&self.region) {
                    warn!(h, src, "owner bit references a clear slot; dropping it");
                    home.set_owner(&self.region, home.owner(&self.region) & !(1 << bit));
                    home.persist_owner(&self.region)?;
                    continue 'rescan;
                }
                let hash = hash_bytes(b.key_slot().bytes(&self.region));
                let new_home = hash % new_count;
                if new_home == h {
                    stays |= 1 << bit;
                    continue;
                }
                let og2 = self.lock_cell(new_home, Cell::Owner, true);
                let Some(sg) = self.try_lock_cell(src, Cell::Content, true) else {
                    // A store-level lock pins this entry; wait it out.
                    drop(og2);
                    std::thread::yield_now();
                    continue 'rescan;
                };
                let (dst, dg) = match self.make_room(new_home, new_count) {
                    Ok(found) => found,
                    Err(RoomError::NeedResize) => return Err(MapError::TableFull),
                    Err(RoomError::Map(e)) => return Err(e),
                };
                let record = self.journal.append_displace(h, new_home, src, dst)?;
                atomic::displace_content(&self.region, &self.data, h, new_home, src, dst)?;
                self.journal.retire(record)?;
                drop(dg);
                drop(sg);
                drop(og2);
                continue 'rescan;
            }
            break;
        }
        drop(og);
        Ok(())
    }

    /// Verify the structural invariants: every owner bit references an
    /// in-use slot inside the neighborhood that hashes home, every in-use
    /// slot is referenced exactly once, and the live count matches.
    ///
    /// Diagnostic surface; not intended for the hot path.
    pub fn check_consistency(&self) -> Result<(), String> {
        use std::collections::HashMap;
        let count = self.data.bucket_count_of(self.data.segment_count_target());
        let mut owned: HashMap<u64, u64> = HashMap::new();
        for h in 0..count {
            let home = self.data.bucket(h);
            for bit in OwnerBits(home.owner(&self.region)) {
                let j = h + bit as u64;
                if j >= count {
                    return Err(format!("owner {h} references slot {j} beyond {count}"));
                }
                let b = self.data.bucket(j);
                if !b.in_use(&self.region) {
                    return Err(format!("owner {h} references clear slot {j}"));
                }
                let hash = hash_bytes(b.key_slot().bytes(&self.region));
                if hash % count != h {
                    return Err(format!(
                        "slot {j} hashes to bucket {} but is owned by {h}",
                        hash % count
                    ));
                }
                if owned.insert(j, h).is_some() {
                    return Err(format!("slot {j} is referenced by two owners"));
                }
            }
        }
        let mut live = 0u64;
        for j in 0..count {
            if self.data.bucket(j).in_use(&self.region) {
                live += 1;
                if !owned.contains_key(&j) {
                    return Err(format!("slot {j} is in use but unreferenced"));
                }
            }
        }
        if live != self.data.element_count() {
            return Err(format!(
                "live entries {live} disagree with element count {}",
                self.data.element_count()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{create_allocator, AllocatorVariant};

    struct Fixture {
        _dir: tempfile::TempDir,
        map: HopMap,
    }

    fn setup(base_buckets: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let region =
            Arc::new(MappedRegion::create(&dir.path().join("pool"), 8 << 20).unwrap());
        let alloc: Arc<dyn RegionAllocator> = Arc::from(
            create_allocator(Arc::clone(&region), AllocatorVariant::ExtentTree).unwrap(),
        );
        let journal = Arc::new(Journal::new(
            Arc::clone(&region),
            Arc::clone(&alloc),
            PersistData::new(Arc::clone(&region)),
        ));
        let map =
            HopMap::create(region, alloc, journal, base_buckets, 0.875).unwrap();
        Fixture { _dir: dir, map }
    }

    #[test]
    fn test_insert_find_erase() {
        let fx = setup(128);
        assert!(matches!(
            fx.map.insert(b"alpha", b"1").unwrap(),
            InsertOutcome::Inserted(_)
        ));
        assert!(matches!(
            fx.map.insert(b"beta", b"2").unwrap(),
            InsertOutcome::Inserted(_)
        ));
        assert_eq!(fx.map.element_count(), 2);

        let slot = fx.map.find(b"alpha").unwrap();
        assert_eq!(fx.map.bucket(slot).value_slot().bytes(&fx.map.region), b"1");
        assert!(fx.map.find(b"gamma").is_none());

        assert!(fx.map.erase(b"alpha").unwrap());
        assert!(!fx.map.erase(b"alpha").unwrap());
        assert!(fx.map.find(b"alpha").is_none());
        assert_eq!(fx.map.element_count(), 1);
        fx.map.check_consistency().unwrap();
    }

    #[test]
    fn test_duplicate_insert_reports_slot() {
        let fx = setup(128);
        fx.map.insert(b"key", b"old").unwrap();
        match fx.map.insert(b"key", b"new").unwrap() {
            InsertOutcome::Exists(slot) => {
                assert_eq!(fx.map.bucket(slot).value_slot().bytes(&fx.map.region), b"old");
            }
            InsertOutcome::Inserted(_) => panic!("expected duplicate"),
        }
        assert_eq!(fx.map.element_count(), 1);
    }

    #[test]
    fn test_growth_keeps_entries() {
        let fx = setup(128);
        for i in 0..1024u32 {
            let key = format!("key-{i}");
            fx.map.insert(key.as_bytes(), format!("{i}").as_bytes()).unwrap();
        }
        assert_eq!(fx.map.element_count(), 1024);
        assert!(fx.map.bucket_count() > 128);
        for i in 0..1024u32 {
            let key = format!("key-{i}");
            let slot = fx.map.find(key.as_bytes()).unwrap_or_else(|| {
                panic!("{key} lost after growth");
            });
            assert_eq!(
                fx.map.bucket(slot).value_slot().bytes(&fx.map.region),
                format!("{i}").as_bytes()
            );
        }
        fx.map.check_consistency().unwrap();
    }

    #[test]
    fn test_for_each_sees_all_entries() {
        let fx = setup(128);
        for i in 0..20u32 {
            fx.map.insert(format!("k{i}").as_bytes(), b"v").unwrap();
        }
        let mut seen = 0;
        fx.map.for_each(|key, value| {
            assert!(key.starts_with(b"k"));
            assert_eq!(value, b"v");
            seen += 1;
        });
        assert_eq!(seen, 20);
    }

    #[test]
    fn test_reopen_preserves_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool");
        {
            let region = Arc::new(MappedRegion::create(&path, 8 << 20).unwrap());
            let alloc: Arc<dyn RegionAllocator> = Arc::from(
                create_allocator(Arc::clone(&region), AllocatorVariant::ExtentTree).unwrap(),
            );
            let journal = Arc::new(Journal::new(
                Arc::clone(&region),
                Arc::clone(&alloc),
                PersistData::new(Arc::clone(&region)),
            ));
            let map = HopMap::create(region, alloc, journal, 128, 0.875).unwrap();
            for i in 0..300u32 {
                map.insert(format!("key-{i}").as_bytes(), format!("val-{i}").as_bytes())
                    .unwrap();
            }
        }
        let region = Arc::new(MappedRegion::open(&path).unwrap());
        let alloc: Arc<dyn RegionAllocator> =
            Arc::from(crate::alloc::open_allocator(Arc::clone(&region)).unwrap());
        let journal = Arc::new(Journal::new(
            Arc::clone(&region),
            Arc::clone(&alloc),
            PersistData::new(Arc::clone(&region)),
        ));
        let map = HopMap::open(region, alloc, journal).unwrap();
        assert_eq!(map.element_count(), 300);
        for i in 0..300u32 {
            let key = format!("key-{i}");
            let slot = map.find(key.as_bytes()).expect("entry survives reopen");
            assert_eq!(
                map.bucket(slot).value_slot().bytes(&map.region),
                format!("val-{i}").as_bytes()
            );
        }
        map.check_consistency().unwrap();
    }

    #[test]
    fn test_concurrent_inserts() {
        use std::thread;
        let fx = setup(256);
        let map = &fx.map;
        thread::scope(|scope| {
            for t in 0..4 {
                scope.spawn(move || {
                    for i in 0..200u32 {
                        map.insert(format!("t{t}-{i}").as_bytes(), b"v").unwrap();
                    }
                });
            }
        });
        assert_eq!(fx.map.element_count(), 800);
        for t in 0..4 {
            for i in 0..200u32 {
                assert!(fx.map.find(format!("t{t}-{i}").as_bytes()).is_some());
            }
        }
        fx.map.check_consistency().unwrap();
    }
}
