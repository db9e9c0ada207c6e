//! Persist-data root and segment directory.
//!
//! The table is a sequence of bucket segments whose sizes grow
//! geometrically: segment 0 holds the configured base count and every later
//! segment equals the total bucket count before it was added, so each
//! resize doubles the table. Segments are chunks from the region allocator
//! and never move once allocated; the directory stores their region
//! offsets.

use std::sync::Arc;

use super::bucket::{BucketRef, BUCKET_SIZE};
use crate::region::{layout, MappedRegion, RegionError};

const OFF_SEGMENT_COUNT: u64 = layout::OFF_PERSIST_ROOT;
const OFF_SEGMENT_TARGET: u64 = layout::OFF_PERSIST_ROOT + 8;
const OFF_RESIZE_CURSOR: u64 = layout::OFF_PERSIST_ROOT + 16;
const OFF_ELEMENT_COUNT: u64 = layout::OFF_PERSIST_ROOT + 24;
const OFF_LOAD_FACTOR: u64 = layout::OFF_PERSIST_ROOT + 32;
const OFF_JOURNAL_HEAD: u64 = layout::OFF_PERSIST_ROOT + 40;
const OFF_BASE_BUCKETS: u64 = layout::OFF_PERSIST_ROOT + 48;

const PERSIST_ROOT_SIZE: usize = 56;

const _: () =
    assert!(layout::OFF_PERSIST_ROOT + PERSIST_ROOT_SIZE as u64 <= layout::OFF_SEGMENT_DIR);

/// View over the persisted table root.
#[derive(Clone)]
pub struct PersistData {
    region: Arc<MappedRegion>,
}

impl PersistData {
    /// Attach to the persist root of an opened region.
    pub fn new(region: Arc<MappedRegion>) -> Self {
        Self { region }
    }

    /// Initialize the root for a fresh pool: no segments yet, counters at
    /// zero, the configured base size and load factor recorded.
    pub fn create(
        region: Arc<MappedRegion>,
        base_buckets: u64,
        load_factor: f64,
    ) -> Result<Self, RegionError> {
        debug_assert!(base_buckets.is_power_of_two());
        region.write_u64(OFF_SEGMENT_COUNT, 0);
        region.write_u64(OFF_SEGMENT_TARGET, 0);
        region.write_u64(OFF_RESIZE_CURSOR, 0);
        region.write_u64(OFF_ELEMENT_COUNT, 0);
        region.write_u64(OFF_LOAD_FACTOR, load_factor.to_bits());
        region.write_u64(OFF_JOURNAL_HEAD, 0);
        region.write_u64(OFF_BASE_BUCKETS, base_buckets);
        for slot in 0..layout::SEGMENT_DIR_CAPACITY {
            region.write_u64(layout::OFF_SEGMENT_DIR + slot as u64 * 8, 0);
        }
        region.persist(
            layout::OFF_PERSIST_ROOT,
            (layout::OFF_SEGMENT_DIR - layout::OFF_PERSIST_ROOT) as usize
                + layout::SEGMENT_DIR_CAPACITY * 8,
        )?;
        Ok(Self { region })
    }

    /// Number of fully migrated segments.
    pub fn segment_count(&self) -> u64 {
        self.region.read_u64(OFF_SEGMENT_COUNT)
    }

    /// Publish a new migrated segment count.
    pub fn set_segment_count(&self, count: u64) -> Result<(), RegionError> {
        self.region.write_u64(OFF_SEGMENT_COUNT, count);
        self.region.persist(OFF_SEGMENT_COUNT, 8)
    }

    /// Segment count including an in-progress resize.
    pub fn segment_count_target(&self) -> u64 {
        self.region.read_u64(OFF_SEGMENT_TARGET)
    }

    /// Publish the resize target.
    pub fn set_segment_count_target(&self, count: u64) -> Result<(), RegionError> {
        self.region.write_u64(OFF_SEGMENT_TARGET, count);
        self.region.persist(OFF_SEGMENT_TARGET, 8)
    }

    /// Bucket cursor of an in-progress resize migration.
    pub fn resize_cursor(&self) -> u64 {
        self.region.read_u64(OFF_RESIZE_CURSOR)
    }

    /// Advance the migration cursor.
    pub fn set_resize_cursor(&self, cursor: u64) -> Result<(), RegionError> {
        self.region.write_u64(OFF_RESIZE_CURSOR, cursor);
        self.region.persist(OFF_RESIZE_CURSOR, 8)
    }

    /// Number of live entries.
    pub fn element_count(&self) -> u64 {
        self.region.read_u64(OFF_ELEMENT_COUNT)
    }

    /// Persist a new live-entry count.
    pub fn set_element_count(&self, count: u64) -> Result<(), RegionError> {
        self.region.write_u64(OFF_ELEMENT_COUNT, count);
        self.region.persist(OFF_ELEMENT_COUNT, 8)
    }

    /// Configured load-factor threshold.
    pub fn load_factor(&self) -> f64 {
        f64::from_bits(self.region.read_u64(OFF_LOAD_FACTOR))
    }

    /// Offset of the newest outstanding journal record, 0 when none.
    pub fn journal_head(&self) -> u64 {
        self.region.read_u64(OFF_JOURNAL_HEAD)
    }

    /// Publish the journal list head.
    pub fn set_journal_head(&self, offset: u64) -> Result<(), RegionError> {
        self.region.write_u64(OFF_JOURNAL_HEAD, offset);
        self.region.persist(OFF_JOURNAL_HEAD, 8)
    }

    /// Configured size of segment 0.
    pub fn base_buckets(&self) -> u64 {
        self.region.read_u64(OFF_BASE_BUCKETS)
    }

    /// Region offset of segment `index`.
    pub fn segment_offset(&self, index: u64) -> u64 {
        debug_assert!((index as usize) < layout::SEGMENT_DIR_CAPACITY);
        self.region.read_u64(layout::OFF_SEGMENT_DIR + index * 8)
    }

    /// Publish a directory entry for a newly allocated segment.
    pub fn set_segment_offset(&self, index: u64, offset: u64) -> Result<(), RegionError> {
        debug_assert!((index as usize) < layout::SEGMENT_DIR_CAPACITY);
        self.region
            .write_u64(layout::OFF_SEGMENT_DIR + index * 8, offset);
        self.region.persist(layout::OFF_SEGMENT_DIR + index * 8, 8)
    }

    /// Number of buckets in segment `index`.
    pub fn segment_size(&self, index: u64) -> u64 {
        let base = self.base_buckets();
        if index == 0 { base } else { base << (index - 1) }
    }

    /// Total bucket count over the first `segments` segments.
    pub fn bucket_count_of(&self, segments: u64) -> u64 {
        if segments == 0 {
            0
        } else {
            self.base_buckets() << (segments - 1)
        }
    }

    /// Total bucket count over the migrated segments.
    pub fn bucket_count(&self) -> u64 {
        self.bucket_count_of(self.segment_count())
    }

    /// Locate bucket `index`: `(segment, slot within segment)`.
    pub fn locate(&self, index: u64) -> (u64, u64) {
        let base = self.base_buckets();
        if index < base {
            (0, index)
        } else {
            let segment = (index / base).ilog2() as u64 + 1;
            let start = base << (segment - 1);
            (segment, index - start)
        }
    }

    /// Bucket record for a table-wide bucket index.
    pub fn bucket(&self, index: u64) -> BucketRef {
        let (segment, within) = self.locate(index);
        BucketRef(self.segment_offset(segment) + within * BUCKET_SIZE)
    }
}

impl std::fmt::Debug for PersistData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistData")
            .field("segment_count", &self.segment_count())
            .field("segment_count_target", &self.segment_count_target())
            .field("element_count", &self.element_count())
            .field("base_buckets", &self.base_buckets())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, PersistData) {
        let dir = tempfile::tempdir().unwrap();
        let region =
            Arc::new(MappedRegion::create(&dir.path().join("pool"), 1 << 20).unwrap());
        let data = PersistData::create(region, 128, 0.875).unwrap();
        (dir, data)
    }

    #[test]
    fn test_geometry_totals() {
        let (_dir, data) = setup();
        assert_eq!(data.bucket_count_of(0), 0);
        assert_eq!(data.bucket_count_of(1), 128);
        assert_eq!(data.bucket_count_of(2), 256);
        assert_eq!(data.bucket_count_of(3), 512);
        assert_eq!(data.segment_size(0), 128);
        assert_eq!(data.segment_size(1), 128);
        assert_eq!(data.segment_size(2), 256);
        assert_eq!(data.segment_size(3), 512);
    }

    #[test]
    fn test_locate() {
        let (_dir, data) = setup();
        assert_eq!(data.locate(0), (0, 0));
        assert_eq!(data.locate(127), (0, 127));
        assert_eq!(data.locate(128), (1, 0));
        assert_eq!(data.locate(255), (1, 127));
        assert_eq!(data.locate(256), (2, 0));
        assert_eq!(data.locate(511), (2, 255));
        assert_eq!(data.locate(512), (3, 0));
    }

    #[test]
    fn test_counters_round_trip() {
        let (_dir, data) = setup();
        data.set_segment_count(1).unwrap();
        data.set_segment_count_target(2).unwrap();
        data.set_resize_cursor(42).unwrap();
        data.set_element_count(7).unwrap();
        data.set_journal_head(0x2000).unwrap();
        assert_eq!(data.segment_count(), 1);
        assert_eq!(data.segment_count_target(), 2);
        assert_eq!(data.resize_cursor(), 42);
        assert_eq!(data.element_count(), 7);
        assert_eq!(data.journal_head(), 0x2000);
        assert_eq!(data.load_factor(), 0.875);
        assert_eq!(data.base_buckets(), 128);
    }
}
