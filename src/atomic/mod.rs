//! Atomic controller: crash-consistent multi-step value updates.
//!
//! Any sequence of in-place mutations is journaled as a control record
//! carved from the region allocator before the first user byte changes.
//! Records are linked through a persisted list head in the table root, so
//! recovery on pool open can find every outstanding record, replay or
//! complete it, and release it.
//!
//! Record layout (little-endian, at an allocator chunk):
//!
//! ```text
//! +0   tag     u64  record magic | kind
//! +8   phase   u64  1 = prepared, 2 = applied
//! +16  next    u64  offset of the next outstanding record, 0 = end
//! +24  size    u64  total record size in bytes
//! +32  slot    u64  table-wide bucket index
//! +40  payload
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::alloc::{AllocError, RegionAllocator};
use crate::region::{MappedRegion, RegionError};
use crate::table::bucket::STATE_IN_USE;
use crate::table::pstr;
use crate::table::segment::PersistData;

/// High bits shared by every record tag.
const RECORD_MAGIC: u64 = 0x4A52_4E4C_0000_0000;

/// Record kind: operation list for an atomic update.
const KIND_UPDATE: u64 = 1;
/// Record kind: whole-value replacement.
const KIND_REPLACE: u64 = 2;
/// Record kind: hop-scotch displacement.
const KIND_DISPLACE: u64 = 3;

/// Phase: record persisted, user bytes may be partially written.
const PHASE_PREPARED: u64 = 1;
/// Phase: all user bytes written and fenced.
const PHASE_APPLIED: u64 = 2;

const OFF_TAG: u64 = 0;
const OFF_PHASE: u64 = 8;
const OFF_NEXT: u64 = 16;
const OFF_SIZE: u64 = 24;
const OFF_SLOT: u64 = 32;
const OFF_PAYLOAD: u64 = 40;

const OP_WRITE: u64 = 1;
const OP_ZERO: u64 = 2;
const OP_PUT_U64: u64 = 3;
const OP_CAS_U64: u64 = 4;

/// Errors from journaling and recovery.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// Allocation failure while carving a control record.
    #[error(transparent)]
    Alloc(#[from] AllocError),
    /// Fence or mapping failure.
    #[error(transparent)]
    Region(#[from] RegionError),
    /// An operation reaches outside the value bytes.
    #[error("operation range {offset}+{len} exceeds value of {value_len} bytes")]
    BadOffset {
        /// Start of the offending range.
        offset: u64,
        /// Length of the offending range.
        len: u64,
        /// Length of the target value.
        value_len: u64,
    },
    /// A persisted record fails structural validation.
    #[error("corrupt journal record at offset {0}")]
    Corrupt(u64),
}

/// One journaled mutation step, replay-idempotent.
///
/// `INCREMENT_UINT64` requests are resolved to their computed result before
/// journaling, so they appear here as [`JournalOp::PutU64`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalOp {
    /// Copy bytes into the value.
    Write {
        /// Byte offset within the value.
        offset: u64,
        /// Bytes to write.
        bytes: Vec<u8>,
    },
    /// Zero a byte range of the value.
    Zero {
        /// Byte offset within the value.
        offset: u64,
        /// Number of bytes.
        len: u64,
    },
    /// Store a u64 (a resolved increment).
    PutU64 {
        /// Byte offset within the value.
        offset: u64,
        /// Value to store.
        value: u64,
    },
    /// Conditional u64 store.
    CasU64 {
        /// Byte offset within the value.
        offset: u64,
        /// Expected current value.
        expected: u64,
        /// Replacement value.
        new: u64,
    },
}

impl JournalOp {
    fn extent(&self) -> (u64, u64) {
        match self {
            JournalOp::Write { offset, bytes } => (*offset, bytes.len() as u64),
            JournalOp::Zero { offset, len } => (*offset, *len),
            JournalOp::PutU64 { offset, .. } | JournalOp::CasU64 { offset, .. } => (*offset, 8),
        }
    }
}

/// Serialize an op list into a journal payload.
fn serialize_ops(ops: &[JournalOp]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(ops.len() as u64).to_le_bytes());
    for op in ops {
        match op {
            JournalOp::Write { offset, bytes } => {
                out.extend_from_slice(&OP_WRITE.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
                out.extend_from_slice(&0u64.to_le_bytes());
                out.extend_from_slice(bytes);
                while out.len() % 8 != 0 {
                    out.push(0);
                }
            }
            JournalOp::Zero { offset, len } => {
                out.extend_from_slice(&OP_ZERO.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&len.to_le_bytes());
                out.extend_from_slice(&0u64.to_le_bytes());
            }
            JournalOp::PutU64 { offset, value } => {
                out.extend_from_slice(&OP_PUT_U64.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&value.to_le_bytes());
                out.extend_from_slice(&0u64.to_le_bytes());
            }
            JournalOp::CasU64 { offset, expected, new } => {
                out.extend_from_slice(&OP_CAS_U64.to_le_bytes());
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&expected.to_le_bytes());
                out.extend_from_slice(&new.to_le_bytes());
            }
        }
    }
    out
}

fn read_u64_at(payload: &[u8], pos: usize) -> Option<u64> {
    payload
        .get(pos..pos + 8)
        .map(|b| u64::from_le_bytes(b.try_into().expect("8 bytes")))
}

/// Parse a journal payload back into an op list.
fn parse_ops(payload: &[u8], record_offset: u64) -> Result<Vec<JournalOp>, JournalError> {
    let corrupt = || JournalError::Corrupt(record_offset);
    let count = read_u64_at(payload, 0).ok_or_else(corrupt)?;
    let mut pos = 8;
    let mut ops = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let kind = read_u64_at(payload, pos).ok_or_else(corrupt)?;
        let offset = read_u64_at(payload, pos + 8).ok_or_else(corrupt)?;
        let a = read_u64_at(payload, pos + 16).ok_or_else(corrupt)?;
        let b = read_u64_at(payload, pos + 24).ok_or_else(corrupt)?;
        pos += 32;
        let op = match kind {
            OP_WRITE => {
                let len = a as usize;
                let bytes = payload.get(pos..pos + len).ok_or_else(corrupt)?.to_vec();
                pos += len.next_multiple_of(8);
                JournalOp::Write { offset, bytes }
            }
            OP_ZERO => JournalOp::Zero { offset, len: a },
            OP_PUT_U64 => JournalOp::PutU64 { offset, value: a },
            OP_CAS_U64 => JournalOp::CasU64 { offset, expected: a, new: b },
            _ => return Err(corrupt()),
        };
        ops.push(op);
    }
    Ok(ops)
}

/// Validate every op against the value length.
pub fn check_ops(ops: &[JournalOp], value_len: u64) -> Result<(), JournalError> {
    for op in ops {
        let (offset, len) = op.extent();
        if offset.checked_add(len).is_none_or(|end| end > value_len) {
            return Err(JournalError::BadOffset { offset, len, value_len });
        }
    }
    Ok(())
}

/// Apply ops to the value bytes at `value_off`, fencing after each op.
///
/// Replay-safe: writes and u64 stores are absolute, and CAS treats a
/// current value equal to `new` as already applied.
pub fn apply_ops(
    region: &MappedRegion,
    value_off: u64,
    value_len: u64,
    ops: &[JournalOp],
) -> Result<(), JournalError> {
    check_ops(ops, value_len)?;
    for op in ops {
        match op {
            JournalOp::Write { offset, bytes } => {
                region.write_bytes(value_off + offset, bytes);
                region.persist(value_off + offset, bytes.len())?;
            }
            JournalOp::Zero { offset, len } => {
                region.zero(value_off + offset, *len as usize);
                region.persist(value_off + offset, *len as usize)?;
            }
            JournalOp::PutU64 { offset, value } => {
                region.write_u64(value_off + offset, *value);
                region.persist(value_off + offset, 8)?;
            }
            JournalOp::CasU64 { offset, expected, new } => {
                let current = region.read_u64(value_off + offset);
                if current == *expected {
                    region.write_u64(value_off + offset, *new);
                    region.persist(value_off + offset, 8)?;
                }
                // current == new means a replay of an applied op; any other
                // value fails the comparison and the op is a no-op.
            }
        }
    }
    Ok(())
}

/// Handle to an outstanding control record.
#[derive(Debug, Clone, Copy)]
pub struct RecordHandle {
    offset: u64,
    size: u64,
}

/// The journal: appends, completes and retires control records.
///
/// Appends and retires serialize on an internal mutex; the list head lives
/// in the persist root so recovery can walk it.
pub struct Journal {
    region: Arc<MappedRegion>,
    alloc: Arc<dyn RegionAllocator>,
    data: PersistData,
    list: Mutex<()>,
}

impl Journal {
    /// Attach a journal to an open pool.
    pub fn new(
        region: Arc<MappedRegion>,
        alloc: Arc<dyn RegionAllocator>,
        data: PersistData,
    ) -> Self {
        Self { region, alloc, data, list: Mutex::new(()) }
    }

    fn append(&self, kind: u64, slot: u64, payload: &[u8]) -> Result<RecordHandle, JournalError> {
        let size = OFF_PAYLOAD + payload.len() as u64;
        let offset = self.alloc.allocate(size, 8)?;

        let _guard = self.list.lock();
        let head = self.data.journal_head();
        self.region.write_u64(offset + OFF_TAG, RECORD_MAGIC | kind);
        self.region.write_u64(offset + OFF_PHASE, PHASE_PREPARED);
        self.region.write_u64(offset + OFF_NEXT, head);
        self.region.write_u64(offset + OFF_SIZE, size);
        self.region.write_u64(offset + OFF_SLOT, slot);
        self.region.write_bytes(offset + OFF_PAYLOAD, payload);
        self.region.persist(offset, size as usize)?;
        self.data.set_journal_head(offset)?;
        Ok(RecordHandle { offset, size })
    }

    /// Journal an op list against the value in bucket `slot`.
    pub fn append_update(&self, slot: u64, ops: &[JournalOp]) -> Result<RecordHandle, JournalError> {
        self.append(KIND_UPDATE, slot, &serialize_ops(ops))
    }

    /// Journal a whole-value replacement for bucket `slot`.
    pub fn append_replace(
        &self,
        slot: u64,
        old_image: &[u8; pstr::SLOT_SIZE],
        new_image: &[u8; pstr::SLOT_SIZE],
    ) -> Result<RecordHandle, JournalError> {
        let mut payload = Vec::with_capacity(pstr::SLOT_SIZE * 2);
        payload.extend_from_slice(old_image);
        payload.extend_from_slice(new_image);
        self.append(KIND_REPLACE, slot, &payload)
    }

    /// Journal a content move from `src` (owned by `old_home`) to `dst`
    /// (owned by `new_home` afterwards).
    ///
    /// An in-neighborhood displacement has `old_home == new_home`; a resize
    /// migration moves ownership to the rehashed home.
    pub fn append_displace(
        &self,
        old_home: u64,
        new_home: u64,
        src: u64,
        dst: u64,
    ) -> Result<RecordHandle, JournalError> {
        let mut payload = Vec::with_capacity(32);
        payload.extend_from_slice(&old_home.to_le_bytes());
        payload.extend_from_slice(&new_home.to_le_bytes());
        payload.extend_from_slice(&src.to_le_bytes());
        payload.extend_from_slice(&dst.to_le_bytes());
        self.append(KIND_DISPLACE, src, &payload)
    }

    /// Mark every user byte of a record as written and fenced.
    pub fn set_applied(&self, record: RecordHandle) -> Result<(), JournalError> {
        self.region.write_u64(record.offset + OFF_PHASE, PHASE_APPLIED);
        self.region.persist(record.offset + OFF_PHASE, 8)?;
        Ok(())
    }

    /// Retire a record: unlink it from the journal list, then release its
    /// chunk. A crash between the two leaks the chunk but never corrupts
    /// the list.
    pub fn retire(&self, record: RecordHandle) -> Result<(), JournalError> {
        let _guard = self.list.lock();
        let next = self.region.read_u64(record.offset + OFF_NEXT);
        let head = self.data.journal_head();
        if head == record.offset {
            self.data.set_journal_head(next)?;
        } else {
            let mut cursor = head;
            while cursor != 0 {
                let link = self.region.read_u64(cursor + OFF_NEXT);
                if link == record.offset {
                    self.region.write_u64(cursor + OFF_NEXT, next);
                    self.region.persist(cursor + OFF_NEXT, 8)?;
                    break;
                }
                cursor = link;
            }
        }
        self.alloc.deallocate(record.offset, record.size)?;
        Ok(())
    }

    /// Offsets of every outstanding record, newest first.
    pub fn outstanding(&self) -> Vec<u64> {
        let _guard = self.list.lock();
        let mut records = Vec::new();
        let mut cursor = self.data.journal_head();
        while cursor != 0 && records.len() < 1 << 20 {
            records.push(cursor);
            cursor = self.region.read_u64(cursor + OFF_NEXT);
        }
        records
    }
}

/// Replay every outstanding control record after a crash.
///
/// Runs on pool open before the table is used. `prepared` updates are
/// re-applied (ops are replay-idempotent), `applied` records are simply
/// released, replacements are republished, and displacements are completed
/// or discarded depending on which owner bit survived.
pub fn recover(journal: &Journal) -> Result<(), JournalError> {
    let records = journal.outstanding();
    if records.is_empty() {
        return Ok(());
    }
    debug!(count = records.len(), "replaying outstanding journal records");

    for offset in records {
        let region = &journal.region;
        let tag = region.read_u64(offset + OFF_TAG);
        if tag & !0xFF != RECORD_MAGIC {
            return Err(JournalError::Corrupt(offset));
        }
        let phase = region.read_u64(offset + OFF_PHASE);
        let size = region.read_u64(offset + OFF_SIZE);
        let slot = region.read_u64(offset + OFF_SLOT);
        let handle = RecordHandle { offset, size };
        let payload = region.slice(offset + OFF_PAYLOAD, (size - OFF_PAYLOAD) as usize).to_vec();

        match tag & 0xFF {
            KIND_UPDATE => {
                if phase == PHASE_PREPARED {
                    let ops = parse_ops(&payload, offset)?;
                    let bucket = journal.data.bucket(slot);
                    if bucket.in_use(region) {
                        let value = bucket.value_slot();
                        apply_ops(
                            region,
                            value.data_offset(region),
                            value.len(region),
                            &ops,
                        )?;
                    } else {
                        warn!(slot, "update record targets a cleared slot");
                    }
                    journal.set_applied(handle)?;
                }
                journal.retire(handle)?;
            }
            KIND_REPLACE => {
                let old_image: [u8; pstr::SLOT_SIZE] =
                    payload[..pstr::SLOT_SIZE].try_into().expect("old image");
                let new_image: [u8; pstr::SLOT_SIZE] = payload
                    [pstr::SLOT_SIZE..pstr::SLOT_SIZE * 2]
                    .try_into()
                    .expect("new image");
                let bucket = journal.data.bucket(slot);
                if phase == PHASE_PREPARED {
                    region.write_bytes(bucket.value_slot().0, &new_image);
                    bucket.persist_content(region)?;
                    journal.set_applied(handle)?;
                }
                let old = pstr::decode(&old_image);
                if let Some(chunk) = old.chunk
                    && journal.alloc.owns(chunk)
                    && !journal.alloc.contains_free(chunk)
                {
                    journal.alloc.deallocate(chunk, old.len)?;
                }
                journal.retire(handle)?;
            }
            KIND_DISPLACE => {
                let corrupt = || JournalError::Corrupt(offset);
                let old_home = read_u64_at(&payload, 0).ok_or_else(corrupt)?;
                let new_home = read_u64_at(&payload, 8).ok_or_else(corrupt)?;
                let src = read_u64_at(&payload, 16).ok_or_else(corrupt)?;
                let dst = read_u64_at(&payload, 24).ok_or_else(corrupt)?;
                recover_displacement(journal, old_home, new_home, src, dst)?;
                journal.retire(handle)?;
            }
            _ => return Err(JournalError::Corrupt(offset)),
        }
    }
    Ok(())
}

/// Move content from `src` to `dst` and transfer the owner bit from
/// `old_home` to `new_home`, fencing every step.
///
/// Idempotent against a prior partial execution as long as the `src` owner
/// bit is still set, which is exactly the replay condition recovery checks.
pub fn displace_content(
    region: &MappedRegion,
    data: &PersistData,
    old_home: u64,
    new_home: u64,
    src: u64,
    dst: u64,
) -> Result<(), JournalError> {
    let src_bucket = data.bucket(src);
    let dst_bucket = data.bucket(dst);
    let old_bucket = data.bucket(old_home);
    let new_bucket = data.bucket(new_home);
    let src_bit = 1u64 << (src - old_home);
    let dst_bit = 1u64 << (dst - new_home);

    dst_bucket.copy_content_from(region, src_bucket);
    dst_bucket.persist_content(region)?;
    if old_home == new_home {
        old_bucket.set_owner(region, (old_bucket.owner(region) & !src_bit) | dst_bit);
        old_bucket.persist_owner(region)?;
    } else {
        new_bucket.set_owner(region, new_bucket.owner(region) | dst_bit);
        new_bucket.persist_owner(region)?;
        old_bucket.set_owner(region, old_bucket.owner(region) & !src_bit);
        old_bucket.persist_owner(region)?;
    }
    src_bucket.clear_content(region);
    src_bucket.persist_content(region)?;
    Ok(())
}

fn recover_displacement(
    journal: &Journal,
    old_home: u64,
    new_home: u64,
    src: u64,
    dst: u64,
) -> Result<(), JournalError> {
    let region = &journal.region;
    let src_bucket = journal.data.bucket(src);
    let src_bit = 1u64 << (src - old_home);
    let dst_bit = 1u64 << (dst - new_home);

    if journal.data.bucket(old_home).owner(region) & src_bit != 0 {
        // The move never became fully visible: redo it to completion.
        displace_content(region, &journal.data, old_home, new_home, src, dst)?;
    } else if journal.data.bucket(new_home).owner(region) & dst_bit != 0
        && src_bucket.state(region) == STATE_IN_USE
    {
        // Owner already points at the destination; drop the stale source
        // copy left by the crash.
        src_bucket.clear_content(region);
        src_bucket.persist_content(region)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{create_allocator, AllocatorVariant};
    use crate::table::bucket::{BUCKET_SIZE, STATE_CLEAR};

    struct Fixture {
        _dir: tempfile::TempDir,
        region: Arc<MappedRegion>,
        alloc: Arc<dyn RegionAllocator>,
        data: PersistData,
    }

    fn setup() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let region =
            Arc::new(MappedRegion::create(&dir.path().join("pool"), 1 << 20).unwrap());
        let alloc: Arc<dyn RegionAllocator> =
            Arc::from(create_allocator(Arc::clone(&region), AllocatorVariant::FreeList).unwrap());
        let data = PersistData::create(Arc::clone(&region), 128, 0.875).unwrap();
        // One segment so record slots resolve to real buckets.
        let seg = alloc.allocate(128 * BUCKET_SIZE, 64).unwrap();
        region.zero(seg, (128 * BUCKET_SIZE) as usize);
        data.set_segment_offset(0, seg).unwrap();
        data.set_segment_count(1).unwrap();
        data.set_segment_count_target(1).unwrap();
        Fixture { _dir: dir, region, alloc, data }
    }

    fn journal(fx: &Fixture) -> Journal {
        Journal::new(Arc::clone(&fx.region), Arc::clone(&fx.alloc), fx.data.clone())
    }

    fn fill_slot(fx: &Fixture, slot: u64, key: &[u8], value: &[u8]) {
        let bucket = fx.data.bucket(slot);
        bucket.key_slot().store(&fx.region, fx.alloc.as_ref(), key).unwrap();
        bucket.value_slot().store(&fx.region, fx.alloc.as_ref(), value).unwrap();
        bucket.set_state(&fx.region, STATE_IN_USE);
        // The slot is its own home bucket in these tests.
        bucket.set_owner(&fx.region, bucket.owner(&fx.region) | 1);
    }

    #[test]
    fn test_ops_serialize_round_trip() {
        let ops = vec![
            JournalOp::Write { offset: 0, bytes: b"hello".to_vec() },
            JournalOp::Zero { offset: 8, len: 4 },
            JournalOp::PutU64 { offset: 16, value: 99 },
            JournalOp::CasU64 { offset: 24, expected: 1, new: 2 },
        ];
        let payload = serialize_ops(&ops);
        assert_eq!(parse_ops(&payload, 0).unwrap(), ops);
    }

    #[test]
    fn test_check_ops_rejects_out_of_range() {
        let ops = vec![JournalOp::Write { offset: 10, bytes: vec![0; 10] }];
        assert!(check_ops(&ops, 16).is_err());
        assert!(check_ops(&ops, 20).is_ok());
    }

    #[test]
    fn test_append_and_retire() {
        let fx = setup();
        let j = journal(&fx);
        assert!(j.outstanding().is_empty());

        let a = j.append_update(0, &[JournalOp::Zero { offset: 0, len: 1 }]).unwrap();
        let b = j.append_update(1, &[JournalOp::Zero { offset: 0, len: 1 }]).unwrap();
        assert_eq!(j.outstanding().len(), 2);

        // Retire out of order to exercise the predecessor unlink.
        j.retire(a).unwrap();
        assert_eq!(j.outstanding().len(), 1);
        j.retire(b).unwrap();
        assert!(j.outstanding().is_empty());
    }

    #[test]
    fn test_recover_replays_prepared_update() {
        let fx = setup();
        fill_slot(&fx, 0, b"k", b"0123456789abcdef");
        let j = journal(&fx);

        // Journal an update but "crash" before applying anything.
        let ops = vec![JournalOp::Write { offset: 0, bytes: b"HELLO".to_vec() }];
        j.append_update(0, &ops).unwrap();

        recover(&j).unwrap();
        assert!(j.outstanding().is_empty());
        let bucket = fx.data.bucket(0);
        assert_eq!(&bucket.value_slot().bytes(&fx.region)[..5], b"HELLO");
    }

    #[test]
    fn test_recover_releases_applied_update() {
        let fx = setup();
        fill_slot(&fx, 0, b"k", b"0123456789abcdef");
        let j = journal(&fx);

        let ops = vec![JournalOp::Write { offset: 0, bytes: b"XY".to_vec() }];
        let rec = j.append_update(0, &ops).unwrap();
        let value = fx.data.bucket(0).value_slot();
        apply_ops(&fx.region, value.data_offset(&fx.region), value.len(&fx.region), &ops)
            .unwrap();
        j.set_applied(rec).unwrap();

        recover(&j).unwrap();
        assert!(j.outstanding().is_empty());
        assert_eq!(&value.bytes(&fx.region)[..2], b"XY");
    }

    #[test]
    fn test_recover_completes_replace() {
        let fx = setup();
        fill_slot(&fx, 0, b"k", &vec![b'a'; 100]);
        let j = journal(&fx);
        let bucket = fx.data.bucket(0);

        let mut old_image = [0u8; pstr::SLOT_SIZE];
        fx.region.read_bytes(bucket.value_slot().0, &mut old_image);
        let old_chunk = pstr::decode(&old_image).chunk.unwrap();

        // Build the replacement value, then "crash" right after preparing.
        let new_bytes = vec![b'b'; 200];
        let chunk = fx.alloc.allocate(200, 8).unwrap();
        fx.region.write_bytes(chunk, &new_bytes);
        let new_image = pstr::encode_indirect(200, chunk);
        j.append_replace(0, &old_image, &new_image).unwrap();

        recover(&j).unwrap();
        assert!(j.outstanding().is_empty());
        assert_eq!(bucket.value_slot().bytes(&fx.region), &new_bytes[..]);
        assert!(fx.alloc.contains_free(old_chunk));
    }

    #[test]
    fn test_recover_redoes_displacement() {
        let fx = setup();
        // Entry at slot 3, owned by home bucket 3 (bit 0).
        fill_slot(&fx, 3, b"moved", b"payload");
        let j = journal(&fx);

        // Journal a displacement 3 -> 9 and crash before moving anything.
        j.append_displace(3, 3, 3, 9).unwrap();
        recover(&j).unwrap();

        let home = fx.data.bucket(3);
        assert_eq!(home.owner(&fx.region), 1 << (9 - 3));
        assert_eq!(home.state(&fx.region), STATE_CLEAR);
        let dst = fx.data.bucket(9);
        assert!(dst.in_use(&fx.region));
        assert_eq!(dst.key_slot().bytes(&fx.region), b"moved");
        assert_eq!(dst.value_slot().bytes(&fx.region), b"payload");
    }

    #[test]
    fn test_recover_drops_stale_displacement_source() {
        let fx = setup();
        fill_slot(&fx, 3, b"moved", b"payload");
        let j = journal(&fx);
        let home = fx.data.bucket(3);
        let dst = fx.data.bucket(9);

        // Simulate a crash after the copy and owner flip but before the
        // source content was cleared.
        j.append_displace(3, 3, 3, 9).unwrap();
        dst.copy_content_from(&fx.region, home);
        home.set_owner(&fx.region, 1 << (9 - 3));

        recover(&j).unwrap();
        assert_eq!(home.state(&fx.region), STATE_CLEAR);
        assert!(dst.in_use(&fx.region));
        assert_eq!(dst.key_slot().bytes(&fx.region), b"moved");
    }

    #[test]
    fn test_cas_replay_is_idempotent() {
        let fx = setup();
        fill_slot(&fx, 0, b"k", &8u64.to_le_bytes().repeat(2));
        let value = fx.data.bucket(0).value_slot();
        let off = value.data_offset(&fx.region);
        fx.region.write_u64(off, 5);

        let ops = vec![JournalOp::CasU64 { offset: 0, expected: 5, new: 7 }];
        apply_ops(&fx.region, off, 16, &ops).unwrap();
        assert_eq!(fx.region.read_u64(off), 7);
        // Replay after the op already applied: no change.
        apply_ops(&fx.region, off, 16, &ops).unwrap();
        assert_eq!(fx.region.read_u64(off), 7);
    }
}
