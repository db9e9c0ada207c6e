//! Grouped completion demultiplexing over a shared fabric completion queue.
//!
//! A parent connection owns one completion queue; each [`CommGroup`] is a
//! logical sub-channel over it. Operations posted through a group carry an
//! async record whose id rides as the fabric context; polling any group
//! demultiplexes completions back to the group that posted them,
//! redirecting foreign completions to their owner's deferred queue.

pub mod group;
pub mod loopback;

use std::io::IoSlice;
use std::time::Duration;

pub use group::{CommGroup, CompletionEvent, Disposition, GroupStatsSnapshot, GroupedFabric};
pub use loopback::LoopbackTransport;

/// Identifier of an async record held by the parent connection.
pub type RecordId = u64;

/// Identifier of a communication group.
pub type GroupId = u64;

/// Completion-queue entry flags describing the completed operation.
pub mod completion_flags {
    /// Send completion.
    pub const SEND: u64 = 1;
    /// Receive completion.
    pub const RECV: u64 = 2;
    /// RDMA read completion.
    pub const READ: u64 = 4;
    /// RDMA write completion.
    pub const WRITE: u64 = 8;
}

/// One entry read from the shared completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqEntry {
    /// The context posted with the operation (an async record id).
    pub context: RecordId,
    /// Operation flags.
    pub flags: u64,
    /// Completed transfer length in bytes.
    pub len: usize,
}

/// Result of one non-blocking completion-queue read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CqPoll {
    /// An entry was read.
    Entry(CqEntry),
    /// The queue is drained.
    Empty,
    /// The read was interrupted; retry.
    Interrupted,
    /// An error entry is available through
    /// [`cq_comp_err`](FabricTransport::cq_comp_err).
    ErrorAvailable,
    /// Unrecoverable queue error (negated errno).
    Fault(i32),
}

/// Errors surfaced by the fabric layer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FabricError {
    /// The completion queue reported an unrecoverable errno.
    #[error("fabric completion queue error (errno {0})")]
    Queue(i32),
    /// A wait elapsed without a completion arriving.
    #[error("timed out waiting for a completion")]
    Timeout,
}

/// The connection collaborator underneath the grouped demultiplexer.
///
/// Implementations serialize `cq_read` internally or tolerate the caller's
/// serialization; the demux serializes reads on its side as well.
pub trait FabricTransport: Send + Sync {
    /// Post a send of the gathered buffers.
    fn post_send(&self, buffers: &[IoSlice<'_>], context: RecordId) -> Result<(), FabricError>;

    /// Post a receive into the gathered buffers.
    fn post_recv(&self, buffers: &[IoSlice<'_>], context: RecordId) -> Result<(), FabricError>;

    /// Post an RDMA read from `remote_addr` into the local buffers.
    fn post_read(
        &self,
        buffers: &[IoSlice<'_>],
        remote_addr: u64,
        remote_key: u64,
        context: RecordId,
    ) -> Result<(), FabricError>;

    /// Post an RDMA write of the local buffers to `remote_addr`.
    fn post_write(
        &self,
        buffers: &[IoSlice<'_>],
        remote_addr: u64,
        remote_key: u64,
        context: RecordId,
    ) -> Result<(), FabricError>;

    /// Send without generating a completion.
    fn inject_send(&self, buffers: &[IoSlice<'_>]) -> Result<(), FabricError>;

    /// Read at most one completion entry.
    fn cq_read(&self) -> CqPoll;

    /// Fetch the pending error entry after
    /// [`CqPoll::ErrorAvailable`](CqPoll::ErrorAvailable).
    fn cq_comp_err(&self) -> Option<CqEntry>;

    /// Block until a completion is available or the timeout elapses.
    fn wait_for_next_completion(&self, timeout: Duration) -> Result<(), FabricError>;

    /// Poll up to `polls_limit` times for a completion.
    fn wait_for_next_completion_polled(&self, polls_limit: u32) -> Result<(), FabricError>;

    /// Wake any thread blocked in a wait. In-flight operations are not
    /// cancelled; their completions still arrive and are routed normally.
    fn unblock_completions(&self);
}
