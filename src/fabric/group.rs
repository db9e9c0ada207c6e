//! Communication groups and the demultiplexing loop.

use std::collections::{HashMap, VecDeque};
use std::io::IoSlice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::{CqEntry, CqPoll, FabricError, FabricTransport, GroupId, RecordId};
use crate::status::Status;

/// Verdict of a tentative completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The completion is consumed.
    Accept,
    /// The completion is requeued on the group's deferred queue for a later
    /// poll; the async record stays alive.
    Defer,
}

/// A demultiplexed completion handed to a poll callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent {
    /// The user context supplied at post time.
    pub context: u64,
    /// Completion status: `Ok`, or `Fail` for an error entry.
    pub status: Status,
    /// Operation flags from the queue entry.
    pub flags: u64,
    /// Completed transfer length in bytes.
    pub len: usize,
}

#[derive(Debug, Clone, Copy)]
struct AsyncRecord {
    group: GroupId,
    user_context: u64,
}

#[derive(Debug, Clone, Copy)]
struct Completion {
    record: RecordId,
    status: Status,
    flags: u64,
    len: usize,
}

#[derive(Debug, Default)]
struct GroupStats {
    ct_total: AtomicU64,
    defer_total: AtomicU64,
    redirect_total: AtomicU64,
}

/// Counter snapshot for one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupStatsSnapshot {
    /// Completions delivered to this group's callbacks.
    pub ct_total: u64,
    /// Tentative completions deferred by this group's callbacks.
    pub defer_total: u64,
    /// Completions this group routed to another group.
    pub redirect_total: u64,
}

struct GroupShared {
    id: GroupId,
    deferred: Mutex<VecDeque<Completion>>,
    stats: GroupStats,
}

struct FabricCore {
    transport: Arc<dyn FabricTransport>,
    records: Mutex<HashMap<RecordId, AsyncRecord>>,
    next_record: AtomicU64,
    groups: Mutex<HashMap<GroupId, Arc<GroupShared>>>,
    next_group: AtomicU64,
    /// Completions for forgotten groups or unknown contexts.
    sunk: AtomicU64,
    /// Serializes reads of the shared completion queue.
    cq_serial: Mutex<()>,
}

impl FabricCore {
    fn register_record(&self, group: GroupId, user_context: u64) -> RecordId {
        let id = self.next_record.fetch_add(1, Ordering::Relaxed);
        self.records.lock().insert(id, AsyncRecord { group, user_context });
        id
    }

    fn peek_record(&self, id: RecordId) -> Option<AsyncRecord> {
        self.records.lock().get(&id).copied()
    }

    fn remove_record(&self, id: RecordId) {
        self.records.lock().remove(&id);
    }

    /// Push a completion onto its owner group's deferred queue, or sink it
    /// if the group is gone.
    fn route(&self, target: GroupId, completion: Completion) {
        let group = self.groups.lock().get(&target).cloned();
        match group {
            Some(group) => group.deferred.lock().push_back(completion),
            None => {
                self.remove_record(completion.record);
                self.sunk.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Parent connection state shared by every group: the transport, the async
/// record table and the group registry. Clones share the same connection.
#[derive(Clone)]
pub struct GroupedFabric {
    core: Arc<FabricCore>,
}

impl GroupedFabric {
    /// Wrap a connection for grouped use.
    pub fn new(transport: Arc<dyn FabricTransport>) -> Self {
        Self {
            core: Arc::new(FabricCore {
                transport,
                records: Mutex::new(HashMap::new()),
                next_record: AtomicU64::new(1),
                groups: Mutex::new(HashMap::new()),
                next_group: AtomicU64::new(1),
                sunk: AtomicU64::new(0),
                cq_serial: Mutex::new(()),
            }),
        }
    }

    /// Open a new communication group over the shared queue.
    pub fn open_group(&self) -> CommGroup {
        let id = self.core.next_group.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(GroupShared {
            id,
            deferred: Mutex::new(VecDeque::new()),
            stats: GroupStats::default(),
        });
        self.core.groups.lock().insert(id, Arc::clone(&shared));
        CommGroup { fabric: self.clone(), shared }
    }

    /// Deregister a group; completions still in flight for it are routed to
    /// the sink instead of a dangling queue.
    pub fn forget_group(&self, id: GroupId) {
        self.core.groups.lock().remove(&id);
    }

    /// Completions dropped because their group was forgotten or their
    /// context was unknown.
    pub fn sunk_completions(&self) -> u64 {
        self.core.sunk.load(Ordering::Relaxed)
    }

    /// Async records still owned by the fabric.
    pub fn outstanding_records(&self) -> usize {
        self.core.records.lock().len()
    }
}

/// One logical sub-channel over the shared completion queue.
pub struct CommGroup {
    fabric: GroupedFabric,
    shared: Arc<GroupShared>,
}

impl CommGroup {
    /// This group's identifier.
    pub fn id(&self) -> GroupId {
        self.shared.id
    }

    /// The parent connection wrapper.
    pub fn fabric(&self) -> &GroupedFabric {
        &self.fabric
    }

    fn with_record<F>(&self, user_context: u64, post: F) -> Result<(), FabricError>
    where
        F: FnOnce(RecordId) -> Result<(), FabricError>,
    {
        // Ownership of the record transfers to the fabric; it comes back
        // exactly once via a completion, success or error.
        let record = self.fabric.core.register_record(self.shared.id, user_context);
        post(record).inspect_err(|_| self.fabric.core.remove_record(record))
    }

    /// Post a send through this group.
    pub fn post_send(&self, buffers: &[IoSlice<'_>], context: u64) -> Result<(), FabricError> {
        self.with_record(context, |record| self.fabric.core.transport.post_send(buffers, record))
    }

    /// Post a receive through this group.
    pub fn post_recv(&self, buffers: &[IoSlice<'_>], context: u64) -> Result<(), FabricError> {
        self.with_record(context, |record| self.fabric.core.transport.post_recv(buffers, record))
    }

    /// Post an RDMA read through this group.
    pub fn post_read(
        &self,
        buffers: &[IoSlice<'_>],
        remote_addr: u64,
        remote_key: u64,
        context: u64,
    ) -> Result<(), FabricError> {
        self.with_record(context, |record| {
            self.fabric.core.transport.post_read(buffers, remote_addr, remote_key, record)
        })
    }

    /// Post an RDMA write through this group.
    pub fn post_write(
        &self,
        buffers: &[IoSlice<'_>],
        remote_addr: u64,
        remote_key: u64,
        context: u64,
    ) -> Result<(), FabricError> {
        self.with_record(context, |record| {
            self.fabric.core.transport.post_write(buffers, remote_addr, remote_key, record)
        })
    }

    /// Send without a completion; no record is created.
    pub fn inject_send(&self, buffers: &[IoSlice<'_>]) -> Result<(), FabricError> {
        self.fabric.core.transport.inject_send(buffers)
    }

    /// Poll completions with the legacy context-and-status callback.
    pub fn poll_completions_old<F>(&self, mut cb: F) -> Result<usize, FabricError>
    where
        F: FnMut(u64, Status),
    {
        self.poll_inner(false, &mut |event| {
            cb(event.context, event.status);
            Disposition::Accept
        })
    }

    /// Poll completions; every delivered completion is consumed.
    pub fn poll_completions<F>(&self, mut cb: F) -> Result<usize, FabricError>
    where
        F: FnMut(&CompletionEvent),
    {
        self.poll_inner(false, &mut |event| {
            cb(event);
            Disposition::Accept
        })
    }

    /// Poll completions with rejection: a deferred completion is redelivered
    /// on this group on a later poll, and only then.
    ///
    /// The shared queue is polled before the deferred queue so a fresh
    /// rejection does not immediately re-run against itself.
    pub fn poll_completions_tentative<F>(&self, mut cb: F) -> Result<usize, FabricError>
    where
        F: FnMut(&CompletionEvent) -> Disposition,
    {
        self.poll_inner(true, &mut cb)
    }

    fn poll_inner(
        &self,
        tentative: bool,
        cb: &mut dyn FnMut(&CompletionEvent) -> Disposition,
    ) -> Result<usize, FabricError> {
        let mut accepted = 0usize;
        let mut requeue: Vec<Completion> = Vec::new();

        if !tentative {
            accepted += self.drain_deferred(tentative, cb, &mut requeue);
        }

        loop {
            let polled = {
                let _serial = self.fabric.core.cq_serial.lock();
                self.fabric.core.transport.cq_read()
            };
            match polled {
                CqPoll::Entry(entry) => {
                    accepted += self.process_entry(entry, Status::Ok, tentative, cb, &mut requeue);
                }
                CqPoll::Empty => break,
                CqPoll::Interrupted => continue,
                CqPoll::ErrorAvailable => {
                    // The error context is not necessarily one of ours.
                    if let Some(entry) = self.fabric.core.transport.cq_comp_err() {
                        accepted +=
                            self.process_entry(entry, Status::Fail, tentative, cb, &mut requeue);
                    }
                }
                CqPoll::Fault(errno) => return Err(FabricError::Queue(errno)),
            }
        }

        if tentative {
            accepted += self.drain_deferred(tentative, cb, &mut requeue);
        }

        if !requeue.is_empty() {
            self.shared.deferred.lock().extend(requeue);
        }
        self.shared.stats.ct_total.fetch_add(accepted as u64, Ordering::Relaxed);
        Ok(accepted)
    }

    /// Drain this group's deferred queue, releasing the mutex around every
    /// callback invocation.
    fn drain_deferred(
        &self,
        tentative: bool,
        cb: &mut dyn FnMut(&CompletionEvent) -> Disposition,
        requeue: &mut Vec<Completion>,
    ) -> usize {
        let mut accepted = 0usize;
        loop {
            let completion = self.shared.deferred.lock().pop_front();
            let Some(completion) = completion else { break };
            let Some(record) = self.fabric.core.peek_record(completion.record) else {
                warn!(record = completion.record, "deferred completion lost its record");
                continue;
            };
            let event = CompletionEvent {
                context: record.user_context,
                status: completion.status,
                flags: completion.flags,
                len: completion.len,
            };
            if tentative {
                match cb(&event) {
                    Disposition::Accept => {
                        self.fabric.core.remove_record(completion.record);
                        accepted += 1;
                    }
                    Disposition::Defer => {
                        self.shared.stats.defer_total.fetch_add(1, Ordering::Relaxed);
                        requeue.push(completion);
                    }
                }
            } else {
                self.fabric.core.remove_record(completion.record);
                cb(&event);
                accepted += 1;
            }
        }
        accepted
    }

    /// Deliver, defer or redirect one freshly polled entry.
    fn process_entry(
        &self,
        entry: CqEntry,
        status: Status,
        tentative: bool,
        cb: &mut dyn FnMut(&CompletionEvent) -> Disposition,
        requeue: &mut Vec<Completion>,
    ) -> usize {
        let Some(record) = self.fabric.core.peek_record(entry.context) else {
            warn!(context = entry.context, "completion with unknown context sunk");
            self.fabric.core.sunk.fetch_add(1, Ordering::Relaxed);
            return 0;
        };
        let completion = Completion {
            record: entry.context,
            status,
            flags: entry.flags,
            len: entry.len,
        };

        if record.group != self.shared.id {
            self.shared.stats.redirect_total.fetch_add(1, Ordering::Relaxed);
            self.fabric.core.route(record.group, completion);
            return 0;
        }

        let event = CompletionEvent {
            context: record.user_context,
            status,
            flags: entry.flags,
            len: entry.len,
        };
        if tentative {
            match cb(&event) {
                Disposition::Accept => {
                    self.fabric.core.remove_record(entry.context);
                    1
                }
                Disposition::Defer => {
                    self.shared.stats.defer_total.fetch_add(1, Ordering::Relaxed);
                    requeue.push(completion);
                    0
                }
            }
        } else {
            self.fabric.core.remove_record(entry.context);
            cb(&event);
            1
        }
    }

    /// Depth of the deferred queue.
    pub fn stalled_completion_count(&self) -> usize {
        self.shared.deferred.lock().len()
    }

    /// Snapshot of this group's counters.
    pub fn stats(&self) -> GroupStatsSnapshot {
        GroupStatsSnapshot {
            ct_total: self.shared.stats.ct_total.load(Ordering::Relaxed),
            defer_total: self.shared.stats.defer_total.load(Ordering::Relaxed),
            redirect_total: self.shared.stats.redirect_total.load(Ordering::Relaxed),
        }
    }

    /// Block until a completion is available or the timeout elapses.
    pub fn wait_for_next_completion(&self, timeout: Duration) -> Result<(), FabricError> {
        self.fabric.core.transport.wait_for_next_completion(timeout)
    }

    /// Poll up to `polls_limit` times for a completion.
    pub fn wait_for_next_completion_polled(&self, polls_limit: u32) -> Result<(), FabricError> {
        self.fabric.core.transport.wait_for_next_completion_polled(polls_limit)
    }

    /// Wake any thread blocked in a wait.
    pub fn unblock_completions(&self) {
        self.fabric.core.transport.unblock_completions()
    }
}

impl Drop for CommGroup {
    fn drop(&mut self) {
        if std::env::var_os("FABRIC_STATS").is_some() {
            let stats = self.stats();
            info!(
                group = self.shared.id,
                ct = stats.ct_total,
                defer = stats.defer_total,
                redirect = stats.redirect_total,
                "group retired"
            );
        }
        self.fabric.forget_group(self.shared.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{completion_flags, LoopbackTransport};

    fn fabric() -> GroupedFabric {
        GroupedFabric::new(Arc::new(LoopbackTransport::new()))
    }

    #[test]
    fn test_own_completions_delivered_once() {
        let fabric = fabric();
        let group = fabric.open_group();
        for context in 0..5u64 {
            group.post_send(&[IoSlice::new(b"x")], context).unwrap();
        }
        let mut seen = Vec::new();
        let polled = group
            .poll_completions(|event| {
                assert_eq!(event.status, Status::Ok);
                assert_eq!(event.flags, completion_flags::SEND);
                seen.push(event.context);
            })
            .unwrap();
        assert_eq!(polled, 5);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(group.poll_completions(|_| ()).unwrap(), 0);
        assert_eq!(fabric.outstanding_records(), 0);
    }

    #[test]
    fn test_redirection_to_other_group() {
        let fabric = fabric();
        let a = fabric.open_group();
        let b = fabric.open_group();
        b.post_send(&[IoSlice::new(b"x")], 7).unwrap();

        // Polling A routes B's completion onto B's deferred queue.
        assert_eq!(a.poll_completions(|_| ()).unwrap(), 0);
        assert_eq!(a.stats().redirect_total, 1);
        assert_eq!(b.stalled_completion_count(), 1);

        let mut seen = Vec::new();
        assert_eq!(b.poll_completions(|e| seen.push(e.context)).unwrap(), 1);
        assert_eq!(seen, vec![7]);
    }

    #[test]
    fn test_tentative_defer_redelivers_next_poll() {
        let fabric = fabric();
        let group = fabric.open_group();
        group.post_send(&[IoSlice::new(b"x")], 42).unwrap();

        // First poll rejects; the completion must not re-run in this call.
        let mut calls = 0;
        let polled = group
            .poll_completions_tentative(|_| {
                calls += 1;
                Disposition::Defer
            })
            .unwrap();
        assert_eq!(polled, 0);
        assert_eq!(calls, 1);
        assert_eq!(group.stats().defer_total, 1);
        assert_eq!(group.stalled_completion_count(), 1);

        // The next poll redelivers and accepts.
        let polled = group
            .poll_completions_tentative(|event| {
                assert_eq!(event.context, 42);
                Disposition::Accept
            })
            .unwrap();
        assert_eq!(polled, 1);
        assert_eq!(group.stalled_completion_count(), 0);
        assert_eq!(fabric.outstanding_records(), 0);
    }

    #[test]
    fn test_error_entry_routed_as_failed() {
        let transport = Arc::new(LoopbackTransport::new());
        let fabric = GroupedFabric::new(transport.clone());
        let group = fabric.open_group();
        group.post_send(&[IoSlice::new(b"x")], 1).unwrap();
        // Rewrite the queued success into an error entry.
        let entry = transport.take_front().unwrap();
        transport.push_error(entry.context, entry.flags, entry.len);

        let mut statuses = Vec::new();
        group.poll_completions(|event| statuses.push(event.status)).unwrap();
        assert_eq!(statuses, vec![Status::Fail]);
    }

    #[test]
    fn test_fault_is_fatal() {
        let transport = Arc::new(LoopbackTransport::new());
        let fabric = GroupedFabric::new(transport.clone());
        let group = fabric.open_group();
        transport.push_fault(-5);
        assert_eq!(group.poll_completions(|_| ()), Err(FabricError::Queue(-5)));
    }

    #[test]
    fn test_interrupted_is_retried() {
        let transport = Arc::new(LoopbackTransport::new());
        let fabric = GroupedFabric::new(transport.clone());
        let group = fabric.open_group();
        transport.push_interrupted();
        group.post_send(&[IoSlice::new(b"x")], 9).unwrap();
        let mut seen = Vec::new();
        assert_eq!(group.poll_completions(|e| seen.push(e.context)).unwrap(), 1);
        assert_eq!(seen, vec![9]);
    }

    #[test]
    fn test_forgotten_group_completions_sink() {
        let transport = Arc::new(LoopbackTransport::new());
        let fabric = GroupedFabric::new(transport.clone());
        let a = fabric.open_group();
        {
            let b = fabric.open_group();
            b.post_send(&[IoSlice::new(b"x")], 1).unwrap();
            // b drops here with its completion still queued.
        }
        assert_eq!(a.poll_completions(|_| ()).unwrap(), 0);
        assert_eq!(fabric.sunk_completions(), 1);
        assert_eq!(fabric.outstanding_records(), 0);
    }
}
