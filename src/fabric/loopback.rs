//! In-process loopback transport.
//!
//! Posts complete immediately into the shared completion queue, so the
//! grouped demultiplexer can be exercised end-to-end without fabric
//! hardware. Error entries, interruptions and queue faults can be injected
//! for tests.

use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{completion_flags, CqEntry, CqPoll, FabricError, FabricTransport, RecordId};

#[derive(Debug, Clone, Copy)]
enum Queued {
    Entry(CqEntry),
    Error(CqEntry),
    Interrupted,
    Fault(i32),
}

/// Loopback connection: one shared completion queue fed by its own posts.
#[derive(Default)]
pub struct LoopbackTransport {
    cq: Mutex<VecDeque<Queued>>,
    cq_ready: Condvar,
    pending_err: Mutex<Option<CqEntry>>,
    unblocked: AtomicBool,
}

impl LoopbackTransport {
    /// Create an empty loopback connection.
    pub fn new() -> Self {
        Self::default()
    }

    fn complete(&self, context: RecordId, flags: u64, len: usize) {
        self.cq.lock().push_back(Queued::Entry(CqEntry { context, flags, len }));
        self.cq_ready.notify_all();
    }

    /// Queue an error completion (test hook).
    pub fn push_error(&self, context: RecordId, flags: u64, len: usize) {
        self.cq.lock().push_back(Queued::Error(CqEntry { context, flags, len }));
        self.cq_ready.notify_all();
    }

    /// Queue an interrupted read (test hook).
    pub fn push_interrupted(&self) {
        self.cq.lock().push_back(Queued::Interrupted);
        self.cq_ready.notify_all();
    }

    /// Queue a fatal queue error (test hook).
    pub fn push_fault(&self, errno: i32) {
        self.cq.lock().push_back(Queued::Fault(errno));
        self.cq_ready.notify_all();
    }

    /// Pop the front entry without demultiplexing (test hook).
    pub fn take_front(&self) -> Option<CqEntry> {
        match self.cq.lock().pop_front() {
            Some(Queued::Entry(entry)) | Some(Queued::Error(entry)) => Some(entry),
            _ => None,
        }
    }

    fn total_len(buffers: &[IoSlice<'_>]) -> usize {
        buffers.iter().map(|buf| buf.len()).sum()
    }
}

impl FabricTransport for LoopbackTransport {
    fn post_send(&self, buffers: &[IoSlice<'_>], context: RecordId) -> Result<(), FabricError> {
        self.complete(context, completion_flags::SEND, Self::total_len(buffers));
        Ok(())
    }

    fn post_recv(&self, buffers: &[IoSlice<'_>], context: RecordId) -> Result<(), FabricError> {
        self.complete(context, completion_flags::RECV, Self::total_len(buffers));
        Ok(())
    }

    fn post_read(
        &self,
        buffers: &[IoSlice<'_>],
        _remote_addr: u64,
        _remote_key: u64,
        context: RecordId,
    ) -> Result<(), FabricError> {
        self.complete(context, completion_flags::READ, Self::total_len(buffers));
        Ok(())
    }

    fn post_write(
        &self,
        buffers: &[IoSlice<'_>],
        _remote_addr: u64,
        _remote_key: u64,
        context: RecordId,
    ) -> Result<(), FabricError> {
        self.complete(context, completion_flags::WRITE, Self::total_len(buffers));
        Ok(())
    }

    fn inject_send(&self, _buffers: &[IoSlice<'_>]) -> Result<(), FabricError> {
        Ok(())
    }

    fn cq_read(&self) -> CqPoll {
        match self.cq.lock().pop_front() {
            None => CqPoll::Empty,
            Some(Queued::Entry(entry)) => CqPoll::Entry(entry),
            Some(Queued::Error(entry)) => {
                *self.pending_err.lock() = Some(entry);
                CqPoll::ErrorAvailable
            }
            Some(Queued::Interrupted) => CqPoll::Interrupted,
            Some(Queued::Fault(errno)) => CqPoll::Fault(errno),
        }
    }

    fn cq_comp_err(&self) -> Option<CqEntry> {
        self.pending_err.lock().take()
    }

    fn wait_for_next_completion(&self, timeout: Duration) -> Result<(), FabricError> {
        let deadline = Instant::now() + timeout;
        let mut cq = self.cq.lock();
        loop {
            if !cq.is_empty() || self.unblocked.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            if self.cq_ready.wait_until(&mut cq, deadline).timed_out() {
                return Err(FabricError::Timeout);
            }
        }
    }

    fn wait_for_next_completion_polled(&self, polls_limit: u32) -> Result<(), FabricError> {
        for _ in 0..polls_limit {
            if !self.cq.lock().is_empty() || self.unblocked.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            std::thread::yield_now();
        }
        Err(FabricError::Timeout)
    }

    fn unblock_completions(&self) {
        self.unblocked.store(true, Ordering::Release);
        self.cq_ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_completes_into_queue() {
        let transport = LoopbackTransport::new();
        transport.post_send(&[IoSlice::new(b"hello")], 3).unwrap();
        match transport.cq_read() {
            CqPoll::Entry(entry) => {
                assert_eq!(entry.context, 3);
                assert_eq!(entry.flags, completion_flags::SEND);
                assert_eq!(entry.len, 5);
            }
            other => panic!("unexpected poll result: {other:?}"),
        }
        assert_eq!(transport.cq_read(), CqPoll::Empty);
    }

    #[test]
    fn test_inject_send_has_no_completion() {
        let transport = LoopbackTransport::new();
        transport.inject_send(&[IoSlice::new(b"fire-and-forget")]).unwrap();
        assert_eq!(transport.cq_read(), CqPoll::Empty);
    }

    #[test]
    fn test_error_entry_sequence() {
        let transport = LoopbackTransport::new();
        transport.push_error(9, completion_flags::RECV, 0);
        assert_eq!(transport.cq_read(), CqPoll::ErrorAvailable);
        let err = transport.cq_comp_err().unwrap();
        assert_eq!(err.context, 9);
        assert!(transport.cq_comp_err().is_none());
    }

    #[test]
    fn test_wait_times_out() {
        let transport = LoopbackTransport::new();
        assert_eq!(
            transport.wait_for_next_completion(Duration::from_millis(10)),
            Err(FabricError::Timeout)
        );
        assert_eq!(
            transport.wait_for_next_completion_polled(4),
            Err(FabricError::Timeout)
        );
    }

    #[test]
    fn test_wait_sees_completion() {
        let transport = LoopbackTransport::new();
        transport.post_send(&[IoSlice::new(b"x")], 1).unwrap();
        assert!(transport.wait_for_next_completion(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_unblock_wakes_waiter() {
        use std::sync::Arc;
        let transport = Arc::new(LoopbackTransport::new());
        let waiter = {
            let transport = Arc::clone(&transport);
            std::thread::spawn(move || transport.wait_for_next_completion(Duration::from_secs(5)))
        };
        // Give the waiter a moment to block, then wake it without a
        // completion.
        std::thread::sleep(Duration::from_millis(20));
        transport.unblock_completions();
        assert!(waiter.join().unwrap().is_ok());
    }
}
