//! The async transport contract the engine consumes.
//!
//! The engine never opens sockets itself; it drives any object honoring
//! this callback discipline:
//!
//! - `start_read` delivers inbound bytes one slice at a time on the
//!   transport's event-loop thread; the slice is only valid for the
//!   duration of the callback.
//! - `queue_write` copies the bytes and calls the completion exactly once
//!   when the write finishes or fails.
//! - `close` is idempotent and eventually fires the close handler exactly
//!   once, whether the close came from EOF, an error, or the local side.
//!
//! [`CloseState`] and [`WriteQueue`] are the building blocks transports
//! use to honor the single-shot close and safe-abandonment rules.

use std::fmt;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use slab::Slab;

pub mod mem;

pub use mem::{mem_pair, MemTransport};

/// How long shutdown waits for pending writes before abandoning them.
pub const WRITE_DRAIN_BUDGET: Duration = Duration::from_millis(200);

/// Errors surfaced by transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// IO error from the underlying stream.
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// The transport is closing or closed.
    #[error("transport is closed")]
    Closed,

    /// A pending write was abandoned during shutdown.
    #[error("pending write abandoned during shutdown")]
    WriteAbandoned,
}

impl TransportError {
    /// A structural copy, for fanning one failure out to several
    /// completion callbacks.
    pub fn clone_shallow(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
            Self::Closed => Self::Closed,
            Self::WriteAbandoned => Self::WriteAbandoned,
        }
    }
}

/// Inbound data callback.
pub type DataHandler = Box<dyn FnMut(&[u8]) + Send>;

/// Write completion callback.
pub type WriteCompletion = Box<dyn FnOnce(Option<TransportError>) + Send>;

/// Close notification callback.
pub type CloseHandler = Box<dyn FnOnce(Option<TransportError>) + Send>;

/// The transport contract.
pub trait Transport: Send {
    /// Begins delivering inbound bytes to `on_data`.
    fn start_read(&mut self, on_data: DataHandler) -> Result<(), TransportError>;

    /// Installs the single-shot close handler.
    fn set_close_handler(&mut self, on_close: CloseHandler);

    /// Queues an outbound write; `on_done` fires exactly once unless the
    /// write is abandoned.
    fn queue_write(
        &mut self,
        bytes: Bytes,
        on_done: Option<WriteCompletion>,
    ) -> Result<(), TransportError>;

    /// Requests close. Idempotent.
    fn close(&mut self);

    /// Whether any close path has started.
    fn is_closing(&self) -> bool;

    /// Number of writes queued but not yet completed.
    fn pending_writes(&self) -> usize;

    /// Drops the data and close handlers without firing them.
    fn clear_handlers(&mut self);

    /// Neuters the completion callbacks of all pending writes so latent
    /// completions become safe no-ops.
    fn abandon_pending_writes(&mut self);
}

/// Close-path bookkeeping: every way a connection can end funnels into
/// [`signal_close`](CloseState::signal_close), which fires the handler at
/// most once.
#[derive(Default)]
pub struct CloseState {
    close_requested: bool,
    shutting_down: bool,
    close_signaled: bool,
    on_close: Option<CloseHandler>,
}

impl fmt::Debug for CloseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseState")
            .field("close_requested", &self.close_requested)
            .field("shutting_down", &self.shutting_down)
            .field("close_signaled", &self.close_signaled)
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

impl CloseState {
    /// Creates idle close state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the close handler.
    pub fn set_handler(&mut self, on_close: CloseHandler) {
        self.on_close = Some(on_close);
    }

    /// Drops the close handler without firing it.
    pub fn clear_handler(&mut self) {
        self.on_close = None;
    }

    /// Marks an explicit close request; true on the first call.
    pub fn request_close(&mut self) -> bool {
        if self.close_requested {
            return false;
        }
        self.close_requested = true;
        true
    }

    /// Marks teardown in progress; true on the first call.
    pub fn begin_shutdown(&mut self) -> bool {
        if self.shutting_down {
            return false;
        }
        self.shutting_down = true;
        true
    }

    /// Fires the close handler, at most once across all close paths.
    pub fn signal_close(&mut self, error: Option<TransportError>) {
        if self.close_signaled {
            return;
        }
        self.close_signaled = true;
        if let Some(on_close) = self.on_close.take() {
            on_close(error);
        }
    }

    /// Whether any close path has started.
    pub fn is_closing(&self) -> bool {
        self.close_requested || self.shutting_down || self.close_signaled
    }

    /// Whether the close handler already fired.
    pub fn is_signaled(&self) -> bool {
        self.close_signaled
    }
}

struct PendingWrite {
    on_done: Option<WriteCompletion>,
    neutered: bool,
}

/// Tracker for in-flight writes with O(1) detach.
///
/// Tickets stay valid across [`abandon_all`](WriteQueue::abandon_all):
/// completing an abandoned write is a no-op rather than a crash.
#[derive(Default)]
pub struct WriteQueue {
    ops: Slab<PendingWrite>,
}

impl fmt::Debug for WriteQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteQueue")
            .field("pending", &self.ops.len())
            .finish()
    }
}

/// Handle to one pending write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTicket(usize);

impl WriteQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks a new pending write.
    pub fn enqueue(&mut self, on_done: Option<WriteCompletion>) -> WriteTicket {
        WriteTicket(self.ops.insert(PendingWrite {
            on_done,
            neutered: false,
        }))
    }

    /// Completes a pending write, firing its callback unless the write
    /// was abandoned.
    pub fn complete(&mut self, ticket: WriteTicket, error: Option<TransportError>) {
        if let Some(write) = self.ops.try_remove(ticket.0) {
            if !write.neutered {
                if let Some(on_done) = write.on_done {
                    on_done(error);
                }
            }
        }
    }

    /// Neuters every pending write's callback so latent completions are
    /// safe no-ops.
    pub fn abandon_all(&mut self) {
        for (_, write) in self.ops.iter_mut() {
            write.neutered = true;
            write.on_done = None;
        }
    }

    /// Number of tracked writes.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether no writes are tracked.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Drains pending writes within [`WRITE_DRAIN_BUDGET`], then abandons the
/// remainder. The deinit discipline of the contract.
pub async fn drain_writes<T: Transport + ?Sized>(transport: &mut T) {
    let deadline = tokio::time::Instant::now() + WRITE_DRAIN_BUDGET;
    while transport.pending_writes() > 0 {
        if tokio::time::Instant::now() >= deadline {
            transport.abandon_pending_writes();
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn close_signals_exactly_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut state = CloseState::new();
        let count = fired.clone();
        state.set_handler(Box::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(state.request_close());
        assert!(!state.request_close());
        state.signal_close(None);
        state.signal_close(Some(TransportError::Closed));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(state.is_closing());
        assert!(state.is_signaled());
    }

    #[test]
    fn abandoned_writes_complete_as_no_ops() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut queue = WriteQueue::new();

        let count = fired.clone();
        let a = queue.enqueue(Some(Box::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })));
        let count = fired.clone();
        let b = queue.enqueue(Some(Box::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })));

        queue.complete(a, None);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        queue.abandon_all();
        queue.complete(b, Some(TransportError::WriteAbandoned));
        assert_eq!(fired.load(Ordering::SeqCst), 1, "neutered callback");
        assert!(queue.is_empty());

        // A ticket completed twice is a no-op, not a panic.
        queue.complete(b, None);
    }
}
