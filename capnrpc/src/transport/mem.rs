//! In-memory duplex transport, for tests and in-process wiring.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    CloseHandler, CloseState, DataHandler, Transport, TransportError, WriteCompletion, WriteQueue,
};

/// One end of an in-memory duplex pair.
///
/// Writes complete as soon as the bytes land in the peer's inbox; reads
/// are pumped by a task spawned from [`start_read`]. Both ends honor the
/// full close discipline: dropping the write half signals EOF to the
/// peer, whose close handler then fires exactly once.
///
/// [`start_read`]: Transport::start_read
#[derive(Debug)]
pub struct MemTransport {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    rx: Option<mpsc::UnboundedReceiver<Bytes>>,
    close: Arc<Mutex<CloseState>>,
    writes: Arc<Mutex<WriteQueue>>,
}

/// Creates a connected pair of in-memory transports.
pub fn mem_pair() -> (MemTransport, MemTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (MemTransport::new(a_tx, a_rx), MemTransport::new(b_tx, b_rx))
}

impl MemTransport {
    fn new(tx: mpsc::UnboundedSender<Bytes>, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            tx: Some(tx),
            rx: Some(rx),
            close: Arc::new(Mutex::new(CloseState::new())),
            writes: Arc::new(Mutex::new(WriteQueue::new())),
        }
    }
}

impl Transport for MemTransport {
    fn start_read(&mut self, mut on_data: DataHandler) -> Result<(), TransportError> {
        let mut rx = self.rx.take().ok_or(TransportError::Closed)?;
        let close = self.close.clone();
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                if close.lock().is_signaled() {
                    break;
                }
                on_data(&chunk);
            }
            // EOF from the peer funnels through the same single-shot
            // close signal as a local close.
            close.lock().signal_close(None);
        });
        Ok(())
    }

    fn set_close_handler(&mut self, on_close: CloseHandler) {
        self.close.lock().set_handler(on_close);
    }

    fn queue_write(
        &mut self,
        bytes: Bytes,
        on_done: Option<WriteCompletion>,
    ) -> Result<(), TransportError> {
        if self.close.lock().is_closing() {
            return Err(TransportError::Closed);
        }
        let ticket = self.writes.lock().enqueue(on_done);
        let result = match &self.tx {
            Some(tx) => tx.send(bytes).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        };
        match result {
            Ok(()) => {
                self.writes.lock().complete(ticket, None);
                Ok(())
            }
            Err(err) => {
                self.writes
                    .lock()
                    .complete(ticket, Some(err.clone_shallow()));
                Err(err)
            }
        }
    }

    fn close(&mut self) {
        let mut close = self.close.lock();
        if close.request_close() {
            self.tx = None;
            close.signal_close(None);
        }
    }

    fn is_closing(&self) -> bool {
        self.close.lock().is_closing()
    }

    fn pending_writes(&self) -> usize {
        self.writes.lock().len()
    }

    fn clear_handlers(&mut self) {
        self.close.lock().clear_handler();
    }

    fn abandon_pending_writes(&mut self) {
        self.writes.lock().abandon_all();
    }
}
