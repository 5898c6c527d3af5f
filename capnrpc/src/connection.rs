//! Binds a framer and a transport to a peer and drives the event loop.
//!
//! Control flow per inbound byte: transport read, framer push, then
//! while the framer yields frames the peer dispatches them and the
//! resulting outbound frames go onto the transport's write queue, in
//! program order.

use bytes::Bytes;
use capnrpc_wire::frame::{FrameError, Framer};
use capnrpc_wire::rpc::{self, MessageTarget};
use capnrpc_wire::Message;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::peer::{CallRequest, Peer, PeerError, ReturnHandler};
use crate::transport::{self, Transport, TransportError};

/// Errors with driving a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The peer state machine failed fatally.
    #[error(transparent)]
    Peer(#[from] PeerError),

    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Frame reassembly failed.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The engine event loop is no longer running.
    #[error("connection engine stopped")]
    Stopped,
}

enum Inbound {
    Data(Bytes),
    Closed(Option<TransportError>),
}

pub(crate) enum ConnectionControl {
    Bootstrap {
        on_return: Option<Box<dyn ReturnHandler>>,
        resp: oneshot::Sender<u32>,
    },
    Call {
        target: MessageTarget,
        interface_id: u64,
        method_id: u16,
        /// Owned params segment; its root pointer is the content.
        params: Option<Bytes>,
        on_return: Option<Box<dyn ReturnHandler>>,
        resp: oneshot::Sender<Result<u32, PeerError>>,
    },
    Shutdown,
}

/// A handle to the connection event loop.
///
/// Dropping the handle does not stop the loop; use
/// [`shutdown`](Connection::shutdown) for an orderly teardown.
#[derive(Debug)]
pub struct Connection {
    control: mpsc::Sender<ConnectionControl>,
    engine_handle: JoinHandle<Result<(), ConnectionError>>,
}

impl Connection {
    /// Starts the event loop over `transport`, reading immediately.
    pub fn spawn<T>(peer: Peer, mut transport: T) -> Result<Self, TransportError>
    where
        T: Transport + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let data_tx = inbound_tx.clone();
        transport.start_read(Box::new(move |chunk| {
            let _ = data_tx.send(Inbound::Data(Bytes::copy_from_slice(chunk)));
        }))?;
        transport.set_close_handler(Box::new(move |error| {
            let _ = inbound_tx.send(Inbound::Closed(error));
        }));

        let (control_tx, control_rx) = mpsc::channel(16);
        let engine = ConnectionEngine {
            peer,
            framer: Framer::new(),
            transport,
            inbound: inbound_rx,
            control: control_rx,
        };
        let engine_handle = tokio::spawn(engine.event_loop());
        Ok(Self {
            control: control_tx,
            engine_handle,
        })
    }

    /// Requests the peer's bootstrap capability; resolves to the
    /// question id.
    pub async fn bootstrap(
        &self,
        on_return: Option<Box<dyn ReturnHandler>>,
    ) -> Result<u32, ConnectionError> {
        let (resp, rx) = oneshot::channel();
        self.control
            .send(ConnectionControl::Bootstrap { on_return, resp })
            .await
            .map_err(|_| ConnectionError::Stopped)?;
        rx.await.map_err(|_| ConnectionError::Stopped)
    }

    /// Sends a call; resolves to the question id.
    pub async fn call(
        &self,
        target: MessageTarget,
        interface_id: u64,
        method_id: u16,
        params: Option<Bytes>,
        on_return: Option<Box<dyn ReturnHandler>>,
    ) -> Result<u32, ConnectionError> {
        let (resp, rx) = oneshot::channel();
        self.control
            .send(ConnectionControl::Call {
                target,
                interface_id,
                method_id,
                params,
                on_return,
                resp,
            })
            .await
            .map_err(|_| ConnectionError::Stopped)?;
        rx.await.map_err(|_| ConnectionError::Stopped)?.map_err(Into::into)
    }

    /// Drains pending writes within the shutdown budget, closes the
    /// transport, and waits for the event loop to stop.
    pub async fn shutdown(mut self) -> Result<(), ConnectionError> {
        let _ = self.control.send(ConnectionControl::Shutdown).await;
        match (&mut self.engine_handle).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Stopped),
        }
    }
}

enum Running {
    Continue,
    Stop,
}

struct ConnectionEngine<T: Transport> {
    peer: Peer,
    framer: Framer,
    transport: T,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    control: mpsc::Receiver<ConnectionControl>,
}

impl<T: Transport> ConnectionEngine<T> {
    async fn event_loop(mut self) -> Result<(), ConnectionError> {
        let mut outcome = Ok(());
        loop {
            let running = tokio::select! {
                inbound = self.inbound.recv() => match inbound {
                    Some(Inbound::Data(bytes)) => match self.on_data(&bytes) {
                        Ok(running) => running,
                        Err(err) => {
                            self.transport.close();
                            outcome = Err(err);
                            Running::Stop
                        }
                    },
                    Some(Inbound::Closed(error)) => {
                        debug!("transport closed");
                        if let Some(error) = error {
                            outcome = Err(error.into());
                        }
                        Running::Stop
                    }
                    None => Running::Stop,
                },
                control = self.control.recv() => match control {
                    Some(control) => self.on_control(control).await,
                    None => {
                        // Every handle dropped; tear down quietly.
                        transport::drain_writes(&mut self.transport).await;
                        self.transport.close();
                        Running::Stop
                    }
                },
            };
            match running {
                Running::Continue => {}
                Running::Stop => break,
            }
        }
        self.transport.clear_handlers();
        self.transport.abandon_pending_writes();
        debug!("connection engine stopped");
        outcome
    }

    async fn on_control(&mut self, control: ConnectionControl) -> Running {
        match control {
            ConnectionControl::Bootstrap { on_return, resp } => {
                let mut sink: Vec<Bytes> = Vec::new();
                let question_id = self.peer.send_bootstrap(on_return, &mut sink);
                self.flush(sink);
                let _ = resp.send(question_id);
                Running::Continue
            }
            ConnectionControl::Call {
                target,
                interface_id,
                method_id,
                params,
                on_return,
                resp,
            } => {
                let mut sink: Vec<Bytes> = Vec::new();
                let result = match params {
                    Some(segment) => {
                        let msg = Message::from_segment(segment);
                        match msg.root() {
                            Ok(root) => self.peer.send_call(
                                CallRequest {
                                    target,
                                    interface_id,
                                    method_id,
                                    params: root,
                                    stream_client: None,
                                    on_return,
                                },
                                &mut sink,
                            ),
                            Err(err) => Err(err.into()),
                        }
                    }
                    None => self.peer.send_call(
                        CallRequest {
                            target,
                            interface_id,
                            method_id,
                            params: None,
                            stream_client: None,
                            on_return,
                        },
                        &mut sink,
                    ),
                };
                self.flush(sink);
                let _ = resp.send(result);
                Running::Continue
            }
            ConnectionControl::Shutdown => {
                transport::drain_writes(&mut self.transport).await;
                self.transport.close();
                Running::Stop
            }
        }
    }

    fn on_data(&mut self, bytes: &[u8]) -> Result<Running, ConnectionError> {
        self.framer.push(bytes);
        loop {
            let frame = match self.framer.pop_frame() {
                Ok(None) => break,
                Ok(Some(frame)) => frame,
                Err(err) => {
                    // Framing errors are fatal to the connection.
                    let _ = self
                        .transport
                        .queue_write(rpc::abort(frame_error_name(&err), 0), None);
                    return Err(err.into());
                }
            };
            trace!(words = frame.total_words(), "frame");
            let mut sink: Vec<Bytes> = Vec::new();
            match self.peer.handle_frame(&frame, &mut sink) {
                Ok(()) => self.flush(sink),
                Err(err) => {
                    self.flush(sink);
                    if !matches!(err, PeerError::RemoteAbort(_)) {
                        let _ = self
                            .transport
                            .queue_write(rpc::abort(err.error_name(), 0), None);
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(Running::Continue)
    }

    fn flush(&mut self, frames: Vec<Bytes>) {
        for frame in frames {
            if let Err(err) = self.transport.queue_write(frame, None) {
                error!(error = %err, "outbound write failed");
            }
        }
    }
}

fn frame_error_name(err: &FrameError) -> &'static str {
    match err {
        FrameError::Io(_) => "Io",
        FrameError::InvalidFrame => "InvalidFrame",
        FrameError::FrameTooLarge => "FrameTooLarge",
    }
}
