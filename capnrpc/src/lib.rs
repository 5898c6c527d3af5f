#![deny(missing_docs, missing_debug_implementations)]

//! A level-3 Cap'n Proto RPC session engine based on tokio.
//!
//! One [`Peer`] holds the full per-connection state machine: the
//! capability table, questions and answers, promise resolution with
//! embargoes, third-party handoff, and the forwarded-return translator.
//! Client and server roles collapse into the single symmetric peer;
//! there is no separate listener state machine.
//!
//! The crate is layered the way the wire flows:
//!
//! - [`captable`], [`export`]: the capability tables.
//! - [`inbound`], [`outbound`]: descriptor resolution and the payload
//!   walkers that rewrite capability pointers in place.
//! - [`pipeline`]: promised-answer transforms over cached answers.
//! - [`peer`]: the state machine and its per-tag handlers.
//! - [`streaming`]: per-client flow control.
//! - [`transport`]: the async read/write/close contract the engine
//!   consumes, with an in-memory implementation.
//! - [`connection`]: binds framer, transport, and peer into a running
//!   event loop.
//!
//! Framing and the protocol codec live in the sibling `capnrpc-wire`
//! crate, re-exported here as [`wire`].
//!
//! # Driving a peer directly
//!
//! The peer is synchronous and single-threaded; tests and embeddings can
//! drive it without any runtime:
//!
//! ```rust
//! use capnrpc::peer::Peer;
//! use capnrpc::wire::{rpc, Frame};
//! use bytes::Bytes;
//!
//! let mut peer = Peer::builder().bootstrap_export_id(17).build();
//! let mut sink: Vec<Bytes> = Vec::new();
//!
//! let frame = Frame::parse(rpc::bootstrap(5)).unwrap();
//! peer.handle_frame(&frame, &mut sink).unwrap();
//! assert_eq!(sink.len(), 1); // the bootstrap Return
//! assert_eq!(peer.export_ref_count(17), Some(1));
//! ```

pub mod captable;
pub mod connection;
pub mod export;
pub mod inbound;
pub mod outbound;
pub mod peer;
pub mod pipeline;
pub mod streaming;
pub mod transport;

pub use capnrpc_wire as wire;

pub use connection::{Connection, ConnectionError};
pub use export::ResolvedCap;
pub use peer::{
    CallHandler, CallRequest, ForwardMode, FrameSink, HostError, InboundCall, Peer, PeerBuilder,
    PeerError, PeerStats, ReturnHandler, ReturnOutcome,
};
pub use transport::{mem_pair, MemTransport, Transport, TransportError};
