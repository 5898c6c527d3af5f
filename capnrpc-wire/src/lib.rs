#![deny(missing_docs, missing_debug_implementations)]

//! Wire layer for the `capnrpc` session engine.
//!
//! This crate is deliberately independent of any event loop or I/O: it
//! only knows how to turn bytes into frames, frames into messages, and
//! messages into the protocol records the session engine dispatches on.
//!
//! The crate is organized bottom-up:
//!
//! - [`frame`] reassembles length-prefixed segmented frames from a byte
//!   stream and serializes outbound segments, with a bounded reassembly
//!   budget. A [`tokio_util::codec`] adapter is provided for driving the
//!   framer from a `FramedRead`/`FramedWrite` pair.
//! - [`message`] exposes the segmented message arena: struct, list and
//!   any-pointer readers over a decoded frame, and a single-segment
//!   builder with a deep pointer copy primitive.
//! - [`ptr`] holds the raw pointer-word codec shared by readers, the
//!   builder, and the capability walkers in the engine crate.
//! - [`rpc`] encodes and decodes the fifteen RPC message variants along
//!   with cap descriptors, promised answers, and exceptions.

pub mod frame;
pub mod message;
pub mod ptr;
pub mod rpc;

pub use frame::{Frame, FrameCodec, FrameError, Framer};
pub use message::{
    AnyReader, Message, MessageBuilder, MessageError, StructHandle, StructReader,
};
