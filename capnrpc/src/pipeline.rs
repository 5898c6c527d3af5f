//! Promise pipeline: walking promised-answer transforms through cached
//! answer frames.
//!
//! The frames walked here are answers this peer sent, so their cap
//! tables are in the outbound flavour: `sender_hosted` entries are our
//! own exports and resolve to local dispatch.

use bytes::Bytes;
use capnrpc_wire::message::{AnyReader, MessageError};
use capnrpc_wire::rpc::{
    self, CapDescriptor, DecodeError, PromisedAnswer, PromisedAnswerOp, ReturnBody, RpcMessage,
};
use capnrpc_wire::Message;

use crate::export::ResolvedCap;

/// Errors surfaced while resolving a promised answer.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The cached answer has no results payload to walk.
    #[error("promised answer has no payload")]
    MissingPayload,

    /// The transform descended through something that is not a struct,
    /// or landed on something that is not a capability.
    #[error("promised answer transform does not reach a capability")]
    BadTransform,

    /// The final capability index is not in the answer's cap table.
    #[error("promised answer capability index unknown")]
    UnknownCapIndex,

    /// The cached frame failed to decode.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Pointer-level failure while walking the payload.
    #[error(transparent)]
    Message(#[from] MessageError),
}

impl PipelineError {
    /// Stable name used as the exception reason on the wire.
    pub fn error_name(&self) -> &'static str {
        match self {
            Self::MissingPayload => "MissingPayload",
            Self::BadTransform => "BadTransform",
            Self::UnknownCapIndex => "UnknownCapIndex",
            Self::Decode(_) => "DecodeError",
            Self::Message(_) => "MessageError",
        }
    }
}

/// Deep-copies the transform out of a decoded promised answer.
pub fn clone_ops_from_promised(promised: &PromisedAnswer) -> Vec<PromisedAnswerOp> {
    promised.ops.clone()
}

/// Deep-copies a transform slice into an owned sequence.
pub fn clone_ops_from_slice(ops: &[PromisedAnswerOp]) -> Vec<PromisedAnswerOp> {
    ops.to_vec()
}

/// Maps a descriptor from a payload *we sent* into a resolved cap.
pub fn resolve_sent_descriptor(desc: &CapDescriptor) -> ResolvedCap {
    match desc {
        CapDescriptor::None => ResolvedCap::None,
        CapDescriptor::SenderHosted { id } | CapDescriptor::SenderPromise { id } => {
            ResolvedCap::Exported { id: *id }
        }
        CapDescriptor::ReceiverHosted { id } => ResolvedCap::Imported { id: *id },
        CapDescriptor::ReceiverAnswer(pa) => ResolvedCap::Promised(pa.clone()),
        CapDescriptor::ThirdPartyHosted { vine_id } => ResolvedCap::Exported { id: *vine_id },
    }
}

/// Walks `ops` through the results payload of a cached answer frame.
///
/// A null pointer anywhere along the way resolves to
/// [`ResolvedCap::None`]; the final pointer must be a capability, which
/// is then looked up in the answer's cap table.
pub fn resolve_promised_answer(
    frame: &Bytes,
    ops: &[PromisedAnswerOp],
) -> Result<ResolvedCap, PipelineError> {
    let msg = Message::parse_frame(frame.clone()).map_err(|_| PipelineError::MissingPayload)?;
    let ret = match rpc::decode(&msg)? {
        RpcMessage::Return(ret) => ret,
        _ => return Err(PipelineError::MissingPayload),
    };
    let payload = match ret.body {
        ReturnBody::Results(Some(payload)) => payload,
        _ => return Err(PipelineError::MissingPayload),
    };

    let mut current = payload.content;
    for op in ops {
        match op {
            PromisedAnswerOp::Noop => {}
            PromisedAnswerOp::GetPointerField(index) => {
                current = match current {
                    None => return Ok(ResolvedCap::None),
                    Some(AnyReader::Struct(reader)) => reader.get_pointer(*index)?,
                    Some(_) => return Err(PipelineError::BadTransform),
                };
            }
        }
    }

    match current {
        None => Ok(ResolvedCap::None),
        Some(AnyReader::Capability(index)) => {
            let desc = payload
                .cap_table
                .get(index as usize)
                .ok_or(PipelineError::UnknownCapIndex)?;
            Ok(resolve_sent_descriptor(desc))
        }
        Some(_) => Err(PipelineError::BadTransform),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captable::CapTable;
    use crate::export::Exports;
    use crate::outbound;

    /// Builds a cached answer whose results struct holds a capability at
    /// pointer slot 1 of a nested struct at slot 0.
    fn cached_answer(cap_id: u32) -> Bytes {
        let mut rb = rpc::return_results(7);
        let payload = rb.payload;
        let root = rb
            .msg
            .init_struct(payload.struct_handle(), payload.content_slot(), 0, 1);
        let inner = rb.msg.init_struct(root, 0, 0, 2);
        rb.msg.set_cap(inner, 1, cap_id).unwrap();
        let mut caps = CapTable::default();
        let mut exports = Exports::new(None);
        outbound::encode_payload(&mut rb.msg, &payload, &mut caps, &mut exports).unwrap();
        rb.msg.into_frame()
    }

    #[test]
    fn transform_descends_to_the_capability() {
        let frame = cached_answer(17);
        let ops = vec![
            PromisedAnswerOp::Noop,
            PromisedAnswerOp::GetPointerField(0),
            PromisedAnswerOp::GetPointerField(1),
        ];
        let cap = resolve_promised_answer(&frame, &ops).unwrap();
        assert_eq!(cap, ResolvedCap::Exported { id: 17 });
    }

    #[test]
    fn null_intermediate_resolves_to_none() {
        let frame = cached_answer(17);
        // Slot 1 of the outer struct does not exist.
        let ops = vec![
            PromisedAnswerOp::GetPointerField(5),
            PromisedAnswerOp::GetPointerField(0),
        ];
        let cap = resolve_promised_answer(&frame, &ops).unwrap();
        assert_eq!(cap, ResolvedCap::None);
    }

    #[test]
    fn landing_on_a_struct_is_an_error() {
        let frame = cached_answer(17);
        let ops = vec![PromisedAnswerOp::GetPointerField(0)];
        assert!(matches!(
            resolve_promised_answer(&frame, &ops),
            Err(PipelineError::BadTransform)
        ));
    }

    #[test]
    fn exception_answer_has_no_payload() {
        let frame = rpc::return_exception(7, "nope");
        assert!(matches!(
            resolve_promised_answer(&frame, &[]),
            Err(PipelineError::MissingPayload)
        ));
    }

    #[test]
    fn sent_descriptor_flavour() {
        assert_eq!(
            resolve_sent_descriptor(&CapDescriptor::SenderHosted { id: 1 }),
            ResolvedCap::Exported { id: 1 }
        );
        assert_eq!(
            resolve_sent_descriptor(&CapDescriptor::ReceiverHosted { id: 2 }),
            ResolvedCap::Imported { id: 2 }
        );
        assert_eq!(
            resolve_sent_descriptor(&CapDescriptor::None),
            ResolvedCap::None
        );
    }
}
