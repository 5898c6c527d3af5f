//! Outbound capability walking and payload encoding.
//!
//! Before a Call or Return payload is sealed, every capability pointer in
//! its content tree is classified against the sender's tables, interned
//! into a dense cap table in insertion order, and rewritten in place so
//! the encoded id equals its table index. The descriptor list is then
//! written at the payload's cap-table slot.

use std::collections::HashMap;

use capnrpc_wire::message::MessageBuilder;
use capnrpc_wire::ptr::{self, elem, PointerKind};
use capnrpc_wire::rpc::{self, CapDescriptor, PayloadHandle, PromisedAnswer};

use crate::captable::CapTable;
use crate::export::Exports;

/// Limit on pointer nesting while walking a payload.
const MAX_WALK_DEPTH: usize = 64;

/// Errors surfaced while encoding an outbound payload.
#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    /// A capability id does not fit in 30 bits.
    #[error("capability id exceeds 2^30")]
    CapabilityIdTooLarge,

    /// A malformed or out-of-bounds pointer word in the payload.
    #[error("malformed pointer in outbound payload")]
    InvalidPointer,

    /// A receiver-answer id with no entry in the cap table.
    #[error("unknown receiver answer capability")]
    UnknownReceiverAnswerCap,
}

impl OutboundError {
    /// Stable name used as the exception reason on the wire.
    pub fn error_name(&self) -> &'static str {
        match self {
            Self::CapabilityIdTooLarge => "CapabilityIdTooLarge",
            Self::InvalidPointer => "InvalidPointer",
            Self::UnknownReceiverAnswerCap => "UnknownReceiverAnswerCap",
        }
    }
}

/// What the encoder learned about a payload, reported back for
/// downstream bookkeeping (promise resolution, streaming attribution).
#[derive(Debug, Clone, Default)]
pub struct PayloadSummary {
    /// The root content capability's original id, when the content is a
    /// plain capability pointer.
    pub root_cap: Option<u32>,
    /// Export ids this payload added a reference to, in intern order.
    pub exports_referenced: Vec<u32>,
    /// Number of cap-table entries written.
    pub cap_count: usize,
}

/// Collects the word indices of every capability pointer reachable from
/// the pointer word at `root_ptr`.
///
/// Walks struct pointers and list pointers of element size 6 (pointer)
/// and 7 (inline composite); data lists carry no capabilities.
pub fn collect_cap_words(
    b: &MessageBuilder,
    root_ptr: usize,
) -> Result<Vec<usize>, OutboundError> {
    let mut found = Vec::new();
    walk(b, root_ptr, 0, &mut found)?;
    Ok(found)
}

fn walk(
    b: &MessageBuilder,
    loc: usize,
    depth: usize,
    found: &mut Vec<usize>,
) -> Result<(), OutboundError> {
    if depth > MAX_WALK_DEPTH || loc >= b.word_count() {
        return Err(OutboundError::InvalidPointer);
    }
    let word = b.word(loc);
    if word == 0 {
        return Ok(());
    }
    match ptr::kind(word) {
        PointerKind::Struct => {
            let sp = ptr::parse_struct(word);
            let target = target_word(b, loc, sp.offset)?;
            let end = target + sp.data_words as usize + sp.ptr_words as usize;
            if end > b.word_count() {
                return Err(OutboundError::InvalidPointer);
            }
            for i in 0..sp.ptr_words as usize {
                walk(b, target + sp.data_words as usize + i, depth + 1, found)?;
            }
            Ok(())
        }
        PointerKind::List => {
            let lp = ptr::parse_list(word);
            let target = target_word(b, loc, lp.offset)?;
            match lp.elem_size {
                elem::POINTER => {
                    if target + lp.count as usize > b.word_count() {
                        return Err(OutboundError::InvalidPointer);
                    }
                    for i in 0..lp.count as usize {
                        walk(b, target + i, depth + 1, found)?;
                    }
                    Ok(())
                }
                elem::COMPOSITE => {
                    if target + 1 + lp.count as usize > b.word_count() {
                        return Err(OutboundError::InvalidPointer);
                    }
                    let tag = b.word(target);
                    if ptr::kind(tag) != PointerKind::Struct {
                        return Err(OutboundError::InvalidPointer);
                    }
                    let tp = ptr::parse_struct(tag);
                    let count =
                        u32::try_from(tp.offset).map_err(|_| OutboundError::InvalidPointer)?;
                    let stride = tp.data_words as usize + tp.ptr_words as usize;
                    if count as usize * stride > lp.count as usize {
                        return Err(OutboundError::InvalidPointer);
                    }
                    for idx in 0..count as usize {
                        let body = target + 1 + idx * stride;
                        for i in 0..tp.ptr_words as usize {
                            walk(b, body + tp.data_words as usize + i, depth + 1, found)?;
                        }
                    }
                    Ok(())
                }
                _ => Ok(()),
            }
        }
        PointerKind::Far => Err(OutboundError::InvalidPointer),
        PointerKind::Capability => {
            ptr::parse_cap(word).map_err(|_| OutboundError::InvalidPointer)?;
            found.push(loc);
            Ok(())
        }
    }
}

fn target_word(b: &MessageBuilder, loc: usize, offset: i32) -> Result<usize, OutboundError> {
    let target = loc as i64 + 1 + i64::from(offset);
    let target = usize::try_from(target).map_err(|_| OutboundError::InvalidPointer)?;
    if target > b.word_count() {
        return Err(OutboundError::InvalidPointer);
    }
    Ok(target)
}

/// Rewrites every capability pointer under `root_ptr` through `map`.
///
/// `map` receives the original encoded id and returns the replacement,
/// or `None` to null the pointer out. Used when a payload is passed
/// through from an inbound frame and its cap indices must first become
/// local ids.
pub fn rewrite_cap_words<E, F>(b: &mut MessageBuilder, root_ptr: usize, mut map: F) -> Result<(), E>
where
    E: From<OutboundError>,
    F: FnMut(u32) -> Result<Option<u32>, E>,
{
    let cap_words = collect_cap_words(b, root_ptr).map_err(E::from)?;
    for loc in cap_words {
        let id = ptr::parse_cap(b.word(loc))
            .map_err(|_| E::from(OutboundError::InvalidPointer))?;
        match map(id)? {
            None => b.set_word(loc, 0),
            Some(new_id) => {
                let word = ptr::encode_cap(new_id)
                    .map_err(|_| E::from(OutboundError::CapabilityIdTooLarge))?;
                b.set_word(loc, word);
            }
        }
    }
    Ok(())
}

/// Interns and rewrites a payload's capabilities, then writes its cap
/// table.
///
/// Classification precedence for each capability id: receiver-answer,
/// then receiver-hosted (iff the id is imported), then sender-promise
/// (iff marked), then sender-hosted. Sender-side entries add one export
/// reference per distinct id; receiver-answer entries are single-use and
/// leave the cap table when serialized.
pub fn encode_payload(
    b: &mut MessageBuilder,
    payload: &PayloadHandle,
    caps: &mut CapTable,
    exports: &mut Exports,
) -> Result<PayloadSummary, OutboundError> {
    let content_ptr = payload.content_ptr_word();
    let root_word = b.word(content_ptr);
    let root_cap = if root_word != 0 && ptr::kind(root_word) == PointerKind::Capability {
        Some(ptr::parse_cap(root_word).map_err(|_| OutboundError::InvalidPointer)?)
    } else {
        None
    };

    let cap_words = collect_cap_words(b, content_ptr)?;
    let mut interned: HashMap<u32, u32> = HashMap::new();
    let mut descriptors: Vec<CapDescriptor> = Vec::new();
    let mut exports_referenced = Vec::new();

    for loc in cap_words {
        let id = ptr::parse_cap(b.word(loc)).map_err(|_| OutboundError::InvalidPointer)?;
        let dense = match interned.get(&id) {
            Some(dense) => *dense,
            None => {
                let desc = if caps.get_receiver_answer(id).is_some() {
                    let entry = caps
                        .take_receiver_answer(id)
                        .ok_or(OutboundError::UnknownReceiverAnswerCap)?;
                    CapDescriptor::ReceiverAnswer(PromisedAnswer {
                        question_id: entry.question_id,
                        ops: entry.ops,
                    })
                } else if caps.has_import(id) {
                    CapDescriptor::ReceiverHosted { id }
                } else if caps.is_export_promise(id) {
                    exports.ensure(id, true);
                    exports.add_ref(id);
                    exports_referenced.push(id);
                    CapDescriptor::SenderPromise { id }
                } else {
                    exports.add_ref(id);
                    exports_referenced.push(id);
                    CapDescriptor::SenderHosted { id }
                };
                let dense = descriptors.len() as u32;
                interned.insert(id, dense);
                descriptors.push(desc);
                dense
            }
        };
        let word = ptr::encode_cap(dense).map_err(|_| OutboundError::CapabilityIdTooLarge)?;
        b.set_word(loc, word);
    }

    if !descriptors.is_empty() {
        rpc::write_cap_table(b, payload, &descriptors)
            .map_err(|_| OutboundError::InvalidPointer)?;
    }
    Ok(PayloadSummary {
        root_cap,
        exports_referenced,
        cap_count: descriptors.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use capnrpc_wire::rpc::{decode, ReturnBody, RpcMessage};
    use capnrpc_wire::Message;

    #[test]
    fn root_capability_is_interned_and_rewritten() {
        let mut rb = rpc::return_results(5);
        rb.msg
            .set_cap(rb.payload.struct_handle(), rb.payload.content_slot(), 17)
            .unwrap();
        let mut caps = CapTable::default();
        let mut exports = Exports::new(Some(17));

        let summary = encode_payload(&mut rb.msg, &rb.payload, &mut caps, &mut exports).unwrap();
        assert_eq!(summary.root_cap, Some(17));
        assert_eq!(summary.cap_count, 1);
        assert_eq!(summary.exports_referenced, vec![17]);
        assert_eq!(exports.get(17).unwrap().ref_count, 1);

        let msg = Message::parse_frame(rb.msg.into_frame()).unwrap();
        match decode(&msg).unwrap() {
            RpcMessage::Return(r) => match r.body {
                ReturnBody::Results(Some(payload)) => {
                    assert_eq!(
                        payload.content.unwrap().as_capability(),
                        Some(0),
                        "cap index rewritten to dense position"
                    );
                    assert_eq!(
                        payload.cap_table,
                        vec![CapDescriptor::SenderHosted { id: 17 }]
                    );
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn classification_precedence_and_dedup() {
        // Payload with a pointer list holding: import 4, promise export
        // 6, plain export 8, and import 4 again.
        let mut rb = rpc::return_results(1);
        let payload = rb.payload;
        let list = {
            let b = &mut rb.msg;
            b.init_pointer_list(payload.struct_handle(), payload.content_slot(), 4)
        };
        rb.msg.set_list_cap(list, 0, 4).unwrap();
        rb.msg.set_list_cap(list, 1, 6).unwrap();
        rb.msg.set_list_cap(list, 2, 8).unwrap();
        rb.msg.set_list_cap(list, 3, 4).unwrap();

        let mut caps = CapTable::default();
        caps.note_import(4);
        caps.mark_export_promise(6);
        let mut exports = Exports::new(None);
        exports.ensure(6, true);

        let summary = encode_payload(&mut rb.msg, &payload, &mut caps, &mut exports).unwrap();
        assert_eq!(summary.root_cap, None);
        assert_eq!(summary.cap_count, 3);
        assert_eq!(summary.exports_referenced, vec![6, 8]);

        let msg = Message::parse_frame(rb.msg.into_frame()).unwrap();
        match decode(&msg).unwrap() {
            RpcMessage::Return(r) => match r.body {
                ReturnBody::Results(Some(payload)) => {
                    assert_eq!(
                        payload.cap_table,
                        vec![
                            CapDescriptor::ReceiverHosted { id: 4 },
                            CapDescriptor::SenderPromise { id: 6 },
                            CapDescriptor::SenderHosted { id: 8 },
                        ]
                    );
                    let list = payload.content.unwrap().as_list().unwrap();
                    let idx: Vec<u32> = (0..4)
                        .map(|i| {
                            list.get_pointer(i)
                                .unwrap()
                                .unwrap()
                                .as_capability()
                                .unwrap()
                        })
                        .collect();
                    assert_eq!(idx, vec![0, 1, 2, 0], "duplicates share one entry");
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn receiver_answer_entries_are_single_use() {
        let mut caps = CapTable::default();
        let ra_id = caps
            .note_receiver_answer_ops(3, &[capnrpc_wire::rpc::PromisedAnswerOp::Noop])
            .unwrap();
        let mut exports = Exports::new(None);

        let mut rb = rpc::return_results(2);
        rb.msg
            .set_cap(rb.payload.struct_handle(), rb.payload.content_slot(), ra_id)
            .unwrap();
        let summary = encode_payload(&mut rb.msg, &rb.payload, &mut caps, &mut exports).unwrap();
        assert_eq!(summary.cap_count, 1);
        assert!(caps.get_receiver_answer(ra_id).is_none(), "consumed");
    }

    #[test]
    fn empty_payload_writes_no_cap_table() {
        let mut rb = rpc::return_results(9);
        let mut caps = CapTable::default();
        let mut exports = Exports::new(None);
        let summary = encode_payload(&mut rb.msg, &rb.payload, &mut caps, &mut exports).unwrap();
        assert_eq!(summary.cap_count, 0);
        assert!(summary.root_cap.is_none());
    }
}
