//! Constructor-style message builders.
//!
//! Simple variants serialize in one shot and hand back the finished
//! frame. Call and Return-with-results hand back a builder pair instead,
//! because their payloads must pass through the outbound capability
//! walker before the frame is sealed.

use bytes::Bytes;

use crate::message::{AnyReader, Message, MessageBuilder, MessageError, StructHandle};

use super::layout::*;
use super::{CapDescriptor, JoinKeyPart, MessageTag, MessageTarget, PromisedAnswer, PromisedAnswerOp};

fn msg_root(b: &mut MessageBuilder, tag: MessageTag) -> StructHandle {
    let root = b.init_root(MSG_DATA, MSG_PTRS);
    b.set_u16(root, MSG_TAG, tag as u16);
    root
}

fn msg_body(b: &mut MessageBuilder, root: StructHandle, data: u16, ptrs: u16) -> StructHandle {
    b.init_struct(root, MSG_BODY_PTR, data, ptrs)
}

fn write_exception(b: &mut MessageBuilder, parent: StructHandle, slot: u16, reason: &str, type_value: u16) {
    let exc = b.init_struct(parent, slot, EXC_DATA, EXC_PTRS);
    b.set_u16(exc, EXC_TYPE, type_value);
    b.set_text(exc, EXC_REASON_PTR, reason);
}

/// Writes a promised answer (question id plus transform) into `slot` of
/// `parent`.
pub(crate) fn write_promised_answer(
    b: &mut MessageBuilder,
    parent: StructHandle,
    slot: u16,
    pa: &PromisedAnswer,
) {
    let s = b.init_struct(parent, slot, PA_DATA, PA_PTRS);
    b.set_u32(s, PA_QID, pa.question_id);
    let ops = b.init_composite_list(s, PA_TRANSFORM_PTR, pa.ops.len() as u32, OP_DATA, OP_PTRS);
    for (i, op) in pa.ops.iter().enumerate() {
        let elem = b.composite_elem(ops, i as u32);
        match op {
            PromisedAnswerOp::Noop => b.set_u16(elem, OP_DISC, OP_NOOP),
            PromisedAnswerOp::GetPointerField(index) => {
                b.set_u16(elem, OP_DISC, OP_GET_POINTER_FIELD);
                b.set_u16(elem, OP_INDEX, *index);
            }
        }
    }
}

fn write_target(b: &mut MessageBuilder, parent: StructHandle, slot: u16, target: &MessageTarget) {
    let s = b.init_struct(parent, slot, MT_DATA, MT_PTRS);
    match target {
        MessageTarget::ImportedCap(id) => {
            b.set_u16(s, MT_DISC, MT_IMPORTED);
            b.set_u32(s, MT_CAP, *id);
        }
        MessageTarget::PromisedAnswer(pa) => {
            b.set_u16(s, MT_DISC, MT_PROMISED);
            write_promised_answer(b, s, MT_PA_PTR, pa);
        }
    }
}

/// Writes one cap descriptor into an already-initialized descriptor
/// struct (the walker allocates the cap-table list and fills it entry by
/// entry).
pub fn write_cap_descriptor(
    b: &mut MessageBuilder,
    s: StructHandle,
    desc: &CapDescriptor,
) -> Result<(), MessageError> {
    match desc {
        CapDescriptor::None => b.set_u16(s, CD_DISC, CD_NONE),
        CapDescriptor::SenderHosted { id } => {
            b.set_u16(s, CD_DISC, CD_SENDER_HOSTED);
            b.set_u32(s, CD_ID, *id);
        }
        CapDescriptor::SenderPromise { id } => {
            b.set_u16(s, CD_DISC, CD_SENDER_PROMISE);
            b.set_u32(s, CD_ID, *id);
        }
        CapDescriptor::ReceiverHosted { id } => {
            b.set_u16(s, CD_DISC, CD_RECEIVER_HOSTED);
            b.set_u32(s, CD_ID, *id);
        }
        CapDescriptor::ReceiverAnswer(pa) => {
            b.set_u16(s, CD_DISC, CD_RECEIVER_ANSWER);
            write_promised_answer(b, s, CD_BODY_PTR, pa);
        }
        CapDescriptor::ThirdPartyHosted { vine_id } => {
            b.set_u16(s, CD_DISC, CD_THIRD_PARTY);
            let nested = b.init_struct(s, CD_BODY_PTR, TPCD_DATA, TPCD_PTRS);
            b.set_u32(nested, TPCD_VINE, *vine_id);
        }
    }
    Ok(())
}

/// Writes a payload's cap-table list in one shot, one descriptor per
/// interned entry in index order.
pub fn write_cap_table(
    b: &mut MessageBuilder,
    payload: &PayloadHandle,
    descriptors: &[CapDescriptor],
) -> Result<(), MessageError> {
    let list = b.init_composite_list(
        payload.strct,
        PAYLOAD_CAP_TABLE_PTR,
        descriptors.len() as u32,
        CD_DATA,
        CD_PTRS,
    );
    for (i, desc) in descriptors.iter().enumerate() {
        let elem = b.composite_elem(list, i as u32);
        write_cap_descriptor(b, elem, desc)?;
    }
    Ok(())
}

/// Handle to a payload struct whose content and cap table are filled
/// after construction.
#[derive(Debug, Clone, Copy)]
pub struct PayloadHandle {
    strct: StructHandle,
}

impl PayloadHandle {
    /// The payload struct itself.
    pub fn struct_handle(&self) -> StructHandle {
        self.strct
    }

    /// Pointer slot of the content any-pointer.
    pub fn content_slot(&self) -> u16 {
        PAYLOAD_CONTENT_PTR
    }

    /// Pointer slot of the cap-table list.
    pub fn cap_table_slot(&self) -> u16 {
        PAYLOAD_CAP_TABLE_PTR
    }

    /// Absolute word index of the content pointer, for the walker.
    pub fn content_ptr_word(&self) -> usize {
        self.strct.pointer_word(PAYLOAD_CONTENT_PTR)
    }
}

/// In-progress Call message.
#[derive(Debug)]
pub struct CallBuilder {
    /// Backing message builder.
    pub msg: MessageBuilder,
    /// The Call struct.
    pub call: StructHandle,
    /// The params payload.
    pub payload: PayloadHandle,
}

/// Starts a Call message addressed to `target`.
pub fn call(
    question_id: u32,
    interface_id: u64,
    method_id: u16,
    target: &MessageTarget,
) -> CallBuilder {
    let mut b = MessageBuilder::new();
    let root = msg_root(&mut b, MessageTag::Call);
    let s = msg_body(&mut b, root, CALL_DATA, CALL_PTRS);
    b.set_u32(s, CALL_QID, question_id);
    b.set_u64(s, CALL_IFACE, interface_id);
    b.set_u16(s, CALL_METHOD, method_id);
    b.set_u16(s, CALL_SRT_DISC, SRT_CALLER);
    write_target(&mut b, s, CALL_TARGET_PTR, target);
    let payload = b.init_struct(s, CALL_PARAMS_PTR, PAYLOAD_DATA, PAYLOAD_PTRS);
    CallBuilder {
        msg: b,
        call: s,
        payload: PayloadHandle { strct: payload },
    }
}

impl CallBuilder {
    /// Routes results back to the caller as a tail answer.
    pub fn send_results_to_yourself(&mut self) {
        self.msg.set_u16(self.call, CALL_SRT_DISC, SRT_YOURSELF);
    }

    /// Routes results to a third party described by `handle`.
    pub fn send_results_to_third_party(
        &mut self,
        handle: Option<&AnyReader<'_>>,
    ) -> Result<(), MessageError> {
        self.msg.set_u16(self.call, CALL_SRT_DISC, SRT_THIRD_PARTY);
        if let Some(src) = handle {
            self.msg
                .copy_into_slot(self.call, CALL_THIRD_PARTY_PTR, src)?;
        }
        Ok(())
    }

    /// Sets the allow-third-party-tail-call flag.
    pub fn allow_third_party_tail_call(&mut self, allow: bool) {
        self.msg.set_bool(self.call, CALL_ALLOW_TAIL_BIT, allow);
    }

    /// Sets the no-promise-pipelining flag.
    pub fn no_promise_pipelining(&mut self, value: bool) {
        self.msg.set_bool(self.call, CALL_NO_PIPELINING_BIT, value);
    }

    /// Sets the only-promise-pipeline flag.
    pub fn only_promise_pipeline(&mut self, value: bool) {
        self.msg.set_bool(self.call, CALL_ONLY_PIPELINE_BIT, value);
    }
}

/// In-progress Return-with-results message.
#[derive(Debug)]
pub struct ReturnBuilder {
    /// Backing message builder.
    pub msg: MessageBuilder,
    /// The Return struct.
    pub ret: StructHandle,
    /// The results payload.
    pub payload: PayloadHandle,
}

fn return_root(b: &mut MessageBuilder, answer_id: u32, disc: u16) -> StructHandle {
    let root = msg_root(b, MessageTag::Return);
    let s = msg_body(b, root, RET_DATA, RET_PTRS);
    b.set_u32(s, RET_AID, answer_id);
    b.set_u16(s, RET_DISC, disc);
    // Param caps are settled through aggregated Release messages, never
    // through the return flag. The bit is stored inverted on the wire.
    b.set_bool(s, RET_RELEASE_BIT, true);
    s
}

/// Starts a Return carrying results.
pub fn return_results(answer_id: u32) -> ReturnBuilder {
    let mut b = MessageBuilder::new();
    let s = return_root(&mut b, answer_id, RET_RESULTS);
    let payload = b.init_struct(s, RET_BODY_PTR, PAYLOAD_DATA, PAYLOAD_PTRS);
    ReturnBuilder {
        msg: b,
        ret: s,
        payload: PayloadHandle { strct: payload },
    }
}

impl ReturnBuilder {
    /// Tells the caller no Finish is required for this answer.
    pub fn no_finish_needed(&mut self) {
        self.msg.set_bool(self.ret, RET_NO_FINISH_BIT, true);
    }
}

/// Return carrying an exception with the given reason.
pub fn return_exception(answer_id: u32, reason: &str) -> Bytes {
    let mut b = MessageBuilder::new();
    let s = return_root(&mut b, answer_id, RET_EXCEPTION);
    write_exception(&mut b, s, RET_BODY_PTR, reason, 0);
    b.into_frame()
}

/// Return reporting cancellation.
pub fn return_canceled(answer_id: u32) -> Bytes {
    let mut b = MessageBuilder::new();
    return_root(&mut b, answer_id, RET_CANCELED);
    b.into_frame()
}

/// Return reporting that results went elsewhere.
pub fn return_results_sent_elsewhere(answer_id: u32) -> Bytes {
    let mut b = MessageBuilder::new();
    return_root(&mut b, answer_id, RET_SENT_ELSEWHERE);
    b.into_frame()
}

/// Return redirecting the caller to another of its own questions.
pub fn return_take_from_other_question(answer_id: u32, other_question_id: u32) -> Bytes {
    let mut b = MessageBuilder::new();
    let s = return_root(&mut b, answer_id, RET_TAKE_FROM_OTHER);
    b.set_u32(s, RET_TAKE_FROM, other_question_id);
    b.into_frame()
}

/// Return announcing a third-party handoff, carrying the completion
/// handle.
pub fn return_accept_from_third_party(
    answer_id: u32,
    completion: Option<&AnyReader<'_>>,
) -> Result<Bytes, MessageError> {
    let mut b = MessageBuilder::new();
    let s = return_root(&mut b, answer_id, RET_ACCEPT_THIRD_PARTY);
    if let Some(src) = completion {
        b.copy_into_slot(s, RET_BODY_PTR, src)?;
    }
    Ok(b.into_frame())
}

/// Bootstrap request.
pub fn bootstrap(question_id: u32) -> Bytes {
    let mut b = MessageBuilder::new();
    let root = msg_root(&mut b, MessageTag::Bootstrap);
    let s = msg_body(&mut b, root, BOOT_DATA, BOOT_PTRS);
    b.set_u32(s, BOOT_QID, question_id);
    b.into_frame()
}

/// Finish for a question.
pub fn finish(question_id: u32, release_result_caps: bool) -> Bytes {
    let mut b = MessageBuilder::new();
    let root = msg_root(&mut b, MessageTag::Finish);
    let s = msg_body(&mut b, root, FIN_DATA, FIN_PTRS);
    b.set_u32(s, FIN_QID, question_id);
    b.set_bool(s, FIN_RELEASE_BIT, !release_result_caps);
    // require_early_cancellation_workaround defaults to true, which the
    // inverted encoding spells as a cleared bit.
    b.into_frame()
}

/// Release of `count` references on an import.
pub fn release(id: u32, count: u32) -> Bytes {
    let mut b = MessageBuilder::new();
    let root = msg_root(&mut b, MessageTag::Release);
    let s = msg_body(&mut b, root, REL_DATA, REL_PTRS);
    b.set_u32(s, REL_ID, id);
    b.set_u32(s, REL_COUNT, count);
    b.into_frame()
}

/// Resolve of a promise export to a capability.
pub fn resolve_cap(promise_id: u32, desc: &CapDescriptor) -> Result<Bytes, MessageError> {
    let mut b = MessageBuilder::new();
    let root = msg_root(&mut b, MessageTag::Resolve);
    let s = msg_body(&mut b, root, RES_DATA, RES_PTRS);
    b.set_u32(s, RES_PID, promise_id);
    b.set_u16(s, RES_DISC, RES_CAP);
    let body = b.init_struct(s, RES_BODY_PTR, CD_DATA, CD_PTRS);
    write_cap_descriptor(&mut b, body, desc)?;
    Ok(b.into_frame())
}

/// Resolve of a promise export to an exception.
pub fn resolve_exception(promise_id: u32, reason: &str) -> Bytes {
    let mut b = MessageBuilder::new();
    let root = msg_root(&mut b, MessageTag::Resolve);
    let s = msg_body(&mut b, root, RES_DATA, RES_PTRS);
    b.set_u32(s, RES_PID, promise_id);
    b.set_u16(s, RES_DISC, RES_EXCEPTION);
    write_exception(&mut b, s, RES_BODY_PTR, reason, 0);
    b.into_frame()
}

/// Abort with a reason; the connection is torn down after sending.
pub fn abort(reason: &str, type_value: u16) -> Bytes {
    let mut b = MessageBuilder::new();
    let root = msg_root(&mut b, MessageTag::Abort);
    write_exception(&mut b, root, MSG_BODY_PTR, reason, type_value);
    b.into_frame()
}

fn disembargo_loopback(target: &MessageTarget, embargo_id: u32, disc: u16) -> Bytes {
    let mut b = MessageBuilder::new();
    let root = msg_root(&mut b, MessageTag::Disembargo);
    let s = msg_body(&mut b, root, DIS_DATA, DIS_PTRS);
    b.set_u32(s, DIS_ID, embargo_id);
    b.set_u16(s, DIS_DISC, disc);
    write_target(&mut b, s, DIS_TARGET_PTR, target);
    b.into_frame()
}

/// Disembargo opening a loopback embargo.
pub fn disembargo_sender_loopback(target: &MessageTarget, embargo_id: u32) -> Bytes {
    disembargo_loopback(target, embargo_id, DIS_SENDER_LOOPBACK)
}

/// Disembargo echoing a sender loopback.
pub fn disembargo_receiver_loopback(target: &MessageTarget, embargo_id: u32) -> Bytes {
    disembargo_loopback(target, embargo_id, DIS_RECEIVER_LOOPBACK)
}

/// Disembargo releasing embargoed Accepts queued under `token`.
pub fn disembargo_accept(token: &[u8]) -> Bytes {
    let mut b = MessageBuilder::new();
    let root = msg_root(&mut b, MessageTag::Disembargo);
    let s = msg_body(&mut b, root, DIS_DATA, DIS_PTRS);
    b.set_u16(s, DIS_DISC, DIS_ACCEPT);
    b.set_byte_list(s, DIS_TOKEN_PTR, token);
    b.into_frame()
}

/// Provide of `target` under an opaque recipient key.
pub fn provide(question_id: u32, target: &MessageTarget, recipient_key: &[u8]) -> Bytes {
    let mut b = MessageBuilder::new();
    let root = msg_root(&mut b, MessageTag::Provide);
    let s = msg_body(&mut b, root, PROV_DATA, PROV_PTRS);
    b.set_u32(s, PROV_QID, question_id);
    write_target(&mut b, s, PROV_TARGET_PTR, target);
    b.set_byte_list(s, PROV_RECIPIENT_PTR, recipient_key);
    b.into_frame()
}

/// Accept naming a provision by its opaque key.
pub fn accept(question_id: u32, provision_key: &[u8], embargo: bool) -> Bytes {
    let mut b = MessageBuilder::new();
    let root = msg_root(&mut b, MessageTag::Accept);
    let s = msg_body(&mut b, root, ACC_DATA, ACC_PTRS);
    b.set_u32(s, ACC_QID, question_id);
    b.set_bool(s, ACC_EMBARGO_BIT, embargo);
    b.set_byte_list(s, ACC_PROVISION_PTR, provision_key);
    b.into_frame()
}

/// Join part for level-4 bookkeeping.
pub fn join(question_id: u32, target: &MessageTarget, part: JoinKeyPart) -> Bytes {
    let mut b = MessageBuilder::new();
    let root = msg_root(&mut b, MessageTag::Join);
    let s = msg_body(&mut b, root, JOIN_DATA, JOIN_PTRS);
    b.set_u32(s, JOIN_QID, question_id);
    write_target(&mut b, s, JOIN_TARGET_PTR, target);
    let key = b.init_struct(s, JOIN_KEY_PTR, JKP_DATA, JKP_PTRS);
    b.set_u32(key, JKP_ID, part.join_id);
    b.set_u16(key, JKP_COUNT, part.part_count);
    b.set_u16(key, JKP_NUM, part.part_num);
    b.into_frame()
}

/// ThirdPartyAnswer adopting `answer_id` under a completion key.
pub fn third_party_answer(answer_id: u32, completion_key: &[u8]) -> Bytes {
    let mut b = MessageBuilder::new();
    let root = msg_root(&mut b, MessageTag::ThirdPartyAnswer);
    let s = msg_body(&mut b, root, TPA_DATA, TPA_PTRS);
    b.set_u32(s, TPA_AID, answer_id);
    b.set_byte_list(s, TPA_COMPLETION_PTR, completion_key);
    b.into_frame()
}

/// Unimplemented reply echoing the offending message.
pub fn unimplemented_echo(original: &Message) -> Result<Bytes, MessageError> {
    let mut b = MessageBuilder::new();
    let root = msg_root(&mut b, MessageTag::Unimplemented);
    if let Some(src) = original.root()? {
        b.copy_into_slot(root, MSG_BODY_PTR, &src)?;
    }
    Ok(b.into_frame())
}

#[cfg(test)]
mod tests {
    use super::super::{decode, ResolveBody, ReturnBody, RpcMessage, SendResultsTo};
    use super::*;

    fn parse(bytes: Bytes) -> Message {
        Message::parse_frame(bytes).unwrap()
    }

    #[test]
    fn bootstrap_round_trip() {
        let msg = parse(bootstrap(5));
        match decode(&msg).unwrap() {
            RpcMessage::Bootstrap { question_id } => assert_eq!(question_id, 5),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn finish_inverted_bits() {
        let msg = parse(finish(9, true));
        match decode(&msg).unwrap() {
            RpcMessage::Finish(f) => {
                assert_eq!(f.question_id, 9);
                assert!(f.release_result_caps);
                assert!(f.require_early_cancellation_workaround);
            }
            other => panic!("unexpected {other:?}"),
        }

        let msg = parse(finish(9, false));
        match decode(&msg).unwrap() {
            RpcMessage::Finish(f) => assert!(!f.release_result_caps),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn return_exception_round_trip() {
        let msg = parse(return_exception(7, "promise broken"));
        match decode(&msg).unwrap() {
            RpcMessage::Return(r) => {
                assert_eq!(r.answer_id, 7);
                assert!(!r.release_param_caps);
                match r.body {
                    ReturnBody::Exception(e) => assert_eq!(e.reason, "promise broken"),
                    other => panic!("unexpected {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn return_take_from_other_question_round_trip() {
        let msg = parse(return_take_from_other_question(3, 44));
        match decode(&msg).unwrap() {
            RpcMessage::Return(r) => match r.body {
                ReturnBody::TakeFromOtherQuestion(q) => assert_eq!(q, 44),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn call_round_trip_with_flags() {
        let target = MessageTarget::PromisedAnswer(PromisedAnswer {
            question_id: 12,
            ops: vec![PromisedAnswerOp::Noop, PromisedAnswerOp::GetPointerField(2)],
        });
        let mut cb = call(100, 0xdead_beef_dead_beef, 4, &target);
        cb.send_results_to_yourself();
        cb.allow_third_party_tail_call(true);
        let msg = parse(cb.msg.into_frame());
        match decode(&msg).unwrap() {
            RpcMessage::Call(c) => {
                assert_eq!(c.question_id, 100);
                assert_eq!(c.interface_id, 0xdead_beef_dead_beef);
                assert_eq!(c.method_id, 4);
                assert!(matches!(c.send_results_to, SendResultsTo::Yourself));
                assert!(c.allow_third_party_tail_call);
                assert!(!c.no_promise_pipelining);
                match c.target {
                    MessageTarget::PromisedAnswer(pa) => {
                        assert_eq!(pa.question_id, 12);
                        assert_eq!(
                            pa.ops,
                            vec![PromisedAnswerOp::Noop, PromisedAnswerOp::GetPointerField(2)]
                        );
                    }
                    other => panic!("unexpected {other:?}"),
                }
                let params = c.params.expect("params payload");
                assert!(params.content.is_none());
                assert!(params.cap_table.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn resolve_round_trip() {
        let msg = parse(
            resolve_cap(9, &CapDescriptor::SenderHosted { id: 42 }).unwrap(),
        );
        match decode(&msg).unwrap() {
            RpcMessage::Resolve(r) => {
                assert_eq!(r.promise_id, 9);
                match r.body {
                    ResolveBody::Cap(CapDescriptor::SenderHosted { id }) => assert_eq!(id, 42),
                    other => panic!("unexpected {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }

        let msg = parse(resolve_exception(9, "gone"));
        match decode(&msg).unwrap() {
            RpcMessage::Resolve(r) => match r.body {
                ResolveBody::Exception(e) => assert_eq!(e.reason, "gone"),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn disembargo_round_trips() {
        use super::super::DisembargoContext;

        let target = MessageTarget::ImportedCap(9);
        let msg = parse(disembargo_sender_loopback(&target, 77));
        match decode(&msg).unwrap() {
            RpcMessage::Disembargo(d) => {
                assert!(matches!(
                    d.context,
                    DisembargoContext::SenderLoopback { embargo_id: 77 }
                ));
                assert_eq!(d.target, Some(MessageTarget::ImportedCap(9)));
            }
            other => panic!("unexpected {other:?}"),
        }

        let msg = parse(disembargo_accept(b"tok"));
        match decode(&msg).unwrap() {
            RpcMessage::Disembargo(d) => match d.context {
                DisembargoContext::Accept { token } => {
                    assert_eq!(token.as_deref(), Some(&b"tok"[..]))
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn provide_accept_third_party_answer_round_trip() {
        let msg = parse(provide(8, &MessageTarget::ImportedCap(3), b"K"));
        match decode(&msg).unwrap() {
            RpcMessage::Provide(p) => {
                assert_eq!(p.question_id, 8);
                assert_eq!(
                    p.recipient.and_then(|any| any.as_key_bytes()),
                    Some(b"K".to_vec())
                );
            }
            other => panic!("unexpected {other:?}"),
        }

        let msg = parse(accept(21, b"K", true));
        match decode(&msg).unwrap() {
            RpcMessage::Accept(a) => {
                assert_eq!(a.question_id, 21);
                assert!(a.embargo);
                assert_eq!(
                    a.provision.and_then(|any| any.as_key_bytes()),
                    Some(b"K".to_vec())
                );
            }
            other => panic!("unexpected {other:?}"),
        }

        let msg = parse(third_party_answer(0x4000_0022, b"K"));
        match decode(&msg).unwrap() {
            RpcMessage::ThirdPartyAnswer(t) => {
                assert_eq!(t.answer_id, 0x4000_0022);
                assert_eq!(t.completion_key, b"K".to_vec());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unimplemented_echo_reports_question() {
        let original = parse(bootstrap(41));
        let msg = parse(unimplemented_echo(&original).unwrap());
        match decode(&msg).unwrap() {
            RpcMessage::Unimplemented(Some(echo)) => {
                assert_eq!(echo.tag, MessageTag::Bootstrap);
                assert_eq!(echo.question_id, Some(41));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn abort_round_trip() {
        let msg = parse(abort("bye", 3));
        match decode(&msg).unwrap() {
            RpcMessage::Abort(e) => {
                assert_eq!(e.reason, "bye");
                assert_eq!(e.type_value, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn join_round_trip() {
        let part = JoinKeyPart {
            join_id: 6,
            part_count: 2,
            part_num: 1,
        };
        let msg = parse(join(30, &MessageTarget::ImportedCap(1), part));
        match decode(&msg).unwrap() {
            RpcMessage::Join(j) => {
                assert_eq!(j.question_id, 30);
                assert_eq!(j.key_part, part);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
