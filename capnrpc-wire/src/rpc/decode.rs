//! Inbound message decoding.

use crate::message::{AnyReader, Message, MessageError, StructReader};

use super::layout::*;
use super::{
    Accept, Call, CapDescriptor, DecodeError, Disembargo, DisembargoContext, Exception, Finish,
    Join, JoinKeyPart, MessageTag, MessageTarget, Payload, PromisedAnswer, PromisedAnswerOp,
    Provide, Release, Resolve, ResolveBody, Return, ReturnBody, RpcMessage, SendResultsTo,
    ThirdPartyAnswer, UnimplementedEcho,
};

/// Decodes the root message of a frame into a protocol record.
pub fn decode(msg: &Message) -> Result<RpcMessage<'_>, DecodeError> {
    let root = msg.root_struct()?;
    decode_message_struct(root)
}

fn decode_message_struct(root: StructReader<'_>) -> Result<RpcMessage<'_>, DecodeError> {
    let tag = MessageTag::try_from(root.get_u16(MSG_TAG))?;
    let body = root.get_pointer(MSG_BODY_PTR)?;
    match tag {
        MessageTag::Unimplemented => Ok(RpcMessage::Unimplemented(decode_echo(body)?)),
        MessageTag::Abort => Ok(RpcMessage::Abort(decode_exception(body)?)),
        MessageTag::Call => decode_call(struct_or_empty(body)?).map(RpcMessage::Call),
        MessageTag::Return => decode_return(struct_or_empty(body)?).map(RpcMessage::Return),
        MessageTag::Finish => {
            let s = struct_or_empty(body)?;
            Ok(RpcMessage::Finish(Finish {
                question_id: s.get_u32(FIN_QID),
                release_result_caps: !s.get_bool(FIN_RELEASE_BIT),
                require_early_cancellation_workaround: !s.get_bool(FIN_REQUIRE_EARLY_BIT),
            }))
        }
        MessageTag::Resolve => decode_resolve(struct_or_empty(body)?).map(RpcMessage::Resolve),
        MessageTag::Release => {
            let s = struct_or_empty(body)?;
            Ok(RpcMessage::Release(Release {
                id: s.get_u32(REL_ID),
                reference_count: s.get_u32(REL_COUNT),
            }))
        }
        MessageTag::Bootstrap => {
            let s = struct_or_empty(body)?;
            Ok(RpcMessage::Bootstrap {
                question_id: s.get_u32(BOOT_QID),
            })
        }
        MessageTag::Provide => {
            let s = struct_or_empty(body)?;
            Ok(RpcMessage::Provide(Provide {
                question_id: s.get_u32(PROV_QID),
                target: decode_target_required(s.get_pointer(PROV_TARGET_PTR)?)?,
                recipient: s.get_pointer(PROV_RECIPIENT_PTR)?,
            }))
        }
        MessageTag::Accept => {
            let s = struct_or_empty(body)?;
            Ok(RpcMessage::Accept(Accept {
                question_id: s.get_u32(ACC_QID),
                provision: s.get_pointer(ACC_PROVISION_PTR)?,
                embargo: s.get_bool(ACC_EMBARGO_BIT),
            }))
        }
        MessageTag::Join => decode_join(struct_or_empty(body)?).map(RpcMessage::Join),
        MessageTag::Disembargo => {
            // A null body cannot carry an embargo id at all.
            let s = match body {
                Some(any) => as_struct(any)?,
                None => return Err(DecodeError::MissingEmbargoId),
            };
            decode_disembargo(s).map(RpcMessage::Disembargo)
        }
        MessageTag::ThirdPartyAnswer => {
            let s = struct_or_empty(body)?;
            let completion = s
                .get_pointer(TPA_COMPLETION_PTR)?
                .and_then(|any| any.as_key_bytes())
                .ok_or(DecodeError::MissingThirdPartyCapDescriptor)?;
            Ok(RpcMessage::ThirdPartyAnswer(ThirdPartyAnswer {
                answer_id: s.get_u32(TPA_AID),
                completion_key: completion,
            }))
        }
        MessageTag::ObsoleteSave | MessageTag::ObsoleteDelete => Ok(RpcMessage::Obsolete(tag)),
    }
}

fn as_struct(any: AnyReader<'_>) -> Result<StructReader<'_>, DecodeError> {
    any.as_struct()
        .ok_or(DecodeError::Message(MessageError::UnexpectedPointerType))
}

/// Treats a null pointer as an all-defaults struct, the usual forward
/// compatibility rule.
fn struct_or_empty(body: Option<AnyReader<'_>>) -> Result<StructReader<'_>, DecodeError> {
    match body {
        None => Ok(StructReader::empty()),
        Some(any) => as_struct(any),
    }
}

fn decode_echo(body: Option<AnyReader<'_>>) -> Result<Option<UnimplementedEcho>, DecodeError> {
    let echo_root = match body {
        None => return Ok(None),
        Some(any) => as_struct(any)?,
    };
    // Only one level is inspected: the engine cares which of its own
    // messages bounced, not what that message contained.
    let tag = match MessageTag::try_from(echo_root.get_u16(MSG_TAG)) {
        Ok(tag) => tag,
        Err(_) => return Ok(None),
    };
    let question_id = match tag {
        MessageTag::Bootstrap | MessageTag::Call => {
            let nested = struct_or_empty(echo_root.get_pointer(MSG_BODY_PTR)?)?;
            // Bootstrap and Call both store their question id in the
            // first data slot.
            Some(nested.get_u32(0))
        }
        _ => None,
    };
    Ok(Some(UnimplementedEcho { tag, question_id }))
}

fn decode_call(s: StructReader<'_>) -> Result<Call<'_>, DecodeError> {
    let target = decode_target_required(s.get_pointer(CALL_TARGET_PTR)?)?;
    let params = match s.get_pointer(CALL_PARAMS_PTR)? {
        None => None,
        Some(any) => Some(decode_payload(as_struct(any)?)?),
    };
    let send_results_to = match s.get_u16(CALL_SRT_DISC) {
        SRT_CALLER => SendResultsTo::Caller,
        SRT_YOURSELF => SendResultsTo::Yourself,
        SRT_THIRD_PARTY => SendResultsTo::ThirdParty(s.get_pointer(CALL_THIRD_PARTY_PTR)?),
        _ => return Err(DecodeError::UnexpectedMessage),
    };
    Ok(Call {
        question_id: s.get_u32(CALL_QID),
        interface_id: s.get_u64(CALL_IFACE),
        method_id: s.get_u16(CALL_METHOD),
        target,
        params,
        send_results_to,
        allow_third_party_tail_call: s.get_bool(CALL_ALLOW_TAIL_BIT),
        no_promise_pipelining: s.get_bool(CALL_NO_PIPELINING_BIT),
        only_promise_pipeline: s.get_bool(CALL_ONLY_PIPELINE_BIT),
    })
}

fn decode_return(s: StructReader<'_>) -> Result<Return<'_>, DecodeError> {
    let body = match s.get_u16(RET_DISC) {
        RET_RESULTS => match s.get_pointer(RET_BODY_PTR)? {
            None => ReturnBody::Results(None),
            Some(any) => ReturnBody::Results(Some(decode_payload(as_struct(any)?)?)),
        },
        RET_EXCEPTION => ReturnBody::Exception(decode_exception(s.get_pointer(RET_BODY_PTR)?)?),
        RET_CANCELED => ReturnBody::Canceled,
        RET_SENT_ELSEWHERE => ReturnBody::ResultsSentElsewhere,
        RET_TAKE_FROM_OTHER => ReturnBody::TakeFromOtherQuestion(s.get_u32(RET_TAKE_FROM)),
        RET_ACCEPT_THIRD_PARTY => ReturnBody::AcceptFromThirdParty(s.get_pointer(RET_BODY_PTR)?),
        _ => return Err(DecodeError::UnexpectedMessage),
    };
    Ok(Return {
        answer_id: s.get_u32(RET_AID),
        release_param_caps: !s.get_bool(RET_RELEASE_BIT),
        no_finish_needed: s.get_bool(RET_NO_FINISH_BIT),
        body,
    })
}

fn decode_resolve(s: StructReader<'_>) -> Result<Resolve, DecodeError> {
    let body = match s.get_u16(RES_DISC) {
        RES_CAP => {
            let desc = match s.get_pointer(RES_BODY_PTR)? {
                None => return Err(DecodeError::MissingCapDescriptorId),
                Some(any) => decode_cap_descriptor(as_struct(any)?)?,
            };
            ResolveBody::Cap(desc)
        }
        RES_EXCEPTION => ResolveBody::Exception(decode_exception(s.get_pointer(RES_BODY_PTR)?)?),
        _ => return Err(DecodeError::UnexpectedMessage),
    };
    Ok(Resolve {
        promise_id: s.get_u32(RES_PID),
        body,
    })
}

fn decode_join(s: StructReader<'_>) -> Result<Join, DecodeError> {
    let target = decode_target_required(s.get_pointer(JOIN_TARGET_PTR)?)?;
    let key = match s.get_pointer(JOIN_KEY_PTR)? {
        None => return Err(DecodeError::UnexpectedMessage),
        Some(any) => as_struct(any)?,
    };
    Ok(Join {
        question_id: s.get_u32(JOIN_QID),
        target,
        key_part: JoinKeyPart {
            join_id: key.get_u32(JKP_ID),
            part_count: key.get_u16(JKP_COUNT),
            part_num: key.get_u16(JKP_NUM),
        },
    })
}

fn decode_disembargo(s: StructReader<'_>) -> Result<Disembargo, DecodeError> {
    let target = match s.get_pointer(DIS_TARGET_PTR)? {
        None => None,
        Some(any) => Some(decode_target(as_struct(any)?)?),
    };
    let context = match s.get_u16(DIS_DISC) {
        DIS_SENDER_LOOPBACK => DisembargoContext::SenderLoopback {
            embargo_id: s.get_u32(DIS_ID),
        },
        DIS_RECEIVER_LOOPBACK => DisembargoContext::ReceiverLoopback {
            embargo_id: s.get_u32(DIS_ID),
        },
        DIS_ACCEPT => DisembargoContext::Accept {
            token: s
                .get_pointer(DIS_TOKEN_PTR)?
                .and_then(|any| any.as_key_bytes()),
        },
        DIS_PROVIDE => DisembargoContext::Provide {
            question_id: s.get_u32(DIS_ID),
        },
        _ => return Err(DecodeError::UnexpectedMessage),
    };
    Ok(Disembargo { target, context })
}

fn decode_target_required(body: Option<AnyReader<'_>>) -> Result<MessageTarget, DecodeError> {
    match body {
        None => Err(DecodeError::MissingCallTarget),
        Some(any) => decode_target(as_struct(any)?),
    }
}

fn decode_target(s: StructReader<'_>) -> Result<MessageTarget, DecodeError> {
    match s.get_u16(MT_DISC) {
        MT_IMPORTED => Ok(MessageTarget::ImportedCap(s.get_u32(MT_CAP))),
        MT_PROMISED => {
            let pa = match s.get_pointer(MT_PA_PTR)? {
                None => return Err(DecodeError::MissingPromisedAnswer),
                Some(any) => decode_promised_answer(as_struct(any)?)?,
            };
            Ok(MessageTarget::PromisedAnswer(pa))
        }
        _ => Err(DecodeError::UnexpectedMessage),
    }
}

/// Decodes a promised answer and deep-copies its transform into owned
/// ops.
pub fn decode_promised_answer(s: StructReader<'_>) -> Result<PromisedAnswer, DecodeError> {
    let mut ops = Vec::new();
    if let Some(any) = s.get_pointer(PA_TRANSFORM_PTR)? {
        let list = any
            .as_list()
            .ok_or(DecodeError::Message(MessageError::UnexpectedPointerType))?;
        ops.reserve(list.len() as usize);
        for i in 0..list.len() {
            let op = list
                .get_struct(i)
                .ok_or(DecodeError::Message(MessageError::UnexpectedPointerType))?;
            ops.push(match op.get_u16(OP_DISC) {
                OP_NOOP => PromisedAnswerOp::Noop,
                OP_GET_POINTER_FIELD => PromisedAnswerOp::GetPointerField(op.get_u16(OP_INDEX)),
                _ => return Err(DecodeError::UnexpectedMessage),
            });
        }
    }
    Ok(PromisedAnswer {
        question_id: s.get_u32(PA_QID),
        ops,
    })
}

/// Decodes a payload struct: content pointer plus cap table.
pub fn decode_payload(s: StructReader<'_>) -> Result<Payload<'_>, DecodeError> {
    let content = s.get_pointer(PAYLOAD_CONTENT_PTR)?;
    let mut cap_table = Vec::new();
    if let Some(any) = s.get_pointer(PAYLOAD_CAP_TABLE_PTR)? {
        let list = any
            .as_list()
            .ok_or(DecodeError::Message(MessageError::UnexpectedPointerType))?;
        cap_table.reserve(list.len() as usize);
        for i in 0..list.len() {
            let desc = list
                .get_struct(i)
                .ok_or(DecodeError::Message(MessageError::UnexpectedPointerType))?;
            cap_table.push(decode_cap_descriptor(desc)?);
        }
    }
    Ok(Payload { content, cap_table })
}

/// Decodes a single cap descriptor.
pub fn decode_cap_descriptor(s: StructReader<'_>) -> Result<CapDescriptor, DecodeError> {
    Ok(match s.get_u16(CD_DISC) {
        CD_NONE => CapDescriptor::None,
        CD_SENDER_HOSTED => CapDescriptor::SenderHosted {
            id: s.get_u32(CD_ID),
        },
        CD_SENDER_PROMISE => CapDescriptor::SenderPromise {
            id: s.get_u32(CD_ID),
        },
        CD_RECEIVER_HOSTED => CapDescriptor::ReceiverHosted {
            id: s.get_u32(CD_ID),
        },
        CD_RECEIVER_ANSWER => {
            let pa = match s.get_pointer(CD_BODY_PTR)? {
                None => return Err(DecodeError::MissingPromisedAnswer),
                Some(any) => decode_promised_answer(as_struct(any)?)?,
            };
            CapDescriptor::ReceiverAnswer(pa)
        }
        CD_THIRD_PARTY => {
            let nested = match s.get_pointer(CD_BODY_PTR)? {
                None => return Err(DecodeError::MissingThirdPartyCapDescriptor),
                Some(any) => as_struct(any)?,
            };
            CapDescriptor::ThirdPartyHosted {
                vine_id: nested.get_u32(TPCD_VINE),
            }
        }
        _ => return Err(DecodeError::UnexpectedMessage),
    })
}

fn decode_exception(body: Option<AnyReader<'_>>) -> Result<Exception, DecodeError> {
    let s = struct_or_empty(body)?;
    let reason = match s.get_pointer(EXC_REASON_PTR)? {
        None => String::new(),
        Some(any) => any
            .as_list()
            .and_then(|list| list.text())
            .unwrap_or("")
            .to_owned(),
    };
    let trace = match s.get_pointer(EXC_TRACE_PTR)? {
        None => None,
        Some(any) => any.as_list().and_then(|list| list.text()).map(str::to_owned),
    };
    Ok(Exception {
        reason,
        trace,
        type_value: s.get_u16(EXC_TYPE),
    })
}
