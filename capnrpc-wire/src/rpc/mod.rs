//! Protocol records for the fifteen RPC message variants, with the
//! decoder and the constructor-style builders.
//!
//! Decoding borrows the backing [`Message`](crate::message::Message):
//! payload bodies stay as raw pointer readers so the engine can walk and
//! copy them without an intermediate tree. The small structured pieces
//! (targets, cap descriptors, promised answers, exceptions) decode into
//! owned records because the engine stores them in its state maps.
//!
//! Several booleans are stored negated on the wire so that an all-zero
//! data word decodes to their `true` defaults. The records here carry the
//! logical values; only this module knows about the inversion.

mod build;
mod decode;

pub use build::{
    abort, accept, bootstrap, call, disembargo_accept, disembargo_receiver_loopback,
    disembargo_sender_loopback, finish, join, provide, release, resolve_cap, resolve_exception,
    return_accept_from_third_party, return_canceled, return_exception, return_results,
    return_results_sent_elsewhere, return_take_from_other_question, third_party_answer,
    unimplemented_echo, write_cap_descriptor, write_cap_table, CallBuilder, PayloadHandle,
    ReturnBuilder,
};
pub use decode::decode;

use crate::message::{AnyReader, MessageError};

/// Message discriminants, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageTag {
    /// Echo of a message the peer did not understand.
    Unimplemented = 0,
    /// Fatal connection teardown with a reason.
    Abort = 1,
    /// Method invocation on a capability.
    Call = 2,
    /// Answer to a question.
    Return = 3,
    /// Caller is done with a question.
    Finish = 4,
    /// A promise export settled.
    Resolve = 5,
    /// Import reference counts dropped.
    Release = 6,
    /// Obsolete; never handled.
    ObsoleteSave = 7,
    /// Request for the vat's bootstrap capability.
    Bootstrap = 8,
    /// Obsolete; never handled.
    ObsoleteDelete = 9,
    /// First half of a third-party handoff.
    Provide = 10,
    /// Second half of a third-party handoff.
    Accept = 11,
    /// Level-4 join bookkeeping.
    Join = 12,
    /// Embargo control.
    Disembargo = 13,
    /// Third party takes over an answer.
    ThirdPartyAnswer = 14,
}

impl TryFrom<u16> for MessageTag {
    type Error = DecodeError;

    fn try_from(value: u16) -> Result<Self, DecodeError> {
        Ok(match value {
            0 => Self::Unimplemented,
            1 => Self::Abort,
            2 => Self::Call,
            3 => Self::Return,
            4 => Self::Finish,
            5 => Self::Resolve,
            6 => Self::Release,
            7 => Self::ObsoleteSave,
            8 => Self::Bootstrap,
            9 => Self::ObsoleteDelete,
            10 => Self::Provide,
            11 => Self::Accept,
            12 => Self::Join,
            13 => Self::Disembargo,
            14 => Self::ThirdPartyAnswer,
            other => return Err(DecodeError::InvalidMessageTag(other)),
        })
    }
}

/// Errors surfaced while decoding an inbound message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The root discriminant is not one of the fifteen variants.
    #[error("unknown message discriminant {0}")]
    InvalidMessageTag(u16),

    /// A discriminant or nested union value this engine cannot act on.
    #[error("message field not expected in this context")]
    UnexpectedMessage,

    /// A Call or Provide without a target.
    #[error("call target is missing")]
    MissingCallTarget,

    /// A promised-answer pointer that the schema requires is null.
    #[error("promised answer is missing")]
    MissingPromisedAnswer,

    /// A cap descriptor without its body.
    #[error("cap descriptor id is missing")]
    MissingCapDescriptorId,

    /// A third-party descriptor or completion key that is required is
    /// null.
    #[error("third party cap descriptor is missing")]
    MissingThirdPartyCapDescriptor,

    /// A Disembargo with no body to carry its embargo id.
    #[error("embargo id is missing")]
    MissingEmbargoId,

    /// Pointer-level decode failure.
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Exception record: reason text, optional trace, and the numeric type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Exception {
    /// Human-readable reason.
    pub reason: String,
    /// Optional stack trace from the throwing vat.
    pub trace: Option<String>,
    /// Numeric exception type.
    pub type_value: u16,
}

impl Exception {
    /// Creates a failure exception with the given reason.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            trace: None,
            type_value: 0,
        }
    }
}

/// One step of a promised-answer transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromisedAnswerOp {
    /// Identity step.
    Noop,
    /// Descend into the given pointer slot of the current struct.
    GetPointerField(u16),
}

/// A pipelined reference into another question's eventual answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromisedAnswer {
    /// The question whose answer is being pipelined on.
    pub question_id: u32,
    /// Transform from the answer root to the target capability.
    pub ops: Vec<PromisedAnswerOp>,
}

/// Cap descriptor, decoded into the sender's terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapDescriptor {
    /// A null slot in the cap table.
    None,
    /// A capability hosted by the sender.
    SenderHosted {
        /// Sender-side export id.
        id: u32,
    },
    /// A promise hosted by the sender, to be resolved later.
    SenderPromise {
        /// Sender-side export id.
        id: u32,
    },
    /// A capability the receiver already hosts.
    ReceiverHosted {
        /// Receiver-side export id (an import from the sender's view).
        id: u32,
    },
    /// A capability reachable through one of the receiver's answers.
    ReceiverAnswer(PromisedAnswer),
    /// A capability hosted by a third party, with a proxy vine.
    ThirdPartyHosted {
        /// Sender-side export id of the vine.
        vine_id: u32,
    },
}

/// Call/Provide/Join target, decoded into owned form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTarget {
    /// A capability previously exported by the receiver.
    ImportedCap(u32),
    /// A capability reachable through one of the receiver's answers.
    PromisedAnswer(PromisedAnswer),
}

/// Where a Call's results should be sent.
#[derive(Debug, Clone, Copy)]
pub enum SendResultsTo<'a> {
    /// Plain return to the caller.
    Caller,
    /// Tail call: results go back to the caller as another question's
    /// answer.
    Yourself,
    /// Results go to a third party described by the payload.
    ThirdParty(Option<AnyReader<'a>>),
}

/// Payload: a content pointer plus its capability table.
#[derive(Debug, Clone)]
pub struct Payload<'a> {
    /// Root content pointer, if any.
    pub content: Option<AnyReader<'a>>,
    /// Cap table entries, in index order.
    pub cap_table: Vec<CapDescriptor>,
}

/// Decoded Call.
#[derive(Debug, Clone)]
pub struct Call<'a> {
    /// Caller-side question id.
    pub question_id: u32,
    /// Interface being invoked.
    pub interface_id: u64,
    /// Method ordinal within the interface.
    pub method_id: u16,
    /// Capability the call is addressed to.
    pub target: MessageTarget,
    /// Arguments.
    pub params: Option<Payload<'a>>,
    /// Results routing.
    pub send_results_to: SendResultsTo<'a>,
    /// Caller permits a third-party tail handoff.
    pub allow_third_party_tail_call: bool,
    /// Caller promises not to pipeline on this call.
    pub no_promise_pipelining: bool,
    /// Caller only wants the pipeline, not the results.
    pub only_promise_pipeline: bool,
}

/// Decoded Return body.
#[derive(Debug, Clone)]
pub enum ReturnBody<'a> {
    /// Successful results; `None` when the payload pointer is null.
    Results(Option<Payload<'a>>),
    /// The call failed.
    Exception(Exception),
    /// The call was canceled after a Finish.
    Canceled,
    /// Results were delivered elsewhere (tail call).
    ResultsSentElsewhere,
    /// Take the results from another question of the caller's.
    TakeFromOtherQuestion(u32),
    /// Results will arrive from a third party; the payload carries the
    /// completion handle.
    AcceptFromThirdParty(Option<AnyReader<'a>>),
}

/// Decoded Return.
#[derive(Debug, Clone)]
pub struct Return<'a> {
    /// Answer id (the caller's question id).
    pub answer_id: u32,
    /// Whether the caller's param caps should be released.
    pub release_param_caps: bool,
    /// Callee does not need a Finish for this answer.
    pub no_finish_needed: bool,
    /// Body.
    pub body: ReturnBody<'a>,
}

/// Decoded Finish.
#[derive(Debug, Clone, Copy)]
pub struct Finish {
    /// Question being finished.
    pub question_id: u32,
    /// Whether caps in the cached answer should be released.
    pub release_result_caps: bool,
    /// Compatibility workaround flag, preserved verbatim.
    pub require_early_cancellation_workaround: bool,
}

/// Decoded Resolve body.
#[derive(Debug, Clone)]
pub enum ResolveBody {
    /// The promise settled to a capability.
    Cap(CapDescriptor),
    /// The promise failed.
    Exception(Exception),
}

/// Decoded Resolve.
#[derive(Debug, Clone)]
pub struct Resolve {
    /// The promise export being resolved (an import of ours).
    pub promise_id: u32,
    /// Resolution.
    pub body: ResolveBody,
}

/// Decoded Release.
#[derive(Debug, Clone, Copy)]
pub struct Release {
    /// Export id whose references are dropped.
    pub id: u32,
    /// Number of references dropped.
    pub reference_count: u32,
}

/// Decoded Provide.
#[derive(Debug, Clone)]
pub struct Provide<'a> {
    /// Question id of the provide operation.
    pub question_id: u32,
    /// Capability being provided.
    pub target: MessageTarget,
    /// Opaque recipient handle.
    pub recipient: Option<AnyReader<'a>>,
}

/// Decoded Accept.
#[derive(Debug, Clone)]
pub struct Accept<'a> {
    /// Question id of the accept operation.
    pub question_id: u32,
    /// Opaque provision handle matching a Provide.
    pub provision: Option<AnyReader<'a>>,
    /// Whether the reply must wait for a Disembargo accept.
    pub embargo: bool,
}

/// Join key part, for level-4 bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinKeyPart {
    /// Join operation id.
    pub join_id: u32,
    /// Total part count.
    pub part_count: u16,
    /// This part's ordinal.
    pub part_num: u16,
}

/// Decoded Join.
#[derive(Debug, Clone)]
pub struct Join {
    /// Question id of the join operation.
    pub question_id: u32,
    /// Target capability for this part.
    pub target: MessageTarget,
    /// Key part.
    pub key_part: JoinKeyPart,
}

/// Disembargo context.
#[derive(Debug, Clone)]
pub enum DisembargoContext {
    /// Sender-initiated loopback; must be echoed back.
    SenderLoopback {
        /// Embargo id chosen by the sender.
        embargo_id: u32,
    },
    /// The echo of a sender loopback.
    ReceiverLoopback {
        /// Embargo id being cleared.
        embargo_id: u32,
    },
    /// Releases embargoed Accepts queued under a token.
    Accept {
        /// Opaque token naming the queued accepts.
        token: Option<Vec<u8>>,
    },
    /// Provide-side disembargo, carried for completeness.
    Provide {
        /// Question id of the provide.
        question_id: u32,
    },
}

/// Decoded Disembargo.
#[derive(Debug, Clone)]
pub struct Disembargo {
    /// Capability the embargo travels over.
    pub target: Option<MessageTarget>,
    /// Which embargo protocol step this is.
    pub context: DisembargoContext,
}

/// Decoded ThirdPartyAnswer.
#[derive(Debug, Clone)]
pub struct ThirdPartyAnswer {
    /// Answer id the third party is taking over.
    pub answer_id: u32,
    /// Completion token shared with the introducing vat.
    pub completion_key: Vec<u8>,
}

/// What an inbound Unimplemented message was echoing.
#[derive(Debug, Clone, Copy)]
pub struct UnimplementedEcho {
    /// Tag of the echoed message.
    pub tag: MessageTag,
    /// Question id, when the echoed message was a Bootstrap or Call.
    pub question_id: Option<u32>,
}

/// A decoded inbound message.
#[derive(Debug, Clone)]
pub enum RpcMessage<'a> {
    /// Unimplemented echo.
    Unimplemented(Option<UnimplementedEcho>),
    /// Abort with reason.
    Abort(Exception),
    /// Call.
    Call(Call<'a>),
    /// Return.
    Return(Return<'a>),
    /// Finish.
    Finish(Finish),
    /// Resolve.
    Resolve(Resolve),
    /// Release.
    Release(Release),
    /// Bootstrap request.
    Bootstrap {
        /// Caller-side question id.
        question_id: u32,
    },
    /// Provide.
    Provide(Provide<'a>),
    /// Accept.
    Accept(Accept<'a>),
    /// Join.
    Join(Join),
    /// Disembargo.
    Disembargo(Disembargo),
    /// ThirdPartyAnswer.
    ThirdPartyAnswer(ThirdPartyAnswer),
    /// An obsolete tag that decodes but is never handled.
    Obsolete(MessageTag),
}

/// Wire layout constants shared by the decoder and the builders.
///
/// Offsets are bytes into the data section unless the name says `_BIT`
/// (bit index) or `_PTR` (pointer slot).
pub(crate) mod layout {
    pub const MSG_DATA: u16 = 1;
    pub const MSG_PTRS: u16 = 1;
    pub const MSG_TAG: usize = 0;
    pub const MSG_BODY_PTR: u16 = 0;

    pub const CALL_DATA: u16 = 3;
    pub const CALL_PTRS: u16 = 3;
    pub const CALL_QID: usize = 0;
    pub const CALL_METHOD: usize = 4;
    pub const CALL_SRT_DISC: usize = 6;
    pub const CALL_IFACE: usize = 8;
    pub const CALL_ALLOW_TAIL_BIT: usize = 128;
    pub const CALL_NO_PIPELINING_BIT: usize = 129;
    pub const CALL_ONLY_PIPELINE_BIT: usize = 130;
    pub const CALL_TARGET_PTR: u16 = 0;
    pub const CALL_PARAMS_PTR: u16 = 1;
    pub const CALL_THIRD_PARTY_PTR: u16 = 2;
    pub const SRT_CALLER: u16 = 0;
    pub const SRT_YOURSELF: u16 = 1;
    pub const SRT_THIRD_PARTY: u16 = 2;

    pub const RET_DATA: u16 = 2;
    pub const RET_PTRS: u16 = 1;
    pub const RET_AID: usize = 0;
    // Stored inverted: a zeroed word means release_param_caps = true.
    pub const RET_RELEASE_BIT: usize = 32;
    pub const RET_NO_FINISH_BIT: usize = 33;
    pub const RET_DISC: usize = 6;
    pub const RET_TAKE_FROM: usize = 8;
    pub const RET_BODY_PTR: u16 = 0;
    pub const RET_RESULTS: u16 = 0;
    pub const RET_EXCEPTION: u16 = 1;
    pub const RET_CANCELED: u16 = 2;
    pub const RET_SENT_ELSEWHERE: u16 = 3;
    pub const RET_TAKE_FROM_OTHER: u16 = 4;
    pub const RET_ACCEPT_THIRD_PARTY: u16 = 5;

    pub const FIN_DATA: u16 = 1;
    pub const FIN_PTRS: u16 = 0;
    pub const FIN_QID: usize = 0;
    // Stored inverted, like the Return release bit.
    pub const FIN_RELEASE_BIT: usize = 32;
    pub const FIN_REQUIRE_EARLY_BIT: usize = 33;

    pub const RES_DATA: u16 = 1;
    pub const RES_PTRS: u16 = 1;
    pub const RES_PID: usize = 0;
    pub const RES_DISC: usize = 4;
    pub const RES_BODY_PTR: u16 = 0;
    pub const RES_CAP: u16 = 0;
    pub const RES_EXCEPTION: u16 = 1;

    pub const REL_DATA: u16 = 1;
    pub const REL_PTRS: u16 = 0;
    pub const REL_ID: usize = 0;
    pub const REL_COUNT: usize = 4;

    pub const BOOT_DATA: u16 = 1;
    pub const BOOT_PTRS: u16 = 1;
    pub const BOOT_QID: usize = 0;

    pub const PROV_DATA: u16 = 1;
    pub const PROV_PTRS: u16 = 2;
    pub const PROV_QID: usize = 0;
    pub const PROV_TARGET_PTR: u16 = 0;
    pub const PROV_RECIPIENT_PTR: u16 = 1;

    pub const ACC_DATA: u16 = 1;
    pub const ACC_PTRS: u16 = 1;
    pub const ACC_QID: usize = 0;
    pub const ACC_EMBARGO_BIT: usize = 32;
    pub const ACC_PROVISION_PTR: u16 = 0;

    pub const JOIN_DATA: u16 = 1;
    pub const JOIN_PTRS: u16 = 2;
    pub const JOIN_QID: usize = 0;
    pub const JOIN_TARGET_PTR: u16 = 0;
    pub const JOIN_KEY_PTR: u16 = 1;
    pub const JKP_DATA: u16 = 1;
    pub const JKP_PTRS: u16 = 0;
    pub const JKP_ID: usize = 0;
    pub const JKP_COUNT: usize = 4;
    pub const JKP_NUM: usize = 6;

    pub const DIS_DATA: u16 = 1;
    pub const DIS_PTRS: u16 = 2;
    pub const DIS_ID: usize = 0;
    pub const DIS_DISC: usize = 4;
    pub const DIS_TARGET_PTR: u16 = 0;
    pub const DIS_TOKEN_PTR: u16 = 1;
    pub const DIS_SENDER_LOOPBACK: u16 = 0;
    pub const DIS_RECEIVER_LOOPBACK: u16 = 1;
    pub const DIS_ACCEPT: u16 = 2;
    pub const DIS_PROVIDE: u16 = 3;

    pub const TPA_DATA: u16 = 1;
    pub const TPA_PTRS: u16 = 1;
    pub const TPA_AID: usize = 0;
    pub const TPA_COMPLETION_PTR: u16 = 0;

    pub const MT_DATA: u16 = 1;
    pub const MT_PTRS: u16 = 1;
    pub const MT_CAP: usize = 0;
    pub const MT_DISC: usize = 4;
    pub const MT_PA_PTR: u16 = 0;
    pub const MT_IMPORTED: u16 = 0;
    pub const MT_PROMISED: u16 = 1;

    pub const PAYLOAD_DATA: u16 = 0;
    pub const PAYLOAD_PTRS: u16 = 2;
    pub const PAYLOAD_CONTENT_PTR: u16 = 0;
    pub const PAYLOAD_CAP_TABLE_PTR: u16 = 1;

    pub const CD_DATA: u16 = 1;
    pub const CD_PTRS: u16 = 1;
    pub const CD_DISC: usize = 0;
    pub const CD_ID: usize = 4;
    pub const CD_BODY_PTR: u16 = 0;
    pub const CD_NONE: u16 = 0;
    pub const CD_SENDER_HOSTED: u16 = 1;
    pub const CD_SENDER_PROMISE: u16 = 2;
    pub const CD_RECEIVER_HOSTED: u16 = 3;
    pub const CD_RECEIVER_ANSWER: u16 = 4;
    pub const CD_THIRD_PARTY: u16 = 5;

    pub const PA_DATA: u16 = 1;
    pub const PA_PTRS: u16 = 1;
    pub const PA_QID: usize = 0;
    pub const PA_TRANSFORM_PTR: u16 = 0;
    pub const OP_DATA: u16 = 1;
    pub const OP_PTRS: u16 = 0;
    pub const OP_DISC: usize = 0;
    pub const OP_INDEX: usize = 2;
    pub const OP_NOOP: u16 = 0;
    pub const OP_GET_POINTER_FIELD: u16 = 1;

    pub const TPCD_DATA: u16 = 1;
    pub const TPCD_PTRS: u16 = 1;
    pub const TPCD_VINE: usize = 0;

    pub const EXC_DATA: u16 = 1;
    pub const EXC_PTRS: u16 = 2;
    pub const EXC_TYPE: usize = 4;
    pub const EXC_REASON_PTR: u16 = 0;
    pub const EXC_TRACE_PTR: u16 = 1;
}
