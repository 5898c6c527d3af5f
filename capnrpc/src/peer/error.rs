//! Error types for peer operations.

use capnrpc_wire::message::MessageError;
use capnrpc_wire::rpc::DecodeError;

use crate::captable::CapTableError;
use crate::outbound::OutboundError;
use crate::pipeline::PipelineError;

/// Errors surfaced by the peer state machine.
///
/// Fatal variants tear the connection down (after an Abort frame where
/// one can still be sent); the rest are per-question and surface as
/// exception Returns without touching the connection.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// The remote peer sent an Abort.
    #[error("remote aborted: {0}")]
    RemoteAbort(String),

    /// A ThirdPartyAnswer id without the adopted-answer bit pattern.
    #[error("third party answer id is malformed")]
    InvalidThirdPartyAnswerId,

    /// A ThirdPartyAnswer for an id that was already adopted.
    #[error("third party answer id already adopted")]
    DuplicateThirdPartyAnswerId,

    /// Two different answer ids parked under one completion key.
    #[error("conflicting third party answer under one completion key")]
    ConflictingThirdPartyAnswer,

    /// Two awaiters registered under one completion key.
    #[error("duplicate await under one completion key")]
    DuplicateThirdPartyAwait,

    /// A forwarded tail question received a Return variant other than
    /// results_sent_elsewhere or canceled.
    #[error("unexpected return variant on a forwarded tail question")]
    UnexpectedForwardedTailReturn,

    /// A call or provide target naming an export we do not have.
    #[error("unknown export")]
    UnknownExport,

    /// A Return or Finish for a question that is no longer outstanding.
    /// Swallowed at the dispatch site; kept for diagnostics.
    #[error("unknown question")]
    UnknownQuestion,

    /// An answer-side operation with no recorded answer state to consult.
    #[error("no callback context for this answer")]
    MissingCallbackContext,

    /// A Provide duplicating an outstanding question id or recipient key.
    #[error("duplicate provide")]
    DuplicateProvide,

    /// An Accept naming a provision key nothing was provided under.
    #[error("unknown provision key")]
    UnknownProvision,

    /// A Provide or Accept without its opaque key payload.
    #[error("provision key is missing")]
    MissingProvisionKey,

    /// A Join reusing an outstanding join question id.
    #[error("duplicate join question")]
    DuplicateJoin,

    /// A Join part conflicting with the parts already gathered.
    #[error("join part mismatch")]
    JoinPartMismatch,

    /// An inbound question id that is already in use.
    #[error("duplicate question id")]
    DuplicateQuestion,

    /// A streaming send after the stream cached an error.
    #[error("streaming call failed: {0}")]
    StreamFailed(String),

    /// Capability table failure.
    #[error(transparent)]
    CapTable(#[from] CapTableError),

    /// Outbound payload encoding failure.
    #[error(transparent)]
    Outbound(#[from] OutboundError),

    /// Promised-answer resolution failure.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// The inbound frame failed to decode.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Pointer-level failure outside decoding proper.
    #[error(transparent)]
    Message(#[from] MessageError),
}

impl PeerError {
    /// Whether this error tears the connection down. Per-question errors
    /// never do.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RemoteAbort(_)
                | Self::InvalidThirdPartyAnswerId
                | Self::DuplicateThirdPartyAnswerId
                | Self::ConflictingThirdPartyAnswer
                | Self::DuplicateThirdPartyAwait
                | Self::UnexpectedForwardedTailReturn
                | Self::Decode(_)
                | Self::Message(_)
        )
    }

    /// Stable name used as the exception reason when this error is
    /// reported for a single question.
    pub fn error_name(&self) -> &'static str {
        match self {
            Self::RemoteAbort(_) => "RemoteAbort",
            Self::InvalidThirdPartyAnswerId => "InvalidThirdPartyAnswerId",
            Self::DuplicateThirdPartyAnswerId => "DuplicateThirdPartyAnswerId",
            Self::ConflictingThirdPartyAnswer => "ConflictingThirdPartyAnswer",
            Self::DuplicateThirdPartyAwait => "DuplicateThirdPartyAwait",
            Self::UnexpectedForwardedTailReturn => "UnexpectedForwardedTailReturn",
            Self::UnknownExport => "UnknownExport",
            Self::UnknownQuestion => "UnknownQuestion",
            Self::MissingCallbackContext => "MissingCallbackContext",
            Self::DuplicateProvide => "DuplicateProvide",
            Self::UnknownProvision => "UnknownProvision",
            Self::MissingProvisionKey => "MissingProvisionKey",
            Self::DuplicateJoin => "DuplicateJoin",
            Self::JoinPartMismatch => "JoinPartMismatch",
            Self::DuplicateQuestion => "DuplicateQuestion",
            Self::StreamFailed(_) => "StreamFailed",
            Self::CapTable(inner) => inner.error_name(),
            Self::Outbound(inner) => inner.error_name(),
            Self::Pipeline(inner) => inner.error_name(),
            Self::Decode(inner) => decode_error_name(inner),
            Self::Message(inner) => message_error_name(inner),
        }
    }
}

fn decode_error_name(err: &DecodeError) -> &'static str {
    match err {
        DecodeError::InvalidMessageTag(_) => "InvalidMessageTag",
        DecodeError::UnexpectedMessage => "UnexpectedMessage",
        DecodeError::MissingCallTarget => "MissingCallTarget",
        DecodeError::MissingPromisedAnswer => "MissingPromisedAnswer",
        DecodeError::MissingCapDescriptorId => "MissingCapDescriptorId",
        DecodeError::MissingThirdPartyCapDescriptor => "MissingThirdPartyCapDescriptor",
        DecodeError::MissingEmbargoId => "MissingEmbargoId",
        DecodeError::Message(inner) => message_error_name(inner),
    }
}

fn message_error_name(err: &MessageError) -> &'static str {
    match err {
        MessageError::InvalidPointer => "InvalidPointer",
        MessageError::PointerOutOfBounds => "PointerOutOfBounds",
        MessageError::CapabilityIdTooLarge => "CapabilityIdTooLarge",
        MessageError::UnexpectedPointerType => "UnexpectedPointerType",
    }
}
