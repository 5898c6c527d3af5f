//! The peer state machine: questions, answers, exports, embargoes, and
//! third-party handoff bookkeeping for one connection.
//!
//! A [`Peer`] is single-threaded: every handler runs to completion on the
//! caller's thread of control and emits outbound frames through one
//! [`FrameSink`]. The connection driver owns the peer and feeds it frames
//! in arrival order; tests drive it directly with a `Vec<Bytes>` sink.

mod call;
mod dispatch;
mod error;
mod forward;

pub use call::CallRequest;
pub use error::PeerError;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use capnrpc_wire::message::{self, AnyReader};
use capnrpc_wire::rpc::{self, Exception, MessageTarget, PromisedAnswerOp};
use tracing::warn;

use crate::captable::{CapTable, DEFAULT_MAX_TABLE_SIZE};
use crate::export::{Exports, ResolvedCap};
use crate::inbound::InboundCaps;
use crate::outbound;
use crate::pipeline;
use crate::streaming::StreamTracker;

/// The single frame egress every handler writes through.
pub trait FrameSink {
    /// Queues one serialized frame for transmission, in program order.
    fn send_frame(&mut self, frame: Bytes);
}

impl FrameSink for Vec<Bytes> {
    fn send_frame(&mut self, frame: Bytes) {
        self.push(frame);
    }
}

/// Error type host call handlers may return; the reason string becomes
/// the exception Return's reason.
pub type HostError = Box<dyn std::error::Error + Send + Sync>;

/// An inbound call handed to the host dispatcher.
///
/// The params content is detached into an owned segment so the handler
/// can outlive the frame; capability pointers inside it index into
/// `caps`.
#[derive(Debug)]
pub struct InboundCall {
    /// Answer id the host must eventually reply to.
    pub answer_id: u32,
    /// Interface being invoked.
    pub interface_id: u64,
    /// Method ordinal within the interface.
    pub method_id: u16,
    /// Owned copy of the params content; read it back through
    /// [`capnrpc_wire::Message::from_segment`].
    pub content: Option<Bytes>,
    /// Resolved param capabilities, in cap-table order.
    pub caps: Vec<ResolvedCap>,
}

/// Host-supplied dispatcher for calls on plain local exports.
pub trait CallHandler: Send + Sync {
    /// Handles one inbound call. Errors become exception Returns.
    fn on_call(&self, call: InboundCall) -> Result<(), HostError>;
}

/// What an outbound question settled to.
#[derive(Debug)]
pub enum ReturnOutcome {
    /// Results arrived; capabilities are in the table passed alongside.
    Results {
        /// Owned copy of the results content.
        content: Option<Bytes>,
    },
    /// The call failed.
    Exception(Exception),
    /// The call was canceled.
    Canceled,
    /// Results were delivered elsewhere.
    ResultsSentElsewhere,
    /// Results arrive as another question's answer.
    TakeFromOtherQuestion(u32),
    /// A third party will deliver the results.
    AcceptFromThirdParty,
}

/// Capability object invoked when an outbound question settles.
///
/// `caps` is the resolved cap table of the results payload; entries the
/// handler does not [`retain`](InboundCaps::retain) are released back to
/// the peer when the handler returns.
pub trait ReturnHandler: Send {
    /// Consumes the outcome of the question.
    fn on_return(&mut self, outcome: ReturnOutcome, caps: &mut InboundCaps);
}

/// How a forwarded question's Returns are rewritten for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// Straight pass-through to the caller.
    TranslateToCaller,
    /// A stitched yourself-tail: only results_sent_elsewhere and
    /// canceled are legal inbound.
    SentElsewhere,
    /// Yourself-tail that could not be stitched: real results collapse
    /// to a results_sent_elsewhere marker.
    PropagateResultsSentElsewhere,
    /// Third-party forwarding: markers become accept_from_third_party
    /// with the captured handoff payload.
    PropagateAcceptFromThirdParty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QuestionKind {
    Call,
    Bootstrap,
    Provide,
    Accept,
    Join,
}

pub(crate) struct ForwardedQuestion {
    pub mode: ForwardMode,
    pub upstream_answer_id: u32,
    /// Cloned third-party handoff payload, as an owned segment.
    pub third_party: Option<Bytes>,
}

pub(crate) struct Question {
    pub kind: QuestionKind,
    pub on_return: Option<Box<dyn ReturnHandler>>,
    /// Exports our params added references to; dropped again when the
    /// Return asks for release_param_caps.
    pub param_exports: Vec<u32>,
    /// Imports held alive for a forwarded call's params, released when
    /// the forwarded question settles.
    pub param_imports: Vec<(u32, u32)>,
    pub stream_client: Option<u64>,
    pub forwarded: Option<ForwardedQuestion>,
    pub suppress_finish: bool,
}

impl Question {
    pub(crate) fn new(kind: QuestionKind) -> Self {
        Self {
            kind,
            on_return: None,
            param_exports: Vec::new(),
            param_imports: Vec::new(),
            stream_client: None,
            forwarded: None,
            suppress_finish: false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum AnswerDisposition {
    Caller,
    Yourself,
    /// Cloned third-party handle, as an owned segment.
    ThirdParty(Option<Bytes>),
}

#[derive(Debug, Clone)]
pub(crate) struct AnswerState {
    pub disposition: AnswerDisposition,
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedImport {
    pub cap: ResolvedCap,
    pub embargo_id: Option<u32>,
    pub embargoed: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ProvideEntry {
    pub recipient_key: Vec<u8>,
    pub target: ResolvedCap,
}

#[derive(Debug, Clone)]
pub(crate) struct QueuedAccept {
    pub question_id: u32,
    pub target: ResolvedCap,
}

#[derive(Debug, Clone)]
pub(crate) struct QueuedCall {
    pub question_id: u32,
    pub frame: Bytes,
}

#[derive(Debug, Clone)]
pub(crate) struct JoinState {
    pub part_count: u16,
    pub parts: HashMap<u16, (u32, ResolvedCap)>,
}

#[derive(Debug, Clone)]
pub(crate) struct PendingAwait {
    pub question_id: u32,
}

/// Callback fired when every part of a join has arrived.
pub type JoinHandler = Box<dyn FnMut(u32, Vec<ResolvedCap>) + Send>;

/// Locally allocated ids keep bit 30 clear; the bit marks third-party
/// adopted answer ids. Advisory for allocation, not validated against
/// the peer's choices beyond the ThirdPartyAnswer check.
pub(crate) fn is_adopted_answer_id(id: u32) -> bool {
    id & (1 << 30) != 0 && id & (1 << 31) == 0
}

const QUESTION_ID_MASK: u32 = (1 << 30) - 1;

/// Snapshot of the peer's table sizes, for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    /// Outstanding caller-side questions.
    pub questions: usize,
    /// Outstanding callee-side answers.
    pub answers: usize,
    /// Export table entries.
    pub exports: usize,
    /// Combined capability-table entries (imports, promise marks,
    /// receiver-answers).
    pub cap_table_entries: usize,
    /// Embargoes waiting for their receiver loopback.
    pub pending_embargoes: usize,
    /// Awaiters parked under completion keys.
    pub pending_awaits: usize,
    /// Answer ids parked under completion keys.
    pub pending_answers: usize,
    /// Adopted third-party answers.
    pub adopted_answers: usize,
    /// Forwarded questions outstanding.
    pub forwarded_questions: usize,
    /// Cached answer frames held for pipelining.
    pub resolved_answers: usize,
    /// Returns buffered ahead of adoption.
    pub pending_third_party_returns: usize,
}

/// The per-connection peer.
pub struct Peer {
    pub(crate) cap_table: CapTable,
    pub(crate) exports: Exports,
    pub(crate) questions: HashMap<u32, Question>,
    pub(crate) answers: HashMap<u32, AnswerState>,
    pub(crate) resolved_imports: HashMap<u32, ResolvedImport>,
    pub(crate) pending_embargoes: HashMap<u32, u32>,
    pub(crate) pending_awaits: HashMap<Vec<u8>, PendingAwait>,
    pub(crate) pending_answers: HashMap<Vec<u8>, u32>,
    pub(crate) adopted_answers: HashMap<u32, u32>,
    pub(crate) forwarded_questions: HashMap<u32, u32>,
    pub(crate) forwarded_tail_questions: HashMap<u32, u32>,
    pub(crate) resolved_answers: HashMap<u32, Bytes>,
    pub(crate) pending_third_party_returns: HashMap<u32, Bytes>,
    pub(crate) provides_by_question: HashMap<u32, ProvideEntry>,
    pub(crate) provides_by_key: HashMap<Vec<u8>, u32>,
    pub(crate) pending_embargoed_accepts: HashMap<Vec<u8>, Vec<QueuedAccept>>,
    pub(crate) queued_promise_calls: HashMap<u32, Vec<QueuedCall>>,
    pub(crate) joins: HashMap<u32, JoinState>,
    pub(crate) join_questions: HashSet<u32>,
    pub(crate) streaming: StreamTracker,
    pub(crate) next_question_id: u32,
    pub(crate) next_embargo_id: u32,
    pub(crate) last_remote_abort_reason: Option<String>,
    pub(crate) call_handler: Option<Arc<dyn CallHandler>>,
    pub(crate) on_join_complete: Option<JoinHandler>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("stats", &self.stats())
            .field("bootstrap_export_id", &self.exports.bootstrap_id())
            .finish()
    }
}

/// Builder for [`Peer`].
pub struct PeerBuilder {
    bootstrap_export_id: Option<u32>,
    max_table_size: usize,
    call_handler: Option<Arc<dyn CallHandler>>,
    on_join_complete: Option<JoinHandler>,
}

impl fmt::Debug for PeerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerBuilder")
            .field("bootstrap_export_id", &self.bootstrap_export_id)
            .field("max_table_size", &self.max_table_size)
            .field("call_handler", &self.call_handler.is_some())
            .finish()
    }
}

impl Default for PeerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerBuilder {
    /// Creates a builder with defaults: no bootstrap export, no host
    /// dispatcher, table bound of [`DEFAULT_MAX_TABLE_SIZE`].
    pub fn new() -> Self {
        Self {
            bootstrap_export_id: None,
            max_table_size: DEFAULT_MAX_TABLE_SIZE,
            call_handler: None,
            on_join_complete: None,
        }
    }

    /// Configures the statically pinned bootstrap export.
    pub fn bootstrap_export_id(mut self, id: u32) -> Self {
        self.bootstrap_export_id = Some(id);
        self
    }

    /// Bounds the combined capability-table size.
    pub fn max_table_size(mut self, size: usize) -> Self {
        self.max_table_size = size;
        self
    }

    /// Installs the host call dispatcher.
    pub fn call_handler(mut self, handler: Arc<dyn CallHandler>) -> Self {
        self.call_handler = Some(handler);
        self
    }

    /// Installs the join completion callback.
    pub fn on_join_complete(mut self, handler: JoinHandler) -> Self {
        self.on_join_complete = Some(handler);
        self
    }

    /// Builds the peer.
    pub fn build(self) -> Peer {
        Peer {
            cap_table: CapTable::new(self.max_table_size),
            exports: Exports::new(self.bootstrap_export_id),
            questions: HashMap::new(),
            answers: HashMap::new(),
            resolved_imports: HashMap::new(),
            pending_embargoes: HashMap::new(),
            pending_awaits: HashMap::new(),
            pending_answers: HashMap::new(),
            adopted_answers: HashMap::new(),
            forwarded_questions: HashMap::new(),
            forwarded_tail_questions: HashMap::new(),
            resolved_answers: HashMap::new(),
            pending_third_party_returns: HashMap::new(),
            provides_by_question: HashMap::new(),
            provides_by_key: HashMap::new(),
            pending_embargoed_accepts: HashMap::new(),
            queued_promise_calls: HashMap::new(),
            joins: HashMap::new(),
            join_questions: HashSet::new(),
            streaming: StreamTracker::new(),
            next_question_id: 0,
            next_embargo_id: 0,
            last_remote_abort_reason: None,
            call_handler: self.call_handler,
            on_join_complete: self.on_join_complete,
        }
    }
}

impl Peer {
    /// Creates a builder.
    pub fn builder() -> PeerBuilder {
        PeerBuilder::new()
    }

    pub(crate) fn alloc_question_id(&mut self) -> u32 {
        for _ in 0..=self.questions.len() + 1 {
            let id = self.next_question_id & QUESTION_ID_MASK;
            self.next_question_id = self.next_question_id.wrapping_add(1) & QUESTION_ID_MASK;
            if !self.questions.contains_key(&id) {
                return id;
            }
        }
        unreachable!("question table cannot be full: more ids than probes")
    }

    pub(crate) fn alloc_embargo_id(&mut self) -> u32 {
        for _ in 0..=self.pending_embargoes.len() + 1 {
            let id = self.next_embargo_id;
            self.next_embargo_id = self.next_embargo_id.wrapping_add(1);
            if !self.pending_embargoes.contains_key(&id) {
                return id;
            }
        }
        unreachable!("embargo table cannot be full: more ids than probes")
    }

    /// Allocates an export id that is free in both the capability table
    /// and the export table.
    pub fn alloc_export_id(&mut self) -> Result<u32, PeerError> {
        for _ in 0..=self.exports.len() + 1 {
            let id = self.cap_table.alloc_export_id()?;
            if !self.exports.contains(id) {
                return Ok(id);
            }
        }
        Err(crate::captable::CapTableError::CapTableFull.into())
    }

    /// Mints a plain export id for a host-supplied capability.
    pub fn export_capability(&mut self) -> Result<u32, PeerError> {
        let id = self.alloc_export_id()?;
        self.exports.ensure(id, false);
        Ok(id)
    }

    /// Mints a promise export id; calls queue on it until it resolves.
    pub fn export_promise(&mut self) -> Result<u32, PeerError> {
        let id = self.alloc_export_id()?;
        self.cap_table.mark_export_promise(id);
        self.exports.ensure(id, true);
        Ok(id)
    }

    /// Mints a local cap id for pipelining on one of our outstanding
    /// questions; usable in outbound params and targets.
    pub fn pipeline_cap(
        &mut self,
        question_id: u32,
        ops: &[PromisedAnswerOp],
    ) -> Result<u32, PeerError> {
        Ok(self.cap_table.note_receiver_answer_ops(question_id, ops)?)
    }

    /// Sends a Bootstrap question; the handler settles with the peer's
    /// bootstrap capability.
    pub fn send_bootstrap(
        &mut self,
        on_return: Option<Box<dyn ReturnHandler>>,
        sink: &mut dyn FrameSink,
    ) -> u32 {
        let qid = self.alloc_question_id();
        let mut question = Question::new(QuestionKind::Bootstrap);
        question.on_return = on_return;
        self.questions.insert(qid, question);
        sink.send_frame(rpc::bootstrap(qid));
        qid
    }

    /// Sends a Provide, parking `target` under the opaque recipient key.
    pub fn send_provide(
        &mut self,
        target: &MessageTarget,
        recipient_key: &[u8],
        sink: &mut dyn FrameSink,
    ) -> u32 {
        let qid = self.alloc_question_id();
        self.questions.insert(qid, Question::new(QuestionKind::Provide));
        sink.send_frame(rpc::provide(qid, target, recipient_key));
        qid
    }

    /// Sends an Accept for the provision parked under `provision_key`.
    pub fn send_accept(
        &mut self,
        provision_key: &[u8],
        embargo: bool,
        on_return: Option<Box<dyn ReturnHandler>>,
        sink: &mut dyn FrameSink,
    ) -> u32 {
        let qid = self.alloc_question_id();
        let mut question = Question::new(QuestionKind::Accept);
        question.on_return = on_return;
        self.questions.insert(qid, question);
        sink.send_frame(rpc::accept(qid, provision_key, embargo));
        qid
    }

    /// Sends one Join part.
    pub fn send_join(
        &mut self,
        target: &MessageTarget,
        part: rpc::JoinKeyPart,
        sink: &mut dyn FrameSink,
    ) -> u32 {
        let qid = self.alloc_question_id();
        self.questions.insert(qid, Question::new(QuestionKind::Join));
        sink.send_frame(rpc::join(qid, target, part));
        qid
    }

    /// Finishes an outstanding question from the host side (cancellation
    /// included); late Returns for it are swallowed.
    pub fn send_finish(&mut self, question_id: u32, release_result_caps: bool, sink: &mut dyn FrameSink) {
        if self.questions.remove(&question_id).is_none() {
            warn!(question_id, "finish for a question that is not outstanding");
        }
        sink.send_frame(rpc::finish(question_id, release_result_caps));
    }

    /// Resolves one of our promise exports to a capability, announcing
    /// it to the peer and replaying queued calls.
    pub fn resolve_export(
        &mut self,
        id: u32,
        cap: ResolvedCap,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        if !self.exports.contains(id) {
            return Err(PeerError::UnknownExport);
        }
        self.exports.set_resolved(id, cap.clone());
        let desc = match &cap {
            ResolvedCap::None => None,
            ResolvedCap::Exported { id: target } => {
                self.exports.add_ref(*target);
                Some(rpc::CapDescriptor::SenderHosted { id: *target })
            }
            ResolvedCap::Imported { id: target } => {
                Some(rpc::CapDescriptor::ReceiverHosted { id: *target })
            }
            ResolvedCap::Promised(pa) => Some(rpc::CapDescriptor::ReceiverAnswer(pa.clone())),
        };
        match desc {
            Some(desc) => sink.send_frame(rpc::resolve_cap(id, &desc)?),
            None => sink.send_frame(rpc::resolve_exception(id, "promise broken")),
        }
        self.replay_queued_calls(id, sink)
    }

    /// Resolves one of our promise exports to an exception.
    pub fn resolve_export_exception(
        &mut self,
        id: u32,
        reason: &str,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        if !self.exports.contains(id) {
            return Err(PeerError::UnknownExport);
        }
        self.exports.set_resolved(id, ResolvedCap::None);
        sink.send_frame(rpc::resolve_exception(id, reason));
        self.replay_queued_calls(id, sink)
    }

    fn replay_queued_calls(&mut self, id: u32, sink: &mut dyn FrameSink) -> Result<(), PeerError> {
        for queued in self.queued_promise_calls.remove(&id).unwrap_or_default() {
            self.handle_frame_bytes(&queued.frame, sink)?;
        }
        Ok(())
    }

    /// Replies to an inbound question with results, honoring its
    /// recorded results routing.
    pub fn send_return_results(
        &mut self,
        answer_id: u32,
        content: Option<&AnyReader<'_>>,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        let disposition = self
            .answers
            .get(&answer_id)
            .ok_or(PeerError::MissingCallbackContext)?
            .disposition
            .clone();
        match disposition {
            AnswerDisposition::Caller => {
                let mut rb = rpc::return_results(answer_id);
                if let Some(src) = content {
                    rb.msg
                        .copy_into_slot(rb.payload.struct_handle(), rb.payload.content_slot(), src)?;
                }
                outbound::encode_payload(&mut rb.msg, &rb.payload, &mut self.cap_table, &mut self.exports)?;
                let frame = rb.msg.into_frame();
                self.resolved_answers.insert(answer_id, frame.clone());
                sink.send_frame(frame);
            }
            AnswerDisposition::Yourself => {
                sink.send_frame(rpc::return_results_sent_elsewhere(answer_id));
            }
            AnswerDisposition::ThirdParty(handle) => {
                let frame = match handle {
                    Some(segment) => {
                        let msg = capnrpc_wire::Message::from_segment(segment);
                        let root = msg.root()?;
                        rpc::return_accept_from_third_party(answer_id, root.as_ref())?
                    }
                    None => rpc::return_accept_from_third_party(answer_id, None)?,
                };
                sink.send_frame(frame);
            }
        }
        Ok(())
    }

    /// Replies to an inbound question with an exception.
    pub fn send_return_exception(
        &mut self,
        answer_id: u32,
        reason: &str,
        sink: &mut dyn FrameSink,
    ) {
        sink.send_frame(rpc::return_exception(answer_id, reason));
    }

    /// Drops host-held references on an import, telling the peer.
    pub fn release_import(&mut self, id: u32, count: u32, sink: &mut dyn FrameSink) {
        if self.cap_table.release_import_count(id, count) {
            self.resolved_imports.remove(&id);
        }
        sink.send_frame(rpc::release(id, count));
    }

    pub(crate) fn cache_resolved_answer(&mut self, answer_id: u32, frame: Bytes) {
        self.resolved_answers.insert(answer_id, frame);
    }

    pub(crate) fn answer_with_error(
        &mut self,
        answer_id: u32,
        err: &PeerError,
        sink: &mut dyn FrameSink,
    ) {
        warn!(answer_id, error = %err, "answering question with error");
        sink.send_frame(rpc::return_exception(answer_id, err.error_name()));
    }

    /// Resolves a local message target (our export, or a pipelined path
    /// through one of our cached answers) to a concrete capability.
    pub(crate) fn resolve_local_target(
        &mut self,
        target: &MessageTarget,
    ) -> Result<ResolvedCap, PeerError> {
        match target {
            MessageTarget::ImportedCap(id) => match self.exports.get(*id) {
                None => Err(PeerError::UnknownExport),
                Some(export) => match &export.resolved {
                    Some(cap) => Ok(cap.clone()),
                    None => Ok(ResolvedCap::Exported { id: *id }),
                },
            },
            MessageTarget::PromisedAnswer(pa) => {
                let frame = self
                    .resolved_answers
                    .get(&pa.question_id)
                    .cloned()
                    .ok_or(PeerError::Pipeline(
                        crate::pipeline::PipelineError::MissingPayload,
                    ))?;
                Ok(pipeline::resolve_promised_answer(&frame, &pa.ops)?)
            }
        }
    }

    /// Maps a resolved capability (in our sent-frame flavour) back to a
    /// local cap id usable in an outbound payload. `None` nulls the
    /// pointer out.
    pub(crate) fn local_id_for(&self, cap: &ResolvedCap) -> Result<Option<u32>, PeerError> {
        match cap {
            ResolvedCap::None => Ok(None),
            ResolvedCap::Exported { id } | ResolvedCap::Imported { id } => Ok(Some(*id)),
            ResolvedCap::Promised(pa) => match self.resolved_answers.get(&pa.question_id) {
                None => Ok(None),
                Some(frame) => match pipeline::resolve_promised_answer(frame, &pa.ops)? {
                    ResolvedCap::Exported { id } | ResolvedCap::Imported { id } => Ok(Some(id)),
                    _ => Ok(None),
                },
            },
        }
    }

    // ---- diagnostics -------------------------------------------------

    /// Table-size snapshot.
    pub fn stats(&self) -> PeerStats {
        PeerStats {
            questions: self.questions.len(),
            answers: self.answers.len(),
            exports: self.exports.len(),
            cap_table_entries: self.cap_table.total_entries(),
            pending_embargoes: self.pending_embargoes.len(),
            pending_awaits: self.pending_awaits.len(),
            pending_answers: self.pending_answers.len(),
            adopted_answers: self.adopted_answers.len(),
            forwarded_questions: self.forwarded_questions.len(),
            resolved_answers: self.resolved_answers.len(),
            pending_third_party_returns: self.pending_third_party_returns.len(),
        }
    }

    /// Current reference count of an import, zero when absent.
    pub fn import_ref_count(&self, id: u32) -> u32 {
        self.cap_table.import_ref_count(id)
    }

    /// Current reference count of an export.
    pub fn export_ref_count(&self, id: u32) -> Option<u32> {
        self.exports.get(id).map(|e| e.ref_count)
    }

    /// Resolution state of a remote promise: the cap and whether it is
    /// still embargoed.
    pub fn resolved_import(&self, promise_id: u32) -> Option<(ResolvedCap, bool)> {
        self.resolved_imports
            .get(&promise_id)
            .map(|r| (r.cap.clone(), r.embargoed))
    }

    /// Whether a cached answer frame is held for `question_id`.
    pub fn has_resolved_answer(&self, question_id: u32) -> bool {
        self.resolved_answers.contains_key(&question_id)
    }

    /// Answer id parked under a completion key, if any.
    pub fn pending_answer_for(&self, key: &[u8]) -> Option<u32> {
        self.pending_answers.get(key).copied()
    }

    /// Original question an adopted answer id maps to, if any.
    pub fn adopted_answer_for(&self, answer_id: u32) -> Option<u32> {
        self.adopted_answers.get(&answer_id).copied()
    }

    /// Whether an awaiter is parked under a completion key.
    pub fn has_pending_await(&self, key: &[u8]) -> bool {
        self.pending_awaits.contains_key(key)
    }

    /// The reason from the last remote Abort, for diagnostics.
    pub fn last_remote_abort_reason(&self) -> Option<&str> {
        self.last_remote_abort_reason.as_deref()
    }

    /// Mutable access to the streaming tracker.
    pub fn stream_tracker_mut(&mut self) -> &mut StreamTracker {
        &mut self.streaming
    }

    /// Seeds a pending third-party answer, as the introducing vat's
    /// side-channel would.
    pub fn seed_pending_answer(&mut self, key: Vec<u8>, answer_id: u32) {
        self.pending_answers.insert(key, answer_id);
    }
}

pub(crate) fn clone_any(src: &AnyReader<'_>) -> Result<Bytes, PeerError> {
    Ok(message::clone_pointer(src)?)
}
