//! Call handling: routing inbound calls onto exports, queueing on
//! unresolved promises, forwarding through resolved targets, and the
//! outbound call API.

use std::fmt;

use bytes::Bytes;
use capnrpc_wire::message::AnyReader;
use capnrpc_wire::rpc::{self, Call, MessageTarget, SendResultsTo};
use tracing::{debug, trace};

use crate::export::ResolvedCap;
use crate::inbound;
use crate::outbound;
use crate::peer::{
    clone_any, AnswerDisposition, AnswerState, ForwardMode, ForwardedQuestion, FrameSink,
    InboundCall, PeerError, Question, QuestionKind, QueuedCall,
};

use super::Peer;

/// How deep a chain of promise resolutions may be followed before the
/// call is declared broken.
const MAX_RESOLUTION_DEPTH: usize = 8;

/// An outbound call prepared by the host.
pub struct CallRequest<'a> {
    /// Capability the call is addressed to.
    pub target: MessageTarget,
    /// Interface being invoked.
    pub interface_id: u64,
    /// Method ordinal within the interface.
    pub method_id: u16,
    /// Params content to copy into the call; capability pointers use
    /// local cap ids.
    pub params: Option<AnyReader<'a>>,
    /// Streaming client this call counts against, if any.
    pub stream_client: Option<u64>,
    /// Capability object invoked when the answer arrives.
    pub on_return: Option<Box<dyn super::ReturnHandler>>,
}

impl fmt::Debug for CallRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRequest")
            .field("target", &self.target)
            .field("interface_id", &self.interface_id)
            .field("method_id", &self.method_id)
            .field("stream_client", &self.stream_client)
            .finish()
    }
}

impl Peer {
    /// Sends an outbound call, allocating and registering its question.
    pub fn send_call(
        &mut self,
        request: CallRequest<'_>,
        sink: &mut dyn FrameSink,
    ) -> Result<u32, PeerError> {
        if let Some(client) = request.stream_client {
            self.streaming
                .note_call_sent(client)
                .map_err(|e| PeerError::StreamFailed(e.reason))?;
        }
        let result = self.send_call_inner(&request, sink);
        if result.is_err() {
            if let Some(client) = request.stream_client {
                // The call never left; undo the in-flight accounting.
                self.streaming.note_return(client, None);
            }
        }
        let question_id = result?;
        let question = self
            .questions
            .get_mut(&question_id)
            .expect("question registered by send_call_inner");
        question.on_return = request.on_return;
        question.stream_client = request.stream_client;
        Ok(question_id)
    }

    fn send_call_inner(
        &mut self,
        request: &CallRequest<'_>,
        sink: &mut dyn FrameSink,
    ) -> Result<u32, PeerError> {
        let question_id = self.alloc_question_id();
        let mut cb = rpc::call(
            question_id,
            request.interface_id,
            request.method_id,
            &request.target,
        );
        if let Some(src) = &request.params {
            cb.msg
                .copy_into_slot(cb.payload.struct_handle(), cb.payload.content_slot(), src)?;
        }
        let summary =
            outbound::encode_payload(&mut cb.msg, &cb.payload, &mut self.cap_table, &mut self.exports)?;
        let mut question = Question::new(QuestionKind::Call);
        question.param_exports = summary.exports_referenced;
        self.questions.insert(question_id, question);
        sink.send_frame(cb.msg.into_frame());
        Ok(question_id)
    }

    /// Handles an inbound Call frame.
    pub(crate) fn handle_call(
        &mut self,
        call: &Call<'_>,
        raw: &Bytes,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        let question_id = call.question_id;
        if self.answers.contains_key(&question_id) {
            self.answer_with_error(question_id, &PeerError::DuplicateQuestion, sink);
            return Ok(());
        }
        let disposition = match &call.send_results_to {
            SendResultsTo::Caller => AnswerDisposition::Caller,
            SendResultsTo::Yourself => AnswerDisposition::Yourself,
            SendResultsTo::ThirdParty(handle) => AnswerDisposition::ThirdParty(match handle {
                Some(any) => Some(clone_any(any)?),
                None => None,
            }),
        };
        self.answers.insert(question_id, AnswerState { disposition });

        match self.route_call(call, raw, sink) {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                self.answer_with_error(question_id, &err, sink);
                Ok(())
            }
        }
    }

    fn route_call(
        &mut self,
        call: &Call<'_>,
        raw: &Bytes,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        match &call.target {
            MessageTarget::ImportedCap(id) => self.dispatch_to_export(*id, call, raw, sink, 0),
            MessageTarget::PromisedAnswer(pa) => {
                let frame = self.resolved_answers.get(&pa.question_id).cloned();
                match frame {
                    None => {
                        sink.send_frame(rpc::return_exception(
                            call.question_id,
                            "promised answer missing",
                        ));
                        Ok(())
                    }
                    Some(frame) => {
                        let cap = crate::pipeline::resolve_promised_answer(&frame, &pa.ops)?;
                        self.handle_resolved_call(cap, call, raw, sink, 0)
                    }
                }
            }
        }
    }

    /// Classifies an imported-cap call into its plan: local dispatch,
    /// resolved redirect, promise queueing, or one of the standard
    /// failure answers.
    fn dispatch_to_export(
        &mut self,
        export_id: u32,
        call: &Call<'_>,
        raw: &Bytes,
        sink: &mut dyn FrameSink,
        depth: usize,
    ) -> Result<(), PeerError> {
        let export = match self.exports.get(export_id) {
            None => {
                sink.send_frame(rpc::return_exception(
                    call.question_id,
                    "unknown promised capability",
                ));
                return Ok(());
            }
            Some(export) => export,
        };
        if export.is_promise {
            match export.resolved.clone() {
                Some(ResolvedCap::None) => {
                    sink.send_frame(rpc::return_exception(call.question_id, "promise broken"));
                    Ok(())
                }
                Some(cap) => self.handle_resolved_call(cap, call, raw, sink, depth + 1),
                None => {
                    trace!(export_id, question_id = call.question_id, "queueing on promise");
                    // The replay re-dispatches the whole frame, so the
                    // answer entry must not look outstanding meanwhile.
                    self.answers.remove(&call.question_id);
                    self.queued_promise_calls
                        .entry(export_id)
                        .or_default()
                        .push(QueuedCall {
                            question_id: call.question_id,
                            frame: raw.clone(),
                        });
                    Ok(())
                }
            }
        } else {
            match self.call_handler.clone() {
                Some(handler) => self.dispatch_host_call(handler, call, sink),
                None => {
                    sink.send_frame(rpc::return_exception(
                        call.question_id,
                        "missing promised capability handler",
                    ));
                    Ok(())
                }
            }
        }
    }

    fn handle_resolved_call(
        &mut self,
        cap: ResolvedCap,
        call: &Call<'_>,
        raw: &Bytes,
        sink: &mut dyn FrameSink,
        depth: usize,
    ) -> Result<(), PeerError> {
        if depth > MAX_RESOLUTION_DEPTH {
            sink.send_frame(rpc::return_exception(call.question_id, "promise broken"));
            return Ok(());
        }
        match cap {
            ResolvedCap::Exported { id } => self.dispatch_to_export(id, call, raw, sink, depth),
            ResolvedCap::Imported { id } => {
                self.forward_call(MessageTarget::ImportedCap(id), call, sink)
            }
            ResolvedCap::Promised(pa) => {
                self.forward_call(MessageTarget::PromisedAnswer(pa), call, sink)
            }
            ResolvedCap::None => {
                sink.send_frame(rpc::return_exception(
                    call.question_id,
                    "promised answer missing",
                ));
                Ok(())
            }
        }
    }

    fn dispatch_host_call(
        &mut self,
        handler: std::sync::Arc<dyn super::CallHandler>,
        call: &Call<'_>,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        let caps = match &call.params {
            Some(payload) => inbound::resolve_descriptors(&mut self.cap_table, &payload.cap_table),
            None => Default::default(),
        };
        let content = match call.params.as_ref().and_then(|p| p.content.as_ref()) {
            Some(any) => Some(clone_any(any)?),
            None => None,
        };
        // The host owns the param references now; it hands them back
        // through release_import when it is done with them.
        let inbound_call = InboundCall {
            answer_id: call.question_id,
            interface_id: call.interface_id,
            method_id: call.method_id,
            content,
            caps: caps.resolved(),
        };
        match handler.on_call(inbound_call) {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(question_id = call.question_id, error = %err, "host handler failed");
                sink.send_frame(rpc::return_exception(call.question_id, &err.to_string()));
                Ok(())
            }
        }
    }

    /// Re-emits an inbound call to the peer with a rewritten target,
    /// registering the forwarded question that will translate the
    /// eventual Return.
    fn forward_call(
        &mut self,
        target: MessageTarget,
        call: &Call<'_>,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        let upstream_answer_id = call.question_id;
        let forwarded_qid = self.alloc_question_id();
        let mut cb = rpc::call(forwarded_qid, call.interface_id, call.method_id, &target);

        // Pass the params through: copy the content, resolve the inbound
        // descriptors, rewrite cap indices into local ids, then let the
        // walker re-encode them for the outbound direction.
        let mut param_imports = Vec::new();
        if let Some(params) = &call.params {
            if let Some(content) = &params.content {
                cb.msg
                    .copy_into_slot(cb.payload.struct_handle(), cb.payload.content_slot(), content)?;
            }
            let caps = inbound::resolve_descriptors(&mut self.cap_table, &params.cap_table);
            let resolved = caps.resolved();
            param_imports = caps.noted_counts();
            let resolved_answers = &self.resolved_answers;
            outbound::rewrite_cap_words(
                &mut cb.msg,
                cb.payload.content_ptr_word(),
                |index| -> Result<Option<u32>, PeerError> {
                    let cap = resolved
                        .get(index as usize)
                        .ok_or(outbound::OutboundError::InvalidPointer)?;
                    local_id_for_forward(resolved_answers, cap)
                },
            )?;
        }

        let mode = match &call.send_results_to {
            SendResultsTo::Caller => ForwardMode::TranslateToCaller,
            SendResultsTo::Yourself => match &target {
                // A concrete upstream cap can be stitched: the caller
                // takes the results straight from the forwarded
                // question.
                MessageTarget::ImportedCap(_) => ForwardMode::SentElsewhere,
                MessageTarget::PromisedAnswer(_) => ForwardMode::PropagateResultsSentElsewhere,
            },
            SendResultsTo::ThirdParty(_) => ForwardMode::PropagateAcceptFromThirdParty,
        };

        let mut third_party = None;
        let mut suppress_finish = false;
        match mode {
            ForwardMode::TranslateToCaller | ForwardMode::PropagateResultsSentElsewhere => {}
            ForwardMode::SentElsewhere => {
                cb.send_results_to_yourself();
                suppress_finish = true;
            }
            ForwardMode::PropagateAcceptFromThirdParty => {
                if let SendResultsTo::ThirdParty(handle) = &call.send_results_to {
                    cb.send_results_to_third_party(handle.as_ref())?;
                    third_party = match handle {
                        Some(any) => Some(clone_any(any)?),
                        None => None,
                    };
                }
                cb.allow_third_party_tail_call(call.allow_third_party_tail_call);
            }
        }

        outbound::encode_payload(&mut cb.msg, &cb.payload, &mut self.cap_table, &mut self.exports)?;

        let mut question = Question::new(QuestionKind::Call);
        question.param_imports = param_imports;
        question.suppress_finish = suppress_finish;
        question.forwarded = Some(ForwardedQuestion {
            mode,
            upstream_answer_id,
            third_party,
        });
        self.questions.insert(forwarded_qid, question);
        if mode != ForwardMode::TranslateToCaller {
            self.forwarded_questions
                .insert(forwarded_qid, upstream_answer_id);
        }

        debug!(
            forwarded_qid,
            upstream_answer_id,
            ?mode,
            "forwarding call"
        );
        sink.send_frame(cb.msg.into_frame());

        if mode == ForwardMode::SentElsewhere {
            // Stitch: the caller takes its results from the forwarded
            // question, and its Finish later propagates upstream.
            self.forwarded_tail_questions
                .insert(upstream_answer_id, forwarded_qid);
            sink.send_frame(rpc::return_take_from_other_question(
                upstream_answer_id,
                forwarded_qid,
            ));
        }
        Ok(())
    }
}

/// Maps a resolved inbound param cap to the local id the forwarded
/// payload should carry; `None` nulls the pointer.
fn local_id_for_forward(
    resolved_answers: &std::collections::HashMap<u32, Bytes>,
    cap: &ResolvedCap,
) -> Result<Option<u32>, PeerError> {
    match cap {
        ResolvedCap::None => Ok(None),
        ResolvedCap::Exported { id } | ResolvedCap::Imported { id } => Ok(Some(*id)),
        ResolvedCap::Promised(pa) => match resolved_answers.get(&pa.question_id) {
            None => Ok(None),
            Some(frame) => match crate::pipeline::resolve_promised_answer(frame, &pa.ops)? {
                ResolvedCap::Exported { id } | ResolvedCap::Imported { id } => Ok(Some(id)),
                _ => Ok(None),
            },
        },
    }
}
