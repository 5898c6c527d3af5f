//! The forwarded-return translator: rewrites a Return that settled one
//! of our forwarded questions into the Return the upstream caller should
//! see, driven by the question's [`ForwardMode`].

use bytes::Bytes;
use capnrpc_wire::message::AnyReader;
use capnrpc_wire::rpc::{self, Payload, Return, ReturnBody};
use capnrpc_wire::Message;
use tracing::{debug, warn};

use crate::inbound;
use crate::outbound;
use crate::peer::{ForwardMode, ForwardedQuestion, FrameSink, PeerError};

use super::Peer;

impl Peer {
    /// Applies the mode matrix to one inbound Return on a forwarded
    /// question. `forwarded` has already been detached from the question
    /// table.
    pub(crate) fn translate_forwarded_return(
        &mut self,
        forwarded: &ForwardedQuestion,
        ret: &Return<'_>,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        let upstream = forwarded.upstream_answer_id;
        debug!(upstream, mode = ?forwarded.mode, "translating forwarded return");
        match forwarded.mode {
            ForwardMode::TranslateToCaller => match &ret.body {
                ReturnBody::Results(Some(payload)) => self.pass_results(upstream, payload, sink),
                ReturnBody::Results(None) => {
                    sink.send_frame(rpc::return_exception(
                        upstream,
                        "forwarded return missing payload",
                    ));
                    Ok(())
                }
                ReturnBody::Exception(exception) => {
                    sink.send_frame(rpc::return_exception(upstream, &exception.reason));
                    Ok(())
                }
                ReturnBody::Canceled => {
                    sink.send_frame(rpc::return_canceled(upstream));
                    Ok(())
                }
                ReturnBody::ResultsSentElsewhere => {
                    sink.send_frame(rpc::return_exception(
                        upstream,
                        "forwarded return results_sent_elsewhere unsupported",
                    ));
                    Ok(())
                }
                ReturnBody::TakeFromOtherQuestion(other) => {
                    match self.forwarded_questions.get(other) {
                        Some(other_upstream) => {
                            sink.send_frame(rpc::return_take_from_other_question(
                                upstream,
                                *other_upstream,
                            ));
                        }
                        None => {
                            warn!(other, "take_from_other_question names no forwarded question");
                            sink.send_frame(rpc::return_exception(
                                upstream,
                                "forwarded return take_from_other_question unknown",
                            ));
                        }
                    }
                    Ok(())
                }
                ReturnBody::AcceptFromThirdParty(handle) => {
                    self.pass_accept(upstream, handle.as_ref(), sink)
                }
            },

            ForwardMode::SentElsewhere => match &ret.body {
                // The tail was stitched with take_from_other_question;
                // the only legitimate endings flow through the caller's
                // own stitch.
                ReturnBody::ResultsSentElsewhere | ReturnBody::Canceled => Ok(()),
                _ => Err(PeerError::UnexpectedForwardedTailReturn),
            },

            ForwardMode::PropagateResultsSentElsewhere => match &ret.body {
                ReturnBody::Results(_)
                | ReturnBody::ResultsSentElsewhere
                | ReturnBody::AcceptFromThirdParty(_) => {
                    sink.send_frame(rpc::return_results_sent_elsewhere(upstream));
                    Ok(())
                }
                ReturnBody::Exception(exception) => {
                    sink.send_frame(rpc::return_exception(upstream, &exception.reason));
                    Ok(())
                }
                ReturnBody::Canceled => {
                    sink.send_frame(rpc::return_canceled(upstream));
                    Ok(())
                }
                ReturnBody::TakeFromOtherQuestion(_) => {
                    sink.send_frame(rpc::return_exception(
                        upstream,
                        "forwarded return take_from_other_question unsupported",
                    ));
                    Ok(())
                }
            },

            ForwardMode::PropagateAcceptFromThirdParty => match &ret.body {
                ReturnBody::Results(Some(payload)) => self.pass_results(upstream, payload, sink),
                ReturnBody::Results(None) => {
                    sink.send_frame(rpc::return_exception(
                        upstream,
                        "forwarded return missing payload",
                    ));
                    Ok(())
                }
                ReturnBody::Exception(exception) => {
                    sink.send_frame(rpc::return_exception(upstream, &exception.reason));
                    Ok(())
                }
                ReturnBody::Canceled => {
                    sink.send_frame(rpc::return_canceled(upstream));
                    Ok(())
                }
                ReturnBody::ResultsSentElsewhere => {
                    // The callee handed off as instructed; tell the
                    // caller where to accept from.
                    self.pass_accept_stored(upstream, forwarded.third_party.clone(), sink)
                }
                ReturnBody::TakeFromOtherQuestion(_) => {
                    sink.send_frame(rpc::return_exception(
                        upstream,
                        "forwarded return take_from_other_question unsupported",
                    ));
                    Ok(())
                }
                ReturnBody::AcceptFromThirdParty(handle) => {
                    self.pass_accept(upstream, handle.as_ref(), sink)
                }
            },
        }
    }

    /// Pass-through of a results payload: content copied, inbound caps
    /// resolved and rewritten to local ids, then re-encoded outbound.
    /// Failures fall back to an exception Return carrying the error
    /// name.
    fn pass_results(
        &mut self,
        upstream: u32,
        payload: &Payload<'_>,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        match self.encode_passed_results(upstream, payload) {
            Ok((frame, release_frames)) => {
                self.cache_resolved_answer(upstream, frame.clone());
                sink.send_frame(frame);
                for release in release_frames {
                    sink.send_frame(release);
                }
                Ok(())
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(upstream, error = %err, "forwarded results failed to encode");
                sink.send_frame(rpc::return_exception(upstream, err.error_name()));
                Ok(())
            }
        }
    }

    fn encode_passed_results(
        &mut self,
        upstream: u32,
        payload: &Payload<'_>,
    ) -> Result<(Bytes, Vec<Bytes>), PeerError> {
        let mut rb = rpc::return_results(upstream);
        if let Some(content) = &payload.content {
            rb.msg
                .copy_into_slot(rb.payload.struct_handle(), rb.payload.content_slot(), content)?;
        }
        let caps = inbound::resolve_descriptors(&mut self.cap_table, &payload.cap_table);
        let resolved = caps.resolved();
        let resolved_answers = &self.resolved_answers;
        outbound::rewrite_cap_words(
            &mut rb.msg,
            rb.payload.content_ptr_word(),
            |index| -> Result<Option<u32>, PeerError> {
                let cap = resolved
                    .get(index as usize)
                    .ok_or(outbound::OutboundError::InvalidPointer)?;
                match cap {
                    crate::export::ResolvedCap::None => Ok(None),
                    crate::export::ResolvedCap::Exported { id }
                    | crate::export::ResolvedCap::Imported { id } => Ok(Some(*id)),
                    crate::export::ResolvedCap::Promised(pa) => {
                        match resolved_answers.get(&pa.question_id) {
                            None => Ok(None),
                            Some(frame) => {
                                match crate::pipeline::resolve_promised_answer(frame, &pa.ops)? {
                                    crate::export::ResolvedCap::Exported { id }
                                    | crate::export::ResolvedCap::Imported { id } => Ok(Some(id)),
                                    _ => Ok(None),
                                }
                            }
                        }
                    }
                }
            },
        )?;
        outbound::encode_payload(&mut rb.msg, &rb.payload, &mut self.cap_table, &mut self.exports)?;
        // The peer keeps its own references for the caps it sent; the
        // ones we noted while resolving are handed straight back.
        let plan = caps.release_unretained(&mut self.cap_table);
        for id in &plan.removed_imports {
            self.resolved_imports.remove(id);
        }
        let frame = rb.msg.into_frame();
        Ok((frame, plan.frames))
    }

    fn pass_accept(
        &mut self,
        upstream: u32,
        handle: Option<&AnyReader<'_>>,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        let frame = rpc::return_accept_from_third_party(upstream, handle)?;
        sink.send_frame(frame);
        Ok(())
    }

    fn pass_accept_stored(
        &mut self,
        upstream: u32,
        stored: Option<Bytes>,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        let frame = match stored {
            Some(segment) => {
                let msg = Message::from_segment(segment);
                let root = msg.root()?;
                rpc::return_accept_from_third_party(upstream, root.as_ref())?
            }
            None => rpc::return_accept_from_third_party(upstream, None)?,
        };
        sink.send_frame(frame);
        Ok(())
    }
}
