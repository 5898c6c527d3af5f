//! Frame dispatch: one handler per inbound message tag.

use bytes::Bytes;
use capnrpc_wire::frame::Frame;
use capnrpc_wire::rpc::{
    self, DecodeError, Disembargo, DisembargoContext, Exception, Finish, Join, MessageTag,
    MessageTarget, Provide, Release, Resolve, ResolveBody, Return, ReturnBody, RpcMessage,
    ThirdPartyAnswer, UnimplementedEcho,
};
use capnrpc_wire::Message;
use tracing::{debug, trace, warn};

use crate::export::{ReleaseOutcome, ResolvedCap};
use crate::inbound::{self, InboundCaps};
use crate::outbound;
use crate::peer::{
    clone_any, is_adopted_answer_id, AnswerDisposition, AnswerState, FrameSink, PeerError,
    PendingAwait, Question, QueuedAccept, ResolvedImport,
};

use super::Peer;

impl Peer {
    /// Dispatches one reassembled frame.
    ///
    /// A returned error is connection-fatal; per-question failures have
    /// already been answered through `sink`.
    pub fn handle_frame(
        &mut self,
        frame: &Frame,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        let msg = Message::from_frame(frame);
        let record = rpc::decode(&msg)?;
        trace!(tag = ?message_tag(&record), "RECV");
        match record {
            RpcMessage::Unimplemented(echo) => self.handle_unimplemented(echo, sink),
            RpcMessage::Abort(exception) => self.handle_abort(exception),
            RpcMessage::Call(call) => self.handle_call(&call, frame.as_bytes(), sink),
            RpcMessage::Return(ret) => self.handle_return(&ret, frame.as_bytes(), sink),
            RpcMessage::Finish(finish) => self.handle_finish(&finish, sink),
            RpcMessage::Resolve(resolve) => self.handle_resolve(&resolve, sink),
            RpcMessage::Release(release) => {
                self.handle_release(&release, sink);
                Ok(())
            }
            RpcMessage::Bootstrap { question_id } => self.handle_bootstrap(question_id, sink),
            RpcMessage::Provide(provide) => {
                let question_id = provide.question_id;
                self.per_question(question_id, sink, |peer, sink| {
                    peer.handle_provide(&provide, sink)
                })
            }
            RpcMessage::Accept(accept) => {
                let question_id = accept.question_id;
                let provision = accept
                    .provision
                    .as_ref()
                    .and_then(|any| any.as_key_bytes());
                let embargo = accept.embargo;
                self.per_question(question_id, sink, |peer, sink| {
                    peer.handle_accept(question_id, provision, embargo, sink)
                })
            }
            RpcMessage::Join(join) => {
                let question_id = join.question_id;
                self.per_question(question_id, sink, |peer, sink| peer.handle_join(&join, sink))
            }
            RpcMessage::Disembargo(disembargo) => self.handle_disembargo(&disembargo, sink),
            RpcMessage::ThirdPartyAnswer(tpa) => self.handle_third_party_answer(&tpa, sink),
            RpcMessage::Obsolete(tag) => {
                debug!(?tag, "obsolete message tag, replying unimplemented");
                sink.send_frame(rpc::unimplemented_echo(&msg)?);
                Ok(())
            }
        }
    }

    /// Re-dispatches an owned frame (queued-call replay, buffered
    /// third-party Returns).
    pub(crate) fn handle_frame_bytes(
        &mut self,
        bytes: &Bytes,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        let frame = Frame::parse(bytes.clone())
            .map_err(|_| PeerError::Decode(DecodeError::UnexpectedMessage))?;
        self.handle_frame(&frame, sink)
    }

    /// Runs a handler, converting its per-question failures into an
    /// exception Return for `question_id`. Fatal errors pass through.
    fn per_question<F>(
        &mut self,
        question_id: u32,
        sink: &mut dyn FrameSink,
        handler: F,
    ) -> Result<(), PeerError>
    where
        F: FnOnce(&mut Self, &mut dyn FrameSink) -> Result<(), PeerError>,
    {
        match handler(self, &mut *sink) {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                self.answer_with_error(question_id, &err, sink);
                Ok(())
            }
        }
    }

    fn handle_unimplemented(
        &mut self,
        echo: Option<UnimplementedEcho>,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        if let Some(echo) = echo {
            if matches!(echo.tag, MessageTag::Bootstrap | MessageTag::Call) {
                if let Some(question_id) = echo.question_id {
                    return self.settle_question_exception(question_id, "unimplemented", sink);
                }
            }
            trace!(tag = ?echo.tag, "dropping unimplemented echo");
        }
        Ok(())
    }

    fn handle_abort(&mut self, exception: Exception) -> Result<(), PeerError> {
        warn!(reason = %exception.reason, "remote abort");
        self.last_remote_abort_reason = Some(exception.reason.clone());
        Err(PeerError::RemoteAbort(exception.reason))
    }

    fn handle_bootstrap(
        &mut self,
        question_id: u32,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        if self.answers.contains_key(&question_id) {
            self.answer_with_error(question_id, &PeerError::DuplicateQuestion, sink);
            return Ok(());
        }
        self.answers.insert(
            question_id,
            AnswerState {
                disposition: AnswerDisposition::Caller,
            },
        );
        let bootstrap_id = match self.exports.bootstrap_id() {
            Some(id) => id,
            None => {
                sink.send_frame(rpc::return_exception(
                    question_id,
                    "no bootstrap capability configured",
                ));
                return Ok(());
            }
        };
        let mut rb = rpc::return_results(question_id);
        rb.msg
            .set_cap(rb.payload.struct_handle(), rb.payload.content_slot(), bootstrap_id)?;
        outbound::encode_payload(&mut rb.msg, &rb.payload, &mut self.cap_table, &mut self.exports)?;
        let frame = rb.msg.into_frame();
        self.cache_resolved_answer(question_id, frame.clone());
        sink.send_frame(frame);
        Ok(())
    }

    pub(crate) fn handle_return(
        &mut self,
        ret: &Return<'_>,
        raw: &Bytes,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        let mut question_id = ret.answer_id;
        let mut adopted_id = None;

        if !self.questions.contains_key(&question_id) && is_adopted_answer_id(question_id) {
            match self.adopted_answers.get(&question_id) {
                Some(original) => {
                    adopted_id = Some(question_id);
                    question_id = *original;
                }
                None => {
                    // Arrived ahead of adoption; parked until the
                    // matching ThirdPartyAnswer or accept shows up.
                    self.pending_third_party_returns
                        .insert(question_id, raw.clone());
                    return Ok(());
                }
            }
        }

        // An accept_from_third_party on a live plain question does not
        // settle it; it only wires up the adoption.
        if let ReturnBody::AcceptFromThirdParty(handle) = &ret.body {
            let is_plain = self
                .questions
                .get(&question_id)
                .is_some_and(|q| q.forwarded.is_none());
            if is_plain {
                let key = handle
                    .as_ref()
                    .and_then(|any| any.as_key_bytes())
                    .ok_or(PeerError::Decode(DecodeError::MissingThirdPartyCapDescriptor))?;
                return self.adopt_from_return(question_id, key, sink);
            }
        }

        let mut question = match self.questions.remove(&question_id) {
            Some(question) => question,
            None => {
                // Tolerated Return/Finish race: the question was already
                // released.
                trace!(question_id, "return for unknown question, swallowed");
                return Ok(());
            }
        };
        if let Some(adopted) = adopted_id {
            self.adopted_answers.remove(&adopted);
        }

        if ret.release_param_caps {
            for id in &question.param_exports {
                self.exports.release(*id, 1);
            }
        }
        for (id, count) in std::mem::take(&mut question.param_imports) {
            if self.cap_table.release_import_count(id, count) {
                self.resolved_imports.remove(&id);
            }
            sink.send_frame(rpc::release(id, count));
        }

        if let Some(forwarded) = question.forwarded.take() {
            self.forwarded_questions.remove(&question_id);
            return self.translate_forwarded_return(&forwarded, ret, sink);
        }
        self.settle_plain_question(question_id, question, ret, sink)
    }

    fn adopt_from_return(
        &mut self,
        question_id: u32,
        key: Vec<u8>,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        if let Some(tpa_id) = self.pending_answers.remove(&key) {
            if self.adopted_answers.contains_key(&tpa_id) {
                return Err(PeerError::DuplicateThirdPartyAnswerId);
            }
            debug!(question_id, tpa_id, "adopting third party answer");
            self.adopted_answers.insert(tpa_id, question_id);
            if let Some(frame) = self.pending_third_party_returns.remove(&tpa_id) {
                self.handle_frame_bytes(&frame, sink)?;
            }
        } else {
            if self.pending_awaits.contains_key(&key) {
                return Err(PeerError::DuplicateThirdPartyAwait);
            }
            self.pending_awaits.insert(key, PendingAwait { question_id });
        }
        Ok(())
    }

    pub(crate) fn settle_plain_question(
        &mut self,
        question_id: u32,
        mut question: Question,
        ret: &Return<'_>,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        let mut caps = InboundCaps::default();
        let outcome = match &ret.body {
            ReturnBody::Results(Some(payload)) => {
                caps = inbound::resolve_descriptors(&mut self.cap_table, &payload.cap_table);
                let content = match &payload.content {
                    Some(any) => Some(clone_any(any)?),
                    None => None,
                };
                super::ReturnOutcome::Results { content }
            }
            ReturnBody::Results(None) => super::ReturnOutcome::Results { content: None },
            ReturnBody::Exception(exception) => super::ReturnOutcome::Exception(exception.clone()),
            ReturnBody::Canceled => super::ReturnOutcome::Canceled,
            ReturnBody::ResultsSentElsewhere => super::ReturnOutcome::ResultsSentElsewhere,
            ReturnBody::TakeFromOtherQuestion(other) => {
                super::ReturnOutcome::TakeFromOtherQuestion(*other)
            }
            ReturnBody::AcceptFromThirdParty(_) => super::ReturnOutcome::AcceptFromThirdParty,
        };

        if let Some(client) = question.stream_client {
            let error = match &ret.body {
                ReturnBody::Exception(exception) => Some(exception),
                _ => None,
            };
            self.streaming.note_return(client, error);
        }

        if let Some(handler) = question.on_return.as_mut() {
            handler.on_return(outcome, &mut caps);
        }

        let plan = caps.release_unretained(&mut self.cap_table);
        for id in &plan.removed_imports {
            self.resolved_imports.remove(id);
        }
        for frame in plan.frames {
            sink.send_frame(frame);
        }

        if !ret.no_finish_needed && !question.suppress_finish {
            sink.send_frame(rpc::finish(question_id, false));
        }
        Ok(())
    }

    /// Settles one of our questions with a locally synthesized exception
    /// (the unimplemented-bounce path).
    pub(crate) fn settle_question_exception(
        &mut self,
        question_id: u32,
        reason: &str,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        let ret = Return {
            answer_id: question_id,
            release_param_caps: false,
            no_finish_needed: true,
            body: ReturnBody::Exception(Exception::failed(reason)),
        };
        let question = match self.questions.remove(&question_id) {
            Some(question) => question,
            None => {
                trace!(question_id, "synthesized exception for unknown question");
                return Ok(());
            }
        };
        if let Some(forwarded) = question.forwarded {
            self.forwarded_questions.remove(&question_id);
            return self.translate_forwarded_return(&forwarded, &ret, sink);
        }
        self.settle_plain_question(question_id, question, &ret, sink)
    }

    fn handle_finish(&mut self, finish: &Finish, sink: &mut dyn FrameSink) -> Result<(), PeerError> {
        let question_id = finish.question_id;
        if self.answers.remove(&question_id).is_none() {
            trace!(question_id, "finish for unknown answer");
        }
        if let Some(entry) = self.provides_by_question.remove(&question_id) {
            self.provides_by_key.remove(&entry.recipient_key);
        }
        for queue in self.pending_embargoed_accepts.values_mut() {
            queue.retain(|accept| accept.question_id != question_id);
        }
        self.pending_embargoed_accepts.retain(|_, queue| !queue.is_empty());
        if self.join_questions.remove(&question_id) {
            for state in self.joins.values_mut() {
                state.parts.retain(|_, (qid, _)| *qid != question_id);
            }
            self.joins.retain(|_, state| !state.parts.is_empty());
        }
        if let Some(forwarded_qid) = self.forwarded_tail_questions.remove(&question_id) {
            self.forwarded_questions.remove(&forwarded_qid);
            self.questions.remove(&forwarded_qid);
            sink.send_frame(rpc::finish(forwarded_qid, finish.release_result_caps));
        }
        if let Some(frame) = self.resolved_answers.remove(&question_id) {
            if finish.release_result_caps {
                self.release_answer_frame_caps(&frame);
            }
        }
        Ok(())
    }

    fn release_answer_frame_caps(&mut self, frame: &Bytes) {
        let msg = match Message::parse_frame(frame.clone()) {
            Ok(msg) => msg,
            Err(_) => return,
        };
        if let Ok(RpcMessage::Return(ret)) = rpc::decode(&msg) {
            if let ReturnBody::Results(Some(payload)) = ret.body {
                for desc in &payload.cap_table {
                    if let rpc::CapDescriptor::SenderHosted { id }
                    | rpc::CapDescriptor::SenderPromise { id } = desc
                    {
                        self.exports.release(*id, 1);
                    }
                }
            }
        }
    }

    fn handle_release(&mut self, release: &Release, sink: &mut dyn FrameSink) {
        match self.exports.release(release.id, release.reference_count) {
            ReleaseOutcome::NotFound => {
                warn!(id = release.id, "release of unknown export");
            }
            ReleaseOutcome::Remaining(_) => {}
            ReleaseOutcome::Removed => {
                self.cap_table.clear_export_promise(release.id);
                // A promise released before resolving can never settle;
                // queued calls die with it.
                for queued in self
                    .queued_promise_calls
                    .remove(&release.id)
                    .unwrap_or_default()
                {
                    sink.send_frame(rpc::return_exception(queued.question_id, "promise broken"));
                }
            }
        }
    }

    fn handle_resolve(&mut self, resolve: &Resolve, sink: &mut dyn FrameSink) -> Result<(), PeerError> {
        let known = self.cap_table.has_import(resolve.promise_id);
        let (cap, noted) = match &resolve.body {
            ResolveBody::Cap(desc) => {
                let caps =
                    inbound::resolve_descriptors(&mut self.cap_table, std::slice::from_ref(desc));
                let cap = caps.get(0).cloned().unwrap_or(ResolvedCap::None);
                let noted = caps.noted_counts();
                (cap, noted)
            }
            ResolveBody::Exception(_) => (ResolvedCap::None, Vec::new()),
        };

        if !known {
            // Nothing is waiting on this promise; hand the new reference
            // straight back.
            for (id, count) in noted {
                if self.cap_table.release_import_count(id, count) {
                    self.resolved_imports.remove(&id);
                }
                sink.send_frame(rpc::release(id, count));
            }
            return Ok(());
        }

        let needs_embargo = matches!(
            cap,
            ResolvedCap::Exported { .. } | ResolvedCap::Promised(_)
        );
        if needs_embargo {
            let embargo_id = self.alloc_embargo_id();
            self.pending_embargoes.insert(embargo_id, resolve.promise_id);
            self.resolved_imports.insert(
                resolve.promise_id,
                ResolvedImport {
                    cap,
                    embargo_id: Some(embargo_id),
                    embargoed: true,
                },
            );
            // Calls through the resolution path hold until the loopback
            // echo drains everything already pipelined on the promise.
            sink.send_frame(rpc::disembargo_sender_loopback(
                &MessageTarget::ImportedCap(resolve.promise_id),
                embargo_id,
            ));
        } else {
            self.resolved_imports.insert(
                resolve.promise_id,
                ResolvedImport {
                    cap,
                    embargo_id: None,
                    embargoed: false,
                },
            );
        }
        Ok(())
    }

    fn handle_disembargo(
        &mut self,
        disembargo: &Disembargo,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        match &disembargo.context {
            DisembargoContext::SenderLoopback { embargo_id } => {
                let target = disembargo
                    .target
                    .as_ref()
                    .ok_or(PeerError::Decode(DecodeError::MissingCallTarget))?;
                sink.send_frame(rpc::disembargo_receiver_loopback(target, *embargo_id));
                Ok(())
            }
            DisembargoContext::ReceiverLoopback { embargo_id } => {
                match self.pending_embargoes.remove(embargo_id) {
                    None => {
                        warn!(embargo_id, "receiver loopback for unknown embargo");
                    }
                    Some(promise_id) => {
                        if let Some(resolved) = self.resolved_imports.get_mut(&promise_id) {
                            resolved.embargoed = false;
                            resolved.embargo_id = None;
                        }
                    }
                }
                Ok(())
            }
            DisembargoContext::Accept { token } => {
                let token = match token {
                    Some(token) => token,
                    None => {
                        warn!("disembargo accept without a token");
                        return Ok(());
                    }
                };
                for accept in self
                    .pending_embargoed_accepts
                    .remove(token.as_slice())
                    .unwrap_or_default()
                {
                    self.send_provided_return(&accept, sink)?;
                }
                Ok(())
            }
            DisembargoContext::Provide { question_id } => {
                trace!(question_id, "disembargo provide, bookkeeping only");
                Ok(())
            }
        }
    }

    fn handle_provide(
        &mut self,
        provide: &Provide<'_>,
        _sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        let question_id = provide.question_id;
        if self.provides_by_question.contains_key(&question_id)
            || self.answers.contains_key(&question_id)
        {
            return Err(PeerError::DuplicateProvide);
        }
        let recipient_key = provide
            .recipient
            .as_ref()
            .and_then(|any| any.as_key_bytes())
            .ok_or(PeerError::MissingProvisionKey)?;
        if self.provides_by_key.contains_key(&recipient_key) {
            return Err(PeerError::DuplicateProvide);
        }
        let target = self.resolve_local_target(&provide.target)?;
        self.answers.insert(
            question_id,
            AnswerState {
                disposition: AnswerDisposition::Caller,
            },
        );
        self.provides_by_question.insert(
            question_id,
            super::ProvideEntry {
                recipient_key: recipient_key.clone(),
                target,
            },
        );
        self.provides_by_key.insert(recipient_key, question_id);
        Ok(())
    }

    fn handle_accept(
        &mut self,
        question_id: u32,
        provision: Option<Vec<u8>>,
        embargo: bool,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        let key = provision.ok_or(PeerError::MissingProvisionKey)?;
        if self.answers.contains_key(&question_id) {
            return Err(PeerError::DuplicateQuestion);
        }
        self.answers.insert(
            question_id,
            AnswerState {
                disposition: AnswerDisposition::Caller,
            },
        );
        let provide_qid = match self.provides_by_key.get(&key) {
            Some(qid) => *qid,
            None => return Err(PeerError::UnknownProvision),
        };
        let target = self
            .provides_by_question
            .get(&provide_qid)
            .map(|entry| entry.target.clone())
            .ok_or(PeerError::UnknownProvision)?;

        let accept = QueuedAccept {
            question_id,
            target,
        };
        if embargo {
            // Held until the Disembargo accept releases the token.
            self.pending_embargoed_accepts
                .entry(key)
                .or_default()
                .push(accept);
            return Ok(());
        }
        self.send_provided_return(&accept, sink)?;
        // The handoff is complete: the provide question answers empty
        // and both indexes drop.
        if let Some(entry) = self.provides_by_question.remove(&provide_qid) {
            self.provides_by_key.remove(&entry.recipient_key);
        }
        let rb = rpc::return_results(provide_qid);
        sink.send_frame(rb.msg.into_frame());
        Ok(())
    }

    pub(crate) fn send_provided_return(
        &mut self,
        accept: &QueuedAccept,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        let cap_id = match &accept.target {
            ResolvedCap::None => {
                sink.send_frame(rpc::return_exception(accept.question_id, "promise broken"));
                return Ok(());
            }
            ResolvedCap::Exported { id } | ResolvedCap::Imported { id } => *id,
            ResolvedCap::Promised(pa) => self.cap_table.note_receiver_answer(pa)?,
        };
        let mut rb = rpc::return_results(accept.question_id);
        rb.msg
            .set_cap(rb.payload.struct_handle(), rb.payload.content_slot(), cap_id)?;
        outbound::encode_payload(&mut rb.msg, &rb.payload, &mut self.cap_table, &mut self.exports)?;
        let frame = rb.msg.into_frame();
        self.cache_resolved_answer(accept.question_id, frame.clone());
        sink.send_frame(frame);
        Ok(())
    }

    fn handle_third_party_answer(
        &mut self,
        tpa: &ThirdPartyAnswer,
        sink: &mut dyn FrameSink,
    ) -> Result<(), PeerError> {
        if !is_adopted_answer_id(tpa.answer_id) {
            return Err(PeerError::InvalidThirdPartyAnswerId);
        }
        if self.adopted_answers.contains_key(&tpa.answer_id) {
            return Err(PeerError::DuplicateThirdPartyAnswerId);
        }
        if let Some(awaiter) = self.pending_awaits.remove(&tpa.completion_key) {
            debug!(
                answer_id = tpa.answer_id,
                question_id = awaiter.question_id,
                "adopting third party answer for parked awaiter"
            );
            self.adopted_answers.insert(tpa.answer_id, awaiter.question_id);
            if let Some(frame) = self.pending_third_party_returns.remove(&tpa.answer_id) {
                self.handle_frame_bytes(&frame, sink)?;
            }
            return Ok(());
        }
        match self.pending_answers.get(&tpa.completion_key) {
            Some(existing) if *existing == tpa.answer_id => {}
            Some(_) => return Err(PeerError::ConflictingThirdPartyAnswer),
            None => {
                self.pending_answers
                    .insert(tpa.completion_key.clone(), tpa.answer_id);
            }
        }
        Ok(())
    }

    fn handle_join(&mut self, join: &Join, sink: &mut dyn FrameSink) -> Result<(), PeerError> {
        let question_id = join.question_id;
        if self.join_questions.contains(&question_id) || self.answers.contains_key(&question_id) {
            return Err(PeerError::DuplicateJoin);
        }
        let target = self.resolve_local_target(&join.target)?;
        let join_id = join.key_part.join_id;

        let fresh = !self.joins.contains_key(&join_id);
        let mismatch = {
            let state = self.joins.entry(join_id).or_insert_with(|| super::JoinState {
                part_count: join.key_part.part_count,
                parts: std::collections::HashMap::new(),
            });
            state.part_count != join.key_part.part_count
                || state.parts.contains_key(&join.key_part.part_num)
        };
        if mismatch {
            if fresh {
                self.joins.remove(&join_id);
            }
            return Err(PeerError::JoinPartMismatch);
        }

        let complete = {
            let state = self.joins.get_mut(&join_id).expect("join state present");
            state
                .parts
                .insert(join.key_part.part_num, (question_id, target));
            state.parts.len() == state.part_count as usize
        };
        self.join_questions.insert(question_id);
        self.answers.insert(
            question_id,
            AnswerState {
                disposition: AnswerDisposition::Caller,
            },
        );

        if complete {
            let state = self.joins.remove(&join_id).expect("join state present");
            let mut parts: Vec<_> = state.parts.into_iter().collect();
            parts.sort_by_key(|(num, _)| *num);
            let caps: Vec<ResolvedCap> =
                parts.iter().map(|(_, (_, cap))| cap.clone()).collect();
            debug!(join_id, parts = caps.len(), "join complete");
            if let Some(callback) = self.on_join_complete.as_mut() {
                callback(join_id, caps);
            }
            for (_, (part_qid, _)) in parts {
                self.join_questions.remove(&part_qid);
                let rb = rpc::return_results(part_qid);
                sink.send_frame(rb.msg.into_frame());
            }
        }
        Ok(())
    }
}

fn message_tag(record: &RpcMessage<'_>) -> MessageTag {
    match record {
        RpcMessage::Unimplemented(_) => MessageTag::Unimplemented,
        RpcMessage::Abort(_) => MessageTag::Abort,
        RpcMessage::Call(_) => MessageTag::Call,
        RpcMessage::Return(_) => MessageTag::Return,
        RpcMessage::Finish(_) => MessageTag::Finish,
        RpcMessage::Resolve(_) => MessageTag::Resolve,
        RpcMessage::Release(_) => MessageTag::Release,
        RpcMessage::Bootstrap { .. } => MessageTag::Bootstrap,
        RpcMessage::Provide(_) => MessageTag::Provide,
        RpcMessage::Accept(_) => MessageTag::Accept,
        RpcMessage::Join(_) => MessageTag::Join,
        RpcMessage::Disembargo(_) => MessageTag::Disembargo,
        RpcMessage::ThirdPartyAnswer(_) => MessageTag::ThirdPartyAnswer,
        RpcMessage::Obsolete(tag) => *tag,
    }
}
