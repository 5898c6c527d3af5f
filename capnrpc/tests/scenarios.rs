//! End-to-end peer scenarios, driven frame by frame against a `Vec`
//! sink.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use capnrpc::inbound::InboundCaps;
use capnrpc::peer::{CallHandler, InboundCall, Peer, ReturnHandler, ReturnOutcome};
use capnrpc::wire::rpc::{
    self, CapDescriptor, DisembargoContext, Exception, JoinKeyPart, MessageTarget, PromisedAnswer,
    ReturnBody, RpcMessage,
};
use capnrpc::wire::{Frame, Message, MessageBuilder};
use capnrpc::ResolvedCap;

fn feed(peer: &mut Peer, frame_bytes: Bytes, sink: &mut Vec<Bytes>) {
    let frame = Frame::parse(frame_bytes).unwrap();
    peer.handle_frame(&frame, sink).unwrap();
}

fn decode_return(bytes: &Bytes) -> (u32, &'static str, Option<String>) {
    let msg = Message::parse_frame(bytes.clone()).unwrap();
    match rpc::decode(&msg).unwrap() {
        RpcMessage::Return(r) => {
            let (kind, reason) = match r.body {
                ReturnBody::Results(_) => ("results", None),
                ReturnBody::Exception(e) => ("exception", Some(e.reason)),
                ReturnBody::Canceled => ("canceled", None),
                ReturnBody::ResultsSentElsewhere => ("results_sent_elsewhere", None),
                ReturnBody::TakeFromOtherQuestion(_) => ("take_from_other_question", None),
                ReturnBody::AcceptFromThirdParty(_) => ("accept_from_third_party", None),
            };
            (r.answer_id, kind, reason)
        }
        other => panic!("expected return, got {other:?}"),
    }
}

/// Builds a Return whose union selects `results` but whose payload
/// pointer is null, which no public builder emits on purpose.
fn return_with_null_results(answer_id: u32) -> Bytes {
    let mut b = MessageBuilder::new();
    let root = b.init_root(1, 1);
    b.set_u16(root, 0, 3); // Return
    let body = b.init_struct(root, 0, 2, 1);
    b.set_u32(body, 0, answer_id);
    b.set_u16(body, 6, 0); // results
    b.into_frame()
}

/// Builds a byte-list segment usable as an opaque key payload.
fn key_segment(key: &[u8]) -> Bytes {
    let mut b = MessageBuilder::new();
    let root = b.init_root(0, 1);
    b.set_byte_list(root, 0, key);
    b.into_segment()
}

fn return_accept_with_key(answer_id: u32, key: &[u8]) -> Bytes {
    let segment = key_segment(key);
    let msg = Message::from_segment(segment);
    let root = msg.root_struct().unwrap();
    let any = root.get_pointer(0).unwrap().unwrap();
    rpc::return_accept_from_third_party(answer_id, Some(&any)).unwrap()
}

#[derive(Default)]
struct Recorded {
    outcomes: Vec<String>,
    caps: Vec<Vec<ResolvedCap>>,
}

/// Records outcomes and retains every cap it sees.
#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Recorded>>);

impl Recorder {
    fn handler(&self) -> Box<dyn ReturnHandler> {
        Box::new(self.clone())
    }

    fn outcomes(&self) -> Vec<String> {
        self.0.lock().unwrap().outcomes.clone()
    }
}

impl ReturnHandler for Recorder {
    fn on_return(&mut self, outcome: ReturnOutcome, caps: &mut InboundCaps) {
        let label = match outcome {
            ReturnOutcome::Results { .. } => "results".to_owned(),
            ReturnOutcome::Exception(Exception { reason, .. }) => format!("exception:{reason}"),
            ReturnOutcome::Canceled => "canceled".to_owned(),
            ReturnOutcome::ResultsSentElsewhere => "results_sent_elsewhere".to_owned(),
            ReturnOutcome::TakeFromOtherQuestion(q) => format!("take_from:{q}"),
            ReturnOutcome::AcceptFromThirdParty => "accept_from_third_party".to_owned(),
        };
        caps.retain_all();
        let mut recorded = self.0.lock().unwrap();
        recorded.outcomes.push(label);
        recorded.caps.push((0..caps.len()).filter_map(|i| caps.get(i).cloned()).collect());
    }
}

struct CountingHandler {
    calls: AtomicU32,
}

impl CallHandler for CountingHandler {
    fn on_call(&self, call: InboundCall) -> Result<(), capnrpc::HostError> {
        assert_eq!(call.interface_id, 0xaa);
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// S1: bootstrap round trip.
#[test]
fn bootstrap_round_trip_pins_and_references_the_export() {
    let mut peer = Peer::builder().bootstrap_export_id(17).build();
    let mut sink = Vec::new();

    feed(&mut peer, rpc::bootstrap(5), &mut sink);

    assert_eq!(sink.len(), 1);
    let msg = Message::parse_frame(sink[0].clone()).unwrap();
    match rpc::decode(&msg).unwrap() {
        RpcMessage::Return(r) => {
            assert_eq!(r.answer_id, 5);
            match r.body {
                ReturnBody::Results(Some(payload)) => {
                    assert_eq!(payload.content.unwrap().as_capability(), Some(0));
                    assert_eq!(
                        payload.cap_table,
                        vec![CapDescriptor::SenderHosted { id: 17 }]
                    );
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(peer.export_ref_count(17), Some(1));
    assert!(peer.has_resolved_answer(5));
}

// Property 4: pipelined call through the cached bootstrap answer.
#[test]
fn pipelined_call_on_bootstrap_answer_reaches_the_host() {
    let handler = Arc::new(CountingHandler {
        calls: AtomicU32::new(0),
    });
    let mut peer = Peer::builder()
        .bootstrap_export_id(17)
        .call_handler(handler.clone())
        .build();
    let mut sink = Vec::new();

    feed(&mut peer, rpc::bootstrap(5), &mut sink);
    sink.clear();

    let target = MessageTarget::PromisedAnswer(PromisedAnswer {
        question_id: 5,
        ops: vec![],
    });
    let call = rpc::call(6, 0xaa, 1, &target);
    feed(&mut peer, call.msg.into_frame(), &mut sink);

    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert!(sink.is_empty(), "host handles it, no immediate reply");
}

#[test]
fn pipelined_call_without_cached_answer_is_answered_with_exception() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();

    let target = MessageTarget::PromisedAnswer(PromisedAnswer {
        question_id: 99,
        ops: vec![],
    });
    let call = rpc::call(6, 0xaa, 1, &target);
    feed(&mut peer, call.msg.into_frame(), &mut sink);

    let (answer_id, kind, reason) = decode_return(&sink[0]);
    assert_eq!(answer_id, 6);
    assert_eq!(kind, "exception");
    assert_eq!(reason.as_deref(), Some("promised answer missing"));
}

// S5: promise resolution with embargo.
#[test]
fn resolve_of_known_import_embargoes_until_receiver_loopback() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();
    let recorder = Recorder::default();

    // Make import 9 known: settle a bootstrap question with a
    // sender-promise descriptor for id 9, retained by the handler.
    let qid = peer.send_bootstrap(Some(recorder.handler()), &mut sink);
    sink.clear();
    let mut rb = rpc::return_results(qid);
    rb.msg
        .set_cap(rb.payload.struct_handle(), rb.payload.content_slot(), 0)
        .unwrap();
    rpc::write_cap_table(
        &mut rb.msg,
        &rb.payload,
        &[CapDescriptor::SenderPromise { id: 9 }],
    )
    .unwrap();
    feed(&mut peer, rb.msg.into_frame(), &mut sink);
    assert_eq!(peer.import_ref_count(9), 1);
    sink.clear();

    feed(
        &mut peer,
        rpc::resolve_cap(9, &CapDescriptor::SenderHosted { id: 42 }).unwrap(),
        &mut sink,
    );

    let (cap, embargoed) = peer.resolved_import(9).expect("resolution recorded");
    assert_eq!(cap, ResolvedCap::Exported { id: 42 });
    assert!(embargoed);

    // A Disembargo sender_loopback went out with a fresh embargo id.
    let msg = Message::parse_frame(sink[0].clone()).unwrap();
    let embargo_id = match rpc::decode(&msg).unwrap() {
        RpcMessage::Disembargo(d) => {
            assert_eq!(d.target, Some(MessageTarget::ImportedCap(9)));
            match d.context {
                DisembargoContext::SenderLoopback { embargo_id } => embargo_id,
                other => panic!("unexpected {other:?}"),
            }
        }
        other => panic!("unexpected {other:?}"),
    };
    sink.clear();

    feed(
        &mut peer,
        rpc::disembargo_receiver_loopback(&MessageTarget::ImportedCap(9), embargo_id),
        &mut sink,
    );
    let (_, embargoed) = peer.resolved_import(9).unwrap();
    assert!(!embargoed, "receiver loopback clears the embargo");
}

#[test]
fn resolve_of_unknown_import_releases_the_cap_immediately() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();

    feed(
        &mut peer,
        rpc::resolve_cap(77, &CapDescriptor::SenderHosted { id: 42 }).unwrap(),
        &mut sink,
    );

    assert!(peer.resolved_import(77).is_none());
    let msg = Message::parse_frame(sink[0].clone()).unwrap();
    match rpc::decode(&msg).unwrap() {
        RpcMessage::Release(r) => {
            assert_eq!(r.id, 42);
            assert_eq!(r.reference_count, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(peer.import_ref_count(42), 0);
}

#[test]
fn sender_loopback_is_echoed_as_receiver_loopback() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();

    feed(
        &mut peer,
        rpc::disembargo_sender_loopback(&MessageTarget::ImportedCap(3), 88),
        &mut sink,
    );

    let msg = Message::parse_frame(sink[0].clone()).unwrap();
    match rpc::decode(&msg).unwrap() {
        RpcMessage::Disembargo(d) => {
            assert_eq!(d.target, Some(MessageTarget::ImportedCap(3)));
            assert!(matches!(
                d.context,
                DisembargoContext::ReceiverLoopback { embargo_id: 88 }
            ));
        }
        other => panic!("unexpected {other:?}"),
    }
}

// S6: third-party answer adoption, Return first.
#[test]
fn accept_from_third_party_adopts_a_seeded_pending_answer() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();
    let recorder = Recorder::default();

    peer.seed_pending_answer(b"K".to_vec(), 0x4000_0022);
    let qid = peer.send_bootstrap(Some(recorder.handler()), &mut sink);
    sink.clear();

    feed(&mut peer, return_accept_with_key(qid, b"K"), &mut sink);

    assert_eq!(peer.adopted_answer_for(0x4000_0022), Some(qid));
    assert_eq!(peer.pending_answer_for(b"K"), None);
    assert!(!peer.has_pending_await(b"K"));
    assert!(recorder.outcomes().is_empty(), "question still open");

    // The adopted answer id now settles the original question.
    feed(&mut peer, rpc::return_exception(0x4000_0022, "done"), &mut sink);
    assert_eq!(recorder.outcomes(), vec!["exception:done".to_owned()]);
    assert_eq!(peer.adopted_answer_for(0x4000_0022), None);
}

// S6 mirror: ThirdPartyAnswer arrives first and parks, the accept
// adopts it, and a buffered Return replays.
#[test]
fn third_party_answer_parks_then_adoption_replays_buffered_return() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();
    let recorder = Recorder::default();

    feed(&mut peer, rpc::third_party_answer(0x4000_0001, b"K"), &mut sink);
    assert_eq!(peer.pending_answer_for(b"K"), Some(0x4000_0001));

    // A repeat with the same id is a no-op; a conflicting id aborts.
    feed(&mut peer, rpc::third_party_answer(0x4000_0001, b"K"), &mut sink);
    let frame = Frame::parse(rpc::third_party_answer(0x4000_0002, b"K")).unwrap();
    let err = peer.handle_frame(&frame, &mut sink).unwrap_err();
    assert_eq!(err.error_name(), "ConflictingThirdPartyAnswer");

    // The Return for the adopted id arrives before adoption: parked.
    feed(
        &mut peer,
        rpc::return_exception(0x4000_0001, "early"),
        &mut sink,
    );
    assert_eq!(peer.stats().pending_third_party_returns, 1);

    let qid = peer.send_bootstrap(Some(recorder.handler()), &mut sink);
    sink.clear();
    feed(&mut peer, return_accept_with_key(qid, b"K"), &mut sink);

    // Adoption replayed the buffered Return and settled the question.
    assert_eq!(recorder.outcomes(), vec!["exception:early".to_owned()]);
    assert_eq!(peer.stats().pending_third_party_returns, 0);
    assert_eq!(peer.pending_answer_for(b"K"), None);
}

#[test]
fn malformed_third_party_answer_id_is_fatal() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();
    let frame = Frame::parse(rpc::third_party_answer(0x22, b"K")).unwrap();
    let err = peer.handle_frame(&frame, &mut sink).unwrap_err();
    assert_eq!(err.error_name(), "InvalidThirdPartyAnswerId");
}

// S7: forwarded-return translation of a missing payload.
#[test]
fn forwarded_return_with_null_results_becomes_the_literal_exception() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();

    // A promise export that resolves to an imported cap forces the next
    // call through the forwarding path.
    let promise_id = peer.export_promise().unwrap();
    let call = rpc::call(7, 0xbb, 0, &MessageTarget::ImportedCap(promise_id));
    feed(&mut peer, call.msg.into_frame(), &mut sink);
    assert!(sink.is_empty(), "call queued on the unresolved promise");

    peer.resolve_export(promise_id, ResolvedCap::Imported { id: 99 }, &mut sink)
        .unwrap();

    // The replay forwarded the call; find the forwarded question id.
    let forwarded_qid = sink
        .iter()
        .find_map(|bytes| {
            let msg = Message::parse_frame(bytes.clone()).unwrap();
            match rpc::decode(&msg).unwrap() {
                RpcMessage::Call(c) => {
                    assert_eq!(c.target, MessageTarget::ImportedCap(99));
                    Some(c.question_id)
                }
                _ => None,
            }
        })
        .expect("forwarded call emitted");
    sink.clear();

    feed(&mut peer, return_with_null_results(forwarded_qid), &mut sink);

    assert_eq!(sink.len(), 1);
    let (answer_id, kind, reason) = decode_return(&sink[0]);
    assert_eq!(answer_id, 7);
    assert_eq!(kind, "exception");
    assert_eq!(reason.as_deref(), Some("forwarded return missing payload"));
}

#[test]
fn yourself_tail_is_stitched_and_finish_propagates_upstream() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();

    let promise_id = peer.export_promise().unwrap();
    peer.resolve_export(promise_id, ResolvedCap::Imported { id: 99 }, &mut sink)
        .unwrap();
    sink.clear();

    let mut call = rpc::call(30, 0xcc, 2, &MessageTarget::ImportedCap(promise_id));
    call.send_results_to_yourself();
    feed(&mut peer, call.msg.into_frame(), &mut sink);

    // One forwarded Call (send_results_to yourself) plus the immediate
    // take_from_other_question stitch, in that order.
    assert_eq!(sink.len(), 2);
    let msg = Message::parse_frame(sink[0].clone()).unwrap();
    let forwarded_qid = match rpc::decode(&msg).unwrap() {
        RpcMessage::Call(c) => {
            assert!(matches!(
                c.send_results_to,
                rpc::SendResultsTo::Yourself
            ));
            c.question_id
        }
        other => panic!("unexpected {other:?}"),
    };
    let msg = Message::parse_frame(sink[1].clone()).unwrap();
    match rpc::decode(&msg).unwrap() {
        RpcMessage::Return(r) => {
            assert_eq!(r.answer_id, 30);
            assert!(matches!(
                r.body,
                ReturnBody::TakeFromOtherQuestion(q) if q == forwarded_qid
            ));
        }
        other => panic!("unexpected {other:?}"),
    }
    sink.clear();

    // The tail only accepts the elsewhere/canceled endings.
    feed(
        &mut peer,
        rpc::return_results_sent_elsewhere(forwarded_qid),
        &mut sink,
    );
    assert!(sink.is_empty());

    // Caller finishes its question; the Finish propagates upstream for
    // the forwarded question.
    feed(&mut peer, rpc::finish(30, true), &mut sink);
    assert_eq!(sink.len(), 1);
    let msg = Message::parse_frame(sink[0].clone()).unwrap();
    match rpc::decode(&msg).unwrap() {
        RpcMessage::Finish(f) => assert_eq!(f.question_id, forwarded_qid),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(peer.stats().forwarded_questions, 0);
}

#[test]
fn tail_question_rejects_real_results() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();

    let promise_id = peer.export_promise().unwrap();
    peer.resolve_export(promise_id, ResolvedCap::Imported { id: 99 }, &mut sink)
        .unwrap();
    let mut call = rpc::call(31, 0xcc, 2, &MessageTarget::ImportedCap(promise_id));
    call.send_results_to_yourself();
    feed(&mut peer, call.msg.into_frame(), &mut sink);
    let forwarded_qid = sink
        .iter()
        .find_map(|bytes| {
            let msg = Message::parse_frame(bytes.clone()).unwrap();
            match rpc::decode(&msg).unwrap() {
                RpcMessage::Call(c) => Some(c.question_id),
                _ => None,
            }
        })
        .unwrap();
    sink.clear();

    let frame = Frame::parse(rpc::return_exception(forwarded_qid, "boom")).unwrap();
    let err = peer.handle_frame(&frame, &mut sink).unwrap_err();
    assert_eq!(err.error_name(), "UnexpectedForwardedTailReturn");
}

// Property 6: release semantics, including the pinned bootstrap export.
#[test]
fn release_drops_exports_but_never_the_bootstrap() {
    let mut peer = Peer::builder().bootstrap_export_id(17).build();
    let mut sink = Vec::new();

    feed(&mut peer, rpc::bootstrap(1), &mut sink);
    feed(&mut peer, rpc::bootstrap(2), &mut sink);
    assert_eq!(peer.export_ref_count(17), Some(2));
    sink.clear();

    feed(&mut peer, rpc::release(17, 10), &mut sink);
    assert_eq!(peer.export_ref_count(17), Some(0), "pinned at zero");

    // A plain export disappears when its count reaches zero.
    let id = peer.export_capability().unwrap();
    assert_eq!(peer.export_ref_count(id), Some(0));
    feed(&mut peer, rpc::release(id, 1), &mut sink);
    assert_eq!(peer.export_ref_count(id), None);
}

#[test]
fn release_of_dead_promise_breaks_queued_calls() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();

    let promise_id = peer.export_promise().unwrap();
    let call = rpc::call(51, 0xdd, 0, &MessageTarget::ImportedCap(promise_id));
    feed(&mut peer, call.msg.into_frame(), &mut sink);
    assert!(sink.is_empty(), "queued on the promise");

    // Releasing the promise before it resolves kills the queue.
    feed(&mut peer, rpc::release(promise_id, 1), &mut sink);
    let (answer_id, kind, reason) = decode_return(sink.last().unwrap());
    assert_eq!(answer_id, 51);
    assert_eq!(kind, "exception");
    assert_eq!(reason.as_deref(), Some("promise broken"));
    assert_eq!(peer.export_ref_count(promise_id), None);
}

#[test]
fn unimplemented_echo_settles_the_bounced_question() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();
    let recorder = Recorder::default();

    let qid = peer.send_bootstrap(Some(recorder.handler()), &mut sink);
    let sent = sink.pop().unwrap();

    let original = Message::parse_frame(sent).unwrap();
    feed(
        &mut peer,
        rpc::unimplemented_echo(&original).unwrap(),
        &mut sink,
    );

    assert_eq!(
        recorder.outcomes(),
        vec!["exception:unimplemented".to_owned()]
    );
    assert_eq!(peer.stats().questions, 0);
    let _ = qid;
}

#[test]
fn abort_records_the_reason_and_fails_the_connection() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();
    let frame = Frame::parse(rpc::abort("going away", 0)).unwrap();
    let err = peer.handle_frame(&frame, &mut sink).unwrap_err();
    assert_eq!(err.error_name(), "RemoteAbort");
    assert_eq!(peer.last_remote_abort_reason(), Some("going away"));
}

#[test]
fn call_answers_for_unknown_and_handlerless_exports() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();

    let call = rpc::call(60, 1, 0, &MessageTarget::ImportedCap(12345));
    feed(&mut peer, call.msg.into_frame(), &mut sink);
    let (_, kind, reason) = decode_return(&sink[0]);
    assert_eq!(kind, "exception");
    assert_eq!(reason.as_deref(), Some("unknown promised capability"));
    sink.clear();

    let id = peer.export_capability().unwrap();
    let call = rpc::call(61, 1, 0, &MessageTarget::ImportedCap(id));
    feed(&mut peer, call.msg.into_frame(), &mut sink);
    let (_, kind, reason) = decode_return(&sink[0]);
    assert_eq!(kind, "exception");
    assert_eq!(
        reason.as_deref(),
        Some("missing promised capability handler")
    );
}

#[test]
fn provide_then_accept_hands_the_capability_over() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();
    let id = peer.export_capability().unwrap();

    let provide = rpc::provide(8, &MessageTarget::ImportedCap(id), b"K");
    feed(&mut peer, provide, &mut sink);
    assert!(sink.is_empty(), "provide waits for its accept");

    feed(&mut peer, rpc::accept(21, b"K", false), &mut sink);

    // Return for the accept carries the provided capability, then the
    // provide question answers empty.
    assert_eq!(sink.len(), 2);
    let msg = Message::parse_frame(sink[0].clone()).unwrap();
    match rpc::decode(&msg).unwrap() {
        RpcMessage::Return(r) => {
            assert_eq!(r.answer_id, 21);
            match r.body {
                ReturnBody::Results(Some(payload)) => {
                    assert_eq!(payload.cap_table, vec![CapDescriptor::SenderHosted { id }]);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        other => panic!("unexpected {other:?}"),
    }
    let (answer_id, kind, _) = decode_return(&sink[1]);
    assert_eq!(answer_id, 8);
    assert_eq!(kind, "results");
    sink.clear();

    // A second accept finds nothing.
    feed(&mut peer, rpc::accept(22, b"K", false), &mut sink);
    let (_, kind, reason) = decode_return(&sink[0]);
    assert_eq!(kind, "exception");
    assert_eq!(reason.as_deref(), Some("UnknownProvision"));
}

#[test]
fn embargoed_accept_waits_for_the_disembargo() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();
    let id = peer.export_capability().unwrap();

    feed(
        &mut peer,
        rpc::provide(8, &MessageTarget::ImportedCap(id), b"K"),
        &mut sink,
    );
    feed(&mut peer, rpc::accept(21, b"K", true), &mut sink);
    assert!(sink.is_empty(), "queued under the token");

    feed(&mut peer, rpc::disembargo_accept(b"K"), &mut sink);
    let (answer_id, kind, _) = decode_return(&sink[0]);
    assert_eq!(answer_id, 21);
    assert_eq!(kind, "results");
}

#[test]
fn duplicate_provide_is_rejected() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();
    let id = peer.export_capability().unwrap();

    feed(
        &mut peer,
        rpc::provide(8, &MessageTarget::ImportedCap(id), b"K"),
        &mut sink,
    );
    feed(
        &mut peer,
        rpc::provide(9, &MessageTarget::ImportedCap(id), b"K"),
        &mut sink,
    );
    let (answer_id, kind, reason) = decode_return(&sink[0]);
    assert_eq!(answer_id, 9);
    assert_eq!(kind, "exception");
    assert_eq!(reason.as_deref(), Some("DuplicateProvide"));
}

#[test]
fn join_completes_when_all_parts_arrive() {
    let completions: Arc<Mutex<Vec<u32>>> = Arc::default();
    let seen = completions.clone();
    let mut peer = Peer::builder()
        .on_join_complete(Box::new(move |join_id, caps| {
            assert_eq!(caps.len(), 2);
            seen.lock().unwrap().push(join_id);
        }))
        .build();
    let mut sink = Vec::new();
    let id = peer.export_capability().unwrap();

    let part = |num| JoinKeyPart {
        join_id: 6,
        part_count: 2,
        part_num: num,
    };
    feed(
        &mut peer,
        rpc::join(40, &MessageTarget::ImportedCap(id), part(0)),
        &mut sink,
    );
    assert!(sink.is_empty());
    assert!(completions.lock().unwrap().is_empty());

    // A duplicate part is rejected without disturbing the join.
    feed(
        &mut peer,
        rpc::join(41, &MessageTarget::ImportedCap(id), part(0)),
        &mut sink,
    );
    let (_, kind, reason) = decode_return(&sink[0]);
    assert_eq!(kind, "exception");
    assert_eq!(reason.as_deref(), Some("JoinPartMismatch"));
    sink.clear();

    feed(
        &mut peer,
        rpc::join(42, &MessageTarget::ImportedCap(id), part(1)),
        &mut sink,
    );
    assert_eq!(completions.lock().unwrap().as_slice(), &[6]);
    // Both part questions answer.
    let answered: Vec<u32> = sink.iter().map(|b| decode_return(b).0).collect();
    assert!(answered.contains(&40));
    assert!(answered.contains(&42));
}

#[test]
fn streaming_send_fails_after_a_cached_error() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();

    let request = || capnrpc::CallRequest {
        target: MessageTarget::ImportedCap(4),
        interface_id: 1,
        method_id: 0,
        params: None,
        stream_client: Some(7),
        on_return: None,
    };
    let qid = peer.send_call(request(), &mut sink).unwrap();
    assert_eq!(peer.stream_tracker_mut().in_flight(7), 1);
    sink.clear();

    feed(&mut peer, rpc::return_exception(qid, "disk full"), &mut sink);
    assert_eq!(peer.stream_tracker_mut().in_flight(7), 0);

    let err = peer.send_call(request(), &mut sink).unwrap_err();
    assert_eq!(err.error_name(), "StreamFailed");
    assert!(err.to_string().contains("disk full"));
}

#[test]
fn return_release_param_caps_drops_our_export_references() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();
    let id = peer.export_capability().unwrap();

    // Send a call whose params carry our export.
    let mut b = MessageBuilder::new();
    let root = b.init_root(0, 1);
    b.set_cap(root, 0, id).unwrap();
    let segment = b.into_segment();
    let msg = Message::from_segment(segment);
    let root_any = msg.root().unwrap();

    let qid = peer
        .send_call(
            capnrpc::CallRequest {
                target: MessageTarget::ImportedCap(2),
                interface_id: 1,
                method_id: 0,
                params: root_any,
                stream_client: None,
                on_return: None,
            },
            &mut sink,
        )
        .unwrap();
    assert_eq!(peer.export_ref_count(id), Some(1));
    sink.clear();

    // The peer answers with release_param_caps (the wire default).
    let mut rb = MessageBuilder::new();
    let ret_root = rb.init_root(1, 1);
    rb.set_u16(ret_root, 0, 3);
    let body = rb.init_struct(ret_root, 0, 2, 1);
    rb.set_u32(body, 0, qid);
    rb.set_u16(body, 6, 2); // canceled
    feed(&mut peer, rb.into_frame(), &mut sink);

    assert_eq!(peer.export_ref_count(id), None, "reference dropped");
}

#[test]
fn unretained_return_caps_are_released_in_aggregate() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();

    // Handler that retains nothing.
    struct DropAll;
    impl ReturnHandler for DropAll {
        fn on_return(&mut self, _outcome: ReturnOutcome, _caps: &mut InboundCaps) {}
    }

    let qid = peer.send_bootstrap(Some(Box::new(DropAll)), &mut sink);
    sink.clear();

    let mut rb = rpc::return_results(qid);
    rb.msg
        .set_cap(rb.payload.struct_handle(), rb.payload.content_slot(), 0)
        .unwrap();
    rpc::write_cap_table(
        &mut rb.msg,
        &rb.payload,
        &[CapDescriptor::SenderHosted { id: 33 }],
    )
    .unwrap();
    feed(&mut peer, rb.msg.into_frame(), &mut sink);

    assert_eq!(peer.import_ref_count(33), 0);
    // First outbound frame is the aggregated Release, then the Finish.
    let msg = Message::parse_frame(sink[0].clone()).unwrap();
    match rpc::decode(&msg).unwrap() {
        RpcMessage::Release(r) => {
            assert_eq!(r.id, 33);
            assert_eq!(r.reference_count, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    let msg = Message::parse_frame(sink[1].clone()).unwrap();
    assert!(matches!(
        rpc::decode(&msg).unwrap(),
        RpcMessage::Finish(f) if f.question_id == qid
    ));
}

#[test]
fn finish_with_release_result_caps_drops_cached_answer_references() {
    let mut peer = Peer::builder().bootstrap_export_id(17).build();
    let mut sink = Vec::new();

    feed(&mut peer, rpc::bootstrap(5), &mut sink);
    assert_eq!(peer.export_ref_count(17), Some(1));
    assert!(peer.has_resolved_answer(5));
    sink.clear();

    feed(&mut peer, rpc::finish(5, true), &mut sink);
    assert!(!peer.has_resolved_answer(5));
    assert_eq!(peer.export_ref_count(17), Some(0), "pinned, not removed");
}

#[test]
fn late_return_after_finish_is_swallowed() {
    let mut peer = Peer::builder().build();
    let mut sink = Vec::new();

    let qid = peer.send_bootstrap(None, &mut sink);
    peer.send_finish(qid, false, &mut sink);
    sink.clear();

    // The race: the peer's Return crosses our Finish on the wire.
    feed(&mut peer, rpc::return_canceled(qid), &mut sink);
    assert!(sink.is_empty());
    assert_eq!(peer.stats().questions, 0);
}
