//! Two peers wired back to back over the in-memory transport.

use std::sync::Arc;

use capnrpc::inbound::InboundCaps;
use capnrpc::peer::{CallHandler, InboundCall, Peer, ReturnHandler, ReturnOutcome};
use capnrpc::transport::mem_pair;
use capnrpc::wire::rpc::{MessageTarget, PromisedAnswer};
use capnrpc::{Connection, HostError, ResolvedCap};
use tokio::sync::mpsc;

struct NotifyingHandler {
    events: mpsc::UnboundedSender<String>,
}

impl ReturnHandler for NotifyingHandler {
    fn on_return(&mut self, outcome: ReturnOutcome, caps: &mut InboundCaps) {
        caps.retain_all();
        let label = match outcome {
            ReturnOutcome::Results { .. } => {
                let first = caps.get(0).cloned();
                format!("results:{first:?}")
            }
            ReturnOutcome::Exception(e) => format!("exception:{}", e.reason),
            other => format!("{other:?}"),
        };
        let _ = self.events.send(label);
    }
}

struct EchoService {
    events: mpsc::UnboundedSender<String>,
}

impl CallHandler for EchoService {
    fn on_call(&self, call: InboundCall) -> Result<(), HostError> {
        let _ = self
            .events
            .send(format!("call:{}:{}", call.interface_id, call.method_id));
        Ok(())
    }
}

#[tokio::test]
async fn bootstrap_round_trip_over_mem_transport() {
    let (transport_a, transport_b) = mem_pair();

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let server_peer = Peer::builder()
        .bootstrap_export_id(17)
        .call_handler(Arc::new(EchoService {
            events: events_tx.clone(),
        }))
        .build();
    let client_peer = Peer::builder().build();

    let _server = Connection::spawn(server_peer, transport_b).unwrap();
    let client = Connection::spawn(client_peer, transport_a).unwrap();

    let question_id = client
        .bootstrap(Some(Box::new(NotifyingHandler {
            events: events_tx.clone(),
        })))
        .await
        .unwrap();

    // Pipeline a call through the bootstrap answer before the Return
    // settles; frame order on the wire keeps the cached answer alive
    // until the call has been dispatched.
    client
        .call(
            MessageTarget::PromisedAnswer(PromisedAnswer {
                question_id,
                ops: vec![],
            }),
            0xaa,
            3,
            None,
            None,
        )
        .await
        .unwrap();

    // One event from each side, in no particular order.
    let mut events = vec![
        events_rx.recv().await.unwrap(),
        events_rx.recv().await.unwrap(),
    ];
    events.sort();
    let mut expected = vec![
        format!("results:{:?}", Some(ResolvedCap::Exported { id: 17 })),
        "call:170:3".to_owned(),
    ];
    expected.sort();
    assert_eq!(events, expected);

    client.shutdown().await.unwrap();
}
