//! Ping round-trips against a live fake node.
//!
//! # Scenarios
//! 1. A ping started on a connected client resolves with the same
//!    conversation id the caller chose.
//! 2. A server-initiated heartbeat probe is answered without involving the
//!    dispatcher.
//! 3. Conversations started before any transport exists are queued and sent
//!    on the first attach.

use std::net::SocketAddr;
use std::time::Duration;

use esdb_client::conversations::Ping;
use esdb_client::{Client, ClientConfig, ConnectionEvent};
use esdb_protocol::command;
use esdb_test_utils::{FakeNode, init_test_logging};
use tokio::sync::broadcast;
use uuid::Uuid;

fn test_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        connect_timeout: Duration::from_secs(2),
        retry_delay: Duration::from_millis(20),
        ..ClientConfig::default()
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    matcher: impl Fn(&ConnectionEvent) -> bool,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if matcher(&event) => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for connection event");
}

#[tokio::test]
async fn ping_round_trip_preserves_the_conversation_id() {
    init_test_logging();
    let node = FakeNode::start().await.unwrap();
    let client = Client::new(test_config(node.local_addr()));
    let mut events = client.subscribe_events();

    client.connect();
    wait_for(&mut events, |e| matches!(e, ConnectionEvent::Connected(_))).await;

    let conversation_id = Uuid::new_v4();
    let echoed = client.ping_with_id(conversation_id).await.unwrap();
    assert_eq!(echoed, conversation_id);

    client.close().await;
}

#[tokio::test]
async fn server_initiated_heartbeat_probe_is_answered() {
    init_test_logging();
    let node = FakeNode::start().await.unwrap();
    node.set_behavior(|b| b.probe_on_connect = true);

    let client = Client::new(test_config(node.local_addr()));
    let mut events = client.subscribe_events();
    client.connect();
    wait_for(&mut events, |e| matches!(e, ConnectionEvent::Connected(_))).await;

    // The probe answer is emitted straight onto the outbound queue; give the
    // write pump a moment to move it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if !node
            .received_with_command(command::HEARTBEAT_RESPONSE)
            .is_empty()
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "heartbeat probe was never answered"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The connection stays fully usable afterwards.
    let _ = client.ping().await.unwrap();
    client.close().await;
}

#[tokio::test]
async fn conversations_started_before_connect_are_sent_on_attach() {
    init_test_logging();
    let node = FakeNode::start().await.unwrap();
    let client = Client::new(test_config(node.local_addr()));

    let conversation_id = Uuid::new_v4();
    let handle = client.start_conversation(Box::new(Ping::with_id(conversation_id)));

    client.connect();
    let frame = handle.scalar().await.unwrap();
    assert_eq!(frame.conversation_id, conversation_id);

    client.close().await;
}
