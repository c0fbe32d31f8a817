//! Persistent subscription lifecycle: confirm, receive pushed events, ack.

use std::net::SocketAddr;
use std::time::Duration;

use esdb_client::{Client, ClientConfig, ConnectionEvent};
use esdb_protocol::{AckEventsBody, command};
use esdb_test_utils::{FakeNode, init_test_logging};
use tokio::sync::broadcast;

fn test_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        connect_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
}

async fn wait_connected(events: &mut broadcast::Receiver<ConnectionEvent>) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Connected(_)) => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for connect");
}

#[tokio::test]
async fn subscription_confirms_delivers_events_and_acks() {
    init_test_logging();
    let node = FakeNode::start().await.unwrap();
    node.set_behavior(|b| {
        b.subscription_events = FakeNode::numbered_events("orders", 3);
    });

    let client = Client::new(test_config(node.local_addr()));
    let mut events = client.subscribe_events();
    client.connect();
    wait_connected(&mut events).await;

    let mut subscription = client
        .connect_persistent_subscription("workers", "orders", 8)
        .await
        .unwrap();
    assert_eq!(
        subscription.descriptor().subscription_id,
        "workers::orders"
    );

    let mut delivered = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(5), subscription.next())
            .await
            .expect("timed out waiting for a pushed event")
            .expect("subscription ended early")
            .unwrap();
        delivered.push(event);
    }
    assert_eq!(delivered.len(), 3);
    assert_eq!(delivered[0].event_number, 0);
    assert_eq!(delivered[2].event_number, 2);

    subscription.ack(delivered.iter().map(|e| e.event_id).collect());

    // The ack flows through the dispatcher as a one-way conversation.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let ack_frame = loop {
        let acks = node.received_with_command(command::PERSISTENT_SUBSCRIPTION_ACK_EVENTS);
        if let Some(frame) = acks.first() {
            break frame.clone();
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "ack never reached the server"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    let body: AckEventsBody = serde_json::from_slice(&ack_frame.payload).unwrap();
    assert_eq!(body.subscription_id, "workers::orders");
    assert_eq!(body.processed_event_ids.len(), 3);

    client.close().await;
}
