// fake_node: a scriptable in-process server speaking the frame protocol.
//
// Each test spins up its own node on an ephemeral port and mutates the
// shared behavior mid-test to simulate dead peers, dropped connections, and
// pathological fragmentation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use esdb_protocol::{
    ConnectPersistentSubscriptionBody, Frame, FrameCodec, OperationResult,
    PersistentSubscriptionConfirmationBody, PersistentSubscriptionEventBody,
    ReadStreamEventsBody, ReadStreamEventsCompletedBody, ReadStreamResult, RecordedEvent,
    WriteEventsBody, WriteEventsCompletedBody, command,
};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Encoder, FramedRead};
use uuid::Uuid;

/// How a [`FakeNode`] reacts to inbound frames. Mutable at runtime through
/// [`FakeNode::set_behavior`]; each inbound frame sees the latest snapshot.
#[derive(Debug, Clone)]
pub struct NodeBehavior {
    /// Answer client heartbeat probes.
    pub answer_heartbeats: bool,
    /// Write every reply one byte per syscall, flushing between bytes.
    pub byte_at_a_time: bool,
    /// Drop the connection instead of answering the next N write requests.
    pub drop_next_writes: usize,
    /// Send a heartbeat probe of our own as soon as a client connects.
    pub probe_on_connect: bool,
    /// Stream contents served to read requests, keyed by stream name.
    /// Event numbers are assumed to equal their index.
    pub streams: HashMap<String, Vec<RecordedEvent>>,
    /// Events pushed right after a persistent subscription is confirmed.
    pub subscription_events: Vec<RecordedEvent>,
}

impl Default for NodeBehavior {
    fn default() -> NodeBehavior {
        NodeBehavior {
            answer_heartbeats: true,
            byte_at_a_time: false,
            drop_next_writes: 0,
            probe_on_connect: false,
            streams: HashMap::new(),
            subscription_events: Vec::new(),
        }
    }
}

/// A fake server node for integration testing.
///
/// Binds to port 0 and exposes the bound address; every connection is
/// handled in its own tokio task. Frames received from clients (heartbeat
/// probes included) are captured for assertions.
pub struct FakeNode {
    addr: SocketAddr,
    behavior: Arc<Mutex<NodeBehavior>>,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Frame>>>,
    _task: tokio::task::JoinHandle<()>,
}

impl FakeNode {
    pub async fn start() -> Result<FakeNode, Box<dyn std::error::Error>> {
        FakeNode::start_with(NodeBehavior::default()).await
    }

    pub async fn start_with(behavior: NodeBehavior) -> Result<FakeNode, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let behavior = Arc::new(Mutex::new(behavior));
        let connections = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let behavior = Arc::clone(&behavior);
            let connections = Arc::clone(&connections);
            let received = Arc::clone(&received);
            tokio::spawn(async move {
                Self::accept_loop(listener, behavior, connections, received).await;
            })
        };

        Ok(FakeNode {
            addr,
            behavior,
            connections,
            received,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Mutate the behavior; applies from the next inbound frame on.
    pub fn set_behavior(&self, mutate: impl FnOnce(&mut NodeBehavior)) {
        mutate(&mut self.behavior.lock().unwrap());
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Every frame received from clients, in arrival order per connection.
    pub fn received(&self) -> Vec<Frame> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_with_command(&self, command: u8) -> Vec<Frame> {
        self.received()
            .into_iter()
            .filter(|frame| frame.command == command)
            .collect()
    }

    /// Fabricate a stored event for `streams` / `subscription_events`.
    pub fn recorded_event(stream: &str, event_number: u64, event_type: &str) -> RecordedEvent {
        RecordedEvent {
            stream: stream.to_owned(),
            event_id: Uuid::new_v4(),
            event_number,
            event_type: event_type.to_owned(),
            data: serde_json::json!({ "n": event_number }),
            metadata: None,
            created: Utc::now(),
        }
    }

    /// A stream of `count` events numbered from zero.
    pub fn numbered_events(stream: &str, count: u64) -> Vec<RecordedEvent> {
        (0..count)
            .map(|n| Self::recorded_event(stream, n, "tick"))
            .collect()
    }

    // -- internal --

    async fn accept_loop(
        listener: TcpListener,
        behavior: Arc<Mutex<NodeBehavior>>,
        connections: Arc<AtomicUsize>,
        received: Arc<Mutex<Vec<Frame>>>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let _ = connections.fetch_add(1, Ordering::SeqCst);
                    let behavior = Arc::clone(&behavior);
                    let received = Arc::clone(&received);
                    tokio::spawn(async move {
                        // Client drops are routine in these tests; swallow errors.
                        let _ = Self::handle_connection(stream, behavior, received).await;
                    });
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        behavior: Arc<Mutex<NodeBehavior>>,
        received: Arc<Mutex<Vec<Frame>>>,
    ) -> std::io::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, FrameCodec::new());

        {
            let snapshot = behavior.lock().unwrap().clone();
            if snapshot.probe_on_connect {
                send_frame(
                    &mut write_half,
                    Frame::heartbeat_request(Uuid::new_v4()),
                    snapshot.byte_at_a_time,
                )
                .await?;
            }
        }

        while let Some(next) = frames.next().await {
            let frame = match next {
                Ok(frame) => frame,
                Err(_) => break,
            };
            received.lock().unwrap().push(frame.clone());

            let snapshot = behavior.lock().unwrap().clone();
            let replies = match frame.command {
                command::HEARTBEAT_REQUEST => {
                    if snapshot.answer_heartbeats {
                        vec![Frame::heartbeat_response(frame.conversation_id)]
                    } else {
                        vec![]
                    }
                }
                command::HEARTBEAT_RESPONSE => vec![],
                command::PING => vec![Frame::new(
                    command::PONG,
                    frame.conversation_id,
                    frame.payload.clone(),
                )],
                command::WRITE_EVENTS => {
                    if snapshot.drop_next_writes > 0 {
                        let mut b = behavior.lock().unwrap();
                        b.drop_next_writes = b.drop_next_writes.saturating_sub(1);
                        // Hang up before replying; the client must replay.
                        return Ok(());
                    }
                    vec![write_completed(&frame)]
                }
                command::READ_STREAM_EVENTS_FORWARD => {
                    vec![read_completed(&frame, &snapshot)]
                }
                command::CONNECT_TO_PERSISTENT_SUBSCRIPTION => {
                    subscription_confirmed(&frame, &snapshot)
                }
                command::PERSISTENT_SUBSCRIPTION_ACK_EVENTS => vec![],
                _ => vec![Frame::new(
                    command::BAD_REQUEST,
                    frame.conversation_id,
                    Bytes::from_static(b"unsupported command"),
                )],
            };

            for reply in replies {
                send_frame(&mut write_half, reply, snapshot.byte_at_a_time).await?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reply builders
// ---------------------------------------------------------------------------

fn json_frame<T: serde::Serialize>(command: u8, conversation_id: Uuid, body: &T) -> Frame {
    Frame::new(
        command,
        conversation_id,
        Bytes::from(serde_json::to_vec(body).unwrap()),
    )
}

fn write_completed(request: &Frame) -> Frame {
    let event_count = serde_json::from_slice::<WriteEventsBody>(&request.payload)
        .map(|body| body.events.len() as i64)
        .unwrap_or(0);
    let body = WriteEventsCompletedBody {
        result: OperationResult::Success,
        message: None,
        first_event_number: 0,
        last_event_number: event_count.saturating_sub(1),
    };
    json_frame(command::WRITE_EVENTS_COMPLETED, request.conversation_id, &body)
}

fn read_completed(request: &Frame, behavior: &NodeBehavior) -> Frame {
    let Ok(body) = serde_json::from_slice::<ReadStreamEventsBody>(&request.payload) else {
        return Frame::new(
            command::BAD_REQUEST,
            request.conversation_id,
            Bytes::from_static(b"undecodable read request"),
        );
    };
    let completed = match behavior.streams.get(&body.stream) {
        None => ReadStreamEventsCompletedBody {
            result: ReadStreamResult::NoStream,
            events: vec![],
            next_event_number: 0,
            last_event_number: -1,
            is_end_of_stream: true,
            error: None,
        },
        Some(events) => {
            let from = body.from_event_number as usize;
            let page: Vec<RecordedEvent> = events
                .iter()
                .skip(from)
                .take(body.max_count as usize)
                .cloned()
                .collect();
            let next = from + page.len();
            ReadStreamEventsCompletedBody {
                result: ReadStreamResult::Success,
                next_event_number: next as u64,
                last_event_number: events.len() as i64 - 1,
                is_end_of_stream: next >= events.len(),
                events: page,
                error: None,
            }
        }
    };
    json_frame(
        command::READ_STREAM_EVENTS_FORWARD_COMPLETED,
        request.conversation_id,
        &completed,
    )
}

fn subscription_confirmed(request: &Frame, behavior: &NodeBehavior) -> Vec<Frame> {
    let Ok(body) = serde_json::from_slice::<ConnectPersistentSubscriptionBody>(&request.payload)
    else {
        return vec![Frame::new(
            command::BAD_REQUEST,
            request.conversation_id,
            Bytes::from_static(b"undecodable subscription request"),
        )];
    };
    let confirmation = PersistentSubscriptionConfirmationBody {
        subscription_id: format!("{}::{}", body.group, body.stream),
        last_commit_position: 0,
        last_event_number: behavior
            .subscription_events
            .last()
            .map_or(-1, |event| event.event_number as i64),
    };
    let mut replies = vec![json_frame(
        command::PERSISTENT_SUBSCRIPTION_CONFIRMATION,
        request.conversation_id,
        &confirmation,
    )];
    for event in &behavior.subscription_events {
        let appeared = PersistentSubscriptionEventBody {
            event: event.clone(),
            retry_count: 0,
        };
        replies.push(json_frame(
            command::PERSISTENT_SUBSCRIPTION_STREAM_EVENT_APPEARED,
            request.conversation_id,
            &appeared,
        ));
    }
    replies
}

// ---------------------------------------------------------------------------
// Frame writer (with optional pathological fragmentation)
// ---------------------------------------------------------------------------

async fn send_frame(
    write_half: &mut OwnedWriteHalf,
    frame: Frame,
    byte_at_a_time: bool,
) -> std::io::Result<()> {
    let mut buf = BytesMut::new();
    FrameCodec::new()
        .encode(frame, &mut buf)
        .map_err(std::io::Error::other)?;
    if byte_at_a_time {
        for i in 0..buf.len() {
            write_half.write_all(&buf[i..=i]).await?;
            write_half.flush().await?;
        }
    } else {
        write_half.write_all(&buf).await?;
        write_half.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;
    use tokio_util::codec::Framed;

    async fn framed_client(addr: SocketAddr) -> Framed<TcpStream, FrameCodec> {
        let stream = TcpStream::connect(addr).await.unwrap();
        Framed::new(stream, FrameCodec::new())
    }

    #[tokio::test]
    async fn node_starts_and_reports_a_real_port() {
        let node = FakeNode::start().await.unwrap();
        assert_ne!(node.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn ping_is_answered_with_a_pong_carrying_the_same_id() {
        let node = FakeNode::start().await.unwrap();
        let mut client = framed_client(node.local_addr()).await;

        let conversation_id = Uuid::new_v4();
        client
            .send(Frame::new(command::PING, conversation_id, Bytes::new()))
            .await
            .unwrap();

        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.command, command::PONG);
        assert_eq!(reply.conversation_id, conversation_id);
        assert_eq!(node.connections(), 1);
    }

    #[tokio::test]
    async fn heartbeat_probe_is_echoed_when_enabled() {
        let node = FakeNode::start().await.unwrap();
        let mut client = framed_client(node.local_addr()).await;

        let probe_id = Uuid::new_v4();
        client.send(Frame::heartbeat_request(probe_id)).await.unwrap();

        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.command, command::HEARTBEAT_RESPONSE);
        assert_eq!(reply.conversation_id, probe_id);
    }

    #[tokio::test]
    async fn silent_mode_leaves_heartbeats_unanswered_but_answers_pings() {
        let node = FakeNode::start().await.unwrap();
        node.set_behavior(|b| b.answer_heartbeats = false);
        let mut client = framed_client(node.local_addr()).await;

        client
            .send(Frame::heartbeat_request(Uuid::new_v4()))
            .await
            .unwrap();
        let ping_id = Uuid::new_v4();
        client
            .send(Frame::new(command::PING, ping_id, Bytes::new()))
            .await
            .unwrap();

        // The only reply is the pong; the probe stayed unanswered.
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.command, command::PONG);
        assert_eq!(reply.conversation_id, ping_id);
    }

    #[tokio::test]
    async fn read_requests_are_served_in_pages() {
        let node = FakeNode::start().await.unwrap();
        node.set_behavior(|b| {
            let _ = b
                .streams
                .insert("ticks".to_owned(), FakeNode::numbered_events("ticks", 5));
        });
        let mut client = framed_client(node.local_addr()).await;

        let body = ReadStreamEventsBody {
            stream: "ticks".to_owned(),
            from_event_number: 0,
            max_count: 3,
            resolve_links: true,
            require_leader: false,
            credentials: None,
        };
        client
            .send(json_frame(
                command::READ_STREAM_EVENTS_FORWARD,
                Uuid::new_v4(),
                &body,
            ))
            .await
            .unwrap();

        let reply = client.next().await.unwrap().unwrap();
        let completed: ReadStreamEventsCompletedBody =
            serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(completed.events.len(), 3);
        assert_eq!(completed.next_event_number, 3);
        assert!(!completed.is_end_of_stream);
    }
}
