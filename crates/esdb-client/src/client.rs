//! User-facing façade over the connection engine.
//!
//! Thin by design: every operation builds a conversation, hands it to the
//! dispatcher, and decodes the resolved reply. Conversations started while
//! disconnected are queued and replayed once a transport attaches, so
//! callers can fire requests immediately after `connect`.

use esdb_protocol::{
    Credentials, NewEventData, ReadStreamEventsCompletedBody, RecordedEvent,
    WriteEventsCompletedBody, expected_version,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::connector::{ConnectionEvent, Connector, ConnectorHandle};
use crate::conversations::{
    ConnectPersistentSubscription, Conversation, IterStreamEvents, Ping, ReadStreamEvents,
    WriteEvents,
};
use crate::discovery::{Discovery, DnsDiscovery, StaticDiscovery};
use crate::dispatcher::{Dispatcher, EventStream, ResultHandle, SubscriptionHandle};
use crate::error::ClientError;

/// One decoded page of a stream read.
#[derive(Debug)]
pub struct StreamPage {
    pub events: Vec<RecordedEvent>,
    pub next_event_number: u64,
    pub is_end_of_stream: bool,
}

pub struct Client {
    dispatcher: Dispatcher,
    connector: ConnectorHandle,
    run_loop: Option<JoinHandle<()>>,
    credentials: Option<Credentials>,
}

impl Client {
    /// Build a client from config; `connect` starts the engine.
    pub fn new(config: ClientConfig) -> Client {
        let discovery = discoverer_for(&config);
        Client::with_discovery(config, discovery)
    }

    /// Build a client with a custom discovery capability.
    pub fn with_discovery(config: ClientConfig, discovery: Box<dyn Discovery>) -> Client {
        let dispatcher = Dispatcher::new();
        let (connector, run_loop) = Connector::spawn(discovery, dispatcher.clone(), &config);
        Client {
            dispatcher,
            connector,
            run_loop: Some(run_loop),
            credentials: config.credentials,
        }
    }

    /// Begin connecting. Returns immediately; observe progress through
    /// `subscribe_events`, or just start conversations (they are queued and
    /// sent once a transport attaches).
    pub fn connect(&self) {
        self.connector.connect();
    }

    /// Stop the engine. Outstanding conversations resolve with
    /// `ConnectionClosed`; open streams end.
    pub async fn close(mut self) {
        self.connector.stop(None);
        if let Some(run_loop) = self.run_loop.take() {
            let _ = run_loop.await;
        }
    }

    /// Observe connection lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connector.subscribe()
    }

    /// Hand a custom conversation to the engine.
    pub fn start_conversation(&self, conversation: Box<dyn Conversation>) -> ResultHandle {
        self.dispatcher.start_conversation(conversation)
    }

    /// Round-trip a ping; resolves with the server's conversation id echo.
    pub async fn ping(&self) -> Result<Uuid, ClientError> {
        self.ping_with_id(Uuid::new_v4()).await
    }

    pub async fn ping_with_id(&self, conversation_id: Uuid) -> Result<Uuid, ClientError> {
        let frame = self
            .start_conversation(Box::new(Ping::with_id(conversation_id)))
            .scalar()
            .await?;
        Ok(frame.conversation_id)
    }

    /// Append a batch of events to a stream.
    pub async fn append(
        &self,
        stream: impl Into<String>,
        events: Vec<NewEventData>,
        expected_version: i64,
    ) -> Result<WriteEventsCompletedBody, ClientError> {
        let conversation = WriteEvents::new(
            stream.into(),
            events,
            expected_version,
            self.credentials.clone(),
        );
        let frame = self.start_conversation(Box::new(conversation)).scalar().await?;
        serde_json::from_slice(&frame.payload)
            .map_err(|e| ClientError::Protocol(format!("decoding append completion: {e}")))
    }

    /// Publish a single event, no concurrency check.
    pub async fn publish_event(
        &self,
        stream: impl Into<String>,
        event_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<WriteEventsCompletedBody, ClientError> {
        let event = NewEventData {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            data,
            metadata: None,
        };
        self.append(stream, vec![event], expected_version::ANY).await
    }

    /// Read one page of a stream.
    pub async fn read_stream(
        &self,
        stream: impl Into<String>,
        from_event_number: u64,
        max_count: u32,
    ) -> Result<StreamPage, ClientError> {
        let conversation = ReadStreamEvents::new(
            stream.into(),
            from_event_number,
            max_count,
            self.credentials.clone(),
        );
        let frame = self.start_conversation(Box::new(conversation)).scalar().await?;
        let body: ReadStreamEventsCompletedBody = serde_json::from_slice(&frame.payload)
            .map_err(|e| ClientError::Protocol(format!("decoding read completion: {e}")))?;
        Ok(StreamPage {
            events: body.events,
            next_event_number: body.next_event_number,
            is_end_of_stream: body.is_end_of_stream,
        })
    }

    /// Iterate a stream page by page. The returned stream yields events in
    /// server order and ends after the last one.
    pub async fn iter_stream(
        &self,
        stream: impl Into<String>,
        from_event_number: u64,
        batch_size: u32,
    ) -> Result<EventStream, ClientError> {
        let conversation = IterStreamEvents::new(
            stream.into(),
            from_event_number,
            batch_size,
            self.credentials.clone(),
        );
        self.start_conversation(Box::new(conversation)).stream().await
    }

    /// Attach to a persistent subscription group.
    pub async fn connect_persistent_subscription(
        &self,
        group: impl Into<String>,
        stream: impl Into<String>,
        buffer_size: u32,
    ) -> Result<SubscriptionHandle, ClientError> {
        let conversation = ConnectPersistentSubscription::new(
            group.into(),
            stream.into(),
            buffer_size,
            self.credentials.clone(),
        );
        self.start_conversation(Box::new(conversation))
            .subscription()
            .await
    }
}

fn discoverer_for(config: &ClientConfig) -> Box<dyn Discovery> {
    match &config.discovery_host {
        Some(host) => Box::new(DnsDiscovery::new(host.clone(), config.discovery_port)),
        None => Box::new(StaticDiscovery::single(config.host.clone(), config.port)),
    }
}
