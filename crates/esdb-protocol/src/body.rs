//! Payload bodies for the operations the client surfaces.
//!
//! The connection engine never looks inside a payload; these types are used
//! at the edges only. Conversations decode the replies they care about, and
//! the test server decodes requests. Bodies are serde_json-encoded on the
//! wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque credential pair threaded into operations that require auth.
///
/// Frames carrying credentials set the `AUTHENTICATED` flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// A client-supplied event to append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEventData {
    pub event_id: Uuid,
    pub event_type: String,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// An event as stored by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub stream: String,
    pub event_id: Uuid,
    pub event_number: u64,
    pub event_type: String,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created: DateTime<Utc>,
}

/// Expected-version sentinels for appends.
pub mod expected_version {
    /// No concurrency check.
    pub const ANY: i64 = -2;
    /// The stream must not exist yet.
    pub const NO_STREAM: i64 = -1;
}

// ---------------------------------------------------------------------------
// WriteEvents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteEventsBody {
    pub stream: String,
    pub expected_version: i64,
    pub require_leader: bool,
    pub events: Vec<NewEventData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationResult {
    Success,
    PrepareTimeout,
    CommitTimeout,
    ForwardTimeout,
    WrongExpectedVersion,
    StreamDeleted,
    InvalidTransaction,
    AccessDenied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteEventsCompletedBody {
    pub result: OperationResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub first_event_number: i64,
    pub last_event_number: i64,
}

// ---------------------------------------------------------------------------
// ReadStreamEvents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadStreamEventsBody {
    pub stream: String,
    pub from_event_number: u64,
    pub max_count: u32,
    pub resolve_links: bool,
    pub require_leader: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadStreamResult {
    Success,
    NoStream,
    StreamDeleted,
    NotModified,
    Error,
    AccessDenied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadStreamEventsCompletedBody {
    pub result: ReadStreamResult,
    pub events: Vec<RecordedEvent>,
    /// Where the next page starts; equal to the end of this page.
    pub next_event_number: u64,
    pub last_event_number: i64,
    pub is_end_of_stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Persistent subscriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectPersistentSubscriptionBody {
    pub group: String,
    pub stream: String,
    pub allowed_in_flight_messages: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentSubscriptionConfirmationBody {
    pub subscription_id: String,
    pub last_commit_position: i64,
    pub last_event_number: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentSubscriptionEventBody {
    pub event: RecordedEvent,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionDropReason {
    Unsubscribed,
    AccessDenied,
    NotFound,
    PersistentSubscriptionDeleted,
    SubscriberMaxCountReached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDroppedBody {
    pub reason: SubscriptionDropReason,
}

/// Acknowledge processed events on a persistent subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckEventsBody {
    pub subscription_id: String,
    pub processed_event_ids: Vec<Uuid>,
}

// ---------------------------------------------------------------------------
// Server rejections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotHandledBody {
    /// E.g. "not_ready", "too_busy", "not_leader".
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}
