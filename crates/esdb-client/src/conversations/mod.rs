//! Conversation state machines.
//!
//! A conversation is the client-side half of one logical request/response
//! exchange, identified by a UUID carried in every frame. The dispatcher
//! owns conversations until they report completion and treats their
//! payloads as opaque; each conversation decodes only the bodies it needs
//! to advance its own state.

mod ping;
mod read_stream;
mod subscription;
mod write_events;

pub use ping::Ping;
pub use read_stream::{IterStreamEvents, ReadStreamEvents};
pub use subscription::{AckEvents, ConnectPersistentSubscription, SubscriptionDescriptor};
pub use write_events::WriteEvents;

use esdb_protocol::{Frame, NotHandledBody, RecordedEvent, command};
use uuid::Uuid;

use crate::error::ClientError;

/// Directive returned to the dispatcher after an inbound frame.
#[derive(Debug)]
pub enum ReplyAction {
    /// Resolve the waiter with the final frame.
    CompleteScalar(Frame),
    /// Fail the waiter.
    CompleteError(ClientError),
    /// Hand the waiter an event stream seeded with the first page.
    BeginIterator {
        events: Vec<RecordedEvent>,
        buffer_hint: usize,
    },
    /// Push another page onto the open stream.
    YieldToIterator(Vec<RecordedEvent>),
    /// Push the final page; the stream ends afterwards.
    CompleteIterator(Vec<RecordedEvent>),
    /// Inject an error into the stream and end it.
    RaiseToIterator(ClientError),
    /// Hand the waiter a live persistent subscription.
    BeginPersistentSubscription(SubscriptionDescriptor),
    /// Push one event onto the subscription.
    YieldToSubscription(RecordedEvent),
    /// Inject an error into the subscription and end it.
    RaiseToSubscription(ClientError),
    /// End the subscription cleanly.
    FinishSubscription,
}

/// A reply action plus an optional follow-up request.
///
/// Follow-ups are enqueued before the next inbound frame is dispatched, so
/// a paged conversation never sees its own pages out of order.
#[derive(Debug)]
pub struct Reply {
    pub action: ReplyAction,
    pub outbound: Option<Frame>,
}

impl Reply {
    pub fn of(action: ReplyAction) -> Reply {
        Reply {
            action,
            outbound: None,
        }
    }

    pub fn then_send(action: ReplyAction, outbound: Frame) -> Reply {
        Reply {
            action,
            outbound: Some(outbound),
        }
    }
}

/// The capability the dispatcher requires of every exchange.
pub trait Conversation: Send {
    fn id(&self) -> Uuid;

    /// One-way conversations are sent and forgotten; no reply is tracked.
    fn is_one_way(&self) -> bool {
        false
    }

    /// The opening request. Re-invoked on every transport attach (replay),
    /// so it must reflect the conversation's current position.
    fn start(&self) -> Frame;

    fn respond_to(&mut self, frame: &Frame) -> Reply;

    /// True once the last reply action was terminal.
    fn is_complete(&self) -> bool;
}

/// Rejection commands every conversation maps the same way.
pub(crate) fn common_rejection(frame: &Frame) -> Option<ClientError> {
    match frame.command {
        command::BAD_REQUEST => Some(ClientError::BadRequest {
            message: String::from_utf8_lossy(&frame.payload).into_owned(),
        }),
        command::NOT_AUTHENTICATED => Some(ClientError::NotAuthenticated),
        command::NOT_HANDLED => {
            let reason = serde_json::from_slice::<NotHandledBody>(&frame.payload)
                .map(|body| body.reason)
                .unwrap_or_else(|_| "unknown".to_owned());
            Some(ClientError::NotHandled { reason })
        }
        _ => None,
    }
}
