use bytes::Bytes;
use esdb_protocol::{
    AckEventsBody, ConnectPersistentSubscriptionBody, Credentials, Frame,
    PersistentSubscriptionConfirmationBody, PersistentSubscriptionEventBody,
    SubscriptionDropReason, SubscriptionDroppedBody, command,
};
use uuid::Uuid;

use super::{Conversation, Reply, ReplyAction, common_rejection};
use crate::error::ClientError;

/// What the server confirmed for a persistent subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionDescriptor {
    pub subscription_id: String,
    pub group: String,
    pub stream: String,
    pub buffer_size: usize,
    pub last_event_number: i64,
    pub conversation_id: Uuid,
    /// Carried forward so acks can reuse the same credentials.
    pub credentials: Option<Credentials>,
}

// ---------------------------------------------------------------------------
// ConnectPersistentSubscription
// ---------------------------------------------------------------------------

/// Attach to a competing-consumer subscription group.
///
/// Long-lived: after confirmation the server pushes events until the
/// subscription is dropped or the client abandons it. Replay after a
/// reconnect re-sends the connect frame, which the server treats as a
/// re-attach of the same consumer.
#[derive(Debug)]
pub struct ConnectPersistentSubscription {
    id: Uuid,
    group: String,
    stream: String,
    buffer_size: u32,
    credentials: Option<Credentials>,
    confirmed: bool,
    complete: bool,
}

impl ConnectPersistentSubscription {
    pub fn new(
        group: String,
        stream: String,
        buffer_size: u32,
        credentials: Option<Credentials>,
    ) -> ConnectPersistentSubscription {
        ConnectPersistentSubscription {
            id: Uuid::new_v4(),
            group,
            stream,
            buffer_size,
            credentials,
            confirmed: false,
            complete: false,
        }
    }

    fn fail(&mut self, err: ClientError) -> Reply {
        self.complete = true;
        if self.confirmed {
            Reply::of(ReplyAction::RaiseToSubscription(err))
        } else {
            Reply::of(ReplyAction::CompleteError(err))
        }
    }
}

impl Conversation for ConnectPersistentSubscription {
    fn id(&self) -> Uuid {
        self.id
    }

    fn start(&self) -> Frame {
        let body = ConnectPersistentSubscriptionBody {
            group: self.group.clone(),
            stream: self.stream.clone(),
            allowed_in_flight_messages: self.buffer_size,
            credentials: self.credentials.clone(),
        };
        let payload = Bytes::from(serde_json::to_vec(&body).unwrap_or_default());
        if self.credentials.is_some() {
            Frame::authenticated(command::CONNECT_TO_PERSISTENT_SUBSCRIPTION, self.id, payload)
        } else {
            Frame::new(command::CONNECT_TO_PERSISTENT_SUBSCRIPTION, self.id, payload)
        }
    }

    fn respond_to(&mut self, frame: &Frame) -> Reply {
        if let Some(err) = common_rejection(frame) {
            return self.fail(err);
        }
        match frame.command {
            command::PERSISTENT_SUBSCRIPTION_CONFIRMATION => {
                let body: PersistentSubscriptionConfirmationBody =
                    match serde_json::from_slice(&frame.payload) {
                        Ok(body) => body,
                        Err(e) => {
                            return self.fail(ClientError::Protocol(format!(
                                "decoding subscription confirmation: {e}"
                            )));
                        }
                    };
                self.confirmed = true;
                Reply::of(ReplyAction::BeginPersistentSubscription(
                    SubscriptionDescriptor {
                        subscription_id: body.subscription_id,
                        group: self.group.clone(),
                        stream: self.stream.clone(),
                        buffer_size: self.buffer_size as usize,
                        last_event_number: body.last_event_number,
                        conversation_id: self.id,
                        credentials: self.credentials.clone(),
                    },
                ))
            }
            command::PERSISTENT_SUBSCRIPTION_STREAM_EVENT_APPEARED => {
                match serde_json::from_slice::<PersistentSubscriptionEventBody>(&frame.payload) {
                    Ok(body) => Reply::of(ReplyAction::YieldToSubscription(body.event)),
                    Err(e) => self.fail(ClientError::Protocol(format!(
                        "decoding subscription event: {e}"
                    ))),
                }
            }
            command::SUBSCRIPTION_DROPPED => {
                self.complete = true;
                let reason = serde_json::from_slice::<SubscriptionDroppedBody>(&frame.payload)
                    .map(|body| body.reason)
                    .unwrap_or(SubscriptionDropReason::Unsubscribed);
                match reason {
                    SubscriptionDropReason::Unsubscribed => {
                        Reply::of(ReplyAction::FinishSubscription)
                    }
                    other => Reply::of(ReplyAction::RaiseToSubscription(
                        ClientError::SubscriptionDropped {
                            reason: format!("{other:?}"),
                        },
                    )),
                }
            }
            other => self.fail(ClientError::UnexpectedCommand {
                expected: "a persistent subscription frame",
                actual: other,
            }),
        }
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

// ---------------------------------------------------------------------------
// AckEvents
// ---------------------------------------------------------------------------

/// Acknowledge processed subscription events. One-way: sent on whichever
/// transport is current, never tracked, no reply expected.
#[derive(Debug)]
pub struct AckEvents {
    id: Uuid,
    payload: Bytes,
    authenticated: bool,
}

impl AckEvents {
    pub fn new(
        subscription_id: String,
        processed_event_ids: Vec<Uuid>,
        credentials: Option<Credentials>,
    ) -> AckEvents {
        let body = AckEventsBody {
            subscription_id,
            processed_event_ids,
        };
        AckEvents {
            id: Uuid::new_v4(),
            payload: Bytes::from(serde_json::to_vec(&body).unwrap_or_default()),
            authenticated: credentials.is_some(),
        }
    }
}

impl Conversation for AckEvents {
    fn id(&self) -> Uuid {
        self.id
    }

    fn is_one_way(&self) -> bool {
        true
    }

    fn start(&self) -> Frame {
        if self.authenticated {
            Frame::authenticated(
                command::PERSISTENT_SUBSCRIPTION_ACK_EVENTS,
                self.id,
                self.payload.clone(),
            )
        } else {
            Frame::new(
                command::PERSISTENT_SUBSCRIPTION_ACK_EVENTS,
                self.id,
                self.payload.clone(),
            )
        }
    }

    fn respond_to(&mut self, frame: &Frame) -> Reply {
        // One-way conversations are never tracked, so nothing should arrive.
        Reply::of(ReplyAction::CompleteError(ClientError::UnexpectedCommand {
            expected: "no reply to a one-way conversation",
            actual: frame.command,
        }))
    }

    fn is_complete(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use esdb_protocol::RecordedEvent;

    fn subscription() -> ConnectPersistentSubscription {
        ConnectPersistentSubscription::new("group-a".to_owned(), "orders".to_owned(), 16, None)
    }

    fn confirmation_frame(conversation_id: Uuid) -> Frame {
        let body = PersistentSubscriptionConfirmationBody {
            subscription_id: "group-a::orders".to_owned(),
            last_commit_position: 42,
            last_event_number: 7,
        };
        Frame::new(
            command::PERSISTENT_SUBSCRIPTION_CONFIRMATION,
            conversation_id,
            Bytes::from(serde_json::to_vec(&body).unwrap()),
        )
    }

    fn event_frame(conversation_id: Uuid, event_number: u64) -> Frame {
        let body = PersistentSubscriptionEventBody {
            event: RecordedEvent {
                stream: "orders".to_owned(),
                event_id: Uuid::new_v4(),
                event_number,
                event_type: "order-placed".to_owned(),
                data: serde_json::json!({}),
                metadata: None,
                created: Utc::now(),
            },
            retry_count: 0,
        };
        Frame::new(
            command::PERSISTENT_SUBSCRIPTION_STREAM_EVENT_APPEARED,
            conversation_id,
            Bytes::from(serde_json::to_vec(&body).unwrap()),
        )
    }

    #[test]
    fn confirmation_begins_the_subscription() {
        let mut conversation = subscription();
        let reply = conversation.respond_to(&confirmation_frame(conversation.id()));

        match reply.action {
            ReplyAction::BeginPersistentSubscription(descriptor) => {
                assert_eq!(descriptor.subscription_id, "group-a::orders");
                assert_eq!(descriptor.buffer_size, 16);
                assert_eq!(descriptor.last_event_number, 7);
            }
            other => panic!("expected BeginPersistentSubscription, got {other:?}"),
        }
        assert!(!conversation.is_complete(), "subscriptions are long-lived");
    }

    #[test]
    fn appeared_events_yield_into_the_subscription() {
        let mut conversation = subscription();
        let _ = conversation.respond_to(&confirmation_frame(conversation.id()));

        let reply = conversation.respond_to(&event_frame(conversation.id(), 8));
        match reply.action {
            ReplyAction::YieldToSubscription(event) => assert_eq!(event.event_number, 8),
            other => panic!("expected YieldToSubscription, got {other:?}"),
        }
    }

    #[test]
    fn unsubscribe_finishes_cleanly() {
        let mut conversation = subscription();
        let _ = conversation.respond_to(&confirmation_frame(conversation.id()));

        let body = SubscriptionDroppedBody {
            reason: SubscriptionDropReason::Unsubscribed,
        };
        let frame = Frame::new(
            command::SUBSCRIPTION_DROPPED,
            conversation.id(),
            Bytes::from(serde_json::to_vec(&body).unwrap()),
        );
        let reply = conversation.respond_to(&frame);
        assert!(matches!(reply.action, ReplyAction::FinishSubscription));
        assert!(conversation.is_complete());
    }

    #[test]
    fn access_denied_drop_raises_into_the_subscription() {
        let mut conversation = subscription();
        let _ = conversation.respond_to(&confirmation_frame(conversation.id()));

        let body = SubscriptionDroppedBody {
            reason: SubscriptionDropReason::AccessDenied,
        };
        let frame = Frame::new(
            command::SUBSCRIPTION_DROPPED,
            conversation.id(),
            Bytes::from(serde_json::to_vec(&body).unwrap()),
        );
        let reply = conversation.respond_to(&frame);
        assert!(matches!(
            reply.action,
            ReplyAction::RaiseToSubscription(ClientError::SubscriptionDropped { .. })
        ));
    }

    #[test]
    fn rejection_before_confirmation_fails_the_waiter() {
        let mut conversation = subscription();
        let frame = Frame::new(
            command::NOT_AUTHENTICATED,
            conversation.id(),
            Bytes::new(),
        );
        let reply = conversation.respond_to(&frame);
        assert!(matches!(
            reply.action,
            ReplyAction::CompleteError(ClientError::NotAuthenticated)
        ));
    }

    #[test]
    fn ack_is_one_way() {
        let ack = AckEvents::new("group-a::orders".to_owned(), vec![Uuid::new_v4()], None);
        assert!(ack.is_one_way());
        assert_eq!(
            ack.start().command,
            command::PERSISTENT_SUBSCRIPTION_ACK_EVENTS
        );
    }
}
