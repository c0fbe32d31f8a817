use bytes::Bytes;
use esdb_protocol::{
    Credentials, Frame, NewEventData, OperationResult, WriteEventsBody, WriteEventsCompletedBody,
    command,
};
use uuid::Uuid;

use super::{Conversation, Reply, ReplyAction, common_rejection};
use crate::error::ClientError;

/// Append a batch of events to a stream.
///
/// The opening frame is idempotent server-side, which is what makes replay
/// after a reconnect safe: the server deduplicates on the event ids.
#[derive(Debug)]
pub struct WriteEvents {
    id: Uuid,
    stream: String,
    payload: Bytes,
    authenticated: bool,
    complete: bool,
}

impl WriteEvents {
    pub fn new(
        stream: String,
        events: Vec<NewEventData>,
        expected_version: i64,
        credentials: Option<Credentials>,
    ) -> WriteEvents {
        let authenticated = credentials.is_some();
        let body = WriteEventsBody {
            stream: stream.clone(),
            expected_version,
            require_leader: false,
            events,
            credentials,
        };
        WriteEvents {
            id: Uuid::new_v4(),
            stream,
            payload: Bytes::from(serde_json::to_vec(&body).unwrap_or_default()),
            authenticated,
            complete: false,
        }
    }
}

impl Conversation for WriteEvents {
    fn id(&self) -> Uuid {
        self.id
    }

    fn start(&self) -> Frame {
        if self.authenticated {
            Frame::authenticated(command::WRITE_EVENTS, self.id, self.payload.clone())
        } else {
            Frame::new(command::WRITE_EVENTS, self.id, self.payload.clone())
        }
    }

    fn respond_to(&mut self, frame: &Frame) -> Reply {
        self.complete = true;
        if let Some(err) = common_rejection(frame) {
            return Reply::of(ReplyAction::CompleteError(err));
        }
        if frame.command != command::WRITE_EVENTS_COMPLETED {
            return Reply::of(ReplyAction::CompleteError(ClientError::UnexpectedCommand {
                expected: "WriteEventsCompleted",
                actual: frame.command,
            }));
        }
        let body: WriteEventsCompletedBody = match serde_json::from_slice(&frame.payload) {
            Ok(body) => body,
            Err(e) => {
                return Reply::of(ReplyAction::CompleteError(ClientError::Protocol(format!(
                    "decoding WriteEventsCompleted: {e}"
                ))));
            }
        };
        match body.result {
            OperationResult::Success => Reply::of(ReplyAction::CompleteScalar(frame.clone())),
            result => {
                let message = body.message.unwrap_or_else(|| {
                    format!("{result:?} writing to stream '{}'", self.stream)
                });
                Reply::of(ReplyAction::CompleteError(ClientError::OperationFailed {
                    message,
                }))
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed_frame(conversation_id: Uuid, result: OperationResult) -> Frame {
        let body = WriteEventsCompletedBody {
            result,
            message: None,
            first_event_number: 0,
            last_event_number: 0,
        };
        Frame::new(
            command::WRITE_EVENTS_COMPLETED,
            conversation_id,
            Bytes::from(serde_json::to_vec(&body).unwrap()),
        )
    }

    fn write_events() -> WriteEvents {
        let event = NewEventData {
            event_id: Uuid::new_v4(),
            event_type: "order-placed".to_owned(),
            data: serde_json::json!({"total": 12}),
            metadata: None,
        };
        WriteEvents::new(
            "orders".to_owned(),
            vec![event],
            esdb_protocol::expected_version::ANY,
            None,
        )
    }

    #[test]
    fn start_is_repeatable_with_a_stable_conversation_id() {
        let conversation = write_events();
        let first = conversation.start();
        let second = conversation.start();
        assert_eq!(first, second);
        assert_eq!(first.command, command::WRITE_EVENTS);
    }

    #[test]
    fn successful_completion_resolves_scalar() {
        let mut conversation = write_events();
        let frame = completed_frame(conversation.id(), OperationResult::Success);

        let reply = conversation.respond_to(&frame);
        assert!(conversation.is_complete());
        assert!(matches!(reply.action, ReplyAction::CompleteScalar(_)));
    }

    #[test]
    fn wrong_expected_version_becomes_an_operation_failure() {
        let mut conversation = write_events();
        let frame = completed_frame(conversation.id(), OperationResult::WrongExpectedVersion);

        let reply = conversation.respond_to(&frame);
        match reply.action {
            ReplyAction::CompleteError(ClientError::OperationFailed { message }) => {
                assert!(message.contains("WrongExpectedVersion"));
            }
            other => panic!("expected OperationFailed, got {other:?}"),
        }
    }

    #[test]
    fn credentials_set_the_authenticated_flag() {
        let conversation = WriteEvents::new(
            "orders".to_owned(),
            vec![],
            esdb_protocol::expected_version::ANY,
            Some(Credentials {
                username: "admin".to_owned(),
                password: "changeit".to_owned(),
            }),
        );
        assert_eq!(conversation.start().flags, esdb_protocol::flags::AUTHENTICATED);
    }
}
