use bytes::Bytes;
use esdb_protocol::{
    Credentials, Frame, ReadStreamEventsBody, ReadStreamEventsCompletedBody, ReadStreamResult,
    command,
};
use uuid::Uuid;

use super::{Conversation, Reply, ReplyAction, common_rejection};
use crate::error::ClientError;

fn page_request(
    id: Uuid,
    stream: &str,
    from_event_number: u64,
    max_count: u32,
    credentials: &Option<Credentials>,
) -> Frame {
    let body = ReadStreamEventsBody {
        stream: stream.to_owned(),
        from_event_number,
        max_count,
        resolve_links: true,
        require_leader: false,
        credentials: credentials.clone(),
    };
    let payload = Bytes::from(serde_json::to_vec(&body).unwrap_or_default());
    if credentials.is_some() {
        Frame::authenticated(command::READ_STREAM_EVENTS_FORWARD, id, payload)
    } else {
        Frame::new(command::READ_STREAM_EVENTS_FORWARD, id, payload)
    }
}

fn read_failure(body: &ReadStreamEventsCompletedBody, stream: &str) -> ClientError {
    let message = body
        .error
        .clone()
        .unwrap_or_else(|| format!("{:?} reading stream '{stream}'", body.result));
    ClientError::OperationFailed { message }
}

// ---------------------------------------------------------------------------
// ReadStreamEvents: one page
// ---------------------------------------------------------------------------

/// Read a single page of a stream; the waiter gets the raw completion frame.
#[derive(Debug)]
pub struct ReadStreamEvents {
    id: Uuid,
    stream: String,
    from_event_number: u64,
    max_count: u32,
    credentials: Option<Credentials>,
    complete: bool,
}

impl ReadStreamEvents {
    pub fn new(
        stream: String,
        from_event_number: u64,
        max_count: u32,
        credentials: Option<Credentials>,
    ) -> ReadStreamEvents {
        ReadStreamEvents {
            id: Uuid::new_v4(),
            stream,
            from_event_number,
            max_count,
            credentials,
            complete: false,
        }
    }
}

impl Conversation for ReadStreamEvents {
    fn id(&self) -> Uuid {
        self.id
    }

    fn start(&self) -> Frame {
        page_request(
            self.id,
            &self.stream,
            self.from_event_number,
            self.max_count,
            &self.credentials,
        )
    }

    fn respond_to(&mut self, frame: &Frame) -> Reply {
        self.complete = true;
        if let Some(err) = common_rejection(frame) {
            return Reply::of(ReplyAction::CompleteError(err));
        }
        if frame.command != command::READ_STREAM_EVENTS_FORWARD_COMPLETED {
            return Reply::of(ReplyAction::CompleteError(ClientError::UnexpectedCommand {
                expected: "ReadStreamEventsForwardCompleted",
                actual: frame.command,
            }));
        }
        match serde_json::from_slice::<ReadStreamEventsCompletedBody>(&frame.payload) {
            Ok(body) if body.result == ReadStreamResult::Success => {
                Reply::of(ReplyAction::CompleteScalar(frame.clone()))
            }
            Ok(body) => Reply::of(ReplyAction::CompleteError(read_failure(
                &body,
                &self.stream,
            ))),
            Err(e) => Reply::of(ReplyAction::CompleteError(ClientError::Protocol(format!(
                "decoding ReadStreamEventsForwardCompleted: {e}"
            )))),
        }
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

// ---------------------------------------------------------------------------
// IterStreamEvents: page through the whole stream
// ---------------------------------------------------------------------------

/// Page through a stream, yielding events as pages arrive.
///
/// The read position advances with every page, and `start` always asks from
/// the current position, so a replay after reconnect picks up where the
/// last delivered page ended instead of re-reading the stream.
#[derive(Debug)]
pub struct IterStreamEvents {
    id: Uuid,
    stream: String,
    batch_size: u32,
    from_event_number: u64,
    credentials: Option<Credentials>,
    started: bool,
    complete: bool,
}

impl IterStreamEvents {
    pub fn new(
        stream: String,
        from_event_number: u64,
        batch_size: u32,
        credentials: Option<Credentials>,
    ) -> IterStreamEvents {
        IterStreamEvents {
            id: Uuid::new_v4(),
            stream,
            batch_size,
            from_event_number,
            credentials,
            started: false,
            complete: false,
        }
    }

    fn fail(&mut self, err: ClientError) -> Reply {
        self.complete = true;
        if self.started {
            Reply::of(ReplyAction::RaiseToIterator(err))
        } else {
            Reply::of(ReplyAction::CompleteError(err))
        }
    }
}

impl Conversation for IterStreamEvents {
    fn id(&self) -> Uuid {
        self.id
    }

    fn start(&self) -> Frame {
        page_request(
            self.id,
            &self.stream,
            self.from_event_number,
            self.batch_size,
            &self.credentials,
        )
    }

    fn respond_to(&mut self, frame: &Frame) -> Reply {
        if let Some(err) = common_rejection(frame) {
            return self.fail(err);
        }
        if frame.command != command::READ_STREAM_EVENTS_FORWARD_COMPLETED {
            return self.fail(ClientError::UnexpectedCommand {
                expected: "ReadStreamEventsForwardCompleted",
                actual: frame.command,
            });
        }
        let body: ReadStreamEventsCompletedBody = match serde_json::from_slice(&frame.payload) {
            Ok(body) => body,
            Err(e) => {
                return self.fail(ClientError::Protocol(format!(
                    "decoding ReadStreamEventsForwardCompleted: {e}"
                )));
            }
        };
        if body.result != ReadStreamResult::Success {
            let err = read_failure(&body, &self.stream);
            return self.fail(err);
        }

        self.from_event_number = body.next_event_number;
        let first_page = !self.started;
        self.started = true;

        if body.is_end_of_stream {
            self.complete = true;
            if first_page {
                // Single-page stream: the dispatcher seeds and closes in one go.
                Reply::of(ReplyAction::BeginIterator {
                    events: body.events,
                    buffer_hint: self.batch_size as usize,
                })
            } else {
                Reply::of(ReplyAction::CompleteIterator(body.events))
            }
        } else {
            let next = self.start();
            if first_page {
                Reply::then_send(
                    ReplyAction::BeginIterator {
                        events: body.events,
                        buffer_hint: self.batch_size as usize,
                    },
                    next,
                )
            } else {
                Reply::then_send(ReplyAction::YieldToIterator(body.events), next)
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
    use chrono::Utc;
    use esdb_protocol::RecordedEvent;

    fn recorded(stream: &str, event_number: u64) -> RecordedEvent {
        RecordedEvent {
            stream: stream.to_owned(),
            event_id: Uuid::new_v4(),
            event_number,
            event_type: "tick".to_owned(),
            data: serde_json::json!({ "n": event_number }),
            metadata: None,
            created: Utc::now(),
        }
    }

    fn page_frame(
        conversation_id: Uuid,
        events: Vec<RecordedEvent>,
        next_event_number: u64,
        is_end_of_stream: bool,
    ) -> Frame {
        let body = ReadStreamEventsCompletedBody {
            result: ReadStreamResult::Success,
            last_event_number: events.last().map_or(-1, |e| e.event_number as i64),
            events,
            next_event_number,
            is_end_of_stream,
            error: None,
        };
        Frame::new(
            command::READ_STREAM_EVENTS_FORWARD_COMPLETED,
            conversation_id,
            Bytes::from(serde_json::to_vec(&body).unwrap()),
        )
    }

    #[test]
    fn first_page_begins_the_iterator_and_requests_the_next_page() {
        let mut iter = IterStreamEvents::new("ticks".to_owned(), 0, 2, None);
        let events = vec![recorded("ticks", 0), recorded("ticks", 1)];
        let frame = page_frame(iter.id(), events, 2, false);

        let reply = iter.respond_to(&frame);
        assert!(matches!(
            reply.action,
            ReplyAction::BeginIterator { ref events, .. } if events.len() == 2
        ));
        let follow_up = reply.outbound.expect("must request the next page");
        assert_eq!(follow_up.command, command::READ_STREAM_EVENTS_FORWARD);
        assert!(!iter.is_complete());
    }

    #[test]
    fn replayed_start_asks_from_the_current_position() {
        let mut iter = IterStreamEvents::new("ticks".to_owned(), 0, 2, None);
        let frame = page_frame(iter.id(), vec![recorded("ticks", 0), recorded("ticks", 1)], 2, false);
        let _ = iter.respond_to(&frame);

        let restart = iter.start();
        let body: ReadStreamEventsBody = serde_json::from_slice(&restart.payload).unwrap();
        assert_eq!(body.from_event_number, 2);
    }

    #[test]
    fn middle_page_yields_and_requests_more() {
        let mut iter = IterStreamEvents::new("ticks".to_owned(), 0, 2, None);
        let _ = iter.respond_to(&page_frame(iter.id(), vec![recorded("ticks", 0)], 1, false));

        let reply = iter.respond_to(&page_frame(iter.id(), vec![recorded("ticks", 1)], 2, false));
        assert!(matches!(reply.action, ReplyAction::YieldToIterator(_)));
        assert!(reply.outbound.is_some());
    }

    #[test]
    fn final_page_completes_the_iterator() {
        let mut iter = IterStreamEvents::new("ticks".to_owned(), 0, 2, None);
        let _ = iter.respond_to(&page_frame(iter.id(), vec![recorded("ticks", 0)], 1, false));

        let reply = iter.respond_to(&page_frame(iter.id(), vec![recorded("ticks", 1)], 2, true));
        assert!(matches!(reply.action, ReplyAction::CompleteIterator(_)));
        assert!(reply.outbound.is_none());
        assert!(iter.is_complete());
    }

    #[test]
    fn single_page_stream_begins_and_completes_at_once() {
        let mut iter = IterStreamEvents::new("ticks".to_owned(), 0, 10, None);
        let reply = iter.respond_to(&page_frame(iter.id(), vec![recorded("ticks", 0)], 1, true));

        assert!(matches!(reply.action, ReplyAction::BeginIterator { .. }));
        assert!(iter.is_complete());
    }

    #[test]
    fn failure_before_the_first_page_fails_the_waiter() {
        let mut iter = IterStreamEvents::new("missing".to_owned(), 0, 10, None);
        let body = ReadStreamEventsCompletedBody {
            result: ReadStreamResult::NoStream,
            events: vec![],
            next_event_number: 0,
            last_event_number: -1,
            is_end_of_stream: true,
            error: None,
        };
        let frame = Frame::new(
            command::READ_STREAM_EVENTS_FORWARD_COMPLETED,
            iter.id(),
            Bytes::from(serde_json::to_vec(&body).unwrap()),
        );

        let reply = iter.respond_to(&frame);
        assert!(matches!(reply.action, ReplyAction::CompleteError(_)));
    }

    #[test]
    fn failure_mid_stream_raises_into_the_iterator() {
        let mut iter = IterStreamEvents::new("ticks".to_owned(), 0, 1, None);
        let _ = iter.respond_to(&page_frame(iter.id(), vec![recorded("ticks", 0)], 1, false));

        let rejection = Frame::new(command::BAD_REQUEST, iter.id(), Bytes::from_static(b"boom"));
        let reply = iter.respond_to(&rejection);
        assert!(matches!(reply.action, ReplyAction::RaiseToIterator(_)));
        assert!(iter.is_complete());
    }
}
