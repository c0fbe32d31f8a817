use bytes::Bytes;
use esdb_protocol::{Frame, command};
use uuid::Uuid;

use super::{Conversation, Reply, ReplyAction, common_rejection};
use crate::error::ClientError;

/// Liveness round-trip through the full dispatch path, unlike pacemaker
/// probes, which bypass the dispatcher entirely.
#[derive(Debug)]
pub struct Ping {
    id: Uuid,
    complete: bool,
}

impl Ping {
    pub fn new() -> Ping {
        Ping::with_id(Uuid::new_v4())
    }

    pub fn with_id(id: Uuid) -> Ping {
        Ping {
            id,
            complete: false,
        }
    }
}

impl Default for Ping {
    fn default() -> Ping {
        Ping::new()
    }
}

impl Conversation for Ping {
    fn id(&self) -> Uuid {
        self.id
    }

    fn start(&self) -> Frame {
        Frame::new(command::PING, self.id, Bytes::new())
    }

    fn respond_to(&mut self, frame: &Frame) -> Reply {
        self.complete = true;
        if let Some(err) = common_rejection(frame) {
            return Reply::of(ReplyAction::CompleteError(err));
        }
        match frame.command {
            command::PONG => Reply::of(ReplyAction::CompleteScalar(frame.clone())),
            other => Reply::of(ReplyAction::CompleteError(ClientError::UnexpectedCommand {
                expected: "Pong",
                actual: other,
            })),
        }
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}
