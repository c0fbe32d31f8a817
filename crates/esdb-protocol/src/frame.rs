use bytes::Bytes;
use uuid::Uuid;

use crate::command;

/// Frame flag bits.
pub mod flags {
    pub const NONE: u8 = 0x00;
    /// The frame carries credentials in its body.
    pub const AUTHENTICATED: u8 = 0x01;
}

/// One unit of the wire protocol: fixed header plus opaque payload.
///
/// The conversation id correlates every frame of one request/response
/// exchange. It is generated client-side when the conversation is created
/// and echoed by the server on every reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub flags: u8,
    pub conversation_id: Uuid,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(command: u8, conversation_id: Uuid, payload: Bytes) -> Frame {
        Frame {
            command,
            flags: flags::NONE,
            conversation_id,
            payload,
        }
    }

    pub fn authenticated(command: u8, conversation_id: Uuid, payload: Bytes) -> Frame {
        Frame {
            command,
            flags: flags::AUTHENTICATED,
            conversation_id,
            payload,
        }
    }

    /// Liveness probe.
    pub fn heartbeat_request(conversation_id: Uuid) -> Frame {
        Frame::new(command::HEARTBEAT_REQUEST, conversation_id, Bytes::new())
    }

    /// Answer to a liveness probe, echoing the probe's conversation id.
    pub fn heartbeat_response(conversation_id: Uuid) -> Frame {
        Frame::new(command::HEARTBEAT_RESPONSE, conversation_id, Bytes::new())
    }
}
