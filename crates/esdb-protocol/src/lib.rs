// esdb-protocol: wire types and framing for the esdb TCP protocol.
//
// The frame header is a fixed binary layout handled by `FrameCodec`; payload
// bodies are serde_json-encoded and only interpreted at the edges (operation
// conversations and test servers), never by the connection engine itself.

pub mod body;
pub mod codec;
pub mod command;
pub mod frame;

pub use body::{
    AckEventsBody, ConnectPersistentSubscriptionBody, Credentials, NewEventData, NotHandledBody,
    OperationResult, PersistentSubscriptionConfirmationBody, PersistentSubscriptionEventBody,
    ReadStreamEventsBody, ReadStreamEventsCompletedBody, ReadStreamResult, RecordedEvent,
    SubscriptionDropReason, SubscriptionDroppedBody, WriteEventsBody, WriteEventsCompletedBody,
    expected_version,
};
pub use codec::{FRAME_HEADER_LEN, FrameCodec, FrameError, LENGTH_PREFIX_LEN};
pub use frame::{Frame, flags};
