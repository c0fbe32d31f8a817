// Wire command codes.
//
// The engine interprets exactly two of these (the heartbeat pair); every
// other frame is routed to its conversation by conversation id, so codes
// absent from this list still round-trip through the codec untouched.

pub const HEARTBEAT_REQUEST: u8 = 0x01;
pub const HEARTBEAT_RESPONSE: u8 = 0x02;
pub const PING: u8 = 0x03;
pub const PONG: u8 = 0x04;

pub const WRITE_EVENTS: u8 = 0x82;
pub const WRITE_EVENTS_COMPLETED: u8 = 0x83;

pub const READ_STREAM_EVENTS_FORWARD: u8 = 0xB2;
pub const READ_STREAM_EVENTS_FORWARD_COMPLETED: u8 = 0xB3;

pub const SUBSCRIBE_TO_STREAM: u8 = 0xC0;
pub const SUBSCRIPTION_CONFIRMATION: u8 = 0xC1;
pub const STREAM_EVENT_APPEARED: u8 = 0xC2;
pub const UNSUBSCRIBE_FROM_STREAM: u8 = 0xC3;
pub const SUBSCRIPTION_DROPPED: u8 = 0xC4;
pub const CONNECT_TO_PERSISTENT_SUBSCRIPTION: u8 = 0xC5;
pub const PERSISTENT_SUBSCRIPTION_CONFIRMATION: u8 = 0xC6;
pub const PERSISTENT_SUBSCRIPTION_STREAM_EVENT_APPEARED: u8 = 0xC7;
pub const PERSISTENT_SUBSCRIPTION_ACK_EVENTS: u8 = 0xCC;
pub const PERSISTENT_SUBSCRIPTION_NAK_EVENTS: u8 = 0xCD;

pub const BAD_REQUEST: u8 = 0xF0;
pub const NOT_HANDLED: u8 = 0xF1;
pub const AUTHENTICATE: u8 = 0xF2;
pub const AUTHENTICATED: u8 = 0xF3;
pub const NOT_AUTHENTICATED: u8 = 0xF4;

/// Human-readable name for log output.
pub fn name(command: u8) -> &'static str {
    match command {
        HEARTBEAT_REQUEST => "HeartbeatRequest",
        HEARTBEAT_RESPONSE => "HeartbeatResponse",
        PING => "Ping",
        PONG => "Pong",
        WRITE_EVENTS => "WriteEvents",
        WRITE_EVENTS_COMPLETED => "WriteEventsCompleted",
        READ_STREAM_EVENTS_FORWARD => "ReadStreamEventsForward",
        READ_STREAM_EVENTS_FORWARD_COMPLETED => "ReadStreamEventsForwardCompleted",
        SUBSCRIBE_TO_STREAM => "SubscribeToStream",
        SUBSCRIPTION_CONFIRMATION => "SubscriptionConfirmation",
        STREAM_EVENT_APPEARED => "StreamEventAppeared",
        UNSUBSCRIBE_FROM_STREAM => "UnsubscribeFromStream",
        SUBSCRIPTION_DROPPED => "SubscriptionDropped",
        CONNECT_TO_PERSISTENT_SUBSCRIPTION => "ConnectToPersistentSubscription",
        PERSISTENT_SUBSCRIPTION_CONFIRMATION => "PersistentSubscriptionConfirmation",
        PERSISTENT_SUBSCRIPTION_STREAM_EVENT_APPEARED => "PersistentSubscriptionEventAppeared",
        PERSISTENT_SUBSCRIPTION_ACK_EVENTS => "PersistentSubscriptionAckEvents",
        PERSISTENT_SUBSCRIPTION_NAK_EVENTS => "PersistentSubscriptionNakEvents",
        BAD_REQUEST => "BadRequest",
        NOT_HANDLED => "NotHandled",
        AUTHENTICATE => "Authenticate",
        AUTHENTICATED => "Authenticated",
        NOT_AUTHENTICATED => "NotAuthenticated",
        _ => "Unknown",
    }
}
