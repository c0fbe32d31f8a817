// esdb-client: async client engine for the esdb TCP protocol.
//
// The engine is a connector state machine owning per-connection transports,
// a dispatcher that correlates conversation replies and survives reconnects,
// and a heartbeat pacemaker. The high-level operations are thin conversation
// state machines layered on top.

pub mod client;
pub mod config;
pub mod connector;
pub mod conversations;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod pacemaker;
pub mod transport;

pub use client::{Client, StreamPage};
pub use config::{ClientConfig, ConfigError, load_config_from_path, load_config_from_str};
pub use connector::{ConnectionEvent, ConnectorHandle, ConnectorState};
pub use conversations::{Conversation, Reply, ReplyAction};
pub use discovery::{
    Discovery, DiscoveryError, DiscoveryRetryPolicy, DnsDiscovery, NodeService, StaticDiscovery,
};
pub use dispatcher::{
    ConversationReply, Dispatcher, EventStream, ResultHandle, SubscriptionHandle,
};
pub use error::ClientError;
