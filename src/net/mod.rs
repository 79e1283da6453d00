//! Inter-node messaging fabric (verbs, connections, callbacks, stages).

/// Pending-reply registry with per-entry expiry.
pub mod callback;
/// Verb handler contract and the fabric's own handlers.
pub mod handlers;
/// Inbound connection reader and frame decoding.
pub mod inbound;
/// Accept loop for peer connections.
pub mod listener;
/// Message envelopes and payload codecs.
pub mod message;
/// Dropped-message accounting and latency fanout.
pub mod metrics;
/// Per-peer outbound connection with lazy connect.
pub mod outbound;
/// The messaging hub facade.
pub mod service;
/// Fixed worker pools isolating handler work by class.
pub mod stage;
/// Closed verb enumeration and static associations.
pub mod verb;
/// Wire-level framing primitives.
pub mod wire;

pub use callback::{AsyncCallback, CallbackInfo, ExpiringMap};
pub use handlers::{EchoVerbHandler, ResponseVerbHandler, VerbHandler};
pub use listener::Listener;
pub use message::{
    EchoMessage, FAILURE_CALLBACK_PARAM, FAILURE_RESPONSE_PARAM, GossipDigest, GossipDigestAck,
    GossipDigestAck2, GossipDigestSyn, GossipShutdown, MessageIn, MessageOut, ONE_BYTE, Payload,
    PayloadCodec, PullSchema, PullSchemaAck,
};
pub use metrics::{DroppedMessages, LatencySubscriber};
pub use outbound::OutboundConnection;
pub use service::MessagingService;
pub use stage::{Stage, StageManager};
pub use verb::Verb;
pub use wire::{CURRENT_VERSION, ConnectionHeader, PROTOCOL_MAGIC};
