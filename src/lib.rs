//! Asynchronous inter-node messaging fabric for a clustered storage server.
//!
//! The fabric carries gossip, schema pulls, echo probes, and generic replies
//! between peers over verb-addressed, per-peer multiplexed TCP connections.
//! Requests register expiring callbacks keyed by message id; handlers run on
//! fixed worker stages so gossip is never starved by request traffic.
//!
//! The entry point is [`net::MessagingService`], constructed once by the
//! server bootstrap and shared by reference; there is no global instance.

/// Membership bridge between gossip and messaging.
pub mod cluster;
/// Configuration structs and collaborator traits.
pub mod config;
/// Error types surfaced by the fabric.
pub mod error;
/// The messaging fabric itself.
pub mod net;

pub use config::{
    AllowAllAuthenticator, DirectIpResolver, InternodeAuthenticator, InternodeEncryption,
    MessagingConfig, PreferredIpResolver,
};
pub use error::{ConfigError, NetError, WireError};
pub use net::{
    AsyncCallback, MessageIn, MessageOut, MessagingService, Payload, Verb, VerbHandler,
};
