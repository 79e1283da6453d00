//! Cluster membership bridge (gossip subscriber, ring topology).

/// Gossip-to-messaging subscriber and its collaborator traits.
pub mod subscriber;
/// Host-id to endpoint topology table.
pub mod topology;

pub use subscriber::{
    ApplicationState, ClusterSubscriber, EndpointLifecycleSubscriber, EndpointState,
    EndpointStateChangeSubscriber, GossipSource, PeerStore, VersionedValue,
};
pub use topology::TopologyMetaData;
