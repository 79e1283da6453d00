//! Membership bridge between gossip endpoint state and the messaging fabric.
//!
//! The gossip state machine itself lives elsewhere; this module consumes its
//! notifications, maintains the host-id topology, persists peer metadata
//! through the [`PeerStore`] collaborator, and resets peer connections when
//! the failure detector convicts a node. The messaging service is the
//! subscriber's sole delivery mechanism.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::topology::TopologyMetaData;
use crate::net::service::MessagingService;

/// Keys of the per-endpoint application state map carried by gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationState {
    /// Ring status transitions (normal, leaving, left, removing).
    Status,
    /// Software release version.
    ReleaseVersion,
    /// Datacenter reported by the snitch.
    Dc,
    /// Rack reported by the snitch.
    Rack,
    /// Client-facing RPC address.
    RpcAddress,
    /// Schema version identifier.
    Schema,
    /// Stable host identifier.
    HostId,
    /// Messaging protocol version.
    NetVersion,
}

/// One versioned gossip value; higher versions supersede lower ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    /// Delimiter-joined value pieces.
    pub value: String,
    /// Monotone version assigned by the originating node.
    pub version: u64,
}

/// Status piece values and the delimiter joining them.
pub mod status {
    /// Field separator inside a status value.
    pub const DELIMITER: char = ',';
    /// Endpoint participates normally in the ring.
    pub const NORMAL: &str = "NORMAL";
    /// Endpoint is preparing to leave.
    pub const LEAVING: &str = "LEAVING";
    /// Endpoint has left; the second piece carries the expiry time.
    pub const LEFT: &str = "LEFT";
    /// Endpoint is being force-removed; replicas still restoring.
    pub const REMOVING: &str = "removing";
    /// Endpoint removal completed.
    pub const REMOVED: &str = "removed";
}

/// Gossip-visible state of one endpoint.
#[derive(Debug, Clone, Default)]
pub struct EndpointState {
    /// Application state map for the endpoint.
    pub application_states: HashMap<ApplicationState, VersionedValue>,
    /// Failure-detector liveness verdict.
    pub alive: bool,
}

/// Notifications the gossip layer delivers about endpoint state.
pub trait EndpointStateChangeSubscriber: Send + Sync {
    /// A previously unknown endpoint joined gossip with `state`.
    fn on_join(&self, endpoint: IpAddr, state: &EndpointState);
    /// One application state entry changed.
    fn on_change(&self, endpoint: IpAddr, state_key: ApplicationState, value: &VersionedValue);
    /// The failure detector marked the endpoint alive.
    fn on_alive(&self, endpoint: IpAddr, state: &EndpointState);
    /// The failure detector marked the endpoint dead.
    fn on_dead(&self, endpoint: IpAddr, state: &EndpointState);
    /// Gossip forgot the endpoint entirely.
    fn on_remove(&self, endpoint: IpAddr);
    /// The endpoint restarted (new generation observed).
    fn on_restart(&self, endpoint: IpAddr, state: &EndpointState);
}

/// Coarse ring-membership notifications fanned out to interested
/// subsystems (replication, load balancing).
pub trait EndpointLifecycleSubscriber: Send + Sync {
    /// Endpoint became a normal ring member.
    fn on_join_cluster(&self, endpoint: IpAddr);
    /// Endpoint left the ring.
    fn on_leave_cluster(&self, endpoint: IpAddr);
    /// Endpoint came back up.
    fn on_up(&self, endpoint: IpAddr);
    /// Endpoint went down.
    fn on_down(&self, endpoint: IpAddr);
}

/// Persistence hook for peer metadata (system tables).
pub trait PeerStore: Send + Sync {
    /// Records one metadata field for a peer.
    fn update_peer_info(&self, endpoint: IpAddr, field: &str, value: &str);
    /// Forgets everything stored about a peer.
    fn remove_endpoint(&self, endpoint: IpAddr);
}

/// Read/maintenance interface the subscriber needs from the gossip layer.
pub trait GossipSource: Send + Sync {
    /// Current state for `endpoint`, if gossip knows it.
    fn endpoint_state(&self, endpoint: IpAddr) -> Option<EndpointState>;
    /// Whether `state` is terminal (dead or removed).
    fn is_dead_state(&self, state: &EndpointState) -> bool;
    /// Host id advertised by `endpoint`.
    fn host_id(&self, endpoint: IpAddr) -> Option<u32>;
    /// Orders two endpoints by startup generation; `Greater` means `a`
    /// started more recently.
    fn compare_endpoint_startup(&self, a: IpAddr, b: IpAddr) -> Ordering;
    /// Asks gossip to forget `endpoint`.
    fn remove_endpoint(&self, endpoint: IpAddr);
    /// Records when a removed endpoint's tombstone may be purged.
    fn add_expire_time(&self, endpoint: IpAddr, expire_at_millis: u64);
}

/// The storage server's membership subscriber.
pub struct ClusterSubscriber {
    service: Arc<MessagingService>,
    topology: TopologyMetaData,
    gossip: Arc<dyn GossipSource>,
    peers: Arc<dyn PeerStore>,
    lifecycle: RwLock<Vec<Arc<dyn EndpointLifecycleSubscriber>>>,
    local: IpAddr,
}

impl ClusterSubscriber {
    /// Builds the subscriber for the local node.
    #[must_use]
    pub fn new(
        service: Arc<MessagingService>,
        gossip: Arc<dyn GossipSource>,
        peers: Arc<dyn PeerStore>,
    ) -> Self {
        let local = service.config().broadcast_address();
        Self {
            service,
            topology: TopologyMetaData::new(),
            gossip,
            peers,
            lifecycle: RwLock::new(Vec::new()),
            local,
        }
    }

    /// Registers a lifecycle observer.
    pub fn register(&self, subscriber: Arc<dyn EndpointLifecycleSubscriber>) {
        self.lifecycle.write().push(subscriber);
    }

    /// Ring topology maintained from gossip.
    #[must_use]
    pub fn topology(&self) -> &TopologyMetaData {
        &self.topology
    }

    fn each_lifecycle(&self, mut apply: impl FnMut(&dyn EndpointLifecycleSubscriber)) {
        let snapshot: Vec<_> = self.lifecycle.read().iter().cloned().collect();
        for subscriber in snapshot {
            apply(subscriber.as_ref());
        }
    }

    fn update_peer_field(&self, endpoint: IpAddr, state_key: ApplicationState, value: &str) {
        let field = match state_key {
            ApplicationState::ReleaseVersion => "release_version",
            ApplicationState::Dc => "data_center",
            ApplicationState::Rack => "rack",
            ApplicationState::RpcAddress => "rpc_address",
            ApplicationState::Schema => "db_version",
            ApplicationState::HostId => "host_id",
            ApplicationState::Status | ApplicationState::NetVersion => return,
        };
        self.peers.update_peer_info(endpoint, field, value);
    }

    fn update_peer_info(&self, endpoint: IpAddr) {
        if endpoint == self.local {
            return;
        }
        if let Some(state) = self.gossip.endpoint_state(endpoint) {
            for (state_key, value) in &state.application_states {
                self.update_peer_field(endpoint, *state_key, &value.value);
            }
        }
    }

    /// Endpoint entered the normal state: record metadata, settle host-id
    /// ownership, and announce the join.
    fn handle_state_normal(&self, endpoint: IpAddr) {
        if self.topology.is_member(endpoint) {
            info!(%endpoint, "node state jump to normal");
        }
        self.update_peer_info(endpoint);

        if let Some(host_id) = self.gossip.host_id(endpoint) {
            match self.topology.get_endpoint_for_host_id(host_id) {
                Some(existing) if existing != endpoint => {
                    if existing == self.local {
                        warn!(host_id, %endpoint, "not updating host id because it's mine");
                        self.remove_quietly(endpoint);
                        return;
                    } else if self.gossip.compare_endpoint_startup(endpoint, existing)
                        == Ordering::Greater
                    {
                        warn!(host_id, %existing, %endpoint, "host id collision; the newer node wins");
                        self.remove_quietly(existing);
                        self.topology.update_host_id(host_id, endpoint);
                    } else {
                        warn!(host_id, %existing, %endpoint, "host id collision; ignoring the older node");
                        self.remove_quietly(endpoint);
                        return;
                    }
                }
                _ => self.topology.update_host_id(host_id, endpoint),
            }
        }

        self.each_lifecycle(|subscriber| subscriber.on_join_cluster(endpoint));
    }

    fn handle_state_leaving(&self, endpoint: IpAddr) {
        if !self.topology.is_member(endpoint) {
            info!(%endpoint, "node state jump to leaving");
        }
        self.topology.add_leaving_endpoint(endpoint);
    }

    fn handle_state_left(&self, endpoint: IpAddr, pieces: &[&str]) {
        self.excise(endpoint, extract_expire_time(pieces));
    }

    fn handle_state_removing(&self, endpoint: IpAddr, pieces: &[&str]) {
        if endpoint == self.local {
            info!("received removenode gossip about myself; rejoining after an explicit removenode?");
            return;
        }
        if self.topology.is_member(endpoint) {
            match pieces[0] {
                status::REMOVED => self.excise(endpoint, extract_expire_time(pieces)),
                status::REMOVING => self.topology.add_leaving_endpoint(endpoint),
                _ => {}
            }
        } else {
            // Gossip told us about a non-member; make it forget too.
            if pieces[0] == status::REMOVED {
                let expire_time = extract_expire_time(pieces);
                if expire_time != 0 {
                    self.gossip.add_expire_time(endpoint, expire_time);
                }
            }
            self.remove_quietly(endpoint);
        }
    }

    fn excise(&self, endpoint: IpAddr, expire_time: u64) {
        if expire_time != 0 {
            self.gossip.add_expire_time(endpoint, expire_time);
        }
        info!(%endpoint, "removing endpoint");
        self.remove_quietly(endpoint);
        self.topology.remove_endpoint(endpoint);
        self.each_lifecycle(|subscriber| subscriber.on_leave_cluster(endpoint));
    }

    /// Removal without lifecycle notifications.
    fn remove_quietly(&self, endpoint: IpAddr) {
        self.gossip.remove_endpoint(endpoint);
        self.peers.remove_endpoint(endpoint);
        self.topology.remove_endpoint(endpoint);
    }
}

impl EndpointStateChangeSubscriber for ClusterSubscriber {
    fn on_join(&self, endpoint: IpAddr, state: &EndpointState) {
        for (state_key, value) in &state.application_states {
            self.on_change(endpoint, *state_key, value);
        }
    }

    fn on_change(&self, endpoint: IpAddr, state_key: ApplicationState, value: &VersionedValue) {
        if state_key == ApplicationState::Status {
            let pieces: Vec<&str> = value.value.split(status::DELIMITER).collect();
            match pieces[0] {
                status::NORMAL => self.handle_state_normal(endpoint),
                status::LEAVING => self.handle_state_leaving(endpoint),
                status::LEFT => self.handle_state_left(endpoint, &pieces),
                status::REMOVING | status::REMOVED => {
                    self.handle_state_removing(endpoint, &pieces);
                }
                other => debug!(%endpoint, state = other, "ignoring unknown status"),
            }
        } else {
            let Some(state) = self.gossip.endpoint_state(endpoint) else {
                debug!(%endpoint, "ignoring state change for unknown endpoint");
                return;
            };
            if self.gossip.is_dead_state(&state) {
                debug!(%endpoint, "ignoring state change for dead endpoint");
                return;
            }
            if endpoint != self.local {
                self.update_peer_field(endpoint, state_key, &value.value);
            }
        }
    }

    fn on_alive(&self, endpoint: IpAddr, _state: &EndpointState) {
        if self.topology.is_member(endpoint) {
            self.each_lifecycle(|subscriber| subscriber.on_up(endpoint));
        }
    }

    fn on_dead(&self, endpoint: IpAddr, _state: &EndpointState) {
        self.service.convict(endpoint);
        self.each_lifecycle(|subscriber| subscriber.on_down(endpoint));
    }

    fn on_remove(&self, endpoint: IpAddr) {
        self.topology.remove_endpoint(endpoint);
    }

    fn on_restart(&self, endpoint: IpAddr, state: &EndpointState) {
        // A restart observed before the down event still needs the stale
        // connection reset.
        if state.alive {
            self.on_dead(endpoint, state);
        }
    }
}

fn extract_expire_time(pieces: &[&str]) -> u64 {
    pieces.get(2).and_then(|piece| piece.parse().ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AllowAllAuthenticator, DirectIpResolver};
    use crate::config::MessagingConfig;
    use parking_lot::Mutex;
    use std::net::Ipv4Addr;

    fn endpoint(octet: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, octet))
    }

    #[derive(Default)]
    struct RecordingGossip {
        host_ids: Mutex<HashMap<IpAddr, u32>>,
        states: Mutex<HashMap<IpAddr, EndpointState>>,
        removed: Mutex<Vec<IpAddr>>,
        newer: Mutex<Vec<IpAddr>>,
    }

    impl GossipSource for RecordingGossip {
        fn endpoint_state(&self, endpoint: IpAddr) -> Option<EndpointState> {
            self.states.lock().get(&endpoint).cloned()
        }

        fn is_dead_state(&self, _state: &EndpointState) -> bool {
            false
        }

        fn host_id(&self, endpoint: IpAddr) -> Option<u32> {
            self.host_ids.lock().get(&endpoint).copied()
        }

        fn compare_endpoint_startup(&self, a: IpAddr, _b: IpAddr) -> Ordering {
            if self.newer.lock().contains(&a) {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }

        fn remove_endpoint(&self, endpoint: IpAddr) {
            self.removed.lock().push(endpoint);
        }

        fn add_expire_time(&self, _endpoint: IpAddr, _expire_at_millis: u64) {}
    }

    #[derive(Default)]
    struct RecordingPeers {
        fields: Mutex<Vec<(IpAddr, String, String)>>,
    }

    impl PeerStore for RecordingPeers {
        fn update_peer_info(&self, endpoint: IpAddr, field: &str, value: &str) {
            self.fields
                .lock()
                .push((endpoint, field.to_string(), value.to_string()));
        }

        fn remove_endpoint(&self, _endpoint: IpAddr) {}
    }

    #[derive(Default)]
    struct RecordingLifecycle {
        joined: Mutex<Vec<IpAddr>>,
        left: Mutex<Vec<IpAddr>>,
        down: Mutex<Vec<IpAddr>>,
        up: Mutex<Vec<IpAddr>>,
    }

    impl EndpointLifecycleSubscriber for RecordingLifecycle {
        fn on_join_cluster(&self, endpoint: IpAddr) {
            self.joined.lock().push(endpoint);
        }

        fn on_leave_cluster(&self, endpoint: IpAddr) {
            self.left.lock().push(endpoint);
        }

        fn on_up(&self, endpoint: IpAddr) {
            self.up.lock().push(endpoint);
        }

        fn on_down(&self, endpoint: IpAddr) {
            self.down.lock().push(endpoint);
        }
    }

    fn versioned(value: &str) -> VersionedValue {
        VersionedValue {
            value: value.to_string(),
            version: 1,
        }
    }

    fn subscriber() -> (Arc<RecordingGossip>, Arc<RecordingPeers>, ClusterSubscriber) {
        let service = MessagingService::new(
            MessagingConfig::default(),
            Arc::new(AllowAllAuthenticator),
            Arc::new(DirectIpResolver),
        );
        let gossip = Arc::new(RecordingGossip::default());
        let peers = Arc::new(RecordingPeers::default());
        let subscriber = ClusterSubscriber::new(
            service,
            Arc::clone(&gossip) as Arc<dyn GossipSource>,
            Arc::clone(&peers) as Arc<dyn PeerStore>,
        );
        (gossip, peers, subscriber)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn normal_status_joins_the_ring() {
        let (gossip, _peers, subscriber) = subscriber();
        let lifecycle = Arc::new(RecordingLifecycle::default());
        subscriber.register(Arc::clone(&lifecycle) as Arc<dyn EndpointLifecycleSubscriber>);

        gossip.host_ids.lock().insert(endpoint(5), 42);
        subscriber.on_change(endpoint(5), ApplicationState::Status, &versioned(status::NORMAL));

        assert!(subscriber.topology().is_member(endpoint(5)));
        assert_eq!(subscriber.topology().get_host_id(endpoint(5)), Some(42));
        assert_eq!(*lifecycle.joined.lock(), vec![endpoint(5)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn host_id_collision_prefers_the_newer_node() {
        let (gossip, _peers, subscriber) = subscriber();

        gossip.host_ids.lock().insert(endpoint(1), 7);
        subscriber.on_change(endpoint(1), ApplicationState::Status, &versioned(status::NORMAL));

        // The second claimant started more recently and takes the id over.
        gossip.host_ids.lock().insert(endpoint(2), 7);
        gossip.newer.lock().push(endpoint(2));
        subscriber.on_change(endpoint(2), ApplicationState::Status, &versioned(status::NORMAL));

        assert_eq!(
            subscriber.topology().get_endpoint_for_host_id(7),
            Some(endpoint(2))
        );
        assert!(gossip.removed.lock().contains(&endpoint(1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn leaving_then_left_excises_the_endpoint() {
        let (gossip, _peers, subscriber) = subscriber();
        let lifecycle = Arc::new(RecordingLifecycle::default());
        subscriber.register(Arc::clone(&lifecycle) as Arc<dyn EndpointLifecycleSubscriber>);

        gossip.host_ids.lock().insert(endpoint(3), 11);
        subscriber.on_change(endpoint(3), ApplicationState::Status, &versioned(status::NORMAL));

        subscriber.on_change(endpoint(3), ApplicationState::Status, &versioned(status::LEAVING));
        assert_eq!(subscriber.topology().leaving_endpoints(), vec![endpoint(3)]);

        let left = format!("{},{},{}", status::LEFT, 11, 1_700_000_000_000u64);
        subscriber.on_change(endpoint(3), ApplicationState::Status, &versioned(&left));

        assert!(!subscriber.topology().is_member(endpoint(3)));
        assert_eq!(*lifecycle.left.lock(), vec![endpoint(3)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dead_endpoint_is_convicted_and_reported_down() {
        let (_gossip, _peers, subscriber) = subscriber();
        let lifecycle = Arc::new(RecordingLifecycle::default());
        subscriber.register(Arc::clone(&lifecycle) as Arc<dyn EndpointLifecycleSubscriber>);

        subscriber.on_dead(endpoint(9), &EndpointState::default());
        assert_eq!(*lifecycle.down.lock(), vec![endpoint(9)]);

        // Conviction reached the messaging layer: a connection entry exists
        // for the peer with an empty queue.
        let pending = subscriber.service.get_response_pending_tasks();
        assert_eq!(pending.get(&endpoint(9)), Some(&0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn metadata_changes_reach_the_peer_store() {
        let (gossip, peers, subscriber) = subscriber();
        gossip
            .states
            .lock()
            .insert(endpoint(4), EndpointState::default());

        subscriber.on_change(endpoint(4), ApplicationState::Dc, &versioned("dc1"));
        subscriber.on_change(endpoint(4), ApplicationState::Rack, &versioned("r7"));

        let fields = peers.fields.lock();
        assert!(fields.contains(&(endpoint(4), "data_center".to_string(), "dc1".to_string())));
        assert!(fields.contains(&(endpoint(4), "rack".to_string(), "r7".to_string())));
    }
}
