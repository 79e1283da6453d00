//! End-to-end scenarios exercising the messaging fabric over real sockets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time;

use internode::config::{AllowAllAuthenticator, DirectIpResolver, MessagingConfig};
use internode::net::wire::{self, ConnectionHeader};
use internode::net::{
    AsyncCallback, EchoMessage, GossipDigestSyn, MessageIn, MessageOut, MessagingService, Payload,
    Verb, VerbHandler,
};
use internode::NetError;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind probe");
    listener.local_addr().expect("probe addr").port()
}

fn service_at(port: u16, rpc_timeout: Duration) -> Arc<MessagingService> {
    let config = MessagingConfig {
        listen_address: LOCALHOST,
        storage_port: port,
        rpc_timeout,
        connect_timeout: Duration::from_millis(500),
        ..MessagingConfig::default()
    };
    MessagingService::new(
        config,
        Arc::new(AllowAllAuthenticator),
        Arc::new(DirectIpResolver),
    )
}

struct ReplyProbe {
    reply: Mutex<Option<oneshot::Sender<MessageIn>>>,
}

impl ReplyProbe {
    fn new() -> (Arc<Self>, oneshot::Receiver<MessageIn>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                reply: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }
}

impl AsyncCallback for ReplyProbe {
    fn response(&self, message: MessageIn) {
        if let Some(tx) = self.reply.lock().take() {
            let _ = tx.send(message);
        }
    }
}

struct FailureProbe {
    failed: Mutex<Option<oneshot::Sender<IpAddr>>>,
}

impl FailureProbe {
    fn new() -> (Arc<Self>, oneshot::Receiver<IpAddr>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                failed: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }
}

impl AsyncCallback for FailureProbe {
    fn response(&self, _message: MessageIn) {}

    fn on_failure(&self, target: IpAddr) {
        if let Some(tx) = self.failed.lock().take() {
            let _ = tx.send(target);
        }
    }
}

struct RecordingSynHandler {
    seen: Arc<Mutex<Vec<String>>>,
}

impl VerbHandler for RecordingSynHandler {
    fn do_verb(
        &self,
        _service: &Arc<MessagingService>,
        message: MessageIn,
        _id: u32,
    ) -> Result<(), NetError> {
        if let Payload::GossipDigestSyn(syn) = message.payload {
            self.seen.lock().push(syn.cluster_name);
        }
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echo_probe_round_trips_within_a_second() {
    let port = free_port().await;
    let service = service_at(port, Duration::from_secs(2));
    service.listen(LOCALHOST).await.expect("listen");
    service.wait_until_listening().await;
    assert!(service.is_listening());

    let (probe, reply) = ReplyProbe::new();
    let message = MessageOut::new(Verb::Echo, Payload::Echo(EchoMessage));
    service
        .send_rr(message, LOCALHOST, probe)
        .expect("send accepted");

    let reply = time::timeout(Duration::from_secs(1), reply)
        .await
        .expect("echo reply within one second")
        .expect("callback fired");

    assert_eq!(reply.verb, Verb::RequestResponse);
    assert_eq!(reply.payload, Payload::Echo(EchoMessage));
    assert_eq!(
        service.pending_callbacks(),
        0,
        "registry returns to its prior size"
    );

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_request_reports_failure_and_counts_the_timeout() {
    let port = free_port().await;
    let service = service_at(port, Duration::from_millis(100));
    // Nobody listens on the peer address: the connect is refused and the
    // callback can only leave the registry by expiry.
    let peer = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 77));

    let (probe, failed) = FailureProbe::new();
    let message = MessageOut::new(Verb::Echo, Payload::Echo(EchoMessage));
    service
        .send_rr_with_failure(message, peer, probe)
        .expect("send accepted");

    let target = time::timeout(Duration::from_millis(900), failed)
        .await
        .expect("failure delivered after the timeout")
        .expect("on_failure fired");

    assert_eq!(target, peer);
    assert_eq!(service.get_total_timeouts(), 1);
    assert_eq!(service.get_timeouts_per_host().get(&peer), Some(&1));
    assert_eq!(service.pending_callbacks(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_droppable_verbs_age_out_of_the_send_queue() {
    let port = free_port().await;
    // A raw acceptor keeps the kernel accepting without reading anything.
    let _sink = TcpListener::bind(SocketAddr::new(LOCALHOST, port))
        .await
        .expect("bind sink");
    let service = service_at(port, Duration::from_secs(2));

    // Zero timeout: stale by the time the writer dequeues it.
    let droppable = MessageOut::response(Verb::RequestResponse, vec![1, 2, 3])
        .with_timeout(Duration::ZERO);
    service.send_one_way(droppable, LOCALHOST);

    let sturdy =
        MessageOut::new(Verb::Echo, Payload::Echo(EchoMessage)).with_timeout(Duration::ZERO);
    service.send_one_way(sturdy, LOCALHOST);

    let connection = service.get_connection(LOCALHOST);
    for _ in 0..100 {
        if connection.get_completed_messages() == 1 {
            break;
        }
        time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(
        connection.get_completed_messages(),
        1,
        "the non-droppable message is transmitted despite its age"
    );
    let dropped = service.get_dropped_messages();
    assert_eq!(dropped, vec![(Verb::RequestResponse, 1)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn convict_discards_queued_messages_and_allows_fresh_sends() {
    let port = free_port().await;
    let service = service_at(port, Duration::from_secs(2));
    service.listen(LOCALHOST).await.expect("listen");
    service.wait_until_listening().await;

    // Unroutable test address: messages queue (or die on connect) but never
    // transmit.
    let dead = IpAddr::V4(Ipv4Addr::new(10, 255, 255, 1));
    service.send_one_way(
        MessageOut::new(Verb::Echo, Payload::Echo(EchoMessage)),
        dead,
    );
    service.send_one_way(
        MessageOut::new(Verb::Echo, Payload::Echo(EchoMessage)),
        dead,
    );

    service.convict(dead);
    assert_eq!(
        service.get_connection(dead).get_pending_messages(),
        0,
        "convict discards everything queued before it"
    );

    // Retarget the same logical endpoint at the live listener; a fresh send
    // must travel a newly opened socket and come back.
    service.reconnect(dead, LOCALHOST);
    let (probe, reply) = ReplyProbe::new();
    service
        .send_rr(
            MessageOut::new(Verb::Echo, Payload::Echo(EchoMessage)),
            dead,
            probe,
        )
        .expect("send accepted");

    let reply = time::timeout(Duration::from_secs(2), reply)
        .await
        .expect("echo over the fresh socket")
        .expect("callback fired");
    assert_eq!(reply.payload, Payload::Echo(EchoMessage));

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bad_magic_closes_the_connection_before_anything_runs() {
    let port = free_port().await;
    let service = service_at(port, Duration::from_secs(2));
    service.listen(LOCALHOST).await.expect("listen");
    service.wait_until_listening().await;

    let mut socket = TcpStream::connect(SocketAddr::new(LOCALHOST, port))
        .await
        .expect("connect");
    socket
        .write_all(&0xDEAD_BEEFu32.to_be_bytes())
        .await
        .expect("write bogus magic");

    let mut buf = [0u8; 1];
    let read = time::timeout(Duration::from_secs(1), socket.read(&mut buf))
        .await
        .expect("peer closes promptly")
        .expect("clean close");
    assert_eq!(read, 0, "server closed the socket");

    assert_eq!(service.pending_callbacks(), 0);
    assert!(
        service
            .get_dropped_messages()
            .iter()
            .all(|(_, count)| *count == 0),
        "no metric changes from the rejected stream"
    );

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn header_version_is_recorded_until_removed() {
    let port = free_port().await;
    let service = service_at(port, Duration::from_secs(2));
    service.listen(LOCALHOST).await.expect("listen");
    service.wait_until_listening().await;

    let mut socket = TcpStream::connect(SocketAddr::new(LOCALHOST, port))
        .await
        .expect("connect");
    let mut preamble = Vec::new();
    preamble.extend_from_slice(&wire::PROTOCOL_MAGIC.to_be_bytes());
    preamble.extend_from_slice(&ConnectionHeader::messaging(3).pack().to_be_bytes());
    socket.write_all(&preamble).await.expect("write preamble");

    for _ in 0..100 {
        if service.knows_version(LOCALHOST) {
            break;
        }
        time::sleep(Duration::from_millis(10)).await;
    }

    assert!(service.knows_version(LOCALHOST));
    // Recorded as sent, read back clamped to what this build speaks.
    assert_eq!(service.known_versions().get(&LOCALHOST), Some(&3));
    assert_eq!(service.get_version(LOCALHOST), wire::CURRENT_VERSION);

    service.remove_version(LOCALHOST);
    assert!(!service.knows_version(LOCALHOST));
    assert_eq!(service.get_version(LOCALHOST), wire::CURRENT_VERSION);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replies_with_unknown_ids_are_skipped_not_fatal() {
    let port = free_port().await;
    let service = service_at(port, Duration::from_secs(2));
    service.listen(LOCALHOST).await.expect("listen");
    service.wait_until_listening().await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    service
        .register_verb_handler(
            Verb::GossipDigestSyn,
            Arc::new(RecordingSynHandler {
                seen: Arc::clone(&seen),
            }),
        )
        .expect("register");

    let mut socket = TcpStream::connect(SocketAddr::new(LOCALHOST, port))
        .await
        .expect("connect");
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&wire::PROTOCOL_MAGIC.to_be_bytes());
    bytes.extend_from_slice(
        &ConnectionHeader::messaging(wire::CURRENT_VERSION)
            .pack()
            .to_be_bytes(),
    );

    // A reply nobody asked for: the reader must skip its body by length.
    let orphan = MessageOut::response(Verb::RequestResponse, vec![9, 9, 9, 9]);
    bytes.extend_from_slice(
        &wire::encode_message(&orphan, 123_456, wire::CURRENT_VERSION).expect("encode"),
    );

    // A normal message behind it proves the connection survived.
    let syn = MessageOut::new(
        Verb::GossipDigestSyn,
        Payload::GossipDigestSyn(GossipDigestSyn {
            cluster_name: "after-the-orphan".to_string(),
            digests: Vec::new(),
        }),
    );
    bytes.extend_from_slice(
        &wire::encode_message(&syn, 7, wire::CURRENT_VERSION).expect("encode"),
    );

    socket.write_all(&bytes).await.expect("write frames");

    for _ in 0..100 {
        if !seen.lock().is_empty() {
            break;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*seen.lock(), vec!["after-the-orphan".to_string()]);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn messages_to_one_peer_arrive_in_enqueue_order() {
    let port = free_port().await;
    let service = service_at(port, Duration::from_secs(2));
    service.listen(LOCALHOST).await.expect("listen");
    service.wait_until_listening().await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    service
        .register_verb_handler(
            Verb::GossipDigestSyn,
            Arc::new(RecordingSynHandler {
                seen: Arc::clone(&seen),
            }),
        )
        .expect("register");

    let total = 24;
    for index in 0..total {
        let syn = MessageOut::new(
            Verb::GossipDigestSyn,
            Payload::GossipDigestSyn(GossipDigestSyn {
                cluster_name: format!("message-{index}"),
                digests: Vec::new(),
            }),
        );
        service.send_one_way(syn, LOCALHOST);
    }

    for _ in 0..200 {
        if seen.lock().len() == total {
            break;
        }
        time::sleep(Duration::from_millis(10)).await;
    }

    let seen = seen.lock();
    let expected: Vec<String> = (0..total).map(|index| format!("message-{index}")).collect();
    assert_eq!(*seen, expected, "per-peer FIFO transmission order");

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_quiesces_the_registry_and_rejects_new_work() {
    let port = free_port().await;
    let service = service_at(port, Duration::from_millis(100));
    let peer = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 88));

    let (probe, _failed) = FailureProbe::new();
    service
        .send_rr_with_failure(
            MessageOut::new(Verb::Echo, Payload::Echo(EchoMessage)),
            peer,
            probe,
        )
        .expect("send accepted");
    assert_eq!(service.pending_callbacks(), 1);

    time::timeout(Duration::from_secs(5), service.shutdown())
        .await
        .expect("shutdown drains within its bound");

    assert_eq!(service.pending_callbacks(), 0, "registry is empty");
    let (probe, _reply) = ReplyProbe::new();
    let result = service.send_rr(
        MessageOut::new(Verb::Echo, Payload::Echo(EchoMessage)),
        peer,
        probe,
    );
    assert!(matches!(result, Err(NetError::ShuttingDown)));
}
