//! Per-peer outbound connection with lazy connect and reset-on-failure.
//!
//! One instance exists per remote endpoint, created on first send. A single
//! writer task owns the socket and drains the send queue, which guarantees
//! per-peer FIFO transmission and lets racing enqueues during connect simply
//! buffer behind the queue. Any connect or write failure discards the queue;
//! the next enqueue triggers a fresh connect.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};

use crate::error::NetError;
use crate::net::message::MessageOut;
use crate::net::service::MessagingService;
use crate::net::wire::{self, ConnectionHeader};

struct QueuedMessage {
    message: MessageOut,
    id: u32,
    enqueued_at: Instant,
}

/// Send side of one peer link. The table key (`endpoint`) never changes;
/// only the dialed address is rewritten by retargeting or the preferred-IP
/// hook.
pub struct OutboundConnection {
    endpoint: IpAddr,
    target: Mutex<IpAddr>,
    queue: Mutex<VecDeque<QueuedMessage>>,
    wake: tokio::sync::Notify,
    drop_socket: AtomicBool,
    // Bumped on every reset so an in-flight connect attempt against the old
    // target cannot discard messages enqueued after the reset.
    generation: AtomicU64,
    closed: AtomicBool,
    completed: AtomicU64,
    timeouts: AtomicU64,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl OutboundConnection {
    /// Creates the connection and starts its writer task.
    pub(crate) fn spawn(endpoint: IpAddr, service: Weak<MessagingService>) -> Arc<Self> {
        let connection = Arc::new(Self {
            endpoint,
            target: Mutex::new(endpoint),
            queue: Mutex::new(VecDeque::new()),
            wake: tokio::sync::Notify::new(),
            drop_socket: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            completed: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            writer: Mutex::new(None),
        });
        let handle = tokio::spawn(run_writer(Arc::clone(&connection), service));
        *connection.writer.lock() = Some(handle);
        connection
    }

    /// Logical endpoint this connection is keyed by.
    #[must_use]
    pub fn endpoint(&self) -> IpAddr {
        self.endpoint
    }

    /// Address currently dialed, before preferred-IP rewriting.
    #[must_use]
    pub fn target(&self) -> IpAddr {
        *self.target.lock()
    }

    /// Appends a message to the send queue and returns immediately. The
    /// connection takes responsibility for eventually writing or discarding.
    pub fn enqueue(&self, message: MessageOut, id: u32) {
        if self.closed.load(Ordering::Acquire) {
            trace!(endpoint = %self.endpoint, id, "enqueue after close discarded");
            return;
        }
        self.queue.lock().push_back(QueuedMessage {
            message,
            id,
            enqueued_at: Instant::now(),
        });
        self.wake.notify_one();
    }

    /// Drops the current socket and discards queued messages; the next
    /// enqueue reconnects.
    pub fn reset(&self) {
        self.queue.lock().clear();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.drop_socket.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// As [`reset`](Self::reset), additionally retargeting the socket to a
    /// new address. The table key stays the original endpoint.
    pub fn reset_to(&self, new_endpoint: IpAddr) {
        *self.target.lock() = new_endpoint;
        self.reset();
    }

    /// Terminal close. Queued messages are discarded and the writer stops.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.queue.lock().clear();
        self.wake.notify_one();
        if let Some(handle) = self.writer.lock().take() {
            handle.abort();
        }
    }

    /// Bumps the per-peer timeout counter; called by the timeout reporter.
    pub fn increment_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Callbacks expired against this peer.
    #[must_use]
    pub fn get_timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Messages written to the socket over the connection's lifetime.
    #[must_use]
    pub fn get_completed_messages(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Messages currently waiting in the send queue.
    #[must_use]
    pub fn get_pending_messages(&self) -> usize {
        self.queue.lock().len()
    }
}

async fn run_writer(connection: Arc<OutboundConnection>, service: Weak<MessagingService>) {
    let mut stream: Option<TcpStream> = None;
    let mut version = wire::CURRENT_VERSION;

    loop {
        if connection.closed.load(Ordering::Acquire) {
            break;
        }
        if connection.drop_socket.swap(false, Ordering::AcqRel) {
            stream = None;
        }

        let next = connection.queue.lock().pop_front();
        let Some(queued) = next else {
            connection.wake.notified().await;
            continue;
        };

        let Some(service) = service.upgrade() else {
            break;
        };

        // Droppable verbs aged past their timeout are discarded at dequeue.
        let timeout = queued.message.timeout_or(service.config().rpc_timeout);
        if queued.message.verb.is_droppable() && queued.enqueued_at.elapsed() >= timeout {
            service.dropped_messages().increment(queued.message.verb);
            continue;
        }

        if stream.is_none() {
            let generation = connection.generation.load(Ordering::Acquire);
            match establish(&connection, &service).await {
                Ok((connected, negotiated)) => {
                    if connection.generation.load(Ordering::Acquire) != generation {
                        // Reset raced the connect; the socket targets stale
                        // state and the next pass redials.
                        continue;
                    }
                    stream = Some(connected);
                    version = negotiated;
                }
                Err(err) => {
                    debug!(endpoint = %connection.endpoint, %err, "connect failed, discarding queue");
                    if connection.generation.load(Ordering::Acquire) == generation {
                        connection.queue.lock().clear();
                    }
                    continue;
                }
            }
        }
        let Some(socket) = stream.as_mut() else {
            continue;
        };

        let frame = match wire::encode_message(&queued.message, queued.id, version) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(endpoint = %connection.endpoint, id = queued.id, %err, "failed to encode message");
                continue;
            }
        };

        match socket.write_all(&frame).await {
            Ok(()) => {
                connection.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                debug!(endpoint = %connection.endpoint, %err, "write failed, resetting connection");
                stream = None;
                connection.queue.lock().clear();
            }
        }
    }
}

/// Dials the peer within the connect timeout and sends the connection
/// preamble. The payload version for the link is fixed here from the peer
/// version table.
async fn establish(
    connection: &OutboundConnection,
    service: &Arc<MessagingService>,
) -> Result<(TcpStream, u32), NetError> {
    let target = *connection.target.lock();
    let dial = SocketAddr::new(
        service.preferred_ip(target),
        service.config().storage_port,
    );

    let stream = time::timeout(service.config().connect_timeout, TcpStream::connect(dial))
        .await
        .map_err(|_| NetError::ConnectTimeout {
            endpoint: connection.endpoint,
        })??;
    stream.set_nodelay(true).map_err(NetError::Io)?;

    let version = service.get_version(connection.endpoint);
    let mut preamble = Vec::with_capacity(8);
    preamble.extend_from_slice(&wire::PROTOCOL_MAGIC.to_be_bytes());
    preamble.extend_from_slice(&ConnectionHeader::messaging(version).pack().to_be_bytes());

    let mut stream = stream;
    stream.write_all(&preamble).await.map_err(NetError::Io)?;

    trace!(endpoint = %connection.endpoint, %dial, version, "outbound connection established");
    Ok((stream, version))
}
