//! The messaging hub: public send operations, verb handler registry, peer
//! version table, connection table, and lifecycle.
//!
//! The service is an explicit object constructed once by the server
//! bootstrap and passed by reference to collaborators; there is no global
//! instance. Handlers and background tasks hold `Weak` references so the
//! bootstrap's `Arc` is the only thing keeping the fabric alive.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, error, info, trace};

use crate::config::{InternodeAuthenticator, MessagingConfig, PreferredIpResolver};
use crate::error::{ConfigError, NetError};
use crate::net::callback::{AsyncCallback, CallbackInfo, ExpiringMap, TimeoutReporter};
use crate::net::handlers::{EchoVerbHandler, ResponseVerbHandler, VerbHandler};
use crate::net::listener::Listener;
use crate::net::message::{FAILURE_CALLBACK_PARAM, MessageIn, MessageOut, ONE_BYTE};
use crate::net::metrics::{DroppedMessages, LatencySubscriber};
use crate::net::outbound::OutboundConnection;
use crate::net::stage::{Stage, StageManager};
use crate::net::verb::Verb;
use crate::net::wire;

/// Asynchronous request/response fabric between cluster peers.
pub struct MessagingService {
    config: MessagingConfig,
    authenticator: Arc<dyn InternodeAuthenticator>,
    preferred: Arc<dyn PreferredIpResolver>,
    callbacks: ExpiringMap,
    handlers: RwLock<HashMap<Verb, Arc<dyn VerbHandler>>>,
    connections: DashMap<IpAddr, Arc<OutboundConnection>>,
    versions: DashMap<IpAddr, u32>,
    subscribers: RwLock<Vec<Arc<dyn LatencySubscriber>>>,
    dropped: Arc<DroppedMessages>,
    total_timeouts: AtomicU64,
    stages: StageManager,
    listeners: Mutex<Vec<Listener>>,
    listen_tx: watch::Sender<bool>,
    listen_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    id_gen: AtomicU32,
    shutting_down: AtomicBool,
    weak: Weak<Self>,
}

impl MessagingService {
    /// Builds the service and starts its background tasks (callback sweeper,
    /// stage workers, dropped-message logger). Must run inside a tokio
    /// runtime. Listening starts separately via [`listen`](Self::listen).
    #[must_use]
    pub fn new(
        config: MessagingConfig,
        authenticator: Arc<dyn InternodeAuthenticator>,
        preferred: Arc<dyn PreferredIpResolver>,
    ) -> Arc<Self> {
        let (listen_tx, listen_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dropped = Arc::new(DroppedMessages::new());
        tokio::spawn(
            Arc::clone(&dropped).run_drop_logger(config.dropped_log_interval, shutdown_rx),
        );

        let service = Arc::new_cyclic(|weak: &Weak<Self>| {
            let reporter: TimeoutReporter = {
                let weak = weak.clone();
                Box::new(move |id, info: &CallbackInfo, elapsed| {
                    if let Some(service) = weak.upgrade() {
                        service.report_timeout(id, info, elapsed);
                    }
                })
            };

            Self {
                callbacks: ExpiringMap::new(config.rpc_timeout, reporter),
                config,
                authenticator,
                preferred,
                handlers: RwLock::new(HashMap::new()),
                connections: DashMap::new(),
                versions: DashMap::new(),
                subscribers: RwLock::new(Vec::new()),
                dropped,
                total_timeouts: AtomicU64::new(0),
                stages: StageManager::start(),
                listeners: Mutex::new(Vec::new()),
                listen_tx,
                listen_rx,
                shutdown_tx,
                id_gen: AtomicU32::new(0),
                shutting_down: AtomicBool::new(false),
                weak: weak.clone(),
            }
        });

        service.register_default_verb_handlers();
        service
    }

    fn register_default_verb_handlers(&self) {
        let response = Arc::new(ResponseVerbHandler);
        for (verb, handler) in [
            (Verb::RequestResponse, response.clone() as Arc<dyn VerbHandler>),
            (Verb::InternalResponse, response as Arc<dyn VerbHandler>),
            (Verb::Echo, Arc::new(EchoVerbHandler) as Arc<dyn VerbHandler>),
        ] {
            // The handler map is empty at construction; this cannot collide.
            if let Err(err) = self.register_verb_handler(verb, handler) {
                error!(%err, "default verb handler registration failed");
            }
        }
    }

    /// Messaging configuration the service was built with.
    #[must_use]
    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    pub(crate) fn authenticator(&self) -> &dyn InternodeAuthenticator {
        self.authenticator.as_ref()
    }

    pub(crate) fn preferred_ip(&self, endpoint: IpAddr) -> IpAddr {
        self.preferred.preferred_ip(endpoint)
    }

    pub(crate) fn dropped_messages(&self) -> &DroppedMessages {
        &self.dropped
    }

    fn next_id(&self) -> u32 {
        self.id_gen.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    // ── Verb handlers ───────────────────────────────────────────────

    /// Installs a handler for `verb`.
    ///
    /// # Errors
    ///
    /// Duplicate registration is a configuration bug and fails with
    /// [`ConfigError::DuplicateVerbHandler`].
    pub fn register_verb_handler(
        &self,
        verb: Verb,
        handler: Arc<dyn VerbHandler>,
    ) -> Result<(), ConfigError> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&verb) {
            return Err(ConfigError::DuplicateVerbHandler(verb));
        }
        handlers.insert(verb, handler);
        Ok(())
    }

    /// Handler installed for `verb`, if any.
    #[must_use]
    pub fn get_verb_handler(&self, verb: Verb) -> Option<Arc<dyn VerbHandler>> {
        self.handlers.read().get(&verb).cloned()
    }

    // ── Sending ─────────────────────────────────────────────────────

    /// Fire-and-forget send. Returns after enqueue; transmission is the
    /// connection's responsibility.
    pub fn send_one_way(&self, message: MessageOut, to: IpAddr) {
        let id = self.next_id();
        self.send_one_way_with_id(message, id, to);
    }

    /// Fire-and-forget send reusing a caller-supplied id.
    pub fn send_one_way_with_id(&self, message: MessageOut, id: u32, to: IpAddr) {
        if self.shutting_down.load(Ordering::Acquire) {
            trace!(?to, id, "send during shutdown discarded");
            return;
        }
        if to == self.config.broadcast_address() {
            trace!(verb = ?message.verb, id, "message-to-self going over messaging service");
        } else {
            trace!(verb = ?message.verb, id, %to, "sending message");
        }
        self.get_connection(to).enqueue(message, id);
    }

    /// Sends a reply correlated to a previously received request id.
    pub fn send_reply(&self, message: MessageOut, id: u32, to: IpAddr) {
        self.send_one_way_with_id(message, id, to);
    }

    /// Request/response send. The reply (or expiry) reaches `callback`;
    /// returns the allocated message id.
    ///
    /// # Errors
    ///
    /// Fails once shutdown has begun.
    pub fn send_rr(
        &self,
        message: MessageOut,
        to: IpAddr,
        callback: Arc<dyn AsyncCallback>,
    ) -> Result<u32, NetError> {
        let timeout = message.timeout_or(self.config.rpc_timeout);
        self.send_rr_with_timeout(message, to, callback, timeout, false)
    }

    /// As [`send_rr`](Self::send_rr), additionally requesting that the peer
    /// report failures and that expiry invoke `on_failure`.
    ///
    /// # Errors
    ///
    /// Fails once shutdown has begun.
    pub fn send_rr_with_failure(
        &self,
        message: MessageOut,
        to: IpAddr,
        callback: Arc<dyn AsyncCallback>,
    ) -> Result<u32, NetError> {
        let timeout = message.timeout_or(self.config.rpc_timeout);
        self.send_rr_with_timeout(message, to, callback, timeout, true)
    }

    /// Request/response send with an explicit callback TTL.
    ///
    /// # Errors
    ///
    /// Fails once shutdown has begun.
    pub fn send_rr_with_timeout(
        &self,
        message: MessageOut,
        to: IpAddr,
        callback: Arc<dyn AsyncCallback>,
        timeout: Duration,
        failure_callback: bool,
    ) -> Result<u32, NetError> {
        let id = self.add_callback(&message, to, callback, timeout, failure_callback)?;
        let message = if failure_callback {
            message.with_parameter(FAILURE_CALLBACK_PARAM, &ONE_BYTE)
        } else {
            message
        };
        self.send_one_way_with_id(message, id, to);
        Ok(id)
    }

    fn add_callback(
        &self,
        message: &MessageOut,
        to: IpAddr,
        callback: Arc<dyn AsyncCallback>,
        timeout: Duration,
        failure_callback: bool,
    ) -> Result<u32, NetError> {
        let id = self.next_id();
        let previous = self.callbacks.put(
            id,
            CallbackInfo {
                target: to,
                callback,
                response_serializer: message.verb.response_serializer(),
                failure_callback,
            },
            timeout,
        )?;
        assert!(previous.is_none(), "callback already exists for id {id}");
        Ok(id)
    }

    // ── Callback registry passthroughs ──────────────────────────────

    /// Pending callback for `id`, without removal.
    #[must_use]
    pub fn registered_callback(&self, id: u32) -> Option<CallbackInfo> {
        self.callbacks.get(id)
    }

    /// Takes the pending callback for `id`.
    #[must_use]
    pub fn remove_registered_callback(&self, id: u32) -> Option<CallbackInfo> {
        self.callbacks.remove(id)
    }

    /// Time since the callback for `id` was registered.
    #[must_use]
    pub fn get_registered_callback_age(&self, id: u32) -> Option<Duration> {
        self.callbacks.get_age(id)
    }

    /// Number of callbacks currently pending.
    #[must_use]
    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    // ── Connections ─────────────────────────────────────────────────

    /// Outbound connection for `to`, created lazily. Racing callers converge
    /// on a single instance.
    pub fn get_connection(&self, to: IpAddr) -> Arc<OutboundConnection> {
        self.connections
            .entry(to)
            .or_insert_with(|| OutboundConnection::spawn(to, self.weak.clone()))
            .clone()
    }

    /// Closes and removes the connection for `to`.
    pub fn destroy_connection(&self, to: IpAddr) {
        if let Some((_, connection)) = self.connections.remove(&to) {
            connection.close();
        }
    }

    /// Failure-detector conviction: reset the peer's connection, discarding
    /// queued messages.
    pub fn convict(&self, endpoint: IpAddr) {
        debug!(%endpoint, "resetting pool for convicted endpoint");
        self.get_connection(endpoint).reset();
    }

    /// Retargets the connection keyed by `old` to dial `new`. The key (and
    /// caller identity) stays `old`.
    pub fn reconnect(&self, old: IpAddr, new: IpAddr) {
        self.get_connection(old).reset_to(new);
    }

    // ── Peer versions ───────────────────────────────────────────────

    /// Records `endpoint`'s protocol version.
    pub fn set_version(&self, endpoint: IpAddr, version: u32) {
        debug!(%endpoint, version, "setting protocol version");
        self.versions.insert(endpoint, version);
    }

    /// Forgets `endpoint`'s version; reads fall back to current.
    pub fn remove_version(&self, endpoint: IpAddr) {
        debug!(%endpoint, "removing protocol version");
        self.versions.remove(&endpoint);
    }

    /// Version to speak with `endpoint`: the recorded value clamped to
    /// [`wire::CURRENT_VERSION`], or current when unknown.
    #[must_use]
    pub fn get_version(&self, endpoint: IpAddr) -> u32 {
        self.versions.get(&endpoint).map_or_else(
            || {
                // Unknown peer: assume current, corrected by the handshake.
                trace!(%endpoint, "assuming current protocol version");
                wire::CURRENT_VERSION
            },
            |version| (*version).min(wire::CURRENT_VERSION),
        )
    }

    /// Whether a handshake or setter has recorded a version for `endpoint`.
    #[must_use]
    pub fn knows_version(&self, endpoint: IpAddr) -> bool {
        self.versions.contains_key(&endpoint)
    }

    // ── Latency subscribers ─────────────────────────────────────────

    /// Registers an observer for reply latencies.
    pub fn register_latency_subscriber(&self, subscriber: Arc<dyn LatencySubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    /// Feeds one latency sample to every subscriber.
    pub fn add_latency(&self, address: IpAddr, latency: Duration) {
        let snapshot: Vec<_> = self.subscribers.read().iter().cloned().collect();
        for subscriber in snapshot {
            subscriber.receive_timing(address, latency);
        }
    }

    /// Records latency only for callbacks that opted into snitch feedback.
    pub fn maybe_add_latency(
        &self,
        callback: &dyn AsyncCallback,
        address: IpAddr,
        latency: Duration,
    ) {
        if callback.is_latency_for_snitch() {
            self.add_latency(address, latency);
        }
    }

    // ── Inbound dispatch ────────────────────────────────────────────

    /// Schedules the verb's handler on its stage. Called by inbound
    /// connections once a frame is fully decoded.
    pub(crate) fn dispatch(&self, message: MessageIn, id: u32) {
        let verb = message.verb;
        let Some(handler) = self.get_verb_handler(verb) else {
            debug!(?verb, "no handler registered, dropping message");
            return;
        };
        let Some(service) = self.weak.upgrade() else {
            return;
        };
        self.stages.submit(
            verb.stage(),
            Box::new(move || {
                if let Err(err) = handler.do_verb(&service, message, id) {
                    error!(?verb, %err, "verb handler failed");
                }
            }),
        );
    }

    /// Timeout reporter installed on the callback registry.
    fn report_timeout(&self, id: u32, info: &CallbackInfo, elapsed: Duration) {
        trace!(id, target = %info.target, "callback expired");
        self.maybe_add_latency(info.callback.as_ref(), info.target, elapsed);
        self.total_timeouts.fetch_add(1, Ordering::Relaxed);
        self.get_connection(info.target).increment_timeout();
        if info.failure_callback {
            let callback = Arc::clone(&info.callback);
            let target = info.target;
            self.stages.submit(
                Stage::InternalResponse,
                Box::new(move || callback.on_failure(target)),
            );
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Binds the storage port on `addr` (and the encrypted port when the
    /// encryption mode requires one) and starts accepting peers.
    ///
    /// # Errors
    ///
    /// Bind failures surface as typed configuration errors.
    pub async fn listen(&self, addr: IpAddr) -> Result<(), ConfigError> {
        // Allow tests to stop and restart the service.
        self.callbacks.reset();

        let mut bind_points = Vec::with_capacity(2);
        if self.config.internode_encryption.binds_secure_port() {
            bind_points.push(SocketAddr::new(addr, self.config.ssl_storage_port));
        }
        if self.config.internode_encryption.binds_plain_port() {
            bind_points.push(SocketAddr::new(addr, self.config.storage_port));
        }

        for addr in bind_points {
            let listener = Listener::bind(addr, self.weak.clone()).await?;
            self.listeners.lock().push(listener);
        }

        let _ = self.listen_tx.send(true);
        Ok(())
    }

    /// Blocks until [`listen`](Self::listen) has bound its sockets.
    pub async fn wait_until_listening(&self) {
        let mut listening = self.listen_rx.clone();
        let _ = listening.wait_for(|ready| *ready).await;
    }

    /// Whether the listener is bound.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        *self.listen_rx.borrow()
    }

    /// Quiesces the fabric: waits for pending callbacks to drain or expire,
    /// then closes listeners and connections. No new sends are accepted.
    pub async fn shutdown(&self) {
        info!("waiting for messaging service to quiesce");
        self.shutting_down.store(true, Ordering::Release);

        self.callbacks.shutdown_blocking().await;

        for listener in self.listeners.lock().drain(..) {
            listener.close();
        }
        for entry in &self.connections {
            entry.value().close();
        }
        self.stages.shutdown();
        let _ = self.shutdown_tx.send(true);
    }

    // ── Management surface ──────────────────────────────────────────

    /// Per-peer send-queue depth.
    #[must_use]
    pub fn get_response_pending_tasks(&self) -> HashMap<IpAddr, usize> {
        self.connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().get_pending_messages()))
            .collect()
    }

    /// Per-peer lifetime transmitted-message counts.
    #[must_use]
    pub fn get_response_completed_tasks(&self) -> HashMap<IpAddr, u64> {
        self.connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().get_completed_messages()))
            .collect()
    }

    /// Per-verb lifetime dropped counts.
    #[must_use]
    pub fn get_dropped_messages(&self) -> Vec<(Verb, u64)> {
        self.dropped.snapshot()
    }

    /// Callbacks expired across all peers.
    #[must_use]
    pub fn get_total_timeouts(&self) -> u64 {
        self.total_timeouts.load(Ordering::Relaxed)
    }

    /// Per-peer expired-callback counts.
    #[must_use]
    pub fn get_timeouts_per_host(&self) -> HashMap<IpAddr, u64> {
        self.connections
            .iter()
            .map(|entry| (*entry.key(), entry.value().get_timeouts()))
            .collect()
    }

    /// Protocol versions recorded per endpoint.
    #[must_use]
    pub fn known_versions(&self) -> HashMap<IpAddr, u32> {
        self.versions
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }
}
