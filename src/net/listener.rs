//! Accept loop for inbound peer connections.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::error::ConfigError;
use crate::net::inbound;
use crate::net::service::MessagingService;

/// Bound acceptor socket plus the inbound connections it has spawned.
pub struct Listener {
    local_addr: SocketAddr,
    acceptor: JoinHandle<()>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Listener {
    /// Binds `addr` with `SO_REUSEADDR` and starts accepting.
    ///
    /// # Errors
    ///
    /// Bind failures are surfaced as typed configuration errors so the
    /// operator can tell an occupied port from a foreign address.
    pub(crate) async fn bind(
        addr: SocketAddr,
        service: Weak<MessagingService>,
    ) -> Result<Self, ConfigError> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        };
        let socket = socket.map_err(|source| ConfigError::Bind { addr, source })?;
        socket
            .set_reuseaddr(true)
            .map_err(|source| ConfigError::Bind { addr, source })?;
        socket.bind(addr).map_err(|source| match source.kind() {
            std::io::ErrorKind::AddrInUse => ConfigError::AddressInUse { addr },
            std::io::ErrorKind::AddrNotAvailable => ConfigError::CannotAssignAddress { addr },
            _ => ConfigError::Bind { addr, source },
        })?;
        let listener = socket
            .listen(512)
            .map_err(|source| ConfigError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ConfigError::Bind { addr, source })?;

        let connections = Arc::new(Mutex::new(Vec::new()));
        let acceptor = tokio::spawn(accept_loop(listener, service, Arc::clone(&connections)));

        info!(%local_addr, "messaging listener started");
        Ok(Self {
            local_addr,
            acceptor,
            connections,
        })
    }

    /// Address the acceptor is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and tears down every tracked inbound connection.
    pub fn close(&self) {
        trace!(local_addr = %self.local_addr, "closing accept task");
        self.acceptor.abort();
        for connection in self.connections.lock().drain(..) {
            connection.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    service: Weak<MessagingService>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let Some(live) = service.upgrade() else {
                    break;
                };
                // Admission control runs before any bytes are read.
                if !live.authenticator().authenticate(peer.ip(), peer.port()) {
                    trace!(%peer, "remote failed to authenticate");
                    continue;
                }
                drop(live);

                let handle = tokio::spawn(inbound::run_reader(service.clone(), stream, peer));
                let mut tracked = connections.lock();
                tracked.retain(|connection| !connection.is_finished());
                tracked.push(handle);
            }
            Err(err) => {
                debug!(%err, "error accepting inbound socket");
            }
        }
    }
}
