use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Internode encryption policy for peer connections.
///
/// TLS material loading is owned by the deployment layer; the messaging core
/// only decides whether the encrypted storage port is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InternodeEncryption {
    /// Plaintext everywhere; only the storage port is bound.
    #[default]
    None,
    /// Every peer connection uses the encrypted port.
    All,
    /// Encrypt traffic crossing datacenter boundaries.
    Dc,
    /// Encrypt traffic crossing rack boundaries.
    Rack,
}

impl InternodeEncryption {
    /// Whether the encrypted storage port must be bound at all.
    #[must_use]
    pub const fn binds_secure_port(self) -> bool {
        !matches!(self, Self::None)
    }

    /// Whether the plaintext storage port is still bound. Only `All` retires
    /// it completely.
    #[must_use]
    pub const fn binds_plain_port(self) -> bool {
        !matches!(self, Self::All)
    }
}

/// Tuning knobs for the messaging fabric, shared by the server bootstrap and
/// the cluster subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Interface the listener binds.
    pub listen_address: IpAddr,
    /// Address advertised to peers; defaults to the listen address.
    pub broadcast_address: Option<IpAddr>,
    /// Plaintext internode port. Every node in the cluster uses the same one.
    pub storage_port: u16,
    /// Encrypted internode port, bound only when encryption requires it.
    pub ssl_storage_port: u16,
    /// Internode encryption policy.
    pub internode_encryption: InternodeEncryption,
    /// Default TTL for request callbacks.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    /// Bound on a single outbound connect attempt.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Cadence of the dropped-message delta log.
    #[serde(with = "humantime_serde")]
    pub dropped_log_interval: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            broadcast_address: None,
            storage_port: 7_300,
            ssl_storage_port: 7_301,
            internode_encryption: InternodeEncryption::None,
            rpc_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            dropped_log_interval: Duration::from_secs(5),
        }
    }
}

impl MessagingConfig {
    /// Address peers should use to reach this node.
    #[must_use]
    pub fn broadcast_address(&self) -> IpAddr {
        self.broadcast_address.unwrap_or(self.listen_address)
    }
}

/// Admission check applied to inbound peer sockets before any bytes are read.
pub trait InternodeAuthenticator: Send + Sync {
    /// Returns `true` when the remote address may open an internode
    /// connection.
    fn authenticate(&self, addr: IpAddr, port: u16) -> bool;
}

/// Default authenticator: every peer is admitted.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllAuthenticator;

impl InternodeAuthenticator for AllowAllAuthenticator {
    fn authenticate(&self, _addr: IpAddr, _port: u16) -> bool {
        true
    }
}

/// Routing-layer rewrite of a logical endpoint to the physical address the
/// socket should dial. The outbound connection table stays keyed by the
/// logical endpoint so caller identity survives address migrations.
pub trait PreferredIpResolver: Send + Sync {
    /// Physical address to dial for `endpoint`.
    fn preferred_ip(&self, endpoint: IpAddr) -> IpAddr;
}

/// Identity resolver used when no address migration layer is installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectIpResolver;

impl PreferredIpResolver for DirectIpResolver {
    fn preferred_ip(&self, endpoint: IpAddr) -> IpAddr {
        endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_defaults_to_listen_address() {
        let config = MessagingConfig::default();
        assert_eq!(config.broadcast_address(), config.listen_address);

        let with_broadcast = MessagingConfig {
            broadcast_address: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))),
            ..MessagingConfig::default()
        };
        assert_eq!(
            with_broadcast.broadcast_address(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))
        );
    }

    #[test]
    fn only_none_skips_the_secure_port() {
        assert!(!InternodeEncryption::None.binds_secure_port());
        assert!(InternodeEncryption::All.binds_secure_port());
        assert!(InternodeEncryption::Dc.binds_secure_port());
        assert!(InternodeEncryption::Rack.binds_secure_port());
    }

    #[test]
    fn only_all_retires_the_plain_port() {
        assert!(InternodeEncryption::None.binds_plain_port());
        assert!(!InternodeEncryption::All.binds_plain_port());
        assert!(InternodeEncryption::Dc.binds_plain_port());
        assert!(InternodeEncryption::Rack.binds_plain_port());
    }
}
