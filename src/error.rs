use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use crate::net::verb::Verb;

/// Configuration-time failures surfaced synchronously to the caller.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A verb handler was registered twice; duplicate registration is a
    /// programming error, not a runtime condition.
    #[error("verb handler already registered for {0:?}")]
    DuplicateVerbHandler(Verb),
    /// The storage port is already bound by another process.
    #[error("{addr} is in use by another process; change listen_address/storage_port to values that do not conflict")]
    AddressInUse {
        /// Address we attempted to bind.
        addr: SocketAddr,
    },
    /// The listen address does not belong to a local interface.
    #[error("unable to bind to {addr}; set listen_address to an interface this host can bind")]
    CannotAssignAddress {
        /// Address we attempted to bind.
        addr: SocketAddr,
    },
    /// Any other socket-level bind failure.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address we attempted to bind.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Frame-level failures raised while encoding or decoding the wire format.
#[derive(Debug, Error)]
pub enum WireError {
    /// The connection did not open with the protocol magic.
    #[error("invalid protocol header: {0:#010x}")]
    BadMagic(u32),
    /// Verb ordinal outside the known enumeration.
    #[error("unknown verb ordinal {0}")]
    UnknownVerb(u32),
    /// Structurally invalid frame content.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    /// Payload body failed to encode or decode.
    #[error("payload codec error for {codec}: {detail}")]
    Codec {
        /// Serializer that rejected the payload.
        codec: &'static str,
        /// Codec-reported reason.
        detail: String,
    },
    /// A payload was handed to a serializer for a different verb family.
    #[error("payload does not belong to serializer {0}")]
    PayloadMismatch(&'static str),
    /// Underlying socket I/O failure.
    #[error("connection i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runtime failures inside the messaging fabric.
#[derive(Debug, Error)]
pub enum NetError {
    /// The service has begun shutdown and accepts no new work.
    #[error("messaging service is shutting down")]
    ShuttingDown,
    /// Outbound connect did not complete within the configured bound.
    #[error("connect to {endpoint} timed out")]
    ConnectTimeout {
        /// Peer we attempted to reach.
        endpoint: IpAddr,
    },
    /// Frame encode/decode failure.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// Socket-level failure outside framing.
    #[error("network i/o error: {0}")]
    Io(#[from] std::io::Error),
}
