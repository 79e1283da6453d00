//! Message envelopes and the per-verb payload codec table.
//!
//! The fabric transports payloads without interpreting them: each verb family
//! is a thin serde shell whose content belongs to its owning subsystem
//! (gossip state machine, schema puller). The two response verbs have no
//! static codec; their bodies are raw bytes whose decoder is recovered from
//! the pending callback at the receiving side.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::net::verb::Verb;

/// Parameter key a sender attaches when it wants `on_failure` delivered for
/// an expired or failed request.
pub const FAILURE_CALLBACK_PARAM: &str = "CAL_BAC";

/// Parameter key marking a reply that is itself a failure notification.
pub const FAILURE_RESPONSE_PARAM: &str = "FAIL";

/// Canonical one-byte value for flag parameters.
pub const ONE_BYTE: [u8; 1] = [0];

/// Liveness probe body. Carries no state; the reply is the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EchoMessage;

/// Compact per-endpoint gossip summary exchanged during digest rounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipDigest {
    /// Endpoint the digest describes.
    pub endpoint: IpAddr,
    /// Generation the endpoint last restarted with.
    pub generation: u32,
    /// Highest state version observed for the endpoint.
    pub max_version: u32,
}

/// First leg of a gossip round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipDigestSyn {
    /// Cluster name guard against cross-cluster gossip.
    pub cluster_name: String,
    /// Digests for the endpoints the sender knows about.
    pub digests: Vec<GossipDigest>,
}

/// Second leg: digests the responder wants, states it already has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipDigestAck {
    /// Digests the responder still needs filled in.
    pub digests: Vec<GossipDigest>,
    /// Endpoint states the responder sends back, opaque to the fabric.
    pub endpoint_states: HashMap<IpAddr, Vec<u8>>,
}

/// Third leg: the states the original sender owed the responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipDigestAck2 {
    /// Endpoint states completing the round, opaque to the fabric.
    pub endpoint_states: HashMap<IpAddr, Vec<u8>>,
}

/// Announcement that the sender is leaving gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GossipShutdown;

/// Request for the full schema from a seed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PullSchema;

/// Schema statements answering a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullSchemaAck {
    /// DDL statements reconstructing the schema, in application order.
    pub statements: Vec<String>,
}

/// Closed set of payload families the fabric can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Liveness probe.
    Echo(EchoMessage),
    /// Gossip round, first leg.
    GossipDigestSyn(GossipDigestSyn),
    /// Gossip round, second leg.
    GossipDigestAck(GossipDigestAck),
    /// Gossip round, third leg.
    GossipDigestAck2(GossipDigestAck2),
    /// Gossip departure announcement.
    GossipShutdown(GossipShutdown),
    /// Schema pull request.
    PullSchema(PullSchema),
    /// Schema pull answer.
    PullSchemaAck(PullSchemaAck),
    /// Pre-encoded reply body; the decoder lives on the requester's callback.
    Response(Vec<u8>),
}

/// Encoder/decoder pair for one payload family at a given protocol version.
pub trait PayloadCodec: Send + Sync {
    /// Name used in codec error reports.
    fn name(&self) -> &'static str;
    /// Encodes `payload` for transmission at `version`.
    fn serialize(&self, payload: &Payload, version: u32) -> Result<Vec<u8>, WireError>;
    /// Decodes a received body at `version`.
    fn deserialize(&self, bytes: &[u8], version: u32) -> Result<Payload, WireError>;
}

/// Serde-backed codec binding one payload struct to its [`Payload`] variant.
pub(crate) struct SerdeCodec<T: 'static> {
    name: &'static str,
    wrap: fn(T) -> Payload,
    project: fn(&Payload) -> Option<&T>,
}

impl<T> SerdeCodec<T> {
    pub(crate) const fn new(
        name: &'static str,
        wrap: fn(T) -> Payload,
        project: fn(&Payload) -> Option<&T>,
    ) -> Self {
        Self {
            name,
            wrap,
            project,
        }
    }
}

impl<T> PayloadCodec for SerdeCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn serialize(&self, payload: &Payload, _version: u32) -> Result<Vec<u8>, WireError> {
        let value = (self.project)(payload).ok_or(WireError::PayloadMismatch(self.name))?;
        bincode::serialize(value).map_err(|err| WireError::Codec {
            codec: self.name,
            detail: err.to_string(),
        })
    }

    fn deserialize(&self, bytes: &[u8], _version: u32) -> Result<Payload, WireError> {
        bincode::deserialize(bytes)
            .map(self.wrap)
            .map_err(|err| WireError::Codec {
                codec: self.name,
                detail: err.to_string(),
            })
    }
}

pub(crate) static ECHO_SERIALIZER: SerdeCodec<EchoMessage> =
    SerdeCodec::new("EchoMessage", Payload::Echo, |payload| match payload {
        Payload::Echo(inner) => Some(inner),
        _ => None,
    });

pub(crate) static GOSSIP_DIGEST_SYN_SERIALIZER: SerdeCodec<GossipDigestSyn> = SerdeCodec::new(
    "GossipDigestSyn",
    Payload::GossipDigestSyn,
    |payload| match payload {
        Payload::GossipDigestSyn(inner) => Some(inner),
        _ => None,
    },
);

pub(crate) static GOSSIP_DIGEST_ACK_SERIALIZER: SerdeCodec<GossipDigestAck> = SerdeCodec::new(
    "GossipDigestAck",
    Payload::GossipDigestAck,
    |payload| match payload {
        Payload::GossipDigestAck(inner) => Some(inner),
        _ => None,
    },
);

pub(crate) static GOSSIP_DIGEST_ACK2_SERIALIZER: SerdeCodec<GossipDigestAck2> = SerdeCodec::new(
    "GossipDigestAck2",
    Payload::GossipDigestAck2,
    |payload| match payload {
        Payload::GossipDigestAck2(inner) => Some(inner),
        _ => None,
    },
);

pub(crate) static GOSSIP_SHUTDOWN_SERIALIZER: SerdeCodec<GossipShutdown> = SerdeCodec::new(
    "GossipShutdown",
    Payload::GossipShutdown,
    |payload| match payload {
        Payload::GossipShutdown(inner) => Some(inner),
        _ => None,
    },
);

pub(crate) static PULL_SCHEMA_SERIALIZER: SerdeCodec<PullSchema> =
    SerdeCodec::new("PullSchema", Payload::PullSchema, |payload| match payload {
        Payload::PullSchema(inner) => Some(inner),
        _ => None,
    });

pub(crate) static PULL_SCHEMA_ACK_SERIALIZER: SerdeCodec<PullSchemaAck> = SerdeCodec::new(
    "PullSchemaAck",
    Payload::PullSchemaAck,
    |payload| match payload {
        Payload::PullSchemaAck(inner) => Some(inner),
        _ => None,
    },
);

/// Outgoing message envelope: verb, payload, flag parameters, and an
/// optional per-message timeout overriding the configured RPC timeout.
#[derive(Debug, Clone)]
pub struct MessageOut {
    /// Message kind; selects the stage and codec on the receiving side.
    pub verb: Verb,
    /// Payload body handed to the verb's codec at write time.
    pub payload: Payload,
    /// Short string keys mapped to opaque bytes. Unknown keys are preserved
    /// and ignored.
    pub parameters: Vec<(String, Vec<u8>)>,
    /// Per-message expiry override.
    pub timeout: Option<Duration>,
}

impl MessageOut {
    /// Creates an envelope with no parameters and the default timeout.
    #[must_use]
    pub fn new(verb: Verb, payload: Payload) -> Self {
        Self {
            verb,
            payload,
            parameters: Vec::new(),
            timeout: None,
        }
    }

    /// Reply envelope carrying a body already encoded by the responder.
    #[must_use]
    pub fn response(verb: Verb, body: Vec<u8>) -> Self {
        Self::new(verb, Payload::Response(body))
    }

    /// Returns the envelope with `key` set to `value`.
    #[must_use]
    pub fn with_parameter(mut self, key: &str, value: &[u8]) -> Self {
        self.parameters.push((key.to_string(), value.to_vec()));
        self
    }

    /// Returns the envelope with a per-message timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Effective expiry for this message.
    #[must_use]
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }

    /// Encodes the payload body for transmission at `version`.
    pub fn encode_payload(&self, version: u32) -> Result<Vec<u8>, WireError> {
        match self.verb.serializer() {
            Some(codec) => codec.serialize(&self.payload, version),
            None => match &self.payload {
                Payload::Response(body) => Ok(body.clone()),
                _ => Err(WireError::PayloadMismatch("Response")),
            },
        }
    }
}

/// Incoming message envelope reconstructed by the inbound connection.
#[derive(Debug, Clone)]
pub struct MessageIn {
    /// Address of the sending peer.
    pub from: IpAddr,
    /// Message kind.
    pub verb: Verb,
    /// Decoded payload body.
    pub payload: Payload,
    /// Parameters exactly as received, unknown keys included.
    pub parameters: Vec<(String, Vec<u8>)>,
    /// Protocol version negotiated on the carrying connection.
    pub version: u32,
    /// Low word of the sender's wall clock, as stamped on the frame.
    pub sent_timestamp: u32,
    /// Local arrival time.
    pub arrival: Instant,
}

impl MessageIn {
    /// Looks up a parameter value by key.
    #[must_use]
    pub fn parameter(&self, key: &str) -> Option<&[u8]> {
        self.parameters
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_slice())
    }

    /// Whether this reply is a failure notification rather than a result.
    #[must_use]
    pub fn is_failure_response(&self) -> bool {
        self.parameter(FAILURE_RESPONSE_PARAM).is_some()
    }
}
