//! The closed verb enumeration and its static stage/codec associations.
//!
//! Wire form is the ordinal, so new verbs are appended only and the reserved
//! unused slots keep their positions; peers running older builds must never
//! see an ordinal reassigned.

use crate::net::message::{
    ECHO_SERIALIZER, GOSSIP_DIGEST_ACK_SERIALIZER, GOSSIP_DIGEST_ACK2_SERIALIZER,
    GOSSIP_DIGEST_SYN_SERIALIZER, GOSSIP_SHUTDOWN_SERIALIZER, PULL_SCHEMA_ACK_SERIALIZER,
    PULL_SCHEMA_SERIALIZER, PayloadCodec,
};
use crate::net::stage::Stage;

/// Message kind identifier. Indexes a stage and, for most verbs, a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Verb {
    /// Reply to a client-initiated request. Body decoded via the callback.
    RequestResponse = 0,
    /// Gossip round, first leg.
    GossipDigestSyn = 1,
    /// Gossip round, second leg.
    GossipDigestAck = 2,
    /// Gossip round, third leg.
    GossipDigestAck2 = 3,
    /// Peer announcing departure from gossip.
    GossipShutdown = 4,
    /// Reply to an internal call. Body decoded via the callback.
    InternalResponse = 5,
    /// Liveness probe; answered with a `RequestResponse`.
    Echo = 6,
    /// Schema pull request sent to a seed.
    PullSchema = 7,
    /// Schema statements answering a pull.
    PullSchemaAck = 8,
    /// Reserved slot; never reassign.
    Unused1 = 9,
    /// Reserved slot; never reassign.
    Unused2 = 10,
    /// Reserved slot; never reassign.
    Unused3 = 11,
}

impl Verb {
    /// Every verb, in ordinal order.
    pub const ALL: [Self; 12] = [
        Self::RequestResponse,
        Self::GossipDigestSyn,
        Self::GossipDigestAck,
        Self::GossipDigestAck2,
        Self::GossipShutdown,
        Self::InternalResponse,
        Self::Echo,
        Self::PullSchema,
        Self::PullSchemaAck,
        Self::Unused1,
        Self::Unused2,
        Self::Unused3,
    ];

    /// Wire ordinal of this verb.
    #[must_use]
    pub const fn ordinal(self) -> u32 {
        self as u32
    }

    /// Decodes a wire ordinal.
    #[must_use]
    pub const fn from_ordinal(ordinal: u32) -> Option<Self> {
        if (ordinal as usize) < Self::ALL.len() {
            Some(Self::ALL[ordinal as usize])
        } else {
            None
        }
    }

    /// Worker pool the verb's handler executes on.
    #[must_use]
    pub const fn stage(self) -> Stage {
        match self {
            Self::RequestResponse | Self::PullSchema | Self::PullSchemaAck => {
                Stage::RequestResponse
            }
            Self::InternalResponse | Self::Unused1 | Self::Unused2 | Self::Unused3 => {
                Stage::InternalResponse
            }
            Self::GossipDigestSyn
            | Self::GossipDigestAck
            | Self::GossipDigestAck2
            | Self::GossipShutdown
            | Self::Echo => Stage::Gossip,
        }
    }

    /// Static payload codec. `None` for the response verbs, whose decoder is
    /// recovered from the pending callback, and for the reserved slots.
    #[must_use]
    pub fn serializer(self) -> Option<&'static dyn PayloadCodec> {
        match self {
            Self::RequestResponse | Self::InternalResponse => None,
            Self::GossipDigestSyn => Some(&GOSSIP_DIGEST_SYN_SERIALIZER),
            Self::GossipDigestAck => Some(&GOSSIP_DIGEST_ACK_SERIALIZER),
            Self::GossipDigestAck2 => Some(&GOSSIP_DIGEST_ACK2_SERIALIZER),
            Self::GossipShutdown => Some(&GOSSIP_SHUTDOWN_SERIALIZER),
            Self::Echo => Some(&ECHO_SERIALIZER),
            Self::PullSchema => Some(&PULL_SCHEMA_SERIALIZER),
            Self::PullSchemaAck => Some(&PULL_SCHEMA_ACK_SERIALIZER),
            Self::Unused1 | Self::Unused2 | Self::Unused3 => None,
        }
    }

    /// Codec wired onto the callback when this verb originates a request, so
    /// the reply body can be decoded on arrival.
    #[must_use]
    pub fn response_serializer(self) -> Option<&'static dyn PayloadCodec> {
        match self {
            Self::Echo => Some(&ECHO_SERIALIZER),
            _ => None,
        }
    }

    /// Whether this verb carries a reply routed by id through the callback
    /// registry.
    #[must_use]
    pub const fn is_response(self) -> bool {
        matches!(self, Self::RequestResponse | Self::InternalResponse)
    }

    /// Verbs it is okay to drop once a message has sat in the send queue
    /// longer than its timeout. These correspond to client requests; internal
    /// messages are never dropped.
    #[must_use]
    pub const fn is_droppable(self) -> bool {
        matches!(self, Self::RequestResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinals_are_stable() {
        // Peers serialize by ordinal; this pinning test fails on any reorder.
        let expected: [(Verb, u32); 12] = [
            (Verb::RequestResponse, 0),
            (Verb::GossipDigestSyn, 1),
            (Verb::GossipDigestAck, 2),
            (Verb::GossipDigestAck2, 3),
            (Verb::GossipShutdown, 4),
            (Verb::InternalResponse, 5),
            (Verb::Echo, 6),
            (Verb::PullSchema, 7),
            (Verb::PullSchemaAck, 8),
            (Verb::Unused1, 9),
            (Verb::Unused2, 10),
            (Verb::Unused3, 11),
        ];
        for (verb, ordinal) in expected {
            assert_eq!(verb.ordinal(), ordinal);
            assert_eq!(Verb::from_ordinal(ordinal), Some(verb));
        }
        assert_eq!(Verb::from_ordinal(12), None);
    }

    #[test]
    fn only_request_response_is_droppable() {
        for verb in Verb::ALL {
            assert_eq!(verb.is_droppable(), verb == Verb::RequestResponse);
        }
    }

    #[test]
    fn response_verbs_have_no_static_serializer() {
        assert!(Verb::RequestResponse.serializer().is_none());
        assert!(Verb::InternalResponse.serializer().is_none());
        for verb in Verb::ALL {
            if !verb.is_response() && !matches!(verb, Verb::Unused1 | Verb::Unused2 | Verb::Unused3)
            {
                assert!(verb.serializer().is_some(), "{verb:?} needs a serializer");
            }
        }
    }

    #[test]
    fn gossip_never_shares_a_stage_with_requests() {
        assert_eq!(Verb::GossipDigestSyn.stage(), Stage::Gossip);
        assert_eq!(Verb::Echo.stage(), Stage::Gossip);
        assert_eq!(Verb::RequestResponse.stage(), Stage::RequestResponse);
        assert_eq!(Verb::InternalResponse.stage(), Stage::InternalResponse);
    }
}
