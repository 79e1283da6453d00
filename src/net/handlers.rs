//! Verb handler contract and the handlers the fabric itself owns.
//!
//! Gossip and schema verbs are registered by their owning subsystems; the
//! fabric only ships the reply router and the echo responder.

use std::sync::Arc;

use tracing::trace;

use crate::error::NetError;
use crate::net::message::{ECHO_SERIALIZER, EchoMessage, MessageIn, MessageOut, Payload, PayloadCodec};
use crate::net::service::MessagingService;
use crate::net::verb::Verb;

/// Handler invoked on the verb's stage for every delivered message.
///
/// Handlers receive the service by reference so replies never require global
/// access. Errors are logged at the stage boundary and never cross it.
pub trait VerbHandler: Send + Sync {
    /// Processes one inbound message. `id` is the sender's correlation id,
    /// to be echoed back via [`MessagingService::send_reply`] when the verb
    /// warrants a reply.
    fn do_verb(
        &self,
        service: &Arc<MessagingService>,
        message: MessageIn,
        id: u32,
    ) -> Result<(), NetError>;
}

/// Routes `RequestResponse` / `InternalResponse` messages to the pending
/// callback, or drops them when the callback already expired.
pub struct ResponseVerbHandler;

impl VerbHandler for ResponseVerbHandler {
    fn do_verb(
        &self,
        service: &Arc<MessagingService>,
        message: MessageIn,
        id: u32,
    ) -> Result<(), NetError> {
        let age = service.get_registered_callback_age(id);
        let Some(info) = service.remove_registered_callback(id) else {
            trace!(id, "callback already removed, ignoring reply");
            return Ok(());
        };

        if message.is_failure_response() {
            trace!(id, from = %message.from, "received failure response");
            info.callback.on_failure(message.from);
        } else {
            if let Some(latency) = age {
                service.maybe_add_latency(info.callback.as_ref(), message.from, latency);
            }
            info.callback.response(message);
        }
        Ok(())
    }
}

/// Answers liveness probes with an empty body over `RequestResponse`.
pub struct EchoVerbHandler;

impl VerbHandler for EchoVerbHandler {
    fn do_verb(
        &self,
        service: &Arc<MessagingService>,
        message: MessageIn,
        id: u32,
    ) -> Result<(), NetError> {
        trace!(from = %message.from, "sending echo reply");
        let body = ECHO_SERIALIZER.serialize(&Payload::Echo(EchoMessage), message.version)?;
        service.send_reply(MessageOut::response(Verb::RequestResponse, body), id, message.from);
        Ok(())
    }
}
