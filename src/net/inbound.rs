//! Inbound connection reader: frame decoding and stage handoff.
//!
//! One reader task per accepted socket. The stream must open with the
//! protocol magic or the socket is closed before anything else happens. For
//! the response verbs, the pending callback is looked up by id *before* the
//! payload bytes are consumed, so a missing callback skips the
//! length-prefixed body instead of failing the parse.

use std::net::SocketAddr;
use std::sync::Weak;
use std::time::Instant;

use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::{NetError, WireError};
use crate::net::message::{MessageIn, Payload};
use crate::net::service::MessagingService;
use crate::net::verb::Verb;
use crate::net::wire::{self, ConnectionHeader};

/// Upper bound on a single payload body. Oversized frames indicate a
/// corrupt or hostile peer and tear the connection down.
const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Upper bound on per-message parameters.
const MAX_PARAMETERS: u32 = 1_024;

/// Drives one inbound socket until EOF, error, or service shutdown.
pub(crate) async fn run_reader(
    service: Weak<MessagingService>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    match read_loop(service, stream, peer).await {
        Ok(()) => trace!(%peer, "inbound connection closed"),
        Err(err) => debug!(%peer, %err, "inbound connection terminated"),
    }
}

async fn read_loop(
    service: Weak<MessagingService>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), NetError> {
    let mut reader = BufReader::new(stream);

    let magic = reader.read_u32().await?;
    wire::validate_magic(magic)?;

    let header = ConnectionHeader::unpack(reader.read_u32().await?);
    {
        let service = service.upgrade().ok_or(NetError::ShuttingDown)?;
        service.set_version(peer.ip(), header.version);
    }
    let version = header.version.min(wire::CURRENT_VERSION);
    trace!(%peer, version = header.version, "inbound connection negotiated");

    loop {
        // EOF is only clean at a frame boundary.
        let id = match reader.read_u32().await {
            Ok(id) => id,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let sent_timestamp = reader.read_u32().await?;

        let ordinal = reader.read_u32().await?;
        let verb = Verb::from_ordinal(ordinal).ok_or(WireError::UnknownVerb(ordinal))?;

        let count = reader.read_u32().await?;
        if count > MAX_PARAMETERS {
            return Err(WireError::Malformed("parameter count out of range").into());
        }
        let mut parameters = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key_len = usize::from(reader.read_u16().await?);
            let mut key = vec![0u8; key_len];
            reader.read_exact(&mut key).await?;
            let key = String::from_utf8(key)
                .map_err(|_| WireError::Malformed("parameter key is not utf-8"))?;
            let value_len = reader.read_u32().await? as usize;
            if value_len > MAX_PAYLOAD_SIZE {
                return Err(WireError::Malformed("parameter value out of range").into());
            }
            let mut value = vec![0u8; value_len];
            reader.read_exact(&mut value).await?;
            parameters.push((key, value));
        }

        let payload_len = reader.read_u32().await? as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(WireError::Malformed("payload length out of range").into());
        }

        let service = service.upgrade().ok_or(NetError::ShuttingDown)?;

        let payload = if verb.is_response() {
            match service.registered_callback(id) {
                None => {
                    // Reply for an expired or unknown request; skip the body.
                    discard(&mut reader, payload_len).await?;
                    trace!(%peer, id, "reply without pending callback dropped");
                    continue;
                }
                Some(info) => {
                    let mut body = vec![0u8; payload_len];
                    reader.read_exact(&mut body).await?;
                    match info.response_serializer {
                        Some(codec) => codec.deserialize(&body, version)?,
                        None => Payload::Response(body),
                    }
                }
            }
        } else {
            match verb.serializer() {
                Some(codec) => {
                    let mut body = vec![0u8; payload_len];
                    reader.read_exact(&mut body).await?;
                    codec.deserialize(&body, version)?
                }
                None => {
                    // Reserved slots carry nothing deliverable.
                    discard(&mut reader, payload_len).await?;
                    trace!(%peer, ?verb, "message on reserved verb dropped");
                    continue;
                }
            }
        };

        let message = MessageIn {
            from: peer.ip(),
            verb,
            payload,
            parameters,
            version,
            sent_timestamp,
            arrival: Instant::now(),
        };
        service.dispatch(message, id);
    }
}

async fn discard(reader: &mut BufReader<TcpStream>, len: usize) -> Result<(), NetError> {
    let mut remaining = len;
    let mut scratch = [0u8; 4_096];
    while remaining > 0 {
        let chunk = remaining.min(scratch.len());
        reader.read_exact(&mut scratch[..chunk]).await?;
        remaining -= chunk;
    }
    Ok(())
}
