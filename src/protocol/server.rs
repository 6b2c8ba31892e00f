//! Server Protocol Selection
//!
//! A server reads the first line of a request and picks the protocol from
//! its marker:
//!
//! ```text
//! "bzr message 3 (bzr 1.6)\n" ──▶ version three decoder
//! "bzr request 2\n"           ──▶ version two
//! anything else               ──▶ version one (the line is the request)
//! ```

use bytes::Bytes;

use super::decoder::StatefulDecoder;
use super::legacy_server::LegacyServerProtocol;
use super::v3::ProtocolThreeDecoder;
use super::v3_encoder::ProtocolThreeResponder;
use super::{ByteSink, Headers, ProtocolVersion, MESSAGE_VERSION_THREE, REQUEST_VERSION_TWO};
use crate::error::Result;
use crate::message::ConventionalRequestHandler;
use crate::request::RequestHandler;

/// Pick the protocol version announced by the first line of a request.
pub fn detect_version(first_line: &[u8]) -> ProtocolVersion {
    if first_line.starts_with(MESSAGE_VERSION_THREE) {
        ProtocolVersion::Three
    } else if first_line.starts_with(REQUEST_VERSION_TWO) {
        ProtocolVersion::Two
    } else {
        ProtocolVersion::One
    }
}

/// The protocol serving one request on a connection.
pub enum ServerProtocol<S: ByteSink, H: RequestHandler> {
    Legacy(LegacyServerProtocol<S, H>),
    Three(ProtocolThreeDecoder<ConventionalRequestHandler<H, S>>),
}

impl<S: ByteSink, H: RequestHandler> ServerProtocol<S, H> {
    pub fn version(&self) -> ProtocolVersion {
        match self {
            ServerProtocol::Legacy(protocol) => protocol.version(),
            ServerProtocol::Three(_) => ProtocolVersion::Three,
        }
    }

    pub fn accept_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            ServerProtocol::Legacy(protocol) => protocol.accept_bytes(bytes),
            ServerProtocol::Three(decoder) => decoder.accept_bytes(bytes),
        }
    }

    /// Zero once the request is complete.
    pub fn next_read_size(&self) -> usize {
        match self {
            ServerProtocol::Legacy(protocol) => protocol.next_read_size(),
            ServerProtocol::Three(decoder) => decoder.next_read_size(),
        }
    }

    pub fn finished(&self) -> bool {
        self.next_read_size() == 0
    }

    /// True if the request could not be framed; the connection cannot be
    /// trusted after this.
    pub fn decoding_failed(&self) -> bool {
        match self {
            ServerProtocol::Legacy(_) => false,
            ServerProtocol::Three(decoder) => decoder.decoding_failed(),
        }
    }

    /// Bytes that belong to the next request on the connection.
    pub fn take_unused_data(&mut self) -> Bytes {
        match self {
            ServerProtocol::Legacy(protocol) => protocol.take_unused_data(),
            ServerProtocol::Three(decoder) => decoder.take_unused_data(),
        }
    }
}

/// Build the protocol for a request from its first line (and anything read
/// past it), feeding the bytes after the marker.
pub fn build_server_protocol<S, H>(
    first_line: &[u8],
    handler: H,
    sink: S,
    headers: Headers,
    buffer_size: usize,
) -> Result<ServerProtocol<S, H>>
where
    S: ByteSink,
    H: RequestHandler,
{
    let version = detect_version(first_line);
    tracing::debug!("Serving request with protocol version {}", version);
    let mut protocol = match version {
        ProtocolVersion::Three => {
            let responder = ProtocolThreeResponder::with_buffer_size(sink, headers, buffer_size);
            let handler = ConventionalRequestHandler::new(handler, responder);
            ServerProtocol::Three(ProtocolThreeDecoder::new(handler, false))
        }
        version => ServerProtocol::Legacy(LegacyServerProtocol::new(version, handler, sink)),
    };
    let rest = match version {
        ProtocolVersion::Three => &first_line[MESSAGE_VERSION_THREE.len()..],
        ProtocolVersion::Two => &first_line[REQUEST_VERSION_TWO.len()..],
        ProtocolVersion::One => first_line,
    };
    protocol.accept_bytes(rest)?;
    Ok(protocol)
}
