//! Protocol Module
//!
//! Framing for the three generations of the smart protocol.
//!
//! ## Version One
//! ```text
//! verb\x01arg1\x01arg2\n            request tuple
//! 5\nhellodone\n                    optional length-prefixed body
//! ```
//!
//! ## Version Two
//! ```text
//! bzr request 2\n verb\x01arg\n     request
//! bzr response 2\n success\n ok\n   response (status line, then tuple)
//! chunked\n 5\nhello END\n          streamed body
//! ```
//!
//! ## Version Three
//! ```text
//! ┌────────────────────────────┬──────────────┬───────────────────┬─────┐
//! │ bzr message 3 (bzr 1.6)\n  │ len(4) hdrs  │ part part part .. │  e  │
//! └────────────────────────────┴──────────────┴───────────────────┴─────┘
//!   part := 'o' byte | 's' len(4) bencode | 'b' len(4) bytes
//! ```

pub mod body;
pub mod decoder;
pub mod legacy_client;
pub mod legacy_server;
pub mod server;
pub mod v3;
pub mod v3_encoder;

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;

use bytes::{Bytes, BytesMut};

use crate::bencode::Value;
use crate::error::{Result, SmartError};

pub use body::{ChunkedBodyDecoder, LengthPrefixedBodyDecoder, StreamChunk};
pub use decoder::{DecoderCore, Stall, StatefulDecoder, StepResult};
pub use legacy_client::LegacyClientProtocol;
pub use legacy_server::LegacyServerProtocol;
pub use server::{build_server_protocol, ServerProtocol};
pub use v3::ProtocolThreeDecoder;
pub use v3_encoder::{ProtocolThreeEncoder, ProtocolThreeRequester, ProtocolThreeResponder};

// =============================================================================
// Wire Constants
// =============================================================================

pub const REQUEST_VERSION_TWO: &[u8] = b"bzr request 2\n";
pub const RESPONSE_VERSION_TWO: &[u8] = b"bzr response 2\n";
pub const MESSAGE_VERSION_THREE: &[u8] = b"bzr message 3 (bzr 1.6)\n";

/// Separator between tuple elements in versions one and two.
pub const TUPLE_SEPARATOR: u8 = 0x01;

/// Message headers: a bencoded dict of byte keys.
pub type Headers = BTreeMap<Bytes, Value>;

/// Protocol generation spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    One,
    Two,
    Three,
}

impl ProtocolVersion {
    pub fn number(self) -> u8 {
        match self {
            ProtocolVersion::One => 1,
            ProtocolVersion::Two => 2,
            ProtocolVersion::Three => 3,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

// =============================================================================
// Tuple Lines
// =============================================================================

/// Join args with 0x01 and terminate with a newline.
pub fn encode_tuple<T: AsRef<[u8]>>(args: &[T]) -> Bytes {
    let mut line = BytesMut::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            line.extend_from_slice(&[TUPLE_SEPARATOR]);
        }
        line.extend_from_slice(arg.as_ref());
    }
    line.extend_from_slice(b"\n");
    line.freeze()
}

/// Split a newline-terminated tuple line. An empty line means "no tuple".
pub fn decode_tuple(line: &[u8]) -> Result<Option<Vec<Bytes>>> {
    if line.is_empty() {
        return Ok(None);
    }
    let body = match line.strip_suffix(b"\n") {
        Some(body) => body,
        None => {
            return Err(SmartError::Protocol(format!(
                "request {:?} not terminated",
                Bytes::copy_from_slice(line)
            )))
        }
    };
    Ok(Some(
        body.split(|b| *b == TUPLE_SEPARATOR)
            .map(Bytes::copy_from_slice)
            .collect(),
    ))
}

/// Tuple elements must be byte strings in versions one and two.
pub(crate) fn args_as_bytes(args: &[Value]) -> Result<Vec<Bytes>> {
    args.iter()
        .map(|arg| {
            arg.as_bytes().cloned().ok_or_else(|| {
                SmartError::Protocol(format!("tuple element {:?} is not a byte string", arg))
            })
        })
        .collect()
}

pub(crate) fn bytes_as_args(args: Vec<Bytes>) -> Vec<Value> {
    args.into_iter().map(Value::Bytes).collect()
}

// =============================================================================
// Byte Sinks
// =============================================================================

/// Destination for encoded protocol bytes.
pub trait ByteSink {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()>;

    /// Push anything buffered below this sink onto the transport.
    fn flush_sink(&mut self) -> Result<()> {
        Ok(())
    }
}

impl ByteSink for Vec<u8> {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

impl<S: ByteSink + ?Sized> ByteSink for &mut S {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).write_bytes(bytes)
    }

    fn flush_sink(&mut self) -> Result<()> {
        (**self).flush_sink()
    }
}

/// Adapts any `io::Write` into a sink.
pub struct StreamSink<W: Write>(pub W);

impl<W: Write> ByteSink for StreamSink<W> {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.0.write_all(bytes)?;
        Ok(())
    }

    fn flush_sink(&mut self) -> Result<()> {
        self.0.flush()?;
        Ok(())
    }
}
