//! Error types for smartwire
//!
//! Provides a unified error type for encoding, decoding and calling.

use bytes::Bytes;
use thiserror::Error;

use crate::bencode::Value;

/// Result type alias using SmartError
pub type Result<T> = std::result::Result<T, SmartError>;

/// Unified error type for smart protocol operations
#[derive(Debug, Error)]
pub enum SmartError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport closed in the middle of a message.
    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    // -------------------------------------------------------------------------
    // Framing Errors
    // -------------------------------------------------------------------------
    /// The peer's version marker does not match the protocol we spoke.
    #[error("Unexpected protocol version marker: {0:?}")]
    UnexpectedProtocolVersionMarker(Bytes),

    /// Bad status byte, bad part tag, malformed structure or a part
    /// sequencing violation.
    #[error("Generic bzr smart protocol error: {0}")]
    Protocol(String),

    /// A message handler failed while the decoder was still well framed.
    #[error("Message handler error: {0}")]
    MessageHandler(Box<SmartError>),

    // -------------------------------------------------------------------------
    // Remote Errors
    // -------------------------------------------------------------------------
    /// The peer does not recognise the verb.
    #[error("The server does not recognise the request {0:?}")]
    UnknownMethod(Bytes),

    /// The verb ran on the peer and failed; carries the raw error args.
    #[error("Error received from smart server: {0:?}")]
    ErrorFromServer(Vec<Value>),

    // -------------------------------------------------------------------------
    // Medium Usage Errors
    // -------------------------------------------------------------------------
    #[error("The medium has reached its concurrent request limit")]
    TooManyConcurrentRequests,

    #[error("Writing to the request has already completed")]
    WritingCompleted,

    #[error("Writing to the request has not completed yet")]
    WritingNotComplete,

    #[error("Reading from the request has already completed")]
    ReadingCompleted,

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Bencode error: {0}")]
    Bencode(String),

    /// A caller-supplied body source failed while being streamed.
    #[error("Body stream failed: {0}")]
    BodyStream(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SmartError {
    /// True for a transport drop, whether raised by a medium or by the OS.
    pub fn is_connection_reset(&self) -> bool {
        match self {
            SmartError::ConnectionReset(_) => true,
            SmartError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Short name of the variant, used when an error has to cross the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            SmartError::Io(_) => "Io",
            SmartError::ConnectionReset(_) => "ConnectionReset",
            SmartError::UnexpectedProtocolVersionMarker(_) => "UnexpectedProtocolVersionMarker",
            SmartError::Protocol(_) => "SmartProtocolError",
            SmartError::MessageHandler(_) => "SmartMessageHandlerError",
            SmartError::UnknownMethod(_) => "UnknownSmartMethod",
            SmartError::ErrorFromServer(_) => "ErrorFromSmartServer",
            SmartError::TooManyConcurrentRequests => "TooManyConcurrentRequests",
            SmartError::WritingCompleted => "WritingCompleted",
            SmartError::WritingNotComplete => "WritingNotComplete",
            SmartError::ReadingCompleted => "ReadingCompleted",
            SmartError::Bencode(_) => "BencodeError",
            SmartError::BodyStream(_) => "BodyStreamError",
            SmartError::Config(_) => "ConfigError",
        }
    }

    /// Strip any `MessageHandler` wrapping.
    pub fn into_inner(self) -> SmartError {
        match self {
            SmartError::MessageHandler(inner) => (*inner).into_inner(),
            other => other,
        }
    }
}
