//! Version Three Encoder
//!
//! Writes buffered version three messages. The requester builds client
//! requests onto a `MediumRequest`; the responder builds server responses
//! onto any `ByteSink`.

use bytes::{Bytes, BytesMut};

use super::body::StreamChunk;
use super::{bytes_as_args, ByteSink, Headers, MESSAGE_VERSION_THREE};
use crate::bencode::{self, Value};
use crate::debug;
use crate::error::{Result, SmartError};
use crate::medium::MediumRequest;
use crate::message::{ProtocolThreeResponseHandler, Requester, ResponseHandler};
use crate::request::{translate_error, ResponseBody, SmartServerResponse};

/// Flush threshold for buffered writes.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

pub const STATUS_SUCCESS: u8 = b'S';
pub const STATUS_ERROR: u8 = b'E';

// =============================================================================
// Encoder
// =============================================================================

/// Buffers message parts and hands them to the sink in batches.
pub struct ProtocolThreeEncoder<S: ByteSink> {
    sink: S,
    buf: BytesMut,
    buffer_size: usize,
}

impl<S: ByteSink> ProtocolThreeEncoder<S> {
    pub fn new(sink: S) -> Self {
        Self::with_buffer_size(sink, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(sink: S, buffer_size: usize) -> Self {
        Self {
            sink,
            buf: BytesMut::new(),
            buffer_size,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Bytes written but not yet handed to the sink.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    fn write_prefixed(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| SmartError::Protocol(format!("part of {} bytes is too large", bytes.len())))?;
        self.write(&len.to_be_bytes())?;
        self.write(bytes)
    }

    pub fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            let data = self.buf.split();
            self.sink.write_bytes(&data)?;
        }
        self.sink.flush_sink()
    }

    pub fn write_protocol_version(&mut self) -> Result<()> {
        self.write(MESSAGE_VERSION_THREE)
    }

    pub fn write_headers(&mut self, headers: &Headers) -> Result<()> {
        let encoded = Value::Dict(headers.clone()).to_bencode()?;
        self.write_prefixed(&encoded)
    }

    pub fn write_structure(&mut self, args: &[Value]) -> Result<()> {
        let encoded = bencode::encode_list(args)?;
        self.write(b"s")?;
        self.write_prefixed(&encoded)
    }

    pub fn write_prefixed_body(&mut self, bytes: &[u8]) -> Result<()> {
        self.write(b"b")?;
        self.write_prefixed(bytes)
    }

    pub fn write_success_status(&mut self) -> Result<()> {
        self.write(&[b'o', STATUS_SUCCESS])
    }

    pub fn write_error_status(&mut self) -> Result<()> {
        self.write(&[b'o', STATUS_ERROR])
    }

    /// Close the message and flush.
    pub fn write_end(&mut self) -> Result<()> {
        self.write(b"e")?;
        self.flush()
    }
}

// =============================================================================
// Responder
// =============================================================================

/// Server side: writes at most one response per request.
pub struct ProtocolThreeResponder<S: ByteSink> {
    encoder: ProtocolThreeEncoder<S>,
    headers: Headers,
    response_sent: bool,
}

impl<S: ByteSink> ProtocolThreeResponder<S> {
    pub fn new(sink: S, headers: Headers) -> Self {
        Self::with_buffer_size(sink, headers, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(sink: S, headers: Headers, buffer_size: usize) -> Self {
        Self {
            encoder: ProtocolThreeEncoder::with_buffer_size(sink, buffer_size),
            headers,
            response_sent: false,
        }
    }

    pub fn response_sent(&self) -> bool {
        self.response_sent
    }

    pub fn sink(&self) -> &S {
        self.encoder.sink()
    }

    pub fn into_sink(self) -> S {
        self.encoder.into_sink()
    }

    fn claim_response(&mut self) -> Result<()> {
        if self.response_sent {
            return Err(SmartError::Protocol(
                "a response has already been sent for this request".to_string(),
            ));
        }
        self.response_sent = true;
        Ok(())
    }

    /// Report a failure to the client. Unknown verbs become a failed
    /// `("UnknownMethod", verb)` response.
    pub fn send_error(&mut self, err: SmartError) -> Result<()> {
        if let SmartError::UnknownMethod(verb) = err {
            return self.send_response(SmartServerResponse::failure(vec![
                Value::from("UnknownMethod"),
                Value::Bytes(verb),
            ]));
        }
        if debug::is_enabled(debug::HPSS) {
            tracing::debug!("hpss: sending error {}", err);
        }
        self.claim_response()?;
        self.encoder.write_protocol_version()?;
        self.encoder.write_headers(&self.headers)?;
        self.encoder.write_error_status()?;
        self.encoder
            .write_structure(&[Value::from("error"), Value::from(err.to_string())])?;
        self.encoder.write_end()
    }

    pub fn send_response(&mut self, response: SmartServerResponse) -> Result<()> {
        self.claim_response()?;
        let (successful, args, body) = response.into_parts();
        if debug::is_enabled(debug::HPSS) {
            tracing::debug!("hpss: sending response {:?} (successful: {})", args, successful);
        }
        self.encoder.write_protocol_version()?;
        self.encoder.write_headers(&self.headers)?;
        if successful {
            self.encoder.write_success_status()?;
        } else {
            self.encoder.write_error_status()?;
        }
        self.encoder.write_structure(&args)?;
        match body {
            ResponseBody::None => {}
            ResponseBody::Bytes(bytes) => self.encoder.write_prefixed_body(&bytes)?,
            ResponseBody::Stream(stream) => {
                for item in stream {
                    match item {
                        Ok(StreamChunk::Bytes(chunk)) => {
                            self.encoder.write_prefixed_body(&chunk)?;
                            self.encoder.flush()?;
                        }
                        Ok(StreamChunk::Failed(error_args)) => {
                            self.encoder.write_error_status()?;
                            self.encoder.write_structure(&error_args)?;
                            break;
                        }
                        Err(err) => {
                            tracing::warn!("Response body stream failed: {}", err);
                            self.encoder.write_error_status()?;
                            self.encoder.write_structure(&translate_error(&err))?;
                            break;
                        }
                    }
                }
            }
        }
        self.encoder.write_end()
    }
}

// =============================================================================
// Requester
// =============================================================================

/// Client side: writes one request onto a medium request.
pub struct ProtocolThreeRequester {
    encoder: ProtocolThreeEncoder<MediumRequest>,
    headers: Headers,
    body_stream_started: bool,
}

impl ProtocolThreeRequester {
    pub fn new(request: MediumRequest) -> Self {
        Self::with_buffer_size(request, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(request: MediumRequest, buffer_size: usize) -> Self {
        Self {
            encoder: ProtocolThreeEncoder::with_buffer_size(request, buffer_size),
            headers: crate::config::default_headers(),
            body_stream_started: false,
        }
    }

    fn write_preamble(&mut self, args: &[Bytes]) -> Result<()> {
        if debug::is_enabled(debug::HPSS) {
            tracing::debug!("hpss call: {:?}", args);
        }
        self.encoder.write_protocol_version()?;
        self.encoder.write_headers(&self.headers)?;
        self.encoder.write_structure(&bytes_as_args(args.to_vec()))
    }

    fn finish(&mut self) -> Result<()> {
        self.encoder.write_end()?;
        self.encoder.sink_mut().finished_writing()
    }
}

impl Requester for ProtocolThreeRequester {
    fn set_headers(&mut self, headers: &Headers) {
        self.headers = headers.clone();
    }

    fn call(&mut self, args: &[Bytes]) -> Result<()> {
        self.write_preamble(args)?;
        self.finish()
    }

    fn call_with_body_bytes(&mut self, args: &[Bytes], body: &[u8]) -> Result<()> {
        self.write_preamble(args)?;
        if debug::is_enabled(debug::HPSS_DETAIL) {
            tracing::debug!("hpss: {} body bytes", body.len());
        }
        self.encoder.write_prefixed_body(body)?;
        self.finish()
    }

    fn call_with_body_readv_array(&mut self, args: &[Bytes], ranges: &[(u64, u64)]) -> Result<()> {
        self.write_preamble(args)?;
        let body = super::body::serialise_offsets(ranges);
        self.encoder.write_prefixed_body(&body)?;
        self.finish()
    }

    fn call_with_body_stream(
        &mut self,
        args: &[Bytes],
        stream: &mut dyn Iterator<Item = Result<Bytes>>,
    ) -> Result<()> {
        self.body_stream_started = false;
        self.write_preamble(args)?;
        // Surface a dead connection before the stream is consumed.
        self.encoder.flush()?;
        self.body_stream_started = true;
        for item in stream {
            match item {
                Ok(part) => {
                    self.encoder.write_prefixed_body(&part)?;
                    self.encoder.flush()?;
                }
                Err(err) => {
                    tracing::debug!("Body stream failed while sending {:?}: {}", args.first(), err);
                    self.encoder.write_error_status()?;
                    self.encoder.write_structure(&[Value::from("error")])?;
                    self.finish()?;
                    return Err(err);
                }
            }
        }
        self.finish()
    }

    fn body_stream_started(&self) -> bool {
        self.body_stream_started
    }

    fn into_response_handler(self: Box<Self>) -> Box<dyn ResponseHandler> {
        Box::new(ProtocolThreeResponseHandler::new(self.encoder.into_sink()))
    }
}
