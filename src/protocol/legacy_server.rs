//! Version One and Two Server Protocol
//!
//! One request per instance: a tuple line, an optional length-prefixed
//! body, then one response.

use bytes::{Bytes, BytesMut};

use super::body::{send_chunked_stream, LengthPrefixedBodyDecoder};
use super::decoder::StatefulDecoder;
use super::{
    args_as_bytes, bytes_as_args, decode_tuple, encode_tuple, ByteSink, ProtocolVersion,
    RESPONSE_VERSION_TWO,
};
use crate::bencode::Value;
use crate::error::{Result, SmartError};
use crate::request::{RequestHandler, ResponseBody, SmartServerResponse};

/// Serves one version one or two request.
pub struct LegacyServerProtocol<S: ByteSink, H: RequestHandler> {
    version: ProtocolVersion,
    sink: S,
    handler: H,
    in_buffer: BytesMut,
    unused_data: BytesMut,
    has_dispatched: bool,
    finished: bool,
    body_decoder: Option<LengthPrefixedBodyDecoder>,
}

impl<S: ByteSink, H: RequestHandler> LegacyServerProtocol<S, H> {
    pub fn new(version: ProtocolVersion, handler: H, sink: S) -> Self {
        Self {
            version,
            sink,
            handler,
            in_buffer: BytesMut::new(),
            unused_data: BytesMut::new(),
            has_dispatched: false,
            finished: false,
            body_decoder: None,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Bytes after the end of this request.
    pub fn unused_data(&self) -> &[u8] {
        &self.unused_data
    }

    pub fn take_unused_data(&mut self) -> Bytes {
        self.unused_data.split().freeze()
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn next_read_size(&self) -> usize {
        if self.finished {
            0
        } else {
            match &self.body_decoder {
                None => 1,
                Some(decoder) => decoder.next_read_size(),
            }
        }
    }

    pub fn accept_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.in_buffer.extend_from_slice(bytes);
        if !self.has_dispatched {
            let Some(pos) = self.in_buffer.iter().position(|b| *b == b'\n') else {
                return Ok(());
            };
            let line = self.in_buffer.split_to(pos + 1);
            self.has_dispatched = true;
            match self.dispatch_request_line(&line) {
                Ok(()) => {}
                Err(SmartError::UnknownMethod(verb)) => {
                    let message = format!(
                        "Generic bzr smart protocol error: bad request '{}'",
                        String::from_utf8_lossy(&verb)
                    );
                    return self.abort_request(message);
                }
                Err(err) => {
                    tracing::warn!("Request dispatch failed: {}", err);
                    return self.abort_request(err.to_string());
                }
            }
        }

        if self.finished {
            let rest = self.in_buffer.split();
            self.unused_data.extend_from_slice(&rest);
            return Ok(());
        }

        let decoder = self
            .body_decoder
            .get_or_insert_with(LengthPrefixedBodyDecoder::new);
        let input = self.in_buffer.split();
        decoder.accept_bytes(&input)?;
        let rest = decoder.take_unused_data();
        self.in_buffer.extend_from_slice(&rest);
        let body = decoder.read_pending_data();
        let body_done = decoder.finished_reading();
        self.handler.accept_body(body)?;
        if body_done {
            self.handler.end_of_body()?;
            if !self.handler.finished_reading() {
                return Err(SmartError::Protocol(
                    "no more body, request not finished".to_string(),
                ));
            }
        }
        if let Some(response) = self.handler.take_response() {
            let rest = self.in_buffer.split();
            self.unused_data.extend_from_slice(&rest);
            self.send_response(response)?;
        } else if self.handler.finished_reading() {
            return Err(SmartError::Protocol(
                "request handler finished without a response".to_string(),
            ));
        }
        Ok(())
    }

    fn dispatch_request_line(&mut self, line: &[u8]) -> Result<()> {
        let args = decode_tuple(line)?
            .ok_or_else(|| SmartError::Protocol("empty request".to_string()))?;
        self.handler.args_received(bytes_as_args(args))?;
        if self.handler.finished_reading() {
            let rest = self.in_buffer.split();
            self.unused_data.extend_from_slice(&rest);
            match self.handler.take_response() {
                Some(response) => self.send_response(response)?,
                None => {
                    return Err(SmartError::Protocol(
                        "request handler finished without a response".to_string(),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Reply `("error", message)` and treat the rest of the input as unused.
    fn abort_request(&mut self, message: String) -> Result<()> {
        let rest = self.in_buffer.split();
        self.unused_data.extend_from_slice(&rest);
        self.send_response(SmartServerResponse::failure(vec![
            Value::from("error"),
            Value::from(message),
        ]))
    }

    fn send_response(&mut self, response: SmartServerResponse) -> Result<()> {
        if self.finished {
            return Err(SmartError::Protocol(
                "a response has already been sent for this request".to_string(),
            ));
        }
        let (successful, args, body) = response.into_parts();
        if self.version == ProtocolVersion::One && matches!(body, ResponseBody::Stream(_)) {
            return Err(SmartError::Protocol(
                "protocol version one cannot send a streamed body".to_string(),
            ));
        }
        self.finished = true;
        let args = args_as_bytes(&args)?;
        if self.version == ProtocolVersion::Two {
            self.sink.write_bytes(RESPONSE_VERSION_TWO)?;
            let status: &[u8] = if successful { b"success\n" } else { b"failed\n" };
            self.sink.write_bytes(status)?;
        }
        match body {
            ResponseBody::None => {
                self.sink.write_bytes(&encode_tuple(&args))?;
            }
            ResponseBody::Bytes(bytes) => {
                self.sink.write_bytes(&encode_tuple(&args))?;
                self.sink.write_bytes(&super::body::encode_bulk_data(&bytes))?;
            }
            ResponseBody::Stream(stream) => {
                self.sink.write_bytes(&encode_tuple(&args))?;
                send_chunked_stream(&mut self.sink, stream)?;
            }
        }
        self.sink.flush_sink()
    }
}
