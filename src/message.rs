//! Message Layer
//!
//! Interfaces between the byte-level protocols and the code that issues or
//! serves requests, plus the conventional version three handlers.
//!
//! ## Conventional request sequence
//! ```text
//! args structure ──▶ [bytes part]* ──┬──────────────▶ end
//!                                    ├─ 'S' ────────▶ end
//!                                    └─ 'E' ─▶ error structure ─▶ end
//! ```
//!
//! ## Conventional response sequence
//! ```text
//! status byte ──▶ args structure ──▶ [bytes part]* ──▶ ['E' error structure] ──▶ end
//! ```

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::bencode::Value;
use crate::debug;
use crate::error::{Result, SmartError};
use crate::medium::MediumRequest;
use crate::protocol::v3_encoder::{STATUS_ERROR, STATUS_SUCCESS};
use crate::protocol::{
    ByteSink, Headers, ProtocolThreeDecoder, ProtocolThreeResponder, StatefulDecoder,
};
use crate::request::RequestHandler;

/// A caller-supplied request body produced lazily.
pub type BodyStream = Box<dyn Iterator<Item = Result<Bytes>> + Send>;

/// Chunks of a streamed response body.
pub type BodyChunks<'a> = Box<dyn Iterator<Item = Result<Bytes>> + 'a>;

// =============================================================================
// Interfaces
// =============================================================================

/// Receives the events of one decoded version three message.
///
/// Errors returned from the part callbacks are handed back to
/// `protocol_error`; decoding continues if that returns `Ok`.
pub trait MessageHandler {
    fn headers_received(&mut self, headers: Headers) -> Result<()>;

    fn byte_part_received(&mut self, byte: u8) -> Result<()>;

    fn bytes_part_received(&mut self, bytes: Bytes) -> Result<()>;

    fn structure_part_received(&mut self, structure: Value) -> Result<()>;

    fn end_received(&mut self) -> Result<()> {
        Ok(())
    }

    /// Re-raises by default.
    fn protocol_error(&mut self, error: SmartError) -> Result<()> {
        Err(error)
    }
}

/// Writes one client request in a particular protocol version.
pub trait Requester {
    fn set_headers(&mut self, headers: &Headers);

    /// `args[0]` is the verb.
    fn call(&mut self, args: &[Bytes]) -> Result<()>;

    fn call_with_body_bytes(&mut self, args: &[Bytes], body: &[u8]) -> Result<()>;

    fn call_with_body_readv_array(&mut self, args: &[Bytes], ranges: &[(u64, u64)]) -> Result<()>;

    fn call_with_body_stream(
        &mut self,
        args: &[Bytes],
        stream: &mut dyn Iterator<Item = Result<Bytes>>,
    ) -> Result<()>;

    /// True once a streamed body has begun to be consumed.
    fn body_stream_started(&self) -> bool;

    fn into_response_handler(self: Box<Self>) -> Box<dyn ResponseHandler>;
}

/// Reads the response to one client request.
pub trait ResponseHandler {
    /// Wait for the response args. Unless `expect_body`, also wait for the
    /// end of the response.
    fn read_response_tuple(&mut self, expect_body: bool) -> Result<Vec<Value>>;

    /// Up to `count` body bytes, or all remaining when `None`.
    fn read_body_bytes(&mut self, count: Option<usize>) -> Result<Bytes>;

    fn read_streamed_body(&mut self) -> BodyChunks<'_>;

    /// Discard the rest of the response.
    fn cancel_read_body(&mut self) -> Result<()>;
}

/// Map failed response args onto an error.
pub(crate) fn smart_server_error(args: Vec<Value>) -> SmartError {
    if args.len() >= 2 && args[0] == "UnknownMethod" {
        if let Some(verb) = args[1].as_bytes() {
            return SmartError::UnknownMethod(verb.clone());
        }
    }
    SmartError::ErrorFromServer(args)
}

fn structure_to_args(structure: Value) -> Result<Vec<Value>> {
    match structure {
        Value::List(items) => Ok(items),
        other => Err(SmartError::Protocol(format!(
            "Args structure is not a sequence: {:?}",
            other
        ))),
    }
}

// =============================================================================
// Conventional Request Handler (server)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expecting {
    Args,
    Body,
    PostBodyError,
    End,
    Nothing,
}

/// Sequences request parts into calls on a `RequestHandler` and sends its
/// response through a responder.
pub struct ConventionalRequestHandler<H: RequestHandler, S: ByteSink> {
    request_handler: H,
    responder: ProtocolThreeResponder<S>,
    expecting: Expecting,
}

impl<H: RequestHandler, S: ByteSink> ConventionalRequestHandler<H, S> {
    pub fn new(request_handler: H, responder: ProtocolThreeResponder<S>) -> Self {
        Self {
            request_handler,
            responder,
            expecting: Expecting::Args,
        }
    }

    pub fn expecting(&self) -> Expecting {
        self.expecting
    }

    pub fn request_handler(&self) -> &H {
        &self.request_handler
    }

    pub fn responder(&self) -> &ProtocolThreeResponder<S> {
        &self.responder
    }

    pub fn into_responder(self) -> ProtocolThreeResponder<S> {
        self.responder
    }

    fn send_handler_response(&mut self) -> Result<()> {
        match self.request_handler.take_response() {
            Some(response) => self.responder.send_response(response),
            None => Err(SmartError::Protocol(
                "request handler finished reading without a response".to_string(),
            )),
        }
    }

    fn args_received(&mut self, args: Vec<Value>) -> Result<()> {
        self.expecting = Expecting::Body;
        self.request_handler.args_received(args)?;
        if self.request_handler.finished_reading() {
            self.send_handler_response()?;
            self.expecting = Expecting::End;
        }
        Ok(())
    }
}

impl<H: RequestHandler, S: ByteSink> MessageHandler for ConventionalRequestHandler<H, S> {
    fn headers_received(&mut self, headers: Headers) -> Result<()> {
        self.request_handler.headers_received(&headers);
        Ok(())
    }

    fn byte_part_received(&mut self, byte: u8) -> Result<()> {
        if self.expecting != Expecting::Body {
            return Err(SmartError::Protocol(format!(
                "Unexpected message part: byte({:?})",
                char::from(byte)
            )));
        }
        match byte {
            STATUS_SUCCESS => self.expecting = Expecting::End,
            STATUS_ERROR => self.expecting = Expecting::PostBodyError,
            other => {
                return Err(SmartError::Protocol(format!(
                    "Non-success status byte in request body: {:?}",
                    char::from(other)
                )))
            }
        }
        Ok(())
    }

    fn bytes_part_received(&mut self, bytes: Bytes) -> Result<()> {
        if self.expecting != Expecting::Body {
            return Err(SmartError::Protocol(format!(
                "Unexpected message part: bytes({:?})",
                bytes
            )));
        }
        self.request_handler.accept_body(bytes)
    }

    fn structure_part_received(&mut self, structure: Value) -> Result<()> {
        match self.expecting {
            Expecting::Args => self.args_received(structure_to_args(structure)?),
            Expecting::PostBodyError => {
                self.expecting = Expecting::End;
                self.request_handler
                    .post_body_error_received(structure_to_args(structure)?)
            }
            _ => Err(SmartError::Protocol(format!(
                "Unexpected message part: structure({:?})",
                structure
            ))),
        }
    }

    fn end_received(&mut self) -> Result<()> {
        // A body without a trailing status byte ends straight from `Body`.
        if !matches!(self.expecting, Expecting::Body | Expecting::End) {
            return Err(SmartError::Protocol(format!(
                "End of message received prematurely (while expecting {:?})",
                self.expecting
            )));
        }
        self.expecting = Expecting::Nothing;
        self.request_handler.end_received()?;
        if !self.request_handler.finished_reading() {
            return Err(SmartError::Protocol(
                "Complete conventional request was received, but request handler has not finished reading."
                    .to_string(),
            ));
        }
        if !self.responder.response_sent() {
            self.send_handler_response()?;
        }
        Ok(())
    }

    /// Answer with an error unless a response has already gone out.
    fn protocol_error(&mut self, error: SmartError) -> Result<()> {
        if self.responder.response_sent() {
            tracing::debug!("Ignoring error after response was sent: {}", error);
            return Ok(());
        }
        self.responder.send_error(error)
    }
}

// =============================================================================
// Conventional Response Handler (client)
// =============================================================================

/// Collects the parts of a response message.
#[derive(Debug, Default)]
pub struct ResponseParts {
    headers: Option<Headers>,
    status: Option<u8>,
    args: Option<Vec<Value>>,
    body_started: bool,
    body_stream_status: Option<u8>,
    body_error_args: Option<Vec<Value>>,
    bytes_parts: VecDeque<Bytes>,
}

impl MessageHandler for ResponseParts {
    fn headers_received(&mut self, headers: Headers) -> Result<()> {
        self.headers = Some(headers);
        Ok(())
    }

    fn byte_part_received(&mut self, byte: u8) -> Result<()> {
        if byte != STATUS_SUCCESS && byte != STATUS_ERROR {
            return Err(SmartError::Protocol(format!(
                "Unknown response status: {:?}",
                char::from(byte)
            )));
        }
        // Once args have arrived, any further status belongs to the body.
        let slot = if self.body_started || self.args.is_some() {
            &mut self.body_stream_status
        } else {
            &mut self.status
        };
        if slot.is_some() {
            return Err(SmartError::Protocol(format!(
                "Unexpected byte part received: {:?}",
                char::from(byte)
            )));
        }
        *slot = Some(byte);
        Ok(())
    }

    fn bytes_part_received(&mut self, bytes: Bytes) -> Result<()> {
        self.body_started = true;
        self.bytes_parts.push_back(bytes);
        Ok(())
    }

    fn structure_part_received(&mut self, structure: Value) -> Result<()> {
        let args = structure_to_args(structure)?;
        if self.args.is_none() && !self.body_started {
            self.args = Some(args);
        } else if self.body_stream_status == Some(STATUS_ERROR) && self.body_error_args.is_none() {
            self.body_error_args = Some(args);
        } else {
            return Err(SmartError::Protocol(format!(
                "Unexpected structure received: {:?}",
                args
            )));
        }
        Ok(())
    }
}

/// Pulls a version three response off a medium request.
pub struct ProtocolThreeResponseHandler {
    decoder: ProtocolThreeDecoder<ResponseParts>,
    request: MediumRequest,
    finished_reading: bool,
    body: Option<Bytes>,
}

impl ProtocolThreeResponseHandler {
    pub fn new(request: MediumRequest) -> Self {
        Self {
            decoder: ProtocolThreeDecoder::new(ResponseParts::default(), true),
            request,
            finished_reading: false,
            body: None,
        }
    }

    pub fn headers(&self) -> Option<&Headers> {
        self.parts().headers.as_ref()
    }

    fn parts(&self) -> &ResponseParts {
        self.decoder.message_handler()
    }

    fn read_more(&mut self) -> Result<()> {
        let size = self.decoder.next_read_size();
        if size == 0 {
            self.finished_reading = true;
            return self.request.finished_reading();
        }
        let bytes = self.request.read_bytes(size)?;
        if bytes.is_empty() {
            return Err(SmartError::ConnectionReset(
                "Unexpected end of message. Please check connectivity and permissions, and report a bug if problems persist."
                    .to_string(),
            ));
        }
        if let Err(err) = self.decoder.accept_bytes(&bytes) {
            // Whatever the error, this request is over.
            if !self.finished_reading {
                self.finished_reading = true;
                if let Err(finish_err) = self.request.finished_reading() {
                    tracing::debug!("Ignoring {} while abandoning response", finish_err);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    fn wait_for_response_args(&mut self) -> Result<()> {
        while self.parts().args.is_none() && !self.finished_reading {
            self.read_more()?;
        }
        Ok(())
    }

    fn wait_for_response_end(&mut self) -> Result<()> {
        while !self.finished_reading {
            self.read_more()?;
        }
        Ok(())
    }

    fn body_stream_error(&self) -> Option<SmartError> {
        let parts = self.parts();
        if parts.body_stream_status == Some(STATUS_ERROR) {
            let args = parts.body_error_args.clone().unwrap_or_default();
            return Some(smart_server_error(args));
        }
        None
    }
}

impl ResponseHandler for ProtocolThreeResponseHandler {
    fn read_response_tuple(&mut self, expect_body: bool) -> Result<Vec<Value>> {
        self.wait_for_response_args()?;
        if !expect_body {
            self.wait_for_response_end()?;
        }
        let args = self.parts().args.clone().ok_or_else(|| {
            SmartError::Protocol("response ended without an args structure".to_string())
        })?;
        if debug::is_enabled(debug::HPSS) {
            tracing::debug!("hpss result: {:?}", args);
        }
        if self.parts().status == Some(STATUS_ERROR) {
            self.wait_for_response_end()?;
            return Err(smart_server_error(args));
        }
        Ok(args)
    }

    fn read_body_bytes(&mut self, count: Option<usize>) -> Result<Bytes> {
        if self.body.is_none() {
            self.wait_for_response_end()?;
            if let Some(err) = self.body_stream_error() {
                return Err(err);
            }
            let parts = &mut self.decoder.message_handler_mut().bytes_parts;
            let mut body = BytesMut::new();
            for part in parts.drain(..) {
                body.extend_from_slice(&part);
            }
            if debug::is_enabled(debug::HPSS) {
                tracing::debug!("hpss: {} body bytes read", body.len());
            }
            self.body = Some(body.freeze());
        }
        let body = self.body.get_or_insert_with(Bytes::new);
        Ok(match count {
            None => std::mem::take(body),
            Some(n) => body.split_to(n.min(body.len())),
        })
    }

    fn read_streamed_body(&mut self) -> BodyChunks<'_> {
        Box::new(StreamedBody {
            handler: self,
            done: false,
        })
    }

    fn cancel_read_body(&mut self) -> Result<()> {
        self.wait_for_response_end()
    }
}

struct StreamedBody<'a> {
    handler: &'a mut ProtocolThreeResponseHandler,
    done: bool,
}

impl Iterator for StreamedBody<'_> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let parts = &mut self.handler.decoder.message_handler_mut().bytes_parts;
            if let Some(part) = parts.pop_front() {
                return Some(Ok(part));
            }
            if self.handler.finished_reading {
                self.done = true;
                return self.handler.body_stream_error().map(Err);
            }
            if let Err(err) = self.handler.read_more() {
                self.done = true;
                return Some(Err(err));
            }
        }
    }
}
