//! Version One and Two Client Protocol
//!
//! Writes a request tuple (plus an optional length-prefixed body) and reads
//! the reply. Version one has no status line, so a handful of well-known
//! first elements mark a failed response.

use std::time::Instant;

use bytes::Bytes;

use super::body::{encode_bulk_data, fill_decoder, serialise_offsets};
use super::decoder::StatefulDecoder;
use super::{
    bytes_as_args, decode_tuple, encode_tuple, ChunkedBodyDecoder, Headers,
    LengthPrefixedBodyDecoder, ProtocolVersion, StreamChunk, REQUEST_VERSION_TWO,
    RESPONSE_VERSION_TWO,
};
use crate::bencode::Value;
use crate::debug;
use crate::error::{Result, SmartError};
use crate::medium::MediumRequest;
use crate::message::{BodyChunks, Requester, ResponseHandler};

/// First elements that mark a version one response as failed.
const V1_ERROR_CODES: &[&[u8]] = &[
    b"norepository",
    b"NoSuchFile",
    b"FileExists",
    b"DirectoryNotEmpty",
    b"ShortReadvError",
    b"UnicodeEncodeError",
    b"UnicodeDecodeError",
    b"ReadOnlyError",
    b"nobranch",
    b"NoSuchRevision",
    b"nosuchrevision",
    b"LockContention",
    b"UnlockableTransport",
    b"LockFailed",
    b"TokenMismatch",
    b"ReadError",
    b"PermissionDenied",
];

/// Client side of protocol versions one and two.
pub struct LegacyClientProtocol {
    version: ProtocolVersion,
    request: MediumRequest,
    last_verb: Bytes,
    response_status: Option<bool>,
    body_buffer: Option<Bytes>,
    started: Option<Instant>,
}

impl LegacyClientProtocol {
    /// `version` must be `One` or `Two`.
    pub fn new(version: ProtocolVersion, request: MediumRequest) -> Self {
        Self {
            version,
            request,
            last_verb: Bytes::new(),
            response_status: None,
            body_buffer: None,
            started: None,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Version two only: whether the status line said `success`.
    pub fn response_status(&self) -> Option<bool> {
        self.response_status
    }

    /// Ask the server which protocol it speaks via `hello`.
    pub fn query_version(&mut self) -> Result<u8> {
        self.call(&[Bytes::from_static(b"hello")])?;
        let response = self.read_response_tuple(false)?;
        if response.len() == 2 && response[0] == "ok" {
            if response[1] == "1" {
                return Ok(1);
            }
            if response[1] == "2" {
                return Ok(2);
            }
        }
        Err(SmartError::Protocol(format!("bad response {:?}", response)))
    }

    fn write_args(&mut self, args: &[Bytes]) -> Result<()> {
        self.last_verb = args.first().cloned().unwrap_or_default();
        if debug::is_enabled(debug::HPSS) {
            tracing::debug!("hpss call: {:?}", args);
            self.started = Some(Instant::now());
        }
        if self.version == ProtocolVersion::Two {
            self.request.accept_bytes(REQUEST_VERSION_TWO)?;
        }
        self.request.accept_bytes(&encode_tuple(args))
    }

    fn read_tuple(&mut self) -> Result<Vec<Value>> {
        let line = self.request.read_line()?;
        let args = decode_tuple(&line)?.unwrap_or_default();
        let result = bytes_as_args(args);
        if debug::is_enabled(debug::HPSS) {
            match self.started.take() {
                Some(started) => tracing::debug!(
                    "   result:   {:6.3}s  {:?}",
                    started.elapsed().as_secs_f64(),
                    result
                ),
                None => tracing::debug!("   result:   {:?}", result),
            }
        }
        Ok(result)
    }

    /// A v1/v2 server answers an unknown verb with a generic "bad request".
    fn check_unknown_method(&mut self, result: &[Value]) -> Result<()> {
        if result.len() != 2 || result[0] != "error" {
            return Ok(());
        }
        let verb = String::from_utf8_lossy(&self.last_verb);
        let plain = format!("Generic bzr smart protocol error: bad request '{}'", verb);
        let unicode = format!("Generic bzr smart protocol error: bad request u'{}'", verb);
        if result[1] == plain.as_str() || result[1] == unicode.as_str() {
            self.request.finished_reading()?;
            return Err(SmartError::UnknownMethod(self.last_verb.clone()));
        }
        Ok(())
    }

    fn check_v1_error(&mut self, result: Vec<Value>) -> Result<Vec<Value>> {
        let failed = result
            .first()
            .and_then(|v| v.as_bytes())
            .map(|code| V1_ERROR_CODES.contains(&&code[..]))
            .unwrap_or(false);
        if failed {
            self.request.finished_reading()?;
            return Err(SmartError::ErrorFromServer(result));
        }
        Ok(result)
    }
}

impl Requester for LegacyClientProtocol {
    /// Versions one and two carry no headers.
    fn set_headers(&mut self, _headers: &Headers) {}

    fn call(&mut self, args: &[Bytes]) -> Result<()> {
        self.write_args(args)?;
        self.request.finished_writing()
    }

    fn call_with_body_bytes(&mut self, args: &[Bytes], body: &[u8]) -> Result<()> {
        self.write_args(args)?;
        self.request.accept_bytes(&encode_bulk_data(body))?;
        self.request.finished_writing()
    }

    fn call_with_body_readv_array(&mut self, args: &[Bytes], ranges: &[(u64, u64)]) -> Result<()> {
        self.write_args(args)?;
        let body = serialise_offsets(ranges);
        self.request.accept_bytes(&encode_bulk_data(&body))?;
        self.request.finished_writing()
    }

    /// Streamed request bodies need version three; the verb is reported as
    /// unknown without touching the wire.
    fn call_with_body_stream(
        &mut self,
        args: &[Bytes],
        _stream: &mut dyn Iterator<Item = Result<Bytes>>,
    ) -> Result<()> {
        self.request.finished_writing()?;
        self.request.finished_reading()?;
        Err(SmartError::UnknownMethod(
            args.first().cloned().unwrap_or_default(),
        ))
    }

    fn body_stream_started(&self) -> bool {
        false
    }

    fn into_response_handler(self: Box<Self>) -> Box<dyn ResponseHandler> {
        self
    }
}

impl ResponseHandler for LegacyClientProtocol {
    fn read_response_tuple(&mut self, expect_body: bool) -> Result<Vec<Value>> {
        match self.version {
            ProtocolVersion::Two => {
                let marker = self.request.read_line()?;
                if &marker[..] != RESPONSE_VERSION_TWO {
                    self.request.finished_reading()?;
                    return Err(SmartError::UnexpectedProtocolVersionMarker(marker));
                }
                let status = self.request.read_line()?;
                let result = self.read_tuple()?;
                self.check_unknown_method(&result)?;
                match &status[..] {
                    b"success\n" => {
                        self.response_status = Some(true);
                        if !expect_body {
                            self.request.finished_reading()?;
                        }
                        Ok(result)
                    }
                    b"failed\n" => {
                        self.response_status = Some(false);
                        self.request.finished_reading()?;
                        Err(SmartError::ErrorFromServer(result))
                    }
                    _ => Err(SmartError::Protocol(format!(
                        "bad protocol status {:?}",
                        status
                    ))),
                }
            }
            _ => {
                let result = self.read_tuple()?;
                self.check_unknown_method(&result)?;
                let result = self.check_v1_error(result)?;
                if !expect_body {
                    self.request.finished_reading()?;
                }
                Ok(result)
            }
        }
    }

    /// The whole body is read at once so the trailer is checked before any
    /// of it is handed out.
    fn read_body_bytes(&mut self, count: Option<usize>) -> Result<Bytes> {
        if self.body_buffer.is_none() {
            let mut decoder = LengthPrefixedBodyDecoder::new();
            let request = &mut self.request;
            fill_decoder(
                &mut decoder,
                |size| request.read_bytes(size),
                "Connection lost while reading response body.",
            )?;
            self.request.finished_reading()?;
            let body = decoder.read_pending_data();
            if debug::is_enabled(debug::HPSS) {
                tracing::debug!("              {} body bytes read", body.len());
            }
            self.body_buffer = Some(body);
        }
        let body = self.body_buffer.get_or_insert_with(Bytes::new);
        Ok(match count {
            None => std::mem::take(body),
            Some(n) => body.split_to(n.min(body.len())),
        })
    }

    fn read_streamed_body(&mut self) -> BodyChunks<'_> {
        if self.version != ProtocolVersion::Two {
            return Box::new(std::iter::once(Err(SmartError::Protocol(
                "protocol version one has no streamed bodies".to_string(),
            ))));
        }
        Box::new(ChunkedBody {
            request: &mut self.request,
            decoder: ChunkedBodyDecoder::new(),
            done: false,
        })
    }

    fn cancel_read_body(&mut self) -> Result<()> {
        self.request.finished_reading()
    }
}

/// Lazily decodes a version two chunked body off the wire.
struct ChunkedBody<'a> {
    request: &'a mut MediumRequest,
    decoder: ChunkedBodyDecoder,
    done: bool,
}

impl ChunkedBody<'_> {
    fn fail(&mut self, err: SmartError) -> Option<Result<Bytes>> {
        self.done = true;
        Some(Err(err))
    }
}

impl Iterator for ChunkedBody<'_> {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.decoder.read_next_chunk() {
                Some(StreamChunk::Bytes(chunk)) => {
                    if debug::is_enabled(debug::HPSS) {
                        tracing::debug!("              {} byte chunk read", chunk.len());
                    }
                    return Some(Ok(chunk));
                }
                Some(StreamChunk::Failed(args)) => {
                    if let Err(err) = self.request.finished_reading() {
                        tracing::debug!("Ignoring {} after failed body stream", err);
                    }
                    return self.fail(SmartError::ErrorFromServer(args));
                }
                None => {}
            }
            if self.decoder.finished_reading() {
                self.done = true;
                return self.request.finished_reading().err().map(Err);
            }
            let bytes = match self.request.read_bytes(self.decoder.next_read_size()) {
                Ok(bytes) => bytes,
                Err(err) => return self.fail(err),
            };
            if bytes.is_empty() {
                return self.fail(SmartError::ConnectionReset(
                    "Connection lost while reading streamed body.".to_string(),
                ));
            }
            if let Err(err) = self.decoder.accept_bytes(&bytes) {
                return self.fail(err);
            }
        }
    }
}
