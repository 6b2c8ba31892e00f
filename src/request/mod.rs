//! Server Request Layer
//!
//! Verbs, responses and the handler that drives a verb through the events
//! of one request.
//!
//! ## Request lifecycle
//! ```text
//! args_received ──▶ execute(args) ──┬─ Some(response) ──────────────▶ done
//!                                   └─ None ─▶ accept_body* ─▶ do_body ─▶ done
//! ```

mod verbs;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};

use crate::bencode::Value;
use crate::debug;
use crate::error::{Result, SmartError};
use crate::protocol::Headers;

pub use crate::protocol::body::StreamChunk;
pub use verbs::{classify, VerbClass};

/// Streamed response body items. An `Err` aborts the stream.
pub type ResponseBodyStream = Box<dyn Iterator<Item = Result<StreamChunk>> + Send>;

// =============================================================================
// Responses
// =============================================================================

pub enum ResponseBody {
    None,
    Bytes(Bytes),
    Stream(ResponseBodyStream),
}

/// The outcome of a verb.
pub struct SmartServerResponse {
    successful: bool,
    args: Vec<Value>,
    body: ResponseBody,
}

impl SmartServerResponse {
    pub fn success(args: Vec<Value>) -> Self {
        Self {
            successful: true,
            args,
            body: ResponseBody::None,
        }
    }

    pub fn failure(args: Vec<Value>) -> Self {
        Self {
            successful: false,
            args,
            body: ResponseBody::None,
        }
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = ResponseBody::Bytes(body);
        self
    }

    pub fn with_body_stream(mut self, stream: ResponseBodyStream) -> Self {
        self.body = ResponseBody::Stream(stream);
        self
    }

    pub fn is_successful(&self) -> bool {
        self.successful
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn into_parts(self) -> (bool, Vec<Value>, ResponseBody) {
        (self.successful, self.args, self.body)
    }
}

impl fmt::Debug for SmartServerResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            ResponseBody::None => "none".to_string(),
            ResponseBody::Bytes(b) => format!("{} bytes", b.len()),
            ResponseBody::Stream(_) => "stream".to_string(),
        };
        f.debug_struct("SmartServerResponse")
            .field("successful", &self.successful)
            .field("args", &self.args)
            .field("body", &body)
            .finish()
    }
}

/// Convert a verb failure into error args for the wire.
///
/// Errors that already carry wire args pass through unchanged; anything
/// else becomes `("error", kind, message)`.
pub fn translate_error(err: &SmartError) -> Vec<Value> {
    match err {
        SmartError::ErrorFromServer(args) => args.clone(),
        SmartError::UnknownMethod(verb) => {
            vec![Value::from("UnknownMethod"), Value::Bytes(verb.clone())]
        }
        other => vec![
            Value::from("error"),
            Value::from(other.kind()),
            Value::from(other.to_string()),
        ],
    }
}

// =============================================================================
// Verbs
// =============================================================================

/// One invocation of a verb.
///
/// `execute` returns `Some` when the verb needs no body. Otherwise each body
/// chunk goes to `do_chunk` and `do_end` runs once the body is complete. By
/// default chunks are handed back to be buffered and `do_end` passes the
/// whole body to `do_body`. A verb reports a domain error by returning
/// `SmartError::ErrorFromServer(args)`.
pub trait SmartServerRequest: Send {
    fn execute(&mut self, args: &[Value]) -> Result<Option<SmartServerResponse>>;

    /// Return the chunk to have it buffered for `do_body`.
    fn do_chunk(&mut self, chunk: Bytes) -> Result<Option<Bytes>> {
        Ok(Some(chunk))
    }

    fn do_end(&mut self, body: Bytes) -> Result<Option<SmartServerResponse>> {
        self.do_body(body)
    }

    fn do_body(&mut self, body: Bytes) -> Result<Option<SmartServerResponse>> {
        if body.is_empty() {
            Ok(None)
        } else {
            Err(SmartError::Protocol(
                "Request does not expect a body".to_string(),
            ))
        }
    }
}

type VerbFactory = Arc<dyn Fn() -> Box<dyn SmartServerRequest> + Send + Sync>;

/// Verb name to request factory.
#[derive(Clone, Default)]
pub struct VerbRegistry {
    verbs: HashMap<Bytes, VerbFactory>,
}

impl VerbRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `hello` verb.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(b"hello", || Box::new(HelloRequest));
        registry
    }

    pub fn register<F>(&mut self, verb: &[u8], factory: F)
    where
        F: Fn() -> Box<dyn SmartServerRequest> + Send + Sync + 'static,
    {
        self.verbs
            .insert(Bytes::copy_from_slice(verb), Arc::new(factory));
    }

    pub fn contains(&self, verb: &[u8]) -> bool {
        self.verbs.contains_key(verb)
    }

    pub fn get(&self, verb: &[u8]) -> Option<Box<dyn SmartServerRequest>> {
        self.verbs.get(verb).map(|factory| factory())
    }

    pub fn len(&self) -> usize {
        self.verbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verbs.is_empty()
    }
}

/// Answers `("ok", "2")`: the highest conventional version spoken here.
pub struct HelloRequest;

impl SmartServerRequest for HelloRequest {
    fn execute(&mut self, _args: &[Value]) -> Result<Option<SmartServerResponse>> {
        Ok(Some(SmartServerResponse::success(vec![
            Value::from("ok"),
            Value::from("2"),
        ])))
    }
}

// =============================================================================
// Request Handler
// =============================================================================

/// Server-side events of one request, in the order the protocols emit them.
pub trait RequestHandler {
    fn headers_received(&mut self, _headers: &Headers) {}

    fn args_received(&mut self, args: Vec<Value>) -> Result<()>;

    fn accept_body(&mut self, bytes: Bytes) -> Result<()>;

    /// Versions one and two: the length-prefixed body is complete.
    fn end_of_body(&mut self) -> Result<()>;

    /// Version three: the message is complete.
    fn end_received(&mut self) -> Result<()>;

    /// A streamed request body was aborted by the client.
    fn post_body_error_received(&mut self, error_args: Vec<Value>) -> Result<()>;

    fn finished_reading(&self) -> bool;

    fn take_response(&mut self) -> Option<SmartServerResponse>;
}

/// Dispatches requests to verbs from a registry.
pub struct SmartServerRequestHandler {
    registry: Arc<VerbRegistry>,
    command: Option<Box<dyn SmartServerRequest>>,
    verb: Bytes,
    body_chunks: BytesMut,
    response: Option<SmartServerResponse>,
    finished_reading: bool,
    started: Instant,
}

impl SmartServerRequestHandler {
    pub fn new(registry: Arc<VerbRegistry>) -> Self {
        Self {
            registry,
            command: None,
            verb: Bytes::new(),
            body_chunks: BytesMut::new(),
            response: None,
            finished_reading: false,
            started: Instant::now(),
        }
    }

    /// Run verb code, turning failures into a failed response.
    fn run<F>(&mut self, f: F)
    where
        F: FnOnce(&mut dyn SmartServerRequest) -> Result<Option<SmartServerResponse>>,
    {
        let Some(command) = self.command.as_mut() else {
            return;
        };
        match f(&mut **command) {
            Ok(None) => {}
            Ok(Some(response)) => self.respond(response),
            Err(err) => self.fail(err),
        }
    }

    fn fail(&mut self, err: SmartError) {
        tracing::debug!("Verb {:?} failed: {}", self.verb, err);
        self.respond(SmartServerResponse::failure(translate_error(&err)));
    }

    fn respond(&mut self, response: SmartServerResponse) {
        if debug::is_enabled(debug::HPSS) {
            tracing::debug!(
                "hpss: {:?} answered in {:.3}s",
                self.verb,
                self.started.elapsed().as_secs_f64()
            );
        }
        self.response = Some(response);
        self.finished_reading = true;
    }

    fn complete_body(&mut self) {
        let body = self.body_chunks.split().freeze();
        self.run(|command| command.do_end(body));
    }
}

impl RequestHandler for SmartServerRequestHandler {
    fn headers_received(&mut self, headers: &Headers) {
        if debug::is_enabled(debug::HPSS_DETAIL) {
            tracing::debug!("hpss: request headers {:?}", headers);
        }
    }

    fn args_received(&mut self, args: Vec<Value>) -> Result<()> {
        let verb = args
            .first()
            .and_then(|v| v.as_bytes())
            .cloned()
            .ok_or_else(|| SmartError::Protocol("request has no verb".to_string()))?;
        let command = self
            .registry
            .get(&verb)
            .ok_or_else(|| SmartError::UnknownMethod(verb.clone()))?;
        if debug::is_enabled(debug::HPSS) {
            tracing::debug!("hpss: request {:?}", args);
        }
        self.verb = verb;
        self.command = Some(command);
        self.run(|command| command.execute(&args[1..]));
        Ok(())
    }

    fn accept_body(&mut self, bytes: Bytes) -> Result<()> {
        if self.finished_reading || bytes.is_empty() {
            return Ok(());
        }
        let Some(command) = self.command.as_mut() else {
            return Ok(());
        };
        match command.do_chunk(bytes) {
            Ok(Some(unconsumed)) => self.body_chunks.extend_from_slice(&unconsumed),
            Ok(None) => {}
            Err(err) => self.fail(err),
        }
        Ok(())
    }

    fn end_of_body(&mut self) -> Result<()> {
        if !self.finished_reading {
            self.complete_body();
        }
        self.finished_reading = true;
        Ok(())
    }

    fn end_received(&mut self) -> Result<()> {
        if self.command.is_none() || self.finished_reading {
            return Ok(());
        }
        self.complete_body();
        Ok(())
    }

    /// The partial body is dropped and the client's error args become the
    /// failed response.
    fn post_body_error_received(&mut self, error_args: Vec<Value>) -> Result<()> {
        tracing::debug!("Request body for {:?} aborted: {:?}", self.verb, error_args);
        self.body_chunks.clear();
        if !self.finished_reading {
            self.response = Some(SmartServerResponse::failure(error_args));
            self.finished_reading = true;
        }
        Ok(())
    }

    fn finished_reading(&self) -> bool {
        self.finished_reading
    }

    fn take_response(&mut self) -> Option<SmartServerResponse> {
        self.response.take()
    }
}
