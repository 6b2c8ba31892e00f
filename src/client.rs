//! Smart Client
//!
//! Issues calls over a medium, choosing the protocol version on first use
//! and resending once after a dropped connection when that is safe.
//!
//! ## Call flow
//! ```text
//! call ──▶ hooks ──▶ version pinned? ──no──▶ try v3 ─marker─▶ disconnect ─▶ try v2
//!                         │ yes                 │                            │
//!                         ▼                     ▼                            ▼
//!                    send ─reset─▶ retry once   pin version            pin version
//!                         │
//!                    read ─reset─▶ resend once if the verb is safe to repeat
//! ```

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::bencode::Value;
use crate::config::{default_headers, Config};
use crate::debug;
use crate::error::{Result, SmartError};
use crate::medium::SmartClientMedium;
use crate::message::{Requester, ResponseHandler};
use crate::protocol::v3_encoder::DEFAULT_BUFFER_SIZE;
use crate::protocol::{Headers, LegacyClientProtocol, ProtocolThreeRequester, ProtocolVersion};
use crate::request::classify;

// =============================================================================
// Call Hooks
// =============================================================================

/// What a call hook sees of a call. Streamed bodies are never exposed.
pub struct CallHookParams<'a> {
    pub method: &'a [u8],
    pub args: &'a [Bytes],
    pub body: Option<&'a [u8]>,
    pub readv_body: Option<&'a [(u64, u64)]>,
    pub medium: &'a SmartClientMedium,
}

type CallHook = Arc<dyn Fn(&CallHookParams<'_>) + Send + Sync>;

static CALL_HOOKS: RwLock<Vec<CallHook>> = parking_lot::const_rwlock(Vec::new());

/// Register a hook run, in installation order, before every call is sent.
pub fn install_call_hook<F>(hook: F)
where
    F: Fn(&CallHookParams<'_>) + Send + Sync + 'static,
{
    CALL_HOOKS.write().push(Arc::new(hook));
}

pub fn clear_call_hooks() {
    CALL_HOOKS.write().clear();
}

// =============================================================================
// Client
// =============================================================================

/// A response tuple plus the handler for reading its body.
pub type CallResponse = (Vec<Value>, Box<dyn ResponseHandler>);

/// Client for one medium.
pub struct SmartClient {
    medium: SmartClientMedium,
    headers: Headers,
    buffer_size: usize,
}

impl SmartClient {
    pub fn new(medium: SmartClientMedium) -> Self {
        Self {
            medium,
            headers: default_headers(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_config(medium: SmartClientMedium, config: &Config) -> Self {
        Self {
            medium,
            headers: config.headers.clone(),
            buffer_size: config.encoder_buffer_size,
        }
    }

    /// Replace the headers sent with every version three request.
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn medium(&self) -> &SmartClientMedium {
        &self.medium
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    // -------------------------------------------------------------------------
    // Calls
    // -------------------------------------------------------------------------

    /// Call a verb and return its response tuple, discarding any body.
    pub fn call(&self, method: &[u8], args: &[&[u8]]) -> Result<Vec<Value>> {
        let (result, mut handler) = self.call_expecting_body(method, args)?;
        handler.cancel_read_body()?;
        Ok(result)
    }

    /// Call a verb and keep the handler for reading the response body.
    pub fn call_expecting_body(&self, method: &[u8], args: &[&[u8]]) -> Result<CallResponse> {
        PendingCall::new(self, method, args, RequestBody::None, true).call_and_read_response()
    }

    pub fn call_with_body_bytes(
        &self,
        method: &[u8],
        args: &[&[u8]],
        body: &[u8],
    ) -> Result<Vec<Value>> {
        let call = PendingCall::new(self, method, args, RequestBody::Bytes(body), false);
        let (result, _) = call.call_and_read_response()?;
        Ok(result)
    }

    pub fn call_with_body_bytes_expecting_body(
        &self,
        method: &[u8],
        args: &[&[u8]],
        body: &[u8],
    ) -> Result<CallResponse> {
        PendingCall::new(self, method, args, RequestBody::Bytes(body), true)
            .call_and_read_response()
    }

    /// Send `ranges` as `offset,length` lines for a scattered read.
    pub fn call_with_body_readv_array(
        &self,
        method: &[u8],
        args: &[&[u8]],
        ranges: &[(u64, u64)],
    ) -> Result<CallResponse> {
        PendingCall::new(self, method, args, RequestBody::Readv(ranges), true)
            .call_and_read_response()
    }

    /// Stream the request body. A stream that has started being consumed
    /// is never resent.
    pub fn call_with_body_stream<I>(
        &self,
        method: &[u8],
        args: &[&[u8]],
        stream: I,
    ) -> Result<CallResponse>
    where
        I: IntoIterator<Item = Result<Bytes>>,
        I::IntoIter: Send,
    {
        let mut stream = stream.into_iter();
        PendingCall::new(self, method, args, RequestBody::Stream(&mut stream), false)
            .call_and_read_response()
    }
}

// =============================================================================
// Pending Call
// =============================================================================

enum RequestBody<'a> {
    None,
    Bytes(&'a [u8]),
    Readv(&'a [(u64, u64)]),
    Stream(&'a mut (dyn Iterator<Item = Result<Bytes>> + Send)),
}

impl RequestBody<'_> {
    fn is_stream(&self) -> bool {
        matches!(self, RequestBody::Stream(_))
    }
}

/// One call, including any resends and version probing.
struct PendingCall<'a> {
    client: &'a SmartClient,
    method: &'a [u8],
    /// Verb followed by its args.
    args: Vec<Bytes>,
    body: RequestBody<'a>,
    expect_response_body: bool,
}

impl<'a> PendingCall<'a> {
    fn new(
        client: &'a SmartClient,
        method: &'a [u8],
        args: &[&[u8]],
        body: RequestBody<'a>,
        expect_response_body: bool,
    ) -> Self {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(Bytes::copy_from_slice(method));
        full.extend(args.iter().map(|arg| Bytes::copy_from_slice(arg)));
        Self {
            client,
            method,
            args: full,
            body,
            expect_response_body,
        }
    }

    fn medium(&self) -> &SmartClientMedium {
        &self.client.medium
    }

    fn call_and_read_response(mut self) -> Result<CallResponse> {
        self.run_call_hooks();
        if debug::is_enabled(debug::HPSS) {
            tracing::debug!(
                "hpss call: {:?} {:?}",
                String::from_utf8_lossy(self.method),
                &self.args[1..]
            );
        }
        let result = match self.medium().protocol_version() {
            Some(version) => self.call(version),
            None => self.call_determining_protocol_version(),
        };
        if result.is_err() && self.medium().has_current_request() {
            // The rest of the response is unread; the connection is unusable.
            self.medium().reset();
        }
        result
    }

    fn run_call_hooks(&self) {
        let hooks: Vec<CallHook> = CALL_HOOKS.read().clone();
        if hooks.is_empty() {
            return;
        }
        let params = CallHookParams {
            method: self.method,
            args: &self.args[1..],
            body: match self.body {
                RequestBody::Bytes(body) => Some(body),
                _ => None,
            },
            readv_body: match self.body {
                RequestBody::Readv(ranges) => Some(ranges),
                _ => None,
            },
            medium: self.medium(),
        };
        for hook in &hooks {
            hook(&params);
        }
    }

    fn is_safe_to_send_twice(&self) -> bool {
        if self.body.is_stream() || debug::is_enabled(debug::NO_RETRY) {
            return false;
        }
        match classify(self.method) {
            Some(class) => class.is_resendable(),
            None => {
                tracing::debug!(
                    "Unknown request type for method {:?}",
                    String::from_utf8_lossy(self.method)
                );
                false
            }
        }
    }

    /// Send and read the response tuple, resending once if the response
    /// was lost and the verb may safely run twice.
    fn call(&mut self, version: ProtocolVersion) -> Result<CallResponse> {
        let mut handler = self.send(version)?;
        match handler.read_response_tuple(self.expect_response_body) {
            Ok(result) => Ok((result, handler)),
            Err(err) if err.is_connection_reset() => {
                self.medium().reset();
                if !self.is_safe_to_send_twice() {
                    return Err(err);
                }
                tracing::warn!(
                    "ConnectionReset reading response for {:?}, retrying",
                    String::from_utf8_lossy(self.method)
                );
                tracing::debug!("Reset was: {}", err);
                let mut requester = self.construct_protocol(version)?;
                self.send_no_retry(requester.as_mut())?;
                let mut handler = requester.into_response_handler();
                let result = handler.read_response_tuple(self.expect_response_body)?;
                Ok((result, handler))
            }
            Err(err) => Err(err),
        }
    }

    fn call_determining_protocol_version(&mut self) -> Result<CallResponse> {
        let mut last_err = None;
        for version in [ProtocolVersion::Three, ProtocolVersion::Two] {
            if version == ProtocolVersion::Two {
                // A server without version three predates 1.6.
                self.medium().remember_remote_is_before((1, 6));
            }
            match self.call(version) {
                Ok(response) => {
                    self.medium().set_protocol_version(version);
                    return Ok(response);
                }
                Err(err @ SmartError::UnexpectedProtocolVersionMarker(_)) => {
                    tracing::warn!(
                        "Server does not understand Bazaar network protocol {}, reconnecting.  (Upgrade the server to avoid this.)",
                        version
                    );
                    self.medium().disconnect();
                    last_err = Some(err);
                }
                Err(err @ (SmartError::ErrorFromServer(_) | SmartError::UnknownMethod(_))) => {
                    // The server understood enough of this version to answer.
                    self.medium().set_protocol_version(version);
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
        let detail = last_err.map(|e| e.to_string()).unwrap_or_default();
        Err(SmartError::Protocol(format!(
            "Server is not a Bazaar server: {}",
            detail
        )))
    }

    fn construct_protocol(&self, version: ProtocolVersion) -> Result<Box<dyn Requester>> {
        let request = self.medium().get_request()?;
        Ok(match version {
            ProtocolVersion::Three => Box::new(ProtocolThreeRequester::with_buffer_size(
                request,
                self.client.buffer_size,
            )),
            legacy => Box::new(LegacyClientProtocol::new(legacy, request)),
        })
    }

    /// Send the request, retrying once if the connection drops before any
    /// of the response was read.
    fn send(&mut self, version: ProtocolVersion) -> Result<Box<dyn ResponseHandler>> {
        let mut requester = self.construct_protocol(version)?;
        match self.send_no_retry(requester.as_mut()) {
            Ok(()) => {}
            Err(err) if err.is_connection_reset() => {
                self.medium().reset();
                if debug::is_enabled(debug::NO_RETRY)
                    || (self.body.is_stream() && requester.body_stream_started())
                {
                    return Err(err);
                }
                tracing::warn!(
                    "ConnectionReset calling {:?}, retrying",
                    String::from_utf8_lossy(self.method)
                );
                tracing::debug!("Reset was: {}", err);
                requester = self.construct_protocol(version)?;
                self.send_no_retry(requester.as_mut())?;
            }
            Err(err) => return Err(err),
        }
        Ok(requester.into_response_handler())
    }

    fn send_no_retry(&mut self, requester: &mut dyn Requester) -> Result<()> {
        requester.set_headers(&self.client.headers);
        match &mut self.body {
            RequestBody::None => requester.call(&self.args),
            RequestBody::Bytes(body) => requester.call_with_body_bytes(&self.args, body),
            RequestBody::Readv(ranges) => requester.call_with_body_readv_array(&self.args, ranges),
            RequestBody::Stream(stream) => requester.call_with_body_stream(&self.args, &mut **stream),
        }
    }
}
