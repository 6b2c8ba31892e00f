//! Client Medium
//!
//! A medium owns one channel to a server and hands out one request at a
//! time.
//!
//! ```text
//! SmartClient ──▶ SmartClientMedium ──get_request()──▶ MediumRequest
//!                  │  push-back buffer                  writing ─▶ reading ─▶ done
//!                  │  pinned protocol version
//!                  └─ Box<dyn Channel>  (TCP / pipes / memory)
//! ```
//!
//! The medium is a cheap cloneable handle; clones share the channel.

mod channel;
mod memory;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{Result, SmartError};
use crate::protocol::{ByteSink, ProtocolVersion};

pub(crate) use channel::map_io_error;
pub use channel::{Channel, PipeChannel, TcpChannel};
pub use memory::MemoryChannel;

/// Remote version as `(major, minor)`.
pub type RemoteVersion = (u32, u32);

struct MediumInner {
    channel: Box<dyn Channel>,
    base: String,
    push_back: Option<Bytes>,
    protocol_version: Option<ProtocolVersion>,
    remote_is_before: Option<RemoteVersion>,
    current_request: Option<u64>,
    next_request_id: u64,
    max_read_size: usize,
}

/// Shared handle to a client connection.
#[derive(Clone)]
pub struct SmartClientMedium {
    inner: Arc<Mutex<MediumInner>>,
}

impl SmartClientMedium {
    pub fn new(channel: impl Channel + 'static, base: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MediumInner {
                channel: Box::new(channel),
                base: base.into(),
                push_back: None,
                protocol_version: None,
                remote_is_before: None,
                current_request: None,
                next_request_id: 0,
                max_read_size: Config::default().max_read_size,
            })),
        }
    }

    pub fn with_max_read_size(self, max_read_size: usize) -> Self {
        self.inner.lock().max_read_size = max_read_size.max(1);
        self
    }

    /// Base URL this medium was opened for.
    pub fn base(&self) -> String {
        self.inner.lock().base.clone()
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    /// Start a request. Only one may be outstanding at a time.
    pub fn get_request(&self) -> Result<MediumRequest> {
        let mut inner = self.inner.lock();
        if inner.current_request.is_some() {
            return Err(SmartError::TooManyConcurrentRequests);
        }
        let id = inner.next_request_id;
        inner.next_request_id += 1;
        inner.current_request = Some(id);
        Ok(MediumRequest {
            medium: self.clone(),
            id,
            state: RequestState::Writing,
        })
    }

    pub fn has_current_request(&self) -> bool {
        self.inner.lock().current_request.is_some()
    }

    fn request_finished(&self, id: u64) {
        let mut inner = self.inner.lock();
        if inner.current_request == Some(id) {
            inner.current_request = None;
        }
    }

    // -------------------------------------------------------------------------
    // Byte I/O
    // -------------------------------------------------------------------------

    pub fn accept_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.inner.lock().channel.send(bytes)
    }

    pub fn flush(&self) -> Result<()> {
        self.inner.lock().channel.flush()
    }

    /// Read up to `count` bytes, serving pushed-back bytes first. May return
    /// more than `count` when a push-back is pending; empty means end of
    /// stream.
    pub fn read_bytes(&self, count: usize) -> Result<Bytes> {
        let mut inner = self.inner.lock();
        if let Some(pending) = inner.push_back.take() {
            return Ok(pending);
        }
        let max = count.clamp(1, inner.max_read_size);
        inner.channel.recv(max)
    }

    /// Return bytes that were read too far.
    pub fn push_back(&self, bytes: Bytes) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.push_back.is_some() {
            return Err(SmartError::Protocol(
                "cannot push back twice without reading".to_string(),
            ));
        }
        inner.push_back = Some(bytes);
        Ok(())
    }

    /// Read through the next newline. Returns early, without a newline, at
    /// end of stream.
    pub fn get_line(&self) -> Result<Bytes> {
        let mut line = BytesMut::new();
        loop {
            let mut bytes = self.read_bytes(1)?;
            if bytes.is_empty() {
                return Ok(line.freeze());
            }
            if let Some(pos) = bytes.iter().position(|b| *b == b'\n') {
                let rest = bytes.split_off(pos + 1);
                line.extend_from_slice(&bytes);
                self.push_back(rest)?;
                return Ok(line.freeze());
            }
            line.extend_from_slice(&bytes);
        }
    }

    // -------------------------------------------------------------------------
    // Connection State
    // -------------------------------------------------------------------------

    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        inner.push_back = None;
        inner.channel.disconnect();
    }

    /// Disconnect and forget any request in progress.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.push_back = None;
        inner.channel.disconnect();
        inner.current_request = None;
    }

    /// Protocol version pinned by a successful exchange.
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.inner.lock().protocol_version
    }

    pub fn set_protocol_version(&self, version: ProtocolVersion) {
        self.inner.lock().protocol_version = Some(version);
    }

    /// True if the remote is known to predate `version`.
    pub fn is_remote_before(&self, version: RemoteVersion) -> bool {
        matches!(self.inner.lock().remote_is_before, Some(before) if before <= version)
    }

    /// Record that the remote predates `version`. A later, newer bound is
    /// ignored since the older one is more precise.
    pub fn remember_remote_is_before(&self, version: RemoteVersion) {
        let mut inner = self.inner.lock();
        match inner.remote_is_before {
            Some(before) if before < version => {
                tracing::debug!(
                    "Ignoring remote-is-before {:?}; already know it is before {:?}",
                    version,
                    before
                );
            }
            _ => inner.remote_is_before = Some(version),
        }
    }
}

// =============================================================================
// Medium Request
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Writing,
    Reading,
    Done,
}

/// One request/response exchange on a medium.
pub struct MediumRequest {
    medium: SmartClientMedium,
    id: u64,
    state: RequestState,
}

impl MediumRequest {
    pub fn medium(&self) -> &SmartClientMedium {
        &self.medium
    }

    pub fn accept_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if self.state != RequestState::Writing {
            return Err(SmartError::WritingCompleted);
        }
        self.medium.accept_bytes(bytes)
    }

    /// Flush the request and switch to reading.
    pub fn finished_writing(&mut self) -> Result<()> {
        if self.state != RequestState::Writing {
            return Err(SmartError::WritingCompleted);
        }
        self.state = RequestState::Reading;
        self.medium.flush()
    }

    fn check_reading(&self) -> Result<()> {
        match self.state {
            RequestState::Writing => Err(SmartError::WritingNotComplete),
            RequestState::Done => Err(SmartError::ReadingCompleted),
            RequestState::Reading => Ok(()),
        }
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Bytes> {
        self.check_reading()?;
        self.medium.read_bytes(count)
    }

    /// Read a full line; a stream that ends first is a connection reset.
    pub fn read_line(&mut self) -> Result<Bytes> {
        self.check_reading()?;
        let line = self.medium.get_line()?;
        if !line.ends_with(b"\n") {
            return Err(SmartError::ConnectionReset(format!(
                "Unexpected end of message. Please check connectivity and permissions, and report a bug if problems persist. (partial line {:?})",
                line
            )));
        }
        Ok(line)
    }

    pub fn push_back(&mut self, bytes: Bytes) -> Result<()> {
        self.medium.push_back(bytes)
    }

    /// Release the medium for the next request.
    pub fn finished_reading(&mut self) -> Result<()> {
        self.check_reading()?;
        self.state = RequestState::Done;
        self.medium.request_finished(self.id);
        Ok(())
    }
}

impl ByteSink for MediumRequest {
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.accept_bytes(bytes)
    }

    fn flush_sink(&mut self) -> Result<()> {
        self.medium.flush()
    }
}
