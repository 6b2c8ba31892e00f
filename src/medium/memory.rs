//! In-memory Channel
//!
//! Replays scripted replies, one script per connection, and records what
//! was written on each connection. Clones share state, so a test can keep a
//! handle while the medium owns another.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::channel::Channel;
use crate::error::{Result, SmartError};

#[derive(Debug, Default)]
struct Script {
    reply: Bytes,
    fail_on_send: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    scripts: VecDeque<Script>,
    current: Option<Script>,
    written: Vec<Vec<u8>>,
    connects: usize,
    disconnects: usize,
}

impl MemoryState {
    fn connection(&mut self) -> &mut Script {
        if self.current.is_none() {
            self.connects += 1;
            self.written.push(Vec::new());
            let script = self.scripts.pop_front().unwrap_or_default();
            self.current = Some(script);
        }
        self.current.get_or_insert_with(Script::default)
    }
}

/// Scripted channel for driving a client without a server.
#[derive(Debug, Clone, Default)]
pub struct MemoryChannel {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a connection that answers with `reply` and then closes.
    pub fn push_reply(&self, reply: impl Into<Bytes>) -> &Self {
        self.state.lock().scripts.push_back(Script {
            reply: reply.into(),
            fail_on_send: false,
        });
        self
    }

    /// Queue a connection that resets as soon as anything is sent.
    pub fn push_send_failure(&self) -> &Self {
        self.state.lock().scripts.push_back(Script {
            reply: Bytes::new(),
            fail_on_send: true,
        });
        self
    }

    /// Bytes written on each connection, in connection order.
    pub fn written(&self) -> Vec<Bytes> {
        self.state
            .lock()
            .written
            .iter()
            .map(|w| Bytes::copy_from_slice(w))
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnects
    }
}

impl Channel for MemoryChannel {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.connection().fail_on_send {
            return Err(SmartError::ConnectionReset(
                "Error trying to write to memory channel".to_string(),
            ));
        }
        if let Some(written) = state.written.last_mut() {
            written.extend_from_slice(bytes);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn recv(&mut self, max: usize) -> Result<Bytes> {
        let mut state = self.state.lock();
        let script = state.connection();
        let take = max.min(script.reply.len());
        Ok(script.reply.split_to(take))
    }

    fn disconnect(&mut self) {
        let mut state = self.state.lock();
        state.disconnects += 1;
        state.current = None;
    }
}
