//! Configuration for smartwire
//!
//! Centralized configuration with sensible defaults.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::bencode::Value;
use crate::error::{Result, SmartError};
use crate::protocol::Headers;

/// Main configuration shared by the server and the client
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Network Configuration
    // -------------------------------------------------------------------------
    /// TCP listen address
    pub listen_addr: String,

    /// Number of worker threads serving connections
    pub workers: usize,

    /// Accepted connections waiting for a worker
    pub max_pending_connections: usize,

    /// Connection read timeout (milliseconds, 0 disables)
    pub read_timeout_ms: u64,

    /// Connection write timeout (milliseconds, 0 disables)
    pub write_timeout_ms: u64,

    // -------------------------------------------------------------------------
    // Protocol Configuration
    // -------------------------------------------------------------------------
    /// Version three encoder flushes once this many bytes are buffered
    pub encoder_buffer_size: usize,

    /// Largest single read issued against a transport
    pub max_read_size: usize,

    /// Headers attached to every version three message
    pub headers: Headers,

    // -------------------------------------------------------------------------
    // Debug Configuration
    // -------------------------------------------------------------------------
    /// Debug flags to switch on (`hpss`, `hpssdetail`, `noretry`)
    pub debug_flags: Vec<String>,
}

/// Default headers: `{"Software version": <crate version>}`.
pub fn default_headers() -> Headers {
    let mut headers = BTreeMap::new();
    headers.insert(
        Bytes::from_static(b"Software version"),
        Value::from(crate::VERSION),
    );
    headers
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:4155".to_string(),
            workers: 16,
            max_pending_connections: 1024,
            read_timeout_ms: 300_000,
            write_timeout_ms: 300_000,
            encoder_buffer_size: 1024 * 1024, // 1 MiB
            max_read_size: 64 * 1024,         // 64 KiB
            headers: default_headers(),
            debug_flags: Vec::new(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject settings that would stall the server or the codecs.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(SmartError::Config("workers must be at least 1".into()));
        }
        if self.max_pending_connections == 0 {
            return Err(SmartError::Config(
                "max_pending_connections must be at least 1".into(),
            ));
        }
        if self.encoder_buffer_size == 0 {
            return Err(SmartError::Config(
                "encoder_buffer_size must be non-zero".into(),
            ));
        }
        if self.max_read_size == 0 {
            return Err(SmartError::Config("max_read_size must be non-zero".into()));
        }
        Ok(())
    }

    /// Switch on every configured debug flag.
    pub fn apply_debug_flags(&self) {
        for flag in &self.debug_flags {
            crate::debug::enable(flag);
        }
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the TCP listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set the number of worker threads
    pub fn workers(mut self, count: usize) -> Self {
        self.config.workers = count;
        self
    }

    /// Set the accept queue depth
    pub fn max_pending_connections(mut self, count: usize) -> Self {
        self.config.max_pending_connections = count;
        self
    }

    /// Set the read timeout (in milliseconds)
    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    /// Set the write timeout (in milliseconds)
    pub fn write_timeout_ms(mut self, ms: u64) -> Self {
        self.config.write_timeout_ms = ms;
        self
    }

    /// Set the version three flush threshold (in bytes)
    pub fn encoder_buffer_size(mut self, size: usize) -> Self {
        self.config.encoder_buffer_size = size;
        self
    }

    /// Set the maximum transport read size (in bytes)
    pub fn max_read_size(mut self, size: usize) -> Self {
        self.config.max_read_size = size;
        self
    }

    /// Add or replace a message header
    pub fn header(mut self, key: impl Into<Bytes>, value: impl Into<Value>) -> Self {
        self.config.headers.insert(key.into(), value.into());
        self
    }

    /// Add a debug flag
    pub fn debug_flag(mut self, flag: impl Into<String>) -> Self {
        self.config.debug_flags.push(flag.into());
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
