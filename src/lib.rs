//! # smartwire
//!
//! The wire engine of the Bazaar smart-server RPC protocol:
//! - Versions one and two: `\x01`-separated tuple lines with
//!   length-prefixed or chunked bodies
//! - Version three: framed messages of bencoded headers and parts
//! - A client that detects the server's version and resends once after a
//!   dropped connection when the verb allows it
//! - A threaded TCP server dispatching verbs from a registry
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────┐           ┌──────────────────────────────┐
//! │          SmartClient         │           │       network::Server        │
//! │ version detection, retries,  │           │  acceptor + worker threads   │
//! │ call hooks                   │           └──────────────┬───────────────┘
//! └──────────────┬───────────────┘                          │
//!                │ Requester / ResponseHandler              │ build_server_protocol
//! ┌──────────────▼───────────────┐           ┌──────────────▼───────────────┐
//! │  protocol: v1 / v2 / v3      │           │  protocol: v1 / v2 / v3      │
//! │  encoders + decoders         │◀── wire ─▶│  decoders + responders       │
//! └──────────────┬───────────────┘           └──────────────┬───────────────┘
//!                │                                          │ RequestHandler
//! ┌──────────────▼───────────────┐           ┌──────────────▼───────────────┐
//! │  medium: SmartClientMedium   │           │  request: VerbRegistry,      │
//! │  TCP / pipes / memory        │           │  SmartServerRequest verbs    │
//! └──────────────────────────────┘           └──────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod debug;

pub mod bencode;
pub mod protocol;
pub mod message;
pub mod request;
pub mod medium;
pub mod client;
pub mod network;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use bencode::Value;
pub use client::{clear_call_hooks, install_call_hook, CallHookParams, SmartClient};
pub use config::Config;
pub use error::{Result, SmartError};
pub use medium::{MemoryChannel, SmartClientMedium, TcpChannel};
pub use protocol::ProtocolVersion;
pub use request::{SmartServerRequest, SmartServerResponse, VerbRegistry};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of smartwire
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
