//! Network Module
//!
//! TCP server and per-connection request serving.
//!
//! ## Architecture
//! - Single acceptor thread
//! - Worker thread pool for connections
//! - Requests dispatched through a shared `VerbRegistry`

mod connection;
mod server;

pub use connection::Connection;
pub use server::{Server, ShutdownHandle};
