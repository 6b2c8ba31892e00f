//! TCP Server
//!
//! Accepts connections and dispatches them to worker threads.
//!
//! ```text
//! acceptor (nonblocking accept, polls shutdown flag)
//!     │  crossbeam bounded channel of TcpStream
//!     ▼
//! worker 0 .. worker N-1 ──▶ Connection::handle()
//! ```

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver};

use crate::config::Config;
use crate::error::Result;
use crate::request::VerbRegistry;

use super::connection::Connection;

/// How long the acceptor sleeps when no connection is pending.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Stops a running server from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// TCP server for the smart protocol
pub struct Server {
    config: Config,
    registry: Arc<VerbRegistry>,
    listener: TcpListener,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Validate the config and bind the listen address.
    pub fn bind(config: Config, registry: VerbRegistry) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.listen_addr)?;
        listener.set_nonblocking(true)?;
        tracing::info!("Listening on {}", listener.local_addr()?);
        Ok(Self {
            config,
            registry: Arc::new(registry),
            listener,
            shutdown: ShutdownHandle {
                flag: Arc::new(AtomicBool::new(false)),
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Signal the server to shutdown gracefully
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// Accept connections until shut down, then wait for the workers to
    /// finish their connections.
    pub fn run(&self) -> Result<()> {
        let (sender, receiver) = channel::bounded::<TcpStream>(self.config.max_pending_connections);
        let workers = (0..self.config.workers)
            .map(|id| self.spawn_worker(id, receiver.clone()))
            .collect::<std::io::Result<Vec<_>>>()?;
        drop(receiver);

        let mut outcome = Ok(());
        while !self.shutdown.is_shutdown() {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    tracing::debug!("Accepted connection from {}", addr);
                    if let Err(e) = stream.set_nonblocking(false) {
                        tracing::warn!("Dropping connection from {}: {}", addr, e);
                        continue;
                    }
                    if sender.send(stream).is_err() {
                        tracing::warn!("All workers have exited; stopping");
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!("Accept failed: {}", e);
                    outcome = Err(e.into());
                    break;
                }
            }
        }

        tracing::info!("Shutting down; waiting for {} workers", workers.len());
        drop(sender);
        for worker in workers {
            if worker.join().is_err() {
                tracing::warn!("A worker thread panicked");
            }
        }
        outcome
    }

    fn spawn_worker(&self, id: usize, receiver: Receiver<TcpStream>) -> std::io::Result<JoinHandle<()>> {
        let registry = Arc::clone(&self.registry);
        let config = self.config.clone();
        thread::Builder::new()
            .name(format!("smartwire-worker-{}", id))
            .spawn(move || {
                for stream in receiver.iter() {
                    let mut connection = match Connection::from_tcp(stream, Arc::clone(&registry), &config) {
                        Ok(connection) => connection,
                        Err(e) => {
                            tracing::warn!("Failed to set up connection: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = connection.handle() {
                        tracing::debug!("Connection {} ended with error: {}", connection.peer_addr(), e);
                    }
                }
            })
    }
}
