//! Connection Handler
//!
//! Serves smart protocol requests on one client stream, one after another,
//! until the client goes away.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use crate::config::Config;
use crate::error::{Result, SmartError};
use crate::medium::map_io_error;
use crate::protocol::{build_server_protocol, Headers, StreamSink};
use crate::request::{SmartServerRequestHandler, VerbRegistry};

/// Read side of a connection with a push-back buffer for bytes that belong
/// to the next request.
struct InputStream<R> {
    reader: R,
    push_back: BytesMut,
    max_read_size: usize,
}

impl<R: Read> InputStream<R> {
    /// Pushed-back bytes first, then at most `count` fresh bytes. Empty at
    /// end of stream.
    fn read_bytes(&mut self, count: usize) -> Result<Bytes> {
        if !self.push_back.is_empty() {
            return Ok(self.push_back.split().freeze());
        }
        let mut buf = vec![0u8; count.clamp(1, self.max_read_size)];
        let n = self
            .reader
            .read(&mut buf)
            .map_err(|e| map_io_error("Error trying to read from client", e))?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    /// Everything through the first newline. Extra bytes read past it are
    /// kept too; only a stream that ends first yields a line without one.
    fn get_line(&mut self) -> Result<Bytes> {
        let mut line = BytesMut::new();
        loop {
            if line.contains(&b'\n') {
                return Ok(line.freeze());
            }
            let bytes = self.read_bytes(1)?;
            if bytes.is_empty() {
                return Ok(line.freeze());
            }
            line.extend_from_slice(&bytes);
        }
    }

    fn push_back(&mut self, bytes: &[u8]) {
        self.push_back.extend_from_slice(bytes);
    }
}

/// Handles a single client connection
pub struct Connection<R: Read, W: Write> {
    /// Client stream reader
    input: InputStream<R>,

    /// Client stream writer (buffered; flushed at the end of each response)
    writer: W,

    /// Verbs served on this connection
    registry: Arc<VerbRegistry>,

    /// Headers sent with version three responses
    headers: Headers,

    encoder_buffer_size: usize,

    /// Peer address for logging
    peer_addr: String,
}

impl Connection<BufReader<TcpStream>, BufWriter<TcpStream>> {
    /// Set up buffered I/O over a TCP stream and configure timeouts.
    pub fn from_tcp(stream: TcpStream, registry: Arc<VerbRegistry>, config: &Config) -> Result<Self> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;
        if config.read_timeout_ms > 0 {
            stream.set_read_timeout(Some(Duration::from_millis(config.read_timeout_ms)))?;
        }
        if config.write_timeout_ms > 0 {
            stream.set_write_timeout(Some(Duration::from_millis(config.write_timeout_ms)))?;
        }

        let read_stream = stream.try_clone()?;
        let mut connection = Self::new(
            BufReader::new(read_stream),
            BufWriter::new(stream),
            registry,
            config,
        );
        connection.peer_addr = peer_addr;
        Ok(connection)
    }
}

impl<R: Read, W: Write> Connection<R, W> {
    pub fn new(reader: R, writer: W, registry: Arc<VerbRegistry>, config: &Config) -> Self {
        Self {
            input: InputStream {
                reader,
                push_back: BytesMut::new(),
                max_read_size: config.max_read_size.max(1),
            },
            writer,
            registry,
            headers: config.headers.clone(),
            encoder_buffer_size: config.encoder_buffer_size,
            peer_addr: "local".to_string(),
        }
    }

    /// Get the peer address string
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn into_writer(self) -> W {
        self.writer
    }

    /// Serve requests until the client disconnects.
    pub fn handle(&mut self) -> Result<()> {
        tracing::debug!("Connection established from {}", self.peer_addr);

        loop {
            match self.serve_one_request() {
                Ok(true) => continue,
                Ok(false) => {
                    tracing::debug!("Client {} disconnected", self.peer_addr);
                    return Ok(());
                }
                Err(e) if e.is_connection_reset() => {
                    tracing::debug!("Connection reset by client {}: {}", self.peer_addr, e);
                    return Ok(());
                }
                Err(SmartError::Io(ref e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    tracing::debug!("Read timeout for client {}", self.peer_addr);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Error serving {}: {}", self.peer_addr, e);
                    return Err(e);
                }
            }
        }
    }

    /// Serve one request. Returns `false` if the client closed the stream
    /// cleanly between requests.
    pub fn serve_one_request(&mut self) -> Result<bool> {
        let first_line = self.input.get_line()?;
        if first_line.is_empty() {
            return Ok(false);
        }
        if !first_line.contains(&b'\n') {
            return Err(SmartError::ConnectionReset(format!(
                "client closed the connection mid-request after {} bytes",
                first_line.len()
            )));
        }

        let handler = SmartServerRequestHandler::new(Arc::clone(&self.registry));
        let mut protocol = build_server_protocol(
            &first_line,
            handler,
            StreamSink(&mut self.writer),
            self.headers.clone(),
            self.encoder_buffer_size,
        )?;
        tracing::trace!(
            "Serving protocol version {} request from {}",
            protocol.version(),
            self.peer_addr
        );

        while !protocol.finished() {
            let bytes = self.input.read_bytes(protocol.next_read_size())?;
            if bytes.is_empty() {
                return Err(SmartError::ConnectionReset(
                    "client closed the connection mid-request".to_string(),
                ));
            }
            protocol.accept_bytes(&bytes)?;
        }

        if protocol.decoding_failed() {
            return Err(SmartError::Protocol(
                "request could not be decoded; closing connection".to_string(),
            ));
        }
        let unused = protocol.take_unused_data();
        self.input.push_back(&unused);
        Ok(true)
    }
}
