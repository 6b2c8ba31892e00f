//! Byte Channels
//!
//! The raw transports a client medium talks through.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use bytes::Bytes;

use crate::error::{Result, SmartError};

/// A bidirectional byte transport.
///
/// `recv` returns an empty buffer at end of stream. After `disconnect`, a
/// channel that can reconnect does so on next use.
pub trait Channel: Send {
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    fn recv(&mut self, max: usize) -> Result<Bytes>;

    fn disconnect(&mut self);
}

/// Map transport failures that mean "the peer went away" onto
/// `ConnectionReset`.
pub(crate) fn map_io_error(context: &str, err: std::io::Error) -> SmartError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof => SmartError::ConnectionReset(format!("{}: {}", context, err)),
        _ => SmartError::Io(err),
    }
}

fn read_some<R: Read>(reader: &mut R, max: usize, context: &str) -> Result<Bytes> {
    let mut buf = vec![0u8; max.max(1)];
    let n = reader
        .read(&mut buf)
        .map_err(|e| map_io_error(context, e))?;
    buf.truncate(n);
    Ok(Bytes::from(buf))
}

// =============================================================================
// TCP
// =============================================================================

/// A TCP connection, opened lazily and reopened after a disconnect.
pub struct TcpChannel {
    addr: String,
    read_timeout_ms: u64,
    write_timeout_ms: u64,
    stream: Option<(BufReader<TcpStream>, BufWriter<TcpStream>)>,
}

impl TcpChannel {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            stream: None,
        }
    }

    /// Timeouts in milliseconds; 0 disables.
    pub fn with_timeouts(mut self, read_ms: u64, write_ms: u64) -> Self {
        self.read_timeout_ms = read_ms;
        self.write_timeout_ms = write_ms;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn ensure_connection(&mut self) -> Result<&mut (BufReader<TcpStream>, BufWriter<TcpStream>)> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(&self.addr).map_err(|e| {
                SmartError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to connect to {}: {}", self.addr, e),
                ))
            })?;
            stream.set_nodelay(true)?;
            if self.read_timeout_ms > 0 {
                stream.set_read_timeout(Some(Duration::from_millis(self.read_timeout_ms)))?;
            }
            if self.write_timeout_ms > 0 {
                stream.set_write_timeout(Some(Duration::from_millis(self.write_timeout_ms)))?;
            }
            tracing::debug!("Connected to {}", self.addr);
            let read_stream = stream.try_clone()?;
            self.stream = Some((BufReader::new(read_stream), BufWriter::new(stream)));
        }
        self.stream
            .as_mut()
            .ok_or_else(|| SmartError::ConnectionReset("not connected".to_string()))
    }
}

impl Channel for TcpChannel {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let (_, writer) = self.ensure_connection()?;
        writer
            .write_all(bytes)
            .map_err(|e| map_io_error("Error trying to write to socket", e))
    }

    fn flush(&mut self) -> Result<()> {
        if let Some((_, writer)) = self.stream.as_mut() {
            writer
                .flush()
                .map_err(|e| map_io_error("Error trying to write to socket", e))?;
        }
        Ok(())
    }

    fn recv(&mut self, max: usize) -> Result<Bytes> {
        let (reader, _) = self.ensure_connection()?;
        read_some(reader, max, "Error trying to read from socket")
    }

    fn disconnect(&mut self) {
        if let Some((_, writer)) = self.stream.take() {
            let _ = writer.get_ref().shutdown(Shutdown::Both);
            tracing::debug!("Disconnected from {}", self.addr);
        }
    }
}

// =============================================================================
// Pipes
// =============================================================================

/// A pair of pipes, e.g. the stdio of a child process.
pub struct PipeChannel<R, W> {
    reader: R,
    writer: W,
}

impl<R: Read + Send, W: Write + Send> PipeChannel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl<R: Read + Send, W: Write + Send> Channel for PipeChannel<R, W> {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .map_err(|e| map_io_error("Error trying to write to pipe", e))
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| map_io_error("Error trying to write to pipe", e))
    }

    fn recv(&mut self, max: usize) -> Result<Bytes> {
        read_some(&mut self.reader, max, "Error trying to read from pipe")
    }

    /// Pipes cannot be reopened; the owner closes them.
    fn disconnect(&mut self) {}
}
