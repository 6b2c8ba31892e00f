//! Body Framing for Versions One and Two
//!
//! ## Length-prefixed body
//! ```text
//! <decimal length>\n <body bytes> done\n
//! ```
//!
//! ## Chunked body (version two streams)
//! ```text
//! chunked\n
//! <hex length>\n <chunk bytes>      repeated
//! ERR\n                             optional: following chunks are error args
//! END\n
//! ```

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use super::decoder::{DecoderCore, StatefulDecoder, StepResult};
use super::ByteSink;
use crate::bencode::Value;
use crate::error::{Result, SmartError};

const BODY_TRAILER: &[u8] = b"done\n";
const CHUNKED_HEADER: &[u8] = b"chunked\n";

/// One element of a streamed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Bytes(Bytes),
    /// The stream was aborted; carries the error args.
    Failed(Vec<Value>),
}

// =============================================================================
// Encoding
// =============================================================================

/// `"<len>\n" + body + "done\n"`.
pub fn encode_bulk_data(body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(body.len() + 16);
    out.extend_from_slice(format!("{}\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    out.extend_from_slice(BODY_TRAILER);
    out.freeze()
}

/// Readv ranges as `"start,length"` lines joined by newlines.
pub fn serialise_offsets(ranges: &[(u64, u64)]) -> Bytes {
    let lines: Vec<String> = ranges
        .iter()
        .map(|(start, length)| format!("{},{}", start, length))
        .collect();
    Bytes::from(lines.join("\n"))
}

/// Write a complete chunked stream. A failed item ends the stream with
/// `ERR` and the error args as chunks.
pub fn send_chunked_stream<S, I>(sink: &mut S, stream: I) -> Result<()>
where
    S: ByteSink + ?Sized,
    I: IntoIterator<Item = Result<StreamChunk>>,
{
    sink.write_bytes(CHUNKED_HEADER)?;
    for item in stream {
        match item {
            Ok(StreamChunk::Bytes(chunk)) => write_chunk(sink, &chunk)?,
            Ok(StreamChunk::Failed(args)) => {
                write_error_chunks(sink, &args)?;
                break;
            }
            Err(err) => {
                write_error_chunks(sink, &crate::request::translate_error(&err))?;
                break;
            }
        }
    }
    sink.write_bytes(b"END\n")
}

fn write_chunk<S: ByteSink + ?Sized>(sink: &mut S, chunk: &[u8]) -> Result<()> {
    sink.write_bytes(format!("{:x}\n", chunk.len()).as_bytes())?;
    sink.write_bytes(chunk)
}

fn write_error_chunks<S: ByteSink + ?Sized>(sink: &mut S, args: &[Value]) -> Result<()> {
    sink.write_bytes(b"ERR\n")?;
    for arg in super::args_as_bytes(args)? {
        write_chunk(sink, &arg)?;
    }
    Ok(())
}

// =============================================================================
// Length-prefixed Decoder
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthPrefixedState {
    ExpectingLength,
    ReadingBody,
    ReadingTrailer,
    ReadingUnused,
}

/// Decodes `<len>\n<body>done\n`.
#[derive(Debug)]
pub struct LengthPrefixedBodyDecoder {
    core: DecoderCore,
    state: LengthPrefixedState,
    bytes_left: Option<usize>,
    body: BytesMut,
    trailer: BytesMut,
}

impl Default for LengthPrefixedBodyDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LengthPrefixedBodyDecoder {
    pub fn new() -> Self {
        Self {
            core: DecoderCore::new(),
            state: LengthPrefixedState::ExpectingLength,
            bytes_left: None,
            body: BytesMut::new(),
            trailer: BytesMut::new(),
        }
    }

    /// Body bytes decoded since the last call.
    pub fn read_pending_data(&mut self) -> Bytes {
        self.body.split().freeze()
    }

    fn expecting_length(&mut self) -> StepResult {
        let Some(pos) = self.core.buffer().iter().position(|b| *b == b'\n') else {
            return Ok(());
        };
        let line = self.core.consume(pos + 1);
        let length = std::str::from_utf8(&line[..pos])
            .ok()
            .and_then(|text| text.parse::<usize>().ok())
            .filter(|length| length.checked_add(BODY_TRAILER.len()).is_some())
            .ok_or_else(|| {
                SmartError::Protocol(format!("Bad body length {:?}", line.slice(..pos)))
            })?;
        self.bytes_left = Some(length);
        self.state = LengthPrefixedState::ReadingBody;
        Ok(())
    }

    fn reading_body(&mut self) -> StepResult {
        let left = self.bytes_left.unwrap_or(0);
        let take = left.min(self.core.buffered());
        let part = self.core.consume(take);
        self.body.extend_from_slice(&part);
        let left = left - take;
        if left == 0 {
            self.bytes_left = None;
            self.state = LengthPrefixedState::ReadingTrailer;
        } else {
            self.bytes_left = Some(left);
        }
        Ok(())
    }

    fn reading_trailer(&mut self) -> StepResult {
        let take = (BODY_TRAILER.len() - self.trailer.len()).min(self.core.buffered());
        let part = self.core.consume(take);
        self.trailer.extend_from_slice(&part);
        if !BODY_TRAILER.starts_with(&self.trailer) {
            return Err(SmartError::Protocol(format!(
                "Bad body trailer {:?}",
                self.trailer.clone().freeze()
            ))
            .into());
        }
        if self.trailer.len() == BODY_TRAILER.len() {
            self.core.move_buffer_to_unused();
            self.state = LengthPrefixedState::ReadingUnused;
            self.core.set_finished_reading();
        }
        Ok(())
    }
}

impl StatefulDecoder for LengthPrefixedBodyDecoder {
    type State = LengthPrefixedState;

    fn core(&self) -> &DecoderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DecoderCore {
        &mut self.core
    }

    fn state(&self) -> LengthPrefixedState {
        self.state
    }

    fn step(&mut self) -> StepResult {
        match self.state {
            LengthPrefixedState::ExpectingLength => self.expecting_length(),
            LengthPrefixedState::ReadingBody => self.reading_body(),
            LengthPrefixedState::ReadingTrailer => self.reading_trailer(),
            LengthPrefixedState::ReadingUnused => {
                self.core.move_buffer_to_unused();
                Ok(())
            }
        }
    }

    fn next_read_size(&self) -> usize {
        if let Some(left) = self.bytes_left {
            return left.saturating_add(BODY_TRAILER.len());
        }
        match self.state {
            LengthPrefixedState::ReadingTrailer => BODY_TRAILER.len() - self.trailer.len(),
            LengthPrefixedState::ExpectingLength => 6,
            _ => 1,
        }
    }
}

// =============================================================================
// Chunked Decoder
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkedState {
    ExpectingHeader,
    ExpectingLength,
    ReadingChunk,
    ReadingUnused,
}

/// Decodes the version two streamed body.
#[derive(Debug)]
pub struct ChunkedBodyDecoder {
    core: DecoderCore,
    state: ChunkedState,
    bytes_left: usize,
    chunk_in_progress: BytesMut,
    chunks: VecDeque<StreamChunk>,
    error: bool,
    error_in_progress: Vec<Value>,
}

impl Default for ChunkedBodyDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedBodyDecoder {
    pub fn new() -> Self {
        Self {
            core: DecoderCore::new(),
            state: ChunkedState::ExpectingHeader,
            bytes_left: 0,
            chunk_in_progress: BytesMut::new(),
            chunks: VecDeque::new(),
            error: false,
            error_in_progress: Vec::new(),
        }
    }

    /// Pop the next complete chunk, if any.
    pub fn read_next_chunk(&mut self) -> Option<StreamChunk> {
        self.chunks.pop_front()
    }

    fn expecting_header(&mut self) -> StepResult {
        let has_line = self.core.buffer().contains(&b'\n');
        if !has_line && self.core.buffered() >= CHUNKED_HEADER.len() {
            return Err(SmartError::Protocol(format!(
                "Bad chunked body header: {:?}",
                Bytes::copy_from_slice(self.core.buffer())
            ))
            .into());
        }
        let line = self.core.extract_line()?;
        if line.as_ref() != &CHUNKED_HEADER[..CHUNKED_HEADER.len() - 1] {
            return Err(SmartError::Protocol(format!("Bad chunked body header: {:?}", line)).into());
        }
        self.state = ChunkedState::ExpectingLength;
        Ok(())
    }

    fn expecting_length(&mut self) -> StepResult {
        let line = self.core.extract_line()?;
        match line.as_ref() {
            b"ERR" => {
                self.error = true;
                self.error_in_progress.clear();
                self.expecting_length()
            }
            b"END" => {
                self.finish();
                Ok(())
            }
            text => {
                let length = std::str::from_utf8(text)
                    .ok()
                    .and_then(|hex| usize::from_str_radix(hex, 16).ok())
                    .filter(|length| length.checked_add(4).is_some())
                    .ok_or_else(|| {
                        SmartError::Protocol(format!("Bad chunk length {:?}", line))
                    })?;
                self.bytes_left = length;
                self.chunk_in_progress.clear();
                self.state = ChunkedState::ReadingChunk;
                Ok(())
            }
        }
    }

    fn reading_chunk(&mut self) -> StepResult {
        let take = self.bytes_left.min(self.core.buffered());
        let part = self.core.consume(take);
        self.chunk_in_progress.extend_from_slice(&part);
        self.bytes_left -= take;
        if self.bytes_left == 0 {
            let chunk = self.chunk_in_progress.split().freeze();
            if self.error {
                self.error_in_progress.push(Value::Bytes(chunk));
            } else {
                self.chunks.push_back(StreamChunk::Bytes(chunk));
            }
            self.state = ChunkedState::ExpectingLength;
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.core.move_buffer_to_unused();
        self.state = ChunkedState::ReadingUnused;
        self.core.set_finished_reading();
        if self.error {
            let args = std::mem::take(&mut self.error_in_progress);
            self.chunks.push_back(StreamChunk::Failed(args));
        }
    }
}

impl StatefulDecoder for ChunkedBodyDecoder {
    type State = ChunkedState;

    fn core(&self) -> &DecoderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DecoderCore {
        &mut self.core
    }

    fn state(&self) -> ChunkedState {
        self.state
    }

    fn step(&mut self) -> StepResult {
        match self.state {
            ChunkedState::ExpectingHeader => self.expecting_header(),
            ChunkedState::ExpectingLength => self.expecting_length(),
            ChunkedState::ReadingChunk => self.reading_chunk(),
            ChunkedState::ReadingUnused => {
                self.core.move_buffer_to_unused();
                Ok(())
            }
        }
    }

    fn next_read_size(&self) -> usize {
        match self.state {
            // Allow for the next chunk's length line too.
            ChunkedState::ReadingChunk => self.bytes_left.saturating_add(4),
            ChunkedState::ExpectingLength => {
                if self.core.buffered() == 0 {
                    2
                } else {
                    1
                }
            }
            ChunkedState::ReadingUnused => 1,
            ChunkedState::ExpectingHeader => {
                CHUNKED_HEADER.len().saturating_sub(self.core.buffered()).max(1)
            }
        }
    }
}

/// Drive a decoder from a byte source until it finishes.
pub(crate) fn fill_decoder<D, F>(decoder: &mut D, mut read: F, lost: &str) -> Result<()>
where
    D: StatefulDecoder,
    F: FnMut(usize) -> Result<Bytes>,
{
    while !decoder.finished_reading() {
        let bytes = read(decoder.next_read_size())?;
        if bytes.is_empty() {
            return Err(SmartError::ConnectionReset(lost.to_string()));
        }
        decoder.accept_bytes(&bytes)?;
    }
    Ok(())
}
