//! Incremental Decoder Framework
//!
//! Every decoder in this crate is a state machine fed arbitrary byte
//! fragments. Feeding appends to an input buffer and then runs the current
//! state until it either stalls (state unchanged, or an explicit request
//! for more bytes) or fails.
//!
//! ```text
//! accept_bytes(b) ──▶ in_buffer += b ──▶ step() ─┬─ state changed ──▶ step()
//!                                                ├─ state unchanged ─▶ return
//!                                                ├─ NeedMoreBytes(n) ─▶ return
//!                                                └─ Failed(e) ──────▶ Err(e)
//! ```

use bytes::{Bytes, BytesMut};

use crate::error::{Result, SmartError};

/// Why a state function stopped.
#[derive(Debug)]
pub enum Stall {
    /// The buffer is too short; optionally, how many bytes the buffer must
    /// hold before the state can make progress.
    NeedMoreBytes(Option<usize>),
    Failed(SmartError),
}

impl From<SmartError> for Stall {
    fn from(err: SmartError) -> Self {
        Stall::Failed(err)
    }
}

pub type StepResult<T = ()> = std::result::Result<T, Stall>;

/// Buffers shared by every decoder.
#[derive(Debug, Default)]
pub struct DecoderCore {
    in_buffer: BytesMut,
    unused_data: BytesMut,
    finished_reading: bool,
    needed_bytes: Option<usize>,
}

impl DecoderCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a known minimum buffer requirement.
    pub fn with_needed_bytes(count: usize) -> Self {
        Self {
            needed_bytes: Some(count),
            ..Self::default()
        }
    }

    pub fn buffered(&self) -> usize {
        self.in_buffer.len()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.in_buffer
    }

    pub fn needed_bytes(&self) -> Option<usize> {
        self.needed_bytes
    }

    pub fn finished_reading(&self) -> bool {
        self.finished_reading
    }

    pub fn set_finished_reading(&mut self) {
        self.finished_reading = true;
    }

    pub fn unused_data(&self) -> &[u8] {
        &self.unused_data
    }

    pub fn take_unused_data(&mut self) -> Bytes {
        self.unused_data.split().freeze()
    }

    /// Remove and return the first `count` buffered bytes.
    pub fn consume(&mut self, count: usize) -> Bytes {
        self.in_buffer.split_to(count).freeze()
    }

    /// Remove and return everything buffered.
    pub fn take_buffer(&mut self) -> Bytes {
        self.in_buffer.split().freeze()
    }

    /// Move the rest of the input buffer onto the unused-data tail.
    pub fn move_buffer_to_unused(&mut self) {
        let rest = self.in_buffer.split();
        self.unused_data.extend_from_slice(&rest);
    }

    /// Pop a newline-terminated line, without the newline.
    pub fn extract_line(&mut self) -> StepResult<Bytes> {
        match self.in_buffer.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let line = self.in_buffer.split_to(pos + 1);
                Ok(line.freeze().slice(..pos))
            }
            None => Err(Stall::NeedMoreBytes(Some(self.buffered() + 1))),
        }
    }

    pub fn extract_single_byte(&mut self) -> StepResult<u8> {
        if self.in_buffer.is_empty() {
            return Err(Stall::NeedMoreBytes(Some(1)));
        }
        Ok(self.in_buffer.split_to(1)[0])
    }

    /// Pop a 4-byte big-endian length followed by that many bytes.
    pub fn extract_length_prefixed(&mut self) -> StepResult<Bytes> {
        if self.in_buffer.len() < 4 {
            return Err(Stall::NeedMoreBytes(Some(4)));
        }
        let len = u32::from_be_bytes([
            self.in_buffer[0],
            self.in_buffer[1],
            self.in_buffer[2],
            self.in_buffer[3],
        ]) as usize;
        let needed = 4 + len;
        if self.in_buffer.len() < needed {
            return Err(Stall::NeedMoreBytes(Some(needed)));
        }
        let mut framed = self.in_buffer.split_to(needed);
        Ok(framed.split_off(4).freeze())
    }
}

/// A byte-driven state machine with a shared `DecoderCore`.
pub trait StatefulDecoder {
    type State: Copy + Eq;

    fn core(&self) -> &DecoderCore;

    fn core_mut(&mut self) -> &mut DecoderCore;

    fn state(&self) -> Self::State;

    /// Run the current state once against the buffer.
    fn step(&mut self) -> StepResult;

    /// Suggested size of the next read. Never zero while more input is
    /// still wanted.
    fn next_read_size(&self) -> usize;

    /// Append bytes and run the machine until it stalls.
    fn accept_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let core = self.core_mut();
        core.needed_bytes = None;
        core.in_buffer.extend_from_slice(bytes);
        loop {
            let current = self.state();
            match self.step() {
                Ok(()) if self.state() == current => return Ok(()),
                Ok(()) => continue,
                Err(Stall::NeedMoreBytes(count)) => {
                    self.core_mut().needed_bytes = count;
                    return Ok(());
                }
                Err(Stall::Failed(err)) => return Err(err),
            }
        }
    }

    fn finished_reading(&self) -> bool {
        self.core().finished_reading()
    }

    /// Bytes received after the end of this decoder's message.
    fn unused_data(&self) -> &[u8] {
        self.core().unused_data()
    }

    fn take_unused_data(&mut self) -> Bytes {
        self.core_mut().take_unused_data()
    }
}
