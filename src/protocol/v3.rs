//! Version Three Decoder
//!
//! Turns a byte stream into message events delivered to a `MessageHandler`.
//!
//! ```text
//! [marker] ──▶ headers ──▶ kind byte ─┬─ 'o' ─▶ one byte ─────┐
//!                              ▲      ├─ 's' ─▶ structure ────┤
//!                              │      ├─ 'b' ─▶ bytes ────────┤
//!                              │      └─ 'e' ─▶ end ─▶ unused │
//!                              └──────────────────────────────┘
//! ```
//!
//! A fault in the framing stops the decoder for good. A fault raised by the
//! handler is reported back to the handler and decoding carries on, since
//! the stream is still well framed.

use bytes::Bytes;

use super::decoder::{DecoderCore, Stall, StatefulDecoder, StepResult};
use super::MESSAGE_VERSION_THREE;
use crate::bencode::{self, Value};
use crate::debug;
use crate::error::{Result, SmartError};
use crate::message::MessageHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreeState {
    ExpectingProtocolVersion,
    ExpectingHeaders,
    ExpectingMessagePart,
    ExpectingOneByte,
    ExpectingBytes,
    ExpectingStructure,
    ReadingUnused,
}

/// Incremental decoder for version three messages.
pub struct ProtocolThreeDecoder<H: MessageHandler> {
    core: DecoderCore,
    state: ThreeState,
    handler: H,
    decoding_failed: bool,
}

fn handler_fault(err: SmartError) -> Stall {
    Stall::Failed(SmartError::MessageHandler(Box::new(err)))
}

impl<H: MessageHandler> ProtocolThreeDecoder<H> {
    /// Servers have already consumed the version marker to choose a protocol,
    /// so they pass `expect_version_marker = false`.
    pub fn new(handler: H, expect_version_marker: bool) -> Self {
        let (state, needed) = if expect_version_marker {
            (ThreeState::ExpectingProtocolVersion, MESSAGE_VERSION_THREE.len() + 4)
        } else {
            (ThreeState::ExpectingHeaders, 4)
        };
        Self {
            core: DecoderCore::with_needed_bytes(needed),
            state,
            handler,
            decoding_failed: false,
        }
    }

    pub fn message_handler(&self) -> &H {
        &self.handler
    }

    pub fn message_handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn into_message_handler(self) -> H {
        self.handler
    }

    pub fn decoding_failed(&self) -> bool {
        self.decoding_failed
    }

    /// Feed bytes. Framing faults are reported to the handler and end the
    /// message; the call only fails if the handler re-raises.
    pub fn accept_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if self.decoding_failed {
            return Ok(());
        }
        let mut input = bytes;
        loop {
            match StatefulDecoder::accept_bytes(self, input) {
                Ok(()) => return Ok(()),
                Err(SmartError::MessageHandler(inner)) => {
                    let inner = (*inner).into_inner();
                    if !matches!(inner, SmartError::UnknownMethod(_)) {
                        tracing::debug!("Message handler error: {}", inner);
                    }
                    self.handler.protocol_error(inner)?;
                    // Resume where the state machine left off.
                    input = &[];
                }
                Err(err) => {
                    self.decoding_failed = true;
                    self.core.set_finished_reading();
                    self.core.take_buffer();
                    if !matches!(err, SmartError::UnexpectedProtocolVersionMarker(_)) {
                        tracing::warn!("Version three decoding failed: {}", err);
                    }
                    return self.handler.protocol_error(err);
                }
            }
        }
    }

    fn expecting_protocol_version(&mut self) -> StepResult {
        let marker_len = MESSAGE_VERSION_THREE.len();
        let buffered = self.core.buffer();
        if buffered.len() < marker_len {
            if !MESSAGE_VERSION_THREE.starts_with(buffered) {
                return Err(SmartError::UnexpectedProtocolVersionMarker(
                    Bytes::copy_from_slice(buffered),
                )
                .into());
            }
            return Err(Stall::NeedMoreBytes(Some(marker_len)));
        }
        if !buffered.starts_with(MESSAGE_VERSION_THREE) {
            return Err(SmartError::UnexpectedProtocolVersionMarker(Bytes::copy_from_slice(
                &buffered[..marker_len],
            ))
            .into());
        }
        self.core.consume(marker_len);
        self.state = ThreeState::ExpectingHeaders;
        Ok(())
    }

    fn expecting_headers(&mut self) -> StepResult {
        let encoded = self.core.extract_length_prefixed()?;
        let headers = match decode_structure(&encoded)? {
            Value::Dict(map) => map,
            other => {
                return Err(SmartError::Protocol(format!(
                    "Header object {:?} is not a dict",
                    other
                ))
                .into())
            }
        };
        self.state = ThreeState::ExpectingMessagePart;
        self.handler
            .headers_received(headers)
            .map_err(handler_fault)
    }

    fn expecting_message_part(&mut self) -> StepResult {
        let kind = self.core.extract_single_byte()?;
        let next = match kind {
            b'o' => ThreeState::ExpectingOneByte,
            b's' => ThreeState::ExpectingStructure,
            b'b' => ThreeState::ExpectingBytes,
            b'e' => return self.done(),
            other => {
                return Err(SmartError::Protocol(format!(
                    "Bad message kind byte: {:?}",
                    char::from(other)
                ))
                .into())
            }
        };
        self.state = next;
        Ok(())
    }

    fn expecting_one_byte(&mut self) -> StepResult {
        let byte = self.core.extract_single_byte()?;
        self.state = ThreeState::ExpectingMessagePart;
        if debug::is_enabled(debug::HPSS_DETAIL) {
            tracing::debug!("decoder: one byte {:?}", char::from(byte));
        }
        self.handler.byte_part_received(byte).map_err(handler_fault)
    }

    fn expecting_bytes(&mut self) -> StepResult {
        let bytes = self.core.extract_length_prefixed()?;
        self.state = ThreeState::ExpectingMessagePart;
        if debug::is_enabled(debug::HPSS_DETAIL) {
            tracing::debug!("decoder: {} body bytes", bytes.len());
        }
        self.handler.bytes_part_received(bytes).map_err(handler_fault)
    }

    fn expecting_structure(&mut self) -> StepResult {
        let encoded = self.core.extract_length_prefixed()?;
        let structure = decode_structure(&encoded)?;
        self.state = ThreeState::ExpectingMessagePart;
        if debug::is_enabled(debug::HPSS_DETAIL) {
            tracing::debug!("decoder: structure {:?}", structure);
        }
        self.handler
            .structure_part_received(structure)
            .map_err(handler_fault)
    }

    fn done(&mut self) -> StepResult {
        self.core.move_buffer_to_unused();
        self.state = ThreeState::ReadingUnused;
        self.core.set_finished_reading();
        self.handler.end_received().map_err(handler_fault)
    }
}

fn decode_structure(encoded: &Bytes) -> StepResult<Value> {
    bencode::decode(encoded).map_err(|_| {
        Stall::Failed(SmartError::Protocol(format!(
            "Bytes {:?} not bencoded",
            encoded
        )))
    })
}

impl<H: MessageHandler> StatefulDecoder for ProtocolThreeDecoder<H> {
    type State = ThreeState;

    fn core(&self) -> &DecoderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DecoderCore {
        &mut self.core
    }

    fn state(&self) -> ThreeState {
        self.state
    }

    fn step(&mut self) -> StepResult {
        match self.state {
            ThreeState::ExpectingProtocolVersion => self.expecting_protocol_version(),
            ThreeState::ExpectingHeaders => self.expecting_headers(),
            ThreeState::ExpectingMessagePart => self.expecting_message_part(),
            ThreeState::ExpectingOneByte => self.expecting_one_byte(),
            ThreeState::ExpectingBytes => self.expecting_bytes(),
            ThreeState::ExpectingStructure => self.expecting_structure(),
            ThreeState::ReadingUnused => {
                self.core.move_buffer_to_unused();
                Ok(())
            }
        }
    }

    /// Zero exactly when the message is complete or decoding has failed.
    fn next_read_size(&self) -> usize {
        if self.state == ThreeState::ReadingUnused || self.decoding_failed {
            return 0;
        }
        match self.core.needed_bytes() {
            Some(needed) => needed.saturating_sub(self.core.buffered()).max(1),
            None => 1,
        }
    }
}
