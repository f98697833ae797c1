//! Modbus/TCP framing for single-register holding reads.
//!
//! A request is an MBAP header followed by a read-holding-registers PDU. The
//! register value is taken from the last four bytes of the response frame as a
//! big-endian signed 32-bit integer. By default nothing else in the response is
//! checked, so a malformed frame of at least four bytes decodes whatever its
//! tail contains; [`FrameValidation::Strict`] rejects such frames instead.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of the MBAP header in bytes.
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest legal MBAP length field (unit id + 253-byte PDU).
pub const MAX_MBAP_LENGTH: u16 = 254;

/// Function code for "read holding registers".
pub const FUNCTION_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Set on the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// A KEBA register unit is one 32-bit value spread over two Modbus words.
pub const WORDS_PER_REGISTER: u16 = 2;

/// Size of a decoded register value on the wire.
pub const VALUE_LEN: usize = 4;

/// Decoding failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame too short: {len} bytes, need at least {needed}")]
    FrameTooShort { len: usize, needed: usize },

    #[error("Invalid protocol ID: {0}")]
    InvalidProtocolId(u16),

    #[error("Invalid MBAP length: {0}")]
    InvalidLength(u16),

    #[error("Transaction ID mismatch: expected {expected}, got {actual}")]
    TransactionMismatch { expected: u16, actual: u16 },

    #[error("Unit ID mismatch: expected {expected}, got {actual}")]
    UnitMismatch { expected: u8, actual: u8 },

    #[error("MBAP length announces {declared} bytes, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Modbus exception 0x{code:02X} for function 0x{function:02X}")]
    Exception { function: u8, code: u8 },

    #[error("Unexpected function code 0x{0:02X}")]
    UnexpectedFunction(u8),

    #[error("Unexpected byte count: expected {expected}, got {actual}")]
    ByteCount { expected: usize, actual: usize },
}

/// How much of a response frame is checked before decoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameValidation {
    /// Decode the trailing four bytes without further checks.
    #[default]
    Lenient,
    /// Check header, function code, exceptions and byte count first.
    Strict,
}

/// MBAP (Modbus Application Protocol) header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    /// Always 0 for Modbus.
    pub protocol_id: u16,
    /// Byte count of the unit id plus the PDU.
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn new(transaction_id: u16, unit_id: u8, pdu_len: u16) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: pdu_len + 1,
            unit_id,
        }
    }

    /// Append the header to `buf`.
    pub fn put(&self, buf: &mut BytesMut) {
        buf.put_u16(self.transaction_id);
        buf.put_u16(self.protocol_id);
        buf.put_u16(self.length);
        buf.put_u8(self.unit_id);
    }

    /// Parse the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < MBAP_HEADER_LEN {
            return Err(DecodeError::FrameTooShort {
                len: data.len(),
                needed: MBAP_HEADER_LEN,
            });
        }

        Ok(Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        })
    }

    /// Number of PDU bytes following the header.
    pub fn pdu_len(&self) -> usize {
        usize::from(self.length).saturating_sub(1)
    }
}

/// A single holding-register read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub address: u16,
    /// Register units to read (one unit = one 32-bit value).
    pub count: u16,
    /// How long to wait for the response.
    pub timeout: Duration,
}

impl ReadRequest {
    /// Quantity field on the wire, in 16-bit words.
    pub fn quantity(&self) -> u16 {
        self.count * WORDS_PER_REGISTER
    }

    /// Encode as a complete Modbus/TCP frame.
    ///
    /// One register unit is sent as quantity 2: a KEBA register holds a
    /// 32-bit value spanning two 16-bit words.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + 5);
        MbapHeader::new(self.transaction_id, self.unit_id, 5).put(&mut buf);
        buf.put_u8(FUNCTION_READ_HOLDING_REGISTERS);
        buf.put_u16(self.address);
        buf.put_u16(self.quantity());
        buf.freeze()
    }
}

/// A parsed read request, as seen by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFrame {
    pub header: MbapHeader,
    pub function: u8,
    pub address: u16,
    pub quantity: u16,
}

impl RequestFrame {
    pub fn parse(frame: &[u8]) -> Result<Self, DecodeError> {
        let header = MbapHeader::parse(frame)?;
        let pdu = &frame[MBAP_HEADER_LEN..];
        if pdu.len() < 5 {
            return Err(DecodeError::FrameTooShort {
                len: frame.len(),
                needed: MBAP_HEADER_LEN + 5,
            });
        }

        Ok(Self {
            header,
            function: pdu[0],
            address: u16::from_be_bytes([pdu[1], pdu[2]]),
            quantity: u16::from_be_bytes([pdu[3], pdu[4]]),
        })
    }
}

/// Encode a successful response carrying one 32-bit value.
pub fn encode_read_response(transaction_id: u16, unit_id: u8, value: i32) -> Bytes {
    let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + 2 + VALUE_LEN);
    MbapHeader::new(transaction_id, unit_id, 2 + VALUE_LEN as u16).put(&mut buf);
    buf.put_u8(FUNCTION_READ_HOLDING_REGISTERS);
    buf.put_u8(VALUE_LEN as u8);
    buf.put_i32(value);
    buf.freeze()
}

/// Encode an exception response.
pub fn encode_exception_response(transaction_id: u16, unit_id: u8, function: u8, code: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + 2);
    MbapHeader::new(transaction_id, unit_id, 2).put(&mut buf);
    buf.put_u8(function | EXCEPTION_FLAG);
    buf.put_u8(code);
    buf.freeze()
}

/// Decode the trailing four bytes of `frame` as a big-endian `i32`.
///
/// No structural validation happens here. Frames shorter than four bytes are
/// rejected rather than read out of bounds.
pub fn decode_register_value(frame: &[u8]) -> Result<i32, DecodeError> {
    if frame.len() < VALUE_LEN {
        return Err(DecodeError::FrameTooShort {
            len: frame.len(),
            needed: VALUE_LEN,
        });
    }

    let tail = &frame[frame.len() - VALUE_LEN..];
    Ok(i32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]))
}

/// Check that `frame` is a well-formed answer to `request`.
pub fn validate_response(frame: &[u8], request: &ReadRequest) -> Result<(), DecodeError> {
    let header = MbapHeader::parse(frame)?;

    if header.protocol_id != 0 {
        return Err(DecodeError::InvalidProtocolId(header.protocol_id));
    }
    if header.transaction_id != request.transaction_id {
        return Err(DecodeError::TransactionMismatch {
            expected: request.transaction_id,
            actual: header.transaction_id,
        });
    }
    if header.unit_id != request.unit_id {
        return Err(DecodeError::UnitMismatch {
            expected: request.unit_id,
            actual: header.unit_id,
        });
    }

    let pdu = &frame[MBAP_HEADER_LEN..];
    if pdu.len() != header.pdu_len() {
        return Err(DecodeError::LengthMismatch {
            declared: header.pdu_len(),
            actual: pdu.len(),
        });
    }

    let (function, rest) = match pdu.split_first() {
        Some(split) => split,
        None => {
            return Err(DecodeError::FrameTooShort {
                len: frame.len(),
                needed: MBAP_HEADER_LEN + 2,
            });
        }
    };

    if *function == FUNCTION_READ_HOLDING_REGISTERS | EXCEPTION_FLAG {
        return Err(DecodeError::Exception {
            function: FUNCTION_READ_HOLDING_REGISTERS,
            code: rest.first().copied().unwrap_or_default(),
        });
    }
    if *function != FUNCTION_READ_HOLDING_REGISTERS {
        return Err(DecodeError::UnexpectedFunction(*function));
    }

    let expected = usize::from(request.quantity()) * 2;
    let actual = rest.len().saturating_sub(1);
    let announced = rest.first().map(|count| usize::from(*count));
    if announced != Some(expected) || actual != expected {
        return Err(DecodeError::ByteCount { expected, actual });
    }

    Ok(())
}

/// Decode a response frame according to `validation`.
pub fn decode_response(
    frame: &[u8],
    request: &ReadRequest,
    validation: FrameValidation,
) -> Result<i32, DecodeError> {
    if validation == FrameValidation::Strict {
        validate_response(frame, request)?;
    }
    decode_register_value(frame)
}
