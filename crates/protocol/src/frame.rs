//! Framing codec.
//!
//! # Wire format
//!
//! ```text
//! CONTROL (text frame):  JSON object with a "type" discriminant
//! DATA (binary frame):   [1 byte: 0xFF tag]
//!                        [4 bytes LE: flat_index]
//!                        [4 bytes LE: payload_length]
//!                        [payload_length bytes: sub-chunk data]
//! ```
//!
//! The tag byte makes discrimination total: a binary frame without it is
//! malformed rather than "probably data".

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

use crate::ControlFrame;
use crate::constants::{DATA_FRAME_OVERHEAD, DATA_FRAME_TAG};

/// Errors from frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("binary frame too short: {0} bytes (need at least {DATA_FRAME_OVERHEAD})")]
    ShortHeader(usize),

    #[error("binary frame missing tag byte (got {0:#04x})")]
    BadTag(u8),

    #[error("payload length mismatch: header says {expected}, frame carries {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("payload of {len} bytes exceeds the {max}-byte sub-chunk limit")]
    PayloadTooLarge { len: usize, max: u64 },

    #[error("malformed control frame: {0}")]
    Control(String),

    #[error("malformed base64 payload: {0}")]
    Base64(String),
}

/// A binary sub-chunk payload frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub flat_index: u32,
    pub payload: Vec<u8>,
}

/// Either family of frame sharing the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Control(ControlFrame),
    Data(DataFrame),
}

impl WireFrame {
    /// Bytes this frame occupies once encoded. Used for send-buffer
    /// accounting.
    pub fn wire_len(&self) -> usize {
        match self {
            // Control frames are small; re-serializing for the length is
            // cheaper than threading encoded bytes around.
            WireFrame::Control(c) => encode_control(c).len(),
            WireFrame::Data(d) => DATA_FRAME_OVERHEAD + d.payload.len(),
        }
    }
}

impl From<ControlFrame> for WireFrame {
    fn from(frame: ControlFrame) -> Self {
        WireFrame::Control(frame)
    }
}

impl From<DataFrame> for WireFrame {
    fn from(frame: DataFrame) -> Self {
        WireFrame::Data(frame)
    }
}

/// Serializes a control frame to its textual wire form.
pub fn encode_control(frame: &ControlFrame) -> String {
    // The enum serializes infallibly: no maps with non-string keys, no
    // non-finite floats.
    serde_json::to_string(frame).unwrap_or_default()
}

/// Parses a textual wire record into a control frame.
pub fn decode_control(text: &str) -> Result<ControlFrame, FramingError> {
    serde_json::from_str(text).map_err(|e| FramingError::Control(e.to_string()))
}

impl DataFrame {
    /// Encodes the frame: tag byte, little-endian header, payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DATA_FRAME_OVERHEAD + self.payload.len());
        buf.push(DATA_FRAME_TAG);
        buf.extend_from_slice(&self.flat_index.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decodes a binary wire frame.
    ///
    /// `max_payload` bounds the accepted payload length (normally the
    /// session's sub-chunk size).
    pub fn decode(bytes: &[u8], max_payload: u64) -> Result<Self, FramingError> {
        if bytes.len() < DATA_FRAME_OVERHEAD {
            return Err(FramingError::ShortHeader(bytes.len()));
        }
        if bytes[0] != DATA_FRAME_TAG {
            return Err(FramingError::BadTag(bytes[0]));
        }

        let flat_index = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let payload_len = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;

        if payload_len as u64 > max_payload {
            return Err(FramingError::PayloadTooLarge {
                len: payload_len,
                max: max_payload,
            });
        }

        let payload = &bytes[DATA_FRAME_OVERHEAD..];
        if payload.len() != payload_len {
            return Err(FramingError::LengthMismatch {
                expected: payload_len,
                got: payload.len(),
            });
        }

        Ok(Self {
            flat_index,
            payload: payload.to_vec(),
        })
    }

    /// Encodes the frame as a JSON record with a base64 payload.
    ///
    /// Fallback for transports that cannot carry binary; the binary
    /// encoding is the primary scheme.
    pub fn encode_text(&self) -> String {
        let record = Base64DataRecord {
            flat_index: self.flat_index,
            payload: STANDARD.encode(&self.payload),
        };
        serde_json::to_string(&record).unwrap_or_default()
    }

    /// Decodes the base64 text fallback form.
    pub fn decode_text(text: &str, max_payload: u64) -> Result<Self, FramingError> {
        let record: Base64DataRecord =
            serde_json::from_str(text).map_err(|e| FramingError::Control(e.to_string()))?;
        let payload = STANDARD
            .decode(&record.payload)
            .map_err(|e| FramingError::Base64(e.to_string()))?;
        if payload.len() as u64 > max_payload {
            return Err(FramingError::PayloadTooLarge {
                len: payload.len(),
                max: max_payload,
            });
        }
        Ok(Self {
            flat_index: record.flat_index,
            payload,
        })
    }
}

/// Text-fallback shape: `{"type":"data-frame","flatIndex":n,"payload":"..."}`.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename = "data-frame", rename_all = "camelCase")]
struct Base64DataRecord {
    flat_index: u32,
    payload: String,
}
