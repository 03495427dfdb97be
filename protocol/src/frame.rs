//! Frame codec for session transports.
//!
//! Two encodings share the wire: newline-delimited JSON (the default) and
//! a compact binary envelope with a 12-byte header:
//!
//! ```text
//! offset  size  field
//! 0       1     version
//! 1       1     flags (bit 0: compressed, bit 1: encrypted)
//! 2       2     message type (big-endian)
//! 4       4     payload size (big-endian)
//! 8       4     reserved
//! ```
//!
//! Payloads at or above the configured threshold are gzip-compressed on
//! write; readers decompress transparently based on the flag bit.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use mesh_core::error::{MeshError, Result};

use crate::message::{MessageKind, WireMessage};

/// Size of the binary frame header.
pub const FRAME_HEADER_LEN: usize = 12;

/// Current binary protocol version.
pub const FRAME_VERSION: u8 = 1;

/// Largest accepted payload, guarding against hostile size fields.
pub const MAX_FRAME_PAYLOAD: u32 = 16 * 1024 * 1024;

const FLAG_COMPRESSED: u8 = 0b0000_0001;
const FLAG_ENCRYPTED: u8 = 0b0000_0010;

/// Which encoding a session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// Newline-delimited JSON text
    #[default]
    Json,
    /// The binary envelope with optional gzip
    Binary,
}

/// Decoded header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub compressed: bool,
    pub encrypted: bool,
    pub kind: MessageKind,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0] = self.version;
        let mut flags = 0u8;
        if self.compressed {
            flags |= FLAG_COMPRESSED;
        }
        if self.encrypted {
            flags |= FLAG_ENCRYPTED;
        }
        buf[1] = flags;
        buf[2..4].copy_from_slice(&self.kind.as_u16().to_be_bytes());
        buf[4..8].copy_from_slice(&self.payload_len.to_be_bytes());
        // bytes 8..12 reserved, zero
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(MeshError::InvalidParams(format!(
                "frame header needs {FRAME_HEADER_LEN} bytes, got {}",
                buf.len()
            )));
        }
        let version = buf[0];
        if version != FRAME_VERSION {
            return Err(MeshError::InvalidParams(format!(
                "unsupported frame version {version}"
            )));
        }
        let flags = buf[1];
        let kind_raw = u16::from_be_bytes([buf[2], buf[3]]);
        let kind = MessageKind::from_u16(kind_raw)
            .ok_or_else(|| MeshError::InvalidParams(format!("unknown frame type {kind_raw}")))?;
        let payload_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(MeshError::InvalidParams(format!(
                "frame payload of {payload_len} bytes exceeds the limit"
            )));
        }
        Ok(Self {
            version,
            compressed: flags & FLAG_COMPRESSED != 0,
            encrypted: flags & FLAG_ENCRYPTED != 0,
            kind,
            payload_len,
        })
    }
}

/// Stateless codec configured with a compression threshold.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    pub compression_threshold: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            compression_threshold: 1024,
        }
    }
}

impl FrameCodec {
    pub fn new(compression_threshold: usize) -> Self {
        Self {
            compression_threshold,
        }
    }

    /// Encode as a binary frame, compressing above the threshold.
    pub fn encode_binary(&self, msg: &WireMessage) -> Result<Vec<u8>> {
        let raw = serde_json::to_vec(msg)
            .map_err(|e| MeshError::Internal(format!("message encode failed: {e}")))?;

        let (payload, compressed) = if raw.len() >= self.compression_threshold {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&raw)
                .and_then(|_| encoder.finish())
                .map(|out| (out, true))
                .map_err(|e| MeshError::Internal(format!("frame compression failed: {e}")))?
        } else {
            (raw, false)
        };

        let header = FrameHeader {
            version: FRAME_VERSION,
            compressed,
            encrypted: false,
            kind: msg.kind,
            payload_len: payload.len() as u32,
        };

        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode the payload that followed a [`FrameHeader`].
    pub fn decode_payload(&self, header: &FrameHeader, payload: &[u8]) -> Result<WireMessage> {
        if payload.len() != header.payload_len as usize {
            return Err(MeshError::InvalidParams(format!(
                "frame payload length mismatch: header says {}, got {}",
                header.payload_len,
                payload.len()
            )));
        }
        let bytes = if header.compressed {
            let mut decoder = GzDecoder::new(payload);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| MeshError::InvalidParams(format!("frame decompression failed: {e}")))?;
            out
        } else {
            payload.to_vec()
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| MeshError::InvalidParams(format!("malformed frame payload: {e}")))
    }

    /// Decode a whole binary frame.
    pub fn decode_binary(&self, frame: &[u8]) -> Result<WireMessage> {
        let header = FrameHeader::decode(frame)?;
        self.decode_payload(&header, &frame[FRAME_HEADER_LEN..])
    }

    /// Encode as one JSON line.
    pub fn encode_json(&self, msg: &WireMessage) -> Result<Vec<u8>> {
        let mut out = serde_json::to_vec(msg)
            .map_err(|e| MeshError::Internal(format!("message encode failed: {e}")))?;
        out.push(b'\n');
        Ok(out)
    }

    /// Decode one JSON line (without the trailing newline).
    pub fn decode_json(&self, line: &[u8]) -> Result<WireMessage> {
        serde_json::from_slice(line)
            .map_err(|e| MeshError::InvalidParams(format!("malformed message: {e}")))
    }

    /// Encode in the given format.
    pub fn encode(&self, msg: &WireMessage, format: WireFormat) -> Result<Vec<u8>> {
        match format {
            WireFormat::Json => self.encode_json(msg),
            WireFormat::Binary => self.encode_binary(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_roundtrip() {
        let header = FrameHeader {
            version: FRAME_VERSION,
            compressed: true,
            encrypted: false,
            kind: MessageKind::Request,
            payload_len: 512,
        };
        let decoded = FrameHeader::decode(&header.encode()).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn test_binary_roundtrip_small() {
        let codec = FrameCodec::default();
        let msg = WireMessage::request("r1", "ping", json!({}));
        let frame = codec.encode_binary(&msg).unwrap();

        let header = FrameHeader::decode(&frame).unwrap();
        assert!(!header.compressed);
        assert_eq!(header.kind, MessageKind::Request);

        let decoded = codec.decode_binary(&frame).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_binary_roundtrip_compressed() {
        let codec = FrameCodec::new(64);
        let msg = WireMessage::request("r1", "document.update", json!({"text": "a".repeat(8192)}));
        let frame = codec.encode_binary(&msg).unwrap();

        let header = FrameHeader::decode(&frame).unwrap();
        assert!(header.compressed);
        assert!(frame.len() < 8192);

        let decoded = codec.decode_binary(&frame).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_json_roundtrip() {
        let codec = FrameCodec::default();
        let msg = WireMessage::notification("task.assigned", json!({"task_id": "t1"}));
        let line = codec.encode_json(&msg).unwrap();
        assert_eq!(*line.last().unwrap(), b'\n');
        let decoded = codec.decode_json(&line[..line.len() - 1]).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_rejects_bad_version() {
        let mut frame = FrameCodec::default()
            .encode_binary(&WireMessage::request("r", "ping", json!({})))
            .unwrap();
        frame[0] = 9;
        assert!(FrameHeader::decode(&frame).is_err());
    }

    #[test]
    fn test_rejects_oversized_payload_claim() {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0] = FRAME_VERSION;
        buf[2..4].copy_from_slice(&1u16.to_be_bytes());
        buf[4..8].copy_from_slice(&(MAX_FRAME_PAYLOAD + 1).to_be_bytes());
        assert!(FrameHeader::decode(&buf).is_err());
    }

    #[test]
    fn test_rejects_truncated_header() {
        assert!(FrameHeader::decode(&[1, 0, 0]).is_err());
    }
}
