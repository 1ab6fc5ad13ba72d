//! The JSON-framed byte-stream codec (spec §4.4).
//!
//! Grounded in the teacher's `tokio_util::codec::{Decoder, FramedRead}` use
//! in `s5_core::blob::store::import_file`, but the framing rule itself is
//! rewritten around spec §4.4's brace-scan: while awaiting a JSON message,
//! scan for the next `}`, attempt to parse the prefix, and on failure
//! advance past that brace and retry — mirroring
//! `examples/original_source/prism/protocol/server.py::_get_valid_response`
//! — until either a message parses or the scanned prefix exceeds
//! [`MAX_QUERY_SIZE`](crate::wire::MAX_QUERY_SIZE) (`RequestTooLarge`).
//!
//! Once a request has put the connection into a blob-receiving state, the
//! codec is switched with [`FrameCodec::begin_blob`] so subsequent bytes are
//! handed back as raw [`InboundFrame::BlobChunk`]s capped at the declared
//! length; any bytes past that boundary are left in the buffer for the next
//! JSON parse, exactly like spec §4.4's "remaining bytes are the start of
//! the next message" rule.

use bytes::{Bytes, BytesMut};
use prism_core::error::ProtocolError;
use serde_json::Value;
use tokio_util::codec::Decoder;

use crate::wire::MAX_QUERY_SIZE;

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Json(Value),
    BlobChunk(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    AwaitingJson,
    ReceivingBlob { remaining: u64 },
}

/// Stateful codec for one connection. `Decoder::decode` alone cannot carry
/// the "are we mid-blob" bit, since that's driven by request/response
/// business logic, not by the bytes themselves — so the state machine
/// using this codec calls [`FrameCodec::begin_blob`] right after deciding
/// to accept a blob, and the codec reverts to JSON framing on its own once
/// `remaining` reaches zero.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    mode: Mode,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            mode: Mode::AwaitingJson,
        }
    }

    /// Switches the codec into blob-receiving mode for exactly `length`
    /// bytes. Must be called once per accepted blob/SD-blob transfer.
    pub fn begin_blob(&mut self, length: u64) {
        self.mode = Mode::ReceivingBlob { remaining: length };
    }

    pub fn is_receiving_blob(&self) -> bool {
        matches!(self.mode, Mode::ReceivingBlob { .. })
    }
}

impl Decoder for FrameCodec {
    type Item = InboundFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.mode {
                Mode::ReceivingBlob { remaining } => {
                    if remaining == 0 {
                        self.mode = Mode::AwaitingJson;
                        continue;
                    }
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(src.len() as u64) as usize;
                    let chunk = src.split_to(take).freeze();
                    self.mode = Mode::ReceivingBlob {
                        remaining: remaining - take as u64,
                    };
                    return Ok(Some(InboundFrame::BlobChunk(chunk)));
                }
                Mode::AwaitingJson => {
                    let Some(brace_pos) = src.iter().position(|&b| b == b'}') else {
                        if src.len() > MAX_QUERY_SIZE {
                            return Err(ProtocolError::RequestTooLarge);
                        }
                        return Ok(None);
                    };
                    let consumed = brace_pos + 1;
                    match serde_json::from_slice::<Value>(&src[..consumed]) {
                        Ok(value) => {
                            src.split_to(consumed);
                            return Ok(Some(InboundFrame::Json(value)));
                        }
                        Err(_) if consumed > MAX_QUERY_SIZE => {
                            return Err(ProtocolError::RequestTooLarge);
                        }
                        Err(_) => {
                            // Not yet a valid prefix; drop the scanned byte
                            // and keep looking for the next `}`.
                            src.split_to(1);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_single_json_message() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&br#"{"version":1}"#[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, InboundFrame::Json(json!({"version": 1})));
        assert!(buf.is_empty());
    }

    #[test]
    fn leaves_trailing_bytes_for_next_parse() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&br#"{"version":1}{"blob_hash":"ab"}"#[..]);
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first, InboundFrame::Json(json!({"version": 1})));
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second, InboundFrame::Json(json!({"blob_hash": "ab"})));
    }

    #[test]
    fn returns_none_on_incomplete_message() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&br#"{"version":"#[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn rejects_oversized_message() {
        let mut codec = FrameCodec::new();
        let huge = "x".repeat(MAX_QUERY_SIZE + 10);
        let mut buf = BytesMut::from(huge.as_bytes());
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::RequestTooLarge)
        ));
    }

    #[test]
    fn skips_stray_closing_brace_before_valid_json() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&br#"}{"version":1}"#[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, InboundFrame::Json(json!({"version": 1})));
    }

    #[test]
    fn blob_chunk_capped_at_declared_length_and_resumes_json() {
        let mut codec = FrameCodec::new();
        codec.begin_blob(4);
        let mut buf = BytesMut::from(&b"abcd{\"blob_hash\":\"x\"}"[..]);
        let chunk = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(chunk, InboundFrame::BlobChunk(Bytes::from_static(b"abcd")));
        assert!(!codec.is_receiving_blob());
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, InboundFrame::Json(json!({"blob_hash": "x"})));
    }

    #[test]
    fn blob_chunk_split_across_reads() {
        let mut codec = FrameCodec::new();
        codec.begin_blob(4);
        let mut buf = BytesMut::from(&b"ab"[..]);
        let chunk = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(chunk, InboundFrame::BlobChunk(Bytes::from_static(b"ab")));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"cd");
        let chunk2 = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(chunk2, InboundFrame::BlobChunk(Bytes::from_static(b"cd")));
        assert!(!codec.is_receiving_blob());
    }
}
