//! The concept-level error taxonomy from spec §7.
//!
//! These enums classify *what went wrong*; deciding whether that closes a
//! connection, sends a negative ack, or triggers a retry is a decision made
//! by the caller (protocol state machine, worker, index), not by the enum.

use crate::hash::InvalidHash;

/// Errors that can occur while writing or finalizing a blob file (C1).
#[derive(thiserror::Error, Debug)]
pub enum BlobWriteError {
    #[error("hash mismatch: declared {declared}, computed {computed}")]
    HashMismatch { declared: String, computed: String },
    #[error("length mismatch: declared {declared}, received {received}")]
    LengthMismatch { declared: u64, received: u64 },
    #[error("connection dropped after {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },
    #[error("writer received {extra} bytes past the declared length {expected}")]
    Overrun { expected: u64, extra: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors reading back a committed blob (C1).
#[derive(thiserror::Error, Debug)]
pub enum BlobReadError {
    #[error("blob not found or never validated")]
    NotFound,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the wire-level framing and request validation (C4).
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    InvalidHash(#[from] InvalidHash),
    #[error("request exceeds maximum query size")]
    RequestTooLarge,
    #[error("malformed request: {0}")]
    InvalidRequest(String),
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(i64),
    #[error("unexpected message for current state: {0}")]
    UnexpectedMessage(&'static str),
    #[error("connection lost")]
    ConnectionLost,
    #[error("idle timeout")]
    IdleTimeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors selecting a downstream host (C3).
#[derive(thiserror::Error, Debug)]
pub enum HostSelectError {
    #[error("no configured host has spare capacity")]
    NoHostAvailable,
}

/// Errors surfaced by the index backend (C2).
#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    #[error(transparent)]
    InvalidHash(#[from] InvalidHash),
    #[error("index backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("index backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Errors from the outbound client connection / job execution (C5, C7).
#[derive(thiserror::Error, Debug)]
pub enum OutboundError {
    #[error("failed to connect: {0}")]
    ConnectTimeout(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("downstream host rejected blob {0}")]
    Rejected(String),
    #[error("job timed out")]
    JobTimeout,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
