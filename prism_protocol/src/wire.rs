//! Wire message schemas (spec §6). Every message is a UTF-8 JSON object;
//! these types are the `serde` mirror of the original Python's loose
//! dictionaries in `examples/original_source/prism/protocol/{server,client}.py`.

use prism_core::Hash;
use serde::{Deserialize, Serialize};

/// Handshake, sent by both sides first. `version` is `0` or `1`; `1`
/// additionally supports SD-blob/stream exchanges (spec Glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub version: i64,
}

pub const REFLECTOR_V1: i64 = 0;
pub const REFLECTOR_V2: i64 = 1;

/// `{"sd_blob_hash": ..., "sd_blob_size": ...}` (client -> server).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SdBlobRequest {
    pub sd_blob_hash: Hash,
    pub sd_blob_size: u64,
}

/// `{"send_sd_blob": bool, "needed_blobs": [...] }` (server -> client).
/// `needed_blobs` is omitted entirely when the server does not yet know
/// the SD blob, distinct from being present-but-empty (spec §9 open
/// question).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdBlobResponse {
    pub send_sd_blob: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needed_blobs: Option<Vec<Hash>>,
}

/// `{"blob_hash": ..., "blob_size": ...}` (client -> server).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlobRequest {
    pub blob_hash: Hash,
    pub blob_size: u64,
}

/// `{"send_blob": bool}` (server -> client).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlobResponse {
    pub send_blob: bool,
}

/// `{"received_blob": bool}` (server -> client).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReceivedBlobAck {
    pub received_blob: bool,
}

/// `{"received_sd_blob": bool}` (server -> client).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReceivedSdBlobAck {
    pub received_sd_blob: bool,
}

/// Maximum size, in bytes, of a single JSON control message (spec §6).
pub const MAX_QUERY_SIZE: usize = 200;

/// Default TCP port for the listener (spec §6).
pub const DEFAULT_PORT: u16 = 5566;
