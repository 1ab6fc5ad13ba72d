//! Blob and stream-descriptor ("SD blob") data model.
//!
//! See spec §3: a blob is identified by `hash == hex(SHA-384(payload))`. An
//! SD blob is an ordinary blob whose payload happens to be JSON listing
//! member blob hashes; membership is established purely by parsing that
//! JSON, not by any cryptographic relationship to the SD blob's own hash.

use serde::{Deserialize, Serialize};

use crate::hash::Hash;

/// Identifies a blob by content hash and declared length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId {
    pub hash: Hash,
    pub length: u64,
}

impl BlobId {
    pub fn new(hash: Hash, length: u64) -> Self {
        Self { hash, length }
    }
}

/// One entry in an SD blob's `blobs` array.
///
/// Trailing entries with `length == 0` and no `blob_hash` are padding and
/// are dropped by [`SdBlobManifest::parse`].
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SdBlobEntry {
    #[serde(default)]
    pub blob_hash: Option<String>,
    pub length: u64,
}

/// Parsed contents of an SD blob's JSON payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SdBlobManifest {
    pub blobs: Vec<SdBlobEntry>,
}

#[derive(thiserror::Error, Debug)]
pub enum SdBlobError {
    #[error("SD blob payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("SD blob manifest has no member blobs")]
    NoMembers,
    #[error("SD blob manifest contains an invalid member hash: {0}")]
    InvalidMemberHash(String),
}

impl SdBlobManifest {
    /// Parses an SD blob's raw payload and returns the validated, non-empty
    /// set of member hashes (in declared order, duplicates preserved).
    ///
    /// Per spec §3, entries with `length == 0` and no `blob_hash` are
    /// ignored; every other entry must carry a valid hash or parsing fails.
    pub fn parse(payload: &[u8]) -> Result<Vec<Hash>, SdBlobError> {
        let manifest: SdBlobManifest = serde_json::from_slice(payload)?;
        let mut members = Vec::with_capacity(manifest.blobs.len());
        for entry in &manifest.blobs {
            match &entry.blob_hash {
                Some(h) => {
                    let hash = Hash::from_hex(h)
                        .map_err(|_| SdBlobError::InvalidMemberHash(h.clone()))?;
                    members.push(hash);
                }
                None if entry.length == 0 => {
                    // Trailing padding entry; ignored per spec.
                }
                None => return Err(SdBlobError::InvalidMemberHash(String::new())),
            }
        }
        if members.is_empty() {
            return Err(SdBlobError::NoMembers);
        }
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_members_and_drops_trailing_padding() {
        let hash = Hash::digest(b"member");
        let payload = serde_json::json!({
            "blobs": [
                {"blob_hash": hash.to_hex(), "length": 10},
                {"length": 0},
            ]
        });
        let members = SdBlobManifest::parse(payload.to_string().as_bytes()).unwrap();
        assert_eq!(members, vec![hash]);
    }

    #[test]
    fn rejects_manifest_with_no_members() {
        let payload = serde_json::json!({"blobs": [{"length": 0}]});
        assert!(matches!(
            SdBlobManifest::parse(payload.to_string().as_bytes()),
            Err(SdBlobError::NoMembers)
        ));
    }

    #[test]
    fn rejects_invalid_json() {
        assert!(SdBlobManifest::parse(b"not json").is_err());
    }
}
