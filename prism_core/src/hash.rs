//! The content hash used throughout Prism (SHA-384, 48 bytes / 96 hex chars).

use std::{borrow::Borrow, fmt, str::FromStr};

use sha2::{Digest, Sha384};

/// Length in bytes of a [`Hash`].
pub const HASH_LEN: usize = 48;

/// Length in hex characters of a [`Hash`]'s string form.
pub const HASH_HEX_LEN: usize = HASH_LEN * 2;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidHash {
    #[error("hash has wrong length: expected {HASH_HEX_LEN} hex chars, got {0}")]
    WrongLength(usize),
    #[error("hash is not valid lowercase hex: {0}")]
    NotHex(String),
}

/// A content hash: the hex of a blob's SHA-384 digest.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// Computes the hash of the provided bytes.
    pub fn digest(buf: impl AsRef<[u8]>) -> Self {
        let digest = Sha384::digest(buf.as_ref());
        let mut bytes = [0u8; HASH_LEN];
        bytes.copy_from_slice(&digest);
        Hash(bytes)
    }

    /// Builds a `Hash` from its raw bytes.
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Hash(bytes)
    }

    /// Parses a `Hash` from a lowercase hex string of exactly [`HASH_HEX_LEN`] chars.
    pub fn from_hex(s: &str) -> Result<Self, InvalidHash> {
        if s.len() != HASH_HEX_LEN {
            return Err(InvalidHash::WrongLength(s.len()));
        }
        let mut bytes = [0u8; HASH_LEN];
        data_encoding::HEXLOWER
            .decode_mut(s.as_bytes(), &mut bytes)
            .map_err(|_| InvalidHash::NotHex(s.to_string()))?;
        Ok(Hash(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }

    /// First five bytes as hex, for log lines (mirrors the original
    /// Python's `blob_hash[:8]` truncated log convention).
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..5])
    }

    /// Verifies that `buf` hashes to `self`.
    pub fn verify(&self, buf: impl AsRef<[u8]>) -> bool {
        Hash::digest(buf) == *self
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8]> for Hash {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8; HASH_LEN]> for Hash {
    fn borrow(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl From<[u8; HASH_LEN]> for Hash {
    fn from(value: [u8; HASH_LEN]) -> Self {
        Hash(value)
    }
}

impl From<Hash> for [u8; HASH_LEN] {
    fn from(value: Hash) -> Self {
        value.0
    }
}

impl FromStr for Hash {
    type Err = InvalidHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Hash::from_hex(s)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash").field(&self.to_hex()).finish()
    }
}

impl serde::Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
