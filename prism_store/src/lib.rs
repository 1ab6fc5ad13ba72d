//! On-disk, hash-verified blob file storage (spec §4.1, component C1).
//!
//! Blobs live as flat files named by their hex hash directly under a
//! configured blob directory. Writers append to a hash-suffixed temp file
//! while tracking a running SHA-384 digest and byte count; on reaching the
//! declared length the temp file is atomically renamed to its canonical
//! name. This mirrors `s5_store_local::LocalStore`'s path resolution and
//! `tokio::fs`-based I/O, combined with `s5_core::blob::store::BlobStore`'s
//! hash-while-writing + atomic-rename import pattern — reworked around
//! SHA-384 and spec §4.1's exact-length completion signal instead of a
//! generic `Stream` import.

use std::path::{Path, PathBuf};

use prism_core::Hash;
use rand::Rng;
use sha2::{Digest, Sha384};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub use prism_core::error::{BlobReadError, BlobWriteError};

/// Outcome of a successful blob write (the temp file has already been
/// renamed to its canonical path when this is returned).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    pub hash: Hash,
    pub length: u64,
}

/// Root of the flat blob directory (spec §6 `blob directory`, default
/// `~/.prism`).
#[derive(Debug, Clone)]
pub struct BlobFileStore {
    root: PathBuf,
}

impl BlobFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn canonical_path(&self, hash: &Hash) -> PathBuf {
        self.root.join(hash.to_hex())
    }

    /// True if a validated, committed file for `hash` exists.
    pub async fn contains(&self, hash: &Hash) -> bool {
        tokio::fs::try_exists(self.canonical_path(hash))
            .await
            .unwrap_or(false)
    }

    /// Opens a writer for `hash`, expecting exactly `expected_length` bytes.
    ///
    /// Each writer uses a unique, hash-suffixed temp filename so that two
    /// concurrent writers for the same hash cannot corrupt each other's
    /// data (spec §5's option (ii)): the first to finalize renames into the
    /// canonical slot, and any later finalizer for the same hash simply
    /// discards its own temp file and reports success, since the content is
    /// by definition identical (same hash).
    pub async fn open_for_writing(
        &self,
        hash: Hash,
        expected_length: u64,
    ) -> Result<BlobWriter, BlobWriteError> {
        self.ensure_dir().await?;
        let suffix: u64 = rand::rng().random();
        let temp_path = self
            .root
            .join(format!(".tmp-{}-{:016x}", hash.to_hex(), suffix));
        let file = File::create(&temp_path).await?;
        Ok(BlobWriter {
            store_root: self.root.clone(),
            hash,
            expected_length,
            written: 0,
            hasher: Sha384::new(),
            temp_path,
            file: Some(file),
            finished: false,
        })
    }

    /// Opens a streaming reader over the canonical file for `hash`.
    ///
    /// Returns [`BlobReadError::NotFound`] if the file is missing or was
    /// never validated (in this store, those are the same condition: only
    /// committed writes ever occupy the canonical path).
    pub async fn open_for_reading(&self, hash: &Hash) -> Result<File, BlobReadError> {
        match File::open(self.canonical_path(hash)).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BlobReadError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads an entire committed blob into memory (used by the outbound
    /// client, which needs the whole file to stream it to a downstream
    /// host).
    pub async fn read_to_vec(&self, hash: &Hash) -> Result<Vec<u8>, BlobReadError> {
        let mut file = self.open_for_reading(hash).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    /// Deletes the canonical file for `hash`, if present. Valid per spec
    /// only when the blob's index record shows an empty host; the store
    /// itself does not enforce that precondition (callers do).
    pub async fn delete(&self, hash: &Hash) -> std::io::Result<()> {
        match tokio::fs::remove_file(self.canonical_path(hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Lists filenames directly under the blob directory that parse as a
    /// valid hash (used by the startup reconciler, C9). Non-hash filenames
    /// (including temp files, which start with `.tmp-`) are skipped.
    pub async fn list_hashes(&self) -> std::io::Result<Vec<Hash>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str()
                && let Ok(hash) = Hash::from_hex(name)
            {
                out.push(hash);
            }
        }
        Ok(out)
    }
}

/// Write handle for a single blob upload in progress.
///
/// Call [`BlobWriter::write`] with each chunk received from the wire. Once
/// `expected_length` bytes have been absorbed, the writer finalizes and
/// returns `Ok(Committed)`. Any byte written past `expected_length` fails
/// the whole write with [`BlobWriteError::Overrun`].
pub struct BlobWriter {
    store_root: PathBuf,
    hash: Hash,
    expected_length: u64,
    written: u64,
    hasher: Sha384,
    temp_path: PathBuf,
    file: Option<File>,
    finished: bool,
}

impl BlobWriter {
    /// Feeds `buf` into the writer. Returns `Ok(Some(Committed))` once the
    /// declared length has been reached and the file has been verified and
    /// published; `Ok(None)` if more bytes are still expected.
    pub async fn write(&mut self, buf: &[u8]) -> Result<Option<Committed>, BlobWriteError> {
        if self.finished {
            return Err(BlobWriteError::Overrun {
                expected: self.expected_length,
                extra: buf.len() as u64,
            });
        }

        let remaining = self.expected_length - self.written;
        if buf.len() as u64 > remaining {
            self.abort().await;
            return Err(BlobWriteError::Overrun {
                expected: self.expected_length,
                extra: buf.len() as u64 - remaining,
            });
        }

        let file = self.file.as_mut().expect("file present while not finished");
        file.write_all(buf).await?;
        self.hasher.update(buf);
        self.written += buf.len() as u64;

        if self.written < self.expected_length {
            return Ok(None);
        }

        self.finalize().await.map(Some)
    }

    /// Called when the connection drops before `expected_length` bytes were
    /// received. Cleans up the temp file; the caller is responsible for
    /// reporting [`BlobWriteError::Truncated`] on its own ack/log path.
    pub async fn abort(&mut self) {
        self.finished = true;
        drop(self.file.take());
        let _ = tokio::fs::remove_file(&self.temp_path).await;
    }

    /// Bytes received so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn expected_length(&self) -> u64 {
        self.expected_length
    }

    async fn finalize(&mut self) -> Result<Committed, BlobWriteError> {
        self.finished = true;
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }

        let digest = self.hasher.clone().finalize();
        let mut computed = [0u8; prism_core::HASH_LEN];
        computed.copy_from_slice(&digest);
        let computed_hash = Hash::from_bytes(computed);

        if computed_hash != self.hash {
            let _ = tokio::fs::remove_file(&self.temp_path).await;
            return Err(BlobWriteError::HashMismatch {
                declared: self.hash.to_hex(),
                computed: computed_hash.to_hex(),
            });
        }

        let final_path = self.store_root.join(self.hash.to_hex());
        if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
            // Another writer already published this hash; our content is
            // identical by definition, so discard our temp copy.
            let _ = tokio::fs::remove_file(&self.temp_path).await;
        } else {
            tokio::fs::rename(&self.temp_path, &final_path).await?;
        }

        Ok(Committed {
            hash: self.hash,
            length: self.written,
        })
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if !self.finished {
            // Best-effort synchronous cleanup; connection-loss paths should
            // prefer calling `abort()` explicitly so cleanup can be awaited
            // and logged.
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}
