//! Inbound protocol (C4): the per-connection state machine that receives
//! blobs and SD blobs from uploaders (spec §4.4).
//!
//! Grounded in `examples/original_source/prism/protocol/server.py`'s
//! `ReflectorServerProtocol`: the same state fields (`received_handshake`,
//! `receiving_blob`, `incoming_blob`) reimplemented as a typed `State` enum
//! instead of loose booleans, driven by [`FrameCodec`] frames instead of
//! `dataReceived`/`_get_valid_response`.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::BytesMut;
use prism_core::error::{BlobWriteError, ProtocolError};
use prism_core::{Hash, SdBlobManifest};
use prism_index::{Index, IndexError};
use prism_store::{BlobFileStore, BlobWriter};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use crate::framing::{FrameCodec, InboundFrame};

/// Idle timeout for an inbound connection (spec §4.4, §5).
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline after connection loss for in-flight blob completions to
/// resolve before the connection-close enqueue logic gives up (spec §4.4).
pub const COMPLETION_DEADLINE: Duration = Duration::from_secs(60);

/// Errors surfaced while driving one inbound connection. Distinguishes
/// protocol-level problems (close the connection) from index-backend
/// problems (same effect here, but logged and categorized separately).
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Receiving side's notion of a job to submit once this connection closes.
/// Implemented by `prism_node`'s durable queue; kept as a trait here so
/// `prism_protocol` has no dependency on the queue or config crates (the
/// one-way-ownership rule from spec §9's design notes).
#[async_trait]
pub trait ForwardEnqueuer: Send + Sync {
    async fn enqueue_forward_blob(&self, hash: Hash);
    async fn enqueue_forward_stream(&self, sd_hash: Hash);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHandshake,
    Idle,
    ReceivingBlob { hash: Hash, is_sd: bool },
    Closed,
}

/// Drives one accepted connection to completion. Generic over the stream
/// type so tests can exercise it over an in-memory duplex instead of a
/// real socket.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: String,
    store: Arc<BlobFileStore>,
    index: Arc<dyn Index>,
    enqueuer: Arc<dyn ForwardEnqueuer>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session::new(peer);
    let mut read_buf = BytesMut::with_capacity(4096);

    'outer: loop {
        loop {
            let frame = session.codec.decode(&mut read_buf)?;
            let Some(frame) = frame else { break };
            session.handle_frame(frame, &store, &index, &mut stream).await?;
            if session.state == State::Closed {
                break 'outer;
            }
        }

        match tokio::time::timeout(IDLE_TIMEOUT, stream.read_buf(&mut read_buf)).await {
            Err(_) => {
                debug!(peer = %session.peer, "inbound connection idle timeout");
                return Err(ProtocolError::IdleTimeout.into());
            }
            Ok(Ok(0)) => {
                // Peer closed the connection. If a blob was mid-flight,
                // it's truncated: abort the writer and remove the temp
                // file rather than leaving it to `Drop`'s silent cleanup.
                if let Some(mut writer) = session.writer.take() {
                    let received = writer.written();
                    let expected = writer.expected_length();
                    writer.abort().await;
                    warn!(
                        peer = %session.peer,
                        error = %BlobWriteError::Truncated { received, expected },
                        "inbound connection closed mid-blob"
                    );
                }
                break;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(ProtocolError::Io(e).into()),
        }
    }

    match tokio::time::timeout(COMPLETION_DEADLINE, session.finalize(&index, &enqueuer)).await {
        Ok(()) => {}
        Err(_) => warn!(peer = %session.peer, "connection-close enqueue deadline exceeded"),
    }
    Ok(())
}

struct Session {
    peer: String,
    codec: FrameCodec,
    state: State,
    writer: Option<BlobWriter>,
    sd_hash_this_conn: Option<Hash>,
    plain_completed: Vec<Hash>,
    enqueued_stream: bool,
}

impl Session {
    fn new(peer: String) -> Self {
        Self {
            peer,
            codec: FrameCodec::new(),
            state: State::AwaitingHandshake,
            writer: None,
            sd_hash_this_conn: None,
            plain_completed: Vec::new(),
            enqueued_stream: false,
        }
    }

    async fn handle_frame<W>(
        &mut self,
        frame: InboundFrame,
        store: &Arc<BlobFileStore>,
        index: &Arc<dyn Index>,
        out: &mut W,
    ) -> Result<(), SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        match frame {
            InboundFrame::Json(value) => self.handle_json(value, store, index, out).await,
            InboundFrame::BlobChunk(bytes) => self.handle_blob_chunk(&bytes, store, index, out).await,
        }
    }

    async fn handle_json<W>(
        &mut self,
        value: Value,
        store: &Arc<BlobFileStore>,
        index: &Arc<dyn Index>,
        out: &mut W,
    ) -> Result<(), SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let obj = value
            .as_object()
            .ok_or_else(|| ProtocolError::InvalidRequest("expected a JSON object".into()))?;

        match self.state {
            State::AwaitingHandshake => {
                let Some(version) = obj.get("version").and_then(Value::as_i64) else {
                    return Err(ProtocolError::InvalidRequest("missing version".into()).into());
                };
                if version != 0 && version != 1 {
                    return Err(ProtocolError::UnsupportedVersion(version).into());
                }
                self.state = State::Idle;
                send_json(out, &json!({ "version": version })).await?;
                Ok(())
            }
            State::Idle => {
                if obj.contains_key("sd_blob_hash") && obj.contains_key("sd_blob_size") {
                    self.handle_sd_request(value, store, index, out).await
                } else if obj.contains_key("blob_hash") && obj.contains_key("blob_size") {
                    self.handle_blob_request(value, store, index, out).await
                } else {
                    Err(ProtocolError::UnexpectedMessage("idle: expected sd_blob or blob request").into())
                }
            }
            State::ReceivingBlob { .. } => {
                Err(ProtocolError::UnexpectedMessage("json received while receiving a blob").into())
            }
            State::Closed => Ok(()),
        }
    }

    async fn handle_sd_request<W>(
        &mut self,
        value: Value,
        store: &Arc<BlobFileStore>,
        index: &Arc<dyn Index>,
        out: &mut W,
    ) -> Result<(), SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let hash = parse_hash_field(&value, "sd_blob_hash")?;
        let size = parse_u64_field(&value, "sd_blob_size")?;

        match index.needed_blobs_for_stream(hash).await? {
            None => {
                let writer = store.open_for_writing(hash, size).await.map_err(to_protocol_err)?;
                self.writer = Some(writer);
                self.state = State::ReceivingBlob { hash, is_sd: true };
                self.codec.begin_blob(size);
                send_json(out, &json!({ "send_sd_blob": true })).await?;
            }
            Some(needed) => {
                send_json(
                    out,
                    &json!({ "send_sd_blob": false, "needed_blobs": needed }),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn handle_blob_request<W>(
        &mut self,
        value: Value,
        store: &Arc<BlobFileStore>,
        index: &Arc<dyn Index>,
        out: &mut W,
    ) -> Result<(), SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let hash = parse_hash_field(&value, "blob_hash")?;
        let size = parse_u64_field(&value, "blob_size")?;

        let already_have = index.blob_forwarded(hash).await? || index.blob_exists(hash).await?;
        if already_have {
            send_json(out, &json!({ "send_blob": false })).await?;
            return Ok(());
        }

        let writer = store.open_for_writing(hash, size).await.map_err(to_protocol_err)?;
        self.writer = Some(writer);
        self.state = State::ReceivingBlob { hash, is_sd: false };
        self.codec.begin_blob(size);
        send_json(out, &json!({ "send_blob": true })).await?;
        Ok(())
    }

    async fn handle_blob_chunk<W>(
        &mut self,
        chunk: &[u8],
        store: &Arc<BlobFileStore>,
        index: &Arc<dyn Index>,
        out: &mut W,
    ) -> Result<(), SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let State::ReceivingBlob { hash, is_sd } = self.state else {
            return Err(ProtocolError::UnexpectedMessage("blob bytes outside ReceivingBlob").into());
        };
        let Some(writer) = self.writer.as_mut() else {
            return Err(ProtocolError::UnexpectedMessage("no writer open").into());
        };

        match writer.write(chunk).await {
            Ok(Some(committed)) => {
                self.writer = None;
                self.state = State::Idle;
                if is_sd {
                    let ack = self.finish_sd_blob(hash, committed.length, store, index).await?;
                    send_json(out, &json!({ "received_sd_blob": ack })).await?;
                } else {
                    index
                        .record_blob_completed(hash, committed.length, SystemTime::now())
                        .await?;
                    self.plain_completed.push(hash);
                    info!(peer = %self.peer, hash = %hash.fmt_short(), "received blob");
                    send_json(out, &json!({ "received_blob": true })).await?;
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                self.writer = None;
                self.state = State::Idle;
                warn!(peer = %self.peer, hash = %hash.fmt_short(), error = %err, "blob write failed");
                let key = if is_sd { "received_sd_blob" } else { "received_blob" };
                send_json(out, &json!({ key: false })).await?;
                Ok(())
            }
        }
    }

    async fn finish_sd_blob(
        &mut self,
        hash: Hash,
        length: u64,
        store: &Arc<BlobFileStore>,
        index: &Arc<dyn Index>,
    ) -> Result<bool, SessionError> {
        let payload = match store.read_to_vec(&hash).await {
            Ok(payload) => payload,
            Err(_) => return Ok(false),
        };
        match SdBlobManifest::parse(&payload) {
            Ok(members) => {
                index.register_sd_blob(hash, members).await?;
                index.record_blob_completed(hash, length, SystemTime::now()).await?;
                self.sd_hash_this_conn = Some(hash);
                Ok(true)
            }
            Err(e) => {
                warn!(hash = %hash.fmt_short(), error = %e, "invalid SD blob manifest");
                let _ = store.delete(&hash).await;
                Ok(false)
            }
        }
    }

    async fn finalize(&mut self, index: &Arc<dyn Index>, enqueuer: &Arc<dyn ForwardEnqueuer>) {
        if let Some(sd_hash) = self.sd_hash_this_conn {
            if self.enqueued_stream {
                return;
            }
            let ready = async {
                let exists = index.blob_exists(sd_hash).await.unwrap_or(false);
                let forwarded = index.blob_forwarded(sd_hash).await.unwrap_or(true);
                let needed = index.needed_blobs_for_stream(sd_hash).await.unwrap_or(None);
                exists && !forwarded && matches!(needed, Some(n) if n.is_empty())
            }
            .await;
            if ready {
                enqueuer.enqueue_forward_stream(sd_hash).await;
                self.enqueued_stream = true;
            }
        } else {
            for hash in self.plain_completed.drain(..) {
                enqueuer.enqueue_forward_blob(hash).await;
            }
        }
    }
}

fn parse_hash_field(value: &Value, field: &str) -> Result<Hash, SessionError> {
    let raw = value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ProtocolError::InvalidRequest(format!("missing {field}")))?;
    Hash::from_hex(raw)
        .map_err(ProtocolError::from)
        .map_err(SessionError::from)
}

fn parse_u64_field(value: &Value, field: &str) -> Result<u64, SessionError> {
    value
        .get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| ProtocolError::InvalidRequest(format!("missing {field}")).into())
}

fn to_protocol_err(e: BlobWriteError) -> ProtocolError {
    match e {
        BlobWriteError::Io(io) => ProtocolError::Io(io),
        other => ProtocolError::InvalidRequest(other.to_string()),
    }
}

async fn send_json<W: AsyncWrite + Unpin>(out: &mut W, value: &Value) -> Result<(), ProtocolError> {
    let bytes = serde_json::to_vec(value).expect("wire messages always serialize");
    out.write_all(&bytes).await.map_err(ProtocolError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_index::MemoryIndex;
    use tokio::io::duplex;

    struct RecordingEnqueuer {
        blobs: tokio::sync::Mutex<Vec<Hash>>,
        streams: tokio::sync::Mutex<Vec<Hash>>,
    }

    impl RecordingEnqueuer {
        fn new() -> Self {
            Self {
                blobs: tokio::sync::Mutex::new(Vec::new()),
                streams: tokio::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ForwardEnqueuer for RecordingEnqueuer {
        async fn enqueue_forward_blob(&self, hash: Hash) {
            self.blobs.lock().await.push(hash);
        }

        async fn enqueue_forward_stream(&self, sd_hash: Hash) {
            self.streams.lock().await.push(sd_hash);
        }
    }

    #[tokio::test]
    async fn s1_single_blob_round_trip_then_enqueues_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlobFileStore::new(dir.path()));
        let index: Arc<dyn Index> = Arc::new(MemoryIndex::new());
        let enqueuer = Arc::new(RecordingEnqueuer::new());

        let payload = b"the quick brown fox 123456789012";
        let hash = Hash::digest(payload);

        let (mut client, server) = duplex(4096);
        let handle = tokio::spawn(handle_connection(
            server,
            "test-peer".into(),
            store.clone(),
            index.clone(),
            enqueuer.clone(),
        ));

        client.write_all(br#"{"version":1}"#).await.unwrap();
        let mut resp = vec![0u8; 64];
        let n = client.read(&mut resp).await.unwrap();
        assert_eq!(&resp[..n], br#"{"version":1}"#);

        let req = format!(
            r#"{{"blob_hash":"{}","blob_size":{}}}"#,
            hash.to_hex(),
            payload.len()
        );
        client.write_all(req.as_bytes()).await.unwrap();
        let n = client.read(&mut resp).await.unwrap();
        assert_eq!(&resp[..n], br#"{"send_blob":true}"#);

        client.write_all(payload).await.unwrap();
        let n = client.read(&mut resp).await.unwrap();
        assert_eq!(&resp[..n], br#"{"received_blob":true}"#);

        drop(client);
        handle.await.unwrap().unwrap();

        assert!(store.contains(&hash).await);
        let record = index.get_record(hash).await.unwrap().unwrap();
        assert_eq!(record.length, payload.len() as u64);
        assert!(record.host.is_empty());
        assert_eq!(*enqueuer.blobs.lock().await, vec![hash]);
    }

    #[tokio::test]
    async fn s2_duplicate_upload_is_rejected_without_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlobFileStore::new(dir.path()));
        let index: Arc<dyn Index> = Arc::new(MemoryIndex::new());
        index
            .record_blob_completed(Hash::digest(b"dup"), 3, SystemTime::now())
            .await
            .unwrap();
        let hash = Hash::digest(b"dup");
        let enqueuer = Arc::new(RecordingEnqueuer::new());

        let (mut client, server) = duplex(4096);
        let handle = tokio::spawn(handle_connection(
            server,
            "peer".into(),
            store,
            index,
            enqueuer,
        ));

        client.write_all(br#"{"version":1}"#).await.unwrap();
        let mut resp = vec![0u8; 64];
        client.read(&mut resp).await.unwrap();

        let req = format!(r#"{{"blob_hash":"{}","blob_size":3}}"#, hash.to_hex());
        client.write_all(req.as_bytes()).await.unwrap();
        let n = client.read(&mut resp).await.unwrap();
        assert_eq!(&resp[..n], br#"{"send_blob":false}"#);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn s3_sd_blob_with_already_present_member_enqueues_stream() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlobFileStore::new(dir.path()));
        let index: Arc<dyn Index> = Arc::new(MemoryIndex::new());
        let enqueuer = Arc::new(RecordingEnqueuer::new());

        let member_payload = b"member bytes";
        let member_hash = Hash::digest(member_payload);
        index
            .record_blob_completed(member_hash, member_payload.len() as u64, SystemTime::now())
            .await
            .unwrap();

        let manifest = serde_json::json!({
            "blobs": [{"blob_hash": member_hash.to_hex(), "length": member_payload.len()}]
        });
        let sd_payload = serde_json::to_vec(&manifest).unwrap();
        let sd_hash = Hash::digest(&sd_payload);

        let (mut client, server) = duplex(8192);
        let handle = tokio::spawn(handle_connection(
            server,
            "peer".into(),
            store.clone(),
            index.clone(),
            enqueuer.clone(),
        ));

        client.write_all(br#"{"version":1}"#).await.unwrap();
        let mut resp = vec![0u8; 256];
        client.read(&mut resp).await.unwrap();

        let req = format!(
            r#"{{"sd_blob_hash":"{}","sd_blob_size":{}}}"#,
            sd_hash.to_hex(),
            sd_payload.len()
        );
        client.write_all(req.as_bytes()).await.unwrap();
        let n = client.read(&mut resp).await.unwrap();
        assert_eq!(&resp[..n], br#"{"send_sd_blob":true}"#);

        client.write_all(&sd_payload).await.unwrap();
        let n = client.read(&mut resp).await.unwrap();
        assert_eq!(&resp[..n], br#"{"received_sd_blob":true}"#);

        drop(client);
        handle.await.unwrap().unwrap();

        assert_eq!(
            index.members_of_stream(sd_hash).await.unwrap(),
            [member_hash].into()
        );
        assert_eq!(*enqueuer.streams.lock().await, vec![sd_hash]);
        assert!(enqueuer.blobs.lock().await.is_empty());
    }

    /// If the uploader disappears partway through a blob's bytes, the temp
    /// file is removed and nothing is recorded as completed.
    #[tokio::test]
    async fn connection_drop_mid_blob_aborts_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlobFileStore::new(dir.path()));
        let index: Arc<dyn Index> = Arc::new(MemoryIndex::new());
        let enqueuer = Arc::new(RecordingEnqueuer::new());

        let payload = b"the quick brown fox 123456789012";
        let hash = Hash::digest(payload);

        let (mut client, server) = duplex(4096);
        let handle = tokio::spawn(handle_connection(
            server,
            "peer".into(),
            store.clone(),
            index.clone(),
            enqueuer,
        ));

        client.write_all(br#"{"version":1}"#).await.unwrap();
        let mut resp = vec![0u8; 64];
        client.read(&mut resp).await.unwrap();

        let req = format!(
            r#"{{"blob_hash":"{}","blob_size":{}}}"#,
            hash.to_hex(),
            payload.len()
        );
        client.write_all(req.as_bytes()).await.unwrap();
        let n = client.read(&mut resp).await.unwrap();
        assert_eq!(&resp[..n], br#"{"send_blob":true}"#);

        // Send only half the declared bytes, then vanish.
        client.write_all(&payload[..payload.len() / 2]).await.unwrap();
        drop(client);
        handle.await.unwrap().unwrap();

        assert!(!store.contains(&hash).await);
        assert!(index.get_record(hash).await.unwrap().is_none());
        let mut temp_files = tokio::fs::read_dir(dir.path()).await.unwrap();
        assert!(temp_files.next_entry().await.unwrap().is_none());
    }
}
