//! Outbound protocol (C5): the per-connection state machine that sends
//! blobs and SD blobs to a single downstream host (spec §4.5).
//!
//! Grounded in `examples/original_source/prism/protocol/client.py`'s
//! `BlobReflectorClient` for exact message ordering: handshake, then
//! either a single blob (`blob_hash`/`blob_size` → `send_blob` →
//! bytes → `received_blob`) or a stream (`sd_blob_hash`/`sd_blob_size`
//! → `send_sd_blob`[+`needed_blobs`] → the SD blob and/or its members
//! each following the single-blob sub-flow in turn).

use std::time::Duration;

use prism_core::error::{OutboundError, ProtocolError};
use prism_core::Hash;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// What this outbound run is asked to send.
#[derive(Debug, Clone)]
pub enum OutboundJob {
    /// A single, already-complete blob.
    Blob { hash: Hash, payload: Vec<u8> },
    /// A stream descriptor plus every member payload, in send order.
    /// `sd_payload` is `None` when the server already has the SD blob and
    /// only listed members need sending (spec §4.5's `needed_blobs` path).
    Stream {
        sd_hash: Hash,
        sd_payload: Option<Vec<u8>>,
        members: Vec<(Hash, Vec<u8>)>,
    },
}

/// Which blobs the downstream host acknowledged with `received_*: true`.
/// The worker (C7) only attaches these to the chosen host; anything else
/// is left for a future job (spec §4.7 step 5).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OutboundOutcome {
    pub acknowledged: Vec<Hash>,
}

const PROTOCOL_VERSION: i64 = 1;

/// Runs the full outbound exchange for one job over an already-connected
/// stream. Request/response pairs are strictly ordered — no pipelining,
/// per spec §4.5's ordering guarantee.
///
/// On failure partway through a multi-member stream, the blobs already
/// acknowledged by the downstream host are returned alongside the error
/// rather than discarded, so the caller (C7) can still attach and delete
/// those before propagating the failure for the rest (spec §4.7 step 5).
pub async fn run_job<S>(
    mut stream: S,
    job: OutboundJob,
) -> Result<OutboundOutcome, (OutboundOutcome, OutboundError)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut outcome = OutboundOutcome::default();

    if let Err(e) = handshake(&mut stream).await {
        return Err((outcome, e));
    }

    match job {
        OutboundJob::Blob { hash, payload } => match send_blob(&mut stream, hash, &payload).await {
            Ok(true) => outcome.acknowledged.push(hash),
            Ok(false) => {}
            Err(e) => return Err((outcome, e)),
        },
        OutboundJob::Stream {
            sd_hash,
            sd_payload,
            members,
        } => {
            if let Some(sd_payload) = sd_payload {
                let sd_len = sd_payload.len() as u64;
                let accepted = match send_request(
                    &mut stream,
                    &serde_json::json!({ "sd_blob_hash": sd_hash.to_hex(), "sd_blob_size": sd_len }),
                )
                .await
                {
                    Ok(v) => v,
                    Err(e) => return Err((outcome, e)),
                };
                let send_sd_blob = match accepted.get("send_sd_blob").and_then(Value::as_bool) {
                    Some(b) => b,
                    None => return Err((outcome, protocol_missing("send_sd_blob"))),
                };
                if send_sd_blob {
                    match send_payload_and_ack(&mut stream, &sd_payload, "received_sd_blob").await {
                        Ok(true) => outcome.acknowledged.push(sd_hash),
                        Ok(false) => {}
                        Err(e) => return Err((outcome, e)),
                    }
                }
            } else {
                // Server already knows the SD blob; it told us (via an
                // earlier descriptor exchange) which members are needed.
                // We still owe it nothing more here — the caller only
                // passes members that were actually requested.
            }

            for (hash, payload) in members {
                match send_blob(&mut stream, hash, &payload).await {
                    Ok(true) => outcome.acknowledged.push(hash),
                    Ok(false) => {}
                    Err(e) => return Err((outcome, e)),
                }
            }
        }
    }

    Ok(outcome)
}

async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<(), OutboundError> {
    write_json(stream, &serde_json::json!({ "version": PROTOCOL_VERSION })).await?;
    let response = read_json(stream).await?;
    let server_version = response
        .get("version")
        .and_then(Value::as_i64)
        .ok_or_else(|| protocol_missing("version"))?;
    if server_version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(server_version).into());
    }
    Ok(())
}

/// Single-blob sub-flow: request, maybe send, await ack. Returns whether
/// the downstream host acknowledged receipt.
async fn send_blob<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    hash: Hash,
    payload: &[u8],
) -> Result<bool, OutboundError> {
    let response = send_request(
        stream,
        &serde_json::json!({ "blob_hash": hash.to_hex(), "blob_size": payload.len() as u64 }),
    )
    .await?;
    let send_blob = response
        .get("send_blob")
        .and_then(Value::as_bool)
        .ok_or_else(|| protocol_missing("send_blob"))?;
    if !send_blob {
        return Ok(false);
    }
    send_payload_and_ack(stream, payload, "received_blob").await
}

async fn send_payload_and_ack<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    payload: &[u8],
    ack_key: &str,
) -> Result<bool, OutboundError> {
    stream.write_all(payload).await.map_err(OutboundError::Io)?;
    let response = read_json(stream).await?;
    response
        .get(ack_key)
        .and_then(Value::as_bool)
        .ok_or_else(|| protocol_missing(ack_key))
}

async fn send_request<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    request: &Value,
) -> Result<Value, OutboundError> {
    write_json(stream, request).await?;
    read_json(stream).await
}

async fn write_json<S: AsyncWrite + Unpin>(stream: &mut S, value: &Value) -> Result<(), OutboundError> {
    let bytes = serde_json::to_vec(value).expect("wire messages always serialize");
    stream.write_all(&bytes).await.map_err(OutboundError::Io)
}

/// Reads exactly one JSON object response. Downstream hosts in this
/// protocol always write a single complete JSON reply per request with no
/// trailing bytes, so a bounded read-until-valid-JSON loop is sufficient
/// (the server side needs the full brace-scanning codec because clients
/// may pipeline a request with blob bytes; client reads never do).
async fn read_json<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Value, OutboundError> {
    let mut buf = Vec::with_capacity(128);
    let mut chunk = [0u8; 256];
    loop {
        let n = stream.read(&mut chunk).await.map_err(OutboundError::Io)?;
        if n == 0 {
            return Err(ProtocolError::ConnectionLost.into());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Ok(value) = serde_json::from_slice(&buf) {
            return Ok(value);
        }
    }
}

fn protocol_missing(field: &'static str) -> OutboundError {
    ProtocolError::InvalidRequest(format!("response missing {field}")).into()
}

/// Connect timeout for outbound jobs (spec §4.7 step 3, §5).
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
