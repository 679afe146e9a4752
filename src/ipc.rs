//! Orchestrator ⇄ worker messages, exchanged over a per-job Unix socket.
//!
//! Wire format: 4-byte length prefix (big-endian) + JSON payload

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::{ScanError, ScanStatus, Vulnerability};

/// Hard cap on a single frame. A vulnerability batch is small by
/// construction, so anything near this size is a protocol violation.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Orchestrator → worker. Exactly one `Start` is sent per child, immediately
/// after the channel opens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    Start { scan_id: String, repo_url: String },
}

/// Worker → orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Coarse progress; only `Scanning` and `Finished` are legal on the wire.
    Status { scan_id: String, status: ScanStatus },
    /// One size-capped batch of already-filtered vulnerabilities.
    Vulns {
        scan_id: String,
        vulnerabilities: Vec<Vulnerability>,
    },
    /// Terminal failure report. At most one per child; the child exits
    /// right after sending it.
    Error { scan_id: String, error: ScanError },
}

impl WorkerEvent {
    pub fn scan_id(&self) -> &str {
        match self {
            WorkerEvent::Status { scan_id, .. }
            | WorkerEvent::Vulns { scan_id, .. }
            | WorkerEvent::Error { scan_id, .. } => scan_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Serialize a message and write it as one length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame payload. Returns `None` on a clean end-of-stream (the peer
/// closed between frames).
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Total decoder for worker events: a recognized tag with a malformed body
/// is an error, an unrecognized tag decodes to `None` so the consumer can
/// skip it without tearing the channel down.
pub fn decode_event(payload: &[u8]) -> Result<Option<WorkerEvent>, ProtocolError> {
    decode_tagged(payload, &["status", "vulns", "error"])
}

/// Same contract as [`decode_event`], for the worker side of the channel.
pub fn decode_request(payload: &[u8]) -> Result<Option<WorkerRequest>, ProtocolError> {
    decode_tagged(payload, &["start"])
}

fn decode_tagged<T: DeserializeOwned>(
    payload: &[u8],
    known_tags: &[&str],
) -> Result<Option<T>, ProtocolError> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    let Some(tag) = value.get("type").and_then(|tag| tag.as_str()) else {
        return Err(ProtocolError::Malformed(serde::de::Error::custom(
            "message has no `type` tag",
        )));
    };
    if !known_tags.contains(&tag) {
        tracing::debug!(tag, "ignoring message with unknown tag");
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(value)?))
}
