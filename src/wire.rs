//! The SDS data-plane frame schema (spec.md §6): TCP, newline-delimited
//! JSON. Shared by the `sds` server, the `sdc` executor, and the MDM
//! volume manager (which uses `init_volume` to provision backing files).

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::model::{ChunkId, VolumeId};
use crate::token::TokenPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdsAction {
    Read,
    Write,
    InitVolume,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdsRequest {
    pub action: SdsAction,
    #[serde(default)]
    pub token: Option<TokenPayload>,
    pub volume_id: VolumeId,
    #[serde(default)]
    pub chunk_id: Option<ChunkId>,
    #[serde(default)]
    pub offset_bytes: Option<u64>,
    #[serde(default)]
    pub length_bytes: Option<u64>,
    #[serde(default)]
    pub data_b64: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SdsResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_read: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_written: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_b64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    /// SHA-256 hex digest of the payload just written, handed back so the
    /// caller can carry it into the ack row without re-hashing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SdsResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Sends one newline-delimited JSON frame and reads back one line of
/// response. Used by every short-lived connection to an SDS data port.
pub async fn send_frame(
    address: &str,
    port: u16,
    request: &SdsRequest,
) -> std::io::Result<SdsResponse> {
    let stream = TcpStream::connect((address, port)).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut line = serde_json::to_string(request).map_err(std::io::Error::other)?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;
    write_half.flush().await?;

    let mut reader = BufReader::new(read_half);
    let mut response_line = String::new();
    reader.read_line(&mut response_line).await?;
    let response: SdsResponse =
        serde_json::from_str(response_line.trim()).map_err(std::io::Error::other)?;
    Ok(response)
}
