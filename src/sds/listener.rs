//! The SDS data-plane TCP listener: accepts one `wire::SdsRequest` frame
//! per connection, validates the attached token, performs the read/write/
//! init_volume, and replies with one `wire::SdsResponse` frame.

use std::sync::Arc;

use base64::Engine;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::sds::{AckEntry, SdsService};
use crate::token::validate_token_for_io;
use crate::wire::{SdsAction, SdsRequest, SdsResponse};

pub async fn run(service: Arc<SdsService>) -> std::io::Result<()> {
    let address = format!("0.0.0.0:{}", service.config.data_plane_base_port);
    let listener = TcpListener::bind(&address).await?;
    log::info!("{} data listener bound on {address}", service.node_id);

    loop {
        let (stream, peer) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(service, stream).await {
                log::warn!("sds connection from {peer} failed: {err}");
            }
        });
    }
}

async fn handle_connection(service: Arc<SdsService>, stream: tokio::net::TcpStream) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    if line.trim().is_empty() {
        return Ok(());
    }

    let response = match serde_json::from_str::<SdsRequest>(line.trim()) {
        Ok(request) => handle_request(&service, request).await,
        Err(err) => SdsResponse::error(format!("malformed request: {err}")),
    };

    let mut out = serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string());
    out.push('\n');
    write_half.write_all(out.as_bytes()).await?;
    write_half.flush().await
}

async fn handle_request(service: &Arc<SdsService>, request: SdsRequest) -> SdsResponse {
    match request.action {
        SdsAction::InitVolume => handle_init_volume(service, request).await,
        SdsAction::Read => handle_read(service, request).await,
        SdsAction::Write => handle_write(service, request).await,
    }
}

async fn handle_init_volume(service: &Arc<SdsService>, request: SdsRequest) -> SdsResponse {
    let Some(size_bytes) = request.size_bytes else {
        return SdsResponse::error("init_volume requires size_bytes");
    };
    match crate::sds::backing::ensure_volume_file(&service.storage_root, request.volume_id, size_bytes).await {
        Ok(()) => SdsResponse {
            ok: true,
            generation: Some(1),
            ..Default::default()
        },
        Err(err) => SdsResponse::error(format!("init_volume failed: {err}")),
    }
}

/// Validates the token and rejects replay, sharing the same order for
/// read and write: token present → not already consumed → signature/range
/// valid per [`validate_token_for_io`] (spec.md §4.9).
async fn authorize_io(
    service: &Arc<SdsService>,
    request: &SdsRequest,
) -> Result<(), SdsResponse> {
    let Some(token) = &request.token else {
        return Err(SdsResponse::error("request carries no token"));
    };
    let Some(offset_bytes) = request.offset_bytes else {
        return Err(SdsResponse::error("missing offset_bytes"));
    };
    let Some(length_bytes) = request.length_bytes else {
        return Err(SdsResponse::error("missing length_bytes"));
    };

    let op = match request.action {
        SdsAction::Read => crate::model::IoOp::Read,
        SdsAction::Write => crate::model::IoOp::Write,
        SdsAction::InitVolume => unreachable!("init_volume doesn't call authorize_io"),
    };

    if service.consumed_tokens.is_consumed(&token.token_id).await {
        return Err(SdsResponse::error("token already consumed (replay)"));
    }

    let cluster_secret = service.cluster_secret.read().await.clone();
    let Some(cluster_secret) = cluster_secret else {
        return Err(SdsResponse::error("node not yet registered with mdm"));
    };

    validate_token_for_io(token, &cluster_secret, request.volume_id, op, offset_bytes, length_bytes)
        .map_err(SdsResponse::error)
}

async fn handle_read(service: &Arc<SdsService>, request: SdsRequest) -> SdsResponse {
    if let Err(response) = authorize_io(service, &request).await {
        return response;
    }
    let started = std::time::Instant::now();
    let offset = request.offset_bytes.unwrap_or(0);
    let length = request.length_bytes.unwrap_or(0);
    let token_id = request.token.as_ref().unwrap().token_id.clone();
    match crate::sds::backing::read_at(&service.storage_root, request.volume_id, offset, length).await {
        Ok(data) => {
            service.consumed_tokens.mark_consumed(&token_id).await;
            service.stats.total_io_operations.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            service
                .stats
                .total_bytes_read
                .fetch_add(data.len() as u64, std::sync::atomic::Ordering::Relaxed);
            service
                .ack_queue
                .enqueue(AckEntry {
                    token_id,
                    success: true,
                    bytes_processed: data.len() as u64,
                    duration_ms: started.elapsed().as_millis() as u64,
                    chunk_id: request.chunk_id,
                    checksum: None,
                })
                .await;
            SdsResponse {
                ok: true,
                bytes_read: Some(data.len() as u64),
                data_b64: Some(base64::engine::general_purpose::STANDARD.encode(&data)),
                generation: Some(1),
                ..Default::default()
            }
        }
        Err(err) => {
            service.stats.total_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            SdsResponse::error(format!("read failed: {err}"))
        }
    }
}

async fn handle_write(service: &Arc<SdsService>, request: SdsRequest) -> SdsResponse {
    if let Err(response) = authorize_io(service, &request).await {
        return response;
    }
    let Some(data_b64) = &request.data_b64 else {
        return SdsResponse::error("write requires data_b64");
    };
    let data = match base64::engine::general_purpose::STANDARD.decode(data_b64) {
        Ok(data) => data,
        Err(err) => return SdsResponse::error(format!("invalid base64 payload: {err}")),
    };
    let started = std::time::Instant::now();
    let offset = request.offset_bytes.unwrap_or(0);
    let token_id = request.token.as_ref().unwrap().token_id.clone();

    // Serialize concurrent writers to the same chunk (spec.md §5).
    let chunk_lock = match request.chunk_id {
        Some(chunk_id) => Some(service.lock_chunk(chunk_id).await),
        None => None,
    };
    let _chunk_guard = match &chunk_lock {
        Some(lock) => Some(lock.lock().await),
        None => None,
    };

    match crate::sds::backing::write_at(&service.storage_root, request.volume_id, offset, &data).await {
        Ok(()) => {
            service.consumed_tokens.mark_consumed(&token_id).await;
            service.stats.total_io_operations.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            service
                .stats
                .total_bytes_written
                .fetch_add(data.len() as u64, std::sync::atomic::Ordering::Relaxed);
            let mut hasher = Sha256::new();
            hasher.update(&data);
            let checksum = hex::encode(hasher.finalize());
            service
                .ack_queue
                .enqueue(AckEntry {
                    token_id,
                    success: true,
                    bytes_processed: data.len() as u64,
                    duration_ms: started.elapsed().as_millis() as u64,
                    chunk_id: request.chunk_id,
                    checksum: Some(checksum.clone()),
                })
                .await;
            SdsResponse {
                ok: true,
                bytes_written: Some(data.len() as u64),
                generation: Some(1),
                checksum: Some(checksum),
                ..Default::default()
            }
        }
        Err(err) => {
            service.stats.total_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            SdsResponse::error(format!("write failed: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::model::{ChunkId, IoOp, SdcId, VolumeId};
    use crate::sds::SdsService;
    use crate::token::{compute_token_expiry, sign_token, TokenPayload};

    const SECRET: &str = "listener-test-secret";

    async fn setup_service() -> Arc<SdsService> {
        let mut config = ServiceConfig::default();
        config.storage_root = std::env::temp_dir()
            .join(format!("flexsim-sds-listener-test-{}", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .to_string();
        let service = Arc::new(SdsService::new("sds-test".to_string(), Arc::new(config)));
        *service.cluster_secret.write().await = Some(SECRET.to_string());
        service
    }

    fn token_for(volume_id: VolumeId, op: IoOp, offset: u64, length: u64) -> TokenPayload {
        let token_id = uuid::Uuid::new_v4().to_string();
        let signature = sign_token(&token_id, volume_id, op, offset, length, SECRET);
        TokenPayload {
            token_id,
            volume_id,
            sdc_id: SdcId(1),
            operation: op,
            offset_bytes: offset,
            length_bytes: length,
            signature,
            expires_at: compute_token_expiry(60),
            io_plan: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips_through_backing_storage() {
        let service = setup_service().await;
        let volume_id = VolumeId(1);
        let init = handle_init_volume(
            &service,
            SdsRequest {
                action: SdsAction::InitVolume,
                token: None,
                volume_id,
                chunk_id: None,
                offset_bytes: None,
                length_bytes: None,
                data_b64: None,
                size_bytes: Some(4096),
            },
        )
        .await;
        assert!(init.ok);

        let write_token = token_for(volume_id, IoOp::Write, 0, 5);
        let write_response = handle_write(
            &service,
            SdsRequest {
                action: SdsAction::Write,
                token: Some(write_token),
                volume_id,
                chunk_id: Some(ChunkId(1)),
                offset_bytes: Some(0),
                length_bytes: Some(5),
                data_b64: Some(base64::engine::general_purpose::STANDARD.encode(b"hello")),
                size_bytes: None,
            },
        )
        .await;
        assert!(write_response.ok);
        assert!(write_response.checksum.is_some());

        let read_token = token_for(volume_id, IoOp::Read, 0, 5);
        let read_response = handle_read(
            &service,
            SdsRequest {
                action: SdsAction::Read,
                token: Some(read_token),
                volume_id,
                chunk_id: Some(ChunkId(1)),
                offset_bytes: Some(0),
                length_bytes: Some(5),
                data_b64: None,
                size_bytes: None,
            },
        )
        .await;
        assert!(read_response.ok);
        let data = base64::engine::general_purpose::STANDARD
            .decode(read_response.data_b64.unwrap())
            .unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn read_without_token_is_rejected() {
        let service = setup_service().await;
        let response = handle_read(
            &service,
            SdsRequest {
                action: SdsAction::Read,
                token: None,
                volume_id: VolumeId(1),
                chunk_id: Some(ChunkId(1)),
                offset_bytes: Some(0),
                length_bytes: Some(5),
                data_b64: None,
                size_bytes: None,
            },
        )
        .await;
        assert!(!response.ok);
    }

    #[tokio::test]
    async fn replayed_token_is_rejected_on_second_use() {
        let service = setup_service().await;
        let volume_id = VolumeId(1);
        handle_init_volume(
            &service,
            SdsRequest {
                action: SdsAction::InitVolume,
                token: None,
                volume_id,
                chunk_id: None,
                offset_bytes: None,
                length_bytes: None,
                data_b64: None,
                size_bytes: Some(4096),
            },
        )
        .await;

        let token = token_for(volume_id, IoOp::Read, 0, 5);
        let request = SdsRequest {
            action: SdsAction::Read,
            token: Some(token),
            volume_id,
            chunk_id: Some(ChunkId(1)),
            offset_bytes: Some(0),
            length_bytes: Some(5),
            data_b64: None,
            size_bytes: None,
        };

        let first = handle_read(&service, request.clone()).await;
        assert!(first.ok);
        let second = handle_read(&service, request).await;
        assert!(!second.ok);
        assert_eq!(second.error.as_deref(), Some("token already consumed (replay)"));
    }
}
