//! Per-segment dispatch to SDS targets (C10), spec.md §4.10's
//! "CONNECT/READ/WRITE/DISCONNECT" surface. Grounded on `sdc/data_client.py`'s
//! `execute_read`/`execute_write`: reads try replicas in order and accept the
//! first success; writes fan out to every target in the segment and the
//! call only succeeds once enough targets ack to satisfy the plan's
//! [`WritePolicy`].

use base64::Engine;

use crate::control_api::plan::{IoPlan, Segment};
use crate::model::WritePolicy;
use crate::sdc::SdcError;
use crate::token::TokenPayload;
use crate::wire::{send_frame, SdsAction, SdsRequest};

/// Reads every segment of `plan` in order, trying each segment's targets
/// until one succeeds, and concatenates the results.
pub async fn execute_read(plan: &IoPlan, token: &TokenPayload) -> Result<Vec<u8>, SdcError> {
    let mut out = Vec::with_capacity(plan.length_bytes as usize);
    for segment in &plan.segments {
        out.extend(read_segment(plan, segment, token).await?);
    }
    Ok(out)
}

async fn read_segment(plan: &IoPlan, segment: &Segment, token: &TokenPayload) -> Result<Vec<u8>, SdcError> {
    let mut last_error = None;
    for target in &segment.targets {
        let request = SdsRequest {
            action: SdsAction::Read,
            token: Some(token.clone()),
            volume_id: plan.volume_id,
            chunk_id: Some(segment.chunk_id),
            offset_bytes: Some(segment.volume_offset_bytes),
            length_bytes: Some(segment.segment_length),
            data_b64: None,
            size_bytes: None,
        };
        match send_frame(&target.host, target.data_port, &request).await {
            Ok(response) if response.ok => {
                let Some(data_b64) = response.data_b64 else {
                    last_error = Some(SdcError::Network("read ack carried no data".to_string()));
                    continue;
                };
                return base64::engine::general_purpose::STANDARD
                    .decode(data_b64)
                    .map_err(|err| SdcError::Network(format!("invalid base64 from sds: {err}")));
            }
            Ok(response) => {
                last_error = Some(SdcError::Network(
                    response.error.unwrap_or_else(|| "sds rejected read".to_string()),
                ));
            }
            Err(err) => {
                last_error = Some(SdcError::Network(err.to_string()));
            }
        }
    }
    Err(last_error.unwrap_or(SdcError::NoTarget))
}

/// Writes every segment of `plan`, fanning each segment's `data` slice out
/// to all its targets. A segment only counts as committed once the number
/// of acking targets satisfies `plan.write_policy`.
pub async fn execute_write(plan: &IoPlan, token: &TokenPayload, data: &[u8]) -> Result<u64, SdcError> {
    let write_policy = plan.write_policy.unwrap_or(WritePolicy::Quorum);
    let mut cursor = 0usize;
    let mut total_written = 0u64;

    for segment in &plan.segments {
        let length = segment.segment_length as usize;
        let chunk_data = &data[cursor..cursor + length];
        cursor += length;

        let required = match write_policy {
            WritePolicy::All => segment.targets.len(),
            WritePolicy::Quorum => segment.targets.len() / 2 + 1,
        };
        if segment.targets.is_empty() {
            return Err(SdcError::NoTarget);
        }

        let mut acked = 0usize;
        for target in &segment.targets {
            let request = SdsRequest {
                action: SdsAction::Write,
                token: Some(token.clone()),
                volume_id: plan.volume_id,
                chunk_id: Some(segment.chunk_id),
                offset_bytes: Some(segment.volume_offset_bytes),
                length_bytes: Some(segment.segment_length),
                data_b64: Some(base64::engine::general_purpose::STANDARD.encode(chunk_data)),
                size_bytes: None,
            };
            match send_frame(&target.host, target.data_port, &request).await {
                Ok(response) if response.ok => acked += 1,
                Ok(response) => {
                    log::warn!(
                        "write to sds {} for chunk {} rejected: {}",
                        target.sds_id,
                        segment.chunk_id,
                        response.error.unwrap_or_default()
                    );
                }
                Err(err) => {
                    log::warn!("write to sds {} for chunk {} failed: {err}", target.sds_id, segment.chunk_id);
                }
            }
        }

        if acked < required {
            return Err(SdcError::PartialWrite {
                acked,
                total: segment.targets.len(),
            });
        }
        total_written += length as u64;
    }

    Ok(total_written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IoMode;
    use crate::control_api::plan::SegmentTarget;
    use crate::model::{ChunkId, SdcId, IoOp, VolumeId};
    use crate::wire::SdsResponse;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Spins up a bare TCP listener that answers every newline-delimited
    /// JSON frame it receives with a fixed `SdsResponse`, mimicking one SDS
    /// data port for as many connections as `responses` has entries.
    async fn spawn_fake_sds(responses: Vec<SdsResponse>) -> (String, u16) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for response in responses {
                let (stream, _) = listener.accept().await.unwrap();
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                let mut out = serde_json::to_string(&response).unwrap();
                out.push('\n');
                write_half.write_all(out.as_bytes()).await.unwrap();
                write_half.flush().await.unwrap();
            }
        });
        (addr.ip().to_string(), addr.port())
    }

    fn sample_token() -> TokenPayload {
        TokenPayload {
            token_id: "tok-1".to_string(),
            volume_id: VolumeId(1),
            sdc_id: SdcId(1),
            operation: IoOp::Read,
            offset_bytes: 0,
            length_bytes: 1024,
            signature: "sig".to_string(),
            expires_at: chrono::Utc::now() + chrono::Duration::seconds(60),
            io_plan: serde_json::json!({}),
        }
    }

    fn plan_with_segments(segments: Vec<Segment>, write_policy: Option<WritePolicy>) -> IoPlan {
        IoPlan {
            op: IoOp::Read,
            volume_id: VolumeId(1),
            sdc_id: SdcId(1),
            offset_bytes: 0,
            length_bytes: segments.iter().map(|s| s.segment_length).sum(),
            io_mode: IoMode::NetworkOnly,
            write_policy,
            read_policy: None,
            segments,
            plan_generation: "fp".to_string(),
        }
    }

    #[tokio::test]
    async fn execute_read_returns_data_from_first_healthy_target() {
        let (host, port) = spawn_fake_sds(vec![SdsResponse {
            ok: true,
            data_b64: Some(base64::engine::general_purpose::STANDARD.encode(b"hello")),
            ..Default::default()
        }])
        .await;

        let plan = plan_with_segments(
            vec![Segment {
                chunk_id: ChunkId(1),
                chunk_generation: 0,
                volume_offset_bytes: 0,
                segment_offset: 0,
                segment_length: 5,
                targets: vec![SegmentTarget { sds_id: crate::model::SdsId(1), host, data_port: port }],
            }],
            None,
        );

        let data = execute_read(&plan, &sample_token()).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn execute_read_falls_through_to_next_target_on_rejection() {
        let (host1, port1) = spawn_fake_sds(vec![SdsResponse::error("nope")]).await;
        let (host2, port2) = spawn_fake_sds(vec![SdsResponse {
            ok: true,
            data_b64: Some(base64::engine::general_purpose::STANDARD.encode(b"ok")),
            ..Default::default()
        }])
        .await;

        let plan = plan_with_segments(
            vec![Segment {
                chunk_id: ChunkId(1),
                chunk_generation: 0,
                volume_offset_bytes: 0,
                segment_offset: 0,
                segment_length: 2,
                targets: vec![
                    SegmentTarget { sds_id: crate::model::SdsId(1), host: host1, data_port: port1 },
                    SegmentTarget { sds_id: crate::model::SdsId(2), host: host2, data_port: port2 },
                ],
            }],
            None,
        );

        let data = execute_read(&plan, &sample_token()).await.unwrap();
        assert_eq!(data, b"ok");
    }

    #[tokio::test]
    async fn execute_write_succeeds_once_quorum_acks() {
        let (host1, port1) =
            spawn_fake_sds(vec![SdsResponse { ok: true, ..Default::default() }]).await;
        let (host2, port2) =
            spawn_fake_sds(vec![SdsResponse::error("disk full")]).await;
        let (host3, port3) =
            spawn_fake_sds(vec![SdsResponse { ok: true, ..Default::default() }]).await;

        let plan = plan_with_segments(
            vec![Segment {
                chunk_id: ChunkId(1),
                chunk_generation: 0,
                volume_offset_bytes: 0,
                segment_offset: 0,
                segment_length: 4,
                targets: vec![
                    SegmentTarget { sds_id: crate::model::SdsId(1), host: host1, data_port: port1 },
                    SegmentTarget { sds_id: crate::model::SdsId(2), host: host2, data_port: port2 },
                    SegmentTarget { sds_id: crate::model::SdsId(3), host: host3, data_port: port3 },
                ],
            }],
            Some(WritePolicy::Quorum),
        );

        let written = execute_write(&plan, &sample_token(), b"data").await.unwrap();
        assert_eq!(written, 4);
    }

    #[tokio::test]
    async fn execute_write_fails_when_all_policy_not_met() {
        let (host1, port1) =
            spawn_fake_sds(vec![SdsResponse { ok: true, ..Default::default() }]).await;
        let (host2, port2) = spawn_fake_sds(vec![SdsResponse::error("down")]).await;

        let plan = plan_with_segments(
            vec![Segment {
                chunk_id: ChunkId(1),
                chunk_generation: 0,
                volume_offset_bytes: 0,
                segment_offset: 0,
                segment_length: 4,
                targets: vec![
                    SegmentTarget { sds_id: crate::model::SdsId(1), host: host1, data_port: port1 },
                    SegmentTarget { sds_id: crate::model::SdsId(2), host: host2, data_port: port2 },
                ],
            }],
            Some(WritePolicy::All),
        );

        let err = execute_write(&plan, &sample_token(), b"data").await.unwrap_err();
        assert!(matches!(err, SdcError::PartialWrite { acked: 1, total: 2 }));
    }
}
