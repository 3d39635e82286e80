//! I/O plan generation (C6), spec.md §4.6 — the single gateway through
//! which clients translate a `(volume, offset, length)` into a list of
//! segments and target SDS endpoints.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{IoMode, ServiceConfig};
use crate::error::{AppError, AppResult};
use crate::model::*;
use crate::store::MdmStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentTarget {
    pub sds_id: SdsId,
    pub host: String,
    pub data_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub chunk_id: ChunkId,
    pub chunk_generation: u64,
    /// Absolute offset into the volume (not the chunk) — what the SDC sends
    /// as `offset_bytes` in its `wire::SdsRequest`, since SDS backing files
    /// are one sparse file per volume rather than per chunk.
    pub volume_offset_bytes: u64,
    pub segment_offset: u64,
    pub segment_length: u64,
    pub targets: Vec<SegmentTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoPlan {
    pub op: IoOp,
    pub volume_id: VolumeId,
    pub sdc_id: SdcId,
    pub offset_bytes: u64,
    pub length_bytes: u64,
    pub io_mode: IoMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_policy: Option<WritePolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_policy: Option<ReadPolicy>,
    pub segments: Vec<Segment>,
    pub plan_generation: String,
}

pub async fn generate_plan(
    store: &MdmStore,
    config: &Arc<ServiceConfig>,
    volume_id: VolumeId,
    sdc_id: SdcId,
    op: IoOp,
    offset_bytes: u64,
    length_bytes: u64,
) -> AppResult<IoPlan> {
    // 1. Validate the caller's mapping; writes require non-read-only mode.
    let mapping = {
        let mappings = store.mappings.read().await;
        mappings
            .values()
            .find(|m| m.volume_id == volume_id && m.sdc_id == sdc_id)
            .cloned()
            .ok_or_else(|| AppError::MappingForbidden(format!(
                "sdc {sdc_id} has no mapping for volume {volume_id}"
            )))?
    };
    if op == IoOp::Write && mapping.access_mode == AccessMode::ReadOnly {
        return Err(AppError::MappingForbidden(
            "mapping is read_only".to_string(),
        ));
    }

    let (pool_id, chunk_size_bytes) = {
        let volumes = store.volumes.read().await;
        let volume = volumes
            .get(&volume_id)
            .ok_or_else(|| AppError::NotFound(format!("volume {volume_id} not found")))?;
        let pools = store.pools.read().await;
        let pool = pools.get(&volume.pool_id).unwrap();
        (volume.pool_id, pool.chunk_size_bytes)
    };

    // 2. Walk offsets from `offset` to `offset+length`, splitting on chunk
    // boundaries.
    let mut segments = Vec::new();
    let mut cursor = offset_bytes;
    let end = offset_bytes + length_bytes;
    while cursor < end {
        let chunk_index = cursor / chunk_size_bytes;
        let chunk_start = chunk_index * chunk_size_bytes;
        let chunk_end = chunk_start + chunk_size_bytes;
        let segment_end = end.min(chunk_end);
        let segment_offset = cursor - chunk_start;
        let segment_length = segment_end - cursor;

        let chunk = {
            let chunks = store.chunks.read().await;
            chunks
                .values()
                .find(|c| c.volume_id == volume_id && c.chunk_index == chunk_index)
                .cloned()
                .ok_or_else(|| {
                    AppError::NotFound(format!(
                        "chunk index {chunk_index} not found for volume {volume_id}"
                    ))
                })?
        };

        // 3. Collect replicas whose SDS's ClusterNode is ACTIVE.
        let targets = active_targets_for_chunk(store, chunk.id).await;
        if targets.is_empty() {
            return Err(AppError::NoActiveTargets(format!(
                "no active targets for chunk {}",
                chunk.id
            )));
        }

        segments.push(Segment {
            chunk_id: chunk.id,
            chunk_generation: chunk.generation,
            volume_offset_bytes: cursor,
            segment_offset,
            segment_length,
            targets,
        });

        cursor = segment_end;
    }

    let write_policy = if op == IoOp::Write {
        Some(config.write_ack_policy.into())
    } else {
        None
    };
    let read_policy = if op == IoOp::Read {
        Some(ReadPolicy::FirstHealthy)
    } else {
        None
    };

    let plan_generation = fingerprint(
        op,
        volume_id,
        sdc_id,
        offset_bytes,
        length_bytes,
        config.io_mode,
        write_policy,
        &segments,
    );

    let _ = pool_id;
    Ok(IoPlan {
        op,
        volume_id,
        sdc_id,
        offset_bytes,
        length_bytes,
        io_mode: config.io_mode,
        write_policy,
        read_policy,
        segments,
        plan_generation,
    })
}

async fn active_targets_for_chunk(store: &MdmStore, chunk_id: ChunkId) -> Vec<SegmentTarget> {
    let replicas = store.replicas.read().await;
    let sds_nodes = store.sds_nodes.read().await;
    let cluster_nodes = store.cluster_nodes.read().await;

    let mut targets = Vec::new();
    for replica in replicas.values().filter(|r| r.chunk_id == chunk_id && r.is_available) {
        if let Some(sds) = sds_nodes.get(&replica.sds_id) {
            let active = cluster_nodes
                .get(&sds.cluster_node_id)
                .map(|n| n.status == ComponentStatus::Active)
                .unwrap_or(sds.state == SdsNodeState::Up);
            if active {
                targets.push(SegmentTarget {
                    sds_id: sds.id,
                    host: sds.address.clone(),
                    data_port: sds.data_port,
                });
            }
        }
    }
    targets
}

#[allow(clippy::too_many_arguments)]
fn fingerprint(
    op: IoOp,
    volume_id: VolumeId,
    sdc_id: SdcId,
    offset_bytes: u64,
    length_bytes: u64,
    io_mode: IoMode,
    write_policy: Option<WritePolicy>,
    segments: &[Segment],
) -> String {
    #[derive(Serialize)]
    struct Canonical<'a> {
        op: IoOp,
        volume_id: VolumeId,
        sdc_id: SdcId,
        offset_bytes: u64,
        length_bytes: u64,
        io_mode: IoMode,
        write_policy: Option<WritePolicy>,
        segments: &'a [Segment],
    }
    let canonical = Canonical {
        op,
        volume_id,
        sdc_id,
        offset_bytes,
        length_bytes,
        io_mode,
        write_policy,
        segments,
    };
    let bytes = serde_json::to_vec(&canonical).expect("plan fingerprint input is always valid json");
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

impl From<crate::config::WriteAckPolicy> for WritePolicy {
    fn from(p: crate::config::WriteAckPolicy) -> Self {
        match p {
            crate::config::WriteAckPolicy::All => WritePolicy::All,
            crate::config::WriteAckPolicy::Quorum => WritePolicy::Quorum,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;

    async fn setup() -> (Arc<MdmStore>, Arc<ServiceConfig>, VolumeId, SdcId, PoolId) {
        let store = Arc::new(MdmStore::new());
        let config = Arc::new(ServiceConfig::default());

        let pd_id = store.next_pd_id();
        store
            .protection_domains
            .write()
            .await
            .insert(pd_id, ProtectionDomain { id: pd_id, name: "pd1".into() });

        let sds_id = store.next_sds_id();
        store.sds_nodes.write().await.insert(
            sds_id,
            SdsNode {
                id: sds_id,
                pd_id,
                fault_set_id: None,
                name: "sds0".into(),
                total_capacity_bytes: 1_000_000_000,
                used_capacity_bytes: 0,
                state: SdsNodeState::Up,
                cluster_node_id: "sds-0".into(),
                address: "127.0.0.1".into(),
                data_port: 7100,
            },
        );
        store.cluster_nodes.write().await.insert(
            "sds-0".into(),
            ClusterNode {
                node_id: "sds-0".into(),
                address: "127.0.0.1".into(),
                control_port: 7000,
                data_port: Some(7100),
                capabilities: [ComponentCapability::Sds].into_iter().collect(),
                status: ComponentStatus::Active,
                registered_at: chrono::Utc::now(),
                last_heartbeat: chrono::Utc::now(),
            },
        );

        let pool_id = store.next_pool_id();
        store.pools.write().await.insert(
            pool_id,
            StoragePool {
                id: pool_id,
                pd_id,
                name: "pool1".into(),
                total_capacity_bytes: 1_000_000_000,
                used_capacity_bytes: 0,
                reserved_capacity_bytes: 0,
                protection_policy: ProtectionPolicy::TwoCopies,
                chunk_size_bytes: 4 * 1024 * 1024,
                rebuild_rate_limit_bytes_per_sec: 100 * 1024 * 1024,
                health: PoolHealth::Ok,
                rebuild_state: RebuildState::Idle,
            },
        );

        let volume_id = store.next_volume_id();
        store.volumes.write().await.insert(
            volume_id,
            Volume {
                id: volume_id,
                pool_id,
                name: "v1".into(),
                size_bytes: 8 * 1024 * 1024,
                provisioning: Provisioning::Thin,
                state: VolumeState::Available,
                mapping_count: 0,
                used_capacity_bytes: 0,
            },
        );
        for chunk_index in 0..2 {
            let chunk_id = store.next_chunk_id();
            store.chunks.write().await.insert(
                chunk_id,
                Chunk {
                    id: chunk_id,
                    volume_id,
                    chunk_index,
                    is_degraded: false,
                    generation: 0,
                    checksum: None,
                    last_write_offset: None,
                    last_write_length: None,
                    last_write_time: None,
                },
            );
            store.replicas.write().await.insert(
                (chunk_id, sds_id),
                Replica {
                    chunk_id,
                    sds_id,
                    is_available: true,
                    is_current: true,
                    is_rebuilding: false,
                },
            );
        }

        let sdc_id = store.next_sdc_id();
        store.sdc_clients.write().await.insert(
            sdc_id,
            SdcClient {
                id: sdc_id,
                name: "sdc-1".into(),
                cluster_node_id: "sdc-1".into(),
            },
        );
        let mapping_id = store.next_mapping_id();
        store.mappings.write().await.insert(
            mapping_id,
            VolumeMapping {
                id: mapping_id,
                volume_id,
                sdc_id,
                access_mode: AccessMode::ReadWrite,
            },
        );

        (store, config, volume_id, sdc_id, pool_id)
    }

    #[tokio::test]
    async fn plan_without_mapping_is_forbidden() {
        let (store, config, volume_id, _sdc_id, _pool_id) = setup().await;
        let unmapped_sdc = store.next_sdc_id();
        let err = generate_plan(&store, &config, volume_id, unmapped_sdc, IoOp::Read, 0, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::MappingForbidden(_)));
    }

    #[tokio::test]
    async fn write_rejected_on_read_only_mapping() {
        let (store, config, volume_id, sdc_id, _pool_id) = setup().await;
        {
            let mut mappings = store.mappings.write().await;
            let mapping = mappings.values_mut().find(|m| m.sdc_id == sdc_id).unwrap();
            mapping.access_mode = AccessMode::ReadOnly;
        }
        let err = generate_plan(&store, &config, volume_id, sdc_id, IoOp::Write, 0, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::MappingForbidden(_)));
    }

    #[tokio::test]
    async fn plan_splits_on_chunk_boundary() {
        let (store, config, volume_id, sdc_id, _pool_id) = setup().await;
        let chunk_size = 4 * 1024 * 1024u64;
        // Range straddling the boundary between chunk 0 and chunk 1.
        let plan = generate_plan(
            &store,
            &config,
            volume_id,
            sdc_id,
            IoOp::Read,
            chunk_size - 1024,
            2048,
        )
        .await
        .unwrap();

        assert_eq!(plan.segments.len(), 2);
        assert_eq!(plan.segments[0].segment_length, 1024);
        assert_eq!(plan.segments[1].segment_length, 1024);
        assert_eq!(plan.segments[1].volume_offset_bytes, chunk_size);
        assert!(!plan.segments[0].targets.is_empty());
    }

    #[tokio::test]
    async fn plan_fingerprint_is_stable_for_identical_inputs() {
        let (store, config, volume_id, sdc_id, _pool_id) = setup().await;
        let plan_a = generate_plan(&store, &config, volume_id, sdc_id, IoOp::Read, 0, 1024)
            .await
            .unwrap();
        let plan_b = generate_plan(&store, &config, volume_id, sdc_id, IoOp::Read, 0, 1024)
            .await
            .unwrap();
        assert_eq!(plan_a.plan_generation, plan_b.plan_generation);
    }

    #[tokio::test]
    async fn no_active_targets_is_rejected() {
        let (store, config, volume_id, sdc_id, _pool_id) = setup().await;
        for node in store.cluster_nodes.write().await.values_mut() {
            node.status = ComponentStatus::Down;
        }
        let err = generate_plan(&store, &config, volume_id, sdc_id, IoOp::Read, 0, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NoActiveTargets(_)));
    }
}
