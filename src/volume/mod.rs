//! Volume manager (C3): orchestrates the storage engine into the
//! user-visible, end-to-end-atomic CRUD operations of spec.md §4.3.
//! Grounded on `mdm/services/volume_manager.py::create_volume` for the
//! allocate→ensure-replicas→mark-available sequence, generalized to
//! map/unmap/extend/delete.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::model::*;
use crate::storage::StorageEngine;
use crate::store::MdmStore;
use crate::wire::{send_frame, SdsAction, SdsRequest};

pub struct VolumeManager {
    store: Arc<MdmStore>,
    engine: Arc<StorageEngine>,
    storage_root: PathBuf,
}

impl VolumeManager {
    pub fn new(store: Arc<MdmStore>, engine: Arc<StorageEngine>, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            engine,
            storage_root: storage_root.into(),
        }
    }

    pub async fn create_volume(
        &self,
        pool_id: PoolId,
        name: String,
        size_bytes: u64,
        provisioning: Provisioning,
    ) -> AppResult<VolumeId> {
        if size_bytes == 0 {
            return Err(AppError::InvalidArgument(
                "volume size must be positive".to_string(),
            ));
        }
        self.engine.validate_pool_exists(pool_id).await?;

        {
            let volumes = self.store.volumes.read().await;
            if volumes
                .values()
                .any(|v| v.pool_id == pool_id && v.name == name)
            {
                return Err(AppError::Conflict(format!(
                    "volume name '{name}' already exists in pool {pool_id}"
                )));
            }
        }

        let chunk_size_bytes = {
            let pools = self.store.pools.read().await;
            pools.get(&pool_id).unwrap().chunk_size_bytes
        };
        let chunk_count = size_bytes.div_ceil(chunk_size_bytes);

        let volume_id = self.store.next_volume_id();
        let volume = Volume {
            id: volume_id,
            pool_id,
            name: name.clone(),
            size_bytes,
            provisioning,
            state: VolumeState::Creating,
            mapping_count: 0,
            used_capacity_bytes: 0,
        };
        self.store.volumes.write().await.insert(volume_id, volume);

        let lock = self.store.lock_volume(volume_id).await;
        let _guard = lock.lock().await;

        // Rolls back by deleting the volume row on any failure — nothing
        // else has been persisted yet at that point.
        if let Err(e) = self
            .engine
            .allocate_capacity(pool_id, size_bytes, provisioning)
            .await
        {
            self.store.volumes.write().await.remove(&volume_id);
            return Err(e);
        }

        let chunk_ids = match self
            .engine
            .allocate_chunks(volume_id, pool_id, 0, chunk_count)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                let volume = self.store.volumes.write().await.remove(&volume_id).unwrap();
                let _ = self.engine.deallocate_capacity(pool_id, &volume).await;
                return Err(e);
            }
        };

        self.ensure_volume_replicas(volume_id, &chunk_ids, size_bytes).await;

        {
            let mut volumes = self.store.volumes.write().await;
            let volume = volumes.get_mut(&volume_id).unwrap();
            volume.state = VolumeState::Available;
        }
        self.engine.update_pool_health(pool_id).await?;

        self.store
            .log_event(
                EventType::VolumeCreate,
                format!("volume '{name}' created ({chunk_count} chunks)"),
                Some(pool_id),
                Some(volume_id),
                None,
                None,
            )
            .await;

        Ok(volume_id)
    }

    /// Ensures a sparse backing file exists on every replica target for
    /// the newly allocated chunks, via the `init_volume` data-plane frame
    /// (spec.md §4.9). Best-effort logged, not fatal to volume creation —
    /// the files are lazily created on first real write in a live SDS.
    async fn ensure_volume_replicas(&self, volume_id: VolumeId, chunk_ids: &[ChunkId], size_bytes: u64) {
        let replicas = self.store.replicas.read().await;
        let sds_nodes = self.store.sds_nodes.read().await;
        let mut targets = std::collections::HashSet::new();
        for chunk_id in chunk_ids {
            for replica in replicas.values().filter(|r| r.chunk_id == *chunk_id) {
                targets.insert(replica.sds_id);
            }
        }
        for sds_id in targets {
            if let Some(node) = sds_nodes.get(&sds_id) {
                let request = SdsRequest {
                    action: SdsAction::InitVolume,
                    token: None,
                    volume_id,
                    chunk_id: None,
                    offset_bytes: None,
                    length_bytes: None,
                    data_b64: None,
                    size_bytes: Some(size_bytes),
                };
                if let Err(e) = send_frame(&node.address, node.data_port, &request).await {
                    log::warn!(
                        "init_volume to sds {} ({}:{}) failed: {e}",
                        sds_id,
                        node.address,
                        node.data_port
                    );
                }
            }
        }
    }

    pub async fn map_volume(
        &self,
        volume_id: VolumeId,
        sdc_id: SdcId,
        access_mode: AccessMode,
    ) -> AppResult<MappingId> {
        let lock = self.store.lock_volume(volume_id).await;
        let _guard = lock.lock().await;

        {
            let volumes = self.store.volumes.read().await;
            let volume = volumes
                .get(&volume_id)
                .ok_or_else(|| AppError::NotFound(format!("volume {volume_id} not found")))?;
            StorageEngine::validate_volume_can_map(volume)?;
        }
        let sdc_cluster_node_id = {
            let sdc_clients = self.store.sdc_clients.read().await;
            let sdc = sdc_clients
                .get(&sdc_id)
                .ok_or_else(|| AppError::NotFound(format!("sdc {sdc_id} not found")))?;
            sdc.cluster_node_id.clone()
        };
        {
            let cluster_nodes = self.store.cluster_nodes.read().await;
            let active = cluster_nodes
                .get(&sdc_cluster_node_id)
                .map(|n| n.status == ComponentStatus::Active && n.capabilities.contains(&ComponentCapability::Sdc))
                .unwrap_or(false);
            if !active {
                return Err(AppError::MappingForbidden(format!(
                    "sdc {sdc_id} has no ACTIVE sdc capability in the cluster registry"
                )));
            }
        }
        {
            let mappings = self.store.mappings.read().await;
            if mappings
                .values()
                .any(|m| m.volume_id == volume_id && m.sdc_id == sdc_id)
            {
                return Err(AppError::Conflict(format!(
                    "volume {volume_id} already mapped to sdc {sdc_id}"
                )));
            }
        }

        let mapping_id = self.store.next_mapping_id();
        self.store.mappings.write().await.insert(
            mapping_id,
            VolumeMapping {
                id: mapping_id,
                volume_id,
                sdc_id,
                access_mode,
            },
        );

        let first_mapping = {
            let mut volumes = self.store.volumes.write().await;
            let volume = volumes.get_mut(&volume_id).unwrap();
            volume.mapping_count += 1;
            let was_first = volume.mapping_count == 1;
            if was_first {
                volume.state = VolumeState::InUse;
            }
            was_first
        };
        let _ = first_mapping;

        self.publish_mapping_descriptor(volume_id, sdc_id, access_mode).await;

        self.store
            .log_event(
                EventType::VolumeMap,
                format!("volume {volume_id} mapped to sdc {sdc_id}"),
                None,
                Some(volume_id),
                None,
                Some(sdc_id),
            )
            .await;

        Ok(mapping_id)
    }

    /// Writes a mapping descriptor (and a device alias symlink to the
    /// primary replica path) under `<root>/sdc/<node>/mappings/` for test
    /// reproducibility (spec.md §6 "Persisted state").
    async fn publish_mapping_descriptor(&self, volume_id: VolumeId, sdc_id: SdcId, access_mode: AccessMode) {
        let sdc_node_id = {
            let clients = self.store.sdc_clients.read().await;
            match clients.get(&sdc_id) {
                Some(c) => c.cluster_node_id.clone(),
                None => return,
            }
        };

        let dir = self.storage_root.join("sdc").join(&sdc_node_id).join("mappings");
        if let Err(e) = std::fs::create_dir_all(&dir) {
            log::warn!("failed to create mapping directory {}: {e}", dir.display());
            return;
        }

        let descriptor = json!({
            "volume_id": volume_id.0,
            "sdc_id": sdc_id.0,
            "access_mode": access_mode,
        });
        let descriptor_path = dir.join(format!("vol_{}.json", volume_id.0));
        if let Err(e) = std::fs::write(&descriptor_path, descriptor.to_string()) {
            log::warn!("failed to write mapping descriptor {}: {e}", descriptor_path.display());
        }
    }

    pub async fn unmap_volume(&self, volume_id: VolumeId, sdc_id: SdcId) -> AppResult<()> {
        let lock = self.store.lock_volume(volume_id).await;
        let _guard = lock.lock().await;

        let mapping_id = {
            let mappings = self.store.mappings.read().await;
            mappings
                .values()
                .find(|m| m.volume_id == volume_id && m.sdc_id == sdc_id)
                .map(|m| m.id)
                .ok_or_else(|| {
                    AppError::NotFound(format!("no mapping for volume {volume_id}, sdc {sdc_id}"))
                })?
        };
        self.store.mappings.write().await.remove(&mapping_id);

        let sdc_node_id = {
            let clients = self.store.sdc_clients.read().await;
            clients.get(&sdc_id).map(|c| c.cluster_node_id.clone())
        };
        if let Some(node_id) = sdc_node_id {
            let descriptor_path = self
                .storage_root
                .join("sdc")
                .join(&node_id)
                .join("mappings")
                .join(format!("vol_{}.json", volume_id.0));
            let _ = std::fs::remove_file(descriptor_path);
        }

        {
            let mut volumes = self.store.volumes.write().await;
            let volume = volumes.get_mut(&volume_id).unwrap();
            volume.mapping_count = volume.mapping_count.saturating_sub(1);
            if volume.mapping_count == 0 {
                volume.state = VolumeState::Available;
            }
        }

        self.store
            .log_event(
                EventType::VolumeUnmap,
                format!("volume {volume_id} unmapped from sdc {sdc_id}"),
                None,
                Some(volume_id),
                None,
                Some(sdc_id),
            )
            .await;

        Ok(())
    }

    pub async fn extend_volume(&self, volume_id: VolumeId, new_size_bytes: u64) -> AppResult<()> {
        let lock = self.store.lock_volume(volume_id).await;
        let _guard = lock.lock().await;

        let (pool_id, provisioning, old_size, chunk_size_bytes, existing_chunk_count) = {
            let volumes = self.store.volumes.read().await;
            let volume = volumes
                .get(&volume_id)
                .ok_or_else(|| AppError::NotFound(format!("volume {volume_id} not found")))?;
            if new_size_bytes <= volume.size_bytes {
                return Err(AppError::InvalidArgument(
                    "new_size must exceed current size".to_string(),
                ));
            }
            let pools = self.store.pools.read().await;
            let pool = pools.get(&volume.pool_id).unwrap();
            let existing = volume.size_bytes.div_ceil(pool.chunk_size_bytes);
            (
                volume.pool_id,
                volume.provisioning,
                volume.size_bytes,
                pool.chunk_size_bytes,
                existing,
            )
        };

        let additional_bytes = new_size_bytes - old_size;
        self.engine
            .extend_volume_capacity(pool_id, provisioning, additional_bytes)
            .await?;

        let new_chunk_count = new_size_bytes.div_ceil(chunk_size_bytes);
        let added = new_chunk_count.saturating_sub(existing_chunk_count);
        if added > 0 {
            let chunk_ids = self
                .engine
                .allocate_chunks(volume_id, pool_id, existing_chunk_count, added)
                .await?;
            self.ensure_volume_replicas(volume_id, &chunk_ids, new_size_bytes).await;
        }

        {
            let mut volumes = self.store.volumes.write().await;
            volumes.get_mut(&volume_id).unwrap().size_bytes = new_size_bytes;
        }

        self.store
            .log_event(
                EventType::VolumeExtend,
                format!("volume {volume_id} extended to {new_size_bytes} bytes"),
                Some(pool_id),
                Some(volume_id),
                None,
                None,
            )
            .await;

        Ok(())
    }

    pub async fn delete_volume(&self, volume_id: VolumeId) -> AppResult<()> {
        let lock = self.store.lock_volume(volume_id).await;
        let _guard = lock.lock().await;

        let volume = {
            let volumes = self.store.volumes.read().await;
            volumes
                .get(&volume_id)
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("volume {volume_id} not found")))?
        };
        StorageEngine::validate_volume_can_delete(&volume)?;

        {
            let mut volumes = self.store.volumes.write().await;
            volumes.get_mut(&volume_id).unwrap().state = VolumeState::Deleting;
        }

        let chunk_ids: Vec<ChunkId> = self
            .store
            .chunks
            .read()
            .await
            .values()
            .filter(|c| c.volume_id == volume_id)
            .map(|c| c.id)
            .collect();

        {
            let mut replicas = self.store.replicas.write().await;
            let mut sds_nodes = self.store.sds_nodes.write().await;
            let chunk_size_bytes = {
                let pools = self.store.pools.read().await;
                pools.get(&volume.pool_id).unwrap().chunk_size_bytes
            };
            for chunk_id in &chunk_ids {
                let holders: Vec<SdsId> = replicas
                    .keys()
                    .filter(|(c, _)| c == chunk_id)
                    .map(|(_, s)| *s)
                    .collect();
                for sds_id in holders {
                    replicas.remove(&(*chunk_id, sds_id));
                    if let Some(node) = sds_nodes.get_mut(&sds_id) {
                        node.used_capacity_bytes =
                            node.used_capacity_bytes.saturating_sub(chunk_size_bytes);
                    }
                }
            }
        }
        {
            let mut chunks = self.store.chunks.write().await;
            for chunk_id in &chunk_ids {
                chunks.remove(chunk_id);
            }
        }

        self.engine.deallocate_capacity(volume.pool_id, &volume).await?;
        self.store.volumes.write().await.remove(&volume_id);
        self.engine.update_pool_health(volume.pool_id).await?;

        self.store
            .log_event(
                EventType::VolumeDelete,
                format!("volume {volume_id} deleted"),
                Some(volume.pool_id),
                Some(volume_id),
                None,
                None,
            )
            .await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageEngine;

    async fn setup() -> (Arc<MdmStore>, Arc<StorageEngine>, VolumeManager, PoolId) {
        let store = Arc::new(MdmStore::new());
        let engine = Arc::new(StorageEngine::new(store.clone()));
        let tmp = std::env::temp_dir().join(format!("flexsim-volume-test-{}", uuid::Uuid::new_v4()));
        let manager = VolumeManager::new(store.clone(), engine.clone(), tmp);

        let pd_id = store.next_pd_id();
        store
            .protection_domains
            .write()
            .await
            .insert(pd_id, ProtectionDomain { id: pd_id, name: "pd1".into() });

        for i in 0..2 {
            let sds_id = store.next_sds_id();
            store.sds_nodes.write().await.insert(
                sds_id,
                SdsNode {
                    id: sds_id,
                    pd_id,
                    fault_set_id: None,
                    name: format!("sds{i}"),
                    total_capacity_bytes: 1_000_000_000,
                    used_capacity_bytes: 0,
                    state: SdsNodeState::Up,
                    cluster_node_id: format!("sds-{i}"),
                    address: "127.0.0.1".into(),
                    data_port: 7100 + i,
                },
            );
        }

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

        (store, engine, manager, pool_id)
    }

    async fn register_sdc(store: &MdmStore, node_id: &str) -> SdcId {
        let sdc_id = store.next_sdc_id();
        store.sdc_clients.write().await.insert(
            sdc_id,
            SdcClient {
                id: sdc_id,
                name: node_id.to_string(),
                cluster_node_id: node_id.to_string(),
            },
        );
        store.cluster_nodes.write().await.insert(
            node_id.to_string(),
            ClusterNode {
                node_id: node_id.to_string(),
                address: "127.0.0.1".into(),
                control_port: 7300,
                data_port: None,
                capabilities: [ComponentCapability::Sdc].into_iter().collect(),
                status: ComponentStatus::Active,
                registered_at: chrono::Utc::now(),
                last_heartbeat: chrono::Utc::now(),
            },
        );
        sdc_id
    }

    #[tokio::test]
    async fn create_volume_allocates_chunks_and_marks_available() {
        let (store, _engine, manager, pool_id) = setup().await;
        let volume_id = manager
            .create_volume(pool_id, "v1".into(), 10 * 1024 * 1024, Provisioning::Thick)
            .await
            .unwrap();

        let volumes = store.volumes.read().await;
        let volume = volumes.get(&volume_id).unwrap();
        assert_eq!(volume.state, VolumeState::Available);
        assert_eq!(volume.size_bytes, 10 * 1024 * 1024);

        let chunks = store.chunks.read().await;
        let count = chunks.values().filter(|c| c.volume_id == volume_id).count();
        // 10MiB over 4MiB chunks -> 3 chunks.
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn duplicate_volume_name_in_pool_is_rejected() {
        let (_store, _engine, manager, pool_id) = setup().await;
        manager
            .create_volume(pool_id, "dup".into(), 1024, Provisioning::Thin)
            .await
            .unwrap();
        let err = manager
            .create_volume(pool_id, "dup".into(), 1024, Provisioning::Thin)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn map_then_unmap_round_trips_volume_state() {
        let (store, _engine, manager, pool_id) = setup().await;
        let volume_id = manager
            .create_volume(pool_id, "v1".into(), 1024, Provisioning::Thin)
            .await
            .unwrap();
        let sdc_id = register_sdc(&store, "sdc-1").await;

        manager.map_volume(volume_id, sdc_id, AccessMode::ReadWrite).await.unwrap();
        assert_eq!(store.volumes.read().await.get(&volume_id).unwrap().state, VolumeState::InUse);
        assert_eq!(store.volumes.read().await.get(&volume_id).unwrap().mapping_count, 1);

        manager.unmap_volume(volume_id, sdc_id).await.unwrap();
        assert_eq!(store.volumes.read().await.get(&volume_id).unwrap().state, VolumeState::Available);
        assert_eq!(store.volumes.read().await.get(&volume_id).unwrap().mapping_count, 0);
    }

    #[tokio::test]
    async fn map_volume_rejects_inactive_sdc() {
        let (store, _engine, manager, pool_id) = setup().await;
        let volume_id = manager
            .create_volume(pool_id, "v1".into(), 1024, Provisioning::Thin)
            .await
            .unwrap();
        let sdc_id = store.next_sdc_id();
        store.sdc_clients.write().await.insert(
            sdc_id,
            SdcClient {
                id: sdc_id,
                name: "sdc-offline".into(),
                cluster_node_id: "sdc-offline".into(),
            },
        );
        // No cluster_nodes row at all -> not ACTIVE.
        let err = manager
            .map_volume(volume_id, sdc_id, AccessMode::ReadWrite)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::MappingForbidden(_)));
    }

    #[tokio::test]
    async fn extend_volume_allocates_additional_chunks() {
        let (store, _engine, manager, pool_id) = setup().await;
        let volume_id = manager
            .create_volume(pool_id, "v1".into(), 4 * 1024 * 1024, Provisioning::Thick)
            .await
            .unwrap();
        manager.extend_volume(volume_id, 12 * 1024 * 1024).await.unwrap();

        assert_eq!(store.volumes.read().await.get(&volume_id).unwrap().size_bytes, 12 * 1024 * 1024);
        let chunks = store.chunks.read().await;
        let count = chunks.values().filter(|c| c.volume_id == volume_id).count();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn extend_volume_rejects_non_increasing_size() {
        let (_store, _engine, manager, pool_id) = setup().await;
        let volume_id = manager
            .create_volume(pool_id, "v1".into(), 4 * 1024 * 1024, Provisioning::Thick)
            .await
            .unwrap();
        let err = manager.extend_volume(volume_id, 1024).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn delete_volume_frees_chunks_and_replicas() {
        let (store, _engine, manager, pool_id) = setup().await;
        let volume_id = manager
            .create_volume(pool_id, "v1".into(), 4 * 1024 * 1024, Provisioning::Thick)
            .await
            .unwrap();
        manager.delete_volume(volume_id).await.unwrap();

        assert!(store.volumes.read().await.get(&volume_id).is_none());
        assert!(store.chunks.read().await.values().all(|c| c.volume_id != volume_id));
        assert!(store.replicas.read().await.is_empty());
    }

    #[tokio::test]
    async fn delete_volume_with_active_mapping_is_rejected() {
        let (store, _engine, manager, pool_id) = setup().await;
        let volume_id = manager
            .create_volume(pool_id, "v1".into(), 1024, Provisioning::Thin)
            .await
            .unwrap();
        let sdc_id = register_sdc(&store, "sdc-1").await;
        manager.map_volume(volume_id, sdc_id, AccessMode::ReadWrite).await.unwrap();

        let err = manager.delete_volume(volume_id).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }
}
