//! The MDM metadata store: indexed tables keyed by integer id plus
//! in-memory caches (spec.md §9), replacing the original's ORM object
//! graph. Every table is an `RwLock<HashMap<Id, Row>>`; foreign keys are
//! plain ids, looked up through the owning table. Per-volume and
//! per-pool exclusive locks give the ordering guarantees spec.md §5
//! requires for mutating operations without serializing the whole store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::model::*;

#[derive(Default)]
struct IdCounters {
    pd: AtomicI64,
    fault_set: AtomicI64,
    pool: AtomicI64,
    sds: AtomicI64,
    sdc: AtomicI64,
    volume: AtomicI64,
    mapping: AtomicI64,
    chunk: AtomicI64,
    rebuild_job: AtomicI64,
    event: AtomicU64,
}

/// The single source of truth for the MDM control plane. Shared behind an
/// `Arc` by every request handler and background task.
pub struct MdmStore {
    ids: IdCounters,

    pub protection_domains: RwLock<HashMap<PdId, ProtectionDomain>>,
    pub fault_sets: RwLock<HashMap<FaultSetId, FaultSet>>,
    pub pools: RwLock<HashMap<PoolId, StoragePool>>,
    pub sds_nodes: RwLock<HashMap<SdsId, SdsNode>>,
    pub sdc_clients: RwLock<HashMap<SdcId, SdcClient>>,
    pub volumes: RwLock<HashMap<VolumeId, Volume>>,
    pub mappings: RwLock<HashMap<MappingId, VolumeMapping>>,
    pub chunks: RwLock<HashMap<ChunkId, Chunk>>,
    /// Keyed by (chunk_id, sds_id) — a chunk has exactly one replica per SDS.
    pub replicas: RwLock<HashMap<(ChunkId, SdsId), Replica>>,
    pub rebuild_jobs: RwLock<HashMap<RebuildJobId, RebuildJob>>,

    pub cluster_nodes: RwLock<HashMap<String, ClusterNode>>,
    pub components: RwLock<HashMap<String, ComponentRegistry>>,

    pub tokens: RwLock<HashMap<String, IoToken>>,
    pub acks: RwLock<Vec<IoTransactionAck>>,
    pub events: RwLock<Vec<EventRecord>>,

    /// Per-volume exclusive lock for map/unmap/extend/delete (spec.md §5).
    volume_locks: RwLock<HashMap<VolumeId, Arc<Mutex<()>>>>,
    /// Per-pool exclusive lock for rebuild operations.
    pool_locks: RwLock<HashMap<PoolId, Arc<Mutex<()>>>>,
}

impl Default for MdmStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MdmStore {
    pub fn new() -> Self {
        Self {
            ids: IdCounters::default(),
            protection_domains: RwLock::new(HashMap::new()),
            fault_sets: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
            sds_nodes: RwLock::new(HashMap::new()),
            sdc_clients: RwLock::new(HashMap::new()),
            volumes: RwLock::new(HashMap::new()),
            mappings: RwLock::new(HashMap::new()),
            chunks: RwLock::new(HashMap::new()),
            replicas: RwLock::new(HashMap::new()),
            rebuild_jobs: RwLock::new(HashMap::new()),
            cluster_nodes: RwLock::new(HashMap::new()),
            components: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            acks: RwLock::new(Vec::new()),
            events: RwLock::new(Vec::new()),
            volume_locks: RwLock::new(HashMap::new()),
            pool_locks: RwLock::new(HashMap::new()),
        }
    }

    pub fn next_pd_id(&self) -> PdId {
        PdId(self.ids.pd.fetch_add(1, Ordering::Relaxed) + 1)
    }
    pub fn next_fault_set_id(&self) -> FaultSetId {
        FaultSetId(self.ids.fault_set.fetch_add(1, Ordering::Relaxed) + 1)
    }
    pub fn next_pool_id(&self) -> PoolId {
        PoolId(self.ids.pool.fetch_add(1, Ordering::Relaxed) + 1)
    }
    pub fn next_sds_id(&self) -> SdsId {
        SdsId(self.ids.sds.fetch_add(1, Ordering::Relaxed) + 1)
    }
    pub fn next_sdc_id(&self) -> SdcId {
        SdcId(self.ids.sdc.fetch_add(1, Ordering::Relaxed) + 1)
    }
    pub fn next_volume_id(&self) -> VolumeId {
        VolumeId(self.ids.volume.fetch_add(1, Ordering::Relaxed) + 1)
    }
    pub fn next_mapping_id(&self) -> MappingId {
        MappingId(self.ids.mapping.fetch_add(1, Ordering::Relaxed) + 1)
    }
    pub fn next_chunk_id(&self) -> ChunkId {
        ChunkId(self.ids.chunk.fetch_add(1, Ordering::Relaxed) + 1)
    }
    pub fn next_rebuild_job_id(&self) -> RebuildJobId {
        RebuildJobId(self.ids.rebuild_job.fetch_add(1, Ordering::Relaxed) + 1)
    }
    pub fn next_event_id(&self) -> u64 {
        self.ids.event.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Acquires the exclusive lock for a volume, creating it on first use.
    /// Held for the duration of map/unmap/extend/delete.
    pub async fn lock_volume(&self, id: VolumeId) -> Arc<Mutex<()>> {
        if let Some(lock) = self.volume_locks.read().await.get(&id) {
            return lock.clone();
        }
        let mut guard = self.volume_locks.write().await;
        guard
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquires the exclusive lock for a pool, creating it on first use.
    /// Held for the duration of rebuild start/tick/fail/recover.
    pub async fn lock_pool(&self, id: PoolId) -> Arc<Mutex<()>> {
        if let Some(lock) = self.pool_locks.read().await.get(&id) {
            return lock.clone();
        }
        let mut guard = self.pool_locks.write().await;
        guard
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn log_event(
        &self,
        event_type: EventType,
        message: impl Into<String>,
        pool_id: Option<PoolId>,
        volume_id: Option<VolumeId>,
        sds_id: Option<SdsId>,
        sdc_id: Option<SdcId>,
    ) {
        let record = EventRecord {
            id: self.next_event_id(),
            event_type,
            message: message.into(),
            pool_id,
            volume_id,
            sds_id,
            sdc_id,
            at: chrono::Utc::now(),
        };
        log::info!(
            "event {:?}: {} (pool={:?} volume={:?} sds={:?} sdc={:?})",
            record.event_type,
            record.message,
            pool_id,
            volume_id,
            sds_id,
            sdc_id
        );
        self.events.write().await.push(record);
    }
}
