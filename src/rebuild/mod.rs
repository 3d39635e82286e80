//! Rebuild engine (C4): node fail/recover handlers, rebuild job lifecycle
//! and rate limiting. Grounded directly on
//! `mdm/services/rebuild_engine.py`, including its constants.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use crate::error::{AppError, AppResult};
use crate::model::*;
use crate::storage::{select_replica_targets, StorageEngine};
use crate::store::MdmStore;

pub const REBUILD_CHUNK_SIZE_MB: u64 = 4;
pub const STALL_DETECTION_TIMEOUT_SECS: i64 = 60;

pub struct RebuildEngine {
    store: Arc<MdmStore>,
    engine: Arc<StorageEngine>,
}

impl RebuildEngine {
    pub fn new(store: Arc<MdmStore>, engine: Arc<StorageEngine>) -> Self {
        Self { store, engine }
    }

    /// Transitions an SDS to DOWN, degrades every replica/chunk it held,
    /// and auto-starts a rebuild job for each affected pool.
    pub async fn fail_sds_node(&self, sds_id: SdsId) -> AppResult<()> {
        let (pd_id, already_down) = {
            let nodes = self.store.sds_nodes.read().await;
            let node = nodes
                .get(&sds_id)
                .ok_or_else(|| AppError::NotFound(format!("sds {sds_id} not found")))?;
            (node.pd_id, node.state == SdsNodeState::Down)
        };
        if already_down {
            return Err(AppError::Conflict(format!("sds {sds_id} already DOWN")));
        }

        {
            let mut nodes = self.store.sds_nodes.write().await;
            nodes.get_mut(&sds_id).unwrap().state = SdsNodeState::Down;
        }

        let affected_pools: Vec<PoolId> = self
            .store
            .pools
            .read()
            .await
            .values()
            .filter(|p| p.pd_id == pd_id)
            .map(|p| p.id)
            .collect();

        self.store
            .log_event(
                EventType::SdsStateChange,
                format!("sds {sds_id} transitioned to DOWN"),
                None,
                None,
                Some(sds_id),
                None,
            )
            .await;

        for pool_id in affected_pools {
            let has_replica = {
                let replicas = self.store.replicas.read().await;
                replicas.keys().any(|(_, s)| *s == sds_id)
                    && self.pool_has_replica_on(pool_id, sds_id).await
            };
            if !has_replica {
                continue;
            }

            let pool_lock = self.store.lock_pool(pool_id).await;
            let _guard = pool_lock.lock().await;

            self.engine.mark_chunks_degraded(sds_id, pool_id).await?;
            {
                let mut pools = self.store.pools.write().await;
                let pool = pools.get_mut(&pool_id).unwrap();
                pool.health = PoolHealth::Degraded;
                pool.rebuild_state = RebuildState::Idle;
            }

            if let Err(e) = self.start_rebuild(pool_id).await {
                self.store
                    .log_event(
                        EventType::RebuildFailed,
                        format!("auto rebuild start failed for pool {pool_id}: {e}"),
                        Some(pool_id),
                        None,
                        Some(sds_id),
                        None,
                    )
                    .await;
            }
        }

        Ok(())
    }

    async fn pool_has_replica_on(&self, pool_id: PoolId, sds_id: SdsId) -> bool {
        let volume_ids: Vec<VolumeId> = self
            .store
            .volumes
            .read()
            .await
            .values()
            .filter(|v| v.pool_id == pool_id)
            .map(|v| v.id)
            .collect();
        let chunks = self.store.chunks.read().await;
        let replicas = self.store.replicas.read().await;
        chunks
            .values()
            .filter(|c| volume_ids.contains(&c.volume_id))
            .any(|c| replicas.contains_key(&(c.id, sds_id)))
    }

    /// Transitions an SDS back to UP, heals its replicas/chunks, and
    /// recomputes health for every affected pool.
    pub async fn recover_sds_node(&self, sds_id: SdsId) -> AppResult<()> {
        let pd_id = {
            let nodes = self.store.sds_nodes.read().await;
            let node = nodes
                .get(&sds_id)
                .ok_or_else(|| AppError::NotFound(format!("sds {sds_id} not found")))?;
            if node.state != SdsNodeState::Down {
                return Err(AppError::Conflict(format!("sds {sds_id} is not DOWN")));
            }
            node.pd_id
        };

        {
            let mut nodes = self.store.sds_nodes.write().await;
            nodes.get_mut(&sds_id).unwrap().state = SdsNodeState::Up;
        }

        self.store
            .log_event(
                EventType::SdsStateChange,
                format!("sds {sds_id} recovered to UP"),
                None,
                None,
                Some(sds_id),
                None,
            )
            .await;

        let affected_pools: Vec<PoolId> = self
            .store
            .pools
            .read()
            .await
            .values()
            .filter(|p| p.pd_id == pd_id)
            .map(|p| p.id)
            .collect();

        for pool_id in affected_pools {
            let pool_lock = self.store.lock_pool(pool_id).await;
            let _guard = pool_lock.lock().await;
            self.engine.heal_chunks_on_recovery(sds_id, pool_id).await?;
            self.engine.update_pool_health(pool_id).await?;
        }
        Ok(())
    }

    /// Starts a rebuild job for `pool_id`: refuses if a non-terminal job
    /// already exists, collects degraded chunks, picks rebuild targets,
    /// and creates `is_rebuilding` replicas.
    pub async fn start_rebuild(&self, pool_id: PoolId) -> AppResult<RebuildJobId> {
        {
            let jobs = self.store.rebuild_jobs.read().await;
            if jobs.values().any(|j| {
                j.pool_id == pool_id
                    && matches!(j.state, RebuildState::InProgress | RebuildState::Stalled)
            }) {
                return Err(AppError::Conflict(format!(
                    "pool {pool_id} already has a non-terminal rebuild job"
                )));
            }
        }

        let (pd_id, protection_policy, chunk_size_bytes) = {
            let pools = self.store.pools.read().await;
            let pool = pools
                .get(&pool_id)
                .ok_or_else(|| AppError::NotFound(format!("pool {pool_id} not found")))?;
            (pool.pd_id, pool.protection_policy, pool.chunk_size_bytes)
        };
        let required = protection_policy.replica_count();

        let volume_ids: Vec<VolumeId> = self
            .store
            .volumes
            .read()
            .await
            .values()
            .filter(|v| v.pool_id == pool_id)
            .map(|v| v.id)
            .collect();

        let degraded_chunks: Vec<ChunkId> = self
            .store
            .chunks
            .read()
            .await
            .values()
            .filter(|c| volume_ids.contains(&c.volume_id) && c.is_degraded)
            .map(|c| c.id)
            .collect();

        if degraded_chunks.is_empty() {
            return Err(AppError::InvalidArgument(format!(
                "pool {pool_id} has no degraded chunks to rebuild"
            )));
        }

        let eligible: Vec<SdsNode> = self
            .store
            .sds_nodes
            .read()
            .await
            .values()
            .filter(|s| s.pd_id == pd_id && s.state == SdsNodeState::Up)
            .cloned()
            .collect();

        let mut new_replicas = Vec::new();
        {
            let replicas = self.store.replicas.read().await;
            for chunk_id in &degraded_chunks {
                let holders: Vec<SdsId> = replicas
                    .keys()
                    .filter(|(c, _)| c == chunk_id)
                    .map(|(_, s)| *s)
                    .collect();
                let targets = select_replica_targets(&eligible, &holders, required - holders.len().min(required));
                for sds_id in targets {
                    new_replicas.push((*chunk_id, sds_id));
                }
            }
        }

        {
            let mut replicas = self.store.replicas.write().await;
            for (chunk_id, sds_id) in &new_replicas {
                replicas.insert(
                    (*chunk_id, *sds_id),
                    Replica {
                        chunk_id: *chunk_id,
                        sds_id: *sds_id,
                        is_available: false,
                        is_current: false,
                        is_rebuilding: true,
                    },
                );
            }
        }

        let total_bytes_to_rebuild = degraded_chunks.len() as u64 * chunk_size_bytes;
        let job_id = self.store.next_rebuild_job_id();
        let job = RebuildJob {
            id: job_id,
            pool_id,
            state: RebuildState::InProgress,
            progress_percent: 0.0,
            total_bytes_to_rebuild,
            bytes_rebuilt: 0,
            current_rate_bytes_per_sec: 0,
            started_at: Utc::now(),
            completed_at: None,
            estimated_time_remaining_secs: None,
        };
        self.store.rebuild_jobs.write().await.insert(job_id, job);

        {
            let mut pools = self.store.pools.write().await;
            pools.get_mut(&pool_id).unwrap().rebuild_state = RebuildState::InProgress;
        }

        self.store
            .log_event(
                EventType::RebuildStarted,
                format!(
                    "rebuild started for pool {pool_id}: {} degraded chunks",
                    degraded_chunks.len()
                ),
                Some(pool_id),
                None,
                None,
                None,
            )
            .await;

        Ok(job_id)
    }

    /// One progress tick, driven by a periodic timer. Converts the pool's
    /// rate limit into a chunk budget, completes that many rebuilding
    /// replicas, and finalizes the job when none remain. Detects stalls.
    pub async fn tick_progress(&self, pool_id: PoolId) -> AppResult<()> {
        let job_id = {
            let jobs = self.store.rebuild_jobs.read().await;
            jobs.values()
                .find(|j| j.pool_id == pool_id && j.state == RebuildState::InProgress)
                .map(|j| j.id)
        };
        let Some(job_id) = job_id else { return Ok(()) };
        tracing::debug!("rebuild tick for pool {pool_id}, job {job_id}");

        let pool_lock = self.store.lock_pool(pool_id).await;
        let _guard = pool_lock.lock().await;

        let volume_ids: Vec<VolumeId> = self
            .store
            .volumes
            .read()
            .await
            .values()
            .filter(|v| v.pool_id == pool_id)
            .map(|v| v.id)
            .collect();
        let pool_chunks: HashSet<ChunkId> = self
            .store
            .chunks
            .read()
            .await
            .values()
            .filter(|c| volume_ids.contains(&c.volume_id))
            .map(|c| c.id)
            .collect();

        let rebuilding: Vec<(ChunkId, SdsId)> = self
            .store
            .replicas
            .read()
            .await
            .values()
            .filter(|r| r.is_rebuilding && pool_chunks.contains(&r.chunk_id))
            .map(|r| (r.chunk_id, r.sds_id))
            .collect();

        if rebuilding.is_empty() {
            let required = {
                let pools = self.store.pools.read().await;
                pools.get(&pool_id).unwrap().protection_policy.replica_count()
            };
            {
                let replicas = self.store.replicas.read().await;
                let mut chunks = self.store.chunks.write().await;
                for chunk_id in &pool_chunks {
                    let available = replicas
                        .values()
                        .filter(|r| r.chunk_id == *chunk_id && r.is_available)
                        .count();
                    if available >= required {
                        if let Some(chunk) = chunks.get_mut(chunk_id) {
                            chunk.is_degraded = false;
                        }
                    }
                }
            }

            {
                let mut jobs = self.store.rebuild_jobs.write().await;
                let job = jobs.get_mut(&job_id).unwrap();
                job.state = RebuildState::Completed;
                job.progress_percent = 100.0;
                job.bytes_rebuilt = job.total_bytes_to_rebuild;
                job.completed_at = Some(Utc::now());
                job.estimated_time_remaining_secs = Some(0);
            }
            {
                let mut pools = self.store.pools.write().await;
                pools.get_mut(&pool_id).unwrap().rebuild_state = RebuildState::Completed;
            }
            self.engine.update_pool_health(pool_id).await?;

            self.store
                .log_event(
                    EventType::RebuildCompleted,
                    format!("rebuild completed for pool {pool_id}"),
                    Some(pool_id),
                    None,
                    None,
                    None,
                )
                .await;
            return Ok(());
        }

        let rate_bytes_per_sec = {
            let pools = self.store.pools.read().await;
            pools.get(&pool_id).unwrap().rebuild_rate_limit_bytes_per_sec
        };
        let chunk_size_bytes = REBUILD_CHUNK_SIZE_MB * 1024 * 1024;
        let replicas_to_complete =
            ((rate_bytes_per_sec as f64 / chunk_size_bytes as f64).floor() as usize).max(1);

        let mut replicas = self.store.replicas.write().await;
        let mut completed = 0u64;
        for (chunk_id, sds_id) in rebuilding.into_iter().take(replicas_to_complete) {
            if let Some(replica) = replicas.get_mut(&(chunk_id, sds_id)) {
                replica.is_rebuilding = false;
                replica.is_available = true;
                replica.is_current = true;
                completed += 1;
            }
        }
        drop(replicas);

        let new_bytes_rebuilt = completed * chunk_size_bytes;
        let (started_at, stalled) = {
            let mut jobs = self.store.rebuild_jobs.write().await;
            let job = jobs.get_mut(&job_id).unwrap();
            job.bytes_rebuilt += new_bytes_rebuilt;
            job.current_rate_bytes_per_sec = rate_bytes_per_sec;
            job.progress_percent = ((job.bytes_rebuilt as f64
                / job.total_bytes_to_rebuild.max(1) as f64)
                * 100.0)
                .min(100.0);
            let remaining = job.total_bytes_to_rebuild.saturating_sub(job.bytes_rebuilt);
            job.estimated_time_remaining_secs = if rate_bytes_per_sec > 0 {
                Some(remaining / rate_bytes_per_sec)
            } else {
                None
            };

            let since_start = Utc::now().signed_duration_since(job.started_at).num_seconds();
            let stalled =
                since_start > STALL_DETECTION_TIMEOUT_SECS && new_bytes_rebuilt == 0;
            if stalled {
                job.state = RebuildState::Stalled;
            }
            (job.started_at, stalled)
        };
        let _ = started_at;

        if stalled {
            let mut pools = self.store.pools.write().await;
            pools.get_mut(&pool_id).unwrap().rebuild_state = RebuildState::Stalled;
            drop(pools);
            self.store
                .log_event(
                    EventType::RebuildFailed,
                    format!("rebuild stalled for pool {pool_id}"),
                    Some(pool_id),
                    None,
                    None,
                    None,
                )
                .await;
        }

        Ok(())
    }

    pub async fn get_rebuild_status(&self, pool_id: PoolId) -> Option<RebuildJob> {
        self.store
            .rebuild_jobs
            .read()
            .await
            .values()
            .filter(|j| j.pool_id == pool_id)
            .max_by_key(|j| j.started_at)
            .cloned()
    }
}
