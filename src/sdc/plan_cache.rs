//! Client-side I/O plan cache (C10), spec.md §4.10: avoid round-tripping to
//! the MDM for every read/write when the same `(volume, op, range)` was
//! planned recently. Grounded on `sdc/data_client.py`'s plan reuse and
//! generalized with a TTL the way [`crate::sds::ConsumedTokens`] ages out
//! replay entries.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::control_api::plan::IoPlan;
use crate::model::{IoOp, VolumeId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    op: IoOp,
    volume_id: VolumeId,
    offset_bytes: u64,
    length_bytes: u64,
}

struct CacheEntry {
    plan: IoPlan,
    cached_at: Instant,
}

pub struct PlanCache {
    ttl: Duration,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl PlanCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_secs),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, op: IoOp, volume_id: VolumeId, offset_bytes: u64, length_bytes: u64) -> Option<IoPlan> {
        let key = CacheKey {
            op,
            volume_id,
            offset_bytes,
            length_bytes,
        };
        let entries = self.entries.read().await;
        let entry = entries.get(&key)?;
        if entry.cached_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.plan.clone())
    }

    pub async fn insert(&self, op: IoOp, volume_id: VolumeId, offset_bytes: u64, length_bytes: u64, plan: IoPlan) {
        let key = CacheKey {
            op,
            volume_id,
            offset_bytes,
            length_bytes,
        };
        self.entries.write().await.insert(
            key,
            CacheEntry {
                plan,
                cached_at: Instant::now(),
            },
        );
    }

    /// Drops every cached plan for a volume — called whenever a target
    /// I/O error suggests the plan is stale (spec.md §4.10, "invalidate on
    /// target error").
    pub async fn invalidate_volume(&self, volume_id: VolumeId) {
        self.entries.write().await.retain(|key, _| key.volume_id != volume_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IoMode;
    use crate::model::SdcId;

    fn sample_plan(volume_id: VolumeId) -> IoPlan {
        IoPlan {
            op: IoOp::Read,
            volume_id,
            sdc_id: SdcId(1),
            offset_bytes: 0,
            length_bytes: 1024,
            io_mode: IoMode::NetworkOnly,
            write_policy: None,
            read_policy: None,
            segments: Vec::new(),
            plan_generation: "fingerprint".to_string(),
        }
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let cache = PlanCache::new(30);
        cache.insert(IoOp::Read, VolumeId(1), 0, 1024, sample_plan(VolumeId(1))).await;
        let got = cache.get(IoOp::Read, VolumeId(1), 0, 1024).await;
        assert!(got.is_some());
        assert_eq!(got.unwrap().plan_generation, "fingerprint");
    }

    #[tokio::test]
    async fn get_misses_on_different_range() {
        let cache = PlanCache::new(30);
        cache.insert(IoOp::Read, VolumeId(1), 0, 1024, sample_plan(VolumeId(1))).await;
        assert!(cache.get(IoOp::Read, VolumeId(1), 1024, 1024).await.is_none());
    }

    #[tokio::test]
    async fn expired_entry_is_not_returned() {
        let cache = PlanCache::new(0);
        cache.insert(IoOp::Read, VolumeId(1), 0, 1024, sample_plan(VolumeId(1))).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.get(IoOp::Read, VolumeId(1), 0, 1024).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_volume_drops_only_that_volumes_entries() {
        let cache = PlanCache::new(30);
        cache.insert(IoOp::Read, VolumeId(1), 0, 1024, sample_plan(VolumeId(1))).await;
        cache.insert(IoOp::Read, VolumeId(2), 0, 1024, sample_plan(VolumeId(2))).await;

        cache.invalidate_volume(VolumeId(1)).await;

        assert!(cache.get(IoOp::Read, VolumeId(1), 0, 1024).await.is_none());
        assert!(cache.get(IoOp::Read, VolumeId(2), 0, 1024).await.is_some());
    }
}
