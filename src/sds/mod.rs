//! SDS data server (C9): the process that actually owns bytes. Spec.md §5
//! names three listeners (data, control, management); this module drives
//! the data listener plus the background ack/heartbeat senders that keep
//! the MDM's view of this node current. Grounded on `sds/data_handler.py`'s
//! write-intent/commit sequencing and `sds/token_verifier.py`'s replay table.

pub mod backing;
pub mod listener;
pub mod management;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use colored::Colorize;
use tokio::sync::RwLock;

use crate::config::ServiceConfig;

/// Running IO counters surfaced over the management listener (spec.md §5,
/// grounded on `sds/mgmt_app.py`'s `/mgmt/stats`).
#[derive(Default)]
pub struct SdsStats {
    pub total_io_operations: AtomicU64,
    pub total_bytes_read: AtomicU64,
    pub total_bytes_written: AtomicU64,
    pub total_errors: AtomicU64,
}

/// Per-token replay guard: a token_id that has already completed one
/// successful I/O is rejected on a second attempt (spec.md §4.9, "Replay").
pub struct ConsumedTokens {
    seen: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl Default for ConsumedTokens {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumedTokens {
    pub fn new() -> Self {
        Self {
            seen: RwLock::new(HashMap::new()),
        }
    }

    pub async fn is_consumed(&self, token_id: &str) -> bool {
        self.seen.read().await.contains_key(token_id)
    }

    pub async fn mark_consumed(&self, token_id: &str) {
        self.seen.write().await.insert(token_id.to_string(), Utc::now());
    }

    /// Bounded-batch sweep dropping entries past `ttl_secs`, so the replay
    /// table doesn't grow without bound across a long-running process
    /// (SPEC_FULL.md §2, supplemented from the original's consumed-token
    /// cleanup cycle).
    pub async fn cleanup_expired(&self, ttl_secs: i64, batch_size: usize) -> usize {
        let now = Utc::now();
        let mut seen = self.seen.write().await;
        let expired: Vec<String> = seen
            .iter()
            .filter(|(_, at)| now - **at > chrono::Duration::seconds(ttl_secs))
            .take(batch_size)
            .map(|(k, _)| k.clone())
            .collect();
        let removed = expired.len();
        for key in expired {
            seen.remove(&key);
        }
        removed
    }
}

/// One pending transaction ack, mirroring the original's `AckQueue` row
/// (`sds/ack_sender.py`): `chunk_id`/`checksum` are only populated for
/// writes, `retry_count` bounds how long a failed send is retried before
/// it's dropped on the floor.
#[derive(Debug, Clone)]
pub struct AckEntry {
    pub token_id: String,
    pub success: bool,
    pub bytes_processed: u64,
    pub duration_ms: u64,
    pub chunk_id: Option<crate::model::ChunkId>,
    pub checksum: Option<String>,
    pub retry_count: u32,
}

/// FIFO of not-yet-acknowledged transactions, drained by
/// [`SdsService::spawn_ack_sender`] on `ack_batch_interval_secs` cadence.
pub struct AckQueue {
    entries: RwLock<std::collections::VecDeque<AckEntry>>,
}

const MAX_ACK_RETRIES: u32 = 5;

impl Default for AckQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AckQueue {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(std::collections::VecDeque::new()),
        }
    }

    pub async fn enqueue(&self, entry: AckEntry) {
        self.entries.write().await.push_back(entry);
    }

    async fn drain_batch(&self, batch_size: usize) -> Vec<AckEntry> {
        let mut entries = self.entries.write().await;
        let take = batch_size.min(entries.len());
        entries.drain(..take).collect()
    }

    async fn requeue(&self, entry: AckEntry) {
        self.entries.write().await.push_back(entry);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

pub struct SdsService {
    pub node_id: String,
    pub config: Arc<ServiceConfig>,
    pub storage_root: PathBuf,
    pub cluster_secret: RwLock<Option<String>>,
    pub consumed_tokens: ConsumedTokens,
    pub ack_queue: AckQueue,
    pub stats: SdsStats,
    pub started_at: DateTime<Utc>,
    /// This node's own `SdsId` as assigned by the MDM's storage-pool API
    /// (`POST /sds`), resolved lazily by matching `cluster_node_id` against
    /// `GET /sds` since the SDS process itself doesn't mint that id.
    pub sds_id: RwLock<Option<crate::model::SdsId>>,
    /// One lock per chunk this node holds a replica for, so concurrent
    /// writes to the same chunk serialize (spec.md §5, "a lightweight
    /// per-chunk lock").
    chunk_locks: RwLock<HashMap<crate::model::ChunkId, Arc<tokio::sync::Mutex<()>>>>,
    http: reqwest::Client,
}

impl SdsService {
    pub fn new(node_id: String, config: Arc<ServiceConfig>) -> Self {
        let storage_root = PathBuf::from(&config.storage_root).join("sds").join(&node_id);
        Self {
            node_id,
            config,
            storage_root,
            cluster_secret: RwLock::new(None),
            consumed_tokens: ConsumedTokens::new(),
            ack_queue: AckQueue::new(),
            stats: SdsStats::default(),
            started_at: Utc::now(),
            sds_id: RwLock::new(None),
            chunk_locks: RwLock::new(HashMap::new()),
            http: reqwest::Client::new(),
        }
    }

    /// Acquires the exclusive lock for a chunk, creating it on first use.
    pub async fn lock_chunk(&self, chunk_id: crate::model::ChunkId) -> Arc<tokio::sync::Mutex<()>> {
        if let Some(lock) = self.chunk_locks.read().await.get(&chunk_id) {
            return lock.clone();
        }
        let mut guard = self.chunk_locks.write().await;
        guard
            .entry(chunk_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Looks this node's numeric `SdsId` up from the MDM's `GET /sds` list
    /// by matching `cluster_node_id`. Returns `None` (logged, not fatal) if
    /// an operator hasn't registered this node into a pool yet.
    pub async fn resolve_sds_id(&self) -> Option<crate::model::SdsId> {
        if let Some(id) = *self.sds_id.read().await {
            return Some(id);
        }
        let url = format!("{}/sds/list", self.config.mdm_base_url);
        let response = self.http.get(&url).send().await.ok()?;
        let nodes: Vec<crate::model::SdsNode> = response.json().await.ok()?;
        let node = nodes.into_iter().find(|n| n.cluster_node_id == self.node_id)?;
        *self.sds_id.write().await = Some(node.id);
        Some(node.id)
    }

    /// Registers with the MDM over HTTP, storing the returned cluster
    /// secret — I/O tokens can't be verified until this succeeds (spec.md
    /// §4.7's handshake).
    pub async fn register_with_mdm(&self) -> anyhow::Result<()> {
        let url = format!("{}/discovery/register", self.config.mdm_base_url);
        let body = serde_json::json!({
            "component_id": self.node_id,
            "component_type": "sds",
            "address": "127.0.0.1",
            "control_port": self.config.control_plane_base_port,
            "data_port": self.config.data_plane_base_port,
            "mgmt_port": self.config.management_port,
            "metadata": {},
            "auth_token": serde_json::Value::Null,
        });
        let response = self.http.post(&url).json(&body).send().await?;
        let parsed: serde_json::Value = response.json().await?;
        if let Some(secret) = parsed.get("cluster_secret").and_then(|v| v.as_str()) {
            *self.cluster_secret.write().await = Some(secret.to_string());
            log::info!("{}", format!("{} registered, received cluster secret", self.node_id).green());
        } else {
            log::info!("{} re-registered with mdm (secret already known)", self.node_id);
        }
        Ok(())
    }

    /// Background loop posting a heartbeat to the MDM at
    /// `heartbeat_interval_secs` cadence. Errors are logged, never fatal.
    pub fn spawn_heartbeat_sender(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(this.config.heartbeat_interval_secs));
            loop {
                interval.tick().await;
                let url = format!("{}/discovery/heartbeat", this.config.mdm_base_url);
                let body = serde_json::json!({ "component_id": this.node_id });
                if let Err(err) = this.http.post(&url).json(&body).send().await {
                    log::warn!("heartbeat send failed for {}: {err}", this.node_id);
                }
            }
        })
    }

    /// Background loop sweeping the replay table so it doesn't grow without
    /// bound (SPEC_FULL.md §2).
    pub fn spawn_replay_table_cleaner(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let removed = this
                    .consumed_tokens
                    .cleanup_expired(this.config.plan_cache_ttl_secs as i64 * 4, 256)
                    .await;
                if removed > 0 {
                    log::debug!("{} swept {removed} expired replay entries", this.node_id);
                }
            }
        })
    }

    /// Background loop batching pending acks to the MDM's `/tx/ack`
    /// endpoint at `ack_batch_interval_secs` cadence, grounded on
    /// `sds/ack_sender.py`'s `_send_batch`/`_send_single_ack`. A failed
    /// send is requeued with an incremented `retry_count` up to
    /// [`MAX_ACK_RETRIES`], then dropped.
    pub fn spawn_ack_sender(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(this.config.ack_batch_interval_secs));
            loop {
                interval.tick().await;
                let batch = this.ack_queue.drain_batch(this.config.ack_batch_size).await;
                if batch.is_empty() {
                    continue;
                }
                let Some(sds_id) = this.resolve_sds_id().await else {
                    log::warn!(
                        "{} has {} pending acks but no resolved sds_id yet; requeuing",
                        this.node_id,
                        batch.len()
                    );
                    for entry in batch {
                        this.ack_queue.requeue(entry).await;
                    }
                    continue;
                };

                let mut sent = 0usize;
                let mut failed = 0usize;
                for mut entry in batch {
                    match this.send_single_ack(sds_id, &entry).await {
                        Ok(()) => sent += 1,
                        Err(err) => {
                            failed += 1;
                            entry.retry_count += 1;
                            log::warn!("ack send failed for token {}: {err}", entry.token_id);
                            if entry.retry_count < MAX_ACK_RETRIES {
                                this.ack_queue.requeue(entry).await;
                            } else {
                                log::error!(
                                    "dropping ack for token {} after {} retries",
                                    entry.token_id,
                                    entry.retry_count
                                );
                            }
                        }
                    }
                }
                log::debug!("{} ack batch: sent={sent} failed={failed}", this.node_id);
            }
        })
    }

    async fn send_single_ack(&self, sds_id: crate::model::SdsId, entry: &AckEntry) -> anyhow::Result<()> {
        let url = format!("{}/tx/ack", self.config.mdm_base_url);
        let body = serde_json::json!({
            "token_id": entry.token_id,
            "sds_id": sds_id.0,
            "success": entry.success,
            "bytes_processed": entry.bytes_processed,
            "duration_ms": entry.duration_ms,
            "chunk_id": entry.chunk_id.map(|c| c.0),
            "checksum": entry.checksum,
        });
        let response = self.http.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("mdm returned {}", response.status());
        }
        Ok(())
    }
}
