//! Entity rows, per spec.md §3. Bidirectional relationships (volume↔pool↔PD,
//! chunk↔replica↔sds) are integer foreign keys into [`crate::store::MdmStore`]
//! tables, never object references — no cycles to fight the borrow checker
//! over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::enums::*;
use super::ids::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionDomain {
    pub id: PdId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultSet {
    pub id: FaultSetId,
    pub pd_id: PdId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePool {
    pub id: PoolId,
    pub pd_id: PdId,
    pub name: String,
    pub total_capacity_bytes: u64,
    pub used_capacity_bytes: u64,
    pub reserved_capacity_bytes: u64,
    pub protection_policy: ProtectionPolicy,
    pub chunk_size_bytes: u64,
    pub rebuild_rate_limit_bytes_per_sec: u64,
    pub health: PoolHealth,
    pub rebuild_state: RebuildState,
}

impl StoragePool {
    pub fn available_capacity_bytes(&self) -> u64 {
        self.total_capacity_bytes
            .saturating_sub(self.used_capacity_bytes)
            .saturating_sub(self.reserved_capacity_bytes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdsNode {
    pub id: SdsId,
    pub pd_id: PdId,
    pub fault_set_id: Option<FaultSetId>,
    pub name: String,
    pub total_capacity_bytes: u64,
    pub used_capacity_bytes: u64,
    pub state: SdsNodeState,
    pub cluster_node_id: String,
    pub address: String,
    pub data_port: u16,
}

impl SdsNode {
    pub fn load_ratio(&self) -> f64 {
        if self.total_capacity_bytes == 0 {
            return 1.0;
        }
        self.used_capacity_bytes as f64 / self.total_capacity_bytes as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdcClient {
    pub id: SdcId,
    pub name: String,
    pub cluster_node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub pool_id: PoolId,
    pub name: String,
    pub size_bytes: u64,
    pub provisioning: Provisioning,
    pub state: VolumeState,
    pub mapping_count: u32,
    pub used_capacity_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMapping {
    pub id: MappingId,
    pub volume_id: VolumeId,
    pub sdc_id: SdcId,
    pub access_mode: AccessMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub volume_id: VolumeId,
    pub chunk_index: u64,
    pub is_degraded: bool,
    pub generation: u64,
    pub checksum: Option<String>,
    pub last_write_offset: Option<u64>,
    pub last_write_length: Option<u64>,
    pub last_write_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Replica {
    pub chunk_id: ChunkId,
    pub sds_id: SdsId,
    pub is_available: bool,
    pub is_current: bool,
    pub is_rebuilding: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    pub node_id: String,
    pub address: String,
    pub control_port: u16,
    pub data_port: Option<u16>,
    pub capabilities: HashSet<ComponentCapability>,
    pub status: ComponentStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentRegistry {
    pub component_id: String,
    pub component_type: String,
    pub cluster_name: String,
    pub auth_token_hash: String,
    pub address: String,
    pub control_port: u16,
    pub data_port: Option<u16>,
    pub mgmt_port: Option<u16>,
    pub status: ComponentStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoToken {
    pub token_id: String,
    pub volume_id: VolumeId,
    pub sdc_id: SdcId,
    pub operation: IoOp,
    pub offset_bytes: u64,
    pub length_bytes: u64,
    pub io_plan: serde_json::Value,
    pub signature: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: TokenStatus,
    pub consumed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoTransactionAck {
    pub token_id: String,
    pub sds_id: SdsId,
    pub success: bool,
    pub bytes_processed: u64,
    pub duration_ms: u64,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildJob {
    pub id: RebuildJobId,
    pub pool_id: PoolId,
    pub state: RebuildState,
    pub progress_percent: f64,
    pub total_bytes_to_rebuild: u64,
    pub bytes_rebuilt: u64,
    pub current_rate_bytes_per_sec: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_time_remaining_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: u64,
    pub event_type: EventType,
    pub message: String,
    pub pool_id: Option<PoolId>,
    pub volume_id: Option<VolumeId>,
    pub sds_id: Option<SdsId>,
    pub sdc_id: Option<SdcId>,
    pub at: DateTime<Utc>,
}
