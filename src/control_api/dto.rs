//! Request/response DTOs for the control-plane API. Every mutating
//! endpoint returns `{status, id_or_message}` at minimum (spec.md §6).

use serde::{Deserialize, Serialize};

use crate::model::*;

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub status: &'static str,
    pub id_or_message: String,
}

impl ApiResponse {
    pub fn ok(id_or_message: impl Into<String>) -> Self {
        Self {
            status: "ok",
            id_or_message: id_or_message.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreatePdRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateFaultSetRequest {
    pub pd_id: i64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CreatePoolRequest {
    pub pd_id: i64,
    pub name: String,
    pub total_capacity_bytes: u64,
    pub protection_policy: ProtectionPolicy,
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: u64,
    #[serde(default = "default_rebuild_rate")]
    pub rebuild_rate_limit_bytes_per_sec: u64,
}

fn default_chunk_size() -> u64 {
    4 * 1024 * 1024
}
fn default_rebuild_rate() -> u64 {
    100 * 1024 * 1024
}

#[derive(Debug, Deserialize)]
pub struct RegisterSdsRequest {
    pub pd_id: i64,
    pub fault_set_id: Option<i64>,
    pub name: String,
    pub total_capacity_bytes: u64,
    pub cluster_node_id: String,
    pub address: String,
    pub data_port: u16,
}

#[derive(Debug, Deserialize)]
pub struct RegisterSdcRequest {
    pub name: String,
    pub cluster_node_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateVolumeRequest {
    pub pool_id: i64,
    pub name: String,
    pub size_bytes: u64,
    pub provisioning: Provisioning,
}

#[derive(Debug, Deserialize)]
pub struct MapVolumeRequest {
    pub sdc_id: i64,
    pub access_mode: AccessMode,
}

#[derive(Debug, Deserialize)]
pub struct ExtendVolumeRequest {
    pub new_size_bytes: u64,
}

#[derive(Debug, Deserialize)]
pub struct PlanRequest {
    pub volume_id: i64,
    pub sdc_id: i64,
    pub offset_bytes: u64,
    pub length_bytes: u64,
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    pub volume_id: i64,
    pub sdc_id: i64,
    pub operation: IoOp,
    pub offset_bytes: u64,
    pub length_bytes: u64,
    #[serde(default)]
    pub io_plan: serde_json::Value,
    #[serde(default = "default_ttl")]
    pub ttl_secs: i64,
}

fn default_ttl() -> i64 {
    crate::token::DEFAULT_TOKEN_TTL_SECS
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub token_id: String,
    pub sds_id: i64,
    pub success: bool,
    pub bytes_processed: u64,
    pub duration_ms: u64,
    /// The chunk this ack's write landed on — absent for reads and for
    /// init_volume pseudo-acks.
    #[serde(default)]
    pub chunk_id: Option<i64>,
    /// Checksum of the write payload, computed by the SDS at the point of
    /// commit. MDM stores it verbatim on the chunk row on success.
    #[serde(default)]
    pub checksum: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterComponentRequest {
    pub component_id: String,
    pub component_type: String,
    pub address: String,
    pub control_port: u16,
    pub data_port: Option<u16>,
    pub mgmt_port: Option<u16>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub component_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UnregisterRequest {
    pub component_id: String,
}
