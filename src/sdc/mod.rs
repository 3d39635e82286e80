//! SDC I/O planner/executor (C10): the client side of the block protocol.
//! Exposes a minimal CONNECT/READ/WRITE/DISCONNECT surface over a plan
//! cache and a per-segment dispatcher. Grounded on `sdc/data_client.py`
//! (execute_read/execute_write) and `sdc/token_requester.py` (token
//! fetch), generalized the way [`crate::sds::SdsService`] generalizes
//! the storage engine's write path.

pub mod executor;
pub mod plan_cache;

use std::collections::HashSet;
use std::sync::Arc;

use colored::Colorize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::ServiceConfig;
use crate::control_api::plan::IoPlan;
use crate::model::{IoOp, SdcId, VolumeId};
use crate::sdc::plan_cache::PlanCache;
use crate::token::TokenPayload;

/// Client-side I/O error taxonomy. Distinct from [`crate::error::AppError`]
/// because the SDC never answers HTTP requests itself — these only ever
/// surface to the demo CLI / tests as plain `Display`-able errors.
#[derive(Debug, Error)]
pub enum SdcError {
    #[error("volume {0} is not connected; call connect() first")]
    NotConnected(VolumeId),
    #[error("plan request failed: {0}")]
    Plan(String),
    #[error("token request failed: {0}")]
    Token(String),
    #[error("no target accepted the request")]
    NoTarget,
    #[error("partial write: {acked}/{total} targets acked")]
    PartialWrite { acked: usize, total: usize },
    #[error("network error: {0}")]
    Network(String),
}

pub struct SdcService {
    pub node_id: String,
    pub config: Arc<ServiceConfig>,
    sdc_id: RwLock<Option<SdcId>>,
    connected_volumes: RwLock<HashSet<VolumeId>>,
    plan_cache: PlanCache,
    http: reqwest::Client,
}

impl SdcService {
    pub fn new(node_id: String, config: Arc<ServiceConfig>) -> Self {
        let plan_cache = PlanCache::new(config.plan_cache_ttl_secs);
        Self {
            node_id,
            config,
            sdc_id: RwLock::new(None),
            connected_volumes: RwLock::new(HashSet::new()),
            plan_cache,
            http: reqwest::Client::new(),
        }
    }

    /// Registers with the MDM's discovery endpoint, mirroring
    /// [`crate::sds::SdsService::register_with_mdm`].
    pub async fn register_with_mdm(&self) -> anyhow::Result<()> {
        let url = format!("{}/discovery/register", self.config.mdm_base_url);
        let body = serde_json::json!({
            "component_id": self.node_id,
            "component_type": "sdc",
            "address": "127.0.0.1",
            "control_port": self.config.sdc_service_port,
            "data_port": serde_json::Value::Null,
            "mgmt_port": serde_json::Value::Null,
            "metadata": {},
            "auth_token": serde_json::Value::Null,
        });
        self.http.post(&url).json(&body).send().await?;
        log::info!("{}", format!("{} registered with mdm", self.node_id).green());
        Ok(())
    }

    /// Looks this node's numeric `SdcId` up from the MDM's `GET /sdc` list
    /// by matching `cluster_node_id`, the same lazy-resolution pattern as
    /// [`crate::sds::SdsService::resolve_sds_id`].
    pub async fn resolve_sdc_id(&self) -> Option<SdcId> {
        if let Some(id) = *self.sdc_id.read().await {
            return Some(id);
        }
        let url = format!("{}/sdc/list", self.config.mdm_base_url);
        let response = self.http.get(&url).send().await.ok()?;
        let clients: Vec<crate::model::SdcClient> = response.json().await.ok()?;
        let client = clients.into_iter().find(|c| c.cluster_node_id == self.node_id)?;
        *self.sdc_id.write().await = Some(client.id);
        Some(client.id)
    }

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

    /// CONNECT: marks `volume_id` as an open device on this node. Confirms
    /// the volume exists on the MDM first so a typo'd id fails fast rather
    /// than on the first read.
    pub async fn connect(&self, volume_id: VolumeId) -> Result<(), SdcError> {
        let url = format!("{}/vol/{}", self.config.mdm_base_url, volume_id.0);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| SdcError::Network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SdcError::Plan(format!("volume {volume_id} not found on mdm")));
        }
        self.connected_volumes.write().await.insert(volume_id);
        Ok(())
    }

    /// DISCONNECT: drops the local device handle and any cached plans for
    /// it.
    pub async fn disconnect(&self, volume_id: VolumeId) {
        self.connected_volumes.write().await.remove(&volume_id);
        self.plan_cache.invalidate_volume(volume_id).await;
    }

    async fn ensure_connected(&self, volume_id: VolumeId) -> Result<(), SdcError> {
        if self.connected_volumes.read().await.contains(&volume_id) {
            Ok(())
        } else {
            Err(SdcError::NotConnected(volume_id))
        }
    }

    /// READ: fetches (or reuses) a plan, requests a scoped token, and
    /// executes the plan's segments against their SDS targets.
    pub async fn read(&self, volume_id: VolumeId, offset_bytes: u64, length_bytes: u64) -> Result<Vec<u8>, SdcError> {
        self.ensure_connected(volume_id).await?;
        let plan = self.get_or_fetch_plan(IoOp::Read, volume_id, offset_bytes, length_bytes).await?;
        let token = self
            .request_token(volume_id, IoOp::Read, offset_bytes, length_bytes, &plan)
            .await?;
        match executor::execute_read(&plan, &token).await {
            Ok(data) => Ok(data),
            Err(err) => {
                self.plan_cache.invalidate_volume(volume_id).await;
                Err(err)
            }
        }
    }

    /// WRITE: same plan/token sequence as `read`, dispatching `data` across
    /// the plan's segments.
    pub async fn write(&self, volume_id: VolumeId, offset_bytes: u64, data: &[u8]) -> Result<u64, SdcError> {
        self.ensure_connected(volume_id).await?;
        let length_bytes = data.len() as u64;
        let plan = self.get_or_fetch_plan(IoOp::Write, volume_id, offset_bytes, length_bytes).await?;
        let token = self
            .request_token(volume_id, IoOp::Write, offset_bytes, length_bytes, &plan)
            .await?;
        match executor::execute_write(&plan, &token, data).await {
            Ok(written) => Ok(written),
            Err(err) => {
                self.plan_cache.invalidate_volume(volume_id).await;
                Err(err)
            }
        }
    }

    async fn get_or_fetch_plan(
        &self,
        op: IoOp,
        volume_id: VolumeId,
        offset_bytes: u64,
        length_bytes: u64,
    ) -> Result<IoPlan, SdcError> {
        if let Some(plan) = self.plan_cache.get(op, volume_id, offset_bytes, length_bytes).await {
            return Ok(plan);
        }
        let sdc_id = self
            .resolve_sdc_id()
            .await
            .ok_or_else(|| SdcError::Plan("sdc not yet registered with a pool".to_string()))?;
        let endpoint = match op {
            IoOp::Read => "plan/read",
            IoOp::Write => "plan/write",
        };
        let url = format!("{}/{endpoint}", self.config.mdm_base_url);
        let body = serde_json::json!({
            "volume_id": volume_id.0,
            "sdc_id": sdc_id.0,
            "offset_bytes": offset_bytes,
            "length_bytes": length_bytes,
        });
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| SdcError::Network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SdcError::Plan(format!("mdm returned {}", response.status())));
        }
        let plan: IoPlan = response.json().await.map_err(|err| SdcError::Plan(err.to_string()))?;
        self.plan_cache
            .insert(op, volume_id, offset_bytes, length_bytes, plan.clone())
            .await;
        Ok(plan)
    }

    async fn request_token(
        &self,
        volume_id: VolumeId,
        op: IoOp,
        offset_bytes: u64,
        length_bytes: u64,
        plan: &IoPlan,
    ) -> Result<TokenPayload, SdcError> {
        let sdc_id = self
            .resolve_sdc_id()
            .await
            .ok_or_else(|| SdcError::Token("sdc not yet registered with a pool".to_string()))?;
        let url = format!("{}/authorize", self.config.mdm_base_url);
        let body = serde_json::json!({
            "volume_id": volume_id.0,
            "sdc_id": sdc_id.0,
            "operation": op,
            "offset_bytes": offset_bytes,
            "length_bytes": length_bytes,
            "io_plan": plan,
        });
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| SdcError::Network(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SdcError::Token(format!("mdm returned {}", response.status())));
        }
        response.json().await.map_err(|err| SdcError::Token(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;

    #[tokio::test]
    async fn read_without_connect_is_not_connected_error() {
        let service = SdcService::new("sdc-test".to_string(), Arc::new(ServiceConfig::default()));
        let err = service.read(VolumeId(1), 0, 1024).await.unwrap_err();
        assert!(matches!(err, SdcError::NotConnected(VolumeId(1))));
    }

    #[tokio::test]
    async fn write_without_connect_is_not_connected_error() {
        let service = SdcService::new("sdc-test".to_string(), Arc::new(ServiceConfig::default()));
        let err = service.write(VolumeId(1), 0, b"data").await.unwrap_err();
        assert!(matches!(err, SdcError::NotConnected(VolumeId(1))));
    }

    #[tokio::test]
    async fn disconnect_of_unconnected_volume_is_a_no_op() {
        let service = SdcService::new("sdc-test".to_string(), Arc::new(ServiceConfig::default()));
        service.disconnect(VolumeId(1)).await;
        let err = service.read(VolumeId(1), 0, 1024).await.unwrap_err();
        assert!(matches!(err, SdcError::NotConnected(_)));
    }
}
