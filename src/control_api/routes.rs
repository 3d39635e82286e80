//! Rocket route handlers for the MDM control plane (C6), spec.md §6's
//! minimum operation set: PDs, pools, SDSes, SDCs, volumes, plans,
//! tokens, acks, discovery, health, cluster bootstrap.

use rocket::serde::json::Json;
use rocket::State;
use rocket::{delete, get, post};

use crate::control_api::dto::*;
use crate::control_api::plan::generate_plan;
use crate::discovery::{RegisterRequest as DiscoveryRegisterRequest, RegisterResponse};
use crate::error::{AppError, AppResult};
use crate::model::*;
use crate::state::AppState;

#[get("/health")]
pub async fn health_summary(state: &State<AppState>) -> Json<crate::health::HealthSummary> {
    Json(state.health_monitor.get_health_summary().await)
}

#[get("/health/components")]
pub async fn health_components(
    state: &State<AppState>,
) -> Json<Vec<crate::health::ComponentDetail>> {
    Json(state.health_monitor.get_component_details().await)
}

#[get("/health/metrics")]
pub async fn health_metrics(state: &State<AppState>) -> Json<serde_json::Value> {
    let summary = state.health_monitor.get_health_summary().await;
    Json(serde_json::json!({
        "total": summary.total,
        "active": summary.active,
        "inactive": summary.inactive,
        "health_score": summary.health_score,
        "overall_status": summary.overall_status,
    }))
}

#[post("/pd", data = "<req>")]
pub async fn create_pd(state: &State<AppState>, req: Json<CreatePdRequest>) -> AppResult<Json<ApiResponse>> {
    let mut pds = state.store.protection_domains.write().await;
    if pds.values().any(|p| p.name == req.name) {
        return Err(AppError::Conflict(format!("pd '{}' already exists", req.name)));
    }
    let id = state.store.next_pd_id();
    pds.insert(id, ProtectionDomain { id, name: req.name.clone() });
    Ok(Json(ApiResponse::ok(id.to_string())))
}

#[get("/pd/list")]
pub async fn list_pds(state: &State<AppState>) -> Json<Vec<ProtectionDomain>> {
    Json(state.store.protection_domains.read().await.values().cloned().collect())
}

#[post("/fault_set", data = "<req>")]
pub async fn create_fault_set(
    state: &State<AppState>,
    req: Json<CreateFaultSetRequest>,
) -> AppResult<Json<ApiResponse>> {
    let pd_id = PdId(req.pd_id);
    if !state.store.protection_domains.read().await.contains_key(&pd_id) {
        return Err(AppError::NotFound(format!("pd {pd_id} not found")));
    }
    let id = state.store.next_fault_set_id();
    state
        .store
        .fault_sets
        .write()
        .await
        .insert(id, FaultSet { id, pd_id, name: req.name.clone() });
    Ok(Json(ApiResponse::ok(id.to_string())))
}

#[post("/pool", data = "<req>")]
pub async fn create_pool(
    state: &State<AppState>,
    req: Json<CreatePoolRequest>,
) -> AppResult<Json<ApiResponse>> {
    let pd_id = PdId(req.pd_id);
    if !state.store.protection_domains.read().await.contains_key(&pd_id) {
        return Err(AppError::NotFound(format!("pd {pd_id} not found")));
    }
    let id = state.store.next_pool_id();
    state.store.pools.write().await.insert(
        id,
        StoragePool {
            id,
            pd_id,
            name: req.name.clone(),
            total_capacity_bytes: req.total_capacity_bytes,
            used_capacity_bytes: 0,
            reserved_capacity_bytes: 0,
            protection_policy: req.protection_policy,
            chunk_size_bytes: req.chunk_size_bytes,
            rebuild_rate_limit_bytes_per_sec: req.rebuild_rate_limit_bytes_per_sec,
            health: PoolHealth::Ok,
            rebuild_state: RebuildState::Idle,
        },
    );
    Ok(Json(ApiResponse::ok(id.to_string())))
}

#[get("/pool/list")]
pub async fn list_pools(state: &State<AppState>) -> Json<Vec<StoragePool>> {
    Json(state.store.pools.read().await.values().cloned().collect())
}

#[get("/pool/<id>")]
pub async fn get_pool(state: &State<AppState>, id: i64) -> AppResult<Json<StoragePool>> {
    state
        .store
        .pools
        .read()
        .await
        .get(&PoolId(id))
        .cloned()
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("pool {id} not found")))
}

#[get("/pool/<id>/rebuild")]
pub async fn get_rebuild_status(state: &State<AppState>, id: i64) -> AppResult<Json<RebuildJob>> {
    state
        .rebuild_engine
        .get_rebuild_status(PoolId(id))
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no rebuild job for pool {id}")))
}

#[post("/sds", data = "<req>")]
pub async fn register_sds(
    state: &State<AppState>,
    req: Json<RegisterSdsRequest>,
) -> AppResult<Json<ApiResponse>> {
    let pd_id = PdId(req.pd_id);
    if !state.store.protection_domains.read().await.contains_key(&pd_id) {
        return Err(AppError::NotFound(format!("pd {pd_id} not found")));
    }
    let id = state.store.next_sds_id();
    state.store.sds_nodes.write().await.insert(
        id,
        SdsNode {
            id,
            pd_id,
            fault_set_id: req.fault_set_id.map(FaultSetId),
            name: req.name.clone(),
            total_capacity_bytes: req.total_capacity_bytes,
            used_capacity_bytes: 0,
            state: SdsNodeState::Up,
            cluster_node_id: req.cluster_node_id.clone(),
            address: req.address.clone(),
            data_port: req.data_port,
        },
    );
    Ok(Json(ApiResponse::ok(id.to_string())))
}

#[get("/sds/list")]
pub async fn list_sds(state: &State<AppState>) -> Json<Vec<SdsNode>> {
    Json(state.store.sds_nodes.read().await.values().cloned().collect())
}

#[post("/sds/<id>/fail")]
pub async fn fail_sds(state: &State<AppState>, id: i64) -> AppResult<Json<ApiResponse>> {
    state.rebuild_engine.fail_sds_node(SdsId(id)).await?;
    Ok(Json(ApiResponse::ok(format!("sds {id} marked DOWN"))))
}

#[post("/sds/<id>/recover")]
pub async fn recover_sds(state: &State<AppState>, id: i64) -> AppResult<Json<ApiResponse>> {
    state.rebuild_engine.recover_sds_node(SdsId(id)).await?;
    Ok(Json(ApiResponse::ok(format!("sds {id} recovered"))))
}

#[post("/sdc", data = "<req>")]
pub async fn register_sdc(
    state: &State<AppState>,
    req: Json<RegisterSdcRequest>,
) -> AppResult<Json<ApiResponse>> {
    let id = state.store.next_sdc_id();
    state.store.sdc_clients.write().await.insert(
        id,
        SdcClient {
            id,
            name: req.name.clone(),
            cluster_node_id: req.cluster_node_id.clone(),
        },
    );
    Ok(Json(ApiResponse::ok(id.to_string())))
}

#[get("/sdc/list")]
pub async fn list_sdc(state: &State<AppState>) -> Json<Vec<SdcClient>> {
    Json(state.store.sdc_clients.read().await.values().cloned().collect())
}

#[post("/vol", data = "<req>")]
pub async fn create_volume(
    state: &State<AppState>,
    req: Json<CreateVolumeRequest>,
) -> AppResult<Json<ApiResponse>> {
    tracing::info!("creating volume {:?} ({} bytes) in pool {}", req.name, req.size_bytes, req.pool_id);
    let id = state
        .volume_manager
        .create_volume(PoolId(req.pool_id), req.name.clone(), req.size_bytes, req.provisioning)
        .await?;
    tracing::info!("volume {id} created");
    Ok(Json(ApiResponse::ok(id.to_string())))
}

#[get("/vol/list")]
pub async fn list_volumes(state: &State<AppState>) -> Json<Vec<Volume>> {
    Json(state.store.volumes.read().await.values().cloned().collect())
}

#[get("/vol/<id>")]
pub async fn get_volume(state: &State<AppState>, id: i64) -> AppResult<Json<Volume>> {
    state
        .store
        .volumes
        .read()
        .await
        .get(&VolumeId(id))
        .cloned()
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("volume {id} not found")))
}

#[post("/vol/<id>/map", data = "<req>")]
pub async fn map_volume(
    state: &State<AppState>,
    id: i64,
    req: Json<MapVolumeRequest>,
) -> AppResult<Json<ApiResponse>> {
    tracing::debug!("mapping volume {id} to sdc {}", req.sdc_id);
    let mapping_id = state
        .volume_manager
        .map_volume(VolumeId(id), SdcId(req.sdc_id), req.access_mode)
        .await?;
    Ok(Json(ApiResponse::ok(mapping_id.to_string())))
}

#[post("/vol/<id>/unmap", data = "<req>")]
pub async fn unmap_volume(
    state: &State<AppState>,
    id: i64,
    req: Json<MapVolumeRequest>,
) -> AppResult<Json<ApiResponse>> {
    state
        .volume_manager
        .unmap_volume(VolumeId(id), SdcId(req.sdc_id))
        .await?;
    Ok(Json(ApiResponse::ok("unmapped")))
}

#[post("/vol/<id>/extend", data = "<req>")]
pub async fn extend_volume(
    state: &State<AppState>,
    id: i64,
    req: Json<ExtendVolumeRequest>,
) -> AppResult<Json<ApiResponse>> {
    state
        .volume_manager
        .extend_volume(VolumeId(id), req.new_size_bytes)
        .await?;
    Ok(Json(ApiResponse::ok("extended")))
}

#[delete("/vol/<id>")]
pub async fn delete_volume(state: &State<AppState>, id: i64) -> AppResult<Json<ApiResponse>> {
    state.volume_manager.delete_volume(VolumeId(id)).await?;
    Ok(Json(ApiResponse::ok("deleted")))
}

async fn build_and_sign_plan(
    state: &AppState,
    req: &PlanRequest,
    op: IoOp,
) -> AppResult<Json<serde_json::Value>> {
    let plan = generate_plan(
        &state.store,
        &state.config,
        VolumeId(req.volume_id),
        SdcId(req.sdc_id),
        op,
        req.offset_bytes,
        req.length_bytes,
    )
    .await?;
    Ok(Json(serde_json::to_value(plan).unwrap()))
}

#[post("/plan/read", data = "<req>")]
pub async fn plan_read(
    state: &State<AppState>,
    req: Json<PlanRequest>,
) -> AppResult<Json<serde_json::Value>> {
    build_and_sign_plan(state, &req, IoOp::Read).await
}

#[post("/plan/write", data = "<req>")]
pub async fn plan_write(
    state: &State<AppState>,
    req: Json<PlanRequest>,
) -> AppResult<Json<serde_json::Value>> {
    build_and_sign_plan(state, &req, IoOp::Write).await
}

#[post("/authorize", data = "<req>")]
pub async fn authorize(
    state: &State<AppState>,
    req: Json<AuthorizeRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let payload = state
        .token_authority
        .issue_token(
            VolumeId(req.volume_id),
            SdcId(req.sdc_id),
            req.operation,
            req.offset_bytes,
            req.length_bytes,
            req.io_plan.clone(),
            req.ttl_secs,
        )
        .await?;
    Ok(Json(serde_json::to_value(payload).unwrap()))
}

#[post("/tx/ack", data = "<req>")]
pub async fn record_ack(state: &State<AppState>, req: Json<AckRequest>) -> AppResult<Json<ApiResponse>> {
    state
        .token_authority
        .record_ack(
            &req.token_id,
            SdsId(req.sds_id),
            req.success,
            req.bytes_processed,
            req.duration_ms,
            req.chunk_id.map(ChunkId),
            req.checksum.clone(),
        )
        .await?;
    Ok(Json(ApiResponse::ok("recorded")))
}

#[post("/discovery/register", data = "<req>")]
pub async fn discovery_register(
    state: &State<AppState>,
    req: Json<RegisterComponentRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let response: RegisterResponse = state
        .discovery
        .register(DiscoveryRegisterRequest {
            component_id: req.component_id.clone(),
            component_type: req.component_type.clone(),
            address: req.address.clone(),
            control_port: req.control_port,
            data_port: req.data_port,
            mgmt_port: req.mgmt_port,
            metadata: req.metadata.clone(),
            auth_token: req.auth_token.clone(),
        })
        .await?;
    Ok(Json(serde_json::json!({
        "status": response.status,
        "component_id": response.component_id,
        "cluster_name": response.cluster_name,
        "cluster_secret": response.cluster_secret,
        "message": response.message,
    })))
}

#[post("/discovery/heartbeat", data = "<req>")]
pub async fn discovery_heartbeat(
    state: &State<AppState>,
    req: Json<HeartbeatRequest>,
) -> AppResult<Json<ApiResponse>> {
    state.discovery.heartbeat(&req.component_id).await?;
    Ok(Json(ApiResponse::ok("heartbeat recorded")))
}

#[post("/discovery/unregister", data = "<req>")]
pub async fn discovery_unregister(
    state: &State<AppState>,
    req: Json<UnregisterRequest>,
) -> AppResult<Json<ApiResponse>> {
    state.discovery.unregister(&req.component_id).await?;
    Ok(Json(ApiResponse::ok("unregistered")))
}

#[get("/discovery/topology")]
pub async fn discovery_topology(state: &State<AppState>) -> Json<Vec<ClusterNode>> {
    Json(state.discovery.topology().await)
}

#[get("/discovery/peers/<capability>")]
pub async fn discovery_peers(
    state: &State<AppState>,
    capability: &str,
) -> AppResult<Json<Vec<ClusterNode>>> {
    let cap = match capability {
        "mdm" => ComponentCapability::Mdm,
        "sds" => ComponentCapability::Sds,
        "sdc" => ComponentCapability::Sdc,
        other => return Err(AppError::InvalidArgument(format!("unknown capability '{other}'"))),
    };
    Ok(Json(state.discovery.peers_of_type(cap).await))
}

#[post("/cluster/bootstrap")]
pub async fn cluster_bootstrap(state: &State<AppState>) -> Json<ApiResponse> {
    state.discovery.bootstrap_minimal_topology().await;
    Json(ApiResponse::ok("bootstrapped"))
}
