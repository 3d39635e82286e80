//! The SDS control and management listeners — spec.md §5's other two
//! workers besides the data plane. Grounded on `sds/control_app.py`
//! (liveness/control surface) and `sds/mgmt_app.py` (`/mgmt/health`,
//! `/mgmt/stats`). Both are thin Rocket apps: the heavy lifting (chunk
//! provisioning, IO) happens over the data listener via `init_volume`, so
//! these only expose the read-only status surface an MDM or operator
//! dashboard would poll.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{get, routes, Build, Rocket, State};
use serde::Serialize;

use crate::sds::SdsService;

#[derive(Serialize)]
pub struct ControlStatus {
    pub component_id: String,
    pub status: &'static str,
}

#[get("/control/health")]
fn control_health(service: &State<Arc<SdsService>>) -> Json<ControlStatus> {
    Json(ControlStatus {
        component_id: service.node_id.clone(),
        status: "ok",
    })
}

#[derive(Serialize)]
pub struct MgmtHealth {
    pub component_id: String,
    pub status: &'static str,
    pub uptime_seconds: i64,
    pub pending_acks: usize,
}

#[get("/mgmt/health")]
async fn mgmt_health(service: &State<Arc<SdsService>>) -> Json<MgmtHealth> {
    let pending_acks = service.ack_queue.len().await;
    Json(MgmtHealth {
        component_id: service.node_id.clone(),
        status: if service.cluster_secret.read().await.is_some() {
            "ok"
        } else {
            "unregistered"
        },
        uptime_seconds: (chrono::Utc::now() - service.started_at).num_seconds(),
        pending_acks,
    })
}

#[derive(Serialize)]
pub struct MgmtStats {
    pub total_io_operations: u64,
    pub total_bytes_read: u64,
    pub total_bytes_written: u64,
    pub total_errors: u64,
}

#[get("/mgmt/stats")]
fn mgmt_stats(service: &State<Arc<SdsService>>) -> Json<MgmtStats> {
    Json(MgmtStats {
        total_io_operations: service.stats.total_io_operations.load(Ordering::Relaxed),
        total_bytes_read: service.stats.total_bytes_read.load(Ordering::Relaxed),
        total_bytes_written: service.stats.total_bytes_written.load(Ordering::Relaxed),
        total_errors: service.stats.total_errors.load(Ordering::Relaxed),
    })
}

fn rocket_on(port: u16, service: Arc<SdsService>) -> Rocket<Build> {
    rocket::build().configure(rocket::Config {
        port,
        address: std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
        ..Default::default()
    })
    .manage(service)
}

pub fn build_control_rocket(port: u16, service: Arc<SdsService>) -> Rocket<Build> {
    rocket_on(port, service).mount("/", routes![control_health])
}

pub fn build_management_rocket(port: u16, service: Arc<SdsService>) -> Rocket<Build> {
    rocket_on(port, service).mount("/", routes![mgmt_health, mgmt_stats])
}
