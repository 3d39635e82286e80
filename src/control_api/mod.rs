//! MDM control-plane HTTP API (C6): Rocket app assembly plus the DTOs
//! and plan-generation logic the route handlers depend on.

pub mod dto;
pub mod plan;
pub mod routes;

use colored::Colorize;
use rocket::{Build, Rocket};

use crate::cors::{cors_preflight, CORS};
use crate::state::AppState;

pub fn build_rocket(port: u16, state: AppState) -> Rocket<Build> {
    log::info!("{}", "assembling mdm control-plane routes".cyan());

    rocket::build()
        .configure(rocket::Config {
            port,
            address: std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
            ..Default::default()
        })
        .manage(state)
        .attach(CORS)
        .mount(
            "/",
            rocket::routes![
                cors_preflight,
                routes::health_summary,
                routes::health_components,
                routes::health_metrics,
                routes::create_pd,
                routes::list_pds,
                routes::create_fault_set,
                routes::create_pool,
                routes::list_pools,
                routes::get_pool,
                routes::get_rebuild_status,
                routes::register_sds,
                routes::list_sds,
                routes::fail_sds,
                routes::recover_sds,
                routes::register_sdc,
                routes::list_sdc,
                routes::create_volume,
                routes::list_volumes,
                routes::get_volume,
                routes::map_volume,
                routes::unmap_volume,
                routes::extend_volume,
                routes::delete_volume,
                routes::plan_read,
                routes::plan_write,
                routes::authorize,
                routes::record_ack,
                routes::discovery_register,
                routes::discovery_heartbeat,
                routes::discovery_unregister,
                routes::discovery_topology,
                routes::discovery_peers,
                routes::cluster_bootstrap,
            ],
        )
}
