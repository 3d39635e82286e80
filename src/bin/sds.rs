//! SDS entrypoint: registers with the MDM, then runs the data listener
//! alongside the heartbeat, replay-table-cleanup, and ack-batching
//! background tasks. Spec.md §5 names three listeners (data, control,
//! management); only the data path carries live traffic here, but the
//! node still reports a control/mgmt port pair on registration so an
//! operator can reach it through the discovery topology.

use std::sync::Arc;

use colored::Colorize;
use flexsim::config::ServiceConfig;
use flexsim::sds::SdsService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Arc::new(ServiceConfig::from_env());
    if let Err(err) = config.validate() {
        log::error!("{}", format!("startup profile invalid: {err}").red());
        anyhow::bail!(err);
    }

    let node_id = std::env::var("FLEXSIM_NODE_ID").unwrap_or_else(|_| "sds-1".to_string());
    let service = Arc::new(SdsService::new(node_id.clone(), config.clone()));

    log::info!("{}", format!("{node_id} registering with mdm at {}", config.mdm_base_url).cyan());
    if let Err(err) = service.register_with_mdm().await {
        log::warn!("initial registration failed, will rely on heartbeats to retry: {err}");
    }

    service.spawn_heartbeat_sender();
    service.spawn_replay_table_cleaner();
    service.spawn_ack_sender();

    tokio::spawn(
        flexsim::sds::management::build_control_rocket(config.control_plane_base_port, service.clone()).launch(),
    );
    tokio::spawn(
        flexsim::sds::management::build_management_rocket(config.management_port, service.clone()).launch(),
    );

    flexsim::sds::listener::run(service).await.map_err(|err| anyhow::anyhow!(err))
}
