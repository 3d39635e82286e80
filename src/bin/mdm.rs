//! MDM entrypoint: loads configuration, validates the startup profile,
//! builds the shared [`flexsim::state::AppState`], and launches the
//! control-plane Rocket app alongside the background token-cleanup,
//! rebuild-tick, and health-monitor tasks.

use colored::Colorize;
use flexsim::config::ServiceConfig;
use flexsim::state::AppState;

#[rocket::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = std::sync::Arc::new(ServiceConfig::from_env());
    if let Err(err) = config.validate() {
        log::error!("{}", format!("startup profile invalid: {err}").red());
        anyhow::bail!(err);
    }
    log::info!("{}", format!("mdm starting on port {}", config.mdm_api_port).cyan());

    let state = AppState::new(config.clone());
    state.discovery.bootstrap_minimal_topology().await;
    state.health_monitor.clone().spawn();

    spawn_token_cleanup(state.token_authority.clone());
    spawn_rebuild_ticker(state.rebuild_engine.clone(), state.store.clone());

    let port = config.mdm_api_port;
    flexsim::control_api::build_rocket(port, state)
        .launch()
        .await
        .map_err(|err| anyhow::anyhow!("rocket launch failed: {err}"))?;

    Ok(())
}

fn spawn_token_cleanup(token_authority: std::sync::Arc<flexsim::token::authority::TokenAuthority>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let expired = token_authority.cleanup_expired(256).await;
            if expired > 0 {
                log::debug!("expired {expired} issued tokens past their ttl");
            }
        }
    });
}

fn spawn_rebuild_ticker(
    rebuild_engine: std::sync::Arc<flexsim::rebuild::RebuildEngine>,
    store: std::sync::Arc<flexsim::store::MdmStore>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            interval.tick().await;
            let pool_ids: Vec<_> = store.pools.read().await.keys().copied().collect();
            for pool_id in pool_ids {
                if let Err(err) = rebuild_engine.tick_progress(pool_id).await {
                    log::trace!("rebuild tick for pool {pool_id} skipped: {err}");
                }
            }
        }
    });
}
