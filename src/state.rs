//! MDM process state: the bundle of services every Rocket route handler
//! needs, built once at startup and managed by Rocket as shared state.

use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::discovery::DiscoveryRegistry;
use crate::health::HealthMonitor;
use crate::rebuild::RebuildEngine;
use crate::storage::StorageEngine;
use crate::store::MdmStore;
use crate::token::authority::TokenAuthority;
use crate::volume::VolumeManager;

pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub store: Arc<MdmStore>,
    pub storage_engine: Arc<StorageEngine>,
    pub volume_manager: Arc<VolumeManager>,
    pub rebuild_engine: Arc<RebuildEngine>,
    pub token_authority: Arc<TokenAuthority>,
    pub discovery: Arc<DiscoveryRegistry>,
    pub health_monitor: Arc<HealthMonitor>,
}

impl AppState {
    pub fn new(config: Arc<ServiceConfig>) -> Self {
        let store = Arc::new(MdmStore::new());
        let storage_engine = Arc::new(StorageEngine::new(store.clone()));
        let volume_manager = Arc::new(VolumeManager::new(
            store.clone(),
            storage_engine.clone(),
            config.storage_root.clone(),
        ));
        let rebuild_engine = Arc::new(RebuildEngine::new(store.clone(), storage_engine.clone()));
        let token_authority = Arc::new(TokenAuthority::new(store.clone(), config.cluster_secret.clone()));
        let discovery = Arc::new(DiscoveryRegistry::new(store.clone(), config.clone()));
        let health_monitor = Arc::new(HealthMonitor::new(store.clone(), config.clone()));

        Self {
            config,
            store,
            storage_engine,
            volume_manager,
            rebuild_engine,
            token_authority,
            discovery,
            health_monitor,
        }
    }
}
