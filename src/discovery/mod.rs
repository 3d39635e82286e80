//! Discovery registry (C7): component registration, auth-token handshake,
//! peer lookup, heartbeats. Grounded on `mdm/api/discovery.py`'s
//! register/verify logic.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;

use crate::config::ServiceConfig;
use crate::error::{AppError, AppResult};
use crate::model::*;
use crate::store::MdmStore;
use crate::token::component_auth_token;

pub struct RegisterRequest {
    pub component_id: String,
    pub component_type: String,
    pub address: String,
    pub control_port: u16,
    pub data_port: Option<u16>,
    pub mgmt_port: Option<u16>,
    pub metadata: serde_json::Value,
    pub auth_token: Option<String>,
}

pub struct RegisterResponse {
    pub status: &'static str,
    pub component_id: String,
    pub cluster_name: String,
    pub cluster_secret: Option<String>,
    pub message: String,
}

pub struct DiscoveryRegistry {
    store: Arc<MdmStore>,
    config: Arc<ServiceConfig>,
}

impl DiscoveryRegistry {
    pub fn new(store: Arc<MdmStore>, config: Arc<ServiceConfig>) -> Self {
        Self { store, config }
    }

    pub async fn register(&self, request: RegisterRequest) -> AppResult<RegisterResponse> {
        if request.address.trim().is_empty() {
            return Err(AppError::InvalidArgument("address is required".to_string()));
        }

        let now = Utc::now();
        let existing = self.store.components.read().await.get(&request.component_id).cloned();

        if let Some(mut existing) = existing {
            match &request.auth_token {
                Some(token) => {
                    if !crate::token::verify_component_auth_token(
                        &self.config.cluster_secret,
                        &request.component_id,
                        token,
                    ) {
                        return Err(AppError::Unauthorized(
                            "auth token does not match".to_string(),
                        ));
                    }
                }
                None => {
                    if !self.config.allow_legacy_registration {
                        return Err(AppError::Unauthorized(
                            "auth_token is required for re-registration".to_string(),
                        ));
                    }
                    log::warn!(
                        "component {} re-registered without auth_token (legacy path)",
                        request.component_id
                    );
                }
            }

            existing.address = request.address.clone();
            existing.control_port = request.control_port;
            existing.data_port = request.data_port;
            existing.mgmt_port = request.mgmt_port;
            existing.status = ComponentStatus::Active;
            existing.last_heartbeat = now;
            existing.metadata = request.metadata.clone();
            self.store
                .components
                .write()
                .await
                .insert(request.component_id.clone(), existing);

            self.upsert_cluster_node(&request, now).await;

            return Ok(RegisterResponse {
                status: "updated",
                component_id: request.component_id,
                cluster_name: self.config.cluster_name.clone(),
                cluster_secret: None,
                message: "component re-registered".to_string(),
            });
        }

        let auth_token_hash =
            component_auth_token(&self.config.cluster_secret, &request.component_id);
        let row = ComponentRegistry {
            component_id: request.component_id.clone(),
            component_type: request.component_type.clone(),
            cluster_name: self.config.cluster_name.clone(),
            auth_token_hash,
            address: request.address.clone(),
            control_port: request.control_port,
            data_port: request.data_port,
            mgmt_port: request.mgmt_port,
            status: ComponentStatus::Active,
            registered_at: now,
            last_heartbeat: now,
            metadata: request.metadata.clone(),
        };
        self.store
            .components
            .write()
            .await
            .insert(request.component_id.clone(), row);

        self.upsert_cluster_node(&request, now).await;

        Ok(RegisterResponse {
            status: "registered",
            component_id: request.component_id,
            cluster_name: self.config.cluster_name.clone(),
            cluster_secret: Some(self.config.cluster_secret.clone()),
            message: "component registered".to_string(),
        })
    }

    async fn upsert_cluster_node(&self, request: &RegisterRequest, now: chrono::DateTime<Utc>) {
        let mut capabilities = HashSet::new();
        match request.component_type.as_str() {
            "mdm" => {
                capabilities.insert(ComponentCapability::Mdm);
            }
            "sds" => {
                capabilities.insert(ComponentCapability::Sds);
            }
            "sdc" => {
                capabilities.insert(ComponentCapability::Sdc);
            }
            _ => {}
        }
        let node = ClusterNode {
            node_id: request.component_id.clone(),
            address: request.address.clone(),
            control_port: request.control_port,
            data_port: request.data_port,
            capabilities,
            status: ComponentStatus::Active,
            registered_at: now,
            last_heartbeat: now,
        };
        self.store
            .cluster_nodes
            .write()
            .await
            .insert(request.component_id.clone(), node);
    }

    pub async fn heartbeat(&self, component_id: &str) -> AppResult<()> {
        let now = Utc::now();
        {
            let mut components = self.store.components.write().await;
            let component = components
                .get_mut(component_id)
                .ok_or_else(|| AppError::NotFound(format!("component {component_id} not found")))?;
            component.last_heartbeat = now;
            component.status = ComponentStatus::Active;
        }
        if let Some(node) = self.store.cluster_nodes.write().await.get_mut(component_id) {
            node.last_heartbeat = now;
            node.status = ComponentStatus::Active;
        }
        Ok(())
    }

    /// Removes a component and its cluster-node row entirely (spec.md §6's
    /// `unregister`). Unlike a failed heartbeat (which only ages the status
    /// to INACTIVE/DOWN), this is an explicit, immediate departure — the
    /// component will need a fresh `register` call to rejoin.
    pub async fn unregister(&self, component_id: &str) -> AppResult<()> {
        let removed = self.store.components.write().await.remove(component_id);
        if removed.is_none() {
            return Err(AppError::NotFound(format!("component {component_id} not found")));
        }
        self.store.cluster_nodes.write().await.remove(component_id);
        Ok(())
    }

    pub async fn topology(&self) -> Vec<ClusterNode> {
        self.store.cluster_nodes.read().await.values().cloned().collect()
    }

    pub async fn peers_of_type(&self, capability: ComponentCapability) -> Vec<ClusterNode> {
        self.store
            .cluster_nodes
            .read()
            .await
            .values()
            .filter(|n| n.capabilities.contains(&capability))
            .cloned()
            .collect()
    }

    /// Idempotently creates one MDM node, two SDS nodes, and one SDC node
    /// with deterministic addresses — a convenience for test environments
    /// (spec.md §4.7).
    pub async fn bootstrap_minimal_topology(&self) {
        let fixtures: &[(&str, &str, u16)] = &[
            ("mdm-1", "mdm", 7000),
            ("sds-1", "sds", 7101),
            ("sds-2", "sds", 7102),
            ("sdc-1", "sdc", 7300),
        ];
        for (component_id, component_type, control_port) in fixtures {
            if self.store.components.read().await.contains_key(*component_id) {
                continue;
            }
            let _ = self
                .register(RegisterRequest {
                    component_id: component_id.to_string(),
                    component_type: component_type.to_string(),
                    address: "127.0.0.1".to_string(),
                    control_port: *control_port,
                    data_port: if *component_type == "sds" {
                        Some(*control_port + 1000)
                    } else {
                        None
                    },
                    mgmt_port: None,
                    metadata: serde_json::json!({"bootstrap": true}),
                    auth_token: None,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<MdmStore>, DiscoveryRegistry) {
        let store = Arc::new(MdmStore::new());
        let config = Arc::new(ServiceConfig::default());
        let registry = DiscoveryRegistry::new(store.clone(), config);
        (store, registry)
    }

    fn register_request(component_id: &str, component_type: &str) -> RegisterRequest {
        RegisterRequest {
            component_id: component_id.to_string(),
            component_type: component_type.to_string(),
            address: "127.0.0.1".to_string(),
            control_port: 7100,
            data_port: Some(7101),
            mgmt_port: None,
            metadata: serde_json::json!({}),
            auth_token: None,
        }
    }

    #[tokio::test]
    async fn register_rejects_empty_address() {
        let (_store, registry) = setup();
        let mut request = register_request("sds-1", "sds");
        request.address = "   ".to_string();
        let err = registry.register(request).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn first_registration_returns_cluster_secret() {
        let (_store, registry) = setup();
        let response = registry.register(register_request("sds-1", "sds")).await.unwrap();
        assert_eq!(response.status, "registered");
        assert!(response.cluster_secret.is_some());
    }

    #[tokio::test]
    async fn re_registration_without_token_uses_legacy_path_when_allowed() {
        let (_store, registry) = setup();
        registry.register(register_request("sds-1", "sds")).await.unwrap();
        let response = registry.register(register_request("sds-1", "sds")).await.unwrap();
        assert_eq!(response.status, "updated");
        assert!(response.cluster_secret.is_none());
    }

    #[tokio::test]
    async fn re_registration_with_wrong_token_is_unauthorized() {
        let (_store, registry) = setup();
        registry.register(register_request("sds-1", "sds")).await.unwrap();
        let mut request = register_request("sds-1", "sds");
        request.auth_token = Some("not-the-real-token".to_string());
        let err = registry.register(request).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn heartbeat_updates_status_and_timestamp() {
        let (store, registry) = setup();
        registry.register(register_request("sds-1", "sds")).await.unwrap();
        registry.heartbeat("sds-1").await.unwrap();
        let components = store.components.read().await;
        assert_eq!(components.get("sds-1").unwrap().status, ComponentStatus::Active);
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_component_is_not_found() {
        let (_store, registry) = setup();
        let err = registry.heartbeat("ghost").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn unregister_removes_component_and_cluster_node() {
        let (store, registry) = setup();
        registry.register(register_request("sds-1", "sds")).await.unwrap();
        registry.unregister("sds-1").await.unwrap();
        assert!(store.components.read().await.get("sds-1").is_none());
        assert!(store.cluster_nodes.read().await.get("sds-1").is_none());
    }

    #[tokio::test]
    async fn unregister_unknown_component_is_not_found() {
        let (_store, registry) = setup();
        let err = registry.unregister("ghost").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn peers_of_type_filters_by_capability() {
        let (_store, registry) = setup();
        registry.register(register_request("sds-1", "sds")).await.unwrap();
        registry.register(register_request("sdc-1", "sdc")).await.unwrap();

        let sds_peers = registry.peers_of_type(ComponentCapability::Sds).await;
        assert_eq!(sds_peers.len(), 1);
        assert_eq!(sds_peers[0].node_id, "sds-1");
    }

    #[tokio::test]
    async fn bootstrap_minimal_topology_is_idempotent() {
        let (_store, registry) = setup();
        registry.bootstrap_minimal_topology().await;
        registry.bootstrap_minimal_topology().await;
        assert_eq!(registry.topology().await.len(), 4);
    }
}
