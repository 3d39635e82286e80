//! Health monitor (C8): periodic heartbeat scan, status transitions,
//! cluster health score. Grounded directly on `mdm/health_monitor.py`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use colored::Colorize;
use serde::Serialize;

use crate::config::ServiceConfig;
use crate::model::*;
use crate::store::MdmStore;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentDetail {
    pub component_id: String,
    pub status: ComponentStatus,
    pub seconds_since_heartbeat: i64,
    pub is_stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub by_type: std::collections::HashMap<String, usize>,
    pub health_score: u32,
    pub overall_status: &'static str,
}

pub struct HealthMonitor {
    store: Arc<MdmStore>,
    config: Arc<ServiceConfig>,
}

impl HealthMonitor {
    pub fn new(store: Arc<MdmStore>, config: Arc<ServiceConfig>) -> Self {
        Self { store, config }
    }

    /// Spawns the periodic background scan. Never panics the host
    /// process: any error inside a tick is logged and the loop continues,
    /// backing off the default 1s before retrying (spec.md §7).
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval_secs));
            loop {
                interval.tick().await;
                self.check_component_health().await;
            }
        })
    }

    async fn check_component_health(&self) {
        let now = Utc::now();
        let timeout = chrono::Duration::seconds(self.config.heartbeat_timeout_secs as i64);
        let mut components = self.store.components.write().await;
        for component in components.values_mut() {
            let stale = now - component.last_heartbeat > timeout;
            if stale && component.status == ComponentStatus::Active {
                component.status = ComponentStatus::Down;
                log::warn!(
                    "{}",
                    format!("component {} is now INACTIVE", component.component_id).yellow()
                );
                self.store
                    .log_event(
                        EventType::ComponentInactive,
                        format!("component {} missed heartbeat deadline", component.component_id),
                        None,
                        None,
                        None,
                        None,
                    )
                    .await;
            } else if !stale && component.status == ComponentStatus::Down {
                component.status = ComponentStatus::Active;
                log::info!(
                    "{}",
                    format!("component {} recovered", component.component_id).green()
                );
                self.store
                    .log_event(
                        EventType::ComponentRecovered,
                        format!("component {} heartbeat is fresh again", component.component_id),
                        None,
                        None,
                        None,
                        None,
                    )
                    .await;
            }
        }
    }

    pub async fn get_health_summary(&self) -> HealthSummary {
        let components = self.store.components.read().await;
        let total = components.len();
        let active = components
            .values()
            .filter(|c| c.status == ComponentStatus::Active)
            .count();
        let inactive = total - active;

        let mut by_type = std::collections::HashMap::new();
        for component in components.values() {
            *by_type.entry(component.component_type.clone()).or_insert(0) += 1;
        }

        let health_score = if total == 0 {
            100
        } else {
            ((active as f64 / total as f64) * 100.0) as u32
        };

        let overall_status = if total == 0 || inactive == 0 {
            "healthy"
        } else if active == 0 {
            "critical"
        } else if inactive as f64 / total as f64 > 0.5 {
            "degraded"
        } else {
            "warning"
        };

        HealthSummary {
            total,
            active,
            inactive,
            by_type,
            health_score,
            overall_status,
        }
    }

    pub async fn get_component_details(&self) -> Vec<ComponentDetail> {
        let now = Utc::now();
        let timeout = self.config.heartbeat_timeout_secs as i64;
        self.store
            .components
            .read()
            .await
            .values()
            .map(|c| {
                let seconds_since_heartbeat = (now - c.last_heartbeat).num_seconds();
                ComponentDetail {
                    component_id: c.component_id.clone(),
                    status: c.status,
                    seconds_since_heartbeat,
                    is_stale: seconds_since_heartbeat > timeout,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(heartbeat_timeout_secs: u64) -> (Arc<MdmStore>, HealthMonitor) {
        let store = Arc::new(MdmStore::new());
        let mut config = ServiceConfig::default();
        config.heartbeat_timeout_secs = heartbeat_timeout_secs;
        let monitor = HealthMonitor::new(store.clone(), Arc::new(config));
        (store, monitor)
    }

    async fn insert_component(store: &MdmStore, id: &str, component_type: &str, last_heartbeat: chrono::DateTime<Utc>, status: ComponentStatus) {
        store.components.write().await.insert(
            id.to_string(),
            ComponentRegistry {
                component_id: id.to_string(),
                component_type: component_type.to_string(),
                cluster_name: "cluster".to_string(),
                auth_token_hash: "hash".to_string(),
                address: "127.0.0.1".to_string(),
                control_port: 7000,
                data_port: None,
                mgmt_port: None,
                status,
                registered_at: last_heartbeat,
                last_heartbeat,
                metadata: serde_json::json!({}),
            },
        );
    }

    #[tokio::test]
    async fn stale_active_component_becomes_down() {
        let (store, monitor) = setup(30);
        insert_component(
            &store,
            "sds-1",
            "sds",
            Utc::now() - chrono::Duration::seconds(60),
            ComponentStatus::Active,
        )
        .await;

        monitor.check_component_health().await;

        assert_eq!(store.components.read().await.get("sds-1").unwrap().status, ComponentStatus::Down);
    }

    #[tokio::test]
    async fn fresh_down_component_recovers() {
        let (store, monitor) = setup(30);
        insert_component(&store, "sds-1", "sds", Utc::now(), ComponentStatus::Down).await;

        monitor.check_component_health().await;

        assert_eq!(store.components.read().await.get("sds-1").unwrap().status, ComponentStatus::Active);
    }

    #[tokio::test]
    async fn health_summary_scores_all_active_as_healthy() {
        let (store, monitor) = setup(30);
        insert_component(&store, "sds-1", "sds", Utc::now(), ComponentStatus::Active).await;
        insert_component(&store, "sdc-1", "sdc", Utc::now(), ComponentStatus::Active).await;

        let summary = monitor.get_health_summary().await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.active, 2);
        assert_eq!(summary.health_score, 100);
        assert_eq!(summary.overall_status, "healthy");
    }

    #[tokio::test]
    async fn health_summary_flags_majority_down_as_degraded() {
        let (store, monitor) = setup(30);
        insert_component(&store, "sds-1", "sds", Utc::now(), ComponentStatus::Down).await;
        insert_component(&store, "sds-2", "sds", Utc::now(), ComponentStatus::Down).await;
        insert_component(&store, "sds-3", "sds", Utc::now(), ComponentStatus::Active).await;

        let summary = monitor.get_health_summary().await;
        assert_eq!(summary.overall_status, "degraded");
    }

    #[tokio::test]
    async fn component_details_mark_stale_past_timeout() {
        let (store, monitor) = setup(10);
        insert_component(
            &store,
            "sds-1",
            "sds",
            Utc::now() - chrono::Duration::seconds(30),
            ComponentStatus::Active,
        )
        .await;

        let details = monitor.get_component_details().await;
        assert_eq!(details.len(), 1);
        assert!(details[0].is_stale);
    }
}
