//! Service configuration, loaded from the environment with `dotenv` fallback.
//!
//! Generalizes the old JSON-file `ServerConfig` into the port/storage/
//! timeout knobs spec.md §6 names. Every service (`mdm`, `sds`, `sdc`)
//! builds one `ServiceConfig` at startup and calls [`ServiceConfig::validate`]
//! before binding anything — a violation aborts startup rather than
//! surfacing as a runtime panic.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoMode {
    NetworkPreferLocal,
    NetworkOnly,
}

impl Default for IoMode {
    fn default() -> Self {
        IoMode::NetworkOnly
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteAckPolicy {
    All,
    Quorum,
}

impl Default for WriteAckPolicy {
    fn default() -> Self {
        WriteAckPolicy::Quorum
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub control_plane_base_port: u16,
    pub data_plane_base_port: u16,
    pub mdm_api_port: u16,
    pub sdc_service_port: u16,
    pub management_port: u16,

    pub storage_root: String,
    pub mdm_base_url: String,

    pub io_mode: IoMode,
    pub write_ack_policy: WriteAckPolicy,

    pub plan_cache_ttl_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub ack_batch_interval_secs: u64,
    pub ack_batch_size: usize,
    pub rebuild_rate_limit_bytes_per_sec: u64,

    pub allow_legacy_registration: bool,

    pub cluster_name: String,
    pub cluster_secret: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            control_plane_base_port: 7000,
            data_plane_base_port: 7100,
            mdm_api_port: 8080,
            sdc_service_port: 7300,
            management_port: 7400,
            storage_root: "./storage".to_string(),
            mdm_base_url: "http://127.0.0.1:8080".to_string(),
            io_mode: IoMode::NetworkOnly,
            write_ack_policy: WriteAckPolicy::Quorum,
            plan_cache_ttl_secs: 30,
            heartbeat_timeout_secs: 30,
            heartbeat_interval_secs: 10,
            ack_batch_interval_secs: 5,
            ack_batch_size: 100,
            rebuild_rate_limit_bytes_per_sec: 100 * 1024 * 1024,
            allow_legacy_registration: true,
            cluster_name: "flexsim-cluster".to_string(),
            cluster_secret: "dev-cluster-secret-change-me".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("port collision: {0}")]
    PortCollision(String),
    #[error("invalid host: {0}")]
    InvalidHost(String),
    #[error("invalid mdm base url: {0}")]
    InvalidUrl(String),
}

impl ServiceConfig {
    /// Loads configuration from environment variables, falling back to
    /// `.env` and then to the built-in defaults field-by-field.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let mut cfg = ServiceConfig::default();

        macro_rules! env_u16 {
            ($key:expr, $field:expr) => {
                if let Ok(v) = std::env::var($key) {
                    if let Ok(parsed) = v.parse() {
                        $field = parsed;
                    }
                }
            };
        }
        macro_rules! env_u64 {
            ($key:expr, $field:expr) => {
                if let Ok(v) = std::env::var($key) {
                    if let Ok(parsed) = v.parse() {
                        $field = parsed;
                    }
                }
            };
        }
        macro_rules! env_str {
            ($key:expr, $field:expr) => {
                if let Ok(v) = std::env::var($key) {
                    $field = v;
                }
            };
        }

        env_u16!("FLEXSIM_CONTROL_PORT", cfg.control_plane_base_port);
        env_u16!("FLEXSIM_DATA_PORT", cfg.data_plane_base_port);
        env_u16!("FLEXSIM_MDM_API_PORT", cfg.mdm_api_port);
        env_u16!("FLEXSIM_SDC_PORT", cfg.sdc_service_port);
        env_u16!("FLEXSIM_MGMT_PORT", cfg.management_port);
        env_str!("FLEXSIM_STORAGE_ROOT", cfg.storage_root);
        env_str!("FLEXSIM_MDM_BASE_URL", cfg.mdm_base_url);
        env_u64!("FLEXSIM_PLAN_CACHE_TTL_SECS", cfg.plan_cache_ttl_secs);
        env_u64!("FLEXSIM_HEARTBEAT_TIMEOUT_SECS", cfg.heartbeat_timeout_secs);
        env_u64!(
            "FLEXSIM_HEARTBEAT_INTERVAL_SECS",
            cfg.heartbeat_interval_secs
        );
        env_u64!("FLEXSIM_ACK_BATCH_INTERVAL_SECS", cfg.ack_batch_interval_secs);
        env_u64!("FLEXSIM_ACK_BATCH_SIZE", cfg.ack_batch_size);
        env_u64!(
            "FLEXSIM_REBUILD_RATE_LIMIT_BPS",
            cfg.rebuild_rate_limit_bytes_per_sec
        );
        env_str!("FLEXSIM_CLUSTER_NAME", cfg.cluster_name);
        env_str!("FLEXSIM_CLUSTER_SECRET", cfg.cluster_secret);

        if let Ok(v) = std::env::var("FLEXSIM_IO_MODE") {
            cfg.io_mode = match v.as_str() {
                "network_prefer_local" => IoMode::NetworkPreferLocal,
                _ => IoMode::NetworkOnly,
            };
        }
        if let Ok(v) = std::env::var("FLEXSIM_WRITE_ACK_POLICY") {
            cfg.write_ack_policy = match v.as_str() {
                "all" => WriteAckPolicy::All,
                _ => WriteAckPolicy::Quorum,
            };
        }

        cfg
    }

    /// Startup profile validation per spec.md §6: host non-empty, ports in
    /// range, no collisions between control/data/management/API ports, and
    /// the MDM base URL parses as HTTP(S). Pick one port-collision rule and
    /// enforce it uniformly (Open Question #4): no two of the four ports may
    /// be equal, including `data_port == control_port`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_root.trim().is_empty() {
            return Err(ConfigError::InvalidHost(
                "storage_root must not be empty".into(),
            ));
        }

        let ports = [
            ("control_plane_base_port", self.control_plane_base_port),
            ("data_plane_base_port", self.data_plane_base_port),
            ("mdm_api_port", self.mdm_api_port),
            ("sdc_service_port", self.sdc_service_port),
            ("management_port", self.management_port),
        ];
        for (name, port) in ports {
            if port == 0 {
                return Err(ConfigError::InvalidPort(format!(
                    "{name} must be in [1, 65535], got {port}"
                )));
            }
        }
        for i in 0..ports.len() {
            for j in (i + 1)..ports.len() {
                if ports[i].1 == ports[j].1 {
                    return Err(ConfigError::PortCollision(format!(
                        "{} and {} both use port {}",
                        ports[i].0, ports[j].0, ports[i].1
                    )));
                }
            }
        }

        if !(self.mdm_base_url.starts_with("http://") || self.mdm_base_url.starts_with("https://"))
        {
            return Err(ConfigError::InvalidUrl(self.mdm_base_url.clone()));
        }

        Ok(())
    }
}

lazy_static::lazy_static! {
    pub static ref SERVICE_CONFIG: Arc<ServiceConfig> = Arc::new(ServiceConfig::from_env());
}
