use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigIssue, ConfigSeverity, Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration shared by both control-plane binaries.
///
/// Loaded from an optional TOML file, then overridden by environment
/// variables (`ARCOR2_*`). Every section has serde defaults so an empty
/// file (or no file at all) yields a runnable local setup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ARServer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_6789")]
    pub port: u16,
    /// Seconds a disconnected user keeps their locks before auto-release.
    #[serde(default = "d_2")]
    pub lock_release_secs: u64,
    /// Aiming sessions older than this are pruned on user login.
    #[serde(default = "d_300")]
    pub aiming_prune_secs: u64,
    /// RPC handlers exceeding this soft deadline log a warning.
    #[serde(default = "d_5000")]
    pub rpc_warn_ms: u64,
    /// Outbound event queue per UI peer; overflow drops per event class.
    #[serde(default = "d_256")]
    pub peer_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: 6789,
            lock_release_secs: 2,
            aiming_prune_secs: 300,
            rpc_warn_ms: 5_000,
            peer_queue: 256,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_6790")]
    pub port: u16,
    /// Canonical extraction path of the running package
    /// (`ARCOR2_PROJECT_PATH`). No default: absent is fatal at startup.
    #[serde(default)]
    pub project_path: Option<PathBuf>,
    /// Directory holding uploaded/downloaded package zips and metadata.
    #[serde(default)]
    pub packages_dir: Option<PathBuf>,
    /// Seconds between SIGTERM and SIGKILL on the stop path.
    #[serde(default = "d_5")]
    pub stop_deadline_secs: u64,
    #[serde(default = "d_256")]
    pub peer_queue: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: 6790,
            project_path: None,
            packages_dir: None,
            stop_deadline_secs: 5,
            peer_queue: 256,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Collaborator services
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default = "d_build_url")]
    pub build_url: String,
    #[serde(default = "d_persistence_url")]
    pub persistence_url: String,
    #[serde(default = "d_scene_url")]
    pub scene_service_url: String,
    /// Websocket URL of the execution manager, as seen from the server.
    #[serde(default = "d_execution_url")]
    pub execution_url: String,
    #[serde(default = "d_8000")]
    pub timeout_ms: u64,
    #[serde(default = "d_3")]
    pub max_retries: u32,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            build_url: d_build_url(),
            persistence_url: d_persistence_url(),
            scene_service_url: d_scene_url(),
            execution_url: d_execution_url(),
            timeout_ms: 8_000,
            max_retries: 3,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Catalog caches
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Coarse freshness window of the per-kind listing map.
    #[serde(default = "d_1000")]
    pub listing_ttl_ms: u64,
    /// Full entities kept per kind before LRU eviction.
    #[serde(default = "d_32")]
    pub entity_capacity: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            listing_ttl_ms: 1_000,
            entity_capacity: 32,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loading
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Config {
    /// Load from an optional TOML file and apply `ARCOR2_*` env overrides.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| Error::Config(format!("cannot read {}: {e}", p.display())))?;
                toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?
            }
            None => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment variables win over file values.
    pub fn apply_env(&mut self) {
        if let Some(port) = env_u16("ARCOR2_SERVER_PORT") {
            self.server.port = port;
        }
        if let Some(port) = env_u16("ARCOR2_EXECUTION_PORT") {
            self.execution.port = port;
        }
        if let Ok(path) = std::env::var("ARCOR2_PROJECT_PATH") {
            self.execution.project_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("ARCOR2_PACKAGES_DIR") {
            self.execution.packages_dir = Some(PathBuf::from(path));
        }
        if let Ok(url) = std::env::var("ARCOR2_BUILD_URL") {
            self.services.build_url = url;
        }
        if let Ok(url) = std::env::var("ARCOR2_PERSISTENCE_URL") {
            self.services.persistence_url = url;
        }
        if let Ok(url) = std::env::var("ARCOR2_SCENE_SERVICE_URL") {
            self.services.scene_service_url = url;
        }
        if let Ok(url) = std::env::var("ARCOR2_EXECUTION_URL") {
            self.services.execution_url = url;
        }
    }

    /// Cross-field checks shared by both binaries; the execution-only
    /// requirement on `project_path` is checked by the manager itself.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        for (field, url) in [
            ("services.build_url", &self.services.build_url),
            ("services.persistence_url", &self.services.persistence_url),
            ("services.scene_service_url", &self.services.scene_service_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: field.to_owned(),
                    message: format!("not an http(s) URL: {url}"),
                });
            }
        }
        if !self.services.execution_url.starts_with("ws://")
            && !self.services.execution_url.starts_with("wss://")
        {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "services.execution_url".to_owned(),
                message: format!("not a ws(s) URL: {}", self.services.execution_url),
            });
        }
        if self.catalog.entity_capacity == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "catalog.entity_capacity".to_owned(),
                message: "must be at least 1".to_owned(),
            });
        }
        if self.server.lock_release_secs == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "server.lock_release_secs".to_owned(),
                message: "locks release immediately on disconnect".to_owned(),
            });
        }
        issues
    }
}

fn env_u16(name: &str) -> Option<u16> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

// ── serde default helpers ───────────────────────────────────────────

fn d_host() -> String {
    "0.0.0.0".into()
}
fn d_6789() -> u16 {
    6789
}
fn d_6790() -> u16 {
    6790
}
fn d_2() -> u64 {
    2
}
fn d_3() -> u32 {
    3
}
fn d_5() -> u64 {
    5
}
fn d_300() -> u64 {
    300
}
fn d_5000() -> u64 {
    5_000
}
fn d_8000() -> u64 {
    8_000
}
fn d_1000() -> u64 {
    1_000
}
fn d_256() -> usize {
    256
}
fn d_32() -> usize {
    32
}
fn d_build_url() -> String {
    "http://0.0.0.0:5008".into()
}
fn d_persistence_url() -> String {
    "http://0.0.0.0:11000".into()
}
fn d_scene_url() -> String {
    "http://0.0.0.0:5013".into()
}
fn d_execution_url() -> String {
    "ws://0.0.0.0:6790".into()
}
