//! Worker configuration.
//!
//! Built from `POLOS_*` environment variables, optionally overlaid on a TOML
//! file. Validation reports issues with a severity instead of failing on
//! the first problem.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Orchestrator base URL.
    #[serde(default = "d_api_url")]
    pub api_url: String,
    /// Bearer token for the orchestrator API.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "d_project_id")]
    pub project_id: String,
    /// Deployment this worker serves.
    #[serde(default = "d_deployment_id")]
    pub deployment_id: String,
    #[serde(default)]
    pub server: ServerConfig,
    /// URL the orchestrator should push work to. Derived from the server
    /// binding when unset.
    #[serde(default)]
    pub push_endpoint_url: Option<String>,
    #[serde(default = "d_max_concurrent")]
    pub max_concurrent_workflows: usize,
    #[serde(default = "d_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    /// Safety cap on agent loop iterations when no `max_steps` stop
    /// condition is configured.
    #[serde(default = "d_agent_max_steps")]
    pub agent_max_steps: u32,
    #[serde(default = "d_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub otel: OtelConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            api_url: d_api_url(),
            api_key: None,
            project_id: d_project_id(),
            deployment_id: d_deployment_id(),
            server: ServerConfig::default(),
            push_endpoint_url: None,
            max_concurrent_workflows: d_max_concurrent(),
            heartbeat_interval_secs: d_heartbeat_secs(),
            agent_max_steps: d_agent_max_steps(),
            log_level: d_log_level(),
            otel: OtelConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port the inbound push endpoint listens on.
    #[serde(default = "d_port")]
    pub port: u16,
    /// Bind `127.0.0.1` instead of `0.0.0.0`.
    #[serde(default = "d_local_mode")]
    pub local_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            local_mode: d_local_mode(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtelConfig {
    #[serde(default = "d_otel_enabled")]
    pub enabled: bool,
    #[serde(default = "d_otel_service_name")]
    pub service_name: String,
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: d_otel_enabled(),
            service_name: d_otel_service_name(),
        }
    }
}

fn d_api_url() -> String {
    "http://127.0.0.1:4100".into()
}
fn d_project_id() -> String {
    "default".into()
}
fn d_deployment_id() -> String {
    "dev".into()
}
fn d_max_concurrent() -> usize {
    100
}
fn d_heartbeat_secs() -> u64 {
    30
}
fn d_agent_max_steps() -> u32 {
    20
}
fn d_log_level() -> String {
    "info".into()
}
fn d_port() -> u16 {
    3710
}
fn d_local_mode() -> bool {
    false
}
fn d_otel_enabled() -> bool {
    true
}
fn d_otel_service_name() -> String {
    "polos-worker".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loading
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl WorkerConfig {
    /// Parse a TOML config document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Build from the process environment (`POLOS_*` variables) on top of
    /// defaults.
    pub fn from_env() -> Self {
        let mut cfg = WorkerConfig::default();
        cfg.apply_env();
        cfg
    }

    /// Overlay `POLOS_*` environment variables onto this config.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("POLOS_API_URL") {
            self.api_url = v;
        }
        if let Ok(v) = std::env::var("POLOS_API_KEY") {
            self.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("POLOS_PROJECT_ID") {
            self.project_id = v;
        }
        if let Ok(v) = std::env::var("POLOS_DEPLOYMENT_ID") {
            self.deployment_id = v;
        }
        if let Ok(v) = std::env::var("POLOS_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("POLOS_AGENT_MAX_STEPS") {
            if let Ok(n) = v.parse() {
                self.agent_max_steps = n;
            }
        }
        if let Ok(v) = std::env::var("POLOS_OTEL_ENABLED") {
            self.otel.enabled = v != "false";
        }
        if let Ok(v) = std::env::var("POLOS_OTEL_SERVICE_NAME") {
            self.otel.service_name = v;
        }
    }

    /// The address the inbound server binds to.
    pub fn bind_host(&self) -> &'static str {
        if self.server.local_mode {
            "127.0.0.1"
        } else {
            "0.0.0.0"
        }
    }

    /// The push endpoint URL advertised at registration.
    pub fn effective_push_endpoint(&self) -> String {
        self.push_endpoint_url
            .clone()
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", self.server.port))
    }

    /// Validate the configuration and return a list of issues.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue::error("server.port", "port must be greater than 0"));
        }
        if self.max_concurrent_workflows == 0 {
            issues.push(ConfigIssue::error(
                "max_concurrent_workflows",
                "must allow at least one concurrent workflow",
            ));
        }
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            issues.push(ConfigIssue::error("api_url", "must be an http(s) URL"));
        }
        if self.heartbeat_interval_secs < 5 {
            issues.push(ConfigIssue::warning(
                "heartbeat_interval_secs",
                "heartbeats below 5s put needless load on the orchestrator",
            ));
        }
        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    fn error(field: &str, message: &str) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: &str, message: &str) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}
