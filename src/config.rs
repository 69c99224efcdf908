//! Configuration surface (§6), grouped by concern the way the teacher's
//! `EngineConfig` groups protocol/connector/dispatcher/security config.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level server configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub runtime: RuntimeConfig,
    pub tenancy: TenancyConfig,
    pub listeners: Vec<ListenerConfig>,
    pub storage: StorageConfig,
    pub registry_root: String,
}

/// Runtime tunables (§6 Runtime).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    pub default_dialect: Dialect,
    pub jit_enabled: bool,
    pub jit_threshold: u64,
    pub max_concurrency: usize,
    pub exec_timeout_secs: u64,
    pub max_result_rows: Option<u64>,
    pub max_result_sets: Option<u32>,
    pub max_nesting_level: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Dialect {
    TSql,
    Postgres,
    MySql,
    Sqlite,
}

/// Tenant identification configuration (§6 Tenancy).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TenancyConfig {
    pub enabled: bool,
    pub sources: Vec<TenantSource>,
    pub default: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TenantSource {
    pub source_type: TenantSourceType,
    pub name: String,
    pub regex: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum TenantSourceType {
    Header,
    TdsProperty,
    ConnectionString,
    QueryParam,
}

/// Per-protocol listener configuration (§6 Listeners).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    pub name: String,
    pub protocol: ListenerProtocol,
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,
    pub max_connections: Option<u32>,
    pub read_timeout_secs: Option<u64>,
    pub write_timeout_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ListenerProtocol {
    Tds,
    Postgres,
    Http,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: String,
    pub key_file: String,
}

/// Storage backend configuration (§6 Storage).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub backend_type: StorageBackendType,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum StorageBackendType {
    Memory,
    SqlServer,
    Postgres,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            tenancy: TenancyConfig::default(),
            listeners: vec![ListenerConfig {
                name: "tds".to_string(),
                protocol: ListenerProtocol::Tds,
                host: "0.0.0.0".to_string(),
                port: 1433,
                tls: None,
                max_connections: Some(100),
                read_timeout_secs: Some(30),
                write_timeout_secs: Some(30),
                idle_timeout_secs: Some(600),
            }],
            storage: StorageConfig::default(),
            registry_root: "./procedures".to_string(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_dialect: Dialect::TSql,
            jit_enabled: true,
            jit_threshold: 100,
            max_concurrency: 100,
            exec_timeout_secs: 30,
            max_result_rows: None,
            max_result_sets: None,
            max_nesting_level: 32,
        }
    }
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sources: Vec::new(),
            default: String::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend_type: StorageBackendType::Memory,
            host: "localhost".to_string(),
            port: 0,
            database: String::new(),
            username: String::new(),
            password: String::new(),
            max_open_conns: 10,
            max_idle_conns: 2,
            options: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file on disk.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&text)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_one_tds_listener() {
        let config = ServerConfig::default();
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.listeners[0].protocol, ListenerProtocol::Tds);
        assert_eq!(config.listeners[0].port, 1433);
    }

    #[test]
    fn default_runtime_matches_spec_defaults() {
        let runtime = RuntimeConfig::default();
        assert_eq!(runtime.jit_threshold, 100);
        assert_eq!(runtime.max_concurrency, 100);
        assert_eq!(runtime.exec_timeout_secs, 30);
        assert_eq!(runtime.max_nesting_level, 32);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = ServerConfig::default();
        let text = toml::to_string(&config).expect("serialize");
        let parsed: ServerConfig = toml::from_str(&text).expect("parse");
        assert_eq!(parsed.runtime.jit_threshold, config.runtime.jit_threshold);
        assert_eq!(parsed.listeners.len(), config.listeners.len());
    }
}
