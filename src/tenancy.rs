//! Tenant identification (§6 Tenancy).
//!
//! Resolves the tenant for an incoming connection by walking the
//! configured ordered source list until one yields a value, falling
//! back to the configured default (or no tenant at all) when none do.

use log::debug;
use regex::Regex;

use crate::config::{TenancyConfig, TenantSource, TenantSourceType};

/// The bag of raw facts a listener can extract about an inbound
/// connection before tenant resolution runs: an HTTP-style header map,
/// a TDS PRELOGIN/LOGIN7 property (e.g. the `hostname` field misused as
/// a tenant marker by some drivers), a connection string, and a query
/// parameter map (for listeners that have one).
#[derive(Debug, Clone, Default)]
pub struct TenantSignal<'a> {
    pub headers: &'a [(String, String)],
    pub tds_property: Option<&'a str>,
    pub connection_string: Option<&'a str>,
    pub query_params: &'a [(String, String)],
}

/// Resolves tenant identity from a [`TenantSignal`] per the ordered
/// `sources` list in [`TenancyConfig`]. One instance is built at
/// start-up and shared (via `Arc`) across every connection — it holds
/// no per-connection state.
pub struct TenantResolver {
    enabled: bool,
    sources: Vec<CompiledSource>,
    default: Option<String>,
}

struct CompiledSource {
    source_type: TenantSourceType,
    name: String,
    regex: Option<Regex>,
}

impl TenantResolver {
    pub fn new(config: &TenancyConfig) -> Self {
        let sources = config
            .sources
            .iter()
            .map(CompiledSource::from_config)
            .collect();
        Self {
            enabled: config.enabled,
            sources,
            default: if config.default.is_empty() {
                None
            } else {
                Some(config.default.clone())
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Walk the configured sources in order; the first one that
    /// extracts a non-empty value wins. Falls back to the configured
    /// default tenant, or `None` if tenancy is effectively anonymous for
    /// this connection.
    pub fn resolve(&self, signal: &TenantSignal) -> Option<String> {
        if !self.enabled {
            return None;
        }
        for source in &self.sources {
            if let Some(tenant) = source.extract(signal) {
                debug!(target: "tenancy", "resolved tenant {tenant:?} via {:?}", source.source_type);
                return Some(tenant);
            }
        }
        self.default.clone()
    }
}

impl CompiledSource {
    fn from_config(source: &TenantSource) -> Self {
        Self {
            source_type: source.source_type,
            name: source.name.clone(),
            regex: source
                .regex
                .as_deref()
                .and_then(|pattern| Regex::new(pattern).ok()),
        }
    }

    fn extract(&self, signal: &TenantSignal) -> Option<String> {
        let raw = match self.source_type {
            TenantSourceType::Header => signal
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(&self.name))
                .map(|(_, v)| v.clone()),
            TenantSourceType::TdsProperty => signal.tds_property.map(|s| s.to_string()),
            TenantSourceType::ConnectionString => signal.connection_string.map(|s| s.to_string()),
            TenantSourceType::QueryParam => signal
                .query_params
                .iter()
                .find(|(k, _)| k == &self.name)
                .map(|(_, v)| v.clone()),
        }?;

        match &self.regex {
            Some(re) => re
                .captures(&raw)
                .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
                .map(|m| m.as_str().to_string()),
            None if raw.is_empty() => None,
            None => Some(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(sources: Vec<TenantSource>, default: &str) -> TenancyConfig {
        TenancyConfig {
            enabled: true,
            sources,
            default: default.to_string(),
        }
    }

    #[test]
    fn disabled_resolver_never_resolves() {
        let mut cfg = config(vec![], "acme");
        cfg.enabled = false;
        let resolver = TenantResolver::new(&cfg);
        let signal = TenantSignal::default();
        assert_eq!(resolver.resolve(&signal), None);
    }

    #[test]
    fn header_source_extracts_by_name_case_insensitively() {
        let cfg = config(
            vec![TenantSource {
                source_type: TenantSourceType::Header,
                name: "X-Tenant-Id".to_string(),
                regex: None,
            }],
            "",
        );
        let resolver = TenantResolver::new(&cfg);
        let headers = vec![("x-tenant-id".to_string(), "acme".to_string())];
        let signal = TenantSignal {
            headers: &headers,
            ..Default::default()
        };
        assert_eq!(resolver.resolve(&signal), Some("acme".to_string()));
    }

    #[test]
    fn falls_back_to_default_when_no_source_matches() {
        let cfg = config(
            vec![TenantSource {
                source_type: TenantSourceType::Header,
                name: "X-Tenant-Id".to_string(),
                regex: None,
            }],
            "shared",
        );
        let resolver = TenantResolver::new(&cfg);
        let signal = TenantSignal::default();
        assert_eq!(resolver.resolve(&signal), Some("shared".to_string()));
    }

    #[test]
    fn connection_string_source_applies_regex_capture() {
        let cfg = config(
            vec![TenantSource {
                source_type: TenantSourceType::ConnectionString,
                name: "unused".to_string(),
                regex: Some(r"Tenant=([A-Za-z0-9_-]+)".to_string()),
            }],
            "",
        );
        let resolver = TenantResolver::new(&cfg);
        let conn_str = "Server=tcp:host,1433;Tenant=acme;Database=salesdb";
        let signal = TenantSignal {
            connection_string: Some(conn_str),
            ..Default::default()
        };
        assert_eq!(resolver.resolve(&signal), Some("acme".to_string()));
    }

    #[test]
    fn earlier_source_wins_over_later_one() {
        let cfg = config(
            vec![
                TenantSource {
                    source_type: TenantSourceType::Header,
                    name: "X-Tenant-Id".to_string(),
                    regex: None,
                },
                TenantSource {
                    source_type: TenantSourceType::QueryParam,
                    name: "tenant".to_string(),
                    regex: None,
                },
            ],
            "",
        );
        let resolver = TenantResolver::new(&cfg);
        let headers = vec![("X-Tenant-Id".to_string(), "from-header".to_string())];
        let query_params = vec![("tenant".to_string(), "from-query".to_string())];
        let signal = TenantSignal {
            headers: &headers,
            query_params: &query_params,
            ..Default::default()
        };
        assert_eq!(resolver.resolve(&signal), Some("from-header".to_string()));
    }
}
