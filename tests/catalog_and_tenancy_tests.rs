use std::collections::HashMap;
use std::sync::Arc;

use tsql_proc_host::catalog::CatalogProvider;
use tsql_proc_host::config::{Dialect, TenancyConfig, TenantSource, TenantSourceType};
use tsql_proc_host::registry::{Procedure, ProcedureId, Registry};
use tsql_proc_host::storage::MemoryStorage;
use tsql_proc_host::tenancy::{TenantResolver, TenantSignal};

#[tokio::test]
async fn catalog_answers_sys_procedures_from_the_registry() {
    let registry = Arc::new(Registry::new());
    let storage: Arc<MemoryStorage> = Arc::new(MemoryStorage::new());

    let procedure = Procedure::new(
        ProcedureId {
            tenant: None,
            database: Some("salesdb".to_string()),
            schema: "dbo".to_string(),
            name: "GetCustomer".to_string(),
        },
        Dialect::TSql,
        "CREATE PROCEDURE dbo.GetCustomer AS SELECT 1".to_string(),
        vec![],
        HashMap::new(),
    );
    registry.register(procedure, false).unwrap();

    let catalog = CatalogProvider::new(registry, storage);
    let result = catalog
        .query("SELECT * FROM sys.procedures", None, "salesdb")
        .await
        .expect("sys.procedures should be intercepted");

    assert_eq!(result.row_count(), 1);
    assert_eq!(result.rows[0].values[1], tsql_proc_host::types::Value::Text("GetCustomer".to_string()));
}

#[tokio::test]
async fn catalog_does_not_intercept_ordinary_statements() {
    let registry = Arc::new(Registry::new());
    let storage: Arc<MemoryStorage> = Arc::new(MemoryStorage::new());
    let catalog = CatalogProvider::new(registry, storage);

    let result = catalog.query("SELECT * FROM dbo.Orders", None, "salesdb").await;
    assert!(result.is_none());
}

#[test]
fn tenant_resolver_prefers_header_over_connection_string() {
    let config = TenancyConfig {
        enabled: true,
        sources: vec![
            TenantSource {
                source_type: TenantSourceType::Header,
                name: "X-Tenant-Id".to_string(),
                regex: None,
            },
            TenantSource {
                source_type: TenantSourceType::ConnectionString,
                name: "tenant".to_string(),
                regex: None,
            },
        ],
        default: "default-tenant".to_string(),
    };
    let resolver = TenantResolver::new(&config);

    let signal = TenantSignal {
        headers: &[("x-tenant-id".to_string(), "acme".to_string())],
        connection_string: Some("tenant=other-co;"),
        ..Default::default()
    };
    assert_eq!(resolver.resolve(&signal), Some("acme".to_string()));
}

#[test]
fn tenant_resolver_falls_back_to_default_when_nothing_matches() {
    let config = TenancyConfig {
        enabled: true,
        sources: vec![TenantSource {
            source_type: TenantSourceType::Header,
            name: "X-Tenant-Id".to_string(),
            regex: None,
        }],
        default: "default-tenant".to_string(),
    };
    let resolver = TenantResolver::new(&config);
    let signal = TenantSignal::default();
    assert_eq!(resolver.resolve(&signal), Some("default-tenant".to_string()));
}
