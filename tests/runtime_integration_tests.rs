use std::collections::HashMap;
use std::sync::Arc;

use tsql_proc_host::compile::{DisabledTranspiler, Manager};
use tsql_proc_host::config::{Dialect, RuntimeConfig};
use tsql_proc_host::registry::{Procedure, ProcedureId, Registry};
use tsql_proc_host::runtime::{ExecContext, Runtime, Session};
use tsql_proc_host::storage::MemoryStorage;

fn test_runtime() -> (Arc<Registry>, Arc<Runtime>) {
    let registry = Arc::new(Registry::new());
    let storage = Arc::new(MemoryStorage::new());
    let manager = Arc::new(Manager::spawn(Arc::new(DisabledTranspiler), 2));
    let runtime = Runtime::new(registry.clone(), storage, manager, RuntimeConfig::default());
    (registry, runtime)
}

#[tokio::test]
async fn executes_registered_procedure_and_increments_counters() {
    let (registry, runtime) = test_runtime();

    let id = ProcedureId {
        tenant: None,
        database: Some("salesdb".to_string()),
        schema: "dbo".to_string(),
        name: "GetCustomer".to_string(),
    };
    let procedure = Procedure::new(id.clone(), Dialect::TSql, "SELECT 1".to_string(), vec![], HashMap::new());
    registry.register(procedure, false).unwrap();

    let resolved = registry.lookup_id(&id).unwrap();
    assert_eq!(resolved.exec_count(), 0);

    let mut session = Session::new("s1", "conn1");
    session.database = "salesdb".to_string();
    let ctx = ExecContext::new("s1", "salesdb");

    let result = runtime.execute(&mut session, resolved.clone(), ctx).await.unwrap();
    assert_eq!(result.rows_affected, 0);
    assert_eq!(resolved.exec_count(), 1);
}

#[tokio::test]
async fn ad_hoc_batch_never_touches_compile_status() {
    let (_registry, runtime) = test_runtime();
    let mut session = Session::new("s2", "conn2");
    let ctx = ExecContext::new("s2", "master");

    let result = runtime.execute_sql(&mut session, "SELECT 1", ctx).await.unwrap();
    assert_eq!(result.rows_affected, 0);
    assert!(result.result_sets.is_empty() || result.result_sets.len() == 1);
}

#[tokio::test]
async fn tenant_override_is_preferred_over_database_scoped_procedure() {
    let (registry, _runtime) = test_runtime();

    let database_scoped = Procedure::new(
        ProcedureId {
            tenant: None,
            database: Some("salesdb".to_string()),
            schema: "dbo".to_string(),
            name: "GetCustomer".to_string(),
        },
        Dialect::TSql,
        "SELECT 'global-db'".to_string(),
        vec![],
        HashMap::new(),
    );
    registry.register(database_scoped, false).unwrap();

    let tenant_override = Procedure::new(
        ProcedureId {
            tenant: Some("acme".to_string()),
            database: Some("salesdb".to_string()),
            schema: "dbo".to_string(),
            name: "GetCustomer".to_string(),
        },
        Dialect::TSql,
        "SELECT 'acme-override'".to_string(),
        vec![],
        HashMap::new(),
    );
    registry.register(tenant_override, true).unwrap();

    let ctx = tsql_proc_host::registry::LookupContext {
        tenant: Some("acme".to_string()),
        database: Some("salesdb".to_string()),
    };
    let resolved = registry.lookup(&ctx, "dbo.GetCustomer").unwrap();
    assert_eq!(resolved.source, "SELECT 'acme-override'");

    let ctx_no_tenant = tsql_proc_host::registry::LookupContext {
        tenant: None,
        database: Some("salesdb".to_string()),
    };
    let resolved_no_tenant = registry.lookup(&ctx_no_tenant, "dbo.GetCustomer").unwrap();
    assert_eq!(resolved_no_tenant.source, "SELECT 'global-db'");
}
