//! The `Registry`: in-memory index over loaded procedures, resolving
//! lookups with tenant-override-then-global fallback (§3, §4.2).

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{ProcedureError, ServerError, ServerResult};
use crate::registry::loader::LoadedProcedure;
use crate::registry::procedure::{content_hash, Procedure, ProcedureId};

/// Context a lookup is performed under: which tenant (if any) and which
/// database the caller's session is connected to.
#[derive(Debug, Clone, Default)]
pub struct LookupContext {
    pub tenant: Option<String>,
    pub database: Option<String>,
}

/// Holds every loaded procedure, indexed three ways so a lookup never
/// has to scan:
///
/// - `qualified`: `db.schema.name` -> procedure, for non-tenant callers.
/// - `globals`: `schema.name` -> procedure, for `_global/` entries.
/// - `tenants`: `tenant/db.schema.name` -> procedure, for per-tenant
///   overrides.
pub struct Registry {
    qualified: DashMap<String, Arc<Procedure>>,
    globals: DashMap<String, Arc<Procedure>>,
    tenants: DashMap<String, Arc<Procedure>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            qualified: DashMap::new(),
            globals: DashMap::new(),
            tenants: DashMap::new(),
        }
    }

    /// Register every procedure a [`Loader`](crate::registry::loader::Loader)
    /// produced. Idempotent: registering byte-identical content twice is a
    /// no-op; registering changed content replaces the entry (§3 invariant:
    /// "re-registration with identical content is a no-op, with changed
    /// content replaces the entry and invalidates its compiled artifact").
    pub fn load_all(&self, loaded: Vec<LoadedProcedure>) -> ServerResult<usize> {
        let mut count = 0;
        for entry in loaded {
            self.register(entry.procedure, entry.is_tenant_override)?;
            count += 1;
        }
        Ok(count)
    }

    pub fn register(&self, procedure: Procedure, is_tenant_override: bool) -> ServerResult<()> {
        let key = if is_tenant_override {
            tenant_key(&procedure.id)
        } else if procedure.id.is_global() {
            procedure.id.global_key()
        } else {
            procedure.id.qualified_key()
        };

        let map = if is_tenant_override {
            &self.tenants
        } else if procedure.id.is_global() {
            &self.globals
        } else {
            &self.qualified
        };

        if let Some(existing) = map.get(&key) {
            if existing.content_hash == procedure.content_hash {
                return Ok(());
            }
            existing.compile.invalidate();
        }

        map.insert(key, Arc::new(procedure));
        Ok(())
    }

    /// Resolve a raw, possibly dotted call-site reference (e.g.
    /// `GetCustomer`, `dbo.GetCustomer`, `otherdb.dbo.GetCustomer`) under
    /// the given context, applying the fallback order from §4.2:
    /// tenant-specific override (itself tried with the database-context
    /// fallback below), then the shared qualified map with the same
    /// fallback, then globals.
    ///
    /// Database-context fallback depends on the number of dotted parts
    /// in `name`: a 3-part name is tried as an exact cross-database key
    /// as-is; a 1-part name is retried as `database.dbo.name`; a 2-part
    /// name is retried as `database.name`. The globals fallback strips
    /// the database component and tries `schema.name`, then `dbo.name`.
    /// Matching is case-insensitive.
    pub fn lookup(&self, ctx: &LookupContext, name: &str) -> ServerResult<Arc<Procedure>> {
        let normalized = name.to_lowercase();
        let parts: Vec<&str> = normalized.split('.').collect();

        if let Some(tenant) = &ctx.tenant {
            if let Some(database) = &ctx.database {
                let tenant = tenant.to_lowercase();
                for candidate in qualified_key_candidates(database, &parts) {
                    let tk = format!("{tenant}/{candidate}");
                    if let Some(proc) = self.tenants.get(&tk) {
                        return Ok(proc.clone());
                    }
                }
            }
        }

        if let Some(database) = &ctx.database {
            for candidate in qualified_key_candidates(database, &parts) {
                if let Some(proc) = self.qualified.get(&candidate) {
                    return Ok(proc.clone());
                }
            }
        }

        for candidate in global_key_candidates(&parts) {
            if let Some(proc) = self.globals.get(&candidate) {
                return Ok(proc.clone());
            }
        }

        Err(ServerError::Procedure(ProcedureError::NotFound(
            name.to_string(),
        )))
    }

    /// Look up by an already-parsed [`ProcedureId`], honouring the same
    /// fallback order as [`Registry::lookup`].
    pub fn lookup_id(&self, id: &ProcedureId) -> ServerResult<Arc<Procedure>> {
        let ctx = LookupContext {
            tenant: id.tenant.clone(),
            database: id.database.clone(),
        };
        self.lookup(&ctx, &format!("{}.{}", id.schema, id.name))
    }

    pub fn len(&self) -> usize {
        self.qualified.len() + self.globals.len() + self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot every procedure visible to `(tenant, database)`: database-
    /// scoped entries for `database`, every global, and — when `tenant` is
    /// given — that tenant's overrides for `database`. Used by the
    /// system-catalog provider (§6) to answer `sys.procedures`-style
    /// queries; not on any execution hot path.
    pub fn procedures_for(&self, tenant: Option<&str>, database: &str) -> Vec<Arc<Procedure>> {
        let db_prefix = format!("{}.", database.to_lowercase());
        let mut found: Vec<Arc<Procedure>> = self
            .qualified
            .iter()
            .filter(|entry| entry.key().starts_with(&db_prefix))
            .map(|entry| entry.value().clone())
            .collect();

        found.extend(self.globals.iter().map(|entry| entry.value().clone()));

        if let Some(tenant) = tenant {
            let tenant_prefix = format!("{}/{}.", tenant.to_lowercase(), database.to_lowercase());
            found.extend(
                self.tenants
                    .iter()
                    .filter(|entry| entry.key().starts_with(&tenant_prefix))
                    .map(|entry| entry.value().clone()),
            );
        }

        found
    }

    /// Recompute whether `source` still matches the registered hash for
    /// `id`; used by hot-reload watchers before deciding to re-register.
    pub fn has_diverged(&self, id: &ProcedureId, source: &str) -> bool {
        match self.lookup_id(id) {
            Ok(proc) => proc.content_hash != content_hash(source),
            Err(_) => true,
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn tenant_key(id: &ProcedureId) -> String {
    let tenant = id.tenant.as_deref().unwrap_or("");
    let database = id.database.as_deref().unwrap_or("");
    format!("{}/{}.{}.{}", tenant, database, id.schema, id.name).to_lowercase()
}

/// Database-context fallback candidates for a dotted reference, tried in
/// order within a given qualified/tenant map (§4.2). `database` and
/// `parts` are assumed already lowercased by the caller.
fn qualified_key_candidates(database: &str, parts: &[&str]) -> Vec<String> {
    let database = database.to_lowercase();
    match parts.len() {
        1 => vec![parts[0].to_string(), format!("{database}.dbo.{}", parts[0])],
        2 => vec![parts.join("."), format!("{database}.{}", parts.join("."))],
        _ => vec![parts.join(".")],
    }
}

/// Globals fallback candidates: strip the database component and try
/// `schema.name`, then `dbo.name` (§4.2).
fn global_key_candidates(parts: &[&str]) -> Vec<String> {
    let bare = parts.last().copied().unwrap_or_default();
    match parts.len() {
        3 => vec![format!("{}.{}", parts[1], parts[2]), format!("dbo.{bare}")],
        2 => vec![parts.join("."), format!("dbo.{bare}")],
        _ => vec![format!("dbo.{bare}")],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Dialect;
    use std::collections::HashMap;

    fn make(id: ProcedureId, source: &str) -> Procedure {
        Procedure::new(id, Dialect::TSql, source.to_string(), vec![], HashMap::new())
    }

    #[test]
    fn global_procedure_resolves_for_any_database() {
        let registry = Registry::new();
        let id = ProcedureId {
            tenant: None,
            database: None,
            schema: "dbo".into(),
            name: "Ping".into(),
        };
        registry.register(make(id, "SELECT 1"), false).unwrap();

        let ctx = LookupContext {
            tenant: None,
            database: Some("anydb".into()),
        };
        let found = registry.lookup(&ctx, "dbo.Ping").unwrap();
        assert_eq!(found.id.name, "Ping");
    }

    #[test]
    fn database_scoped_procedure_shadows_global_of_same_name() {
        let registry = Registry::new();
        registry
            .register(
                make(
                    ProcedureId {
                        tenant: None,
                        database: None,
                        schema: "dbo".into(),
                        name: "GetTime".into(),
                    },
                    "SELECT GLOBAL",
                ),
                false,
            )
            .unwrap();
        registry
            .register(
                make(
                    ProcedureId {
                        tenant: None,
                        database: Some("salesdb".into()),
                        schema: "dbo".into(),
                        name: "GetTime".into(),
                    },
                    "SELECT LOCAL",
                ),
                false,
            )
            .unwrap();

        let ctx = LookupContext {
            tenant: None,
            database: Some("salesdb".into()),
        };
        let found = registry.lookup(&ctx, "dbo.GetTime").unwrap();
        assert_eq!(found.source, "SELECT LOCAL");
    }

    #[test]
    fn tenant_override_shadows_database_and_global() {
        let registry = Registry::new();
        registry
            .register(
                make(
                    ProcedureId {
                        tenant: None,
                        database: Some("salesdb".into()),
                        schema: "dbo".into(),
                        name: "GetCustomer".into(),
                    },
                    "SELECT SHARED",
                ),
                false,
            )
            .unwrap();
        registry
            .register(
                make(
                    ProcedureId {
                        tenant: Some("acme".into()),
                        database: Some("salesdb".into()),
                        schema: "dbo".into(),
                        name: "GetCustomer".into(),
                    },
                    "SELECT ACME",
                ),
                true,
            )
            .unwrap();

        let acme_ctx = LookupContext {
            tenant: Some("acme".into()),
            database: Some("salesdb".into()),
        };
        assert_eq!(
            registry.lookup(&acme_ctx, "dbo.GetCustomer").unwrap().source,
            "SELECT ACME"
        );

        let other_ctx = LookupContext {
            tenant: Some("widgetco".into()),
            database: Some("salesdb".into()),
        };
        assert_eq!(
            registry.lookup(&other_ctx, "dbo.GetCustomer").unwrap().source,
            "SELECT SHARED"
        );
    }

    #[test]
    fn three_part_name_resolves_across_databases() {
        let registry = Registry::new();
        registry
            .register(
                make(
                    ProcedureId {
                        tenant: None,
                        database: Some("otherdb".into()),
                        schema: "dbo".into(),
                        name: "Proc".into(),
                    },
                    "SELECT OTHERDB",
                ),
                false,
            )
            .unwrap();

        let ctx = LookupContext {
            tenant: None,
            database: Some("salesdb".into()),
        };
        let found = registry.lookup(&ctx, "otherdb.dbo.Proc").unwrap();
        assert_eq!(found.source, "SELECT OTHERDB");
    }

    #[test]
    fn bare_name_falls_back_to_dbo_schema_in_current_database() {
        let registry = Registry::new();
        registry
            .register(
                make(
                    ProcedureId {
                        tenant: None,
                        database: Some("salesdb".into()),
                        schema: "dbo".into(),
                        name: "GetTime".into(),
                    },
                    "SELECT LOCAL",
                ),
                false,
            )
            .unwrap();

        let ctx = LookupContext {
            tenant: None,
            database: Some("salesdb".into()),
        };
        let found = registry.lookup(&ctx, "GetTime").unwrap();
        assert_eq!(found.source, "SELECT LOCAL");
    }

    #[test]
    fn globals_fallback_tries_schema_name_then_dbo_name() {
        let registry = Registry::new();
        registry
            .register(
                make(
                    ProcedureId {
                        tenant: None,
                        database: None,
                        schema: "util".into(),
                        name: "Ping".into(),
                    },
                    "SELECT UTIL",
                ),
                false,
            )
            .unwrap();

        let ctx = LookupContext {
            tenant: None,
            database: Some("salesdb".into()),
        };
        let found = registry.lookup(&ctx, "salesdb.util.Ping").unwrap();
        assert_eq!(found.source, "SELECT UTIL");
    }

    #[test]
    fn unknown_procedure_is_not_found() {
        let registry = Registry::new();
        let ctx = LookupContext::default();
        let err = registry.lookup(&ctx, "dbo.Nope").unwrap_err();
        assert!(matches!(
            err,
            ServerError::Procedure(ProcedureError::NotFound(_))
        ));
    }

    #[test]
    fn re_registering_identical_content_keeps_compile_state() {
        let registry = Registry::new();
        let id = ProcedureId {
            tenant: None,
            database: Some("db".into()),
            schema: "dbo".into(),
            name: "P".into(),
        };
        registry.register(make(id.clone(), "SELECT 1"), false).unwrap();
        let first = registry.lookup_id(&id).unwrap();
        first.compile.try_enqueue(&first.content_hash);
        first.compile.mark_compiling();
        first.compile.mark_ready();

        registry.register(make(id.clone(), "SELECT 1"), false).unwrap();
        let again = registry.lookup_id(&id).unwrap();
        assert!(again.compile.is_ready_for(&again.content_hash));
    }

    #[test]
    fn re_registering_changed_content_invalidates_compile_state() {
        let registry = Registry::new();
        let id = ProcedureId {
            tenant: None,
            database: Some("db".into()),
            schema: "dbo".into(),
            name: "P".into(),
        };
        registry.register(make(id.clone(), "SELECT 1"), false).unwrap();
        let first = registry.lookup_id(&id).unwrap();
        first.compile.try_enqueue(&first.content_hash);
        first.compile.mark_compiling();
        first.compile.mark_ready();

        registry.register(make(id.clone(), "SELECT 2"), false).unwrap();
        let changed = registry.lookup_id(&id).unwrap();
        assert_eq!(changed.source, "SELECT 2");
    }

    #[test]
    fn procedures_for_includes_database_scoped_globals_and_tenant_overrides() {
        let registry = Registry::new();
        registry
            .register(
                make(
                    ProcedureId {
                        tenant: None,
                        database: None,
                        schema: "dbo".into(),
                        name: "Ping".into(),
                    },
                    "SELECT 1",
                ),
                false,
            )
            .unwrap();
        registry
            .register(
                make(
                    ProcedureId {
                        tenant: None,
                        database: Some("salesdb".into()),
                        schema: "dbo".into(),
                        name: "GetCustomer".into(),
                    },
                    "SELECT SHARED",
                ),
                false,
            )
            .unwrap();
        registry
            .register(
                make(
                    ProcedureId {
                        tenant: Some("acme".into()),
                        database: Some("salesdb".into()),
                        schema: "dbo".into(),
                        name: "GetCustomer".into(),
                    },
                    "SELECT ACME",
                ),
                true,
            )
            .unwrap();

        let visible = registry.procedures_for(Some("acme"), "salesdb");
        let names: Vec<&str> = visible.iter().map(|p| p.id.name.as_str()).collect();
        assert!(names.contains(&"Ping"));
        assert!(names.contains(&"GetCustomer"));
        assert_eq!(visible.len(), 3);

        let anon_visible = registry.procedures_for(None, "salesdb");
        assert_eq!(anon_visible.len(), 2);
    }
}
