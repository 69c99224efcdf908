//! System-catalog provider (§6 "External Interfaces"): intercepts
//! queries whose normalised text references `sys.*` or
//! `information_schema.*` and answers them from the Registry and the
//! storage backend's own schema metadata, instead of forwarding them
//! to storage.

use std::sync::Arc;

use log::trace;

use crate::registry::Registry;
use crate::storage::Storage;
use crate::types::{ColumnMetadata, DataType, QueryResult, Row, Value};

/// Recognises the handful of catalog views this host fabricates and
/// builds their fixed-shape result sets. Holds only `Arc`s handed in at
/// start-up — no interior mutability, no per-query state.
pub struct CatalogProvider {
    registry: Arc<Registry>,
    storage: Arc<dyn Storage>,
}

/// Which catalog object a normalised statement is asking about, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CatalogTarget {
    SysObjects,
    SysProcedures,
    InformationSchemaRoutines,
    InformationSchemaTables,
}

impl CatalogProvider {
    pub fn new(registry: Arc<Registry>, storage: Arc<dyn Storage>) -> Self {
        Self { registry, storage }
    }

    /// Returns `Some(target)` if `sql`'s normalised text references a
    /// catalog view this provider intercepts; `None` means the
    /// statement should be forwarded to storage/the interpreter as
    /// usual.
    fn classify(sql: &str) -> Option<CatalogTarget> {
        let normalised = sql.to_ascii_lowercase();
        if normalised.contains("information_schema.routines") {
            Some(CatalogTarget::InformationSchemaRoutines)
        } else if normalised.contains("information_schema.tables") {
            Some(CatalogTarget::InformationSchemaTables)
        } else if normalised.contains("sys.procedures") {
            Some(CatalogTarget::SysProcedures)
        } else if normalised.contains("sys.objects") {
            Some(CatalogTarget::SysObjects)
        } else {
            None
        }
    }

    pub fn intercepts(sql: &str) -> bool {
        Self::classify(sql).is_some()
    }

    /// Answer an intercepted catalog query for the given `(tenant,
    /// database)` scope. Returns `None` if `sql` is not a catalog
    /// reference this provider recognises (callers should fall back to
    /// normal execution in that case).
    pub async fn query(
        &self,
        sql: &str,
        tenant: Option<&str>,
        database: &str,
    ) -> Option<QueryResult> {
        let target = Self::classify(sql)?;
        trace!(target: "catalog", "intercepting {target:?} for db={database}, tenant={tenant:?}");
        let result = match target {
            CatalogTarget::SysObjects | CatalogTarget::InformationSchemaTables => {
                self.tables_result(database).await
            }
            CatalogTarget::SysProcedures | CatalogTarget::InformationSchemaRoutines => {
                self.procedures_result(tenant, database)
            }
        };
        Some(result)
    }

    fn procedures_result(&self, tenant: Option<&str>, database: &str) -> QueryResult {
        let columns = vec![
            ColumnMetadata {
                name: "schema_name".to_string(),
                data_type: DataType::NVarChar,
                nullable: false,
            },
            ColumnMetadata {
                name: "name".to_string(),
                data_type: DataType::NVarChar,
                nullable: false,
            },
            ColumnMetadata {
                name: "type".to_string(),
                data_type: DataType::NVarChar,
                nullable: false,
            },
            ColumnMetadata {
                name: "create_date".to_string(),
                data_type: DataType::DateTime2,
                nullable: true,
            },
        ];

        let rows = self
            .registry
            .procedures_for(tenant, database)
            .into_iter()
            .map(|procedure| {
                Row::new(vec![
                    Value::Text(procedure.id.schema.clone()),
                    Value::Text(procedure.id.name.clone()),
                    Value::Text("P".to_string()),
                    Value::Null,
                ])
            })
            .collect();

        QueryResult {
            columns,
            rows,
            affected_rows: None,
        }
    }

    async fn tables_result(&self, database: &str) -> QueryResult {
        let columns = vec![
            ColumnMetadata {
                name: "table_catalog".to_string(),
                data_type: DataType::NVarChar,
                nullable: false,
            },
            ColumnMetadata {
                name: "table_schema".to_string(),
                data_type: DataType::NVarChar,
                nullable: false,
            },
            ColumnMetadata {
                name: "table_name".to_string(),
                data_type: DataType::NVarChar,
                nullable: false,
            },
        ];

        // The storage backend is the authority on what tables actually
        // exist; this provider only reshapes its answer into catalog
        // form. Backends that don't expose a schema listing (e.g. the
        // in-memory test double) answer with an empty set rather than
        // an error.
        let sql = "SELECT table_schema, table_name FROM information_schema.tables";
        let rows = match self.storage.query(sql, &[]).await {
            Ok(result) => result
                .rows
                .into_iter()
                .map(|row| {
                    let schema = row.get(0).cloned().unwrap_or(Value::Text("dbo".to_string()));
                    let name = row.get(1).cloned().unwrap_or(Value::Null);
                    Row::new(vec![Value::Text(database.to_string()), schema, name])
                })
                .collect(),
            Err(_) => Vec::new(),
        };

        QueryResult {
            columns,
            rows,
            affected_rows: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_sys_procedures_case_insensitively() {
        assert_eq!(
            CatalogProvider::classify("SELECT * FROM Sys.Procedures"),
            Some(CatalogTarget::SysProcedures)
        );
    }

    #[test]
    fn classifies_information_schema_routines() {
        assert_eq!(
            CatalogProvider::classify("select name from INFORMATION_SCHEMA.ROUTINES"),
            Some(CatalogTarget::InformationSchemaRoutines)
        );
    }

    #[test]
    fn non_catalog_statement_is_not_intercepted() {
        assert_eq!(CatalogProvider::classify("SELECT * FROM Customers"), None);
        assert!(!CatalogProvider::intercepts("SELECT 1"));
    }

    #[test]
    fn sys_objects_is_intercepted() {
        assert!(CatalogProvider::intercepts("select * from sys.objects where type = 'U'"));
    }
}
