//! Hierarchical directory loader (§4.2).
//!
//! Walks a root directory laid out as:
//!
//! ```text
//! <root>/_global/<schema>/<name>.sql
//! <root>/<database>/<schema>/<name>.sql
//! <root>/_tenant/<tenant>/<database>/<schema>/<name>.sql
//! ```
//!
//! and turns each `.sql` file into a [`Procedure`], best-effort parsing
//! the name and parameter list out of the source text the way the
//! teacher's parser collaborators do — this is identity extraction, not
//! a T-SQL parser (§6: the real AST/parser is an external collaborator).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use walkdir::WalkDir;

use crate::config::Dialect;
use crate::error::{ProcedureError, ServerError, ServerResult};
use crate::registry::procedure::{Procedure, ProcedureId};
use crate::types::{Parameter, ParameterDirection};

/// Whether to fail loading when the schema in source text differs from
/// the enclosing directory, or only warn (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaValidationMode {
    Strict,
    WarnOnly,
}

pub struct Loader {
    pub schema_validation: SchemaValidationMode,
    create_re: Regex,
    param_re: Regex,
}

/// One loaded file, ready for registration.
pub struct LoadedProcedure {
    pub procedure: Procedure,
    pub is_tenant_override: bool,
}

impl Loader {
    pub fn new(schema_validation: SchemaValidationMode) -> Self {
        Self {
            schema_validation,
            create_re: Regex::new(
                r"(?i)create\s+(?:proc|procedure|function)\s+(?:\[?(\w+)\]?\.)?\[?(\w+)\]?",
            )
            .expect("valid regex"),
            param_re: Regex::new(
                r"(?i)^\s*@(\w+)\s+([\w\(\),]+)\s*(?:=\s*([^,\n]+?))?\s*(OUT(?:PUT)?)?\s*,?\s*$",
            )
            .expect("valid regex"),
        }
    }

    /// Walk `root` and load every `.sql` file found under the layout
    /// described in §4.2.
    pub fn load_tree(&self, root: &str) -> ServerResult<Vec<LoadedProcedure>> {
        let root_path = Path::new(root);
        let mut loaded = Vec::new();

        for entry in WalkDir::new(root_path).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_sql = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("sql"))
                .unwrap_or(false);
            if !is_sql {
                continue;
            }

            let relative = path
                .strip_prefix(root_path)
                .unwrap_or(path)
                .to_path_buf();

            let placement = classify_path(&relative).ok_or_else(|| {
                ServerError::Procedure(ProcedureError::Load {
                    path: path.display().to_string(),
                    reason: "file is not under _global/, _tenant/, or <database>/ layout".into(),
                })
            })?;

            let source = std::fs::read_to_string(path).map_err(|e| {
                ServerError::Procedure(ProcedureError::Load {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            })?;

            let proc = self.parse_file(&source, &placement, path)?;
            loaded.push(LoadedProcedure {
                procedure: proc,
                is_tenant_override: placement.tenant.is_some(),
            });
        }

        Ok(loaded)
    }

    fn parse_file(
        &self,
        source: &str,
        placement: &Placement,
        path: &Path,
    ) -> ServerResult<Procedure> {
        let caps = self.create_re.captures(source).ok_or_else(|| {
            ServerError::Procedure(ProcedureError::Parse(format!(
                "no CREATE PROCEDURE/FUNCTION header found in {}",
                path.display()
            )))
        })?;

        let declared_schema = caps.get(1).map(|m| m.as_str().to_string());
        let name = caps
            .get(2)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                ServerError::Procedure(ProcedureError::Parse(format!(
                    "could not extract procedure name from {}",
                    path.display()
                )))
            })?;

        let schema = declared_schema.clone().unwrap_or_else(|| placement.schema.clone());

        if let Some(declared) = &declared_schema {
            if !declared.eq_ignore_ascii_case(&placement.schema) {
                let msg = format!(
                    "schema '{}' declared in {} does not match directory schema '{}'",
                    declared,
                    path.display(),
                    placement.schema
                );
                match self.schema_validation {
                    SchemaValidationMode::Strict => {
                        return Err(ServerError::Procedure(ProcedureError::Parse(msg)))
                    }
                    SchemaValidationMode::WarnOnly => {
                        log::warn!("{msg}");
                    }
                }
            }
        }

        let params = self.parse_parameters(source, &caps)?;

        let id = ProcedureId {
            tenant: placement.tenant.clone(),
            database: placement.database.clone(),
            schema,
            name,
        };

        Ok(Procedure::new(
            id,
            Dialect::TSql,
            source.to_string(),
            params,
            HashMap::new(),
        ))
    }

    fn parse_parameters(
        &self,
        source: &str,
        caps: &regex::Captures,
    ) -> ServerResult<Vec<Parameter>> {
        let header_end = caps.get(0).map(|m| m.end()).unwrap_or(0);
        let as_pos = source[header_end..]
            .to_lowercase()
            .find("\nas")
            .or_else(|| source[header_end..].to_lowercase().find(" as"))
            .map(|p| header_end + p)
            .unwrap_or(source.len());

        let param_region = &source[header_end..as_pos];
        let mut params = Vec::new();
        let mut ordinal = 0usize;

        for line in param_region.lines() {
            let line = line.trim();
            if !line.starts_with('@') {
                continue;
            }
            if let Some(caps) = self.param_re.captures(line) {
                let name = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
                let sql_type = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
                let default_value = caps.get(3).map(|m| m.as_str().trim().to_string());
                let is_output = caps.get(4).is_some();

                params.push(Parameter {
                    name,
                    sql_type,
                    target_type: None,
                    direction: if is_output {
                        ParameterDirection::InOut
                    } else {
                        ParameterDirection::In
                    },
                    has_default: default_value.is_some(),
                    default_value,
                    ordinal,
                });
                ordinal += 1;
            }
        }

        Ok(params)
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new(SchemaValidationMode::WarnOnly)
    }
}

struct Placement {
    tenant: Option<String>,
    database: Option<String>,
    schema: String,
}

/// Classify a path relative to the registry root into
/// (tenant, database, schema) per the §4.2 layout.
fn classify_path(relative: &PathBuf) -> Option<Placement> {
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();

    match parts.as_slice() {
        [first, schema, _name] if first == "_global" => Some(Placement {
            tenant: None,
            database: None,
            schema: schema.clone(),
        }),
        [first, tenant, database, schema, _name] if first == "_tenant" => Some(Placement {
            tenant: Some(tenant.clone()),
            database: Some(database.clone()),
            schema: schema.clone(),
        }),
        [database, schema, _name] => Some(Placement {
            tenant: None,
            database: Some(database.clone()),
            schema: schema.clone(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_file(dir: &Path, relative: &str, contents: &str) {
        let path = dir.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn loads_global_database_and_tenant_procedures() {
        let dir = tempdir().unwrap();
        write_file(
            dir.path(),
            "_global/dbo/Ping.sql",
            "CREATE PROCEDURE dbo.Ping AS SELECT 1",
        );
        write_file(
            dir.path(),
            "salesdb/dbo/GetCustomer.sql",
            "CREATE PROCEDURE dbo.GetCustomer\n@Id INT\nAS\nSELECT 'D'",
        );
        write_file(
            dir.path(),
            "_tenant/acme/salesdb/dbo/GetCustomer.sql",
            "CREATE PROCEDURE dbo.GetCustomer\n@Id INT\nAS\nSELECT 'A'",
        );

        let loader = Loader::default();
        let loaded = loader.load_tree(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(loaded.len(), 3);

        let global = loaded
            .iter()
            .find(|l| l.procedure.id.name == "Ping")
            .unwrap();
        assert!(global.procedure.id.is_global());
        assert!(!global.is_tenant_override);

        let tenant = loaded.iter().find(|l| l.is_tenant_override).unwrap();
        assert_eq!(tenant.procedure.id.tenant.as_deref(), Some("acme"));
        assert_eq!(tenant.procedure.id.database.as_deref(), Some("salesdb"));
    }

    #[test]
    fn extracts_parameters_with_default_and_output() {
        let dir = tempdir().unwrap();
        write_file(
            dir.path(),
            "salesdb/dbo/UpdateStock.sql",
            "CREATE PROCEDURE dbo.UpdateStock\n@Sku VARCHAR(20)\n@Qty INT = 0\n@NewTotal INT OUTPUT\nAS\nBEGIN\nSELECT 1\nEND",
        );
        let loader = Loader::default();
        let loaded = loader.load_tree(dir.path().to_str().unwrap()).unwrap();
        let proc = &loaded[0].procedure;
        assert_eq!(proc.parameters.len(), 3);
        assert_eq!(proc.parameters[0].name, "Sku");
        assert!(!proc.parameters[0].has_default);
        assert_eq!(proc.parameters[1].name, "Qty");
        assert!(proc.parameters[1].has_default);
        assert_eq!(proc.parameters[2].direction, ParameterDirection::InOut);
    }

    #[test]
    fn rejects_files_outside_the_known_layout() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), "loose.sql", "CREATE PROCEDURE dbo.Loose AS SELECT 1");
        let loader = Loader::default();
        let result = loader.load_tree(dir.path().to_str().unwrap());
        assert!(result.is_err());
    }
}
