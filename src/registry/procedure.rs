//! The `Procedure` data model (§3): immutable after load except for
//! counters, owned by the Loader and referenced by the Registry and by
//! active calls for its lifetime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::compile::status::CompileCell;
use crate::config::Dialect;
use crate::types::Parameter;

/// Fully-qualified identity of a procedure: tenant and database are
/// optional (empty tenant/database mean global or database-default),
/// schema and name are always present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcedureId {
    pub tenant: Option<String>,
    pub database: Option<String>,
    pub schema: String,
    pub name: String,
}

impl ProcedureId {
    pub fn is_global(&self) -> bool {
        self.database.is_none()
    }

    /// Lowercased `db.schema.name` used as the qualified-map key.
    pub fn qualified_key(&self) -> String {
        let db = self.database.as_deref().unwrap_or("");
        format!("{}.{}.{}", db, self.schema, self.name).to_lowercase()
    }

    /// Lowercased `schema.name` used as the globals-map key.
    pub fn global_key(&self) -> String {
        format!("{}.{}", self.schema, self.name).to_lowercase()
    }
}

/// Hash the procedure source and return its 16-hex-char content
/// identifier (§3, §8 invariant d). Uses the first 64 bits of the
/// SHA-256 digest, hex-encoded.
pub fn content_hash(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    let digest = hasher.finalize();
    digest[..8]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()
}

/// A loaded stored procedure or function.
#[derive(Debug)]
pub struct Procedure {
    pub id: ProcedureId,
    pub dialect: Dialect,
    pub source: String,
    pub content_hash: String,
    pub parameters: Vec<Parameter>,
    pub annotations: HashMap<String, String>,

    exec_count: AtomicU64,
    cumulative_exec_ns: AtomicU64,
    last_exec_at: RwLock<Option<Instant>>,
    pub compile: CompileCell,
}

impl Procedure {
    pub fn new(
        id: ProcedureId,
        dialect: Dialect,
        source: String,
        parameters: Vec<Parameter>,
        annotations: HashMap<String, String>,
    ) -> Self {
        let content_hash = content_hash(&source);
        Self {
            id,
            dialect,
            source,
            content_hash,
            parameters,
            annotations,
            exec_count: AtomicU64::new(0),
            cumulative_exec_ns: AtomicU64::new(0),
            last_exec_at: RwLock::new(None),
            compile: CompileCell::new(),
        }
    }

    pub fn exec_count(&self) -> u64 {
        self.exec_count.load(Ordering::Acquire)
    }

    pub fn cumulative_exec_ns(&self) -> u64 {
        self.cumulative_exec_ns.load(Ordering::Acquire)
    }

    pub fn last_exec_at(&self) -> Option<Instant> {
        *self.last_exec_at.read().unwrap()
    }

    /// Record one completed execution. Returns the post-increment
    /// execution count, so callers can detect a threshold crossing
    /// without a second atomic read (§4.3 step 6).
    pub fn record_execution(&self, elapsed_ns: u64) -> u64 {
        let count = self.exec_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.cumulative_exec_ns.fetch_add(elapsed_ns, Ordering::AcqRel);
        *self.last_exec_at.write().unwrap() = Some(Instant::now());
        count
    }

    pub fn qualified_name(&self) -> String {
        match &self.id.database {
            Some(db) => format!("{}.{}.{}", db, self.id.schema, self.id.name),
            None => format!("{}.{}", self.id.schema, self.id.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_bytes_hash_identically() {
        assert_eq!(content_hash("SELECT 1"), content_hash("SELECT 1"));
    }

    #[test]
    fn one_byte_perturbation_changes_the_hash() {
        assert_ne!(content_hash("SELECT 1"), content_hash("SELECT 2"));
    }

    #[test]
    fn content_hash_is_sixteen_hex_chars() {
        let h = content_hash("CREATE PROCEDURE dbo.Foo AS SELECT 1");
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn qualified_key_is_lowercased() {
        let id = ProcedureId {
            tenant: None,
            database: Some("SalesDB".to_string()),
            schema: "Dbo".to_string(),
            name: "GetCustomer".to_string(),
        };
        assert_eq!(id.qualified_key(), "salesdb.dbo.getcustomer");
        assert_eq!(id.global_key(), "dbo.getcustomer");
    }

    #[test]
    fn record_execution_increments_and_returns_new_count() {
        let proc = Procedure::new(
            ProcedureId {
                tenant: None,
                database: Some("db".into()),
                schema: "dbo".into(),
                name: "P".into(),
            },
            Dialect::TSql,
            "SELECT 1".to_string(),
            vec![],
            HashMap::new(),
        );
        assert_eq!(proc.record_execution(1000), 1);
        assert_eq!(proc.record_execution(2000), 2);
        assert_eq!(proc.cumulative_exec_ns(), 3000);
        assert!(proc.last_exec_at().is_some());
    }
}
