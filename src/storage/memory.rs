//! In-memory storage backend.
//!
//! This is the sample backend named in the design notes: its
//! `query`/`exec` implementations are placeholders, not a SQL engine —
//! they do not parse or execute the SQL text at all. Do not treat their
//! behaviour as representative; the runtime assumes a correct storage
//! backend, and this one exists so the server can start up and exercise
//! transaction/temp-table bookkeeping without a real database attached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::config::Dialect;
use crate::error::{ServerError, ServerResult, StorageError};
use crate::storage::traits::{Storage, TenantAwareStorage, TxnHandle};
use crate::types::{ColumnMetadata, QueryResult, Value};

struct OpenTransaction {
    savepoints: Vec<String>,
}

/// Placeholder backend: real temp-table and transaction bookkeeping,
/// fake query/exec results.
pub struct MemoryStorage {
    temp_tables: DashMap<String, Vec<ColumnMetadata>>,
    transactions: Mutex<HashMap<String, OpenTransaction>>,
    next_descriptor: AtomicU64,
    tenant_databases: DashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            temp_tables: DashMap::new(),
            transactions: Mutex::new(HashMap::new()),
            next_descriptor: AtomicU64::new(1),
            tenant_databases: DashMap::new(),
        }
    }

    /// Used by tests/operators to make `db_for_tenant` resolve without a
    /// real tenant directory backing it.
    pub fn map_tenant_database(&self, tenant: &str, database: &str) {
        self.tenant_databases
            .insert(tenant.to_string(), database.to_string());
    }

    fn new_descriptor(&self) -> [u8; 8] {
        let n = self.next_descriptor.fetch_add(1, Ordering::AcqRel);
        n.to_be_bytes()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn query(&self, _sql: &str, _params: &[Value]) -> ServerResult<QueryResult> {
        Ok(QueryResult::default())
    }

    async fn query_row(&self, _sql: &str, _params: &[Value]) -> ServerResult<Option<QueryResult>> {
        Ok(None)
    }

    async fn exec(&self, _sql: &str, _params: &[Value]) -> ServerResult<u64> {
        Ok(0)
    }

    async fn begin(&self) -> ServerResult<TxnHandle> {
        let id = Uuid::new_v4().to_string();
        self.transactions
            .lock()
            .unwrap()
            .insert(id.clone(), OpenTransaction { savepoints: Vec::new() });
        Ok(TxnHandle::new(id, self.new_descriptor()))
    }

    async fn commit(&self, txn: &TxnHandle) -> ServerResult<()> {
        self.transactions
            .lock()
            .unwrap()
            .remove(&txn.id)
            .ok_or_else(|| ServerError::Storage(StorageError::Txn("unknown transaction".into())))?;
        Ok(())
    }

    async fn rollback(&self, txn: &TxnHandle) -> ServerResult<()> {
        self.transactions
            .lock()
            .unwrap()
            .remove(&txn.id)
            .ok_or_else(|| ServerError::Storage(StorageError::Txn("unknown transaction".into())))?;
        Ok(())
    }

    async fn savepoint(&self, txn: &TxnHandle, name: &str) -> ServerResult<()> {
        let mut txns = self.transactions.lock().unwrap();
        let open = txns
            .get_mut(&txn.id)
            .ok_or_else(|| ServerError::Storage(StorageError::Txn("unknown transaction".into())))?;
        open.savepoints.push(name.to_string());
        Ok(())
    }

    async fn rollback_to(&self, txn: &TxnHandle, name: &str) -> ServerResult<()> {
        let mut txns = self.transactions.lock().unwrap();
        let open = txns
            .get_mut(&txn.id)
            .ok_or_else(|| ServerError::Storage(StorageError::Txn("unknown transaction".into())))?;
        match open.savepoints.iter().position(|s| s == name) {
            Some(pos) => {
                open.savepoints.truncate(pos + 1);
                Ok(())
            }
            None => Err(ServerError::Storage(StorageError::Txn(format!(
                "unknown savepoint {name}"
            )))),
        }
    }

    async fn create_temp_table(&self, name: &str, columns: &[ColumnMetadata]) -> ServerResult<()> {
        self.temp_tables.insert(name.to_string(), columns.to_vec());
        Ok(())
    }

    async fn drop_temp_table(&self, name: &str) -> ServerResult<()> {
        self.temp_tables.remove(name);
        Ok(())
    }

    async fn temp_table_exists(&self, name: &str) -> ServerResult<bool> {
        Ok(self.temp_tables.contains_key(name))
    }

    fn dialect(&self) -> Dialect {
        Dialect::TSql
    }

    async fn close(&self) -> ServerResult<()> {
        Ok(())
    }
}

#[async_trait]
impl TenantAwareStorage for MemoryStorage {
    async fn db_for_tenant(&self, tenant: &str) -> ServerResult<String> {
        self.tenant_databases
            .get(tenant)
            .map(|entry| entry.clone())
            .ok_or_else(|| ServerError::Storage(StorageError::NotFound(format!(
                "no database mapped for tenant {tenant}"
            ))))
    }

    async fn query_for_tenant(
        &self,
        _tenant: &str,
        _database: &str,
        _sql: &str,
        _params: &[Value],
    ) -> ServerResult<QueryResult> {
        Ok(QueryResult::default())
    }

    async fn exec_for_tenant(
        &self,
        _tenant: &str,
        _database: &str,
        _sql: &str,
        _params: &[Value],
    ) -> ServerResult<u64> {
        Ok(0)
    }

    async fn begin_for_tenant(&self, _tenant: &str, _database: &str) -> ServerResult<TxnHandle> {
        self.begin().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transaction_lifecycle_tracks_savepoints() {
        let storage = MemoryStorage::new();
        let txn = storage.begin().await.unwrap();
        storage.savepoint(&txn, "sp1").await.unwrap();
        storage.savepoint(&txn, "sp2").await.unwrap();
        storage.rollback_to(&txn, "sp1").await.unwrap();
        storage.commit(&txn).await.unwrap();
        // Committing twice fails: the handle was removed.
        assert!(storage.commit(&txn).await.is_err());
    }

    #[tokio::test]
    async fn temp_table_bookkeeping_round_trips() {
        let storage = MemoryStorage::new();
        assert!(!storage.temp_table_exists("#scratch").await.unwrap());
        storage.create_temp_table("#scratch", &[]).await.unwrap();
        assert!(storage.temp_table_exists("#scratch").await.unwrap());
        storage.drop_temp_table("#scratch").await.unwrap();
        assert!(!storage.temp_table_exists("#scratch").await.unwrap());
    }

    #[tokio::test]
    async fn tenant_without_mapping_is_not_found() {
        let storage = MemoryStorage::new();
        assert!(storage.db_for_tenant("acme").await.is_err());
        storage.map_tenant_database("acme", "salesdb");
        assert_eq!(storage.db_for_tenant("acme").await.unwrap(), "salesdb");
    }
}
