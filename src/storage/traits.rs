//! The `Storage`/`TenantAwareStorage` interface (§6 "External
//! Interfaces"): the external collaborator the runtime and compile
//! pipeline drive every query through. The core assumes a correct
//! implementation of this trait; it never reproduces storage semantics
//! itself.

use async_trait::async_trait;

use crate::config::Dialect;
use crate::error::ServerResult;
use crate::types::{ColumnMetadata, QueryResult, Value};

/// Handle to an open transaction, carrying the descriptor bytes the TDS
/// front echoes back to the client in ENVCHANGE tokens (§3 Transaction).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnHandle {
    pub id: String,
    pub descriptor: [u8; 8],
}

impl TxnHandle {
    pub fn new(id: impl Into<String>, descriptor: [u8; 8]) -> Self {
        Self {
            id: id.into(),
            descriptor,
        }
    }
}

/// Storage backend interface (§6): `{Query, QueryRow, Exec,
/// Begin/Commit/Rollback/Savepoint/RollbackTo,
/// CreateTempTable/DropTempTable/TempTableExists, Dialect, Close}`.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn query(&self, sql: &str, params: &[Value]) -> ServerResult<QueryResult>;

    async fn query_row(&self, sql: &str, params: &[Value]) -> ServerResult<Option<QueryResult>>;

    async fn exec(&self, sql: &str, params: &[Value]) -> ServerResult<u64>;

    async fn begin(&self) -> ServerResult<TxnHandle>;

    async fn commit(&self, txn: &TxnHandle) -> ServerResult<()>;

    async fn rollback(&self, txn: &TxnHandle) -> ServerResult<()>;

    async fn savepoint(&self, txn: &TxnHandle, name: &str) -> ServerResult<()>;

    async fn rollback_to(&self, txn: &TxnHandle, name: &str) -> ServerResult<()>;

    async fn create_temp_table(&self, name: &str, columns: &[ColumnMetadata]) -> ServerResult<()>;

    async fn drop_temp_table(&self, name: &str) -> ServerResult<()>;

    async fn temp_table_exists(&self, name: &str) -> ServerResult<bool>;

    fn dialect(&self) -> Dialect;

    async fn close(&self) -> ServerResult<()>;
}

/// Tenant-aware extension (§6): "additionally resolves a (tenant,
/// database) pair to a distinct connection."
#[async_trait]
pub trait TenantAwareStorage: Storage {
    async fn db_for_tenant(&self, tenant: &str) -> ServerResult<String>;

    async fn query_for_tenant(
        &self,
        tenant: &str,
        database: &str,
        sql: &str,
        params: &[Value],
    ) -> ServerResult<QueryResult>;

    async fn exec_for_tenant(
        &self,
        tenant: &str,
        database: &str,
        sql: &str,
        params: &[Value],
    ) -> ServerResult<u64>;

    async fn begin_for_tenant(&self, tenant: &str, database: &str) -> ServerResult<TxnHandle>;
}
