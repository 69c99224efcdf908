//! SQL-Server-backed storage adapter, driving a real engine underneath
//! the core via `tiberius` the same way the TDS front drives clients —
//! just from the other side of the wire.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tiberius::{AuthMethod, Client, Config as TiberiusConfig};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::config::StorageConfig;
use crate::config::Dialect;
use crate::error::{ServerError, ServerResult, StorageError};
use crate::storage::traits::{Storage, TxnHandle};
use crate::types::{ColumnMetadata, DataType, QueryResult, Row, Value};

type TiberiusClient = Client<Compat<TcpStream>>;

pub struct SqlServerStorage {
    client: tokio::sync::Mutex<TiberiusClient>,
    next_descriptor: AtomicU64,
}

impl SqlServerStorage {
    pub async fn connect(config: &StorageConfig) -> ServerResult<Self> {
        let mut tiberius_config = TiberiusConfig::new();
        tiberius_config.host(&config.host);
        tiberius_config.port(config.port);
        tiberius_config.database(&config.database);
        tiberius_config.authentication(AuthMethod::sql_server(&config.username, &config.password));
        tiberius_config.trust_cert();

        let tcp = TcpStream::connect(tiberius_config.get_addr())
            .await
            .map_err(|e| ServerError::Storage(StorageError::Connect(e.to_string())))?;
        tcp.set_nodelay(true)
            .map_err(|e| ServerError::Storage(StorageError::Connect(e.to_string())))?;

        let client = Client::connect(tiberius_config, tcp.compat_write())
            .await
            .map_err(|e| ServerError::Storage(StorageError::Connect(e.to_string())))?;

        Ok(Self {
            client: tokio::sync::Mutex::new(client),
            next_descriptor: AtomicU64::new(1),
        })
    }

    fn new_descriptor(&self) -> [u8; 8] {
        self.next_descriptor.fetch_add(1, Ordering::AcqRel).to_be_bytes()
    }

    fn to_sql_params(params: &[Value]) -> Vec<Box<dyn tiberius::ToSql>> {
        params
            .iter()
            .map(|v| -> Box<dyn tiberius::ToSql> {
                match v {
                    Value::Null => Box::new(Option::<i32>::None),
                    Value::Bit(b) => Box::new(*b),
                    Value::TinyInt(n) => Box::new(*n as i16),
                    Value::SmallInt(n) => Box::new(*n),
                    Value::Int(n) => Box::new(*n),
                    Value::BigInt(n) => Box::new(*n),
                    Value::Float(n) => Box::new(*n),
                    Value::Double(n) => Box::new(*n),
                    Value::Decimal { unscaled, .. } => Box::new(*unscaled as i64),
                    Value::Text(s) => Box::new(s.clone()),
                    Value::Binary(b) => Box::new(b.clone()),
                    Value::Guid(g) => Box::new(uuid::Uuid::from_bytes(*g)),
                    Value::DateTime(s) | Value::Date(s) => Box::new(s.clone()),
                }
            })
            .collect()
    }
}

#[async_trait]
impl Storage for SqlServerStorage {
    async fn query(&self, sql: &str, params: &[Value]) -> ServerResult<QueryResult> {
        let owned_params = Self::to_sql_params(params);
        let param_refs: Vec<&dyn tiberius::ToSql> =
            owned_params.iter().map(|p| p.as_ref()).collect();

        let mut client = self.client.lock().await;
        let stream = client
            .query(sql, &param_refs)
            .await
            .map_err(|e| ServerError::Storage(StorageError::Query(e.to_string())))?;

        let rows: Vec<tiberius::Row> = stream
            .into_first_result()
            .await
            .map_err(|e| ServerError::Storage(StorageError::Query(e.to_string())))?;

        Ok(convert_rows(rows))
    }

    async fn query_row(&self, sql: &str, params: &[Value]) -> ServerResult<Option<QueryResult>> {
        let result = self.query(sql, params).await?;
        if result.rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(QueryResult {
                columns: result.columns,
                rows: vec![result.rows[0].clone()],
                affected_rows: result.affected_rows,
            }))
        }
    }

    async fn exec(&self, sql: &str, params: &[Value]) -> ServerResult<u64> {
        let owned_params = Self::to_sql_params(params);
        let param_refs: Vec<&dyn tiberius::ToSql> =
            owned_params.iter().map(|p| p.as_ref()).collect();

        let mut client = self.client.lock().await;
        let result = client
            .execute(sql, &param_refs)
            .await
            .map_err(|e| ServerError::Storage(StorageError::Exec(e.to_string())))?;

        Ok(result.rows_affected().iter().sum())
    }

    async fn begin(&self) -> ServerResult<TxnHandle> {
        self.exec("BEGIN TRANSACTION", &[]).await?;
        Ok(TxnHandle::new(uuid::Uuid::new_v4().to_string(), self.new_descriptor()))
    }

    async fn commit(&self, _txn: &TxnHandle) -> ServerResult<()> {
        self.exec("COMMIT TRANSACTION", &[]).await.map(|_| ())
    }

    async fn rollback(&self, _txn: &TxnHandle) -> ServerResult<()> {
        self.exec("ROLLBACK TRANSACTION", &[]).await.map(|_| ())
    }

    async fn savepoint(&self, _txn: &TxnHandle, name: &str) -> ServerResult<()> {
        self.exec(&format!("SAVE TRANSACTION {name}"), &[]).await.map(|_| ())
    }

    async fn rollback_to(&self, _txn: &TxnHandle, name: &str) -> ServerResult<()> {
        self.exec(&format!("ROLLBACK TRANSACTION {name}"), &[]).await.map(|_| ())
    }

    async fn create_temp_table(&self, name: &str, columns: &[ColumnMetadata]) -> ServerResult<()> {
        let cols = columns
            .iter()
            .map(|c| format!("{} {}", c.name, sql_type_name(c.data_type)))
            .collect::<Vec<_>>()
            .join(", ");
        self.exec(&format!("CREATE TABLE {name} ({cols})"), &[]).await.map(|_| ())
    }

    async fn drop_temp_table(&self, name: &str) -> ServerResult<()> {
        self.exec(&format!("DROP TABLE IF EXISTS {name}"), &[]).await.map(|_| ())
    }

    async fn temp_table_exists(&self, name: &str) -> ServerResult<bool> {
        let result = self
            .query(
                "SELECT OBJECT_ID(@P1, 'U') AS obj_id",
                &[Value::Text(name.to_string())],
            )
            .await?;
        Ok(result
            .rows
            .first()
            .and_then(|row| row.get(0))
            .map(|v| !v.is_null())
            .unwrap_or(false))
    }

    fn dialect(&self) -> Dialect {
        Dialect::TSql
    }

    async fn close(&self) -> ServerResult<()> {
        Ok(())
    }
}

fn sql_type_name(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Null | DataType::NVarChar => "NVARCHAR(MAX)",
        DataType::Bit => "BIT",
        DataType::TinyInt => "TINYINT",
        DataType::SmallInt => "SMALLINT",
        DataType::Int => "INT",
        DataType::BigInt => "BIGINT",
        DataType::Float => "REAL",
        DataType::Double => "FLOAT",
        DataType::Decimal => "DECIMAL(38,10)",
        DataType::VarBinary => "VARBINARY(MAX)",
        DataType::UniqueIdentifier => "UNIQUEIDENTIFIER",
        DataType::DateTime2 => "DATETIME2",
        DataType::Date => "DATE",
    }
}

fn convert_rows(rows: Vec<tiberius::Row>) -> QueryResult {
    let columns: Vec<ColumnMetadata> = rows
        .first()
        .map(|row| {
            row.columns()
                .iter()
                .map(|c| ColumnMetadata {
                    name: c.name().to_string(),
                    data_type: DataType::NVarChar,
                    nullable: true,
                })
                .collect()
        })
        .unwrap_or_default();

    let converted_rows = rows
        .into_iter()
        .map(|row| {
            let values = (0..row.len())
                .map(|i| {
                    row.try_get::<&str, _>(i)
                        .ok()
                        .flatten()
                        .map(|s| Value::Text(s.to_string()))
                        .or_else(|| row.try_get::<i32, _>(i).ok().flatten().map(Value::Int))
                        .or_else(|| row.try_get::<i64, _>(i).ok().flatten().map(Value::BigInt))
                        .or_else(|| row.try_get::<f64, _>(i).ok().flatten().map(Value::Double))
                        .or_else(|| row.try_get::<bool, _>(i).ok().flatten().map(Value::Bit))
                        .unwrap_or(Value::Null)
                })
                .collect();
            Row::new(values)
        })
        .collect::<Vec<_>>();

    QueryResult {
        columns,
        affected_rows: Some(converted_rows.len() as u64),
        rows: converted_rows,
    }
}
