//! Error taxonomy for the procedure host (§7).
//!
//! Mirrors the teacher's split of one `thiserror` enum per subsystem
//! composed into a top-level error via `#[from]`, but follows the kinds,
//! severities, and numeric codes the specification names.

use std::collections::HashMap;
use thiserror::Error;

/// Severity of a [`ServerError`], used to decide what happens to the
/// owning session after the error is surfaced to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
    Critical,
    Fatal,
}

/// Top-level error type for the procedure host.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error(transparent)]
    Procedure(#[from] ProcedureError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

/// Errors raised while decoding or encoding TDS wire data (C1).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid packet framing: {0}")]
    InvalidFraming(String),

    #[error("packet too short: need {need} bytes, got {got}")]
    PacketTooShort { need: usize, got: usize },

    #[error("unsupported TDS version: {0:#x}")]
    UnsupportedVersion(u32),

    #[error("malformed PRELOGIN option: {0}")]
    BadPrelogin(String),

    #[error("malformed LOGIN7 packet: {0}")]
    BadLogin7(String),

    #[error("malformed RPC request: {0}")]
    BadRpcRequest(String),

    #[error("unsupported TDS data type: {0:#x}")]
    UnsupportedDataType(u8),

    #[error("connection closed unexpectedly")]
    ConnectionClosed,
}

/// Errors raised by the registry/resolver (C2).
#[derive(Debug, Error)]
pub enum ProcedureError {
    #[error("procedure not found: {0}")]
    NotFound(String),

    #[error("procedure already registered with identical content: {0}")]
    AlreadyExists(String),

    #[error("failed to parse procedure source: {0}")]
    Parse(String),

    #[error("failed to load procedure file {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("invalid parameter for {proc}: {reason}")]
    InvalidParam { proc: String, reason: String },

    #[error("missing required parameter {name} for {proc}")]
    MissingParam { proc: String, name: String },
}

/// Errors raised by the execution runtime (C3).
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("execution failed: {0}")]
    Failed(String),

    #[error("execution timed out")]
    Timeout,

    #[error("execution cancelled")]
    Cancelled,

    #[error("nesting limit exceeded: depth {depth} > max {max}")]
    NestingLimit { depth: u32, max: u32 },

    #[error("concurrency limit reached")]
    Concurrency,

    #[error("SQL execution error: {0}")]
    Sql(String),

    #[error("invalid execution state: {0}")]
    InvalidState(String),

    #[error("COMMIT TRANSACTION issued with no active transaction")]
    CommitWithoutTransaction,

    #[error("ROLLBACK TRANSACTION issued with no active transaction")]
    RollbackWithoutTransaction,
}

/// Errors raised by storage backends (§6 Storage backend interface).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to storage backend: {0}")]
    Connect(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("transaction error: {0}")]
    Txn(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    Constraint(String),
}

/// Errors raised by the compile/promote pipeline (C4).
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("compilation is disabled")]
    Disabled,

    #[error("compile queue is full")]
    QueueFull,

    #[error("transpilation failed: {0}")]
    Transpile(String),

    #[error("compilation failed: {0}")]
    Compile(String),

    #[error("failed to load compiled artifact: {0}")]
    Load(String),

    #[error("procedure has no compiled artifact")]
    NotCompiled,
}

/// Structured context carried alongside a [`ServerError`] for logging and
/// for the TDS ERROR token's fields (§7).
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub operation: String,
    pub fields: HashMap<String, String>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

impl ServerError {
    /// Severity used to decide whether the owning session survives.
    pub fn severity(&self) -> Severity {
        match self {
            ServerError::Handshake(_) | ServerError::Auth(_) | ServerError::Tls(_) => {
                Severity::Critical
            }
            ServerError::Protocol(ProtocolError::ConnectionClosed)
            | ServerError::Protocol(ProtocolError::InvalidFraming(_)) => Severity::Fatal,
            ServerError::Exec(ExecError::Cancelled) | ServerError::Exec(ExecError::Timeout) => {
                Severity::Warning
            }
            ServerError::Internal(_) => Severity::Fatal,
            _ => Severity::Error,
        }
    }

    /// Best-matching SQL Server error number for the TDS ERROR token,
    /// per §7's propagation policy table.
    pub fn sql_error_number(&self) -> i32 {
        match self {
            ServerError::Procedure(ProcedureError::Parse(_)) => 102,
            ServerError::Procedure(ProcedureError::NotFound(_)) => 2812,
            ServerError::Procedure(ProcedureError::AlreadyExists(_)) => 2714,
            ServerError::Procedure(ProcedureError::InvalidParam { .. }) => 8144,
            ServerError::Procedure(ProcedureError::MissingParam { .. }) => 201,
            ServerError::Exec(ExecError::Timeout) => -2,
            ServerError::Exec(ExecError::Sql(_)) => 208,
            ServerError::Exec(ExecError::CommitWithoutTransaction) => 3902,
            ServerError::Exec(ExecError::RollbackWithoutTransaction) => 3903,
            ServerError::Exec(ExecError::NestingLimit { .. }) => 217,
            ServerError::Storage(StorageError::Constraint(_)) => 547,
            ServerError::Storage(StorageError::NotFound(_)) => 208,
            ServerError::Storage(_) => 2714,
            ServerError::Auth(_) => 18456,
            _ => 50000,
        }
    }
}

pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_wraps_into_server_error() {
        let e: ServerError = ProtocolError::ConnectionClosed.into();
        assert!(matches!(e, ServerError::Protocol(ProtocolError::ConnectionClosed)));
        assert_eq!(e.severity(), Severity::Fatal);
    }

    #[test]
    fn parse_error_maps_to_102() {
        let e: ServerError = ProcedureError::Parse("bad token".into()).into();
        assert_eq!(e.sql_error_number(), 102);
    }

    #[test]
    fn missing_procedure_maps_to_2812() {
        let e: ServerError = ProcedureError::NotFound("dbo.Foo".into()).into();
        assert_eq!(e.sql_error_number(), 2812);
    }

    #[test]
    fn timeout_maps_to_minus_two() {
        let e: ServerError = ExecError::Timeout.into();
        assert_eq!(e.sql_error_number(), -2);
        assert_eq!(e.severity(), Severity::Warning);
    }

    #[test]
    fn error_context_builder() {
        let ctx = ErrorContext::new("execute").with("procedure", "dbo.GetCustomer");
        assert_eq!(ctx.operation, "execute");
        assert_eq!(ctx.fields.get("procedure"), Some(&"dbo.GetCustomer".to_string()));
    }
}
