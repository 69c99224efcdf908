//! The interpreted execution tier (§4.3 "Interpreted dispatch").
//!
//! Richer AST consumption is explicitly out of scope (§6: the T-SQL
//! AST/parser is an external collaborator) — the interpreter treats a
//! procedure body as a sequence of statements, recognizes the control
//! constructs the runtime must act on itself (transactions, SET
//! options, nested EXEC, RETURN), and forwards everything else to the
//! storage backend as text, the same best-effort textual approach the
//! registry loader uses for identity extraction.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::error::{ExecError, ServerError, ServerResult};
use crate::registry::Procedure;
use crate::runtime::exec_context::ExecContext;
use crate::runtime::session::Session;
use crate::runtime::transaction::{IsolationLevel, Transaction};
use crate::storage::Storage;
use crate::types::{ExecResult, TransactionEvent, TransactionEventKind, Value};

/// Callback the interpreter uses to re-enter `Runtime::execute` for a
/// nested `EXEC` inside a procedure body (§4.2: "nested EXEC ... re-
/// enters the resolver"). Kept as a narrow trait to avoid a circular
/// dependency between `Runtime` and `Interpreter`.
#[async_trait]
pub trait NestedExecutor: Send + Sync {
    async fn execute_nested(&self, session: &mut Session, ctx: ExecContext) -> ServerResult<ExecResult>;
}

pub struct Interpreter {
    transaction_re: Regex,
    commit_re: Regex,
    rollback_re: Regex,
    save_re: Regex,
    set_re: Regex,
    exec_re: Regex,
    return_re: Regex,
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            transaction_re: Regex::new(r"(?i)^\s*BEGIN\s+TRAN(?:SACTION)?\b").unwrap(),
            commit_re: Regex::new(r"(?i)^\s*COMMIT\s*(?:TRAN(?:SACTION)?)?\b").unwrap(),
            rollback_re: Regex::new(r"(?i)^\s*ROLLBACK\s*(?:TRAN(?:SACTION)?)?\s*(\w+)?").unwrap(),
            save_re: Regex::new(r"(?i)^\s*SAVE\s+TRAN(?:SACTION)?\s+(\w+)").unwrap(),
            set_re: Regex::new(r"(?i)^\s*SET\s+(\w+)\s+(\w+)").unwrap(),
            exec_re: Regex::new(r"(?i)^\s*EXEC(?:UTE)?\s+([\w\.\[\]]+)\s*(.*)$").unwrap(),
            return_re: Regex::new(r"(?i)^\s*RETURN\s*(-?\d+)?\s*$").unwrap(),
        }
    }

    /// Run `procedure`'s body against `storage`, mutating `session` for
    /// transaction/SET side effects, dispatching nested EXEC through
    /// `nested`.
    pub async fn run(
        &self,
        procedure: &Procedure,
        ctx: &ExecContext,
        session: &mut Session,
        storage: Arc<dyn Storage>,
        nested: &dyn NestedExecutor,
    ) -> ServerResult<ExecResult> {
        let body = extract_body(&procedure.source);
        let mut result = ExecResult::default();

        for raw in split_statements(body) {
            let stmt = raw.trim();
            if stmt.is_empty() {
                continue;
            }

            if self.transaction_re.is_match(stmt) {
                if let Some(event) = self.handle_begin(session, storage.as_ref()).await? {
                    result.transaction_events.push(event);
                }
            } else if self.commit_re.is_match(stmt) {
                if let Some(event) = self.handle_commit(session, storage.as_ref()).await? {
                    result.transaction_events.push(event);
                }
            } else if let Some(caps) = self.rollback_re.captures(stmt) {
                let savepoint = caps.get(1).map(|m| m.as_str().to_string());
                if let Some(event) = self.handle_rollback(session, storage.as_ref(), savepoint).await? {
                    result.transaction_events.push(event);
                }
            } else if let Some(caps) = self.save_re.captures(stmt) {
                let name = caps.get(1).unwrap().as_str().to_string();
                self.handle_save(session, name)?;
            } else if let Some(caps) = self.set_re.captures(stmt) {
                self.handle_set(session, &caps[1], &caps[2]);
            } else if let Some(caps) = self.exec_re.captures(stmt) {
                let callee = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
                let args = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                let nested_result = self
                    .handle_exec(ctx, &callee, args, session, nested)
                    .await?;
                result.result_sets.extend(nested_result.result_sets);
                result.rows_affected += nested_result.rows_affected;
            } else if let Some(caps) = self.return_re.captures(stmt) {
                result.return_value = caps.get(1).and_then(|m| m.as_str().parse().ok());
            } else {
                let sql = substitute_params(stmt, &ctx.params);
                self.dispatch_sql(&sql, storage.as_ref(), &mut result).await?;
            }
        }

        Ok(result)
    }

    async fn dispatch_sql(
        &self,
        sql: &str,
        storage: &dyn Storage,
        result: &mut ExecResult,
    ) -> ServerResult<()> {
        let upper = sql.trim_start().to_uppercase();
        if upper.starts_with("SELECT") {
            let query_result = storage.query(sql, &[]).await?;
            result.result_sets.push(query_result);
        } else {
            let affected = storage.exec(sql, &[]).await?;
            result.rows_affected += affected;
        }
        Ok(())
    }

    /// Returns the ENVCHANGE-worthy event for a transaction that just
    /// opened. A nested `BEGIN` only deepens the existing transaction's
    /// handle (§4.3, §8 S6), so it never produces one.
    async fn handle_begin(
        &self,
        session: &mut Session,
        storage: &dyn Storage,
    ) -> ServerResult<Option<TransactionEvent>> {
        match &mut session.transaction {
            Some(txn) => {
                txn.begin_nested();
                Ok(None)
            }
            None => {
                let handle = storage.begin().await?;
                let new_descriptor = handle.descriptor;
                session.transaction = Some(Transaction::new(handle, session.isolation_level));
                Ok(Some(TransactionEvent {
                    kind: TransactionEventKind::Began,
                    new_descriptor,
                    old_descriptor: [0; 8],
                }))
            }
        }
    }

    /// A `COMMIT` that only unwinds one level of nesting leaves the
    /// descriptor untouched and produces no event; only the commit that
    /// actually closes the transaction does (§8 S6).
    async fn handle_commit(
        &self,
        session: &mut Session,
        storage: &dyn Storage,
    ) -> ServerResult<Option<TransactionEvent>> {
        let txn = session
            .transaction
            .as_mut()
            .ok_or(ServerError::Exec(ExecError::CommitWithoutTransaction))?;

        if txn.nesting_depth > 1 {
            txn.nesting_depth -= 1;
            return Ok(None);
        }

        let old_descriptor = txn.handle.descriptor;
        storage.commit(&txn.handle).await?;
        session.transaction = None;
        Ok(Some(TransactionEvent {
            kind: TransactionEventKind::Committed,
            new_descriptor: [0; 8],
            old_descriptor,
        }))
    }

    /// A savepoint-targeted `ROLLBACK TRANSACTION <name>` truncates the
    /// savepoint stack without closing the transaction, so it carries no
    /// descriptor change; only a full rollback does (§8 S6).
    async fn handle_rollback(
        &self,
        session: &mut Session,
        storage: &dyn Storage,
        savepoint: Option<String>,
    ) -> ServerResult<Option<TransactionEvent>> {
        let txn = session
            .transaction
            .as_mut()
            .ok_or(ServerError::Exec(ExecError::RollbackWithoutTransaction))?;

        if let Some(name) = savepoint {
            if txn.rollback_to(&name) {
                storage.rollback_to(&txn.handle, &name).await?;
                return Ok(None);
            }
            return Err(ServerError::Exec(ExecError::Failed(format!(
                "unknown savepoint {name}"
            ))));
        }

        let old_descriptor = txn.handle.descriptor;
        storage.rollback(&txn.handle).await?;
        session.transaction = None;
        Ok(Some(TransactionEvent {
            kind: TransactionEventKind::RolledBack,
            new_descriptor: [0; 8],
            old_descriptor,
        }))
    }

    fn handle_save(&self, session: &mut Session, name: String) -> ServerResult<()> {
        let txn = session
            .transaction
            .as_mut()
            .ok_or_else(|| ServerError::Exec(ExecError::Failed("SAVE TRANSACTION outside a transaction".into())))?;
        txn.save(name);
        Ok(())
    }

    fn handle_set(&self, session: &mut Session, option: &str, value: &str) {
        match option.to_uppercase().as_str() {
            "NOCOUNT" => session.nocount = value.eq_ignore_ascii_case("ON"),
            "TRANSACTION" => {
                // SET TRANSACTION ISOLATION LEVEL <level> arrives as two
                // capture groups ("TRANSACTION", "ISOLATION"); the level
                // itself is the remainder of the statement, so fold a
                // handful of common spellings best-effort.
                match value.to_uppercase().as_str() {
                    "READ" => session.isolation_level = IsolationLevel::ReadUncommitted,
                    "REPEATABLE" => session.isolation_level = IsolationLevel::RepeatableRead,
                    "SERIALIZABLE" => session.isolation_level = IsolationLevel::Serializable,
                    "SNAPSHOT" => session.isolation_level = IsolationLevel::Snapshot,
                    _ => {}
                }
            }
            "ANSI_NULLS" | "ANSI_WARNINGS" | "QUOTED_IDENTIFIER" | "ARITHABORT" => {
                // Recognized and silently accepted: these affect parse-time
                // semantics the interpreter does not model.
            }
            _ => {}
        }
    }

    async fn handle_exec(
        &self,
        ctx: &ExecContext,
        callee: &str,
        args: &str,
        session: &mut Session,
        nested: &dyn NestedExecutor,
    ) -> ServerResult<ExecResult> {
        let mut nested_ctx = ctx.nested(callee.to_string());
        for binding in split_args(args) {
            if let Some((name, value)) = parse_binding(&binding) {
                nested_ctx.params.insert(name, value);
            }
        }
        nested.execute_nested(session, nested_ctx).await
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

fn value_placeholder() -> Option<Value> {
    None
}

/// Extract the runnable body: everything after the first `AS` keyword
/// following the `CREATE PROCEDURE`/`FUNCTION` header, the same
/// boundary the loader uses to scan for parameter declarations.
pub fn extract_body(source: &str) -> &str {
    let lower = source.to_lowercase();
    match lower.find("\nas\n").or_else(|| lower.find(" as\n")).or_else(|| lower.find("\nas ")) {
        Some(pos) => {
            let as_end = source[pos..]
                .to_lowercase()
                .find("as")
                .map(|p| pos + p + 2)
                .unwrap_or(pos);
            source[as_end..].trim_start_matches(|c: char| c == '\r' || c == '\n')
        }
        None => source,
    }
}

/// Split a batch into top-level statements on semicolons that are not
/// inside single-quoted string literals.
fn split_statements(body: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_string = false;

    for ch in body.chars() {
        match ch {
            '\'' => {
                in_string = !in_string;
                current.push(ch);
            }
            ';' if !in_string => {
                statements.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        statements.push(current);
    }
    statements
}

fn split_args(args: &str) -> Vec<String> {
    args.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
}

fn parse_binding(binding: &str) -> Option<(String, Value)> {
    let (name, literal) = if let Some((n, v)) = binding.split_once('=') {
        (n.trim().to_string(), v.trim())
    } else {
        return None;
    };
    let name = if name.starts_with('@') { name } else { format!("@{name}") };
    Some((name, parse_literal(literal)))
}

fn parse_literal(literal: &str) -> Value {
    let trimmed = literal.trim();
    if trimmed.eq_ignore_ascii_case("NULL") {
        Value::Null
    } else if trimmed.starts_with('\'') && trimmed.ends_with('\'') && trimmed.len() >= 2 {
        Value::Text(trimmed[1..trimmed.len() - 1].replace("''", "'"))
    } else if let Ok(i) = trimmed.parse::<i32>() {
        Value::Int(i)
    } else if let Ok(f) = trimmed.parse::<f64>() {
        Value::Double(f)
    } else {
        Value::Text(trimmed.to_string())
    }
}

/// Replace `@name` occurrences outside string literals with a literal
/// rendering of the bound value (§4.3 "bind parameter values prefixed
/// with '@'").
fn substitute_params(sql: &str, params: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_string = false;

    while let Some((_, ch)) = chars.next() {
        if ch == '\'' {
            in_string = !in_string;
            out.push(ch);
            continue;
        }
        if ch == '@' && !in_string {
            let mut name = String::from("@");
            while let Some(&(_, next)) = chars.peek() {
                if next.is_alphanumeric() || next == '_' {
                    name.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            match params.get(&name) {
                Some(value) => out.push_str(&render_literal(value)),
                None => out.push_str(&name),
            }
        } else {
            out.push(ch);
        }
    }
    out
}

fn render_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bit(b) => if *b { "1".to_string() } else { "0".to_string() },
        Value::TinyInt(n) => n.to_string(),
        Value::SmallInt(n) => n.to_string(),
        Value::Int(n) => n.to_string(),
        Value::BigInt(n) => n.to_string(),
        Value::Float(n) => n.to_string(),
        Value::Double(n) => n.to_string(),
        Value::Decimal { unscaled, scale } => format!("{}e-{}", unscaled, scale),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Binary(b) => format!("0x{}", b.iter().map(|byte| format!("{:02x}", byte)).collect::<String>()),
        Value::Guid(g) => format!("'{}'", uuid::Uuid::from_bytes(*g)),
        Value::DateTime(s) | Value::Date(s) => format!("'{s}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_body_strips_header() {
        let source = "CREATE PROCEDURE dbo.Foo\n@Id INT\nAS\nSELECT 1";
        assert_eq!(extract_body(source).trim(), "SELECT 1");
    }

    #[test]
    fn split_statements_respects_string_literals() {
        let body = "SELECT 'a;b'; SELECT 2;";
        let stmts = split_statements(body);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("'a;b'"));
    }

    #[test]
    fn substitute_params_replaces_named_placeholders() {
        let mut params = HashMap::new();
        params.insert("@Id".to_string(), Value::Int(42));
        let sql = substitute_params("SELECT * FROM t WHERE id = @Id", &params);
        assert_eq!(sql, "SELECT * FROM t WHERE id = 42");
    }

    #[test]
    fn substitute_params_ignores_at_inside_string_literal() {
        let params = HashMap::new();
        let sql = substitute_params("SELECT '@not_a_param'", &params);
        assert_eq!(sql, "SELECT '@not_a_param'");
    }

    #[test]
    fn parse_binding_handles_named_and_string_args() {
        assert_eq!(
            parse_binding("@Name = 'Alice'"),
            Some(("@Name".to_string(), Value::Text("Alice".to_string())))
        );
        assert_eq!(
            parse_binding("@Count = 5"),
            Some(("@Count".to_string(), Value::Int(5)))
        );
    }
}
