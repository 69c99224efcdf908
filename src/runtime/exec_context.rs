//! `ExecContext`: the per-call argument bundle threaded through
//! `Runtime::execute`/`execute_sql` (§4.3).

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::storage::TxnHandle;
use crate::types::Value;

#[derive(Debug, Clone)]
pub struct ExecContext {
    pub session_id: String,
    pub database: String,
    pub tenant: Option<String>,
    pub user: String,
    pub params: HashMap<String, Value>,
    pub timeout: Option<Duration>,
    pub nocount: bool,
    pub row_limit: Option<u64>,
    pub call_stack: Vec<String>,
    pub nesting_depth: u32,
    pub active_transaction: Option<TxnHandle>,
    /// Cancelled when an ATTENTION packet arrives for this call while it
    /// is still executing (§4.1.2). A nested call shares its parent's
    /// token so cancelling the outer request cancels everything beneath
    /// it.
    pub cancel: CancellationToken,
}

impl ExecContext {
    pub fn new(session_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            database: database.into(),
            tenant: None,
            user: String::new(),
            params: HashMap::new(),
            timeout: None,
            nocount: false,
            row_limit: None,
            call_stack: Vec::new(),
            nesting_depth: 0,
            active_transaction: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Value) -> Self {
        let mut name = name.into();
        if !name.starts_with('@') {
            name = format!("@{name}");
        }
        self.params.insert(name, value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// A nested call context for an `EXEC` invoked from inside another
    /// procedure: same session identity, one deeper on the call stack.
    pub fn nested(&self, callee: impl Into<String>) -> Self {
        let mut call_stack = self.call_stack.clone();
        call_stack.push(callee.into());
        Self {
            session_id: self.session_id.clone(),
            database: self.database.clone(),
            tenant: self.tenant.clone(),
            user: self.user.clone(),
            params: HashMap::new(),
            timeout: self.timeout,
            nocount: self.nocount,
            row_limit: self.row_limit,
            call_stack,
            nesting_depth: self.nesting_depth + 1,
            active_transaction: self.active_transaction.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_param_prefixes_at_sign() {
        let ctx = ExecContext::new("s1", "db1").with_param("Id", Value::Int(7));
        assert_eq!(ctx.params.get("@Id"), Some(&Value::Int(7)));
    }

    #[test]
    fn nested_context_increments_depth_and_stack() {
        let ctx = ExecContext::new("s1", "db1");
        let child = ctx.nested("dbo.Inner");
        assert_eq!(child.nesting_depth, 1);
        assert_eq!(child.call_stack, vec!["dbo.Inner".to_string()]);
    }
}
