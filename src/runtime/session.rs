//! Per-connection session state (§3 Session).
//!
//! Created at handshake completion, destroyed on client close or a
//! fatal error; never shared across connections.

use crate::runtime::transaction::{IsolationLevel, Transaction};

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub connection_identity: String,
    pub user: String,
    pub database: String,
    pub tenant: Option<String>,
    pub transaction: Option<Transaction>,
    pub isolation_level: IsolationLevel,
    pub packet_size: u16,
    pub tds_version: u32,
    pub call_stack: Vec<String>,
    pub nocount: bool,
}

impl Session {
    pub fn new(session_id: impl Into<String>, connection_identity: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            connection_identity: connection_identity.into(),
            user: String::new(),
            database: String::new(),
            tenant: None,
            transaction: None,
            isolation_level: IsolationLevel::default(),
            packet_size: 4096,
            tds_version: 0x74000004,
            call_stack: Vec::new(),
            nocount: false,
        }
    }

    pub fn nesting_depth(&self) -> u32 {
        self.call_stack.len() as u32
    }

    pub fn push_call(&mut self, procedure_name: impl Into<String>) {
        self.call_stack.push(procedure_name.into());
    }

    pub fn pop_call(&mut self) {
        self.call_stack.pop();
    }

    pub fn transaction_nesting_depth(&self) -> u32 {
        self.transaction.as_ref().map(|t| t.nesting_depth).unwrap_or(0)
    }

    /// Apply RESET-CONNECTION semantics (SPEC_FULL §C): session
    /// parameters revert to post-LOGIN7 defaults, transaction state is
    /// cleared, the TCP connection and call stack are untouched.
    pub fn reset_connection(&mut self, default_database: &str) {
        self.database = default_database.to_string();
        self.isolation_level = IsolationLevel::default();
        self.transaction = None;
        self.nocount = false;
    }

    /// RESET-SKIP-TRAN: same as `reset_connection` but the transaction
    /// handle (if any) is left untouched for the remainder of the
    /// in-flight batch.
    pub fn reset_connection_skip_tran(&mut self, default_database: &str) {
        self.database = default_database.to_string();
        self.isolation_level = IsolationLevel::default();
        self.nocount = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_depth_tracks_call_stack() {
        let mut session = Session::new("s1", "conn1");
        assert_eq!(session.nesting_depth(), 0);
        session.push_call("dbo.A");
        session.push_call("dbo.B");
        assert_eq!(session.nesting_depth(), 2);
        session.pop_call();
        assert_eq!(session.nesting_depth(), 1);
    }

    #[test]
    fn reset_connection_clears_transaction_but_keeps_call_stack() {
        let mut session = Session::new("s1", "conn1");
        session.push_call("dbo.A");
        session.database = "salesdb".to_string();
        session.transaction = Some(Transaction::new(
            crate::storage::TxnHandle::new("t1", [0; 8]),
            IsolationLevel::Serializable,
        ));

        session.reset_connection("master");
        assert_eq!(session.database, "master");
        assert!(session.transaction.is_none());
        assert_eq!(session.isolation_level, IsolationLevel::ReadCommitted);
        assert_eq!(session.nesting_depth(), 1);
    }

    #[test]
    fn reset_skip_tran_preserves_transaction_handle() {
        let mut session = Session::new("s1", "conn1");
        session.transaction = Some(Transaction::new(
            crate::storage::TxnHandle::new("t1", [0; 8]),
            IsolationLevel::Serializable,
        ));
        session.reset_connection_skip_tran("master");
        assert!(session.transaction.is_some());
        assert_eq!(session.isolation_level, IsolationLevel::ReadCommitted);
    }
}
