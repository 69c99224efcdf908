//! Transaction model and nesting rules (§3 Transaction, §4.3
//! "Transaction handling", §8 scenario S6).

use crate::storage::TxnHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Snapshot,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
    Error,
}

/// A single open transaction, owned by the session that opened it
/// (§5: "cross-session transaction handles are forbidden").
#[derive(Debug, Clone)]
pub struct Transaction {
    pub handle: TxnHandle,
    pub nesting_depth: u32,
    pub isolation_level: IsolationLevel,
    pub savepoints: Vec<String>,
    pub state: TransactionState,
}

impl Transaction {
    pub fn new(handle: TxnHandle, isolation_level: IsolationLevel) -> Self {
        Self {
            handle,
            nesting_depth: 1,
            isolation_level,
            savepoints: Vec::new(),
            state: TransactionState::Active,
        }
    }

    /// Nested BEGIN: increments depth, handle unchanged (§4.3, §8 S6).
    pub fn begin_nested(&mut self) {
        self.nesting_depth += 1;
    }

    /// SAVE TRANSACTION: appends to the savepoint list, does not affect
    /// nesting depth.
    pub fn save(&mut self, name: impl Into<String>) {
        self.savepoints.push(name.into());
    }

    /// ROLLBACK TRANSACTION `<savepoint>`: truncates the savepoint list
    /// back to and including the named savepoint, without changing
    /// nesting depth (SPEC_FULL §C "Savepoint rollback semantics").
    pub fn rollback_to(&mut self, name: &str) -> bool {
        match self.savepoints.iter().position(|s| s == name) {
            Some(pos) => {
                self.savepoints.truncate(pos + 1);
                true
            }
            None => false,
        }
    }
}
