//! The execution runtime (C3): session/transaction/exec-context data
//! model, the interpreted dispatch tier, and the `Runtime` struct that
//! orders phases per §4.3.

pub mod exec_context;
pub mod interpreter;
pub mod runtime;
pub mod session;
pub mod transaction;

pub use exec_context::ExecContext;
pub use interpreter::{Interpreter, NestedExecutor};
pub use runtime::{Runtime, RuntimeStats};
pub use session::Session;
pub use transaction::{IsolationLevel, Transaction, TransactionState};
