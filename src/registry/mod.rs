//! Procedure registry: loading, identity, and hierarchical resolution
//! (C2).

pub mod loader;
pub mod procedure;
pub mod resolver;

pub use loader::{Loader, LoadedProcedure, SchemaValidationMode};
pub use procedure::{content_hash, Procedure, ProcedureId};
pub use resolver::{LookupContext, Registry};
