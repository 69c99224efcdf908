//! Compile/promote pipeline (C4).

pub mod manager;
pub mod status;

pub use manager::{CompiledArtifact, DisabledTranspiler, Manager, Transpiler};
pub use status::{CompileCell, CompileState, CompileStatusSnapshot};
