//! The promote pipeline (§4.4): enqueues at most one concurrent compile
//! per (procedure, hash), runs it on a worker pool, and dispatches
//! execution through the compiled tier once an artifact is `Ready`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::error::{CompileError, ServerError, ServerResult};
use crate::registry::Procedure;
use crate::types::{ExecResult, Value};

/// External collaborator that turns a procedure's source into a
/// compiled artifact and can later execute it (§6 "Transpiler").
#[async_trait]
pub trait Transpiler: Send + Sync {
    async fn compile(&self, procedure: &Procedure) -> ServerResult<CompiledArtifact>;

    async fn execute(
        &self,
        artifact: &CompiledArtifact,
        params: &HashMap<String, Value>,
        storage: Arc<dyn crate::storage::Storage>,
    ) -> ServerResult<ExecResult>;
}

/// Opaque compiled output. The real transpiler backend decides what
/// lives inside; the core only needs to hold and hand it back.
#[derive(Clone)]
pub struct CompiledArtifact {
    pub source_hash: String,
    pub payload: Arc<Vec<u8>>,
}

struct CompileTask {
    procedure: Arc<Procedure>,
}

/// Coordinates compilation. One or more worker tasks drain a bounded
/// channel; callers that lose the at-most-once race simply never get a
/// task queued (`CompileCell::try_enqueue` already enforced that).
/// Ready artifacts live in `artifacts`, owned by this `Manager` instance
/// rather than any process-wide static (§9: "avoid global mutable
/// state").
pub struct Manager {
    sender: mpsc::Sender<CompileTask>,
    artifacts: Arc<DashMap<String, CompiledArtifact>>,
    transpiler: Arc<dyn Transpiler>,
}

impl Manager {
    /// Spawn the worker pool. `workers` is the number of concurrent
    /// compile tasks that may run at once across all procedures — a
    /// separate knob from the at-most-one-per-procedure rule, which is
    /// enforced by `CompileCell` before a task ever reaches here.
    pub fn spawn(transpiler: Arc<dyn Transpiler>, workers: usize) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let artifacts = Arc::new(DashMap::new());

        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            let transpiler = transpiler.clone();
            let artifacts = artifacts.clone();
            tokio::spawn(async move {
                loop {
                    let task = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    match task {
                        Some(task) => run_compile(transpiler.clone(), artifacts.clone(), task).await,
                        None => break,
                    }
                }
            });
        }

        Self {
            sender: tx,
            artifacts,
            transpiler,
        }
    }

    /// Fire-and-forget enqueue (§4.3 step 6: "enqueue a compile task on
    /// the promote pipeline"). Returns immediately; the caller's
    /// `CompileCell::try_enqueue` has already won the race before this
    /// is called, so this never blocks the calling `Execute`.
    pub fn compile(&self, procedure: Arc<Procedure>) {
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let _ = sender.send(CompileTask { procedure }).await;
        });
    }

    /// Run a ready artifact through the compiled tier (§4.4 "Execute
    /// via compiled tier"), presenting the same narrow storage
    /// interface the compiled code was built against.
    pub async fn transpiler_execute(
        &self,
        artifact: &CompiledArtifact,
        params: &HashMap<String, Value>,
        storage: Arc<dyn crate::storage::Storage>,
    ) -> ServerResult<ExecResult> {
        self.transpiler.execute(artifact, params, storage).await
    }

    /// Fetch the artifact for a procedure, if one is ready and still
    /// valid for its current source hash.
    pub fn ready_artifact(&self, procedure: &Procedure) -> Option<CompiledArtifact> {
        if !procedure.compile.is_ready_for(&procedure.content_hash) {
            return None;
        }
        self.artifacts
            .get(&procedure.qualified_name())
            .map(|entry| entry.clone())
            .filter(|artifact| artifact.source_hash == procedure.content_hash)
    }
}

async fn run_compile(
    transpiler: Arc<dyn Transpiler>,
    artifacts: Arc<DashMap<String, CompiledArtifact>>,
    task: CompileTask,
) {
    let procedure = task.procedure;
    procedure.compile.mark_compiling();
    match transpiler.compile(&procedure).await {
        Ok(artifact) => {
            artifacts.insert(procedure.qualified_name(), artifact);
            procedure.compile.mark_ready();
            log::info!(
                "compiled {} (hash {})",
                procedure.qualified_name(),
                procedure.content_hash
            );
        }
        Err(err) => {
            log::warn!("compile failed for {}: {err}", procedure.qualified_name());
            procedure.compile.mark_failed(err.to_string());
        }
    }
}

/// A `Transpiler` that always fails, used when compilation is
/// administratively disabled (§7 `CompileError::Disabled`).
pub struct DisabledTranspiler;

#[async_trait]
impl Transpiler for DisabledTranspiler {
    async fn compile(&self, _procedure: &Procedure) -> ServerResult<CompiledArtifact> {
        Err(ServerError::Compile(CompileError::Disabled))
    }

    async fn execute(
        &self,
        _artifact: &CompiledArtifact,
        _params: &HashMap<String, Value>,
        _storage: Arc<dyn crate::storage::Storage>,
    ) -> ServerResult<ExecResult> {
        Err(ServerError::Compile(CompileError::NotCompiled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Dialect;
    use crate::registry::ProcedureId;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct CountingTranspiler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transpiler for CountingTranspiler {
        async fn compile(&self, procedure: &Procedure) -> ServerResult<CompiledArtifact> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CompiledArtifact {
                source_hash: procedure.content_hash.clone(),
                payload: Arc::new(vec![1, 2, 3]),
            })
        }

        async fn execute(
            &self,
            _artifact: &CompiledArtifact,
            _params: &HashMap<String, Value>,
            _storage: Arc<dyn crate::storage::Storage>,
        ) -> ServerResult<ExecResult> {
            Ok(ExecResult::default())
        }
    }

    fn make_procedure(source: &str) -> Arc<Procedure> {
        Arc::new(Procedure::new(
            ProcedureId {
                tenant: None,
                database: Some("db".into()),
                schema: "dbo".into(),
                name: "P".into(),
            },
            Dialect::TSql,
            source.to_string(),
            vec![],
            HashMap::new(),
        ))
    }

    #[tokio::test]
    async fn compile_transitions_to_ready_for_matching_hash() {
        let transpiler = Arc::new(CountingTranspiler {
            calls: AtomicU32::new(0),
        });
        let manager = Manager::spawn(transpiler.clone(), 2);
        let procedure = make_procedure("SELECT 1");

        assert!(procedure.compile.try_enqueue(&procedure.content_hash));
        manager.compile(procedure.clone());

        for _ in 0..50 {
            if procedure.compile.is_ready_for(&procedure.content_hash) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.ready_artifact(&procedure).is_some());
        assert_eq!(transpiler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_transpiler_reports_disabled_error() {
        let manager = Manager::spawn(Arc::new(DisabledTranspiler), 1);
        let procedure = make_procedure("SELECT 1");
        assert!(procedure.compile.try_enqueue(&procedure.content_hash));
        manager.compile(procedure.clone());

        for _ in 0..50 {
            if procedure.compile.state() == crate::compile::status::CompileState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            procedure.compile.state(),
            crate::compile::status::CompileState::Failed
        );
        assert!(manager.ready_artifact(&procedure).is_none());
    }
}
