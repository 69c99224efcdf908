//! The execution runtime (C3, §4.3): public entry points `execute` and
//! `execute_sql`, each run through the six ordered phases the
//! specification names — admission, accounting, timeout, nesting
//! guard, tier selection, promotion check.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::compile::Manager;
use crate::config::RuntimeConfig;
use crate::error::{ExecError, ServerError, ServerResult};
use crate::registry::{LookupContext, Procedure, Registry};
use crate::runtime::exec_context::ExecContext;
use crate::runtime::interpreter::{Interpreter, NestedExecutor};
use crate::runtime::session::Session;
use crate::storage::Storage;
use crate::types::ExecResult;

/// Live counters a monitoring surface (or `compile-status`/`exec` CLI
/// subcommands) can read without touching the hot path.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    pub active_execs: AtomicU64,
    pub total_execs: AtomicU64,
    pub cumulative_exec_ns: AtomicU64,
}

/// Owns everything `Execute`/`ExecuteSQL` need: the registry, the
/// storage backend, the compile/promote pipeline, and the concurrency
/// semaphore. One instance per server process — constructed once at
/// start-up and shared via `Arc`, never a global (§9).
pub struct Runtime {
    registry: Arc<Registry>,
    storage: Arc<dyn Storage>,
    manager: Arc<Manager>,
    interpreter: Arc<Interpreter>,
    config: RuntimeConfig,
    semaphore: Arc<Semaphore>,
    stats: RuntimeStats,
}

impl Runtime {
    pub fn new(
        registry: Arc<Registry>,
        storage: Arc<dyn Storage>,
        manager: Arc<Manager>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        let max_concurrency = config.max_concurrency.max(1);
        Arc::new(Self {
            registry,
            storage,
            manager,
            interpreter: Arc::new(Interpreter::new()),
            config,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            stats: RuntimeStats::default(),
        })
    }

    pub fn stats(&self) -> &RuntimeStats {
        &self.stats
    }

    /// Execute a resolved, registered procedure (§4.3 `Execute`).
    pub async fn execute(
        &self,
        session: &mut Session,
        procedure: Arc<Procedure>,
        ctx: ExecContext,
    ) -> ServerResult<ExecResult> {
        self.run(session, Some(procedure), None, ctx, true).await
    }

    /// Execute an ad-hoc SQL batch not backed by a registered
    /// procedure (§4.3 `ExecuteSQL`). Never eligible for the compiled
    /// tier or promotion — there is no stable identity to key a
    /// compiled artifact on.
    pub async fn execute_sql(
        &self,
        session: &mut Session,
        sql_text: &str,
        ctx: ExecContext,
    ) -> ServerResult<ExecResult> {
        self.run(session, None, Some(sql_text), ctx, true).await
    }

    async fn run(
        &self,
        session: &mut Session,
        procedure: Option<Arc<Procedure>>,
        sql_text: Option<&str>,
        ctx: ExecContext,
        top_level: bool,
    ) -> ServerResult<ExecResult> {
        // Phase 1: admission. Nested calls share the connection's
        // already-admitted slot rather than re-acquiring one — a
        // single global semaphore shared between an outer call and
        // its own nested EXECs would deadlock under saturation.
        let _permit = if top_level {
            Some(
                self.semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| ServerError::Exec(ExecError::Cancelled))?,
            )
        } else {
            None
        };

        // Phase 2: accounting (entry side).
        self.stats.active_execs.fetch_add(1, Ordering::AcqRel);
        self.stats.total_execs.fetch_add(1, Ordering::AcqRel);
        let started = Instant::now();

        // Phase 4: nesting guard.
        if ctx.nesting_depth > self.config.max_nesting_level {
            self.stats.active_execs.fetch_sub(1, Ordering::AcqRel);
            return Err(ServerError::Exec(ExecError::NestingLimit {
                depth: ctx.nesting_depth,
                max: self.config.max_nesting_level,
            }));
        }

        // Phase 3: timeout. `execContext.timeout` (or the server
        // default) bounds the remaining phases.
        let timeout = ctx.timeout.unwrap_or(std::time::Duration::from_secs(
            self.config.exec_timeout_secs,
        ));

        let dispatch_fut = self.dispatch(session, procedure.as_ref(), sql_text, &ctx);
        let outcome: ServerResult<ExecResult> = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(ServerError::Exec(ExecError::Cancelled)),
            res = tokio::time::timeout(timeout, dispatch_fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(ServerError::Exec(ExecError::Timeout)),
            },
        };

        self.stats.active_execs.fetch_sub(1, Ordering::AcqRel);
        let elapsed = started.elapsed();
        self.stats
            .cumulative_exec_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::AcqRel);

        let mut result = outcome?;
        result.elapsed = elapsed;

        // Phase 6: post-execution promotion check. Only named,
        // registered procedures are eligible.
        if let Some(procedure) = &procedure {
            let count = procedure.record_execution(elapsed.as_nanos() as u64);
            if self.config.jit_enabled
                && count >= self.config.jit_threshold
                && !procedure.compile.is_ready_for(&procedure.content_hash)
                && procedure.compile.try_enqueue(&procedure.content_hash)
            {
                self.manager.compile(procedure.clone());
            }
        }

        Ok(result)
    }

    async fn dispatch(
        &self,
        session: &mut Session,
        procedure: Option<&Arc<Procedure>>,
        sql_text: Option<&str>,
        ctx: &ExecContext,
    ) -> ServerResult<ExecResult> {
        // Phase 5: tier selection.
        let ready_artifact = procedure.and_then(|p| self.manager.ready_artifact(p));

        match (procedure, ready_artifact) {
            (Some(_), Some(artifact)) => self.manager_execute(&artifact, ctx).await,
            (Some(procedure), None) => {
                self.interpreter
                    .run(
                        procedure,
                        ctx,
                        session,
                        self.storage.clone(),
                        self as &dyn NestedExecutor,
                    )
                    .await
            }
            (None, _) => {
                let sql = sql_text.ok_or_else(|| {
                    ServerError::Exec(ExecError::InvalidState(
                        "neither a procedure nor SQL text was supplied".into(),
                    ))
                })?;
                self.interpreter
                    .run(
                        &ad_hoc_procedure(sql),
                        ctx,
                        session,
                        self.storage.clone(),
                        self as &dyn NestedExecutor,
                    )
                    .await
            }
        }
    }

    async fn manager_execute(
        &self,
        artifact: &crate::compile::CompiledArtifact,
        ctx: &ExecContext,
    ) -> ServerResult<ExecResult> {
        // The narrow compiled-tier storage interface (§4.4 "Query,
        // QueryRow, Exec, Begin") is the same `Storage` trait object
        // already held by the runtime; compiled code never sees more.
        self.manager
            .transpiler_execute(artifact, &ctx.params, self.storage.clone())
            .await
    }

    /// Resolve `callee` (schema-qualified or bare) under `ctx`'s
    /// (tenant, database) and run it — the nested-EXEC re-entry point
    /// into §4.2's resolver.
    async fn execute_by_name(
        &self,
        session: &mut Session,
        callee: &str,
        ctx: ExecContext,
    ) -> ServerResult<ExecResult> {
        let lookup = LookupContext {
            tenant: ctx.tenant.clone(),
            database: Some(ctx.database.clone()),
        };
        let procedure = self.registry.lookup(&lookup, callee)?;
        self.run(session, Some(procedure), None, ctx, false).await
    }
}

#[async_trait]
impl NestedExecutor for Runtime {
    async fn execute_nested(&self, session: &mut Session, ctx: ExecContext) -> ServerResult<ExecResult> {
        let callee = ctx
            .call_stack
            .last()
            .cloned()
            .ok_or_else(|| ServerError::Internal("nested call with empty call stack".into()))?;
        self.execute_by_name(session, &callee, ctx).await
    }
}

/// A throwaway, unregistered `Procedure` wrapping an ad-hoc batch so
/// `execute_sql` can reuse the interpreter's body-extraction logic.
/// Never inserted into the registry, never eligible for compilation.
fn ad_hoc_procedure(sql_text: &str) -> Arc<Procedure> {
    Arc::new(Procedure::new(
        crate::registry::ProcedureId {
            tenant: None,
            database: None,
            schema: "dbo".to_string(),
            name: "$adhoc".to_string(),
        },
        crate::config::Dialect::TSql,
        format!("CREATE PROCEDURE dbo.[$adhoc] AS\n{sql_text}"),
        Vec::new(),
        std::collections::HashMap::new(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::DisabledTranspiler;
    use crate::config::Dialect;
    use crate::storage::MemoryStorage;
    use std::collections::HashMap;

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            default_dialect: Dialect::TSql,
            jit_enabled: true,
            jit_threshold: 3,
            max_concurrency: 4,
            exec_timeout_secs: 5,
            max_result_rows: None,
            max_result_sets: None,
            max_nesting_level: 32,
        }
    }

    fn test_runtime() -> Arc<Runtime> {
        let registry = Arc::new(Registry::new());
        let storage = Arc::new(MemoryStorage::new());
        let manager = Arc::new(Manager::spawn(Arc::new(DisabledTranspiler), 1));
        Runtime::new(registry, storage, manager, test_config())
    }

    #[tokio::test]
    async fn ad_hoc_select_runs_through_interpreter() {
        let runtime = test_runtime();
        let mut session = Session::new("s1", "conn1");
        session.database = "master".to_string();
        let ctx = ExecContext::new("s1", "master");

        let result = runtime
            .execute_sql(&mut session, "SELECT 1", ctx)
            .await
            .unwrap();
        assert_eq!(result.result_sets.len(), 1);
    }

    #[tokio::test]
    async fn nesting_beyond_limit_fails() {
        let mut config = test_config();
        config.max_nesting_level = 1;
        let registry = Arc::new(Registry::new());
        let storage = Arc::new(MemoryStorage::new());
        let manager = Arc::new(Manager::spawn(Arc::new(DisabledTranspiler), 1));
        let runtime = Runtime::new(registry, storage, manager, config);

        let mut session = Session::new("s1", "conn1");
        let mut ctx = ExecContext::new("s1", "master");
        ctx.nesting_depth = 5;

        let err = runtime.execute_sql(&mut session, "SELECT 1", ctx).await;
        assert!(matches!(
            err,
            Err(ServerError::Exec(ExecError::NestingLimit { .. }))
        ));
    }

    #[tokio::test]
    async fn commit_without_transaction_is_rejected() {
        let runtime = test_runtime();
        let mut session = Session::new("s1", "conn1");
        let ctx = ExecContext::new("s1", "master");

        let err = runtime.execute_sql(&mut session, "COMMIT", ctx).await;
        assert!(matches!(
            err,
            Err(ServerError::Exec(ExecError::CommitWithoutTransaction))
        ));
    }

    #[tokio::test]
    async fn begin_commit_round_trip_clears_transaction() {
        let runtime = test_runtime();
        let mut session = Session::new("s1", "conn1");
        let ctx = ExecContext::new("s1", "master");

        runtime
            .execute_sql(&mut session, "BEGIN TRANSACTION", ctx.clone())
            .await
            .unwrap();
        assert!(session.transaction.is_some());

        runtime.execute_sql(&mut session, "COMMIT", ctx).await.unwrap();
        assert!(session.transaction.is_none());
    }

    #[tokio::test]
    async fn pre_cancelled_context_short_circuits_with_cancelled_error() {
        let runtime = test_runtime();
        let mut session = Session::new("s1", "conn1");
        let ctx = ExecContext::new("s1", "master");
        ctx.cancel.cancel();

        let err = runtime.execute_sql(&mut session, "SELECT 1", ctx).await;
        assert!(matches!(err, Err(ServerError::Exec(ExecError::Cancelled))));
    }

    #[tokio::test]
    async fn procedure_execution_is_counted_for_promotion() {
        let runtime = test_runtime();

        let procedure = Arc::new(Procedure::new(
            crate::registry::ProcedureId {
                tenant: None,
                database: Some("db".into()),
                schema: "dbo".into(),
                name: "P".into(),
            },
            Dialect::TSql,
            "CREATE PROCEDURE dbo.P AS\nSELECT 1".to_string(),
            Vec::new(),
            HashMap::new(),
        ));

        let mut session = Session::new("s1", "conn1");
        let ctx = ExecContext::new("s1", "db");
        runtime
            .execute(&mut session, procedure.clone(), ctx)
            .await
            .unwrap();
        assert_eq!(procedure.exec_count(), 1);
    }
}
