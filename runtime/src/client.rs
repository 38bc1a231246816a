//! Workflow submission.
//!
//! Every submission runs the same pipeline: compile the workflow, provision a
//! fresh [`ProcessInfo`] and cancellation scope, link the caller's token to
//! the scope, dispatch through the runtime state, await the result cell, and
//! finally cancel the scope. The scope is cancelled on every exit path.

use std::any;
use std::sync::Arc;

use stratus_types::{FaultPolicy, ProcessInfo};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cancellation::{CancellationBridge, CancellationScope, ScopeGuard};
use crate::error::RuntimeError;
use crate::jobs::Submission;
use crate::manager::RuntimeManager;
use crate::workflow::{Cloud, CompiledWorkflow, ExecutionContext, WorkflowCompiler, compile};

#[derive(Clone)]
pub struct SubmissionClient {
    manager: Arc<RuntimeManager>,
    compiler: Arc<dyn WorkflowCompiler>,
    handle: Handle,
}

impl SubmissionClient {
    #[must_use]
    pub fn new(manager: Arc<RuntimeManager>, compiler: Arc<dyn WorkflowCompiler>, handle: Handle) -> Self {
        Self {
            manager,
            compiler,
            handle,
        }
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<RuntimeManager> {
        &self.manager
    }

    /// Submit `workflow` and await its result.
    ///
    /// A workflow's own error is returned as-is. Cancelling `cancellation`
    /// fails the submission with [`RuntimeError::Cancelled`].
    pub async fn submit<T: Send + 'static>(
        &self,
        workflow: Cloud<T>,
        cancellation: Option<CancellationToken>,
        policy: FaultPolicy,
    ) -> anyhow::Result<T> {
        let compiled = compile(self.compiler.as_ref(), workflow)?;
        let process = self.provision();
        let scope = self
            .manager
            .cancellation_entry_factory()
            .create_cancellation_entry()
            .await?;
        let guard = ScopeGuard::new(scope.clone());
        let bridge = cancellation.map(|token| CancellationBridge::link(token, scope.clone()));

        tracing::debug!(
            workflow = compiled.name(),
            process = %process.id(),
            scope = %scope.id(),
            "Submitting workflow"
        );
        let outcome = self.dispatch(compiled, process, &scope, policy).await;

        drop(bridge);
        guard.release().await;
        outcome
    }

    /// Like [`submit`](Self::submit), running on the client's runtime.
    pub fn submit_as_task<T: Send + 'static>(
        &self,
        workflow: Cloud<T>,
        cancellation: Option<CancellationToken>,
        policy: FaultPolicy,
    ) -> JoinHandle<anyhow::Result<T>> {
        let client = self.clone();
        self.handle
            .spawn(async move { client.submit(workflow, cancellation, policy).await })
    }

    /// Blocking form of [`submit`](Self::submit).
    ///
    /// Requires a multi-thread runtime: a current-thread runtime's jobs only
    /// progress inside its own `block_on`, so the submission could never
    /// complete. That case fails with [`RuntimeError::InvalidState`] before
    /// anything is allocated.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn run<T: Send + 'static>(
        &self,
        workflow: Cloud<T>,
        cancellation: Option<CancellationToken>,
        policy: FaultPolicy,
    ) -> anyhow::Result<T> {
        if self.handle.runtime_flavor() == RuntimeFlavor::CurrentThread {
            return Err(RuntimeError::InvalidState(
                "blocking submission needs a multi-thread runtime".to_string(),
            )
            .into());
        }
        self.handle
            .block_on(self.submit(workflow, cancellation, policy))
    }

    /// Run `workflow` in the current task without dispatching it.
    ///
    /// The workflow still gets a fresh process and the manager's resources;
    /// its log lines go to the system logger.
    pub async fn run_local<T: Send + 'static>(&self, workflow: Cloud<T>) -> anyhow::Result<T> {
        let compiled = compile(self.compiler.as_ref(), workflow)?;
        let ctx = ExecutionContext::new(
            self.provision(),
            CancellationToken::new(),
            self.manager.resources().clone(),
            Arc::clone(self.manager.system_logger()),
        );
        compiled.run(ctx).await
    }

    fn provision(&self) -> ProcessInfo {
        let store = self.manager.store();
        ProcessInfo::new(
            store.create_unique_directory_path(),
            store.create_unique_container_name(),
            store.create_unique_container_name(),
        )
    }

    async fn dispatch<T: Send + 'static>(
        &self,
        compiled: CompiledWorkflow<T>,
        process: ProcessInfo,
        scope: &CancellationScope,
        policy: FaultPolicy,
    ) -> anyhow::Result<T> {
        let dependencies = self
            .manager
            .assembly_manager()
            .upload(compiled.dependencies())
            .await?;
        let logger = self.manager.job_logger_factory().create(&process);
        let submission = Submission {
            process,
            dependencies,
            scope: scope.clone(),
            policy,
            body: compiled.into_job_body(),
            resources: self.manager.resources().clone(),
            logger,
        };

        let cell = self.manager.state().start_as_cell(submission).await?;
        let value = tokio::select! {
            outcome = cell.await_result() => outcome?,
            () = scope.cancelled() => return Err(RuntimeError::Cancelled.into()),
        };

        value.downcast::<T>().map(|value| *value).map_err(|_| {
            RuntimeError::InvalidState(format!("result is not a {}", any::type_name::<T>())).into()
        })
    }
}
