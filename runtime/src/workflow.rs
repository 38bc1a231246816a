//! Workflows, their execution context and compilation.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use stratus_types::ProcessInfo;
use tokio_util::sync::CancellationToken;

use crate::RuntimeFut;
use crate::assembly::Dependency;
use crate::error::RuntimeError;
use crate::jobs::{ErasedValue, JobBody, JobOutcome};
use crate::logging::LoggerSink;
use crate::resources::ResourceRegistry;

type WorkflowFn<T> = dyn Fn(ExecutionContext) -> RuntimeFut<'static, anyhow::Result<T>> + Send + Sync;

/// What a running workflow sees.
#[derive(Clone)]
pub struct ExecutionContext {
    process: ProcessInfo,
    cancellation: CancellationToken,
    resources: ResourceRegistry,
    logger: Arc<dyn LoggerSink>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("process", &self.process.id())
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    #[must_use]
    pub fn new(
        process: ProcessInfo,
        cancellation: CancellationToken,
        resources: ResourceRegistry,
        logger: Arc<dyn LoggerSink>,
    ) -> Self {
        Self {
            process,
            cancellation,
            resources,
            logger,
        }
    }

    #[must_use]
    pub fn process(&self) -> &ProcessInfo {
        &self.process
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    #[must_use]
    pub fn is_cancellation_requested(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    #[must_use]
    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    pub fn log(&self, line: &str) {
        self.logger.log_line(line);
    }
}

/// A cloud workflow yielding `T`.
pub struct Cloud<T> {
    name: String,
    dependencies: Vec<Dependency>,
    body: Arc<WorkflowFn<T>>,
}

impl<T> Clone for Cloud<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            dependencies: self.dependencies.clone(),
            body: Arc::clone(&self.body),
        }
    }
}

impl<T> fmt::Debug for Cloud<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cloud")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Cloud<T> {
    /// A workflow running `f` on every attempt.
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            body: Arc::new(move |ctx| -> RuntimeFut<'static, anyhow::Result<T>> {
                Box::pin(f(ctx))
            }),
        }
    }

    /// A workflow that yields `value`.
    pub fn value(name: impl Into<String>, value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::new(name, move |_ctx| {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    /// A workflow that fails with `message` on every attempt.
    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        let message: Arc<str> = message.into().into();
        Self::new(name, move |_ctx| {
            let message = Arc::clone(&message);
            async move { Err(anyhow::anyhow!("{message}")) }
        })
    }

    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }
}

/// A workflow whose dependency set has been validated.
pub struct CompiledWorkflow<T> {
    name: String,
    dependencies: Vec<Dependency>,
    body: Arc<WorkflowFn<T>>,
}

impl<T> std::fmt::Debug for CompiledWorkflow<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledWorkflow")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> CompiledWorkflow<T> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Run the workflow in the current task.
    pub async fn run(&self, ctx: ExecutionContext) -> anyhow::Result<T> {
        (self.body)(ctx).await
    }

    /// Erase the result type for dispatch through the job queue.
    #[must_use]
    pub fn into_job_body(self) -> JobBody {
        let body = self.body;
        Arc::new(move |ctx| -> RuntimeFut<'static, JobOutcome> {
            let attempt = body(ctx);
            Box::pin(async move { attempt.await.map(|value| Box::new(value) as ErasedValue) })
        })
    }
}

/// Validates a workflow's code dependencies.
pub trait WorkflowCompiler: Send + Sync {
    /// Returns the dependency set to distribute, deduplicated, in first-seen order.
    fn compile(&self, name: &str, dependencies: &[Dependency]) -> Result<Vec<Dependency>, RuntimeError>;
}

/// Rejects empty names and conflicting versions of the same dependency.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyCompiler;

impl WorkflowCompiler for DependencyCompiler {
    fn compile(&self, name: &str, dependencies: &[Dependency]) -> Result<Vec<Dependency>, RuntimeError> {
        if name.trim().is_empty() {
            return Err(RuntimeError::CompilationError(
                "workflow name must not be empty".to_string(),
            ));
        }

        let mut seen: HashMap<&str, &str> = HashMap::new();
        let mut resolved = Vec::with_capacity(dependencies.len());
        for dependency in dependencies {
            if dependency.name().trim().is_empty() {
                return Err(RuntimeError::CompilationError(format!(
                    "workflow '{name}' has a dependency with an empty name"
                )));
            }
            match seen.get(dependency.name()) {
                Some(version) if *version == dependency.version() => {}
                Some(version) => {
                    return Err(RuntimeError::CompilationError(format!(
                        "workflow '{name}' depends on {} at both {version} and {}",
                        dependency.name(),
                        dependency.version()
                    )));
                }
                None => {
                    seen.insert(dependency.name(), dependency.version());
                    resolved.push(dependency.clone());
                }
            }
        }
        Ok(resolved)
    }
}

/// Compile `workflow` with `compiler`.
pub fn compile<T: Send + 'static>(
    compiler: &dyn WorkflowCompiler,
    workflow: Cloud<T>,
) -> Result<CompiledWorkflow<T>, RuntimeError> {
    let dependencies = compiler.compile(&workflow.name, &workflow.dependencies)?;
    Ok(CompiledWorkflow {
        name: workflow.name,
        dependencies,
        body: workflow.body,
    })
}
