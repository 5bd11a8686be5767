//! The converge engine.
//!
//! A [`Deployment`] takes the resources a program registers, compares them
//! with the stack's last [snapshot](converge_core::snapshot::Snapshot), and
//! carries out the resulting steps through the providers, recording every
//! outcome as it happens.

pub mod backend;
pub mod control;
pub mod error;
pub mod executor;
pub mod generator;
pub mod graph;
pub mod interrupt;
pub mod options;
pub mod provider;
pub mod registration;
pub mod snapshot;
pub mod summary;

#[cfg(test)]
mod deployment_tests;
#[cfg(test)]
mod test_support;

use std::sync::Arc;

use converge_core::{
    plan::Plan,
    resource::ResourceRegistration,
    step::OperationMode,
    urn::StackRef,
};
use tokio::sync::mpsc;

use crate::{
    backend::SnapshotBackend,
    error::EngineError,
    executor::ExecutionContext,
    generator::StepGenerator,
    graph::ResourceGraph,
    interrupt::InterruptState,
    options::ExecuteOptions,
    provider::ProviderRegistry,
    registration::{collect_registrations, RegistrationEvent},
    snapshot::SnapshotManager,
    summary::ResourceChangeSummary,
};

/// The result of [`Deployment::execute`].
#[derive(Debug, Clone)]
pub struct Execution {
    pub summary: ResourceChangeSummary,
    /// The plan computed by a dry run.
    pub plan: Option<Plan>,
}

/// Everything needed to deploy one stack.
pub struct Deployment {
    stack: StackRef,
    backend: Arc<dyn SnapshotBackend>,
    providers: ProviderRegistry,
    interrupt: InterruptState,
}

impl Deployment {
    pub fn new(
        stack: StackRef,
        backend: Arc<dyn SnapshotBackend>,
        providers: ProviderRegistry,
    ) -> Self {
        Deployment {
            stack,
            backend,
            providers,
            interrupt: InterruptState::new(),
        }
    }

    pub fn with_interrupt(mut self, interrupt: InterruptState) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn stack(&self) -> &StackRef {
        &self.stack
    }

    pub fn interrupt(&self) -> &InterruptState {
        &self.interrupt
    }

    /// Converge the stack towards `registrations`.
    ///
    /// Failing steps do not make this return an error; they are reported in
    /// the summary. Errors are reserved for problems with the deployment as
    /// a whole, such as an invalid graph or a snapshot that can not be
    /// written.
    pub async fn execute(
        &self,
        registrations: Vec<ResourceRegistration>,
        options: &ExecuteOptions,
    ) -> Result<Execution, EngineError> {
        tracing::info!(stack = %self.stack, mode = %options.mode, dry_run = options.dry_run, "starting deployment");

        let snapshot = self
            .backend
            .load(&self.stack)
            .await
            .map_err(EngineError::Load)?
            .unwrap_or_default();
        snapshot.verify()?;

        let registrations = match options.mode {
            // Everything goes, whatever the program says
            OperationMode::Destroy => Vec::new(),
            _ => registrations,
        };
        let graph = ResourceGraph::build(&self.stack, &registrations, &snapshot)?;

        let steps = StepGenerator::new(&graph, &self.providers, options, &self.interrupt)
            .generate()
            .await;
        let plan = options.dry_run.then(|| steps.to_plan());
        let warnings = steps.warnings.clone();

        let manager = Arc::new(SnapshotManager::new(
            snapshot,
            self.backend.clone(),
            self.stack.clone(),
            graph.rank(),
            self.providers.infos(),
        ));
        let interrupted_operations = manager.interrupted_operations().to_vec();

        let outcomes = ExecutionContext::new(
            graph,
            steps,
            self.providers.clone(),
            manager.clone(),
            options.clone(),
            self.interrupt.clone(),
        )
        .execute()
        .await?;

        if !options.dry_run && !interrupted_operations.is_empty() {
            manager.flush().await?;
        }

        let summary = ResourceChangeSummary {
            steps: outcomes,
            warnings,
            interrupted_operations,
        };
        if summary.is_success() {
            tracing::info!("deployment finished");
        } else {
            tracing::warn!(
                failures = summary.failures().count(),
                "deployment finished with failures"
            );
        }
        Ok(Execution { summary, plan })
    }

    /// Like [`Deployment::execute`], with registrations arriving as the
    /// program runs.
    pub async fn execute_stream(
        &self,
        events: mpsc::Receiver<RegistrationEvent>,
        options: &ExecuteOptions,
    ) -> Result<Execution, EngineError> {
        let registrations = collect_registrations(events).await?;
        self.execute(registrations, options).await
    }
}
