//! Carrying out steps in dependency order.
//!
//! Each step is a goal of a [`TaskTracker`]. A goal first waits for the goals
//! it depends on, then for a parallelism permit, and then performs its
//! provider calls and snapshot mutations. Goals that do not depend on each
//! other run concurrently.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use converge_core::{
    resource::{PropertyMap, ResourceState},
    snapshot::{PendingOperation, PendingOperationKind},
    step::StepKind,
    urn::Urn,
};
use converge_resource::{
    client::{with_context, CallContext, ProviderClient},
    schema::v0::{CreateRequest, DeleteRequest, DiffRequest, ReadRequest, UpdateRequest},
};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{info_span, Instrument};

use crate::{
    control::{
        task_tracker::{Cycle, TaskContext, TaskTracker, TaskWork},
        thunk::Thunk,
    },
    error::{EngineError, StepError},
    generator::{decide, Step, StepPlan},
    graph::ResourceGraph,
    interrupt::InterruptState,
    options::ExecuteOptions,
    provider::ProviderRegistry,
    snapshot::{Mutation, MutationHandle, SnapshotManager},
    summary::{SkipReason, StepOutcome, StepStatus},
};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Goal {
    /// Every other goal.
    Deployment,
    /// The step of a resource; for a replacement, the creation of the new
    /// resource.
    Step(Urn),
    /// Deleting the replaced half of a create-before-delete replacement.
    DeleteReplaced(Urn),
    /// Deleting pending-delete copies left behind by an earlier deployment.
    Cleanup(Urn),
}

impl Goal {
    fn urn(&self) -> Option<&Urn> {
        match self {
            Goal::Deployment => None,
            Goal::Step(urn) | Goal::DeleteReplaced(urn) | Goal::Cleanup(urn) => Some(urn),
        }
    }
}

impl Display for Goal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Goal::Deployment => write!(f, "deployment"),
            Goal::Step(urn) => write!(f, "step {}", urn),
            Goal::DeleteReplaced(urn) => write!(f, "delete replaced {}", urn),
            Goal::Cleanup(urn) => write!(f, "clean up {}", urn),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn pending(state: &ResourceState, kind: PendingOperationKind) -> PendingOperation {
    PendingOperation {
        urn: state.urn.clone(),
        type_: state.type_.clone(),
        kind,
        id: state.id.clone(),
    }
}

/// Whether deleting the state involves the provider.
fn deletes_at_provider(state: &ResourceState) -> bool {
    state.custom
        && !state.external
        && !state.retain_on_delete
        && !state.pending_replacement
        && state.id.is_some()
}

pub struct ExecutionContext {
    graph: ResourceGraph,
    steps: BTreeMap<Urn, Step>,
    cleanups: BTreeMap<Urn, Step>,
    providers: ProviderRegistry,
    snapshot: Arc<SnapshotManager>,
    options: ExecuteOptions,
    interrupt: InterruptState,
    permits: Option<Semaphore>,
    halted: AtomicBool,
    fatal: Mutex<Option<EngineError>>,
    outcomes: Mutex<Vec<((usize, usize), StepOutcome)>>,
}

impl ExecutionContext {
    pub fn new(
        graph: ResourceGraph,
        plan: StepPlan,
        providers: ProviderRegistry,
        snapshot: Arc<SnapshotManager>,
        options: ExecuteOptions,
        interrupt: InterruptState,
    ) -> Self {
        ExecutionContext {
            graph,
            steps: plan.steps,
            cleanups: plan.cleanups,
            providers,
            snapshot,
            permits: options.parallelism.map(|n| Semaphore::new(n.get())),
            options,
            interrupt,
            halted: AtomicBool::new(false),
            fatal: Mutex::new(None),
            outcomes: Mutex::new(Vec::new()),
        }
    }

    /// Run every goal, returning the step outcomes in graph order.
    pub async fn execute(self) -> Result<Vec<StepOutcome>, EngineError> {
        let context = Arc::new(self);
        let tracker = TaskTracker::new(context.clone());
        tracker.run(Goal::Deployment).await;

        if let Some(e) = lock(&context.fatal).take() {
            return Err(e);
        }
        let mut outcomes = std::mem::take(&mut *lock(&context.outcomes));
        outcomes.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(outcomes.into_iter().map(|(_, o)| o).collect())
    }

    fn is_cbd_replace(&self, urn: &Urn) -> bool {
        self.steps.get(urn).is_some_and(|s| {
            s.kind == StepKind::Replace && !s.delete_before_replace && !s.not_targeted
        })
    }

    fn kind_of(&self, urn: &Urn) -> Option<StepKind> {
        self.steps.get(urn).map(|s| s.kind)
    }

    fn dependencies_of(&self, goal: &Goal) -> BTreeSet<Goal> {
        let mut deps = BTreeSet::new();
        let deleted_dependents = |urn: &Urn| -> Vec<Goal> {
            self.graph
                .old_dependents(urn)
                .into_iter()
                .filter(|d| self.kind_of(d) == Some(StepKind::Delete))
                .map(Goal::Step)
                .collect()
        };
        match goal {
            Goal::Deployment => {}
            Goal::Step(urn) => match self.kind_of(urn) {
                None => {}
                // Deletes wait for every old dependent to let go
                Some(StepKind::Delete) => {
                    for d in self.graph.old_dependents(urn) {
                        if self.is_cbd_replace(&d) {
                            deps.insert(Goal::DeleteReplaced(d.clone()));
                        }
                        deps.insert(Goal::Step(d));
                    }
                    for d in self.graph.pending_dependents(urn) {
                        if &d != urn {
                            deps.insert(Goal::Cleanup(d));
                        }
                    }
                }
                Some(kind) => {
                    deps.extend(self.graph.dependencies(urn).into_iter().map(Goal::Step));
                    if kind == StepKind::Replace && !self.is_cbd_replace(urn) {
                        deps.extend(deleted_dependents(urn));
                    }
                }
            },
            Goal::DeleteReplaced(urn) => {
                deps.insert(Goal::Step(urn.clone()));
                deps.extend(self.graph.new_dependents(urn).into_iter().map(Goal::Step));
                deps.extend(deleted_dependents(urn));
            }
            Goal::Cleanup(urn) => {
                deps.insert(Goal::Step(urn.clone()));
                if self.is_cbd_replace(urn) {
                    deps.insert(Goal::DeleteReplaced(urn.clone()));
                }
                deps.extend(deleted_dependents(urn));
                for d in self.graph.pending_dependents(urn) {
                    if &d != urn {
                        deps.insert(Goal::Cleanup(d));
                    }
                }
            }
        }
        deps
    }

    /// Whether `dependent` may proceed after `dependency` ended with `status`.
    fn satisfies(&self, dependent: &Goal, dependency: &Goal, status: &StepStatus) -> bool {
        // Cleanup of a resource only needs other work on the same resource
        // to be out of the way
        if matches!(dependent, Goal::Cleanup(_)) && dependent.urn() == dependency.urn() {
            return true;
        }
        match status {
            StepStatus::Succeeded | StepStatus::Planned => true,
            StepStatus::Skipped(SkipReason::NotTargeted) => match dependency {
                Goal::Step(urn) => self.steps.get(urn).is_some_and(|s| s.old.is_some()),
                _ => true,
            },
            StepStatus::Failed(_) | StepStatus::Skipped(_) => false,
        }
    }

    async fn await_dependencies(
        &self,
        context: &TaskContext<Self>,
        goal: &Goal,
    ) -> Result<(), StepStatus> {
        for dependency in self.dependencies_of(goal) {
            let status = context
                .require(dependency.clone())
                .await
                .map_err(StepStatus::Failed)?;
            if self.satisfies(goal, &dependency, &status) {
                continue;
            }
            if let Some(urn) = dependency.urn() {
                return Err(StepStatus::Skipped(SkipReason::DependencyFailed(
                    urn.clone(),
                )));
            }
        }
        Ok(())
    }

    fn check_halted(&self) -> Result<(), SkipReason> {
        if self.interrupt.is_interrupted() {
            Err(SkipReason::Interrupted)
        } else if self.halted.load(Ordering::SeqCst) {
            Err(SkipReason::Halted)
        } else {
            Ok(())
        }
    }

    /// Wait for a parallelism permit, unless the deployment stops first.
    async fn admit(&self) -> Result<Option<SemaphorePermit<'_>>, SkipReason> {
        self.check_halted()?;
        let permit = match &self.permits {
            Some(permits) => tokio::select! {
                permit = permits.acquire() => Some(permit.map_err(|_| SkipReason::Halted)?),
                _ = self.interrupt.interrupted() => return Err(SkipReason::Interrupted),
            },
            None => None,
        };
        self.check_halted()?;
        Ok(permit)
    }

    fn record(&self, urn: &Urn, order: usize, kind: StepKind, status: StepStatus) {
        match &status {
            StepStatus::Failed(e) => {
                tracing::error!(urn = %urn, kind = %kind, "step failed: {}", e);
                if self.options.halt_on_error {
                    self.halted.store(true, Ordering::SeqCst);
                }
            }
            StepStatus::Skipped(reason) => {
                tracing::info!(urn = %urn, kind = %kind, "step skipped: {}", reason)
            }
            StepStatus::Succeeded | StepStatus::Planned => {}
        }
        lock(&self.outcomes).push((
            (self.graph.rank_of(urn), order),
            StepOutcome {
                urn: urn.clone(),
                kind,
                status,
            },
        ));
    }

    /// A failure of the snapshot stops the deployment.
    fn fatal(&self, e: EngineError) -> StepStatus {
        let status = StepStatus::Failed(StepError::Checkpoint(e.to_string()));
        self.halted.store(true, Ordering::SeqCst);
        let mut fatal = lock(&self.fatal);
        if fatal.is_none() {
            *fatal = Some(e);
        }
        status
    }

    fn provider(&self, state: &ResourceState) -> Result<Arc<dyn ProviderClient>, StepError> {
        self.providers.resolve(state.provider.as_deref(), &state.type_)
    }

    /// Custom timeout, else the provider's default, else the engine's.
    fn call_context(&self, provider: &dyn ProviderClient, custom: Option<u64>) -> CallContext {
        let timeout = custom
            .map(Duration::from_secs)
            .or_else(|| provider.default_timeout())
            .or(self.options.default_timeout);
        CallContext::new(self.interrupt.token().clone(), timeout)
    }

    async fn begin(
        &self,
        urn: &Urn,
        operation: Option<PendingOperation>,
    ) -> Result<MutationHandle, StepStatus> {
        self.snapshot
            .begin_mutation(urn, operation)
            .await
            .map_err(|e| self.fatal(e))
    }

    async fn commit(&self, handle: MutationHandle, mutation: Mutation) -> StepStatus {
        match self.snapshot.commit(handle, mutation).await {
            Ok(()) => StepStatus::Succeeded,
            Err(e) => self.fatal(e),
        }
    }

    async fn abort(&self, handle: MutationHandle, error: StepError) -> StepStatus {
        match self.snapshot.abort(handle).await {
            Ok(()) => StepStatus::Failed(error),
            Err(e) => self.fatal(e),
        }
    }
}

/// Which part of a resource's work a goal performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Main,
    DeleteReplaced,
    Cleanup,
}

impl Phase {
    fn order(&self) -> usize {
        match self {
            Phase::Main => 0,
            Phase::DeleteReplaced => 2,
            Phase::Cleanup => 3,
        }
    }
}

// perform_* functions should only be called from the work() function
impl ExecutionContext {
    async fn perform_deployment(&self, context: &TaskContext<Self>) -> StepStatus {
        let mut goals: Vec<Goal> = Vec::new();
        for urn in self.steps.keys() {
            goals.push(Goal::Step(urn.clone()));
            if self.is_cbd_replace(urn) {
                goals.push(Goal::DeleteReplaced(urn.clone()));
            }
        }
        goals.extend(self.cleanups.keys().cloned().map(Goal::Cleanup));

        let mut thunks: Vec<Thunk<StepStatus>> = Vec::with_capacity(goals.len());
        for goal in goals {
            match context.spawn(goal.clone()).await {
                Ok(thunk) => thunks.push(thunk),
                Err(e) => tracing::error!(goal = %goal, "could not schedule: {}", e),
            }
        }
        Thunk::force_all(thunks).await;
        StepStatus::Succeeded
    }

    /// The kinds reported for a goal, with their position among the
    /// resource's outcomes.
    fn reported_kinds(step: &Step, phase: Phase) -> Vec<(usize, StepKind)> {
        match (phase, step.kind) {
            (Phase::Main, StepKind::Replace) if step.delete_before_replace => vec![
                (0, StepKind::DeleteReplaced),
                (1, StepKind::CreateReplacement),
            ],
            (Phase::Main, StepKind::Replace) => vec![(1, StepKind::CreateReplacement)],
            (Phase::DeleteReplaced, _) => vec![(phase.order(), StepKind::DeleteReplaced)],
            (phase, kind) => vec![(phase.order(), kind)],
        }
    }

    async fn perform_goal(&self, context: &TaskContext<Self>, goal: &Goal) -> StepStatus {
        let (step, phase) = match goal {
            Goal::Deployment => return self.perform_deployment(context).await,
            Goal::Step(urn) => (self.steps.get(urn), Phase::Main),
            Goal::DeleteReplaced(urn) => (self.steps.get(urn), Phase::DeleteReplaced),
            Goal::Cleanup(urn) => (self.cleanups.get(urn), Phase::Cleanup),
        };
        // Resources without a step need no waiting for
        let Some(step) = step else {
            return StepStatus::Succeeded;
        };
        let kinds = Self::reported_kinds(step, phase);
        let report_all = |status: StepStatus| {
            for (order, kind) in &kinds {
                self.record(&step.urn, *order, *kind, status.clone());
            }
            status
        };

        if let Err(status) = self.await_dependencies(context, goal).await {
            return report_all(status);
        }
        if step.not_targeted {
            return report_all(StepStatus::Skipped(SkipReason::NotTargeted));
        }
        if let Err(reason) = self.check_halted() {
            return report_all(StepStatus::Skipped(reason));
        }
        if let Some(e) = &step.rejection {
            return report_all(StepStatus::Failed(e.clone()));
        }
        if self.options.dry_run {
            return report_all(if step.kind == StepKind::Same {
                StepStatus::Succeeded
            } else {
                StepStatus::Planned
            });
        }

        let permit = match self.admit().await {
            Ok(permit) => permit,
            Err(reason) => return report_all(StepStatus::Skipped(reason)),
        };
        let results = match phase {
            Phase::Main => self.perform_main(step).await,
            Phase::DeleteReplaced => match &step.old {
                Some(old) => vec![self.perform_delete(old, Mutation::RemoveReplaced).await],
                None => vec![StepStatus::Succeeded],
            },
            Phase::Cleanup => vec![self.perform_cleanup(step).await],
        };
        drop(permit);

        let mut goal_status = StepStatus::Succeeded;
        for ((order, kind), status) in kinds.iter().zip(results) {
            if goal_status == StepStatus::Succeeded {
                goal_status = status.clone();
            }
            self.record(&step.urn, *order, *kind, status);
        }
        goal_status
    }

    /// One status per reported kind.
    async fn perform_main(&self, step: &Step) -> Vec<StepStatus> {
        tracing::info!(kind = %step.kind, "performing");
        match step.kind {
            StepKind::Same => vec![self.perform_same(step).await],
            StepKind::Create | StepKind::CreateReplacement => {
                vec![self.perform_create(step, false).await]
            }
            StepKind::Update => vec![self.perform_update(step).await],
            StepKind::Delete | StepKind::DeleteReplaced => match &step.old {
                Some(old) => vec![self.perform_delete(old, Mutation::Remove).await],
                None => vec![StepStatus::Succeeded],
            },
            StepKind::Replace if step.delete_before_replace => {
                let deleted = match &step.old {
                    Some(old) => self.perform_delete(old, Mutation::MarkPendingReplacement).await,
                    None => StepStatus::Succeeded,
                };
                if deleted != StepStatus::Succeeded {
                    let skipped =
                        StepStatus::Skipped(SkipReason::DependencyFailed(step.urn.clone()));
                    return vec![deleted, skipped];
                }
                vec![deleted, self.perform_create(step, false).await]
            }
            StepKind::Replace => vec![self.perform_create(step, true).await],
            StepKind::Read => vec![self.perform_read(step).await],
            StepKind::Refresh => vec![self.perform_refresh(step).await],
            StepKind::Import => vec![self.perform_import(step).await],
        }
    }

    async fn perform_same(&self, step: &Step) -> StepStatus {
        match (&step.old, &step.new) {
            // New bookkeeping, such as dependencies, without provider calls
            (Some(old), Some(new)) if old != new => match self.begin(&step.urn, None).await {
                Ok(handle) => self.commit(handle, Mutation::Upsert(new.clone())).await,
                Err(status) => status,
            },
            _ => StepStatus::Succeeded,
        }
    }

    async fn perform_create(&self, step: &Step, replacement: bool) -> StepStatus {
        let Some(new) = &step.new else {
            return StepStatus::Succeeded;
        };
        let mut state = new.clone();
        state.pending_replacement = false;
        let mutation = |state: ResourceState| {
            if replacement {
                Mutation::CreateReplacement(state)
            } else {
                Mutation::Upsert(state)
            }
        };

        if !new.custom {
            return match self.begin(&step.urn, None).await {
                Ok(handle) => self.commit(handle, mutation(state)).await,
                Err(status) => status,
            };
        }

        let provider = match self.provider(new) {
            Ok(p) => p,
            Err(e) => return StepStatus::Failed(e),
        };
        let handle = match self
            .begin(&step.urn, Some(pending(new, PendingOperationKind::Creating)))
            .await
        {
            Ok(handle) => handle,
            Err(status) => return status,
        };
        let context = self.call_context(provider.as_ref(), new.custom_timeouts.create);
        let request = CreateRequest {
            urn: step.urn.clone(),
            type_: new.type_.clone(),
            inputs: new.inputs.clone(),
        };
        match with_context(&context, provider.create(&context, request)).await {
            Ok(response) => {
                tracing::info!(id = %response.id, "created");
                state.id = Some(response.id);
                state.outputs = response.outputs;
                self.commit(handle, mutation(state)).await
            }
            Err(e) => self.abort(handle, e.into()).await,
        }
    }

    async fn perform_update(&self, step: &Step) -> StepStatus {
        let (Some(old), Some(new)) = (&step.old, &step.new) else {
            return StepStatus::Succeeded;
        };
        let mut state = new.clone();

        if !new.custom {
            return match self.begin(&step.urn, None).await {
                Ok(handle) => self.commit(handle, Mutation::Upsert(state)).await,
                Err(status) => status,
            };
        }

        let provider = match self.provider(new) {
            Ok(p) => p,
            Err(e) => return StepStatus::Failed(e),
        };
        let handle = match self
            .begin(&step.urn, Some(pending(old, PendingOperationKind::Updating)))
            .await
        {
            Ok(handle) => handle,
            Err(status) => return status,
        };
        let context = self.call_context(provider.as_ref(), new.custom_timeouts.update);
        let request = UpdateRequest {
            urn: step.urn.clone(),
            type_: new.type_.clone(),
            id: old.id.clone().unwrap_or_default(),
            old_inputs: old.inputs.clone(),
            new_inputs: new.inputs.clone(),
            old_outputs: old.outputs.clone(),
        };
        match with_context(&context, provider.update(&context, request)).await {
            Ok(response) => {
                state.id = old.id.clone();
                state.outputs = response.outputs;
                self.commit(handle, Mutation::Upsert(state)).await
            }
            Err(e) => self.abort(handle, e.into()).await,
        }
    }

    async fn perform_delete(&self, old: &ResourceState, mutation: Mutation) -> StepStatus {
        if !deletes_at_provider(old) {
            if old.retain_on_delete {
                tracing::info!("retaining the resource; only forgetting it");
            }
            return match self.begin(&old.urn, None).await {
                Ok(handle) => self.commit(handle, mutation).await,
                Err(status) => status,
            };
        }

        let provider = match self.provider(old) {
            Ok(p) => p,
            Err(e) => return StepStatus::Failed(e),
        };
        let handle = match self
            .begin(&old.urn, Some(pending(old, PendingOperationKind::Deleting)))
            .await
        {
            Ok(handle) => handle,
            Err(status) => return status,
        };
        let context = self.call_context(provider.as_ref(), old.custom_timeouts.delete);
        let request = DeleteRequest {
            urn: old.urn.clone(),
            type_: old.type_.clone(),
            id: old.id.clone().unwrap_or_default(),
            inputs: old.inputs.clone(),
            outputs: old.outputs.clone(),
        };
        match with_context(&context, provider.delete(&context, request)).await {
            Ok(_) => self.commit(handle, mutation).await,
            Err(e) => self.abort(handle, e.into()).await,
        }
    }

    async fn perform_cleanup(&self, step: &Step) -> StepStatus {
        for copy in &step.pending {
            let status = self.perform_delete(copy, Mutation::RemoveReplaced).await;
            if status != StepStatus::Succeeded {
                return status;
            }
        }
        StepStatus::Succeeded
    }

    /// Read a resource by ID. Returns the handle of the started mutation.
    async fn read_by_id(
        &self,
        state: &ResourceState,
        id: String,
        known: bool,
        kind: PendingOperationKind,
    ) -> Result<
        (
            MutationHandle,
            Arc<dyn ProviderClient>,
            Option<(PropertyMap, PropertyMap)>,
        ),
        StepStatus,
    > {
        let provider = self.provider(state).map_err(StepStatus::Failed)?;
        let mut operation = pending(state, kind);
        operation.id = Some(id.clone());
        let handle = self.begin(&state.urn, Some(operation)).await?;
        let context = self.call_context(provider.as_ref(), None);
        let request = ReadRequest {
            urn: state.urn.clone(),
            type_: state.type_.clone(),
            id,
            inputs: known.then(|| state.inputs.clone()),
            outputs: known.then(|| state.outputs.clone()),
        };
        match with_context(&context, provider.read(&context, request)).await {
            Ok(response) => Ok((
                handle,
                provider,
                response.resource.map(|r| (r.inputs, r.outputs)),
            )),
            Err(e) => Err(self.abort(handle, e.into()).await),
        }
    }

    async fn perform_read(&self, step: &Step) -> StepStatus {
        let Some(new) = &step.new else {
            return StepStatus::Succeeded;
        };
        let id = new.id.clone().unwrap_or_default();
        match self
            .read_by_id(new, id, false, PendingOperationKind::Reading)
            .await
        {
            Ok((handle, _, Some((inputs, outputs)))) => {
                let mut state = new.clone();
                state.inputs = inputs;
                state.outputs = outputs;
                self.commit(handle, Mutation::Upsert(state)).await
            }
            Ok((handle, _, None)) => {
                self.abort(handle, StepError::NotFound(step.urn.clone()))
                    .await
            }
            Err(status) => status,
        }
    }

    async fn perform_refresh(&self, step: &Step) -> StepStatus {
        let Some(old) = &step.old else {
            return StepStatus::Succeeded;
        };
        let Some(id) = old.id.clone().filter(|_| old.custom) else {
            return StepStatus::Succeeded;
        };
        match self
            .read_by_id(old, id, !old.external, PendingOperationKind::Reading)
            .await
        {
            Ok((handle, _, Some((inputs, outputs)))) => {
                let mut state = old.clone();
                state.inputs = inputs;
                state.outputs = outputs;
                self.commit(handle, Mutation::Upsert(state)).await
            }
            Ok((handle, _, None)) => {
                let dependents: Vec<Urn> =
                    self.graph.old_dependents(&step.urn).into_iter().collect();
                if !dependents.is_empty() {
                    return self
                        .abort(
                            handle,
                            StepError::DependentsRemain {
                                urn: step.urn.clone(),
                                dependents,
                            },
                        )
                        .await;
                }
                tracing::info!("the resource no longer exists; forgetting it");
                self.commit(handle, Mutation::Remove).await
            }
            Err(status) => status,
        }
    }

    /// Adopt an existing resource, provided it matches its registration.
    async fn perform_import(&self, step: &Step) -> StepStatus {
        let Some(new) = &step.new else {
            return StepStatus::Succeeded;
        };
        let id = new.id.clone().unwrap_or_default();
        let (handle, provider, found) = match self
            .read_by_id(new, id.clone(), false, PendingOperationKind::Importing)
            .await
        {
            Ok(r) => r,
            Err(status) => return status,
        };
        let Some((inputs, outputs)) = found else {
            return self
                .abort(handle, StepError::NotFound(step.urn.clone()))
                .await;
        };

        // Only what the registration specifies has to match
        let actual: PropertyMap = inputs
            .into_iter()
            .filter(|(k, _)| new.inputs.contains_key(k))
            .collect();
        let context = self.call_context(provider.as_ref(), None);
        let request = DiffRequest {
            urn: step.urn.clone(),
            type_: new.type_.clone(),
            id,
            old_inputs: actual.clone(),
            new_inputs: new.inputs.clone(),
            old_outputs: outputs.clone(),
        };
        let diff = match with_context(&context, provider.diff(&context, request)).await {
            Ok(diff) => diff,
            Err(e) => return self.abort(handle, e.into()).await,
        };
        let (kind, keys, _) = decide(&diff, &actual, &new.inputs, &BTreeSet::new(), false);
        if kind != StepKind::Same {
            return self
                .abort(
                    handle,
                    StepError::ImportMismatch {
                        urn: step.urn.clone(),
                        keys,
                    },
                )
                .await;
        }
        let mut state = new.clone();
        state.outputs = outputs;
        self.commit(handle, Mutation::Upsert(state)).await
    }
}

#[async_trait]
impl TaskWork for ExecutionContext {
    type Output = StepStatus;
    type Key = Goal;
    type CycleError = StepError;

    async fn work(&self, context: TaskContext<Self>, goal: Goal) -> StepStatus {
        match goal.urn() {
            Some(urn) => {
                let span = info_span!("goal", goal = %goal, resource = %urn);
                self.perform_goal(&context, &goal).instrument(span).await
            }
            None => self.perform_goal(&context, &goal).await,
        }
    }

    fn cycle_error(&self, cycle: Cycle<Self::Key>) -> Self::CycleError {
        StepError::StepCycle(cycle.to_string())
    }
}
