//! The single writer of the snapshot during a deployment.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use converge_core::{
    resource::ResourceState,
    snapshot::{Manifest, PendingOperation, PluginInfo, Snapshot},
    urn::{StackRef, Urn},
};
use tokio::sync::Mutex;

use crate::{backend::SnapshotBackend, error::EngineError};

/// How a completed step changes the snapshot.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Record the live state of a resource, replacing the previous one.
    Upsert(ResourceState),
    /// Drop the live entry.
    Remove,
    /// Keep the previous live entry as a pending-delete copy and record the
    /// replacement as the live state.
    CreateReplacement(ResourceState),
    /// Drop one pending-delete copy.
    RemoveReplaced,
    /// The provider resource behind the live entry was deleted ahead of its
    /// replacement.
    MarkPendingReplacement,
}

/// Proof that a step registered its intent to change a resource.
#[derive(Debug)]
pub struct MutationHandle {
    urn: Urn,
    operation: Option<PendingOperation>,
}

impl MutationHandle {
    pub fn urn(&self) -> &Urn {
        &self.urn
    }
}

struct Inner {
    snapshot: Snapshot,
    in_flight: BTreeSet<Urn>,
}

/// Serializes all snapshot changes of a deployment.
///
/// Every change is applied to the in-memory snapshot, brought into canonical
/// order, verified and saved, all under one lock. Before a provider call
/// starts, a [`PendingOperation`] is saved, so that an operation whose outcome
/// was never recorded is visible to the next run.
pub struct SnapshotManager {
    inner: Mutex<Inner>,
    backend: Arc<dyn SnapshotBackend>,
    stack: StackRef,
    rank: BTreeMap<Urn, usize>,
    plugins: Vec<PluginInfo>,
    /// Pending operations found in the loaded snapshot.
    interrupted: Vec<PendingOperation>,
}

impl SnapshotManager {
    pub fn new(
        mut snapshot: Snapshot,
        backend: Arc<dyn SnapshotBackend>,
        stack: StackRef,
        rank: BTreeMap<Urn, usize>,
        plugins: Vec<PluginInfo>,
    ) -> Self {
        let interrupted = std::mem::take(&mut snapshot.pending_operations);
        for op in &interrupted {
            tracing::warn!(
                urn = %op.urn,
                kind = ?op.kind,
                id = ?op.id,
                "an earlier deployment was interrupted during this operation; the resource may exist without being tracked"
            );
        }
        SnapshotManager {
            inner: Mutex::new(Inner {
                snapshot,
                in_flight: BTreeSet::new(),
            }),
            backend,
            stack,
            rank,
            plugins,
            interrupted,
        }
    }

    pub fn interrupted_operations(&self) -> &[PendingOperation] {
        &self.interrupted
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.inner.lock().await.snapshot.clone()
    }

    /// Register the intent to change `urn`. With an `operation`, the intent
    /// is persisted before returning.
    pub async fn begin_mutation(
        &self,
        urn: &Urn,
        operation: Option<PendingOperation>,
    ) -> Result<MutationHandle, EngineError> {
        let mut inner = self.inner.lock().await;
        if !inner.in_flight.insert(urn.clone()) {
            return Err(EngineError::ConcurrentMutation(urn.clone()));
        }
        if let Some(op) = &operation {
            inner.snapshot.pending_operations.push(op.clone());
            if let Err(e) = self.save(&mut inner.snapshot).await {
                inner.snapshot.pending_operations.pop();
                inner.in_flight.remove(urn);
                return Err(e);
            }
        }
        Ok(MutationHandle {
            urn: urn.clone(),
            operation,
        })
    }

    /// Apply the outcome of a step and persist the result.
    ///
    /// A change that would break the snapshot's invariants is not applied.
    pub async fn commit(
        &self,
        handle: MutationHandle,
        mutation: Mutation,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        inner.in_flight.remove(&handle.urn);
        let before = inner.snapshot.clone();
        let snapshot = &mut inner.snapshot;

        if let Some(op) = &handle.operation {
            if let Some(i) = snapshot.pending_operations.iter().position(|p| p == op) {
                snapshot.pending_operations.remove(i);
            }
        }
        apply(snapshot, &handle.urn, mutation);
        snapshot.reorder(&self.rank);

        if let Err(e) = snapshot.verify() {
            tracing::error!(urn = %handle.urn, "refusing to record a corrupt snapshot: {}", e);
            inner.snapshot = before;
            return Err(EngineError::SnapshotCorruption(e));
        }
        self.save(&mut inner.snapshot).await
    }

    /// Give up on a mutation: the step failed and nothing changed.
    pub async fn abort(&self, handle: MutationHandle) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        inner.in_flight.remove(&handle.urn);
        if let Some(op) = &handle.operation {
            if let Some(i) = inner.snapshot.pending_operations.iter().position(|p| p == op) {
                inner.snapshot.pending_operations.remove(i);
                return self.save(&mut inner.snapshot).await;
            }
        }
        Ok(())
    }

    /// Save the current snapshot even if no step changed it, dropping the
    /// pending operations of earlier runs.
    pub async fn flush(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;
        self.save(&mut inner.snapshot).await
    }

    async fn save(&self, snapshot: &mut Snapshot) -> Result<(), EngineError> {
        snapshot.manifest = Manifest::now(env!("CARGO_PKG_VERSION"));
        snapshot.manifest.plugins = self.plugins.clone();
        self.backend
            .save(&self.stack, snapshot)
            .await
            .map_err(EngineError::Persistence)
    }
}

fn apply(snapshot: &mut Snapshot, urn: &Urn, mutation: Mutation) {
    match mutation {
        Mutation::Upsert(state) => snapshot.upsert(state),
        Mutation::Remove => {
            snapshot.remove(urn, false);
        }
        Mutation::CreateReplacement(state) => {
            if let Some(old) = snapshot.find_mut(urn) {
                old.delete = true;
            }
            snapshot.resources.push(state);
        }
        Mutation::RemoveReplaced => {
            snapshot.remove(urn, true);
        }
        Mutation::MarkPendingReplacement => {
            if let Some(old) = snapshot.find_mut(urn) {
                old.pending_replacement = true;
            }
        }
    }
}
