//! The persisted record of all resource states of a stack.
//!
//! Serialized as a single JSON document:
//!
//! ```json
//! {
//!   "_type": "convergeSnapshot",
//!   "version": 1,
//!   "manifest": { "time": "...", "engineVersion": "...", "plugins": [] },
//!   "resources": [ ... ],
//!   "pendingOperations": [ ... ]
//! }
//! ```
//!
//! Version 0 documents lack `version`, `manifest` and `pendingOperations`.
//! They still load; they are written back as the current version.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{resource::ResourceState, urn::Urn};

pub const SNAPSHOT_TYPE: &str = "convergeSnapshot";
pub const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("duplicate resource {0} in snapshot")]
    DuplicateUrn(Urn),
    #[error("resource {urn} refers to {missing}, which does not precede it in the snapshot")]
    MissingDependency { urn: Urn, missing: Urn },
    #[error("snapshot format version {0} is newer than the supported version {CURRENT_VERSION}")]
    UnsupportedVersion(u32),
    #[error("invalid snapshot document: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Fingerprint of what produced a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub engine_version: String,
    #[serde(default)]
    pub plugins: Vec<PluginInfo>,
}
impl Manifest {
    pub fn now(engine_version: impl Into<String>) -> Self {
        Manifest {
            time: Utc::now(),
            engine_version: engine_version.into(),
            plugins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PendingOperationKind {
    Creating,
    Updating,
    Deleting,
    Reading,
    Importing,
}

/// A provider operation that was started but whose outcome has not been
/// recorded. Left behind in the snapshot when the process dies mid-call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub urn: Urn,
    #[serde(rename = "type")]
    pub type_: String,
    pub kind: PendingOperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub manifest: Manifest,
    pub resources: Vec<ResourceState>,
    pub pending_operations: Vec<PendingOperation>,
}

impl Snapshot {
    pub fn new(manifest: Manifest) -> Self {
        Snapshot {
            manifest,
            resources: Vec::new(),
            pending_operations: Vec::new(),
        }
    }

    /// The live (not pending-delete) entry for `urn`.
    pub fn find(&self, urn: &Urn) -> Option<&ResourceState> {
        self.resources.iter().find(|r| &r.urn == urn && !r.delete)
    }

    pub fn find_mut(&mut self, urn: &Urn) -> Option<&mut ResourceState> {
        self.resources.iter_mut().find(|r| &r.urn == urn && !r.delete)
    }

    /// Entries of `urn` that are awaiting deletion.
    pub fn pending_deletes<'a>(&'a self, urn: &'a Urn) -> impl Iterator<Item = &'a ResourceState> {
        self.resources.iter().filter(move |r| &r.urn == urn && r.delete)
    }

    /// Check the structural invariants: at most one live entry per URN, and
    /// every referenced URN precedes its referrer.
    pub fn verify(&self) -> Result<(), SnapshotError> {
        let mut seen = BTreeSet::new();
        let mut live = BTreeSet::new();
        for resource in &self.resources {
            for referenced in resource.referenced_urns() {
                if !seen.contains(&referenced) {
                    return Err(SnapshotError::MissingDependency {
                        urn: resource.urn.clone(),
                        missing: referenced,
                    });
                }
            }
            if !resource.delete && !live.insert(resource.urn.clone()) {
                return Err(SnapshotError::DuplicateUrn(resource.urn.clone()));
            }
            seen.insert(resource.urn.clone());
        }
        Ok(())
    }

    /// Replace the live entry for the state's URN, or add the state if there
    /// is none.
    pub fn upsert(&mut self, state: ResourceState) {
        match self.find_mut(&state.urn) {
            Some(existing) => *existing = state,
            None => self.resources.push(state),
        }
    }

    /// Remove one entry of `urn`: the live one, or a pending-delete one.
    pub fn remove(&mut self, urn: &Urn, pending_delete: bool) -> Option<ResourceState> {
        let i = self
            .resources
            .iter()
            .position(|r| &r.urn == urn && r.delete == pending_delete)?;
        Some(self.resources.remove(i))
    }

    /// Reorder the resources canonically: by `rank` (stable, unranked last),
    /// pending-delete copies before the live entry, then moved as little as
    /// needed for every referenced URN to precede its referrer.
    ///
    /// Because the result only depends on the set of entries and the rank,
    /// the order does not depend on the order in which steps completed.
    pub fn reorder(&mut self, rank: &BTreeMap<Urn, usize>) {
        self.resources.sort_by_key(|r| {
            (
                rank.get(&r.urn).copied().unwrap_or(usize::MAX),
                !r.delete,
            )
        });

        let present: BTreeSet<Urn> = self.resources.iter().map(|r| r.urn.clone()).collect();
        let mut remaining: Vec<ResourceState> = std::mem::take(&mut self.resources);
        let mut placed: BTreeSet<Urn> = BTreeSet::new();
        while !remaining.is_empty() {
            let ready = remaining.iter().position(|r| {
                r.referenced_urns()
                    .iter()
                    .all(|u| placed.contains(u) || !present.contains(u))
            });
            // A cycle cannot be ordered; keep what's left as is and let
            // `verify` report it.
            let i = ready.unwrap_or(0);
            let r = remaining.remove(i);
            placed.insert(r.urn.clone());
            self.resources.push(r);
        }
    }
}

/// The on-disk shape of a snapshot.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotDocument {
    #[serde(rename = "_type", deserialize_with = "type_is_converge_snapshot")]
    type_: String,
    #[serde(default)]
    version: u32,
    #[serde(default)]
    manifest: Manifest,
    #[serde(default)]
    resources: Vec<ResourceState>,
    #[serde(default)]
    pending_operations: Vec<PendingOperation>,
}

fn type_is_converge_snapshot<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == SNAPSHOT_TYPE {
        Ok(s)
    } else {
        Err(serde::de::Error::custom(format!(
            "unexpected _type in snapshot: expected '{}', got '{}'",
            SNAPSHOT_TYPE, s
        )))
    }
}

impl From<&Snapshot> for SnapshotDocument {
    fn from(snapshot: &Snapshot) -> Self {
        SnapshotDocument {
            type_: SNAPSHOT_TYPE.to_string(),
            version: CURRENT_VERSION,
            manifest: snapshot.manifest.clone(),
            resources: snapshot.resources.clone(),
            pending_operations: snapshot.pending_operations.clone(),
        }
    }
}

/// Facade for snapshot backends
pub fn snapshot_to_json(snapshot: &Snapshot) -> Result<String, SnapshotError> {
    serde_json::to_string_pretty(&SnapshotDocument::from(snapshot))
        .map_err(|e| SnapshotError::Invalid(e.to_string()))
}

/// Facade for snapshot backends
pub fn snapshot_from_json(s: &str) -> Result<Snapshot, SnapshotError> {
    let document: SnapshotDocument =
        serde_json::from_str(s).map_err(|e| SnapshotError::Invalid(e.to_string()))?;
    if document.version > CURRENT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(document.version));
    }
    Ok(Snapshot {
        manifest: document.manifest,
        resources: document.resources,
        pending_operations: document.pending_operations,
    })
}
