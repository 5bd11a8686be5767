//! Errors of graph construction, individual steps and whole deployments.

use converge_core::{
    plan::PlanMismatch,
    snapshot::SnapshotError,
    step::StepKind,
    urn::{Urn, UrnError},
};
use converge_resource::client::ProviderCallError;

use crate::control::task_tracker::Cycle;

/// The registrations do not form a valid resource graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("dependency cycle: {0}")]
    Cycle(Cycle<Urn>),
    #[error("resource {0} is registered more than once")]
    DuplicateUrn(Urn),
    #[error("resource {urn} refers to {missing}, which is not registered")]
    UnknownDependency { urn: Urn, missing: Urn },
    #[error("registration of type {type_:?} named {name:?} has no valid URN: {source}")]
    InvalidUrn {
        type_: String,
        name: String,
        source: UrnError,
    },
}

/// Why a single step failed. Other steps carry on unless the deployment is
/// set to halt on the first error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    #[error("resource {urn} is protected; refusing to {kind} it")]
    Protected { urn: Urn, kind: StepKind },
    #[error("{urn} deviates from the plan: {mismatch}")]
    PlanConstraintViolation { urn: Urn, mismatch: PlanMismatch },
    #[error("{urn} can not be deleted while these untargeted resources depend on it: {}", format_urns(.dependents))]
    DependentsRemain { urn: Urn, dependents: Vec<Urn> },
    #[error("no provider is configured for {0}")]
    UnknownProvider(String),
    #[error(transparent)]
    Provider(#[from] ProviderCallError),
    #[error("the provider reports that {0} does not exist")]
    NotFound(Urn),
    #[error("the existing resource {urn} differs from its registration in: {}", .keys.join(", "))]
    ImportMismatch { urn: Urn, keys: Vec<String> },
    #[error("no changes were expected, but {urn} would {kind}")]
    UnexpectedChange { urn: Urn, kind: StepKind },
    #[error("steps depend on each other: {0}")]
    StepCycle(String),
    #[error("could not record the result of the step: {0}")]
    Checkpoint(String),
}

fn format_urns(urns: &[Urn]) -> String {
    urns.iter()
        .map(|u| u.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors that abort a deployment as a whole.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("snapshot corruption: {0}")]
    SnapshotCorruption(#[from] SnapshotError),
    #[error("could not load the snapshot")]
    Load(#[source] anyhow::Error),
    #[error("could not persist the snapshot")]
    Persistence(#[source] anyhow::Error),
    #[error("the registration stream ended without completing")]
    RegistrationIncomplete,
    #[error("resource {0} is already being changed by another step")]
    ConcurrentMutation(Urn),
}
