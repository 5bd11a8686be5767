//! What a deployment did, step by step.

use std::{collections::BTreeMap, fmt::Display};

use converge_core::{snapshot::PendingOperation, step::StepKind, urn::Urn};

use crate::error::StepError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A step this one waits for did not succeed.
    DependencyFailed(Urn),
    /// The resource is outside the deployment's targets.
    NotTargeted,
    /// An earlier failure stopped the deployment.
    Halted,
    Interrupted,
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::DependencyFailed(urn) => write!(f, "dependency {} did not succeed", urn),
            SkipReason::NotTargeted => write!(f, "not targeted"),
            SkipReason::Halted => write!(f, "halted after an earlier failure"),
            SkipReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Succeeded,
    Failed(StepError),
    Skipped(SkipReason),
    /// Computed by a dry run; nothing was changed.
    Planned,
}

impl StepStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, StepStatus::Failed(_))
    }
}

impl Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed(e) => write!(f, "failed: {}", e),
            StepStatus::Skipped(reason) => write!(f, "skipped: {}", reason),
            StepStatus::Planned => write!(f, "planned"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub urn: Urn,
    pub kind: StepKind,
    pub status: StepStatus,
}

/// The outcome of every step of a deployment, in resource graph order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceChangeSummary {
    pub steps: Vec<StepOutcome>,
    pub warnings: Vec<String>,
    /// Operations a previous run started but never recorded the outcome of.
    /// Their resources may exist without being tracked.
    pub interrupted_operations: Vec<PendingOperation>,
}

impl ResourceChangeSummary {
    /// Number of steps per kind that changed something, or would have in a
    /// dry run.
    pub fn changes(&self) -> BTreeMap<StepKind, usize> {
        let mut r = BTreeMap::new();
        for step in &self.steps {
            if step.kind.is_change()
                && matches!(step.status, StepStatus::Succeeded | StepStatus::Planned)
            {
                *r.entry(step.kind).or_insert(0) += 1;
            }
        }
        r
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| s.status.is_failure())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn was_interrupted(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.status == StepStatus::Skipped(SkipReason::Interrupted))
    }

    /// The outcome of the step of `kind` for `urn`.
    pub fn get(&self, urn: &Urn, kind: StepKind) -> Option<&StepStatus> {
        self.steps
            .iter()
            .find(|s| &s.urn == urn && s.kind == kind)
            .map(|s| &s.status)
    }
}

impl Display for ResourceChangeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for step in &self.steps {
            if step.kind == StepKind::Same && step.status == StepStatus::Succeeded {
                continue;
            }
            writeln!(f, "{:<18} {} ({})", step.kind, step.urn, step.status)?;
        }
        let changes = self.changes();
        if changes.is_empty() {
            write!(f, "no changes")
        } else {
            let parts: Vec<String> = changes
                .iter()
                .map(|(kind, n)| format!("{} {}", n, kind))
                .collect();
            write!(f, "{}", parts.join(", "))
        }
    }
}
