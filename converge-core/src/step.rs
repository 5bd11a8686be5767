use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// The kind of an atomic unit of work against a single resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepKind {
    /// Nothing to do; the resource already has the desired state.
    Same,
    Create,
    Update,
    Delete,
    /// A replacement, carried out as a `CreateReplacement` and a
    /// `DeleteReplaced`.
    Replace,
    CreateReplacement,
    DeleteReplaced,
    /// Read an external resource that is not managed by this stack.
    Read,
    /// Re-read a managed resource and record what the provider reports.
    Refresh,
    /// Adopt an existing resource into the stack.
    Import,
}

impl StepKind {
    /// Whether executing a step of this kind may call the provider and
    /// therefore changes or observes the outside world.
    pub fn is_provider_operation(&self) -> bool {
        !matches!(self, StepKind::Same)
    }

    /// Whether the step changes infrastructure (as opposed to just observing it).
    pub fn is_change(&self) -> bool {
        !matches!(self, StepKind::Same | StepKind::Read | StepKind::Refresh)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Same => "same",
            StepKind::Create => "create",
            StepKind::Update => "update",
            StepKind::Delete => "delete",
            StepKind::Replace => "replace",
            StepKind::CreateReplacement => "create-replacement",
            StepKind::DeleteReplaced => "delete-replaced",
            StepKind::Read => "read",
            StepKind::Refresh => "refresh",
            StepKind::Import => "import",
        }
    }
}

impl Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which operation a deployment performs. Each mode restricts the step kinds
/// that may be generated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationMode {
    #[default]
    Update,
    Refresh,
    Destroy,
    Import,
}

impl OperationMode {
    pub fn allows(&self, kind: StepKind) -> bool {
        use StepKind::*;
        match self {
            OperationMode::Update => !matches!(kind, Refresh),
            OperationMode::Refresh => matches!(kind, Same | Refresh),
            OperationMode::Destroy => matches!(kind, Same | Delete),
            OperationMode::Import => matches!(kind, Same | Import),
        }
    }
}

impl Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationMode::Update => write!(f, "update"),
            OperationMode::Refresh => write!(f, "refresh"),
            OperationMode::Destroy => write!(f, "destroy"),
            OperationMode::Import => write!(f, "import"),
        }
    }
}
