use std::{collections::BTreeSet, num::NonZeroUsize, time::Duration};

use converge_core::{plan::Plan, step::OperationMode, urn::Urn};

/// Settings for one [`Deployment::execute`](crate::Deployment::execute) call.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub mode: OperationMode,
    /// Maximum number of concurrent provider operations. `None` is unbounded.
    pub parallelism: Option<NonZeroUsize>,
    /// Restrict changes to these resources. `None` targets everything.
    pub targets: Option<BTreeSet<Urn>>,
    /// Extend `targets` with everything that (transitively) depends on them.
    pub target_dependents: bool,
    /// Compute steps without calling mutating provider operations or
    /// writing the snapshot, and return the resulting plan.
    pub dry_run: bool,
    /// Constrain execution to a plan produced by an earlier dry run.
    pub plan: Option<Plan>,
    /// Report plan deviations as warnings instead of failing the step.
    pub relax_plan_constraints: bool,
    /// Stop starting new steps after the first failure.
    pub halt_on_error: bool,
    /// Timeout for provider operations when neither the resource nor the
    /// provider specifies one.
    pub default_timeout: Option<Duration>,
    /// Replace these resources even when their inputs are unchanged.
    pub replace: BTreeSet<Urn>,
    /// Fail every step that would change something.
    pub expect_no_changes: bool,
}

impl ExecuteOptions {
    pub fn new(mode: OperationMode) -> Self {
        ExecuteOptions {
            mode,
            ..Default::default()
        }
    }
}
