//! Deciding what to do with each resource.
//!
//! A [`StepGenerator`] compares the desired state of every node in the
//! [`ResourceGraph`] with its prior state. Diffs of independent resources are
//! requested from providers concurrently. Decisions that need the whole
//! picture, such as targeted deletes and plan constraints, are applied once
//! all steps are known.

use std::collections::{BTreeMap, BTreeSet};

use converge_core::{
    plan::{Plan, ResourcePlan},
    resource::{PropertyMap, ResourceState},
    snapshot::Manifest,
    step::{OperationMode, StepKind},
    urn::Urn,
};
use converge_resource::{
    client::{with_context, CallContext},
    schema::v0::{DiffChanges, DiffRequest, DiffResponse, PropertyDiffKind},
};
use futures_util::{stream, StreamExt};

use crate::{
    error::StepError,
    graph::{Node, ResourceGraph},
    interrupt::InterruptState,
    options::ExecuteOptions,
    provider::ProviderRegistry,
};

/// The unit of work for one resource.
#[derive(Debug, Clone)]
pub struct Step {
    pub urn: Urn,
    pub kind: StepKind,
    /// The live prior state.
    pub old: Option<ResourceState>,
    /// The state to record, before the provider fills in identity and
    /// outputs.
    pub new: Option<ResourceState>,
    /// Pending-delete copies that this step removes.
    pub pending: Vec<ResourceState>,
    /// Top-level input keys that differ.
    pub changed_keys: Vec<String>,
    pub delete_before_replace: bool,
    /// Outside the targets; executing the step leaves the resource alone.
    pub not_targeted: bool,
    /// Fails the step without executing it.
    pub rejection: Option<StepError>,
}

impl Step {
    fn new(urn: Urn, kind: StepKind) -> Self {
        Step {
            urn,
            kind,
            old: None,
            new: None,
            pending: Vec::new(),
            changed_keys: Vec::new(),
            delete_before_replace: false,
            not_targeted: false,
            rejection: None,
        }
    }

    fn with_old(mut self, old: &ResourceState) -> Self {
        self.old = Some(old.clone());
        self
    }

    fn with_new(mut self, new: ResourceState) -> Self {
        self.new = Some(new);
        self
    }

    fn rejected(mut self, error: StepError) -> Self {
        self.rejection = Some(error);
        self
    }

    pub fn resource_plan(&self) -> ResourcePlan {
        ResourcePlan::new(
            self.kind,
            self.old.as_ref().map(|s| &s.inputs),
            self.new.as_ref().map(|s| &s.inputs),
            self.changed_keys.iter().cloned(),
        )
    }
}

/// All steps of a deployment.
#[derive(Debug, Default)]
pub struct StepPlan {
    /// At most one per resource.
    pub steps: BTreeMap<Urn, Step>,
    /// Removal of pending-delete copies left behind by earlier runs.
    pub cleanups: BTreeMap<Urn, Step>,
    pub warnings: Vec<String>,
}

impl StepPlan {
    /// The plan that a later deployment can be held to.
    pub fn to_plan(&self) -> Plan {
        let mut plan = Plan::new(Manifest::now(env!("CARGO_PKG_VERSION")));
        for (urn, step) in &self.steps {
            if !step.not_targeted {
                plan.resources.insert(urn.clone(), step.resource_plan());
            }
        }
        plan
    }
}

pub struct StepGenerator<'a> {
    graph: &'a ResourceGraph,
    providers: &'a ProviderRegistry,
    options: &'a ExecuteOptions,
    interrupt: &'a InterruptState,
    targets: Option<BTreeSet<Urn>>,
}

impl<'a> StepGenerator<'a> {
    pub fn new(
        graph: &'a ResourceGraph,
        providers: &'a ProviderRegistry,
        options: &'a ExecuteOptions,
        interrupt: &'a InterruptState,
    ) -> Self {
        let targets = options.targets.as_ref().map(|targets| {
            if options.target_dependents {
                graph.with_dependents(targets, options.mode != OperationMode::Destroy)
            } else {
                targets.clone()
            }
        });
        StepGenerator {
            graph,
            providers,
            options,
            interrupt,
            targets,
        }
    }

    fn is_targeted(&self, urn: &Urn) -> bool {
        self.targets.as_ref().map_or(true, |t| t.contains(urn))
    }

    pub async fn generate(&self) -> StepPlan {
        let nodes = self.graph.nodes();
        let limit = self
            .options
            .parallelism
            .map_or(nodes.len().max(1), |n| n.get());
        let generated: Vec<(Option<Step>, Option<Step>)> = stream::iter(nodes)
            .map(|node| async move {
                let targeted = self.is_targeted(&node.urn);
                (
                    self.main_step(node, targeted).await,
                    self.cleanup_step(node, targeted),
                )
            })
            .buffered(limit)
            .collect()
            .await;

        let mut plan = StepPlan::default();
        for (main, cleanup) in generated {
            if let Some(step) = main {
                debug_assert!(self.options.mode.allows(step.kind));
                plan.steps.insert(step.urn.clone(), step);
            }
            if let Some(step) = cleanup {
                plan.cleanups.insert(step.urn.clone(), step);
            }
        }
        self.reject_stranding_deletes(&mut plan);
        self.check_plan(&mut plan);
        if self.options.expect_no_changes {
            reject_changes(&mut plan);
        }
        plan
    }

    async fn main_step(&self, node: &Node, targeted: bool) -> Option<Step> {
        let urn = node.urn.clone();
        if !targeted {
            return self.untargeted_step(node);
        }
        match self.options.mode {
            OperationMode::Destroy => node.old.as_ref().map(|old| delete_step(old)),
            OperationMode::Refresh => node
                .old
                .as_ref()
                .map(|old| Step::new(urn, StepKind::Refresh).with_old(old)),
            OperationMode::Import => match (&node.old, &node.new) {
                (Some(old), _) => Some(Step::new(urn, StepKind::Same).with_old(old).with_new(old.clone())),
                (None, Some(new)) if new.import_id.is_some() => Some(creation_step(node, new)),
                _ => None,
            },
            OperationMode::Update => match (&node.old, &node.new) {
                (None, None) => None,
                (Some(old), None) => Some(delete_step(old)),
                (None, Some(new)) => Some(creation_step(node, new)),
                (Some(old), Some(new)) => Some(self.diff_step(old, new, node).await),
            },
        }
    }

    /// Untargeted resources keep their prior state. Without one, the step is
    /// still reported, so that dependents know it is missing.
    fn untargeted_step(&self, node: &Node) -> Option<Step> {
        let mut step = match (&node.old, &node.new) {
            (Some(old), _) => Step::new(node.urn.clone(), StepKind::Same)
                .with_old(old)
                .with_new(old.clone()),
            (None, Some(new)) if self.options.mode == OperationMode::Update => {
                creation_step(node, new)
            }
            _ => return None,
        };
        step.not_targeted = true;
        Some(step)
    }

    fn cleanup_step(&self, node: &Node, targeted: bool) -> Option<Step> {
        if node.pending_deletes.is_empty() {
            return None;
        }
        let kind = match self.options.mode {
            OperationMode::Update => StepKind::DeleteReplaced,
            OperationMode::Destroy => StepKind::Delete,
            _ => return None,
        };
        let mut step = Step::new(node.urn.clone(), kind);
        step.pending = node.pending_deletes.clone();
        step.not_targeted = !targeted;
        Some(step)
    }

    async fn diff_step(&self, old: &ResourceState, desired: &ResourceState, node: &Node) -> Step {
        let urn = node.urn.clone();
        let registration = node.registration.as_ref();

        // External resources are re-read every time
        if desired.external {
            return creation_step(node, desired).with_old(old);
        }
        // The provider resource is gone; only the record is left
        if old.pending_replacement || old.external {
            return creation_step(node, desired).with_old(old);
        }

        let ignore_changes = registration.map(|r| r.ignore_changes.as_slice()).unwrap_or(&[]);
        let mut new = desired.clone();
        new.inputs = apply_ignore_changes(&old.inputs, &desired.inputs, ignore_changes);
        new.id = old.id.clone();
        new.outputs = old.outputs.clone();

        if !desired.custom {
            let changed_keys = changed_keys(&old.inputs, &new.inputs);
            let kind = if changed_keys.is_empty() && !old.metadata_differs(&new) {
                StepKind::Same
            } else {
                StepKind::Update
            };
            let mut step = Step::new(urn, kind).with_old(old).with_new(new);
            step.changed_keys = changed_keys;
            return step;
        }

        let replace_on_changes: BTreeSet<&str> = registration
            .map(|r| r.replace_on_changes.iter().map(|s| s.as_str()).collect())
            .unwrap_or_default();
        let delete_before_replace = registration.is_some_and(|r| r.delete_before_replace);

        let (kind, changed, provider_dbr) = if old.type_ != new.type_ || old.provider != new.provider {
            (StepKind::Replace, changed_keys(&old.inputs, &new.inputs), false)
        } else {
            let diff = match self.diff(old, &new).await {
                Ok(diff) => diff,
                Err(e) => {
                    return Step::new(urn, StepKind::Update)
                        .with_old(old)
                        .with_new(new)
                        .rejected(e)
                }
            };
            let force_replace = self.options.replace.contains(&urn);
            decide(&diff, &old.inputs, &new.inputs, &replace_on_changes, force_replace)
        };

        let mut step = Step::new(urn.clone(), kind).with_old(old);
        step.changed_keys = changed;
        step.delete_before_replace = delete_before_replace || provider_dbr;
        if kind == StepKind::Replace {
            new.id = None;
            new.outputs = PropertyMap::new();
            if old.protect {
                step = step.rejected(StepError::Protected {
                    urn,
                    kind: StepKind::Replace,
                });
            }
        }
        step.with_new(new)
    }

    async fn diff(&self, old: &ResourceState, new: &ResourceState) -> Result<DiffResponse, StepError> {
        let provider = self.providers.resolve(new.provider.as_deref(), &new.type_)?;
        let context = CallContext::new(
            self.interrupt.token().clone(),
            provider.default_timeout().or(self.options.default_timeout),
        );
        let request = DiffRequest {
            urn: new.urn.clone(),
            type_: new.type_.clone(),
            id: old.id.clone().unwrap_or_default(),
            old_inputs: old.inputs.clone(),
            new_inputs: new.inputs.clone(),
            old_outputs: old.outputs.clone(),
        };
        tracing::debug!(urn = %new.urn, "diffing");
        Ok(with_context(&context, provider.diff(&context, request)).await?)
    }

    /// A targeted delete must not leave untargeted resources pointing at
    /// nothing.
    fn reject_stranding_deletes(&self, plan: &mut StepPlan) {
        let mut stranding = Vec::new();
        for (urn, step) in &plan.steps {
            if step.kind != StepKind::Delete || step.not_targeted || step.rejection.is_some() {
                continue;
            }
            let dependents: Vec<Urn> = self
                .graph
                .old_dependents(urn)
                .into_iter()
                .filter(|d| plan.steps.get(d).is_some_and(|s| s.not_targeted))
                .collect();
            if !dependents.is_empty() {
                stranding.push((urn.clone(), dependents));
            }
        }
        for (urn, dependents) in stranding {
            if let Some(step) = plan.steps.get_mut(&urn) {
                step.rejection = Some(StepError::DependentsRemain { urn, dependents });
            }
        }
    }

    fn check_plan(&self, plan: &mut StepPlan) {
        let Some(constraints) = &self.options.plan else {
            return;
        };
        for (urn, step) in plan.steps.iter_mut() {
            if step.not_targeted || step.rejection.is_some() {
                continue;
            }
            if let Err(mismatch) = constraints.check(urn, &step.resource_plan()) {
                if self.options.relax_plan_constraints {
                    tracing::warn!(urn = %urn, "deviating from the plan: {}", mismatch);
                    plan.warnings
                        .push(format!("{} deviates from the plan: {}", urn, mismatch));
                } else {
                    step.rejection = Some(StepError::PlanConstraintViolation {
                        urn: urn.clone(),
                        mismatch,
                    });
                }
            }
        }
    }
}

/// Fail every targeted step that would change something.
fn reject_changes(plan: &mut StepPlan) {
    for step in plan.steps.values_mut().chain(plan.cleanups.values_mut()) {
        if step.not_targeted || step.rejection.is_some() || !step.kind.is_change() {
            continue;
        }
        step.rejection = Some(StepError::UnexpectedChange {
            urn: step.urn.clone(),
            kind: step.kind,
        });
    }
}

/// How a registered resource without a prior state comes to exist.
fn creation_step(node: &Node, new: &ResourceState) -> Step {
    let mut new = new.clone();
    let kind = if new.external {
        new.id = node.registration.as_ref().and_then(|r| r.read_id.clone());
        StepKind::Read
    } else if new.import_id.is_some() {
        new.id = new.import_id.clone();
        StepKind::Import
    } else {
        StepKind::Create
    };
    Step::new(new.urn.clone(), kind).with_new(new)
}

fn delete_step(old: &ResourceState) -> Step {
    let step = Step::new(old.urn.clone(), StepKind::Delete).with_old(old);
    if old.protect {
        let urn = old.urn.clone();
        step.rejected(StepError::Protected {
            urn,
            kind: StepKind::Delete,
        })
    } else {
        step
    }
}

/// Ignored keys keep their prior value, or stay absent.
fn apply_ignore_changes(old: &PropertyMap, new: &PropertyMap, ignore: &[String]) -> PropertyMap {
    let mut merged = new.clone();
    for key in ignore {
        match old.get(key) {
            Some(value) => {
                merged.insert(key.clone(), value.clone());
            }
            None => {
                merged.remove(key);
            }
        }
    }
    merged
}

fn changed_keys(old: &PropertyMap, new: &PropertyMap) -> Vec<String> {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    keys.into_iter()
        .filter(|k| old.get(*k) != new.get(*k))
        .cloned()
        .collect()
}

/// Kind, changed keys and whether the provider asks for delete-before-replace.
///
/// `force_replace` turns a Same or Update into a Replace.
pub(crate) fn decide(
    diff: &DiffResponse,
    old: &PropertyMap,
    new: &PropertyMap,
    replace_on_changes: &BTreeSet<&str>,
    force_replace: bool,
) -> (StepKind, Vec<String>, bool) {
    let (kind, changed) = diff_kind(diff, old, new, replace_on_changes);
    if kind == StepKind::Replace || force_replace {
        (StepKind::Replace, changed, diff.delete_before_replace)
    } else {
        (kind, changed, false)
    }
}

fn diff_kind(
    diff: &DiffResponse,
    old: &PropertyMap,
    new: &PropertyMap,
    replace_on_changes: &BTreeSet<&str>,
) -> (StepKind, Vec<String>) {
    let changed = match diff.changes {
        DiffChanges::None => return (StepKind::Same, Vec::new()),
        DiffChanges::Some if !diff.changed_keys.is_empty() => {
            let mut keys = diff.changed_keys.clone();
            keys.sort();
            keys.dedup();
            keys
        }
        DiffChanges::Some | DiffChanges::Unknown => changed_keys(old, new),
    };
    if changed.is_empty() && diff.changes == DiffChanges::Unknown {
        return (StepKind::Same, changed);
    }
    let replace = !diff.replace_keys.is_empty()
        || diff.detailed_diff.values().any(|k| {
            matches!(
                k,
                PropertyDiffKind::AddReplace
                    | PropertyDiffKind::DeleteReplace
                    | PropertyDiffKind::UpdateReplace
            )
        })
        || changed.iter().any(|k| replace_on_changes.contains(k.as_str()));
    if replace {
        (StepKind::Replace, changed)
    } else {
        (StepKind::Update, changed)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn props(v: serde_json::Value) -> PropertyMap {
        match v {
            serde_json::Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn ignored_keys_keep_their_prior_value() {
        let old = props(json!({"a": 1, "b": 1}));
        let new = props(json!({"a": 2, "b": 2, "c": 3}));
        let merged = apply_ignore_changes(&old, &new, &["b".to_string(), "c".to_string()]);
        assert_eq!(merged, props(json!({"a": 2, "b": 1})));
    }

    #[test]
    fn unknown_diff_compares_inputs() {
        let old = props(json!({"a": 1, "b": 1}));
        let same = decide(&DiffResponse::unknown(), &old, &old, &BTreeSet::new(), false);
        assert_eq!(same, (StepKind::Same, vec![], false));

        let new = props(json!({"a": 1, "b": 2}));
        let update = decide(&DiffResponse::unknown(), &old, &new, &BTreeSet::new(), false);
        assert_eq!(update, (StepKind::Update, vec!["b".to_string()], false));

        let replace = decide(&DiffResponse::unknown(), &old, &new, &BTreeSet::from(["b"]), false);
        assert_eq!(replace.0, StepKind::Replace);
    }

    #[test]
    fn provider_replace_keys_force_replacement() {
        let old = props(json!({"name": "x"}));
        let new = props(json!({"name": "y"}));
        let diff = DiffResponse {
            changes: DiffChanges::Some,
            replace_keys: vec!["name".to_string()],
            changed_keys: vec!["name".to_string()],
            delete_before_replace: true,
            ..Default::default()
        };
        assert_eq!(
            decide(&diff, &old, &new, &BTreeSet::new(), false),
            (StepKind::Replace, vec!["name".to_string()], true)
        );
        assert_eq!(
            decide(&DiffResponse::no_changes(), &old, &new, &BTreeSet::new(), false).0,
            StepKind::Same
        );
    }

    #[test]
    fn forced_replacement_overrides_same_and_update() {
        let old = props(json!({"a": 1}));
        let new = props(json!({"a": 2}));
        assert_eq!(
            decide(&DiffResponse::no_changes(), &old, &old, &BTreeSet::new(), true),
            (StepKind::Replace, vec![], false)
        );
        let diff = DiffResponse {
            changes: DiffChanges::Some,
            changed_keys: vec!["a".to_string()],
            ..Default::default()
        };
        assert_eq!(
            decide(&diff, &old, &new, &BTreeSet::new(), true),
            (StepKind::Replace, vec!["a".to_string()], false)
        );
        assert_eq!(decide(&diff, &old, &new, &BTreeSet::new(), false).0, StepKind::Update);
    }
}
