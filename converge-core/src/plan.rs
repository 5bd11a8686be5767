//! Expected steps, produced by a preview and enforced by a later update.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{resource::PropertyMap, snapshot::Manifest, step::StepKind, urn::Urn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanMismatch {
    #[error("planned to {planned}, but would {actual}")]
    Operation { planned: StepKind, actual: StepKind },
    #[error("changes to {0:?} were not planned")]
    UnplannedChanges(Vec<String>),
    #[error("the input changes differ from the planned input changes")]
    Inputs,
    #[error("the resource is not part of the plan")]
    NotInPlan,
}

fn empty_patch() -> json_patch::Patch {
    json_patch::Patch(Vec::new())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePlan {
    pub op: StepKind,
    #[serde(default)]
    pub changed_keys: BTreeSet<String>,
    /// RFC 6902 patch from the prior inputs to the desired inputs.
    #[serde(default = "empty_patch")]
    pub inputs_patch: json_patch::Patch,
}

impl ResourcePlan {
    pub fn new(
        op: StepKind,
        old_inputs: Option<&PropertyMap>,
        new_inputs: Option<&PropertyMap>,
        changed_keys: impl IntoIterator<Item = String>,
    ) -> Self {
        let as_value = |m: Option<&PropertyMap>| Value::Object(m.cloned().unwrap_or_default());
        ResourcePlan {
            op,
            changed_keys: changed_keys.into_iter().collect(),
            inputs_patch: json_patch::diff(&as_value(old_inputs), &as_value(new_inputs)),
        }
    }

    /// Check that `actual`, computed during execution, stays within this plan.
    pub fn check(&self, actual: &ResourcePlan) -> Result<(), PlanMismatch> {
        if self.op != actual.op {
            return Err(PlanMismatch::Operation {
                planned: self.op,
                actual: actual.op,
            });
        }
        let unplanned: Vec<String> = actual
            .changed_keys
            .difference(&self.changed_keys)
            .cloned()
            .collect();
        if !unplanned.is_empty() {
            return Err(PlanMismatch::UnplannedChanges(unplanned));
        }
        if self.inputs_patch != actual.inputs_patch {
            return Err(PlanMismatch::Inputs);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub manifest: Manifest,
    pub resources: BTreeMap<Urn, ResourcePlan>,
}

impl Plan {
    pub fn new(manifest: Manifest) -> Self {
        Plan {
            manifest,
            resources: BTreeMap::new(),
        }
    }

    /// Check a step computed during execution against the plan.
    /// A resource missing from the plan may only stay the same.
    pub fn check(&self, urn: &Urn, actual: &ResourcePlan) -> Result<(), PlanMismatch> {
        match self.resources.get(urn) {
            Some(planned) => planned.check(actual),
            None if actual.op == StepKind::Same => Ok(()),
            None => Err(PlanMismatch::NotInPlan),
        }
    }
}

pub fn plan_to_json(plan: &Plan) -> serde_json::Result<String> {
    serde_json::to_string_pretty(plan)
}

pub fn plan_from_json(s: &str) -> serde_json::Result<Plan> {
    serde_json::from_str(s)
}
