//! Desired and persisted resource records.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::urn::{StackRef, Urn, UrnError};

/// Input or output properties of a resource. The engine treats the values as
/// opaque JSON.
pub type PropertyMap = serde_json::Map<String, Value>;

/// Key of the JSON object that marks a property value as a reference to
/// another resource, e.g. `{"$resourceRef": "urn:converge:...", "property": "arn"}`.
pub const RESOURCE_REF_KEY: &str = "$resourceRef";

/// Provider reference: the key under which a provider client is registered.
/// When it is a URN of a registered resource, that resource is the provider
/// and becomes a dependency.
pub type ProviderRef = String;

/// Per-operation timeout overrides, in seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomTimeouts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<u64>,
}
impl CustomTimeouts {
    pub fn is_empty(&self) -> bool {
        self.create.is_none() && self.update.is_none() && self.delete.is_none()
    }
}

fn default_true() -> bool {
    true
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A resource as declared by the desired-state producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRegistration {
    #[serde(rename = "type")]
    pub type_: String,
    pub name: String,
    #[serde(default)]
    pub parent: Option<Urn>,
    #[serde(default)]
    pub provider: Option<ProviderRef>,
    #[serde(default)]
    pub inputs: PropertyMap,
    #[serde(default)]
    pub dependencies: Vec<Urn>,
    #[serde(default)]
    pub protect: bool,
    #[serde(default)]
    pub retain_on_delete: bool,
    /// `false` for component resources, which only group other resources
    /// and are never sent to a provider.
    #[serde(default = "default_true")]
    pub custom: bool,
    #[serde(default)]
    pub delete_before_replace: bool,
    #[serde(default)]
    pub custom_timeouts: CustomTimeouts,
    /// Top-level input keys whose changes are not acted upon.
    #[serde(default)]
    pub ignore_changes: Vec<String>,
    /// Top-level input keys whose changes force a replacement.
    #[serde(default)]
    pub replace_on_changes: Vec<String>,
    /// Adopt the existing resource with this ID instead of creating one.
    #[serde(default)]
    pub import_id: Option<String>,
    /// Track the external resource with this ID without managing it.
    #[serde(default)]
    pub read_id: Option<String>,
}

impl ResourceRegistration {
    pub fn new(type_: impl Into<String>, name: impl Into<String>) -> Self {
        ResourceRegistration {
            type_: type_.into(),
            name: name.into(),
            parent: None,
            provider: None,
            inputs: PropertyMap::new(),
            dependencies: Vec::new(),
            protect: false,
            retain_on_delete: false,
            custom: true,
            delete_before_replace: false,
            custom_timeouts: CustomTimeouts::default(),
            ignore_changes: Vec::new(),
            replace_on_changes: Vec::new(),
            import_id: None,
            read_id: None,
        }
    }

    pub fn urn(&self, stack: &StackRef) -> Urn {
        Urn::new(stack, self.parent.as_ref(), &self.type_, &self.name)
    }

    /// The URN, or why the type or name can not form one.
    pub fn try_urn(&self, stack: &StackRef) -> Result<Urn, UrnError> {
        Urn::try_new(stack, self.parent.as_ref(), &self.type_, &self.name)
    }

    /// Resource references found in the inputs, keyed by top-level input name.
    pub fn property_dependencies(&self) -> BTreeMap<String, Vec<Urn>> {
        let mut r = BTreeMap::new();
        for (key, value) in self.inputs.iter() {
            let mut refs = BTreeSet::new();
            collect_resource_refs(value, &mut refs);
            if !refs.is_empty() {
                r.insert(key.clone(), refs.into_iter().collect());
            }
        }
        r
    }
}

/// Collect every resource reference inside a property value.
/// References whose target is not a well-formed URN are ignored.
pub fn collect_resource_refs(value: &Value, into: &mut BTreeSet<Urn>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(target)) = map.get(RESOURCE_REF_KEY) {
                if let Ok(urn) = target.parse() {
                    into.insert(urn);
                }
            }
            for v in map.values() {
                collect_resource_refs(v, into);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_resource_refs(v, into);
            }
        }
        _ => {}
    }
}

/// The persisted record of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    pub urn: Urn,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default = "default_true")]
    pub custom: bool,
    /// Provider-opaque identity, present once the provider created the resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Urn>,
    #[serde(default)]
    pub inputs: PropertyMap,
    #[serde(default)]
    pub outputs: PropertyMap,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Urn>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub property_dependencies: BTreeMap<String, Vec<Urn>>,
    #[serde(default, skip_serializing_if = "CustomTimeouts::is_empty")]
    pub custom_timeouts: CustomTimeouts,
    #[serde(default, skip_serializing_if = "is_false")]
    pub protect: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub retain_on_delete: bool,
    /// Read from the provider but not managed; never deleted by a provider call.
    #[serde(default, skip_serializing_if = "is_false")]
    pub external: bool,
    /// This entry is an old copy awaiting deletion, e.g. the replaced half of
    /// a create-before-delete replacement.
    #[serde(default, skip_serializing_if = "is_false")]
    pub delete: bool,
    /// The provider resource was deleted ahead of its replacement; the entry
    /// is kept so that dependents stay valid until the replacement commits.
    #[serde(default, skip_serializing_if = "is_false")]
    pub pending_replacement: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import_id: Option<String>,
}

impl ResourceState {
    /// Build the state that corresponds to a registration, before any
    /// provider interaction.
    pub fn from_registration(urn: Urn, registration: &ResourceRegistration) -> Self {
        let property_dependencies = registration.property_dependencies();
        ResourceState {
            urn,
            type_: registration.type_.clone(),
            custom: registration.custom,
            id: None,
            provider: registration.provider.clone(),
            parent: registration.parent.clone(),
            inputs: registration.inputs.clone(),
            outputs: PropertyMap::new(),
            dependencies: registration.dependencies.clone(),
            property_dependencies,
            custom_timeouts: registration.custom_timeouts.clone(),
            protect: registration.protect,
            retain_on_delete: registration.retain_on_delete,
            external: registration.read_id.is_some(),
            delete: false,
            pending_replacement: false,
            import_id: registration.import_id.clone(),
        }
    }

    /// Every URN this state must be preceded by in a snapshot: dependencies,
    /// property dependencies, the parent and a URN-shaped provider reference.
    pub fn referenced_urns(&self) -> BTreeSet<Urn> {
        let mut r: BTreeSet<Urn> = self.dependencies.iter().cloned().collect();
        for urns in self.property_dependencies.values() {
            r.extend(urns.iter().cloned());
        }
        if let Some(parent) = &self.parent {
            r.insert(parent.clone());
        }
        if let Some(urn) = self.provider.as_ref().and_then(|p| p.parse::<Urn>().ok()) {
            r.insert(urn);
        }
        r.remove(&self.urn);
        r
    }

    /// Whether anything besides inputs, outputs and identity differs, i.e.
    /// whether a no-op step still has to record new bookkeeping.
    pub fn metadata_differs(&self, other: &ResourceState) -> bool {
        self.type_ != other.type_
            || self.custom != other.custom
            || self.provider != other.provider
            || self.parent != other.parent
            || self.dependencies != other.dependencies
            || self.property_dependencies != other.property_dependencies
            || self.custom_timeouts != other.custom_timeouts
            || self.protect != other.protect
            || self.retain_on_delete != other.retain_on_delete
    }
}
