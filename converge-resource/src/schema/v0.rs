//! Messages of the provider protocol, version 0.
//!
//! Each message is a single line of JSON. The engine sends
//! [`RequestMessage`]s and the provider answers each with a
//! [`ResponseMessage`] carrying the same `id`. Responses may arrive in any
//! order.

use std::collections::BTreeMap;

use converge_core::{resource::PropertyMap, urn::Urn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffRequest {
    pub urn: Urn,
    #[serde(rename = "type")]
    pub type_: String,
    pub id: String,
    pub old_inputs: PropertyMap,
    pub new_inputs: PropertyMap,
    pub old_outputs: PropertyMap,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiffChanges {
    None,
    Some,
    /// The provider can not tell; the caller decides by comparing inputs.
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropertyDiffKind {
    Add,
    Delete,
    Update,
    AddReplace,
    DeleteReplace,
    UpdateReplace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResponse {
    #[serde(default)]
    pub changes: DiffChanges,
    /// Changed keys that require the resource to be replaced.
    #[serde(default)]
    pub replace_keys: Vec<String>,
    #[serde(default)]
    pub changed_keys: Vec<String>,
    #[serde(default)]
    pub delete_before_replace: bool,
    #[serde(default)]
    pub detailed_diff: BTreeMap<String, PropertyDiffKind>,
}

impl DiffResponse {
    pub fn unknown() -> Self {
        DiffResponse::default()
    }
    pub fn no_changes() -> Self {
        DiffResponse {
            changes: DiffChanges::None,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub urn: Urn,
    #[serde(rename = "type")]
    pub type_: String,
    pub inputs: PropertyMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponse {
    pub id: String,
    #[serde(default)]
    pub outputs: PropertyMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub urn: Urn,
    #[serde(rename = "type")]
    pub type_: String,
    pub id: String,
    pub old_inputs: PropertyMap,
    pub new_inputs: PropertyMap,
    pub old_outputs: PropertyMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResponse {
    #[serde(default)]
    pub outputs: PropertyMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub urn: Urn,
    #[serde(rename = "type")]
    pub type_: String,
    pub id: String,
    pub inputs: PropertyMap,
    pub outputs: PropertyMap,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    pub urn: Urn,
    #[serde(rename = "type")]
    pub type_: String,
    pub id: String,
    /// Last known inputs, absent when reading an external resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<PropertyMap>,
    /// Last known outputs, absent when reading an external resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<PropertyMap>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResource {
    #[serde(default)]
    pub inputs: PropertyMap,
    #[serde(default)]
    pub outputs: PropertyMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResponse {
    /// `None` when the resource no longer exists.
    #[serde(default)]
    pub resource: Option<ReadResource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Request {
    Diff(DiffRequest),
    Create(CreateRequest),
    Update(UpdateRequest),
    Delete(DeleteRequest),
    Read(ReadRequest),
}

impl Request {
    pub fn method(&self) -> &'static str {
        match self {
            Request::Diff(_) => "diff",
            Request::Create(_) => "create",
            Request::Update(_) => "update",
            Request::Delete(_) => "delete",
            Request::Read(_) => "read",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Response {
    Diff(DiffResponse),
    Create(CreateResponse),
    Update(UpdateResponse),
    Delete(DeleteResponse),
    Read(ReadResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub id: u64,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Reply {
    Ok(Response),
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub id: u64,
    pub reply: Reply,
}
