use std::collections::BTreeMap;
use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use converge_resource::framework::{parse_properties, run_main, to_properties, ResourceProvider};
use converge_resource::schema::v0::{
    CreateRequest, CreateResponse, DeleteRequest, DeleteResponse, DiffChanges, DiffRequest,
    DiffResponse, PropertyDiffKind, ReadRequest, ReadResource, ReadResponse, UpdateRequest,
    UpdateResponse,
};
use serde_json::Value;

struct LocalResourceProvider {}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
struct FileInProperties {
    name: String,
    contents: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
struct FileOutProperties {}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
struct ExecInProperties {
    executable: String,
    #[serde(default)]
    args: Vec<String>,
    stdin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
struct ExecOutProperties {
    stdout: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemoInProperties {
    initialize_with: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
struct MemoOutProperties {
    value: Value,
}

fn run_exec(p: ExecInProperties) -> Result<ExecOutProperties> {
    let mut command = std::process::Command::new(&p.executable);
    command.args(&p.args);

    let in_stdio = if p.stdin.is_some() {
        std::process::Stdio::piped()
    } else {
        std::process::Stdio::null()
    };

    let mut child = command
        .stdin(in_stdio)
        .stdout(std::process::Stdio::piped())
        .spawn()
        .with_context(|| format!("Could not spawn process: {}", p.executable))?;

    if let Some(stdinstr) = p.stdin {
        // Dropped at the end of the block, closing the child's stdin
        let mut stdin = child.stdin.take().context("Child process has no stdin")?;
        stdin.write_all(stdinstr.as_bytes())?;
    }

    let output = child.wait_with_output()?;
    let stdout = String::from_utf8(output.stdout)?;

    if output.status.success() {
        Ok(ExecOutProperties { stdout })
    } else {
        bail!(
            "Local resource process failed with exit code: {}",
            output.status
        )
    }
}

/// Compare the inputs of a file resource. Renaming it means a new file.
fn diff_file(old: &FileInProperties, new: &FileInProperties) -> DiffResponse {
    let mut detailed_diff = BTreeMap::new();
    if old.name != new.name {
        detailed_diff.insert("name".to_string(), PropertyDiffKind::UpdateReplace);
    }
    if old.contents != new.contents {
        detailed_diff.insert("contents".to_string(), PropertyDiffKind::Update);
    }
    if detailed_diff.is_empty() {
        return DiffResponse::no_changes();
    }
    DiffResponse {
        changes: DiffChanges::Some,
        replace_keys: detailed_diff
            .iter()
            .filter(|(_, kind)| **kind == PropertyDiffKind::UpdateReplace)
            .map(|(k, _)| k.clone())
            .collect(),
        changed_keys: detailed_diff.keys().cloned().collect(),
        delete_before_replace: false,
        detailed_diff,
    }
}

/// The stored inputs and outputs, for resources that only exist in the
/// snapshot.
fn read_stored(request: ReadRequest) -> Result<ReadResponse> {
    match (request.inputs, request.outputs) {
        (Some(inputs), Some(outputs)) => Ok(ReadResponse {
            resource: Some(ReadResource { inputs, outputs }),
        }),
        _ => bail!(
            "{} resources can only be read with their previous state",
            request.type_
        ),
    }
}

#[async_trait]
impl ResourceProvider for LocalResourceProvider {
    async fn diff(&self, request: DiffRequest) -> Result<DiffResponse> {
        match request.type_.as_str() {
            "file" => {
                let old: FileInProperties = parse_properties(&request.old_inputs, "file")?;
                let new: FileInProperties = parse_properties(&request.new_inputs, "file")?;
                Ok(diff_file(&old, &new))
            }
            // Left to the engine's input comparison
            _ => Ok(DiffResponse::unknown()),
        }
    }

    async fn create(&self, request: CreateRequest) -> Result<CreateResponse> {
        let id = request.urn.to_string();
        match request.type_.as_str() {
            "file" => {
                let p: FileInProperties = parse_properties(&request.inputs, "file")?;
                std::fs::write(&p.name, &p.contents)
                    .with_context(|| format!("Could not write file {}", p.name))?;
                Ok(CreateResponse {
                    id: p.name,
                    outputs: to_properties(FileOutProperties {})?,
                })
            }
            "exec" => {
                let p: ExecInProperties = parse_properties(&request.inputs, "exec")?;
                Ok(CreateResponse {
                    id,
                    outputs: to_properties(run_exec(p)?)?,
                })
            }
            "memo" => {
                // A stateful resource that is initialized upon creation and
                // not modified afterwards
                let p: MemoInProperties = parse_properties(&request.inputs, "memo")?;
                Ok(CreateResponse {
                    id,
                    outputs: to_properties(MemoOutProperties {
                        value: p.initialize_with,
                    })?,
                })
            }
            t => bail!(
                "LocalResourceProvider::create: unknown resource type: {}",
                t
            ),
        }
    }

    async fn update(&self, request: UpdateRequest) -> Result<UpdateResponse> {
        match request.type_.as_str() {
            "file" => {
                let p: FileInProperties = parse_properties(&request.new_inputs, "file")?;
                if p.name != request.id {
                    bail!("Internal error: update can not rename file {}", request.id);
                }
                std::fs::write(&p.name, &p.contents)
                    .with_context(|| format!("Could not write file {}", p.name))?;
                Ok(UpdateResponse {
                    outputs: to_properties(FileOutProperties {})?,
                })
            }
            "exec" => {
                let p: ExecInProperties = parse_properties(&request.new_inputs, "exec")?;
                Ok(UpdateResponse {
                    outputs: to_properties(run_exec(p)?)?,
                })
            }
            "memo" => {
                let previous: MemoOutProperties =
                    serde_json::from_value(Value::Object(request.old_outputs.clone()))
                        .with_context(|| {
                            "The update operation on a memo resource requires that the output properties are set"
                        })?;
                Ok(UpdateResponse {
                    outputs: to_properties(previous)?,
                })
            }
            t => bail!(
                "LocalResourceProvider::update: unknown resource type: {}",
                t
            ),
        }
    }

    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResponse> {
        match request.type_.as_str() {
            "file" => match std::fs::remove_file(&request.id) {
                Ok(()) => Ok(DeleteResponse {}),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DeleteResponse {}),
                Err(e) => {
                    Err(e).with_context(|| format!("Could not remove file {}", request.id))
                }
            },
            // Nothing outside the snapshot to clean up
            "exec" | "memo" => Ok(DeleteResponse {}),
            t => bail!(
                "LocalResourceProvider::delete: unknown resource type: {}",
                t
            ),
        }
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResponse> {
        match request.type_.as_str() {
            "file" => match std::fs::read_to_string(&request.id) {
                Ok(contents) => Ok(ReadResponse {
                    resource: Some(ReadResource {
                        inputs: to_properties(FileInProperties {
                            name: request.id.clone(),
                            contents,
                        })?,
                        outputs: to_properties(FileOutProperties {})?,
                    }),
                }),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Ok(ReadResponse { resource: None })
                }
                Err(e) => Err(e).with_context(|| format!("Could not read file {}", request.id)),
            },
            "exec" | "memo" => read_stored(request),
            t => bail!(
                "LocalResourceProvider::read: unknown resource type: {}",
                t
            ),
        }
    }
}

#[tokio::main]
async fn main() {
    run_main(LocalResourceProvider {}).await
}
