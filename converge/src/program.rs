//! The program file: a JSON document that declares the desired resources and
//! the providers that manage them.
//!
//! ```json
//! {
//!   "project": "website",
//!   "providers": {
//!     "local": { "type": "stdio", "executable": "converge-resources-local", "args": [] }
//!   },
//!   "resources": [
//!     { "type": "file", "name": "index", "provider": "local",
//!       "inputs": { "name": "index.html", "contents": "hello" } }
//!   ]
//! }
//! ```

use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result};
use converge_core::resource::ResourceRegistration;
use converge_engine::registration::RegistrationEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Program {
    #[serde(default)]
    pub project: Option<String>,
    /// Provider configurations, by the key that resources refer to them with.
    #[serde(default)]
    pub providers: BTreeMap<String, Value>,
    #[serde(default)]
    pub resources: Vec<ResourceRegistration>,
}

impl Program {
    pub fn parse(contents: &str) -> Result<Program> {
        Ok(serde_json::from_str(contents)?)
    }

    pub fn load(path: &Path) -> Result<Program> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read program file {}", path.display()))?;
        Program::parse(&contents)
            .with_context(|| format!("Could not parse program file {}", path.display()))
    }

    /// Like [`Program::load`], but a missing file is an empty program.
    pub fn load_if_exists(path: &Path) -> Result<Program> {
        if path.exists() {
            Program::load(path)
        } else {
            Ok(Program::default())
        }
    }

    /// Send the resources to the engine one at a time, as a running program
    /// would, followed by the completion marker.
    pub fn registrations(&self) -> mpsc::Receiver<RegistrationEvent> {
        let (tx, rx) = mpsc::channel(16);
        let resources = self.resources.clone();
        tokio::spawn(async move {
            for resource in resources {
                if tx.send(RegistrationEvent::Register(resource)).await.is_err() {
                    // The engine stopped listening
                    return;
                }
            }
            let _ = tx.send(RegistrationEvent::Complete).await;
        });
        rx
    }
}
