/// This module supplements the `converge-resource-runner` library with the
/// provider configurations of a program file.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use converge_engine::provider::ProviderRegistry;
use converge_resource_runner::{ResourceProviderClient, ResourceProviderConfig};
use serde_json::Value;

/// This type implements the parsing of `type: "stdio"` providers.
#[derive(Debug, serde::Deserialize, serde::Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProviderStdio {
    pub(crate) executable: String,
    #[serde(default)]
    pub(crate) args: Vec<String>,
    /// Seconds
    #[serde(default)]
    pub(crate) default_timeout: Option<u64>,
}

impl ProviderStdio {
    pub(crate) fn to_config(&self) -> ResourceProviderConfig {
        ResourceProviderConfig {
            provider_executable: self.executable.clone(),
            provider_args: self.args.clone(),
            default_timeout: self.default_timeout.map(Duration::from_secs),
        }
    }
}

pub(crate) fn parse_provider(provider_value: &Value) -> Result<ProviderStdio> {
    let provider = provider_value
        .as_object()
        .ok_or_else(|| anyhow::anyhow!("Provider must be an object"))?;
    let type_ = provider
        .get("type")
        .ok_or_else(|| anyhow::anyhow!("Provider must have a type"))?;
    let type_ = type_
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("Provider type must be a string"))?;
    match type_ {
        "stdio" => {
            let mut fields = provider.clone();
            fields.remove("type");
            serde_json::from_value(Value::Object(fields)).map_err(|e| e.into())
        }
        _ => {
            bail!("Unknown provider type: {}", type_);
        }
    }
}

/// The provider processes of one command.
pub(crate) struct Providers {
    clients: Vec<(String, Arc<ResourceProviderClient>)>,
}

impl Providers {
    /// Start a process for every configured provider.
    pub(crate) fn start(configs: &BTreeMap<String, Value>) -> Result<Providers> {
        let mut clients = Vec::new();
        for (key, value) in configs {
            let config = parse_provider(value)
                .with_context(|| format!("Invalid configuration for provider {}", key))?
                .to_config();
            tracing::debug!(provider = %key, executable = %config.provider_executable, "starting provider");
            let client = ResourceProviderClient::start(config)?;
            clients.push((key.clone(), Arc::new(client)));
        }
        Ok(Providers { clients })
    }

    pub(crate) fn registry(&self) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for (key, client) in &self.clients {
            registry.register(key.clone(), client.clone());
        }
        registry
    }

    /// Let every provider process exit. The registry handed out by
    /// [`Providers::registry`] must have been dropped.
    pub(crate) async fn close(self) -> Result<()> {
        let mut first_error = None;
        for (key, client) in self.clients {
            let result = match Arc::try_unwrap(client) {
                Ok(client) => client.close().await,
                Err(_) => Err(anyhow::anyhow!("provider is still in use")),
            };
            if let Err(e) = result {
                tracing::warn!(provider = %key, "provider did not shut down cleanly: {:#}", e);
                first_error.get_or_insert(e.context(format!("closing provider {}", key)));
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
