use std::{collections::BTreeMap, sync::Arc};

use converge_core::snapshot::PluginInfo;
use converge_resource::client::ProviderClient;

use crate::error::StepError;

/// Key of the provider used when nothing more specific matches.
pub const DEFAULT_PROVIDER: &str = "default";

/// The provider clients available to a deployment.
///
/// A resource's provider is found by, in order: its explicit provider
/// reference, the package of its type (the part before the first `:`), and
/// finally [`DEFAULT_PROVIDER`].
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: impl Into<String>, client: Arc<dyn ProviderClient>) {
        self.providers.insert(key.into(), client);
    }

    pub fn with(mut self, key: impl Into<String>, client: Arc<dyn ProviderClient>) -> Self {
        self.register(key, client);
        self
    }

    pub fn resolve(
        &self,
        provider: Option<&str>,
        type_: &str,
    ) -> Result<Arc<dyn ProviderClient>, StepError> {
        if let Some(key) = provider {
            return self
                .providers
                .get(key)
                .cloned()
                .ok_or_else(|| StepError::UnknownProvider(key.to_string()));
        }
        let package = type_.split(':').next().unwrap_or(type_);
        self.providers
            .get(package)
            .or_else(|| self.providers.get(DEFAULT_PROVIDER))
            .cloned()
            .ok_or_else(|| StepError::UnknownProvider(type_.to_string()))
    }

    pub fn infos(&self) -> Vec<PluginInfo> {
        self.providers.values().map(|p| p.info()).collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.providers.keys()).finish()
    }
}
