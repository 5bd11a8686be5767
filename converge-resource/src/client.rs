//! The engine's view of a provider.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use converge_core::snapshot::PluginInfo;
use tokio_util::sync::CancellationToken;

use crate::{
    framework::ResourceProvider,
    schema::v0::{
        CreateRequest, CreateResponse, DeleteRequest, DeleteResponse, DiffRequest, DiffResponse,
        ReadRequest, ReadResponse, UpdateRequest, UpdateResponse,
    },
};

/// Per-call controls handed to a provider client.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub cancel: CancellationToken,
    pub timeout: Option<Duration>,
}

impl CallContext {
    pub fn new(cancel: CancellationToken, timeout: Option<Duration>) -> Self {
        CallContext { cancel, timeout }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderCallError {
    #[error("provider call timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("provider call was cancelled")]
    Cancelled,
    #[error("provider reported an error: {0}")]
    Failed(String),
    #[error("could not communicate with the provider: {0}")]
    Transport(String),
}

/// Run a provider call under the context's cancellation token and timeout.
pub async fn with_context<T, F>(context: &CallContext, call: F) -> Result<T, ProviderCallError>
where
    F: Future<Output = Result<T, ProviderCallError>>,
{
    let guarded = async {
        tokio::select! {
            r = call => r,
            _ = context.cancel.cancelled() => Err(ProviderCallError::Cancelled),
        }
    };
    match context.timeout {
        Some(timeout) => tokio::time::timeout(timeout, guarded)
            .await
            .unwrap_or(Err(ProviderCallError::Timeout(timeout))),
        None => guarded.await,
    }
}

/// Operations the engine performs against a provider. Each call is
/// independent and may be slow; implementations must tolerate concurrent
/// calls.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn diff(
        &self,
        context: &CallContext,
        request: DiffRequest,
    ) -> Result<DiffResponse, ProviderCallError>;

    async fn create(
        &self,
        context: &CallContext,
        request: CreateRequest,
    ) -> Result<CreateResponse, ProviderCallError>;

    async fn update(
        &self,
        context: &CallContext,
        request: UpdateRequest,
    ) -> Result<UpdateResponse, ProviderCallError>;

    async fn delete(
        &self,
        context: &CallContext,
        request: DeleteRequest,
    ) -> Result<DeleteResponse, ProviderCallError>;

    async fn read(
        &self,
        context: &CallContext,
        request: ReadRequest,
    ) -> Result<ReadResponse, ProviderCallError>;

    /// Timeout for calls that have no custom timeout.
    fn default_timeout(&self) -> Option<Duration> {
        None
    }

    /// Identification recorded in the snapshot manifest.
    fn info(&self) -> PluginInfo;
}

/// Runs a [`ResourceProvider`] in the engine's process.
pub struct LocalProviderClient<P> {
    name: String,
    provider: Arc<P>,
    default_timeout: Option<Duration>,
}

impl<P: ResourceProvider> LocalProviderClient<P> {
    pub fn new(name: impl Into<String>, provider: P) -> Self {
        LocalProviderClient {
            name: name.into(),
            provider: Arc::new(provider),
            default_timeout: None,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}

fn failed(e: anyhow::Error) -> ProviderCallError {
    ProviderCallError::Failed(format!("{:#}", e))
}

#[async_trait]
impl<P: ResourceProvider> ProviderClient for LocalProviderClient<P> {
    async fn diff(
        &self,
        _context: &CallContext,
        request: DiffRequest,
    ) -> Result<DiffResponse, ProviderCallError> {
        self.provider.diff(request).await.map_err(failed)
    }

    async fn create(
        &self,
        _context: &CallContext,
        request: CreateRequest,
    ) -> Result<CreateResponse, ProviderCallError> {
        self.provider.create(request).await.map_err(failed)
    }

    async fn update(
        &self,
        _context: &CallContext,
        request: UpdateRequest,
    ) -> Result<UpdateResponse, ProviderCallError> {
        self.provider.update(request).await.map_err(failed)
    }

    async fn delete(
        &self,
        _context: &CallContext,
        request: DeleteRequest,
    ) -> Result<DeleteResponse, ProviderCallError> {
        self.provider.delete(request).await.map_err(failed)
    }

    async fn read(
        &self,
        _context: &CallContext,
        request: ReadRequest,
    ) -> Result<ReadResponse, ProviderCallError> {
        self.provider.read(request).await.map_err(failed)
    }

    fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name.clone(),
            version: None,
        }
    }
}
