use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use converge_core::snapshot::PluginInfo;
use converge_resource::{
    client::{CallContext, ProviderCallError, ProviderClient},
    schema::v0::{
        CreateRequest, CreateResponse, DeleteRequest, DeleteResponse, DiffRequest, DiffResponse,
        ReadRequest, ReadResponse, Reply, Request, RequestMessage, Response, ResponseMessage,
        UpdateRequest, UpdateResponse,
    },
};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    process::{Child, ChildStdin, ChildStdout},
    sync::oneshot,
    task::JoinHandle,
};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceProviderConfig {
    pub provider_executable: String,
    pub provider_args: Vec<String>,
    pub default_timeout: Option<Duration>,
}

/// Requests waiting for a response. `None` once the provider's output has
/// ended.
type Pending = Arc<Mutex<Option<HashMap<u64, oneshot::Sender<Reply>>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A long-lived provider process, spoken to over its stdin and stdout.
pub struct ResourceProviderClient {
    provider_config: ResourceProviderConfig,
    writer: tokio::sync::Mutex<FramedWrite<ChildStdin, LinesCodec>>,
    pending: Pending,
    next_id: AtomicU64,
    child: Child,
    reader: JoinHandle<()>,
}

impl ResourceProviderClient {
    /// Spawn the provider process. Must be called from within a tokio runtime.
    pub fn start(provider_config: ResourceProviderConfig) -> Result<Self> {
        let mut child = tokio::process::Command::new(&provider_config.provider_executable)
            .args(&provider_config.provider_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "Could not spawn provider process {}",
                    provider_config.provider_executable
                )
            })?;

        let stdin = child
            .stdin
            .take()
            .context("provider process has no stdin")?;
        let stdout = child
            .stdout
            .take()
            .context("provider process has no stdout")?;

        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let reader = tokio::spawn(read_responses(
            stdout,
            pending.clone(),
            provider_config.provider_executable.clone(),
        ));

        Ok(ResourceProviderClient {
            provider_config,
            writer: tokio::sync::Mutex::new(FramedWrite::new(stdin, LinesCodec::new())),
            pending,
            next_id: AtomicU64::new(0),
            child,
            reader,
        })
    }

    pub fn config(&self) -> &ResourceProviderConfig {
        &self.provider_config
    }

    /// Send one request and wait for its response, or for cancellation.
    pub async fn call(
        &self,
        context: &CallContext,
        request: Request,
    ) -> Result<Response, ProviderCallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let method = request.method();
        let (tx, rx) = oneshot::channel();
        match lock(&self.pending).as_mut() {
            Some(pending) => {
                pending.insert(id, tx);
            }
            None => {
                return Err(ProviderCallError::Transport(format!(
                    "provider {} has exited",
                    self.provider_config.provider_executable
                )))
            }
        }
        tracing::debug!(id, method, "sending provider request");

        let line = serde_json::to_string(&RequestMessage { id, request })
            .map_err(|e| ProviderCallError::Transport(e.to_string()))?;

        let exchange = async {
            self.writer
                .lock()
                .await
                .send(line)
                .await
                .map_err(|e| ProviderCallError::Transport(e.to_string()))?;
            rx.await.map_err(|_| {
                ProviderCallError::Transport(format!(
                    "provider {} exited before answering {}",
                    self.provider_config.provider_executable, method
                ))
            })
        };

        let reply = tokio::select! {
            reply = exchange => reply,
            _ = context.cancel.cancelled() => {
                if let Some(pending) = lock(&self.pending).as_mut() {
                    pending.remove(&id);
                }
                Err(ProviderCallError::Cancelled)
            }
        }?;

        match reply {
            Reply::Ok(response) => Ok(response),
            Reply::Error { message } => Err(ProviderCallError::Failed(message)),
        }
    }

    /// Close the provider's input and wait for it to exit.
    pub async fn close(self) -> Result<()> {
        let ResourceProviderClient {
            provider_config,
            writer,
            mut child,
            reader,
            ..
        } = self;
        drop(writer);
        let status = child.wait().await?;
        reader.await?;
        if !status.success() {
            bail!(
                "provider {} exited with {}",
                provider_config.provider_executable,
                status
            );
        }
        Ok(())
    }
}

async fn read_responses(stdout: ChildStdout, pending: Pending, provider: String) {
    let mut lines = FramedRead::new(stdout, LinesCodec::new());
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(provider = %provider, "could not read provider output: {}", e);
                break;
            }
        };
        let message: ResponseMessage = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(provider = %provider, "ignoring malformed provider response: {}", e);
                continue;
            }
        };
        let waiter = lock(&pending)
            .as_mut()
            .and_then(|p| p.remove(&message.id));
        match waiter {
            // The caller may have given up
            Some(tx) => {
                let _ = tx.send(message.reply);
            }
            None => tracing::debug!(
                provider = %provider,
                id = message.id,
                "response without a waiting request"
            ),
        }
    }
    // Dropping the senders fails every request still waiting
    lock(&pending).take();
}

fn unexpected(method: &str, response: Response) -> ProviderCallError {
    ProviderCallError::Transport(format!(
        "unexpected response to {}: {:?}",
        method, response
    ))
}

#[async_trait]
impl ProviderClient for ResourceProviderClient {
    async fn diff(
        &self,
        context: &CallContext,
        request: DiffRequest,
    ) -> Result<DiffResponse, ProviderCallError> {
        match self.call(context, Request::Diff(request)).await? {
            Response::Diff(r) => Ok(r),
            other => Err(unexpected("diff", other)),
        }
    }

    async fn create(
        &self,
        context: &CallContext,
        request: CreateRequest,
    ) -> Result<CreateResponse, ProviderCallError> {
        match self.call(context, Request::Create(request)).await? {
            Response::Create(r) => Ok(r),
            other => Err(unexpected("create", other)),
        }
    }

    async fn update(
        &self,
        context: &CallContext,
        request: UpdateRequest,
    ) -> Result<UpdateResponse, ProviderCallError> {
        match self.call(context, Request::Update(request)).await? {
            Response::Update(r) => Ok(r),
            other => Err(unexpected("update", other)),
        }
    }

    async fn delete(
        &self,
        context: &CallContext,
        request: DeleteRequest,
    ) -> Result<DeleteResponse, ProviderCallError> {
        match self.call(context, Request::Delete(request)).await? {
            Response::Delete(r) => Ok(r),
            other => Err(unexpected("delete", other)),
        }
    }

    async fn read(
        &self,
        context: &CallContext,
        request: ReadRequest,
    ) -> Result<ReadResponse, ProviderCallError> {
        match self.call(context, Request::Read(request)).await? {
            Response::Read(r) => Ok(r),
            other => Err(unexpected("read", other)),
        }
    }

    fn default_timeout(&self) -> Option<Duration> {
        self.provider_config.default_timeout
    }

    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.provider_config.provider_executable.clone(),
            version: None,
        }
    }
}
