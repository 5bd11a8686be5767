use std::{
    os::fd::{AsRawFd, FromRawFd},
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use converge_core::resource::PropertyMap;
use futures_util::{SinkExt, StreamExt};
use nix::unistd::{dup, dup2};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::schema::v0::{
    CreateRequest, CreateResponse, DeleteRequest, DeleteResponse, DiffRequest,
    DiffResponse, ReadRequest, ReadResponse, Reply, Request, RequestMessage, Response,
    ResponseMessage, UpdateRequest, UpdateResponse,
};

/// The provider side of the protocol.
#[async_trait]
pub trait ResourceProvider: Send + Sync + 'static {
    /// Compare old and new inputs. The default leaves the decision to the
    /// engine.
    async fn diff(&self, _request: DiffRequest) -> Result<DiffResponse> {
        Ok(DiffResponse::unknown())
    }
    async fn create(&self, request: CreateRequest) -> Result<CreateResponse>;
    async fn update(&self, request: UpdateRequest) -> Result<UpdateResponse>;
    async fn delete(&self, request: DeleteRequest) -> Result<DeleteResponse>;
    async fn read(&self, request: ReadRequest) -> Result<ReadResponse>;
}

async fn dispatch<P: ResourceProvider>(provider: &P, request: Request) -> Result<Response> {
    Ok(match request {
        Request::Diff(r) => Response::Diff(provider.diff(r).await?),
        Request::Create(r) => Response::Create(provider.create(r).await?),
        Request::Update(r) => Response::Update(provider.update(r).await?),
        Request::Delete(r) => Response::Delete(provider.delete(r).await?),
        Request::Read(r) => Response::Read(provider.read(r).await?),
    })
}

/// Answer requests from `input` until it is closed. Requests are handled
/// concurrently; each response is written as soon as it is ready.
pub async fn serve<P, R, W>(provider: Arc<P>, input: R, output: W) -> Result<()>
where
    P: ResourceProvider,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = FramedRead::new(input, LinesCodec::new());
    let (tx, mut rx) = mpsc::unbounded_channel::<ResponseMessage>();

    let writer = tokio::spawn(async move {
        let mut out = FramedWrite::new(output, LinesCodec::new());
        while let Some(message) = rx.recv().await {
            let line = serde_json::to_string(&message)?;
            out.send(line)
                .await
                .with_context(|| "Could not write response message")?;
        }
        anyhow::Ok(())
    });

    while let Some(line) = lines.next().await {
        let line = line.with_context(|| "Could not read line for request message")?;
        if line.trim().is_empty() {
            continue;
        }
        let message: RequestMessage =
            serde_json::from_str(&line).with_context(|| "Could not parse request message")?;
        let provider = provider.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let method = message.request.method();
            let reply = match dispatch(provider.as_ref(), message.request).await {
                Ok(response) => Reply::Ok(response),
                Err(e) => {
                    eprintln!("Error during {}: {:?}", method, e);
                    Reply::Error {
                        message: format!("{:#}", e),
                    }
                }
            };
            // The writer only stops when all senders are gone
            let _ = tx.send(ResponseMessage {
                id: message.id,
                reply,
            });
        });
    }
    drop(tx);

    writer
        .await
        .with_context(|| "Response writer task failed")?
}

/// Entry point for provider executables.
pub async fn run_main(provider: impl ResourceProvider) {
    let pipe = {
        let pipe = init_stdio().unwrap_or_exit();
        pipe_fds_to_files(pipe)
    };
    let input = tokio::fs::File::from_std(pipe.in_);
    let output = tokio::fs::File::from_std(pipe.out);
    serve(Arc::new(provider), input, output)
        .await
        .unwrap_or_exit();
}

/// A pair of `T` values: one for input and one for output.
struct InOut<T> {
    in_: T,
    out: T,
}

/// A file descriptor
type Fd = i32;

/// Take over the standard streams for the protocol.
/// This returns the communication channels with the engine, and reconfigures
/// the stdio file descriptors as follows:
///
/// ```text
/// 0: /dev/null
/// 1: stderr
/// 2: stderr
/// ```
///
/// so that stray prints from the provider can not corrupt the protocol.
fn init_stdio() -> Result<InOut<Fd>> {
    let r = InOut {
        in_: dup(0).with_context(|| "dup(0)")?,
        out: dup(1).with_context(|| "dup(1)")?,
    };

    let dev_null =
        std::fs::File::open("/dev/null").with_context(|| "Could not open /dev/null")?;
    dup2(dev_null.as_raw_fd(), 0).with_context(|| "Could not dup2(/dev/null, 0)")?;

    dup2(2, 1).with_context(|| "Could not dup2(2, 1)")?;

    Ok(r)
}

fn pipe_fds_to_files(pipe: InOut<Fd>) -> InOut<std::fs::File> {
    // The descriptors were just created by dup and are owned by nobody else
    InOut {
        in_: unsafe { std::fs::File::from_raw_fd(pipe.in_) },
        out: unsafe { std::fs::File::from_raw_fd(pipe.out) },
    }
}

trait ProviderMainError<T> {
    type V;
    fn unwrap_or_exit(self) -> Self::V;
}
impl<T> ProviderMainError<Result<T>> for Result<T> {
    type V = T;
    fn unwrap_or_exit(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => {
                eprintln!("Error: {:?}", e);
                std::process::exit(1);
            }
        }
    }
}

/// Deserialize the inputs of a resource into the provider's own type.
pub fn parse_properties<T: for<'de> serde::Deserialize<'de>>(
    properties: &PropertyMap,
    resource_type: &str,
) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(properties.clone())).with_context(|| {
        format!(
            "Could not deserialize input properties for {} resource",
            resource_type
        )
    })
}

/// Serialize the provider's own output type into a property map.
pub fn to_properties<T: serde::Serialize>(value: T) -> Result<PropertyMap> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(o) => Ok(o),
        _ => anyhow::bail!("Expected object as output"),
    }
}
