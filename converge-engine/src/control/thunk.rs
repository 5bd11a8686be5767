//! Deferred, shared computations: [`Thunk`].
use std::{future::Future, pin::Pin, sync::Arc};
use tokio::sync::{Mutex, OnceCell};

/// A future that runs at most once, no matter how many clones of the thunk
/// are forced, and from how many tasks.
///
/// Every caller of [`Thunk::force`] observes the same result. While the
/// future is running, other callers wait for it.
pub struct Thunk<T> {
    thunk_state: Arc<ThunkState<T>>,
}
impl<T> Thunk<T> {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = T> + 'static + Send,
    {
        Thunk {
            thunk_state: Arc::new(ThunkState::new(future)),
        }
    }

    /// Run the future if nobody has yet, and return its result.
    pub async fn force(&self) -> &T {
        self.thunk_state.force().await
    }

    /// Force all thunks concurrently, returning cloned results in the order
    /// of the input.
    pub async fn force_all(thunks: Vec<Thunk<T>>) -> Vec<T>
    where
        T: Clone,
    {
        futures_util::future::join_all(
            thunks
                .iter()
                .map(|thunk| async move { thunk.force().await.clone() }),
        )
        .await
    }
}
impl<T> Clone for Thunk<T> {
    fn clone(&self) -> Self {
        Thunk {
            thunk_state: self.thunk_state.clone(),
        }
    }
}

type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

struct ThunkState<T> {
    cell: OnceCell<T>,
    /// Taken by whichever caller initializes `cell`
    future: Mutex<Option<BoxedFuture<T>>>,
}
impl<T> ThunkState<T> {
    fn new<F>(future: F) -> ThunkState<T>
    where
        F: Future<Output = T> + 'static + Send,
    {
        ThunkState {
            cell: OnceCell::new(),
            future: Mutex::new(Some(Box::pin(future))),
        }
    }
    async fn force(self: &Arc<Self>) -> &T {
        self.cell
            .get_or_init(|| async {
                let mut future = self.future.lock().await;
                match future.take() {
                    Some(future) => future.await,
                    // get_or_init runs the initializer once; when an
                    // initializer is cancelled, the next one finds the future
                    // gone
                    None => panic!("Thunk future was dropped before completion"),
                }
            })
            .await
    }
}
