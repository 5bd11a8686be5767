use tokio_util::sync::CancellationToken;

/// Shared interrupt flag for a deployment.
///
/// Interrupting stops the engine from starting new steps and cancels the
/// provider calls that are in flight.
#[derive(Clone, Debug, Default)]
pub struct InterruptState {
    token: CancellationToken,
}

impl InterruptState {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn set_interrupted(&self) {
        self.token.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The token that provider calls observe.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves once interrupted.
    pub async fn interrupted(&self) {
        self.token.cancelled().await
    }
}
