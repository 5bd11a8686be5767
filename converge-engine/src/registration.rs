//! Receiving resource registrations from a running program.

use converge_core::resource::ResourceRegistration;
use tokio::sync::mpsc;

use crate::error::EngineError;

#[derive(Debug, Clone)]
pub enum RegistrationEvent {
    Register(ResourceRegistration),
    /// The program registered everything it is going to register.
    Complete,
}

/// Collect registrations until the program signals completion.
///
/// A stream that ends without [`RegistrationEvent::Complete`] means the
/// program did not finish; deleting what it failed to register would be
/// wrong, so that is an error.
pub async fn collect_registrations(
    mut events: mpsc::Receiver<RegistrationEvent>,
) -> Result<Vec<ResourceRegistration>, EngineError> {
    let mut registrations = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            RegistrationEvent::Register(registration) => {
                tracing::debug!(
                    type_ = %registration.type_,
                    name = %registration.name,
                    "registered"
                );
                registrations.push(registration)
            }
            RegistrationEvent::Complete => return Ok(registrations),
        }
    }
    Err(EngineError::RegistrationIncomplete)
}
