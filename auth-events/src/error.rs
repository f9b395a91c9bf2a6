use event_backbone::EventBusError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuthEventError {
    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Role not found: {0}")]
    RoleNotFound(String),

    #[error("Cannot delete system role {0}")]
    SystemRole(String),

    #[error("Invalid user ID format: {0}")]
    InvalidUserId(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Event bus error: {0}")]
    Bus(#[from] EventBusError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AuthEventError>;

/// Handler outcome as seen by the dispatcher. Bad IDs and refused system
/// role deletions never succeed on redelivery and map to permanent errors.
impl From<AuthEventError> for EventBusError {
    fn from(err: AuthEventError) -> Self {
        match err {
            AuthEventError::Bus(inner) => inner,
            AuthEventError::InvalidUserId(_) | AuthEventError::SystemRole(_) => {
                EventBusError::InvalidPayload(err.to_string())
            }
            other => EventBusError::Handler(anyhow::Error::new(other)),
        }
    }
}
