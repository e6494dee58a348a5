use thiserror::Error;

use courier_shared::CourierError;
use courier_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Store task failed: {0}")]
    StoreTask(#[from] tokio::task::JoinError),

    #[error("Store lock poisoned")]
    StoreLockPoisoned,

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Protocol error: {0}")]
    Protocol(#[from] CourierError),
}

impl ServerError {
    /// Text sent to the peer when this error ends a request. Internal
    /// failures are not described to clients.
    pub fn client_message(&self) -> String {
        match self {
            ServerError::FrameTooLarge { .. } => "Frame too large".to_string(),
            ServerError::Protocol(CourierError::Protocol(msg)) => msg.clone(),
            _ => "Internal server error".to_string(),
        }
    }
}
