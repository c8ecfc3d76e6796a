//! Coordinator error type.

use waypost_transport::NodeListError;

use crate::config::{ConfigError, RESTART_EXIT_CODE};

/// Errors that stop the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    /// Fatal misconfiguration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Socket or node table failure.
    #[error("transport error: {0}")]
    Transport(#[from] NodeListError),
}

impl DomainError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            DomainError::Config(_) => RESTART_EXIT_CODE,
            DomainError::Transport(_) => 1,
        }
    }
}
