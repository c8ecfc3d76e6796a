//! Assignment client error type.

use std::io;

use waypost_transport::NodeListError;

/// Errors that stop the assignment client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Socket or node table failure.
    #[error("transport error: {0}")]
    Transport(#[from] NodeListError),

    /// The coordinator address could not be resolved.
    #[error("cannot resolve domain server {host}: {source}")]
    Resolve {
        /// Address as given.
        host: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The worker task panicked or was cancelled, taking the node list with it.
    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    /// The node list is owned by a running worker.
    #[error("node list is owned by a running worker")]
    NodeListBusy,
}
