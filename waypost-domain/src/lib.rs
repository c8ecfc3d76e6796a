//! # waypost-domain
//!
//! The domain coordinator. It hands out work to assignment clients, admits
//! nodes after checking their assignment or their identity, and tells every
//! node which peers to talk to.
//!
//! ## Parts
//!
//! - [`AssignmentRegistry`]: static and dynamic assignments, the offer queue
//!   and the deploy records linking a worker back to what it was given
//! - [`ConnectionNegotiator`]: the admission decision for a connect request
//! - [`UserKeyCache`]: public keys for signed usernames, loaded off the
//!   reactor
//! - [`DomainServer`]: the single-task reactor tying it all to one UDP socket
//!
//! ## Example
//!
//! ```no_run
//! use waypost_core::TokioProviders;
//! use waypost_domain::{DomainServer, DomainServerConfig};
//!
//! # async fn run() -> Result<(), waypost_domain::DomainError> {
//! let server = DomainServer::new(TokioProviders::new(), DomainServerConfig::default()).await?;
//! server.run(async { let _ = tokio::signal::ctrl_c().await; }).await
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod error;
pub mod keys;
pub mod negotiator;
pub mod registry;
pub mod server;
pub mod views;

pub use config::{
    AssignmentConfig, ConfigError, DEFAULT_DOMAIN_SERVER_PORT, DomainServerConfig,
    RESTART_EXIT_CODE, TimingConfig, TlsConfig,
};
pub use error::DomainError;
pub use keys::{KeyError, KeyLookup, UserKeyCache, load_public_key, verify_username_signature};
pub use negotiator::{Admission, ConnectDecision, ConnectionNegotiator, DropReason};
pub use registry::{AssignmentRegistry, PendingAssignedNode};
pub use server::DomainServer;
pub use views::{AssignmentView, AssignmentsView, NodeView};
