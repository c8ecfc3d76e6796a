//! # waypost-assignment
//!
//! The worker side of a waypost cluster. An [`AssignmentClient`] polls the
//! domain coordinator for an assignment, turns the one it receives into a
//! [`Workload`], and hands its node list to a [`WorkerContext`] that runs the
//! assignment on its own task. When the worker finishes, the node list comes
//! back and the client polls again.
//!
//! The node list is owned by exactly one side at a time: it moves into the
//! worker with [`AssignmentClient::start_assignment`] and back with
//! [`AssignmentClient::finish_assignment`].

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod client;
pub mod error;
pub mod factory;
pub mod worker;

pub use client::{ASSIGNMENT_REQUEST_INTERVAL, AssignmentClient, ClientConfig, ClientState};
pub use error::ClientError;
pub use factory::Workload;
pub use worker::{
    DOMAIN_CHECK_IN_INTERVAL, MAX_SILENT_DOMAIN_CHECK_INS, PEER_PING_INTERVAL, WorkerContext,
    WorkerOutcome, WorkerTransport,
};
