//! # waypost-core
//!
//! Core abstractions shared by the domain coordinator and the assignment
//! client:
//!
//! - **Provider traits**: datagram networking, time and randomness, bundled
//!   behind [`Providers`] so the same coordinator code runs on real Tokio
//!   sockets and on the in-memory network used by the tests
//! - **Type tags**: [`NodeType`] and [`AssignmentType`], the wire bytes every
//!   packet and registry keys on
//! - **Local port discovery**: the named shared-memory segment through which a
//!   co-located coordinator publishes its UDP port
//!
//! ## Provider Traits
//!
//! - [`NetworkProvider`] / [`DatagramSocket`]: bind and use UDP sockets
//! - [`TimeProvider`]: monotonic time for last-heard bookkeeping
//! - [`RandomProvider`]: UUIDs and secrets, deterministic under a seed

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

mod local_port;
mod memory;
mod network;
mod providers;
mod random;
mod time;
mod types;

pub use local_port::{LOCAL_PORT_SEGMENT, LocalPortSegment, read_local_port};
pub use memory::{MemoryNetwork, MemoryProviders, MemorySocket};
pub use network::{DatagramSocket, NetworkProvider, TokioNetworkProvider, TokioUdpSocket};
pub use providers::{Providers, TokioProviders};
pub use random::{RandomProvider, SeededRandomProvider, TokioRandomProvider};
pub use time::{ManualTimeProvider, TimeProvider, TokioTimeProvider};
pub use types::{AssignmentType, NodeType, TypeTagError};

/// Re-exported so downstream crates name one UUID type.
pub use uuid::Uuid;
