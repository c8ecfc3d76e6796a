//! Provider bundle trait for simplified type parameters.
//!
//! Code that needs sockets, a clock and randomness carries a single
//! `P: Providers` instead of three separate parameters:
//!
//! ```text
//! struct LimitedNodeList<P: Providers>
//! ```

use crate::{
    NetworkProvider, RandomProvider, TimeProvider, TokioNetworkProvider, TokioRandomProvider,
    TokioTimeProvider,
};

/// Bundle of all provider types for a runtime environment.
///
/// ## Implementations
///
/// - [`TokioProviders`]: production providers on real sockets
/// - [`MemoryProviders`](crate::MemoryProviders): in-memory network, manual
///   clock and seeded randomness for tests
pub trait Providers: Clone + Send + Sync + 'static {
    /// Network provider type for datagram sockets.
    type Network: NetworkProvider;

    /// Time provider type.
    type Time: TimeProvider;

    /// Random provider type.
    type Random: RandomProvider;

    /// Get the network provider instance.
    fn network(&self) -> &Self::Network;

    /// Get the time provider instance.
    fn time(&self) -> &Self::Time;

    /// Get the random provider instance.
    fn random(&self) -> &Self::Random;
}

/// Production providers using the Tokio runtime.
#[derive(Clone, Debug, Default)]
pub struct TokioProviders {
    network: TokioNetworkProvider,
    time: TokioTimeProvider,
    random: TokioRandomProvider,
}

impl TokioProviders {
    /// Create a new production providers bundle.
    pub fn new() -> Self {
        Self {
            network: TokioNetworkProvider::new(),
            time: TokioTimeProvider::new(),
            random: TokioRandomProvider::new(),
        }
    }
}

impl Providers for TokioProviders {
    type Network = TokioNetworkProvider;
    type Time = TokioTimeProvider;
    type Random = TokioRandomProvider;

    fn network(&self) -> &Self::Network {
        &self.network
    }

    fn time(&self) -> &Self::Time {
        &self.time
    }

    fn random(&self) -> &Self::Random {
        &self.random
    }
}
