//! Random number generation provider abstraction.
//!
//! Node UUIDs, deploy UUIDs, connection secrets and STUN transaction IDs are
//! all drawn from a [`RandomProvider`], so a seeded provider makes a whole
//! coordinator run reproducible.

use std::cell::RefCell;
use std::sync::{Arc, Mutex};

use rand::distr::{Distribution, StandardUniform};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use uuid::Uuid;

/// Provider trait for random number generation.
pub trait RandomProvider: Clone + Send + Sync + 'static {
    /// Generate a random value of type T.
    fn random<T>(&self) -> T
    where
        StandardUniform: Distribution<T>;

    /// Generate a version-4 layout UUID from this provider's randomness.
    fn new_uuid(&self) -> Uuid {
        uuid::Builder::from_random_bytes(self.random::<[u8; 16]>()).into_uuid()
    }
}

/// Production random provider using thread-local RNG.
#[derive(Clone, Default, Debug)]
pub struct TokioRandomProvider;

impl TokioRandomProvider {
    /// Create a new production random provider.
    pub fn new() -> Self {
        Self
    }
}

thread_local! {
    static RNG: RefCell<rand::rngs::ThreadRng> = RefCell::new(rand::rng());
}

impl RandomProvider for TokioRandomProvider {
    fn random<T>(&self) -> T
    where
        StandardUniform: Distribution<T>,
    {
        RNG.with(|rng| rng.borrow_mut().random())
    }
}

/// Deterministic provider backed by a seeded ChaCha8 stream.
///
/// Clones draw from the same stream.
#[derive(Clone, Debug)]
pub struct SeededRandomProvider {
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl SeededRandomProvider {
    /// Create a provider from a seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
        }
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut ChaCha8Rng) -> R) -> R {
        let mut guard = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

impl RandomProvider for SeededRandomProvider {
    fn random<T>(&self) -> T
    where
        StandardUniform: Distribution<T>,
    {
        self.with_rng(|rng| rng.random())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_provider_is_reproducible() {
        let a = SeededRandomProvider::new(7);
        let b = SeededRandomProvider::new(7);
        assert_eq!(a.new_uuid(), b.new_uuid());
        assert_eq!(a.random::<u64>(), b.random::<u64>());
    }

    #[test]
    fn test_new_uuid_has_v4_layout() {
        let uuid = TokioRandomProvider::new().new_uuid();
        assert_eq!(uuid.get_version_num(), 4);
        assert!(!uuid.is_nil());
    }
}
