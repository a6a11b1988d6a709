//! Splittable deterministic random keys.
//!
//! A key is a 64-bit value that is never consumed directly: every place that
//! needs randomness derives its own sub-key with [`RngKey::split`] or
//! [`RngKey::fold_in`] and builds a `StdRng` from it. Equal keys always give
//! equal streams.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RngKey(u64);

impl RngKey {
    pub fn new(seed: u64) -> Self {
        Self(mix(seed))
    }

    /// Two independent children.
    pub fn split(self) -> (RngKey, RngKey) {
        (self.fold_in(0), self.fold_in(1))
    }

    pub fn split_n(self, n: usize) -> Vec<RngKey> {
        (0..n as u64).map(|i| self.fold_in(i)).collect()
    }

    /// Child key identified by `data`, e.g. a step number.
    pub fn fold_in(self, data: u64) -> RngKey {
        RngKey(mix(self.0 ^ mix(data.wrapping_add(GOLDEN_GAMMA))))
    }

    pub fn rng(self) -> StdRng {
        StdRng::seed_from_u64(self.0)
    }
}

/// SplitMix64 finalizer.
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
