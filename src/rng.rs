//! Random source injected into a session, plus seed derivation.
//!
//! Every phase runs on its own seed derived from the session seed, so a
//! logged phase can be reproduced without replaying the phases before it.

use rand::{rngs::StdRng, Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::design::{Phase, PHASE_COUNT};

pub trait RandomSource {
    /// Uniform variate in `[0, 1)`.
    fn uniform(&mut self) -> f64;

    /// Restart the stream from `seed`.
    fn reseed(&mut self, seed: u64);
}

impl RandomSource for StdRng {
    fn uniform(&mut self) -> f64 {
        self.gen::<f64>()
    }

    fn reseed(&mut self, seed: u64) {
        *self = StdRng::seed_from_u64(seed);
    }
}

/// Replays a fixed list of variates, cycling when exhausted. Ignores reseeds.
#[derive(Debug, Clone)]
pub struct Scripted {
    values: Vec<f64>,
    idx: usize,
}

impl Scripted {
    /// # Panics
    ///
    /// Panics if `values` is empty.
    pub fn new(values: Vec<f64>) -> Self {
        assert!(!values.is_empty(), "scripted source needs at least one value");
        Self { values, idx: 0 }
    }

    pub fn consumed(&self) -> usize {
        self.idx
    }
}

impl RandomSource for Scripted {
    fn uniform(&mut self) -> f64 {
        let v = self.values[self.idx % self.values.len()];
        self.idx += 1;
        v
    }

    fn reseed(&mut self, _seed: u64) {}
}

/// SHA-256 of `base || label`, first 8 bytes little-endian.
pub fn derive_seed(base: u64, label: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(base.to_le_bytes());
    hasher.update(label.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

pub fn participant_seed(base: u64, participant_id: &str) -> u64 {
    derive_seed(base, &format!("participant:{}", participant_id))
}

pub fn phase_seed(session_seed: u64, phase: Phase) -> u64 {
    derive_seed(session_seed, &format!("phase:{}", phase.id()))
}

/// Seed from OS entropy, for sessions that are not pinned by config.
pub fn fresh_seed() -> u64 {
    rand::thread_rng().gen()
}

/// Fisher-Yates over the three phases; uniform over all 6 orders.
pub fn shuffle_phases<R: RandomSource + ?Sized>(rng: &mut R) -> [Phase; PHASE_COUNT] {
    let mut order = Phase::ALL;
    for i in (1..order.len()).rev() {
        let j = ((rng.uniform() * (i + 1) as f64) as usize).min(i);
        order.swap(i, j);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_derive_seed_deterministic() {
        assert_eq!(derive_seed(7, "phase:1"), derive_seed(7, "phase:1"));
        assert_ne!(derive_seed(7, "phase:1"), derive_seed(7, "phase:2"));
        assert_ne!(derive_seed(7, "phase:1"), derive_seed(8, "phase:1"));
    }

    #[test]
    fn test_phase_seeds_differ() {
        let seeds: HashSet<u64> = Phase::ALL.iter().map(|p| phase_seed(42, *p)).collect();
        assert_eq!(seeds.len(), 3);
    }

    #[test]
    fn test_shuffle_reaches_every_order() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut seen = HashSet::new();
        for _ in 0..600 {
            let order = shuffle_phases(&mut rng);
            let mut sorted = order;
            sorted.sort();
            assert_eq!(sorted, Phase::ALL);
            seen.insert(order);
        }
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn test_shuffle_with_edge_variates() {
        let mut low = Scripted::new(vec![0.0]);
        let mut high = Scripted::new(vec![0.999_999]);
        assert_eq!(shuffle_phases(&mut low), [Phase::Two, Phase::Three, Phase::One]);
        assert_eq!(shuffle_phases(&mut high), Phase::ALL);
    }

    #[test]
    fn test_reseed_restarts_stream() {
        let mut rng = StdRng::seed_from_u64(0);
        rng.reseed(99);
        let a: Vec<f64> = (0..4).map(|_| rng.uniform()).collect();
        rng.reseed(99);
        let b: Vec<f64> = (0..4).map(|_| rng.uniform()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_scripted_cycles() {
        let mut s = Scripted::new(vec![0.1, 0.2]);
        assert_eq!(s.uniform(), 0.1);
        assert_eq!(s.uniform(), 0.2);
        assert_eq!(s.uniform(), 0.1);
        assert_eq!(s.consumed(), 3);
    }

    #[test]
    #[should_panic(expected = "at least one value")]
    fn test_scripted_rejects_empty_script() {
        let _ = Scripted::new(Vec::new());
    }
}
