// One-way seed mixing.
//
// Clients pick simulation seeds freely, and sequential seeds (1, 2, 3, ...)
// are the common case. Feeding them straight into SplitMix64 would give
// simulations whose agent streams are trivially related, so the server first
// passes every client seed through a `SeedMixer`. The default mixer hashes
// the seed with SHA-256 under a fixed domain tag and keeps the first eight
// bytes of the digest.
//
// The mixer sits behind a trait so the determinism properties of the
// mobility model can be tested with `PassthroughMixer` without depending on
// the digest values of a particular hash.

use sha2::{Digest, Sha256};

/// Domain tag prepended to the seed before hashing. Changing it changes every
/// simulation ever produced, so it is part of the determinism contract.
const SEED_DOMAIN: &[u8] = b"ambler/seed/v1";

/// Maps a client-supplied seed to the base seed of a simulation.
pub trait SeedMixer: Send + Sync {
    fn mix(&self, seed: u32) -> u64;
}

/// SHA-256 based mixer. The production default.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sha256Mixer;

impl SeedMixer for Sha256Mixer {
    fn mix(&self, seed: u32) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(SEED_DOMAIN);
        hasher.update(seed.to_be_bytes());
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(head)
    }
}

/// Uses the client seed unchanged. Only for tests and debugging.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughMixer;

impl SeedMixer for PassthroughMixer {
    fn mix(&self, seed: u32) -> u64 {
        u64::from(seed)
    }
}
