// Deterministic, portable pseudo-random number generation for mobility servers.
//
// Implements xoshiro256++ (Blackman & Vigna, 2019) with SplitMix64 seeding,
// plus the seed-mixing layer that turns a client-supplied 32-bit seed into the
// 64-bit base seed of a simulation.
//
// Module overview:
// - `lib.rs`:    `AgentRng`, the xoshiro256++ generator, and the per-agent
//                stream derivation (`AgentRng::for_agent`).
// - `mixer.rs`:  `SeedMixer` trait with a SHA-256 implementation
//                (`Sha256Mixer`) and a pass-through one for tests.
//
// **Critical constraint: determinism.** A mobility session is reproducible
// from `(seed, agent index)` alone. Each agent draws from its own generator,
// derived from the mixed session seed and the agent index, so adding agents
// to a session never changes what an existing agent does. Every method here
// must produce identical output for identical prior state on every platform.
// No floating-point arithmetic in this crate.

pub mod mixer;

pub use mixer::{PassthroughMixer, SeedMixer, Sha256Mixer};

use serde::{Deserialize, Serialize};

/// Odd constant used to spread agent indices across the seed space before
/// SplitMix64 finalizes them.
const AGENT_STREAM_STRIDE: u64 = 0xD1B5_4A32_D192_ED03;

/// Xoshiro256++ PRNG. One instance drives one agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentRng {
    s: [u64; 4],
}

impl AgentRng {
    /// Create a new PRNG seeded from a `u64`.
    ///
    /// Uses SplitMix64 to expand the seed into the 256-bit internal state.
    pub fn new(seed: u64) -> Self {
        let mut sm = seed;
        Self {
            s: [
                splitmix64(&mut sm),
                splitmix64(&mut sm),
                splitmix64(&mut sm),
                splitmix64(&mut sm),
            ],
        }
    }

    /// Create the generator for one agent of a session.
    ///
    /// The result depends only on the mixed session seed and the agent index,
    /// never on how many agents the session has.
    pub fn for_agent(session_seed: u64, agent: u32) -> Self {
        let mut sm = session_seed
            ^ (u64::from(agent).wrapping_add(1)).wrapping_mul(AGENT_STREAM_STRIDE);
        Self::new(splitmix64(&mut sm))
    }

    /// Generate the next `u64` in the sequence.
    pub fn next_u64(&mut self) -> u64 {
        let result = (self.s[0].wrapping_add(self.s[3]))
            .rotate_left(23)
            .wrapping_add(self.s[0]);

        let t = self.s[1] << 17;

        self.s[2] ^= self.s[0];
        self.s[3] ^= self.s[1];
        self.s[1] ^= self.s[2];
        self.s[0] ^= self.s[3];

        self.s[2] ^= t;
        self.s[3] = self.s[3].rotate_left(45);

        result
    }

    /// Generate a `u32` by taking the upper 32 bits of a `u64`.
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    /// Generate a uniform random integer in `[low, high)`.
    ///
    /// Uses rejection sampling to avoid modulo bias.
    /// Panics if `low >= high`.
    pub fn range_u64(&mut self, low: u64, high: u64) -> u64 {
        assert!(low < high, "range_u64: low must be less than high");
        let range = high - low;
        if range.is_power_of_two() {
            return low + (self.next_u64() & (range - 1));
        }
        let threshold = range.wrapping_neg() % range;
        loop {
            let r = self.next_u64();
            if r >= threshold {
                return low + (r % range);
            }
        }
    }

    /// Generate a uniform random `u32` in `[low, high]` (inclusive on both
    /// ends). Unlike `range_u64` this accepts `low == high`, which lets config
    /// ranges collapse to a single value.
    ///
    /// Panics if `low > high`.
    pub fn range_u32_inclusive(&mut self, low: u32, high: u32) -> u32 {
        assert!(low <= high, "range_u32_inclusive: low must be <= high");
        self.range_u64(u64::from(low), u64::from(high) + 1) as u32
    }

    /// Return `true` with probability `per_mille / 1000`. Values of 1000 and
    /// above always return true; 0 always returns false.
    pub fn chance_per_mille(&mut self, per_mille: u32) -> bool {
        if per_mille == 0 {
            return false;
        }
        if per_mille >= 1000 {
            return true;
        }
        self.range_u64(0, 1000) < u64::from(per_mille)
    }
}

/// SplitMix64, used for seeding xoshiro256++ and for deriving agent streams.
pub(crate) fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
