use rand_core::{Error, RngCore, SeedableRng, impls};

/// Seed used when the configuration does not supply one.
pub const DEFAULT_SEED: u64 = -2_208_269_211_404_306_670i64 as u64;

const MULTIPLIER: u64 = 6_364_136_223_846_793_005;
const INCREMENT: u64 = 1_442_695_040_888_963_407;

/// Knuth's MMIX linear congruential generator behind `RND` and `RNDI`.
#[derive(Clone, Debug)]
pub struct KnuthLcg {
    state: u64,
}

impl KnuthLcg {
    pub const fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    #[inline(always)]
    fn advance(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(MULTIPLIER)
            .wrapping_add(INCREMENT);
        self.state
    }

    /// Next float uniformly distributed in `[0, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        (self.advance() >> 40) as f32 / (1u32 << 24) as f32
    }
}

impl Default for KnuthLcg {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

impl RngCore for KnuthLcg {
    fn next_u32(&mut self) -> u32 {
        (self.advance() >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        impls::next_u64_via_u32(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        impls::fill_bytes_via_next(self, dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl SeedableRng for KnuthLcg {
    type Seed = [u8; 8];

    fn from_seed(seed: Self::Seed) -> Self {
        Self::new(u64::from_le_bytes(seed))
    }

    fn seed_from_u64(state: u64) -> Self {
        Self::new(state)
    }
}
