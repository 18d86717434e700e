//! Poisson pseudo-count generator.
//!
//! Draws are cheap enough to take one per token per sweep: rates registered at
//! construction get an inverse-CDF table, other small rates use sequential
//! inversion, and large rates go to `rand_distr`'s PTRS sampler.
//!
//! Randomness is counter-based: every kernel lane derives its own generator
//! from the run seed and a [`StreamKey`], so results depend only on the seed
//! and the call sequence, never on how lanes are scheduled across threads.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Distribution;

/// Rates up to this use sequential inversion when not tabulated.
pub const DIRECT_RATE_LIMIT: f32 = 30.0;

/// Tail mass left out of a tabulated CDF.
const TABLE_TAIL: f64 = 1e-9;

/// Identifies one independent random stream within a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct StreamKey {
    pub round: u64,
    pub buffer: u64,
    pub sweep: u64,
    pub lane: u64,
}

impl StreamKey {
    /// Stream for one document lane of a token-sampling kernel.
    pub fn tokens(round: u64, buffer: usize, sweep: u64, doc: usize) -> Self {
        Self {
            round,
            buffer: buffer as u64 + 1,
            sweep,
            lane: doc as u64,
        }
    }

    /// Stream for one topic row of the Phi fold.
    pub fn fold(round: u64, topic: usize) -> Self {
        Self {
            round,
            buffer: 0,
            sweep: 0,
            lane: topic as u64,
        }
    }
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

struct PoissonTable {
    rate: f32,
    cdf: Vec<f32>,
}

impl PoissonTable {
    fn new(rate: f32) -> Self {
        let lambda = rate as f64;
        let mut pmf = (-lambda).exp();
        let mut acc = pmf;
        let mut cdf = vec![acc as f32];
        let mut x = 0u32;
        while 1.0 - acc > TABLE_TAIL && (x as f64) < lambda * 4.0 + 64.0 {
            x += 1;
            pmf *= lambda / x as f64;
            acc += pmf;
            cdf.push(acc as f32);
        }
        if let Some(last) = cdf.last_mut() {
            *last = 1.0;
        }
        Self { rate, cdf }
    }

    #[inline]
    fn sample(&self, u: f32) -> u32 {
        self.cdf.partition_point(|&c| c <= u) as u32
    }
}

/// Seeded Poisson augmentor.
pub struct Poisson {
    seed: u64,
    tables: Vec<PoissonTable>,
}

impl Poisson {
    /// Build an augmentor, tabulating every finite positive rate in
    /// `tabulated_rates` that is at most [`DIRECT_RATE_LIMIT`].
    pub fn new(seed: u64, tabulated_rates: impl IntoIterator<Item = f32>) -> Self {
        let mut tables: Vec<PoissonTable> = Vec::new();
        for rate in tabulated_rates {
            if !(rate.is_finite() && rate > 0.0 && rate <= DIRECT_RATE_LIMIT) {
                continue;
            }
            if tables.iter().any(|t| t.rate.to_bits() == rate.to_bits()) {
                continue;
            }
            tables.push(PoissonTable::new(rate));
        }
        tables.sort_by(|a, b| a.rate.total_cmp(&b.rate));
        Self { seed, tables }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn tabulated_rates(&self) -> impl Iterator<Item = f32> + '_ {
        self.tables.iter().map(|t| t.rate)
    }

    /// Deterministic generator for one kernel lane.
    pub fn stream(&self, key: StreamKey) -> StdRng {
        let mut h = splitmix64(self.seed);
        for part in [key.round, key.buffer, key.sweep, key.lane] {
            h = splitmix64(h ^ part);
        }
        StdRng::seed_from_u64(h)
    }

    fn table(&self, rate: f32) -> Option<&PoissonTable> {
        self.tables
            .binary_search_by(|t| t.rate.total_cmp(&rate))
            .ok()
            .map(|i| &self.tables[i])
    }

    /// Draw a Poisson(`rate`) count.
    #[inline]
    pub fn draw<R: Rng + ?Sized>(&self, rate: f32, rng: &mut R) -> u32 {
        debug_assert!(rate >= 0.0 && rate.is_finite(), "invalid Poisson rate {rate}");
        if !(rate > 0.0) || !rate.is_finite() {
            return 0;
        }
        if let Some(table) = self.table(rate) {
            return table.sample(rng.random::<f32>());
        }
        if rate <= DIRECT_RATE_LIMIT {
            return direct(rate as f64, rng);
        }
        match rand_distr::Poisson::new(rate as f64) {
            Ok(dist) => dist.sample(rng) as u32,
            Err(_) => rate.round() as u32,
        }
    }
}

/// Sequential inversion; expected cost grows with the rate.
fn direct<R: Rng + ?Sized>(lambda: f64, rng: &mut R) -> u32 {
    let u: f64 = rng.random();
    let mut pmf = (-lambda).exp();
    let mut acc = pmf;
    let mut x = 0u32;
    while u > acc {
        x += 1;
        pmf *= lambda / x as f64;
        acc += pmf;
        if pmf <= 0.0 {
            break;
        }
    }
    x
}
