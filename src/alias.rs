//! Per-word alias tables over topics.
//!
//! Each word owns `K` `(prob, alias)` slots built with Vose's method from its
//! column of Phi, giving O(1) topic draws. Tables are only rebuilt for words
//! whose column moved since the last build, with a periodic full rebuild.

use rand::Rng;
use rayon::prelude::*;

use crate::device::{DeviceContext, DeviceSlice};
use crate::error::Result;

/// Outcome of a rebuild pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RebuildStats {
    pub rebuilt: usize,
    pub skipped: usize,
}

/// Reusable work space for table construction.
#[derive(Default)]
struct Scratch {
    column: Vec<f32>,
    scaled: Vec<f64>,
    small: Vec<u32>,
    large: Vec<u32>,
}

pub struct SpAlias {
    k: usize,
    v: usize,
    prob: DeviceSlice<f32>,
    alias: DeviceSlice<u32>,
    mass: DeviceSlice<f32>,
}

impl SpAlias {
    /// Allocate tables for `v` words over `k` topics. Every table starts
    /// uniform.
    pub fn new(ctx: &DeviceContext, k: usize, v: usize) -> Result<Self> {
        let mut prob: DeviceSlice<f32> = ctx.alloc_matrix(v, k, "alias probabilities")?;
        let mut alias: DeviceSlice<u32> = ctx.alloc_matrix(v, k, "alias outcomes")?;
        let mass = ctx.alloc_zeros(v, "alias column mass")?;
        if k > 0 {
            prob.as_mut_slice()
                .par_chunks_mut(k)
                .zip(alias.as_mut_slice().par_chunks_mut(k))
                .for_each(|(p, a)| uniform(p, a));
        }
        Ok(Self {
            k,
            v,
            prob,
            alias,
            mass,
        })
    }

    pub fn num_topics(&self) -> usize {
        self.k
    }

    pub fn num_words(&self) -> usize {
        self.v
    }

    /// Total Phi mass of the column this word's table was built from.
    /// Zero marks a degenerate (uniform) table.
    #[inline]
    pub fn mass(&self, word: usize) -> f32 {
        self.mass.as_slice()[word]
    }

    /// Build one word's table from its column of `phi` (`K × V`, row-major).
    pub fn build(&mut self, word: usize, phi: &[f32]) {
        let (k, v) = (self.k, self.v);
        let mut scratch = Scratch::default();
        gather_column(phi, v, word, k, &mut scratch.column);
        let range = word * k..(word + 1) * k;
        let mass = build_table(
            &mut scratch,
            &mut self.prob.as_mut_slice()[range.clone()],
            &mut self.alias.as_mut_slice()[range],
        );
        self.mass.as_mut_slice()[word] = mass;
    }

    /// Rebuild tables against a freshly computed `phi_new`.
    ///
    /// With `full` unset and a previous version `phi_old` available, a word is
    /// skipped when no entry of its column changed by more than `tolerance`
    /// relative to the old value (`0.0` rebuilds on any change).
    pub fn rebuild(
        &mut self,
        ctx: &DeviceContext,
        phi_new: &[f32],
        phi_old: Option<&[f32]>,
        tolerance: f32,
        full: bool,
    ) -> Result<RebuildStats> {
        let (k, v) = (self.k, self.v);
        if k == 0 || v == 0 {
            return Ok(RebuildStats::default());
        }
        let prob = self.prob.as_mut_slice();
        let alias = self.alias.as_mut_slice();
        let mass = self.mass.as_mut_slice();

        ctx.launch("alias_rebuild", || {
            prob.par_chunks_mut(k)
                .zip(alias.par_chunks_mut(k))
                .zip(mass.par_iter_mut())
                .enumerate()
                .map_init(Scratch::default, |scratch, (word, ((p, a), m))| {
                    let stale = full
                        || phi_old
                            .is_none_or(|old| column_changed(phi_new, old, v, word, k, tolerance));
                    if !stale {
                        return RebuildStats {
                            rebuilt: 0,
                            skipped: 1,
                        };
                    }
                    gather_column(phi_new, v, word, k, &mut scratch.column);
                    *m = build_table(scratch, p, a);
                    RebuildStats {
                        rebuilt: 1,
                        skipped: 0,
                    }
                })
                .reduce(RebuildStats::default, |x, y| RebuildStats {
                    rebuilt: x.rebuilt + y.rebuilt,
                    skipped: x.skipped + y.skipped,
                })
        })
    }

    /// Draw a topic for `word` in O(1).
    #[inline]
    pub fn sample<R: Rng + ?Sized>(&self, word: usize, rng: &mut R) -> u32 {
        let slot = rng.random_range(0..self.k);
        let i = word * self.k + slot;
        if rng.random::<f32>() < self.prob.as_slice()[i] {
            slot as u32
        } else {
            self.alias.as_slice()[i]
        }
    }

    /// The distribution over topics this word's table encodes.
    pub fn distribution(&self, word: usize) -> Vec<f64> {
        let k = self.k;
        let prob = self.prob.view(word * k, k);
        let alias = self.alias.view(word * k, k);
        let mut out = vec![0.0f64; k];
        for slot in 0..k {
            let p = prob[slot].clamp(0.0, 1.0) as f64;
            out[slot] += p / k as f64;
            out[alias[slot] as usize] += (1.0 - p) / k as f64;
        }
        out
    }
}

fn gather_column(phi: &[f32], v: usize, word: usize, k: usize, out: &mut Vec<f32>) {
    out.clear();
    out.extend((0..k).map(|topic| phi[topic * v + word]));
}

fn column_changed(
    new: &[f32],
    old: &[f32],
    v: usize,
    word: usize,
    k: usize,
    tolerance: f32,
) -> bool {
    (0..k).any(|topic| {
        let (a, b) = (new[topic * v + word], old[topic * v + word]);
        if tolerance <= 0.0 {
            a.to_bits() != b.to_bits()
        } else {
            (a - b).abs() > tolerance * b.abs().max(f32::MIN_POSITIVE)
        }
    })
}

fn uniform(prob: &mut [f32], alias: &mut [u32]) {
    prob.fill(1.0);
    for (i, a) in alias.iter_mut().enumerate() {
        *a = i as u32;
    }
}

/// Vose's alias construction over `scratch.column`. Returns the column mass,
/// or 0 after falling back to a uniform table for degenerate columns.
fn build_table(scratch: &mut Scratch, prob: &mut [f32], alias: &mut [u32]) -> f32 {
    let k = prob.len();
    let weight = |w: f32| if w.is_finite() && w > 0.0 { w as f64 } else { 0.0 };
    let mass: f64 = scratch.column.iter().map(|&w| weight(w)).sum();
    if !(mass > 0.0 && mass.is_finite()) {
        uniform(prob, alias);
        return 0.0;
    }

    let Scratch {
        column,
        scaled,
        small,
        large,
    } = scratch;
    scaled.clear();
    scaled.extend(column.iter().map(|&w| weight(w) * k as f64 / mass));
    small.clear();
    large.clear();
    for (i, &s) in scaled.iter().enumerate() {
        if s < 1.0 {
            small.push(i as u32);
        } else {
            large.push(i as u32);
        }
    }

    while let (Some(&s), Some(&l)) = (small.last(), large.last()) {
        small.pop();
        large.pop();
        let (s, l) = (s as usize, l as usize);
        prob[s] = scaled[s] as f32;
        alias[s] = l as u32;
        scaled[l] = (scaled[l] + scaled[s]) - 1.0;
        if scaled[l] < 1.0 {
            small.push(l as u32);
        } else {
            large.push(l as u32);
        }
    }
    // Leftovers are 1 up to rounding.
    for &i in large.iter().chain(small.iter()) {
        prob[i as usize] = 1.0;
        alias[i as usize] = i;
    }
    mass as f32
}
