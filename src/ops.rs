//! Device kernels: assignment counting, Phi folding, token resampling and
//! likelihood evaluation.

use std::sync::atomic::{AtomicBool, Ordering};

use clap::ValueEnum;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::alias::SpAlias;
use crate::buffer::DeviceBuffer;
use crate::device::DeviceContext;
use crate::error::{EngineError, Result};
use crate::matrix::CountMatrix;
use crate::poisson::{Poisson, StreamKey};

/// How accumulated counts become a new Phi.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PhiEstimator {
    /// `(n + beta) / (n_k + V * beta)` over the observed vocabulary.
    #[default]
    PosteriorMean,
    /// Normalised `Poisson(n + beta)` draws, a sparse Dirichlet approximation.
    PolyaUrn,
}

/// Count the current assignments of a mirror into `n`. Returns the number of
/// tokens counted.
pub fn count_assignments(
    ctx: &DeviceContext,
    mirror: &DeviceBuffer,
    n: &CountMatrix,
) -> Result<u64> {
    let (k, v) = (n.rows(), n.cols());
    let words = mirror.words();
    let topics = mirror.topics();
    ctx.launch("count_assignments", || {
        words
            .par_iter()
            .zip(topics.par_iter())
            .for_each(|(&w, &z)| {
                let (w, z) = (w as usize, z as usize);
                assert!(z < k, "topic {z} out of range for {k} topics");
                assert!(w < v, "word id {w} out of range for vocabulary of {v}");
                n.increment(z, w);
            });
        words.len() as u64
    })
}

/// Fold accumulated counts into a new `K × V` Phi written to `out`.
#[allow(clippy::too_many_arguments)]
pub fn fold_phi(
    ctx: &DeviceContext,
    n: &CountMatrix,
    observed: &[AtomicBool],
    beta: f32,
    estimator: PhiEstimator,
    pois: &Poisson,
    round: u64,
    out: &mut [f32],
) -> Result<()> {
    let (k, v) = (n.rows(), n.cols());
    assert_eq!(out.len(), k * v, "phi buffer {} != {}x{}", out.len(), k, v);
    assert_eq!(observed.len(), v, "observed flags {} != V {}", observed.len(), v);
    if v == 0 {
        return Ok(());
    }
    let seen: Vec<bool> = observed.iter().map(|f| f.load(Ordering::Relaxed)).collect();
    let v_obs = seen.iter().filter(|&&s| s).count();

    ctx.launch("fold_phi", || match estimator {
        PhiEstimator::PosteriorMean => {
            let totals = n.row_totals();
            out.par_chunks_mut(v).enumerate().for_each(|(topic, row)| {
                let denom = totals[topic] as f64 + v_obs as f64 * beta as f64;
                for (word, cell) in row.iter_mut().enumerate() {
                    *cell = if seen[word] && denom > 0.0 {
                        ((n.get(topic, word) as f64 + beta as f64) / denom) as f32
                    } else {
                        0.0
                    };
                }
            });
        }
        PhiEstimator::PolyaUrn => {
            out.par_chunks_mut(v).enumerate().for_each(|(topic, row)| {
                let mut rng = pois.stream(StreamKey::fold(round, topic));
                let mut sum = 0u64;
                for (word, cell) in row.iter_mut().enumerate() {
                    let draw = if seen[word] {
                        pois.draw(n.get(topic, word) as f32 + beta, &mut rng)
                    } else {
                        0
                    };
                    sum += draw as u64;
                    *cell = draw as f32;
                }
                if sum == 0 {
                    let uniform = if v_obs > 0 { 1.0 / v_obs as f32 } else { 0.0 };
                    for (word, cell) in row.iter_mut().enumerate() {
                        *cell = if seen[word] { uniform } else { 0.0 };
                    }
                } else {
                    let inv = 1.0 / sum as f64;
                    for cell in row.iter_mut() {
                        *cell = (*cell as f64 * inv) as f32;
                    }
                }
            });
        }
    })
}

/// Read-only model state shared by every token lane of a sampling kernel.
pub struct SamplingInputs<'a> {
    pub phi: &'a [f32],
    pub alias: &'a SpAlias,
    pub pois: &'a Poisson,
    pub n: &'a CountMatrix,
    pub alpha: f32,
    /// Poisson virtual copies per token.
    pub copies: u32,
    pub round: u64,
}

impl SamplingInputs<'_> {
    fn num_topics(&self) -> usize {
        self.n.rows()
    }

    fn vocab_size(&self) -> usize {
        self.n.cols()
    }

    /// Rate of the per-token augmentation draw: the sum of `copies`
    /// Poisson(alpha) virtual copies.
    pub fn augmentation_rate(&self) -> f32 {
        self.alpha * self.copies as f32
    }
}

#[derive(Default)]
struct DocScratch {
    counts: Vec<u32>,
    topics: Vec<u32>,
    cdf: Vec<f32>,
}

impl DocScratch {
    fn new(k: usize) -> Self {
        Self {
            counts: vec![0; k],
            ..Default::default()
        }
    }
}

/// Split `z` into disjoint per-document slices, paired with their words.
fn split_documents<'a>(
    kernel: &'static str,
    layout: &[(usize, usize, usize)],
    words: &'a [u32],
    mut rest: &'a mut [u32],
) -> Result<Vec<(usize, &'a [u32], &'a mut [u32])>> {
    let mut cursor = 0;
    let mut docs = Vec::with_capacity(layout.len());
    for &(doc, start, len) in layout {
        if start < cursor || start + len > words.len() {
            return Err(EngineError::DeviceFault {
                kernel,
                message: format!(
                    "document {doc} spans [{start}, {}) which overlaps or exceeds {} tokens",
                    start + len,
                    words.len()
                ),
            });
        }
        let tail = std::mem::take(&mut rest);
        let (_, tail) = tail.split_at_mut(start - cursor);
        let (topics, tail) = tail.split_at_mut(len);
        rest = tail;
        cursor = start + len;
        docs.push((doc, &words[start..start + len], topics));
    }
    Ok(docs)
}

/// Resample every token of a mirror in place, accumulating into `n`.
///
/// Documents run in parallel. Inside a document each token conditions on the
/// document's topic counts as of kernel start (its own old topic removed) and
/// on a Poisson-augmented prior, so tokens never wait on each other's new
/// values. Returns the number of tokens resampled.
pub fn sample_tokens(
    ctx: &DeviceContext,
    mirror: &mut DeviceBuffer,
    buffer_index: usize,
    inputs: &SamplingInputs<'_>,
) -> Result<u64> {
    let layout = mirror.layout();
    let sweep = mirror.sweeps;
    let size = mirror.size;
    let words = mirror.w.view(0, size);
    let topics = &mut mirror.z.as_mut_slice()[..size];
    let docs = split_documents("sample_z", &layout, words, topics)?;
    let k = inputs.num_topics();

    let sampled = ctx.launch("sample_z", || {
        docs.into_par_iter()
            .map_init(
                || DocScratch::new(k),
                |scratch, (doc, words, topics)| {
                    let mut rng = inputs
                        .pois
                        .stream(StreamKey::tokens(inputs.round, buffer_index, sweep, doc));
                    resample_document(inputs, words, topics, scratch, &mut rng);
                    words.len() as u64
                },
            )
            .sum::<u64>()
    })?;
    mirror.sweeps += 1;
    Ok(sampled)
}

fn resample_document<R: Rng + ?Sized>(
    inputs: &SamplingInputs<'_>,
    words: &[u32],
    topics: &mut [u32],
    scratch: &mut DocScratch,
    rng: &mut R,
) {
    let (k, v) = (inputs.num_topics(), inputs.vocab_size());
    let DocScratch {
        counts,
        topics: present,
        cdf,
    } = scratch;

    present.clear();
    for &z in topics.iter() {
        let z = z as usize;
        assert!(z < k, "topic {z} out of range for {k} topics");
        if counts[z] == 0 {
            present.push(z as u32);
        }
        counts[z] += 1;
    }

    let rate = inputs.augmentation_rate();
    let inv_copies = 1.0 / inputs.copies as f32;
    for (i, &w) in words.iter().enumerate() {
        let w = w as usize;
        assert!(w < v, "word id {w} out of range for vocabulary of {v}");
        let old = topics[i] as usize;

        cdf.clear();
        let mut data = 0.0f32;
        for &t in present.iter() {
            let t = t as usize;
            let c = counts[t] - u32::from(t == old);
            data += c as f32 * inputs.phi[t * v + w];
            cdf.push(data);
        }

        let prior = inputs.pois.draw(rate, rng) as f32 * inv_copies * inputs.alias.mass(w);
        let total = prior + data;
        let new = if !(total > 0.0) {
            inputs.alias.sample(w, rng)
        } else {
            let u = rng.random::<f32>() * total;
            if u < prior || data <= 0.0 {
                inputs.alias.sample(w, rng)
            } else {
                let target = u - prior;
                let j = cdf.partition_point(|&c| c <= target).min(present.len() - 1);
                present[j]
            }
        };
        topics[i] = new;
        inputs.n.increment(new as usize, w);
    }

    for &t in present.iter() {
        counts[t as usize] = 0;
    }
}

/// Sum of per-token log predictive likelihoods over one mirror, with the
/// document mixture estimated from the current assignments. Returns
/// `(sum, tokens)`. Per-document sums are added in document order, so the
/// result does not depend on the thread count.
pub fn log_likelihood(
    ctx: &DeviceContext,
    mirror: &DeviceBuffer,
    phi: &[f32],
    k: usize,
    alpha: f32,
) -> Result<(f64, u64)> {
    let v = if k == 0 { 0 } else { phi.len() / k };
    let layout = mirror.layout();
    let words = mirror.words();
    let topics = mirror.topics();
    let alpha = alpha as f64;

    ctx.launch("log_likelihood", || {
        layout
            .par_iter()
            .map_init(
                || vec![0u32; k],
                |counts, &(_, start, len)| {
                    let (w, z) = (&words[start..start + len], &topics[start..start + len]);
                    counts.fill(0);
                    for &t in z {
                        counts[t as usize] += 1;
                    }
                    let denom = len as f64 + k as f64 * alpha;
                    let mut sum = 0.0f64;
                    for &word in w {
                        let word = word as usize;
                        let p: f64 = (0..k)
                            .map(|t| phi[t * v + word] as f64 * (counts[t] as f64 + alpha))
                            .sum::<f64>()
                            / denom;
                        sum += p.max(f64::MIN_POSITIVE).ln();
                    }
                    (sum, len as u64)
                },
            )
            .collect::<Vec<_>>()
            .into_iter()
            .fold((0.0, 0), |a, b| (a.0 + b.0, a.1 + b.1))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::device::DeviceConfig;

    fn ctx() -> DeviceContext {
        DeviceContext::new(DeviceConfig::default().with_threads(2)).unwrap()
    }

    fn flags(v: usize, seen: &[usize]) -> Vec<AtomicBool> {
        (0..v).map(|w| AtomicBool::new(seen.contains(&w))).collect()
    }

    #[test]
    fn test_posterior_mean_rows_normalise() {
        let ctx = ctx();
        let n = CountMatrix::new(&ctx, 2, 3, "n").unwrap();
        n.increment(0, 0);
        n.increment(0, 0);
        n.increment(1, 1);
        let pois = Poisson::new(0, []);
        let mut out = vec![0.0; 6];
        fold_phi(
            &ctx,
            &n,
            &flags(3, &[0, 1]),
            0.5,
            PhiEstimator::PosteriorMean,
            &pois,
            0,
            &mut out,
        )
        .unwrap();
        // Row 0: (2.5, 0.5) / 3; row 1: (0.5, 1.5) / 2; word 2 unobserved.
        let want = [2.5 / 3.0, 0.5 / 3.0, 0.0, 0.25, 0.75, 0.0];
        for (g, w) in out.iter().zip(want) {
            assert!((g - w).abs() < 1e-6, "{out:?}");
        }
    }

    #[test]
    fn test_polya_urn_rows_are_distributions() {
        let ctx = ctx();
        let n = CountMatrix::new(&ctx, 3, 4, "n").unwrap();
        for _ in 0..40 {
            n.increment(0, 1);
        }
        let pois = Poisson::new(3, (0..=16).map(|j| j as f32 + 0.1));
        let mut out = vec![0.0; 12];
        let observed = flags(4, &[0, 1, 2]);
        fold_phi(&ctx, &n, &observed, 0.1, PhiEstimator::PolyaUrn, &pois, 1, &mut out).unwrap();
        for row in out.chunks(4) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "{out:?}");
            assert_eq!(row[3], 0.0);
        }
        assert!(out[1] > 0.8, "{out:?}");

        let mut again = vec![0.0; 12];
        fold_phi(&ctx, &n, &observed, 0.1, PhiEstimator::PolyaUrn, &pois, 1, &mut again).unwrap();
        assert_eq!(out, again);
    }

    #[test]
    fn test_overlapping_documents_fault() {
        let words = [0u32; 4];
        let mut topics = [0u32; 4];
        let layout = [(0, 0, 3), (1, 2, 2)];
        let err = split_documents("t", &layout, &words, &mut topics).err().unwrap();
        assert!(matches!(err, EngineError::DeviceFault { kernel: "t", .. }));
    }

    #[test]
    fn test_sample_tokens_accumulates_every_token() {
        let ctx = ctx();
        let buffer = Buffer::from_documents(&[vec![0u32, 1, 1], vec![2, 0]]);
        let mut mirror = DeviceBuffer::new(&ctx, &buffer).unwrap();
        mirror.upload(&buffer).unwrap();

        let (k, v) = (3, 3);
        let n = CountMatrix::new(&ctx, k, v, "n").unwrap();
        let phi = vec![1.0 / 3.0; k * v];
        let mut alias = SpAlias::new(&ctx, k, v).unwrap();
        alias.rebuild(&ctx, &phi, None, 0.0, true).unwrap();
        let pois = Poisson::new(1, [0.4]);
        let inputs = SamplingInputs {
            phi: &phi,
            alias: &alias,
            pois: &pois,
            n: &n,
            alpha: 0.1,
            copies: 4,
            round: 1,
        };

        let sampled = sample_tokens(&ctx, &mut mirror, 0, &inputs).unwrap();
        assert_eq!(sampled, 5);
        assert_eq!(n.total(), 5);
        assert!(mirror.topics().iter().all(|&z| (z as usize) < k));
        assert_eq!(mirror.sweeps, 1);

        let (ll, tokens) = log_likelihood(&ctx, &mirror, &phi, k, 0.1).unwrap();
        assert_eq!(tokens, 5);
        assert!(ll.is_finite() && ll < 0.0);

        let serial = DeviceContext::new(DeviceConfig::default().with_threads(1)).unwrap();
        let (ll_serial, _) = log_likelihood(&serial, &mirror, &phi, k, 0.1).unwrap();
        assert_eq!(ll.to_bits(), ll_serial.to_bits());
    }
}
