//! The training engine: model state, phase state machine and kernel dispatch.
//!
//! A run goes `initialize`, then alternating `sample_phi` / `sample_z` rounds,
//! then `cleanup`. `sample_phi` takes `&mut self` and `sample_z` takes `&self`,
//! so Phi can never be republished while a token kernel reads it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::alias::SpAlias;
use crate::buffer::{Buffer, BufferArena, DeviceBuffer};
use crate::device::{DeviceConfig, DeviceContext};
use crate::error::{EngineError, EngineState, Result};
use crate::matrix::{CountMatrix, MirroredMatrix};
use crate::ops::{self, PhiEstimator, SamplingInputs};
use crate::poisson::Poisson;

/// Counts whose `n + beta` Poisson rate gets a precomputed table for the
/// Pólya-urn fold.
const URN_TABULATED_COUNTS: u32 = 16;

/// Run parameters, fixed from `initialize` to `cleanup`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Args {
    /// Document-topic prior.
    pub alpha: f32,
    /// Topic-word prior.
    pub beta: f32,
    /// Topic count.
    pub k: u32,
    /// Poisson virtual copies per token.
    pub l: u32,
    pub seed: u64,
    /// Declared vocabulary size. Defaults to one past the largest word id in
    /// the initial buffers.
    pub vocab_size: Option<usize>,
    pub phi_estimator: PhiEstimator,
    /// Relative column change below which an alias table is kept.
    pub alias_tolerance: f32,
    /// Full alias rebuild every this many folds; 0 disables periodic rebuilds.
    pub alias_full_rebuild_every: u32,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            beta: 0.01,
            k: 10,
            l: 8,
            seed: 0,
            vocab_size: None,
            phi_estimator: PhiEstimator::default(),
            alias_tolerance: 0.0,
            alias_full_rebuild_every: 10,
        }
    }
}

impl Args {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(EngineError::InvalidArgs(msg));
        if self.k == 0 {
            return invalid("k must be positive".into());
        }
        if self.l == 0 {
            return invalid("l must be positive".into());
        }
        if !(self.alpha.is_finite() && self.alpha > 0.0) {
            return invalid(format!("alpha must be positive and finite, got {}", self.alpha));
        }
        if !(self.beta.is_finite() && self.beta > 0.0) {
            return invalid(format!("beta must be positive and finite, got {}", self.beta));
        }
        if !(self.alias_tolerance.is_finite() && self.alias_tolerance >= 0.0) {
            return invalid(format!(
                "alias_tolerance must be non-negative and finite, got {}",
                self.alias_tolerance
            ));
        }
        Ok(())
    }
}

/// Model state shared by every phase. Exists from `initialize` to `cleanup`.
struct Model {
    args: Args,
    vocab_size: usize,
    observed: Vec<AtomicBool>,
    phi: MirroredMatrix<f32>,
    n: CountMatrix,
    pois: Poisson,
    alias: SpAlias,
    buffers: BufferArena,
    /// Completed folds.
    folds: u64,
}

impl Model {
    fn mark_observed(&self, words: &[u32]) {
        for &w in words {
            if let Some(flag) = self.observed.get(w as usize) {
                flag.store(true, Ordering::Relaxed);
            }
        }
    }
}

pub struct Engine {
    device: DeviceContext,
    state: Mutex<EngineState>,
    model: Option<Model>,
}

impl Engine {
    pub fn new(config: DeviceConfig) -> Result<Self> {
        Ok(Self {
            device: DeviceContext::new(config)?,
            state: Mutex::new(EngineState::Uninitialized),
            model: None,
        })
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn device(&self) -> &DeviceContext {
        &self.device
    }

    /// Device bytes currently allocated.
    pub fn memory_in_use(&self) -> usize {
        self.device.memory_in_use()
    }

    fn require(&self, operation: &'static str, allowed: &[EngineState]) -> Result<EngineState> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(EngineError::StateViolation { operation, state })
        }
    }

    fn set_state(&self, next: EngineState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!("Engine state: {} -> {}", *state, next);
            *state = next;
        }
    }

    /// Record a failed call. Fatal errors move the engine to `Failed`.
    fn fail(&self, operation: &'static str, err: EngineError) -> EngineError {
        if err.is_fatal() {
            error!("{operation} failed, engine unusable until cleanup: {err}");
            self.set_state(EngineState::Failed);
        }
        err
    }

    /// The model, if the engine is live.
    fn model(&self, operation: &'static str) -> Result<&Model> {
        let state = self.state();
        match &self.model {
            Some(model) if state.is_live() => Ok(model),
            _ => Err(EngineError::StateViolation { operation, state }),
        }
    }

    /// Allocate the model, upload `buffers` and count their initial
    /// assignments. Binds each buffer to its device mirror.
    #[fastrace::trace(name = "initialize")]
    pub fn initialize(&mut self, args: Args, buffers: &mut [Buffer]) -> Result<()> {
        self.require("initialize", &[EngineState::Uninitialized])?;
        let start = Instant::now();

        match Self::build_model(&self.device, args, buffers) {
            Ok(model) => {
                info!(
                    "Engine initialized: K={}, V={}, buffers={}, tokens={}, device_bytes={}, elapsed_ms={}",
                    model.args.k,
                    model.vocab_size,
                    model.buffers.len(),
                    model.n.total(),
                    self.device.memory_in_use(),
                    start.elapsed().as_millis()
                );
                self.model = Some(model);
                self.set_state(EngineState::Ready);
                Ok(())
            }
            Err(err) => {
                for buffer in buffers.iter_mut() {
                    buffer.bind(None);
                }
                error!("initialize failed: {err}");
                self.set_state(EngineState::Failed);
                Err(err)
            }
        }
    }

    fn build_model(ctx: &DeviceContext, args: Args, buffers: &mut [Buffer]) -> Result<Model> {
        args.validate()?;
        let k = args.k as usize;
        let vocab_size = args.vocab_size.unwrap_or_else(|| {
            buffers
                .iter()
                .flat_map(|b| b.w.iter())
                .max()
                .map_or(0, |&w| w as usize + 1)
        });

        let rates = std::iter::once(args.alpha * args.l as f32);
        let pois = match args.phi_estimator {
            PhiEstimator::PosteriorMean => Poisson::new(args.seed, rates),
            PhiEstimator::PolyaUrn => Poisson::new(
                args.seed,
                rates.chain((0..=URN_TABULATED_COUNTS).map(|c| c as f32 + args.beta)),
            ),
        };

        let mut model = Model {
            phi: MirroredMatrix::new(ctx, k, vocab_size, "phi")?,
            n: CountMatrix::new(ctx, k, vocab_size, "topic-word counts")?,
            alias: SpAlias::new(ctx, k, vocab_size)?,
            observed: (0..vocab_size).map(|_| AtomicBool::new(false)).collect(),
            buffers: BufferArena::new(),
            vocab_size,
            pois,
            args,
            folds: 0,
        };

        for buffer in buffers.iter_mut() {
            let mut mirror = DeviceBuffer::new(ctx, buffer)?;
            mirror.upload(buffer)?;
            ops::count_assignments(ctx, &mirror, &model.n)?;
            model.mark_observed(&buffer.w);
            buffer.bind(Some(model.buffers.insert(mirror)));
        }
        Ok(model)
    }

    /// Copy a buffer's host arrays to its device mirror.
    pub fn to_device(&self, buffer: &Buffer) -> Result<()> {
        let model = self.model("to_device")?;
        let mirror = model.buffers.get(buffer)?;
        mirror
            .lock()
            .upload(buffer)
            .map_err(|e| self.fail("to_device", e))?;
        model.mark_observed(&buffer.w);
        Ok(())
    }

    /// Copy a buffer's device topics back to the host.
    pub fn to_host(&self, buffer: &mut Buffer) -> Result<()> {
        let model = self.model("to_host")?;
        let mirror = model.buffers.get(buffer)?;
        mirror
            .lock()
            .download(buffer)
            .map_err(|e| self.fail("to_host", e))
    }

    /// Fold the accumulated counts into a new Phi and refresh the alias
    /// tables. A no-op when nothing was sampled since the last fold.
    #[fastrace::trace(name = "sample_phi")]
    pub fn sample_phi(&mut self) -> Result<()> {
        let state = self.require(
            "sample_phi",
            &[EngineState::Ready, EngineState::PhiFresh, EngineState::ZFresh],
        )?;
        let Some(model) = self.model.as_mut() else {
            return Err(EngineError::StateViolation {
                operation: "sample_phi",
                state,
            });
        };

        let accumulated = model.n.total();
        if accumulated == 0 && model.folds > 0 {
            debug!("sample_phi: nothing accumulated since fold {}", model.folds);
            self.set_state(EngineState::PhiFresh);
            return Ok(());
        }
        let resident = model.buffers.resident_tokens();
        if accumulated != resident {
            warn!(
                "sample_phi: folding {accumulated} tokens but {resident} are resident, partial sweep"
            );
        }

        let start = Instant::now();
        if let Err(err) = Self::fold(&self.device, model) {
            return Err(self.fail("sample_phi", err));
        }
        debug!(
            "Phi published: version={}, tokens={}, elapsed_ms={}",
            model.phi.version(),
            accumulated,
            start.elapsed().as_millis()
        );
        self.set_state(EngineState::PhiFresh);
        Ok(())
    }

    fn fold(ctx: &DeviceContext, model: &mut Model) -> Result<()> {
        let Model {
            args,
            observed,
            phi,
            n,
            pois,
            alias,
            folds,
            ..
        } = model;
        let every = args.alias_full_rebuild_every as u64;
        let full = *folds == 0 || (every > 0 && *folds % every == 0);

        let (back, front) = phi.stage();
        ops::fold_phi(
            ctx,
            n,
            observed,
            args.beta,
            args.phi_estimator,
            pois,
            *folds,
            back,
        )?;
        let stats = alias.rebuild(ctx, back, Some(front), args.alias_tolerance, full)?;
        debug!(
            "Alias rebuild: full={full}, rebuilt={}, skipped={}",
            stats.rebuilt, stats.skipped
        );

        phi.publish();
        n.reset();
        *folds += 1;
        Ok(())
    }

    /// Resample every token of `buffer`'s device mirror against the current
    /// Phi. Returns the number of tokens sampled.
    ///
    /// Takes `&self`: distinct buffers may be sampled from several threads at
    /// once.
    #[fastrace::trace(name = "sample_z")]
    pub fn sample_z(&self, buffer: &Buffer) -> Result<u64> {
        self.require("sample_z", &[EngineState::PhiFresh, EngineState::ZFresh])?;
        let model = self.model("sample_z")?;
        let id = buffer.id().ok_or_else(|| EngineError::UnknownBuffer("(unbound)".into()))?;
        let mirror = model.buffers.get(buffer)?;

        let inputs = SamplingInputs {
            phi: model.phi.read(),
            alias: &model.alias,
            pois: &model.pois,
            n: &model.n,
            alpha: model.args.alpha,
            copies: model.args.l,
            round: model.folds,
        };
        let sampled = ops::sample_tokens(&self.device, &mut mirror.lock(), id.index(), &inputs)
            .map_err(|e| self.fail("sample_z", e))?;

        let mut state = self.state.lock();
        if *state == EngineState::PhiFresh {
            *state = EngineState::ZFresh;
        }
        Ok(sampled)
    }

    /// Release every device allocation, optionally copying the final topic
    /// assignments back into `buffers` first. Copy-back is skipped after a
    /// failure.
    #[fastrace::trace(name = "cleanup")]
    pub fn cleanup(&mut self, buffers: &mut [Buffer], copy_back: bool) -> Result<()> {
        let state = self.state();
        if matches!(state, EngineState::Uninitialized | EngineState::TornDown) {
            return Err(EngineError::StateViolation {
                operation: "cleanup",
                state,
            });
        }

        let mut first_err = None;
        if let Some(model) = self.model.take() {
            if copy_back && state != EngineState::Failed {
                for buffer in buffers.iter_mut() {
                    let copied = model
                        .buffers
                        .get(buffer)
                        .and_then(|mirror| mirror.lock().download(buffer));
                    if let Err(err) = copied {
                        warn!("cleanup: copy-back failed: {err}");
                        first_err.get_or_insert(err);
                    }
                }
            } else if copy_back {
                warn!("cleanup: skipping copy-back after failure");
            }
            drop(model);
        }
        for buffer in buffers.iter_mut() {
            buffer.bind(None);
        }

        info!(
            "Engine torn down: device_bytes_in_use={}",
            self.device.memory_in_use()
        );
        self.set_state(EngineState::TornDown);
        first_err.map_or(Ok(()), Err)
    }

    pub fn args(&self) -> Result<&Args> {
        Ok(&self.model("args")?.args)
    }

    pub fn num_topics(&self) -> Result<usize> {
        Ok(self.model("num_topics")?.args.k as usize)
    }

    pub fn vocab_size(&self) -> Result<usize> {
        Ok(self.model("vocab_size")?.vocab_size)
    }

    /// Number of distinct word ids seen in uploaded buffers.
    pub fn observed_words(&self) -> Result<usize> {
        Ok(self
            .model("observed_words")?
            .observed
            .iter()
            .filter(|f| f.load(Ordering::Relaxed))
            .count())
    }

    /// Folds completed so far.
    pub fn round(&self) -> u64 {
        self.model.as_ref().map_or(0, |m| m.folds)
    }

    /// Tokens counted into `n` since the last fold.
    pub fn accumulated_tokens(&self) -> Result<u64> {
        Ok(self.model("accumulated_tokens")?.n.total())
    }

    /// Device-to-host copy of `n` (`K × V`, topic-major).
    pub fn counts_snapshot(&self) -> Result<Vec<u32>> {
        Ok(self.model("counts_snapshot")?.n.snapshot())
    }

    /// Device-to-host copy of the published Phi (`K × V`, topic-major).
    pub fn phi_snapshot(&mut self) -> Result<Vec<f32>> {
        let state = self.state();
        match self.model.as_mut() {
            Some(model) if state.is_live() => Ok(model.phi.to_host()?.to_vec()),
            _ => Err(EngineError::StateViolation {
                operation: "phi_snapshot",
                state,
            }),
        }
    }

    pub fn alias(&self) -> Result<&SpAlias> {
        Ok(&self.model("alias")?.alias)
    }

    /// Mean per-token log predictive likelihood over the resident buffers,
    /// under the published Phi and the current assignments.
    pub fn log_likelihood(&self) -> Result<f64> {
        self.require(
            "log_likelihood",
            &[EngineState::PhiFresh, EngineState::ZFresh],
        )?;
        let model = self.model("log_likelihood")?;
        let phi = model.phi.read();
        let (mut sum, mut tokens) = (0.0, 0u64);
        for mirror in model.buffers.iter() {
            let (s, t) = ops::log_likelihood(
                &self.device,
                &mirror.lock(),
                phi,
                model.args.k as usize,
                model.args.alpha,
            )
            .map_err(|e| self.fail("log_likelihood", e))?;
            sum += s;
            tokens += t;
        }
        Ok(if tokens == 0 { 0.0 } else { sum / tokens as f64 })
    }
}
