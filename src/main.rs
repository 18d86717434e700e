use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use fastrace::prelude::*;
use gplda::config::TrainConfig;
use gplda::corpus::{Corpus, ModelSummary, write_outputs};
use gplda::logging::{self, LoggingConfig};
use gplda::trace_reporter::TraceFileReporter;
use gplda::{Engine, PhiEstimator, SweepOptions, sweep};
use log::info;
use rand::SeedableRng;
use rand::rngs::StdRng;

#[derive(Parser)]
#[command(name = "gplda", about = "Train an LDA topic model with data-parallel Gibbs sampling")]
struct Cli {
    /// Corpus file: one document per line, whitespace-separated tokens
    #[arg(long)]
    input: Option<PathBuf>,

    /// Directory for vocab.txt, assignments.txt, phi.tsv and model.json
    #[arg(long)]
    output: Option<PathBuf>,

    /// Document-topic prior
    #[arg(long)]
    alpha: Option<f32>,

    /// Topic-word prior
    #[arg(long)]
    beta: Option<f32>,

    /// Number of topics
    #[arg(short = 'K', long)]
    topics: Option<u32>,

    /// Gibbs iterations
    #[arg(long)]
    nmc: Option<u32>,

    #[arg(long)]
    seed: Option<u64>,

    /// Token capacity of one document buffer
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Poisson virtual copies per token
    #[arg(long)]
    augmentation: Option<u32>,

    #[arg(long, value_enum)]
    phi_estimator: Option<PhiEstimator>,

    /// Device worker threads (default: one per core)
    #[arg(long)]
    threads: Option<usize>,

    /// Device memory budget in MiB (default: unbounded)
    #[arg(long)]
    device_memory_mb: Option<usize>,

    /// Log the likelihood every N iterations
    #[arg(long)]
    eval_every: Option<u32>,

    /// JSON config file; flags given on the command line override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write phase trace JSON files to this directory
    #[arg(long)]
    trace_output_path: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn resolve(&self) -> Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::from_file(path)?,
            None => TrainConfig::default(),
        };
        if let Some(alpha) = self.alpha {
            config.alpha = alpha;
        }
        if let Some(beta) = self.beta {
            config.beta = beta;
        }
        if let Some(topics) = self.topics {
            config.topics = topics;
        }
        if let Some(nmc) = self.nmc {
            config.n_mc = nmc;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(buffer_size) = self.buffer_size {
            config.buffer_size = buffer_size;
        }
        if let Some(augmentation) = self.augmentation {
            config.augmentation = augmentation;
        }
        if let Some(estimator) = self.phi_estimator {
            config.phi_estimator = estimator;
        }
        if let Some(eval_every) = self.eval_every {
            config.eval_every = eval_every;
        }
        if self.input.is_some() {
            config.input = self.input.clone();
        }
        if self.output.is_some() {
            config.output = self.output.clone();
        }
        if self.threads.is_some() {
            config.threads = self.threads;
        }
        if self.device_memory_mb.is_some() {
            config.device_memory_mb = self.device_memory_mb;
        }
        Ok(config)
    }
}

fn train(config: &TrainConfig) -> Result<()> {
    let root = Span::root("train", SpanContext::random());
    let _guard = root.set_local_parent();

    let input = config.input.as_ref().context("no input corpus given")?;
    let corpus = Corpus::load(input)?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut buffers = corpus.to_buffers(config.buffer_size, config.topics, &mut rng)?;
    info!(
        "Buffers packed: count={}, buffer_size={}",
        buffers.len(),
        config.buffer_size
    );

    let mut engine = Engine::new(config.device_config())?;
    engine.initialize(config.to_args(Some(corpus.vocab.len())), &mut buffers)?;

    let start = Instant::now();
    for iteration in 1..=config.n_mc {
        engine.sample_phi()?;
        let stats = sweep(&engine, &mut buffers, SweepOptions::default())?;
        if config.eval_every > 0 && iteration % config.eval_every == 0 {
            info!(
                "Iteration {}/{}: log_likelihood={:.4}, tokens={}, sweep_ms={}",
                iteration,
                config.n_mc,
                engine.log_likelihood()?,
                stats.tokens,
                stats.elapsed.as_millis()
            );
        }
    }
    // Fold the last sweep's assignments.
    engine.sample_phi()?;
    let log_likelihood = engine.log_likelihood()?;
    info!(
        "Training done: iterations={}, log_likelihood={:.4}, elapsed_ms={}",
        config.n_mc,
        log_likelihood,
        start.elapsed().as_millis()
    );

    let phi = engine.phi_snapshot()?;
    let (topics, vocab_size) = (engine.num_topics()?, engine.vocab_size()?);
    engine.cleanup(&mut buffers, true)?;

    if let Some(output) = &config.output {
        let summary = ModelSummary {
            topics,
            vocab_size,
            alpha: config.alpha,
            beta: config.beta,
            augmentation: config.augmentation,
            iterations: config.n_mc,
            seed: config.seed,
            tokens: corpus.tokens() as u64,
            documents: corpus.docs.len(),
            log_likelihood,
        };
        write_outputs(output, &corpus.vocab, &buffers, &phi, &summary)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(LoggingConfig::new(cli.log_level.clone()));

    if let Some(trace_path) = &cli.trace_output_path {
        std::fs::create_dir_all(trace_path).with_context(|| {
            format!("failed to create trace directory {}", trace_path.display())
        })?;
        fastrace::set_reporter(
            TraceFileReporter::new(trace_path.clone()),
            fastrace::collector::Config::default(),
        );
        info!("Tracing enabled: output_dir={}", trace_path.display());
    }

    let config = cli.resolve()?;
    config.validate()?;
    let result = train(&config);

    if cli.trace_output_path.is_some() {
        fastrace::flush();
    }
    result
}
