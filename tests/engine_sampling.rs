use gplda::{Args, Buffer, DeviceConfig, Engine, EngineState, PhiEstimator};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn init_logging() {
    gplda::logging::init_stderr("info");
}

fn engine(threads: usize) -> Engine {
    Engine::new(DeviceConfig::default().with_threads(threads)).expect("failed to build engine")
}

/// Two-cluster corpus: even documents use words 0..5, odd ones 5..10.
fn clustered_buffers(
    docs: usize,
    doc_len: usize,
    per_buffer: usize,
    k: u32,
    seed: u64,
) -> Vec<Buffer> {
    let mut rng = StdRng::seed_from_u64(seed);
    let documents: Vec<Vec<u32>> = (0..docs)
        .map(|d| {
            let base = if d % 2 == 0 { 0 } else { 5 };
            (0..doc_len).map(|_| base + rng.random_range(0..5)).collect()
        })
        .collect();
    documents
        .chunks(per_buffer)
        .map(|chunk| {
            let mut buffer = Buffer::from_documents(chunk);
            buffer.randomize_topics(k, &mut rng);
            buffer
        })
        .collect()
}

fn bits(phi: &[f32]) -> Vec<u32> {
    phi.iter().map(|p| p.to_bits()).collect()
}

#[test]
fn test_end_to_end_four_tokens() {
    init_logging();
    let mut engine = engine(2);
    let mut bufs = vec![Buffer::from_documents(&[vec![0u32, 1], vec![1, 2]])];
    bufs[0].z = vec![1, 0, 0, 1];
    let args = Args {
        k: 2,
        seed: 3,
        ..Default::default()
    };

    engine.initialize(args, &mut bufs).unwrap();
    assert_eq!(engine.accumulated_tokens().unwrap(), 4);
    assert_eq!(engine.vocab_size().unwrap(), 3);
    assert_eq!(engine.counts_snapshot().unwrap(), vec![0, 2, 0, 1, 0, 1]);

    engine.sample_phi().unwrap();
    assert_eq!(engine.state(), EngineState::PhiFresh);
    assert_eq!(engine.accumulated_tokens().unwrap(), 0);
    assert_eq!(engine.round(), 1);

    assert_eq!(engine.sample_z(&bufs[0]).unwrap(), 4);
    assert_eq!(engine.state(), EngineState::ZFresh);
    assert_eq!(engine.accumulated_tokens().unwrap(), 4);
    let counts = engine.counts_snapshot().unwrap();
    assert_eq!(counts.iter().sum::<u32>(), 4);

    engine.to_host(&mut bufs[0]).unwrap();
    assert!(bufs[0].z.iter().all(|&z| z < 2));
    // Per-word column sums of n match the word frequencies.
    for (word, freq) in [(0, 1), (1, 2), (2, 1)] {
        assert_eq!(counts[word] + counts[3 + word], freq);
    }
    engine.cleanup(&mut bufs, false).unwrap();
}

#[test]
fn test_phi_rows_are_distributions() {
    init_logging();
    for estimator in [PhiEstimator::PosteriorMean, PhiEstimator::PolyaUrn] {
        let mut engine = engine(2);
        let mut bufs = clustered_buffers(20, 15, 5, 3, 1);
        let args = Args {
            k: 3,
            phi_estimator: estimator,
            seed: 5,
            ..Default::default()
        };
        engine.initialize(args, &mut bufs).unwrap();
        for _ in 0..3 {
            engine.sample_phi().unwrap();
            for buffer in &bufs {
                engine.sample_z(buffer).unwrap();
            }
        }
        engine.sample_phi().unwrap();
        let phi = engine.phi_snapshot().unwrap();
        for row in phi.chunks(10) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4, "{estimator:?}: {row:?}");
            assert!(row.iter().all(|&p| p >= 0.0));
        }
    }
}

#[test]
fn test_alias_draws_match_phi_columns() {
    init_logging();
    let mut engine = engine(2);
    let mut bufs = clustered_buffers(30, 20, 10, 4, 2);
    let args = Args {
        k: 4,
        seed: 11,
        ..Default::default()
    };
    engine.initialize(args, &mut bufs).unwrap();
    engine.sample_phi().unwrap();
    for buffer in &bufs {
        engine.sample_z(buffer).unwrap();
    }
    engine.sample_phi().unwrap();

    let phi = engine.phi_snapshot().unwrap();
    let alias = engine.alias().unwrap();
    let mut rng = StdRng::seed_from_u64(99);
    let draws = 40_000;
    for word in [0usize, 3, 7] {
        let column: Vec<f64> = (0..4).map(|k| phi[k * 10 + word] as f64).collect();
        let mass: f64 = column.iter().sum();
        let mut counts = [0usize; 4];
        for _ in 0..draws {
            counts[alias.sample(word, &mut rng) as usize] += 1;
        }
        for k in 0..4 {
            let empirical = counts[k] as f64 / draws as f64;
            assert!(
                (empirical - column[k] / mass).abs() < 0.015,
                "word {word}: {counts:?} vs {column:?}"
            );
        }
    }
}

#[test]
fn test_phi_is_stable_across_sample_z_batch() {
    init_logging();
    let mut engine = engine(4);
    let mut bufs = clustered_buffers(12, 10, 4, 3, 3);
    let args = Args {
        k: 3,
        ..Default::default()
    };
    engine.initialize(args, &mut bufs).unwrap();
    engine.sample_phi().unwrap();

    let before = bits(&engine.phi_snapshot().unwrap());
    for buffer in &bufs {
        engine.sample_z(buffer).unwrap();
    }
    assert_eq!(bits(&engine.phi_snapshot().unwrap()), before);

    engine.sample_phi().unwrap();
    assert_ne!(bits(&engine.phi_snapshot().unwrap()), before);
}

#[test]
fn test_second_sample_phi_is_idempotent() {
    init_logging();
    let mut engine = engine(2);
    let mut bufs = clustered_buffers(8, 10, 4, 3, 4);
    let args = Args {
        k: 3,
        ..Default::default()
    };
    engine.initialize(args, &mut bufs).unwrap();
    engine.sample_phi().unwrap();
    for buffer in &bufs {
        engine.sample_z(buffer).unwrap();
    }
    engine.sample_phi().unwrap();

    let phi = bits(&engine.phi_snapshot().unwrap());
    let tables: Vec<Vec<f64>> = (0..10)
        .map(|w| engine.alias().unwrap().distribution(w))
        .collect();
    let round = engine.round();

    engine.sample_phi().unwrap();
    assert_eq!(engine.state(), EngineState::PhiFresh);
    assert_eq!(engine.round(), round);
    assert_eq!(bits(&engine.phi_snapshot().unwrap()), phi);
    for (w, table) in tables.iter().enumerate() {
        assert_eq!(&engine.alias().unwrap().distribution(w), table);
    }
}

#[test]
fn test_unobserved_words_get_uniform_tables() {
    init_logging();
    let mut engine = engine(2);
    let mut bufs = vec![Buffer::from_documents(&[vec![0u32, 1, 2, 3], vec![3, 2, 2]])];
    let args = Args {
        k: 4,
        vocab_size: Some(8),
        ..Default::default()
    };
    engine.initialize(args, &mut bufs).unwrap();
    assert_eq!(engine.observed_words().unwrap(), 4);
    engine.sample_phi().unwrap();

    let phi = engine.phi_snapshot().unwrap();
    let alias = engine.alias().unwrap();
    for word in 4..8 {
        assert!((0..4).all(|k| phi[k * 8 + word] == 0.0));
        assert_eq!(alias.mass(word), 0.0);
        for p in alias.distribution(word) {
            assert!((p - 0.25).abs() < 1e-9);
        }
    }
    for word in 0..4 {
        assert!(alias.mass(word) > 0.0);
    }
}

#[test]
fn test_runs_are_deterministic_across_thread_counts() {
    init_logging();
    let run = |threads: usize| {
        let mut engine = engine(threads);
        let mut bufs = clustered_buffers(16, 12, 4, 3, 6);
        let args = Args {
            k: 3,
            seed: 21,
            phi_estimator: PhiEstimator::PolyaUrn,
            ..Default::default()
        };
        engine.initialize(args, &mut bufs).unwrap();
        for _ in 0..4 {
            engine.sample_phi().unwrap();
            for buffer in &bufs {
                engine.sample_z(buffer).unwrap();
            }
        }
        engine.sample_phi().unwrap();
        let log_likelihood = engine.log_likelihood().unwrap().to_bits();
        let phi = bits(&engine.phi_snapshot().unwrap());
        engine.cleanup(&mut bufs, true).unwrap();
        let z: Vec<Vec<u32>> = bufs.into_iter().map(|b| b.z).collect();
        (phi, z, log_likelihood)
    };
    assert_eq!(run(1), run(4));
}

#[test]
fn test_concurrent_sample_z_matches_sequential() {
    init_logging();
    let setup = || {
        let mut engine = engine(4);
        let mut bufs = clustered_buffers(24, 16, 6, 4, 8);
        let args = Args {
            k: 4,
            seed: 13,
            ..Default::default()
        };
        engine.initialize(args, &mut bufs).unwrap();
        engine.sample_phi().unwrap();
        (engine, bufs)
    };

    let (mut sequential, mut seq_bufs) = setup();
    for buffer in &seq_bufs {
        sequential.sample_z(buffer).unwrap();
    }

    let (mut concurrent, mut par_bufs) = setup();
    std::thread::scope(|s| {
        for buffer in &par_bufs {
            let engine = &concurrent;
            s.spawn(move || engine.sample_z(buffer).unwrap());
        }
    });

    let total: usize = par_bufs.iter().map(Buffer::size).sum();
    assert_eq!(concurrent.accumulated_tokens().unwrap(), total as u64);
    assert_eq!(
        concurrent.counts_snapshot().unwrap(),
        sequential.counts_snapshot().unwrap()
    );

    sequential.cleanup(&mut seq_bufs, true).unwrap();
    concurrent.cleanup(&mut par_bufs, true).unwrap();
    for (a, b) in seq_bufs.iter().zip(&par_bufs) {
        assert_eq!(a.z, b.z);
    }
}

#[test]
fn test_training_separates_clusters() {
    init_logging();
    let mut engine = engine(4);
    let mut bufs = clustered_buffers(40, 20, 10, 2, 10);
    let args = Args {
        k: 2,
        alpha: 0.1,
        beta: 0.01,
        seed: 17,
        ..Default::default()
    };
    engine.initialize(args, &mut bufs).unwrap();
    engine.sample_phi().unwrap();
    let initial = engine.log_likelihood().unwrap();

    for _ in 0..40 {
        for buffer in &bufs {
            engine.sample_z(buffer).unwrap();
        }
        engine.sample_phi().unwrap();
    }
    let trained = engine.log_likelihood().unwrap();
    assert!(initial.is_finite() && trained.is_finite());
    assert!(
        trained > initial + 0.3,
        "log likelihood did not improve: {initial} -> {trained}"
    );

    // Each topic ends up holding one cluster's words.
    let phi = engine.phi_snapshot().unwrap();
    for row in phi.chunks(10) {
        let low: f32 = row[..5].iter().sum();
        assert!(low > 0.8 || low < 0.2, "{row:?}");
    }
}
