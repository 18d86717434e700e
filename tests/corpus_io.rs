use std::fs;
use std::io::Write;

use gplda::config::{ConfigError, TrainConfig};
use gplda::corpus::{Corpus, ModelSummary, write_outputs};
use gplda::{DeviceConfig, Engine, SweepOptions, sweep};
use rand::SeedableRng;
use rand::rngs::StdRng;

fn init_logging() {
    gplda::logging::init_stderr("info");
}

const CORPUS: &str = "\
apple banana apple cherry
banana banana

cherry date apple date
egg egg egg fig
";

#[test]
fn test_train_and_write_outputs() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("corpus.txt");
    fs::File::create(&input)
        .unwrap()
        .write_all(CORPUS.as_bytes())
        .unwrap();

    let config = TrainConfig {
        topics: 2,
        n_mc: 5,
        buffer_size: 6,
        input: Some(input.clone()),
        output: Some(dir.path().join("model")),
        ..Default::default()
    };
    config.validate().unwrap();

    let corpus = Corpus::load(&input).unwrap();
    assert_eq!(corpus.docs.len(), 5);
    assert_eq!(corpus.tokens(), 14);
    assert_eq!(corpus.vocab.len(), 6);

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut buffers = corpus
        .to_buffers(config.buffer_size, config.topics, &mut rng)
        .unwrap();
    assert_eq!(buffers.len(), 3);

    let mut engine = Engine::new(DeviceConfig::default().with_threads(2)).unwrap();
    engine
        .initialize(config.to_args(Some(corpus.vocab.len())), &mut buffers)
        .unwrap();
    for _ in 0..config.n_mc {
        engine.sample_phi().unwrap();
        sweep(&engine, &mut buffers, SweepOptions::default()).unwrap();
    }
    engine.sample_phi().unwrap();
    let log_likelihood = engine.log_likelihood().unwrap();
    let phi = engine.phi_snapshot().unwrap();
    engine.cleanup(&mut buffers, true).unwrap();

    let summary = ModelSummary {
        topics: 2,
        vocab_size: corpus.vocab.len(),
        alpha: config.alpha,
        beta: config.beta,
        augmentation: config.augmentation,
        iterations: config.n_mc,
        seed: config.seed,
        tokens: corpus.tokens() as u64,
        documents: corpus.docs.len(),
        log_likelihood,
    };
    let out = config.output.as_ref().unwrap();
    write_outputs(out, &corpus.vocab, &buffers, &phi, &summary).unwrap();

    let vocab = fs::read_to_string(out.join("vocab.txt")).unwrap();
    assert_eq!(
        vocab.lines().collect::<Vec<_>>(),
        vec!["apple", "banana", "cherry", "date", "egg", "fig"]
    );

    let assignments = fs::read_to_string(out.join("assignments.txt")).unwrap();
    let lines: Vec<&str> = assignments.lines().collect();
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[2], "");
    for (line, doc) in lines.iter().zip(&corpus.docs) {
        let pairs: Vec<(u32, u32)> = line
            .split_whitespace()
            .map(|pair| {
                let (w, z) = pair.split_once(':').unwrap();
                (w.parse().unwrap(), z.parse().unwrap())
            })
            .collect();
        assert_eq!(pairs.iter().map(|p| p.0).collect::<Vec<_>>(), *doc);
        assert!(pairs.iter().all(|p| p.1 < 2));
    }

    let phi_tsv = fs::read_to_string(out.join("phi.tsv")).unwrap();
    let rows: Vec<Vec<f32>> = phi_tsv
        .lines()
        .map(|l| l.split('\t').map(|x| x.parse().unwrap()).collect())
        .collect();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(row.len(), 6);
        assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-4);
    }

    let written = ModelSummary::from_file(out.join("model.json")).unwrap();
    assert_eq!(written, summary);
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("train.json");
    fs::write(
        &path,
        r#"{"alpha": 0.5, "topics": 7, "n_mc": 3, "input": "docs.txt", "device_memory_mb": 64}"#,
    )
    .unwrap();

    let config = TrainConfig::from_file(&path).unwrap();
    assert_eq!(config.alpha, 0.5);
    assert_eq!(config.topics, 7);
    assert_eq!(config.device_config().memory_limit, Some(64 << 20));
    assert_eq!(config.validate(), Ok(()));

    fs::write(&path, r#"{"topics": 0, "input": "docs.txt"}"#).unwrap();
    let config = TrainConfig::from_file(&path).unwrap();
    assert_eq!(config.validate(), Err(ConfigError::ZeroTopics));

    assert!(TrainConfig::from_file(dir.path().join("missing.json")).is_err());
}

#[test]
fn test_document_longer_than_buffer_is_rejected() {
    let corpus = Corpus::from_reader(CORPUS.as_bytes()).unwrap();
    let mut rng = StdRng::seed_from_u64(0);
    let err = corpus.to_buffers(3, 2, &mut rng).unwrap_err();
    assert_eq!(
        err,
        ConfigError::DocumentTooLong {
            doc: 0,
            tokens: 4,
            buffer_size: 3
        }
    );
}
