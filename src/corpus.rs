//! Corpus loading, buffer packing and model output files.
//!
//! Input is plain text, one document per line, tokens separated by
//! whitespace. Word ids are assigned in first-seen order.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use log::info;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::buffer::Buffer;
use crate::config::ConfigError;

#[derive(Clone, Debug, Default)]
pub struct Vocabulary {
    words: Vec<String>,
    ids: HashMap<String, u32>,
}

impl Vocabulary {
    /// Id of `word`, assigning the next free id on first sight.
    pub fn intern(&mut self, word: &str) -> u32 {
        if let Some(&id) = self.ids.get(word) {
            return id;
        }
        let id = self.words.len() as u32;
        self.words.push(word.to_string());
        self.ids.insert(word.to_string(), id);
        id
    }

    pub fn id(&self, word: &str) -> Option<u32> {
        self.ids.get(word).copied()
    }

    pub fn word(&self, id: u32) -> Option<&str> {
        self.words.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }
}

#[derive(Clone, Debug, Default)]
pub struct Corpus {
    pub vocab: Vocabulary,
    pub docs: Vec<Vec<u32>>,
}

impl Corpus {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("failed to open corpus {}", path.display()))?;
        let corpus = Self::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to read corpus {}", path.display()))?;
        info!(
            "Corpus loaded: path={}, documents={}, tokens={}, vocab={}",
            path.display(),
            corpus.docs.len(),
            corpus.tokens(),
            corpus.vocab.len()
        );
        Ok(corpus)
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut corpus = Self::default();
        for line in reader.lines() {
            let line = line?;
            let doc = line
                .split_whitespace()
                .map(|token| corpus.vocab.intern(token))
                .collect();
            corpus.docs.push(doc);
        }
        Ok(corpus)
    }

    pub fn tokens(&self) -> usize {
        self.docs.iter().map(Vec::len).sum()
    }

    /// Pack documents, in order, into buffers of at most `buffer_size` tokens
    /// with topics drawn uniformly from `[0, k)`.
    pub fn to_buffers<R: Rng + ?Sized>(
        &self,
        buffer_size: usize,
        k: u32,
        rng: &mut R,
    ) -> std::result::Result<Vec<Buffer>, ConfigError> {
        if buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        let mut buffers = Vec::new();
        let mut current = Buffer::with_capacity(buffer_size);
        for (doc, words) in self.docs.iter().enumerate() {
            if words.len() > buffer_size {
                return Err(ConfigError::DocumentTooLong {
                    doc,
                    tokens: words.len(),
                    buffer_size,
                });
            }
            if !current.push_document(words) {
                buffers.push(std::mem::replace(
                    &mut current,
                    Buffer::with_capacity(buffer_size),
                ));
                current.push_document(words);
            }
        }
        if current.n_docs() > 0 {
            buffers.push(current);
        }
        for buffer in &mut buffers {
            buffer.randomize_topics(k, rng);
        }
        Ok(buffers)
    }
}

/// Run summary written to `model.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub topics: usize,
    pub vocab_size: usize,
    pub alpha: f32,
    pub beta: f32,
    pub augmentation: u32,
    pub iterations: u32,
    pub seed: u64,
    pub tokens: u64,
    pub documents: usize,
    pub log_likelihood: f64,
}

impl ModelSummary {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut content = String::new();
        File::open(path.as_ref())?.read_to_string(&mut content)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Write `vocab.txt`, `assignments.txt`, `phi.tsv` and `model.json` into `dir`.
pub fn write_outputs(
    dir: impl AsRef<Path>,
    vocab: &Vocabulary,
    buffers: &[Buffer],
    phi: &[f32],
    summary: &ModelSummary,
) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;

    write_file(&dir.join("vocab.txt"), |out| {
        for word in vocab.words() {
            writeln!(out, "{word}")?;
        }
        Ok(())
    })?;

    write_file(&dir.join("assignments.txt"), |out| {
        for buffer in buffers {
            for doc in 0..buffer.n_docs() {
                let (words, topics) = buffer.document(doc);
                let line: Vec<String> = words
                    .iter()
                    .zip(topics)
                    .map(|(w, z)| format!("{w}:{z}"))
                    .collect();
                writeln!(out, "{}", line.join(" "))?;
            }
        }
        Ok(())
    })?;

    write_file(&dir.join("phi.tsv"), |out| {
        if summary.vocab_size == 0 {
            return Ok(());
        }
        for row in phi.chunks(summary.vocab_size) {
            let line: Vec<String> = row.iter().map(|p| p.to_string()).collect();
            writeln!(out, "{}", line.join("\t"))?;
        }
        Ok(())
    })?;

    write_file(&dir.join("model.json"), |out| {
        serde_json::to_writer_pretty(&mut *out, summary)?;
        writeln!(out)?;
        Ok(())
    })?;

    info!("Model written: dir={}", dir.display());
    Ok(())
}

fn write_file(path: &Path, body: impl FnOnce(&mut BufWriter<File>) -> Result<()>) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    body(&mut out).with_context(|| format!("failed to write {}", path.display()))?;
    out.flush()?;
    Ok(())
}
