// src/vocab.rs - closed vocabulary + extended (copy) id space
use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::data_loader::Example;

pub const PAD_TOKEN: &str = "<PAD>";
pub const OOV_TOKEN: &str = "<OOV>";
pub const SOS_TOKEN: &str = "<SOS>";
pub const EOS_TOKEN: &str = "<EOS>";

pub const PAD_ID: i64 = 0;
pub const OOV_ID: i64 = 1;
pub const SOS_ID: i64 = 2;
pub const EOS_ID: i64 = 3;

/// Rendered in place of extended ids that point outside the passage.
pub const UNDEFINED_TOKEN: &str = "<UNDEF>";

const RESERVED: [&str; 4] = [PAD_TOKEN, OOV_TOKEN, SOS_TOKEN, EOS_TOKEN];

/// Word <-> id map. Ids are dense and reserved tokens occupy 0..4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocab {
    idx2word: Vec<String>,
    #[serde(skip)]
    word2idx: HashMap<String, i64>,
}

impl Vocab {
    pub fn new() -> Self {
        Self::from_words(std::iter::empty::<String>())
    }

    /// Reserved tokens followed by `words` in order (duplicates dropped).
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = Self {
            idx2word: Vec::new(),
            word2idx: HashMap::new(),
        };
        for w in RESERVED {
            vocab.push(w.to_string());
        }
        for w in words {
            vocab.push(w.into());
        }
        vocab
    }

    fn push(&mut self, word: String) {
        if self.word2idx.contains_key(&word) {
            return;
        }
        self.word2idx.insert(word.clone(), self.idx2word.len() as i64);
        self.idx2word.push(word);
    }

    /// Keep the `max_size - 4` most frequent words; ties broken alphabetically
    /// so the same corpus always yields the same ids.
    pub fn fit<'a, I>(texts: I, max_size: usize) -> Self
    where
        I: IntoParallelIterator<Item = &'a str>,
    {
        let counts: HashMap<String, usize> = texts
            .into_par_iter()
            .fold(HashMap::new, |mut acc, text| {
                for word in text.split_whitespace() {
                    *acc.entry(word.to_lowercase()).or_insert(0) += 1;
                }
                acc
            })
            .reduce(HashMap::new, |mut a, b| {
                for (w, c) in b {
                    *a.entry(w).or_insert(0) += c;
                }
                a
            });

        let mut by_freq: Vec<(String, usize)> = counts
            .into_iter()
            .filter(|(w, _)| !RESERVED.contains(&w.as_str()))
            .collect();
        by_freq.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let keep = max_size.saturating_sub(RESERVED.len());
        Self::from_words(by_freq.into_iter().take(keep).map(|(w, _)| w))
    }

    /// `fit` over every passage, question and answer token of `examples`.
    pub fn fit_examples(examples: &[Example], max_size: usize) -> Self {
        let words: Vec<&str> = examples
            .iter()
            .flat_map(|e| e.context.iter().chain(&e.question).chain(&e.answer))
            .map(String::as_str)
            .collect();
        Self::fit(words, max_size)
    }

    /// Rebuild the reverse map after deserializing.
    pub fn reindex(&mut self) {
        self.word2idx = self
            .idx2word
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i as i64))
            .collect();
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening vocab {}", path.display()))?;
        let mut vocab: Vocab = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing vocab {}", path.display()))?;
        vocab.reindex();
        Ok(vocab)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref()).context("creating vocab file")?;
        serde_json::to_writer(file, self)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.idx2word.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idx2word.is_empty()
    }

    pub fn id(&self, word: &str) -> Option<i64> {
        self.word2idx.get(word).copied()
    }

    pub fn id_or_oov(&self, word: &str) -> i64 {
        self.id(word).unwrap_or(OOV_ID)
    }

    pub fn word(&self, id: i64) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.idx2word.get(i))
            .map(String::as_str)
    }

    pub fn words(&self) -> impl Iterator<Item = (i64, &str)> {
        self.idx2word
            .iter()
            .enumerate()
            .map(|(i, w)| (i as i64, w.as_str()))
    }

    /// Extended id for a target-side token: vocabulary id if known, otherwise
    /// a copy id pointing at its first occurrence in the passage, otherwise OOV.
    pub fn extended_id(&self, word: &str, passage: &[String]) -> i64 {
        if let Some(id) = self.id(word) {
            return id;
        }
        match passage.iter().position(|w| w == word) {
            Some(pos) => self.len() as i64 + pos as i64,
            None => OOV_ID,
        }
    }

    /// Render an extended-id sequence. Ids past the passage (or negative) become
    /// `UNDEFINED_TOKEN` instead of panicking.
    pub fn render(&self, ids: &[i64], passage: &[String]) -> Vec<String> {
        let v = self.len() as i64;
        ids.iter()
            .map(|&id| {
                if id < v {
                    self.word(id).unwrap_or(UNDEFINED_TOKEN).to_string()
                } else {
                    usize::try_from(id - v)
                        .ok()
                        .and_then(|pos| passage.get(pos))
                        .map(String::clone)
                        .unwrap_or_else(|| UNDEFINED_TOKEN.to_string())
                }
            })
            .collect()
    }

    /// `render` up to (not including) EOS, joined, reserved tokens dropped.
    pub fn render_text(&self, ids: &[i64], passage: &[String]) -> String {
        let until_eos: Vec<i64> = ids.iter().copied().take_while(|&id| id != EOS_ID).collect();
        self.render(&until_eos, passage)
            .into_iter()
            .filter(|w| w != PAD_TOKEN && w != SOS_TOKEN)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for Vocab {
    fn default() -> Self {
        Self::new()
    }
}

/// Read GloVe-style text vectors (`word v1 v2 ...`), keeping only words in
/// `vocab` with exactly `dim` components.
pub fn load_glove(path: impl AsRef<Path>, dim: usize, vocab: &Vocab) -> Result<HashMap<i64, Vec<f32>>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening embeddings {}", path.display()))?;

    let mut table = HashMap::new();
    for line in BufReader::new(file).lines() {
        let line = line.context("reading embeddings line")?;
        let mut parts = line.split_whitespace();
        let Some(word) = parts.next() else { continue };
        let Some(id) = vocab.id(word) else { continue };
        let values: Vec<f32> = parts.filter_map(|p| p.parse().ok()).collect();
        if values.len() == dim {
            table.insert(id, values);
        }
    }
    tracing::info!(matched = table.len(), vocab = vocab.len(), "loaded pretrained vectors");
    Ok(table)
}
