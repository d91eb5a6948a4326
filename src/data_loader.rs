// src/data_loader.rs - CSV rows of (context, question, answer, answer_start)
use anyhow::{Context, Result};
use csv::ReaderBuilder;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct Record {
    context: String,
    question: String,
    answer: String,
    /// Token offset of the answer inside `context`.
    answer_start: usize,
}

/// One tokenized training/inference example.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub context: Vec<String>,
    pub question: Vec<String>,
    pub answer: Vec<String>,
    pub answer_start: usize,
}

impl Example {
    pub fn new(context: &str, question: &str, answer: &str, answer_start: usize) -> Self {
        Self {
            context: tokenize(context),
            question: tokenize(question),
            answer: tokenize(answer),
            answer_start,
        }
    }

    /// Answer start clamped into the passage.
    pub fn span_start(&self) -> usize {
        self.answer_start.min(self.context.len().saturating_sub(1))
    }
}

pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().map(|w| w.to_lowercase()).collect()
}

pub struct DataLoader {
    examples: Vec<Example>,
}

impl DataLoader {
    pub fn new(csv_path: impl AsRef<Path>) -> Result<Self> {
        let csv_path = csv_path.as_ref();
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .from_path(csv_path)
            .with_context(|| format!("Failed to open CSV file {}", csv_path.display()))?;

        let mut examples = Vec::new();
        let mut skipped = 0usize;
        for result in reader.deserialize() {
            let record: Record = result.context("Failed to read CSV record")?;
            let ex = Example::new(&record.context, &record.question, &record.answer, record.answer_start);
            if ex.context.is_empty() || ex.question.is_empty() {
                skipped += 1;
                continue;
            }
            examples.push(ex);
        }

        tracing::info!(
            loaded = examples.len(),
            skipped,
            path = %csv_path.display(),
            "read question-generation examples"
        );
        Ok(Self { examples })
    }

    pub fn from_examples(examples: Vec<Example>) -> Self {
        Self { examples }
    }

    pub fn num_samples(&self) -> usize {
        self.examples.len()
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    pub fn longest_passage(&self) -> usize {
        self.examples.iter().map(|e| e.context.len()).max().unwrap_or(0)
    }

    /// Shuffled split; `seed` keeps runs reproducible.
    pub fn train_val_split(&self, train_ratio: f64, seed: u64) -> (Vec<Example>, Vec<Example>) {
        let mut data = self.examples.clone();
        let mut rng = StdRng::seed_from_u64(seed);
        data.shuffle(&mut rng);

        let split_idx = ((data.len() as f64) * train_ratio) as usize;
        let val = data.split_off(split_idx.min(data.len()));
        (data, val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_rows_and_skips_empty_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qg.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "context,question,answer,answer_start").unwrap();
        writeln!(f, "\"Paris is the capital of France\",\"What is the capital of France ?\",Paris,0").unwrap();
        writeln!(f, "\"\",\"empty context\",x,0").unwrap();

        let loader = DataLoader::new(&path).unwrap();
        assert_eq!(loader.num_samples(), 1);
        let ex = &loader.examples()[0];
        assert_eq!(ex.context[0], "paris");
        assert_eq!(ex.answer, vec!["paris"]);
        assert_eq!(loader.longest_passage(), 6);
    }

    #[test]
    fn split_is_deterministic_and_complete() {
        let examples: Vec<Example> = (0..10)
            .map(|i| Example::new(&format!("w{i} x"), "q ?", "x", 1))
            .collect();
        let loader = DataLoader::from_examples(examples);
        let (a_train, a_val) = loader.train_val_split(0.8, 7);
        let (b_train, _) = loader.train_val_split(0.8, 7);
        assert_eq!(a_train.len(), 8);
        assert_eq!(a_val.len(), 2);
        assert_eq!(a_train, b_train);
    }

    #[test]
    fn span_start_is_clamped() {
        let ex = Example::new("a b c", "q", "z", 10);
        assert_eq!(ex.span_start(), 2);
    }
}
