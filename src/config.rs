// src/config.rs - model / training hyperparameters
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::error::ConfigError;

/// Longest SQuAD passage plus start, end and pad.
pub const DEFAULT_MAX_COPY_SIZE: usize = 818;

/// Hard cap on inference decode length.
pub const MAX_DECODE_LEN: usize = 32;

/// Where the condition vector comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionSource {
    /// Mean of the passage encoding under the answer span.
    SpanMean,
    /// Concatenated final cell states of the answer encoder.
    AnswerEncoder,
}

/// How generation and copy scores become one distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputBlend {
    /// One softmax over [vocab scores ; copy scores].
    JointSoftmax,
    /// Learned gate mixing a vocab softmax with the attention weights.
    Switch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub embedding_size: i64,
    pub context_encoder_units: i64,
    pub decoder_units: i64,
    pub attention_layer_size: i64,
    pub max_copy_size: usize,
    pub dropout: f64,
    pub condition: ConditionSource,
    pub blend: OutputBlend,
    /// Feed the condition vector into the vocabulary projection as well.
    pub vocab_conditioning: bool,
    pub beam_width: usize,
    pub max_decode_len: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embedding_size: 200,
            context_encoder_units: 768,
            decoder_units: 768,
            attention_layer_size: 384,
            max_copy_size: DEFAULT_MAX_COPY_SIZE,
            dropout: 0.3,
            condition: ConditionSource::SpanMean,
            blend: OutputBlend::JointSoftmax,
            vocab_conditioning: false,
            beam_width: 16,
            max_decode_len: MAX_DECODE_LEN,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let dims = [
            ("embedding_size", self.embedding_size),
            ("context_encoder_units", self.context_encoder_units),
            ("decoder_units", self.decoder_units),
            ("attention_layer_size", self.attention_layer_size),
        ];
        for (name, v) in dims {
            if v <= 0 {
                return Err(ConfigError::NonPositive { name });
            }
        }
        if self.max_copy_size == 0 {
            return Err(ConfigError::NonPositive { name: "max_copy_size" });
        }
        if self.max_decode_len == 0 {
            return Err(ConfigError::NonPositive { name: "max_decode_len" });
        }
        if self.beam_width == 0 {
            return Err(ConfigError::ZeroBeamWidth);
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ConfigError::Dropout(self.dropout));
        }
        Ok(())
    }

    /// The corpus must fit in the copy slots.
    pub fn check_passages(&self, longest: usize) -> Result<(), ConfigError> {
        if longest > self.max_copy_size {
            return Err(ConfigError::CopyCapacity {
                capacity: self.max_copy_size,
                longest,
            });
        }
        Ok(())
    }

    /// Width of the memory rows (forward ++ backward).
    pub fn memory_dim(&self) -> i64 {
        self.context_encoder_units * 2
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening config {}", path.display()))?;
        let cfg: Self = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref()).context("creating config file")?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub clip_norm: f64,
    pub suppression_weight: f64,
    pub entropy_weight: f64,
    pub vocab_size: usize,
    pub train_ratio: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            epochs: 10,
            learning_rate: 2e-4,
            clip_norm: 5.0,
            suppression_weight: 0.01,
            entropy_weight: 0.01,
            vocab_size: 2000,
            train_ratio: 0.9,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::NonPositive { name: "batch_size" });
        }
        if self.learning_rate <= 0.0 {
            return Err(ConfigError::NonPositive { name: "learning_rate" });
        }
        if self.vocab_size < 4 {
            return Err(ConfigError::VocabTooSmall(self.vocab_size));
        }
        if !(0.0..=1.0).contains(&self.train_ratio) {
            return Err(ConfigError::TrainRatio(self.train_ratio));
        }
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening config {}", path.display()))?;
        let cfg: Self = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
