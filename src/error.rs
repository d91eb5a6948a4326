use thiserror::Error;

/// Rejected configuration. Fatal at startup, never retried.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("copy capacity {capacity} is smaller than the longest passage ({longest} tokens)")]
    CopyCapacity { capacity: usize, longest: usize },

    #[error("beam width must be at least 1")]
    ZeroBeamWidth,

    #[error("dropout must be in [0, 1), got {0}")]
    Dropout(f64),

    #[error("train ratio must be in [0, 1], got {0}")]
    TrainRatio(f64),

    #[error("{name} must be positive")]
    NonPositive { name: &'static str },

    #[error("vocabulary of size {0} cannot hold the four reserved tokens")]
    VocabTooSmall(usize),
}

/// Errors raised by the model on malformed batches.
#[derive(Debug, Error)]
pub enum QgError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("batch is empty")]
    EmptyBatch,

    #[error("tensor conversion failed: {0}")]
    Tensor(#[from] tch::TchError),
}
