use thiserror::Error;

/// Failures the training run can report before or while it runs.
#[derive(Debug, Error)]
pub enum GlowError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("actnorm init expected {expected} samples but collected {got}")]
    InitBatchMismatch { expected: usize, got: usize },

    #[error("cannot read iteration from checkpoint name '{0}'")]
    CheckpointName(String),

    #[error("dataset error: {0}")]
    Dataset(String),
}
