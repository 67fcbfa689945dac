//! Error types for the trainer.
//!
//! Every failure is fatal: this is an offline batch process restarted by hand,
//! and per-epoch checkpoints exist so a restart loses at most one epoch.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed input record at line {line}: {reason}")]
    Ingest { line: usize, reason: String },

    #[error("non-finite value during {context}; aborting before it reaches the coupling matrix")]
    NonFinite { context: String },

    #[error("failed to build worker pool: {0}")]
    Pool(String),

    #[error("checkpoint write failed: {0}")]
    Checkpoint(String),
}

impl TrainError {
    pub fn ingest(line: usize, reason: impl Into<String>) -> Self {
        Self::Ingest {
            line,
            reason: reason.into(),
        }
    }

    pub fn non_finite(context: impl Into<String>) -> Self {
        Self::NonFinite {
            context: context.into(),
        }
    }
}
