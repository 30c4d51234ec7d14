//! Error types for RWKV generation.

use crate::session::Phase;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GenError {
    #[error("Model step is not initialized")]
    UninitializedModel,

    #[error("Shape mismatch in {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("Degenerate distribution: every candidate is masked")]
    DegenerateDistribution,

    #[error("Empty logit vector")]
    EmptyVocabulary,

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Model step error: {0}")]
    Model(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid cached run: {0}")]
    InvalidArtifact(String),

    #[error("Step {step} ({phase:?}) failed: {source}")]
    Step {
        step: usize,
        phase: Phase,
        #[source]
        source: Box<GenError>,
    },
}

impl GenError {
    /// Attach the step index and phase at which the error surfaced.
    pub fn at_step(self, step: usize, phase: Phase) -> Self {
        match self {
            e @ GenError::Step { .. } => e,
            e => GenError::Step {
                step,
                phase,
                source: Box::new(e),
            },
        }
    }

    /// The underlying error, looking through step context.
    pub fn root(&self) -> &GenError {
        match self {
            GenError::Step { source, .. } => source.root(),
            e => e,
        }
    }
}

pub type Result<T> = std::result::Result<T, GenError>;
