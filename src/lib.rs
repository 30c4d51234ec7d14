//! Autoregressive generation for recurrent (RWKV-style) language models.
//!
//! The forward pass and the tokenizer are supplied by the host through the
//! [`ModelStep`] and [`Tokenizer`] traits. This crate threads the recurrent
//! state between steps, replays the prompt, samples new tokens and reports
//! progress.

pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod ops;
pub mod sample;
pub mod session;
pub mod state;
pub mod tokenizer;

pub use cache::{CachedRun, replay, resample};
pub use config::{Budget, GenerateOptions, ModelConfig, SamplingConfig, Strategy};
pub use error::{GenError, Result};
pub use model::{ModelStep, StepOutput, pad_left};
pub use sample::{Decision, ProbEntry, ProbTable, Sampler, Visibility};
pub use session::{
    CancelFlag, CancellationSource, GenerationResult, Generator, NeverCancel, NoProgress, Outcome,
    Phase, ProgressSink, Session, StepProgress,
};
pub use state::RwkvState;
pub use tokenizer::{TokenId, Tokenizer};
