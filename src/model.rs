//! Model step capability and input window construction.

use crate::config::ModelConfig;
use crate::error::{GenError, Result};
use crate::state::RwkvState;
use crate::tokenizer::TokenId;

/// Output of one forward step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub logits: Vec<f32>,
    pub next_state: RwkvState,
}

impl StepOutput {
    /// Reject outputs whose extents disagree with `config`.
    pub fn validate(&self, config: &ModelConfig) -> Result<()> {
        if self.logits.len() != config.vocab_size {
            return Err(GenError::ShapeMismatch {
                what: "logits",
                expected: config.vocab_size,
                got: self.logits.len(),
            });
        }
        if self.next_state.n_layers() != config.n_layers {
            return Err(GenError::ShapeMismatch {
                what: "state layers",
                expected: config.n_layers,
                got: self.next_state.n_layers(),
            });
        }
        if self.next_state.n_embd() != config.n_embd {
            return Err(GenError::ShapeMismatch {
                what: "state embedding",
                expected: config.n_embd,
                got: self.next_state.n_embd(),
            });
        }
        Ok(())
    }
}

/// One forward pass of a recurrent model, supplied by the host.
///
/// The call is an opaque, atomic unit: the decoding loop cannot interrupt it.
pub trait ModelStep {
    /// Whether the step is loaded and ready to run.
    fn is_ready(&self) -> bool {
        true
    }

    /// Run one step over a left-padded window of exactly `config.window` ids.
    fn run(&mut self, window: &[TokenId], state: &RwkvState) -> Result<StepOutput>;
}

impl<M: ModelStep + ?Sized> ModelStep for &mut M {
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn run(&mut self, window: &[TokenId], state: &RwkvState) -> Result<StepOutput> {
        (**self).run(window, state)
    }
}

impl<M: ModelStep + ?Sized> ModelStep for Box<M> {
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn run(&mut self, window: &[TokenId], state: &RwkvState) -> Result<StepOutput> {
        (**self).run(window, state)
    }
}

/// Left-pad `context` with zeros to `width`, keeping only its last `width` ids.
pub fn pad_left(context: &[TokenId], width: usize) -> Vec<TokenId> {
    let keep = context.len().min(width);
    let mut window = vec![0; width - keep];
    window.extend_from_slice(&context[context.len() - keep..]);
    window
}
