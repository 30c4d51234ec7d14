//! Model and sampling configuration.

use crate::error::{GenError, Result};
use serde::{Deserialize, Serialize};

/// Input width the exported RWKV-4 step graphs were traced with.
pub const DEFAULT_WINDOW: usize = 1024;

/// Vocabulary size of the Pile tokenizer shared by the RWKV-4 checkpoints.
pub const PILE_VOCAB_SIZE: usize = 50277;

/// Shape metadata of a recurrent model, as far as the decoding loop needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of blocks (layer_num)
    pub n_layers: usize,
    /// Embedding dimension (n_embd)
    pub n_embd: usize,
    /// Fixed width of the token window fed to each step
    pub window: usize,
    /// Length of the logit vector produced by each step
    pub vocab_size: usize,
}

impl ModelConfig {
    /// Look up one of the bundled RWKV-4 presets by name.
    pub fn preset(name: &str) -> Option<Self> {
        let (n_layers, n_embd) = match name {
            "rwkv4-small" => (12, 768),
            "rwkv4-medium" => (24, 1024),
            "rwkv4-large" => (24, 2048),
            _ => return None,
        };
        Some(ModelConfig {
            n_layers,
            n_embd,
            window: DEFAULT_WINDOW,
            vocab_size: PILE_VOCAB_SIZE,
        })
    }

    /// Number of cells in each recurrent state buffer.
    #[inline]
    pub fn state_len(&self) -> usize {
        self.n_layers * self.n_embd
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_layers == 0 || self.n_embd == 0 {
            return Err(GenError::InvalidConfig(format!(
                "state extent must be non-empty, got {}x{}",
                self.n_layers, self.n_embd
            )));
        }
        if self.window == 0 {
            return Err(GenError::InvalidConfig("window must be positive".into()));
        }
        if self.vocab_size == 0 {
            return Err(GenError::InvalidConfig(
                "vocab_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// How the next token is chosen once the prompt has been consumed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Strategy {
    /// Argmax over the raw logits
    Greedy,
    /// Sample among the `k` best entries of the display table
    TopK { k: usize },
    /// Nucleus sampling over the display table
    TopP { p: f32 },
    /// Nucleus sampling over the whole vocabulary
    Multinomial { p: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub strategy: Strategy,
    pub temperature: f32,
    /// Amount subtracted from the logit of every token already in context.
    /// Honored by every strategy.
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::TopK { k: 5 },
            temperature: 0.8,
            repetition_penalty: None,
        }
    }
}

impl SamplingConfig {
    pub fn greedy() -> Self {
        Self {
            strategy: Strategy::Greedy,
            temperature: 1.0,
            repetition_penalty: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.temperature > 0.0) || !self.temperature.is_finite() {
            return Err(GenError::InvalidConfig(format!(
                "temperature must be a positive real, got {}",
                self.temperature
            )));
        }
        match self.strategy {
            Strategy::TopK { k: 0 } => {
                return Err(GenError::InvalidConfig("top-k needs k >= 1".into()));
            }
            Strategy::TopP { p } | Strategy::Multinomial { p } if !(p > 0.0 && p <= 1.0) => {
                return Err(GenError::InvalidConfig(format!(
                    "top-p must lie in (0, 1], got {p}"
                )));
            }
            _ => {}
        }
        if let Some(penalty) = self.repetition_penalty {
            if !(penalty >= 0.0) {
                return Err(GenError::InvalidConfig(format!(
                    "repetition penalty must be >= 0, got {penalty}"
                )));
            }
        }
        Ok(())
    }
}

/// Number of model steps a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Budget {
    /// A fixed number of steps, prompt replay included
    Tokens(usize),
    /// One step per prompt token: replay the prompt, then predict one token
    PromptReplay,
}

impl Budget {
    /// Resolve to a step count for a prompt of `prompt_len` tokens.
    pub fn steps(&self, prompt_len: usize) -> usize {
        match *self {
            Budget::Tokens(n) => n,
            Budget::PromptReplay => prompt_len,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub budget: Budget,
    /// Report sibling candidates with nonzero probability on each generated token.
    #[serde(default)]
    pub show_candidates: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            budget: Budget::Tokens(32),
            show_candidates: false,
        }
    }
}
