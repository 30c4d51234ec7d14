//! Recurrent state buffers threaded between model steps.

use crate::config::ModelConfig;
use crate::error::{GenError, Result};

/// Log-domain "negative infinity" used to seed the running max in `pp_att`.
pub const PP_ATT_INIT: f32 = -1e30;

/// Per-layer carry buffers of an RWKV-4 block stack.
///
/// Each buffer is `[n_layers, n_embd]`, row-major and layer-major.
#[derive(Debug, Clone, PartialEq)]
pub struct RwkvState {
    /// Previous token's input to time mixing (xx_att)
    pub xx_att: Vec<f32>,
    /// WKV numerator accumulator (aa_att)
    pub aa_att: Vec<f32>,
    /// WKV denominator accumulator (bb_att)
    pub bb_att: Vec<f32>,
    /// Running max exponent of the WKV accumulators (pp_att)
    pub pp_att: Vec<f32>,
    /// Previous token's input to channel mixing (xx_ffn)
    pub xx_ffn: Vec<f32>,
    n_layers: usize,
    n_embd: usize,
}

impl RwkvState {
    /// Allocate the initial state: zeros everywhere except `pp_att`.
    pub fn new(config: &ModelConfig) -> Self {
        let len = config.state_len();
        RwkvState {
            xx_att: vec![0.0; len],
            aa_att: vec![0.0; len],
            bb_att: vec![0.0; len],
            pp_att: vec![PP_ATT_INIT; len],
            xx_ffn: vec![0.0; len],
            n_layers: config.n_layers,
            n_embd: config.n_embd,
        }
    }

    /// Build a state from raw buffers, checking every extent against `config`.
    pub fn from_buffers(
        config: &ModelConfig,
        xx_att: Vec<f32>,
        aa_att: Vec<f32>,
        bb_att: Vec<f32>,
        pp_att: Vec<f32>,
        xx_ffn: Vec<f32>,
    ) -> Result<Self> {
        let state = RwkvState {
            xx_att,
            aa_att,
            bb_att,
            pp_att,
            xx_ffn,
            n_layers: config.n_layers,
            n_embd: config.n_embd,
        };
        state.check_extent(config.n_layers, config.n_embd)?;
        Ok(state)
    }

    #[inline]
    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    #[inline]
    pub fn n_embd(&self) -> usize {
        self.n_embd
    }

    /// Slices of one layer, in buffer order.
    pub fn layer(&self, l: usize) -> [&[f32]; 5] {
        let range = l * self.n_embd..(l + 1) * self.n_embd;
        [
            &self.xx_att[range.clone()],
            &self.aa_att[range.clone()],
            &self.bb_att[range.clone()],
            &self.pp_att[range.clone()],
            &self.xx_ffn[range],
        ]
    }

    fn buffers(&self) -> [(&'static str, &[f32]); 5] {
        [
            ("xx_att", self.xx_att.as_slice()),
            ("aa_att", self.aa_att.as_slice()),
            ("bb_att", self.bb_att.as_slice()),
            ("pp_att", self.pp_att.as_slice()),
            ("xx_ffn", self.xx_ffn.as_slice()),
        ]
    }

    fn check_extent(&self, n_layers: usize, n_embd: usize) -> Result<()> {
        if self.n_layers != n_layers {
            return Err(GenError::ShapeMismatch {
                what: "state layers",
                expected: n_layers,
                got: self.n_layers,
            });
        }
        if self.n_embd != n_embd {
            return Err(GenError::ShapeMismatch {
                what: "state embedding",
                expected: n_embd,
                got: self.n_embd,
            });
        }
        let expected = n_layers * n_embd;
        for (what, buf) in self.buffers() {
            if buf.len() != expected {
                return Err(GenError::ShapeMismatch {
                    what,
                    expected,
                    got: buf.len(),
                });
            }
        }
        Ok(())
    }

    /// Replace every buffer with the step's returned state.
    ///
    /// The replacement must have exactly this state's extent; on mismatch the
    /// current state is left untouched.
    pub fn advance(&mut self, next: RwkvState) -> Result<()> {
        next.check_extent(self.n_layers, self.n_embd)?;
        *self = next;
        Ok(())
    }
}
