//! Token selection: greedy, top-k, top-p and full-vocabulary nucleus sampling.

use crate::config::{SamplingConfig, Strategy};
use crate::error::{GenError, Result};
use crate::ops::{argmax, cumulative_sum, softmax, weighted_draw};
use crate::tokenizer::{TokenId, Tokenizer};
use rand::Rng;
use rayon::prelude::*;
use serde::Serialize;
use std::cmp::Ordering;
use tracing::trace;

/// Number of ranked candidates kept in a display table. Tokens ranked below
/// this are never eligible under top-k or top-p.
pub const DISPLAY_CAP: usize = 50;

/// Used for ranking logits before truncation.
#[derive(Debug, Clone, Copy)]
pub struct LogitIndex {
    pub logit: f32,
    pub index: TokenId,
}

/// Top-p bookkeeping kept on every entry for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NucleusInfo {
    /// Probability before renormalizing over the nucleus
    pub softmax_probability: f32,
    pub cumulative_probability: f32,
    /// Rank of the last entry inside the nucleus
    pub cutoff_index: usize,
}

/// One row of a probability table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbEntry {
    pub token_id: TokenId,
    /// Logit as seen by the strategy (after repetition penalty)
    pub raw_logit: f32,
    /// `raw_logit / temperature`
    pub scaled_logit: f32,
    /// Scaled logit, or `-inf` if the strategy filtered the entry out
    pub kept_logit: f32,
    pub rank: usize,
    pub token: String,
    pub exp_logit: f32,
    pub probability: f32,
    pub nucleus: Option<NucleusInfo>,
}

/// Entries in descending raw-logit order; `rank` equals position.
pub type ProbTable = Vec<ProbEntry>;

/// Subtract `penalty` once from the logit of every token present in `context`.
///
/// Ids outside the logit vector are ignored.
pub fn apply_repetition_penalty(logits: &[f32], context: &[TokenId], penalty: f32) -> Vec<f32> {
    let mut out = logits.to_vec();
    let mut seen = vec![false; logits.len()];
    for &token in context {
        let i = token as usize;
        if i < out.len() && !seen[i] {
            seen[i] = true;
            out[i] -= penalty;
        }
    }
    out
}

/// The `DISPLAY_CAP` highest logits, descending. Equal logits keep vocabulary order.
pub fn rank_logits(logits: &[f32]) -> Vec<LogitIndex> {
    let mut ranked: Vec<LogitIndex> = logits
        .par_iter()
        .enumerate()
        .map(|(i, &logit)| LogitIndex {
            logit,
            index: i as TokenId,
        })
        .collect();

    // Stable, so ties rank by lowest id
    ranked.par_sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(Ordering::Equal));
    ranked.truncate(DISPLAY_CAP);
    ranked
}

/// Ranked, capped and temperature-scaled table with probabilities still unset.
fn scaled_table<T: Tokenizer + ?Sized>(
    logits: &[f32],
    temperature: f32,
    tokenizer: &T,
) -> Result<ProbTable> {
    if logits.is_empty() {
        return Err(GenError::EmptyVocabulary);
    }
    rank_logits(logits)
        .into_iter()
        .enumerate()
        .map(|(rank, li)| {
            let scaled = li.logit / temperature;
            Ok(ProbEntry {
                token_id: li.index,
                raw_logit: li.logit,
                scaled_logit: scaled,
                kept_logit: scaled,
                rank,
                token: tokenizer.decode_one(li.index)?,
                exp_logit: 0.0,
                probability: 0.0,
                nucleus: None,
            })
        })
        .collect()
}

/// Top-k table: entries ranked at or beyond `k` are masked before softmax.
pub fn top_k<T: Tokenizer + ?Sized>(
    logits: &[f32],
    k: usize,
    temperature: f32,
    tokenizer: &T,
) -> Result<ProbTable> {
    let mut table = scaled_table(logits, temperature, tokenizer)?;
    for entry in table.iter_mut() {
        if entry.rank >= k {
            entry.kept_logit = f32::NEG_INFINITY;
        }
    }

    let kept: Vec<f32> = table.iter().map(|e| e.kept_logit).collect();
    let sm = softmax(&kept)?;
    for (entry, (exp, prob)) in table.iter_mut().zip(sm.exps.into_iter().zip(sm.probs)) {
        entry.exp_logit = exp;
        entry.probability = prob;
    }
    Ok(table)
}

/// First position whose cumulative probability reaches `p`, else the last one.
///
/// `p >= 1` always selects the whole set, regardless of rounding.
fn nucleus_cutoff(cdf: &[f32], p: f32) -> usize {
    let last = cdf.len().saturating_sub(1);
    if p >= 1.0 {
        return last;
    }
    cdf.iter().position(|&c| c >= p).unwrap_or(last)
}

/// Top-p table: softmax over the whole capped set, then renormalize the nucleus.
pub fn top_p<T: Tokenizer + ?Sized>(
    logits: &[f32],
    p: f32,
    temperature: f32,
    tokenizer: &T,
) -> Result<ProbTable> {
    let mut table = scaled_table(logits, temperature, tokenizer)?;
    let scaled: Vec<f32> = table.iter().map(|e| e.scaled_logit).collect();
    let sm = softmax(&scaled)?;
    let cdf = cumulative_sum(&sm.probs);
    let cutoff = nucleus_cutoff(&cdf, p);

    let mass: f32 = sm.probs[..=cutoff].iter().sum();
    if !(mass > 0.0) {
        return Err(GenError::DegenerateDistribution);
    }

    for (i, entry) in table.iter_mut().enumerate() {
        entry.exp_logit = sm.exps[i];
        if i <= cutoff {
            entry.probability = sm.probs[i] / mass;
        } else {
            entry.kept_logit = f32::NEG_INFINITY;
            entry.probability = 0.0;
        }
        entry.nucleus = Some(NucleusInfo {
            softmax_probability: sm.probs[i],
            cumulative_probability: cdf[i],
            cutoff_index: cutoff,
        });
    }
    Ok(table)
}

/// Argmax over the raw logits; ties go to the lowest id.
///
/// Fails like the sampling strategies do when every logit is masked.
pub fn greedy(logits: &[f32]) -> Result<TokenId> {
    let idx = argmax(logits).ok_or(GenError::EmptyVocabulary)?;
    if !(logits[idx] > f32::NEG_INFINITY) {
        return Err(GenError::DegenerateDistribution);
    }
    Ok(idx as TokenId)
}

/// Nucleus distribution over the full vocabulary, in vocabulary order.
///
/// Tokens less likely than the one at the top-p boundary are zeroed, the
/// survivors are sharpened by `1 / temperature`, and the result renormalized.
///
/// Sharpening works on probabilities relative to the most likely token, so
/// the top survivor keeps a weight of 1 at any temperature.
pub fn multinomial_probs(logits: &[f32], temperature: f32, p: f32) -> Result<Vec<f32>> {
    let sm = softmax(logits)?;

    let mut sorted = sm.probs.clone();
    sorted.par_sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    let cdf = cumulative_sum(&sorted);
    let threshold = sorted[nucleus_cutoff(&cdf, p)];

    let exponent = 1.0 / temperature;
    let weights: Vec<f32> = sm
        .probs
        .iter()
        .zip(sm.exps.iter())
        .map(|(&q, &rel)| {
            if q < threshold || rel <= 0.0 {
                0.0
            } else if temperature == 1.0 {
                rel
            } else {
                rel.powf(exponent)
            }
        })
        .collect();

    let sum: f64 = weights.iter().map(|&w| w as f64).sum();
    if !(sum > 0.0) || !sum.is_finite() {
        return Err(GenError::DegenerateDistribution);
    }
    Ok(weights.iter().map(|&w| (w as f64 / sum) as f32).collect())
}

/// Display table for a full-vocabulary distribution.
fn multinomial_table<T: Tokenizer + ?Sized>(
    logits: &[f32],
    probs: &[f32],
    temperature: f32,
    tokenizer: &T,
) -> Result<ProbTable> {
    let mut table = scaled_table(logits, temperature, tokenizer)?;
    let scaled: Vec<f32> = table.iter().map(|e| e.scaled_logit).collect();
    let exps = softmax(&scaled)?.exps;
    for (entry, exp) in table.iter_mut().zip(exps) {
        let prob = probs[entry.token_id as usize];
        entry.exp_logit = exp;
        entry.probability = prob;
        if prob <= 0.0 {
            entry.kept_logit = f32::NEG_INFINITY;
        }
    }
    Ok(table)
}

/// What the caller wants to see besides the chosen token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Visibility {
    /// Build the probability table even when the strategy does not need one
    pub table: bool,
    /// Collect the other tokens with nonzero probability
    pub candidates: bool,
}

/// Result of one sampling decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub token_id: TokenId,
    pub table: Option<ProbTable>,
    pub sampled: Option<ProbEntry>,
    pub candidates: Vec<TokenId>,
}

/// Applies a [`SamplingConfig`] to logits, owning the only source of randomness.
#[derive(Debug, Clone)]
pub struct Sampler<R> {
    config: SamplingConfig,
    rng: R,
}

impl<R: Rng> Sampler<R> {
    pub fn new(config: SamplingConfig, rng: R) -> Result<Self> {
        config.validate()?;
        Ok(Sampler { config, rng })
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Swap the sampling settings, keeping the random stream.
    pub fn set_config(&mut self, config: SamplingConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Pick the next token from `logits`, given everything already in `context`.
    ///
    /// The repetition penalty, when configured, applies to every strategy.
    pub fn decide<T: Tokenizer + ?Sized>(
        &mut self,
        logits: &[f32],
        context: &[TokenId],
        tokenizer: &T,
        visibility: Visibility,
    ) -> Result<Decision> {
        let penalized;
        let logits = match self.config.repetition_penalty {
            Some(penalty) if penalty > 0.0 => {
                penalized = apply_repetition_penalty(logits, context, penalty);
                &penalized[..]
            }
            _ => logits,
        };
        let temperature = self.config.temperature;

        let decision = match self.config.strategy {
            Strategy::Greedy => {
                let token_id = greedy(logits)?;
                let table = if visibility.table {
                    Some(top_k(logits, 1, temperature, tokenizer)?)
                } else {
                    None
                };
                let sampled = find_entry(table.as_ref(), token_id);
                Decision {
                    token_id,
                    table,
                    sampled,
                    candidates: Vec::new(),
                }
            }
            Strategy::TopK { k } => {
                let table = top_k(logits, k, temperature, tokenizer)?;
                self.draw_from_table(table, visibility)?
            }
            Strategy::TopP { p } => {
                let table = top_p(logits, p, temperature, tokenizer)?;
                self.draw_from_table(table, visibility)?
            }
            Strategy::Multinomial { p } => {
                let probs = multinomial_probs(logits, temperature, p)?;
                let idx = weighted_draw(&probs, &mut self.rng)?;
                let candidates = if visibility.candidates {
                    probs
                        .par_iter()
                        .enumerate()
                        .filter(|&(j, &q)| j != idx && q > 0.0)
                        .map(|(j, _)| j as TokenId)
                        .collect()
                } else {
                    Vec::new()
                };
                let table = if visibility.table {
                    Some(multinomial_table(logits, &probs, temperature, tokenizer)?)
                } else {
                    None
                };
                let token_id = idx as TokenId;
                let sampled = find_entry(table.as_ref(), token_id);
                Decision {
                    token_id,
                    table,
                    sampled,
                    candidates,
                }
            }
        };

        trace!(
            token = decision.token_id,
            candidates = decision.candidates.len(),
            "sampled token"
        );
        Ok(decision)
    }

    fn draw_from_table(&mut self, table: ProbTable, visibility: Visibility) -> Result<Decision> {
        let probs: Vec<f32> = table.iter().map(|e| e.probability).collect();
        let idx = weighted_draw(&probs, &mut self.rng)?;
        let sampled = table[idx].clone();
        let candidates = if visibility.candidates {
            table
                .iter()
                .filter(|e| e.rank != idx && e.probability > 0.0)
                .map(|e| e.token_id)
                .collect()
        } else {
            Vec::new()
        };
        Ok(Decision {
            token_id: sampled.token_id,
            table: Some(table),
            sampled: Some(sampled),
            candidates,
        })
    }
}

fn find_entry(table: Option<&ProbTable>, token_id: TokenId) -> Option<ProbEntry> {
    table.and_then(|t| t.iter().find(|e| e.token_id == token_id).cloned())
}
