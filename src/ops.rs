//! Numeric primitives for turning logits into draws.

use crate::error::{GenError, Result};
use rand::{Rng, RngExt};

/// Exponentials and normalized probabilities of one softmax pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Softmax {
    pub exps: Vec<f32>,
    pub probs: Vec<f32>,
}

/// Numerically stable softmax.
///
/// The maximum finite value is subtracted before exponentiating, and
/// `-inf` inputs map to an exponential of exactly 0. If any input is `+inf`,
/// the mass is shared evenly among the `+inf` entries. Fails with
/// [`GenError::DegenerateDistribution`] when every input is `-inf`.
pub fn softmax(x: &[f32]) -> Result<Softmax> {
    let exps: Vec<f32> = if x.contains(&f32::INFINITY) {
        x.iter()
            .map(|&v| if v == f32::INFINITY { 1.0 } else { 0.0 })
            .collect()
    } else {
        let max_val = x
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(f32::NEG_INFINITY, f32::max);
        if max_val == f32::NEG_INFINITY {
            return Err(GenError::DegenerateDistribution);
        }
        x.iter()
            .map(|&v| {
                if v == f32::NEG_INFINITY {
                    0.0
                } else {
                    (v - max_val).exp()
                }
            })
            .collect()
    };

    // Accumulated in f64 so long vocabularies still normalize to 1
    let sum: f64 = exps.iter().map(|&e| e as f64).sum();
    let probs = exps.iter().map(|&e| (e as f64 / sum) as f32).collect();

    Ok(Softmax { exps, probs })
}

/// Running total of `x`.
pub fn cumulative_sum(x: &[f32]) -> Vec<f32> {
    x.iter()
        .scan(0.0f32, |acc, &p| {
            *acc += p;
            Some(*acc)
        })
        .collect()
}

/// Index of the maximum element; ties go to the lowest index.
#[inline]
pub fn argmax(x: &[f32]) -> Option<usize> {
    let mut iter = x.iter().enumerate();
    let (mut max_idx, mut max_val) = iter.next().map(|(i, &v)| (i, v))?;
    for (i, &v) in iter {
        if v > max_val {
            max_val = v;
            max_idx = i;
        }
    }
    Some(max_idx)
}

/// Resolve a uniform draw `r` in `[0, 1)` against `probs`, walked in order.
///
/// Returns the first index whose cumulative probability exceeds `r`. If
/// rounding leaves `r` unresolved, the last index with nonzero probability
/// wins. `None` means every probability is zero.
pub fn weighted_draw_at(probs: &[f32], r: f32) -> Option<usize> {
    let mut cdf = 0.0f32;
    let mut last_nonzero = None;
    for (i, &p) in probs.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        last_nonzero = Some(i);
        cdf += p;
        if r < cdf {
            return Some(i);
        }
    }
    last_nonzero
}

/// Draw an index from `probs` with a fresh uniform value from `rng`.
pub fn weighted_draw<R: Rng>(probs: &[f32], rng: &mut R) -> Result<usize> {
    let r: f32 = rng.random();
    weighted_draw_at(probs, r).ok_or(GenError::DegenerateDistribution)
}
