//! Captured runs and their replay through the sampling stage.

use crate::config::GenerateOptions;
use crate::error::{GenError, Result};
use crate::sample::{Decision, Sampler, Visibility};
use crate::session::{GenerationResult, ProgressSink, StepProgress};
use crate::tokenizer::{TokenId, Tokenizer};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use std::io::{Read, Write};
use std::time::Instant;
use tracing::debug;

const MAGIC: &[u8; 4] = b"RWKC";
const VERSION: u32 = 1;
const MAX_TOKENS: usize = 1 << 20;
const MAX_VOCAB: usize = 1 << 24;

/// Prompt tokens and the logits the model produced after reading them.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRun {
    pub token_ids: Vec<TokenId>,
    pub logits: Vec<f32>,
}

impl CachedRun {
    pub fn new(token_ids: Vec<TokenId>, logits: Vec<f32>) -> Result<Self> {
        let run = CachedRun { token_ids, logits };
        run.validate()?;
        Ok(run)
    }

    /// Capture a finished generation: the tokens that were fed to the model
    /// and the logits of its last step.
    pub fn from_result(result: &GenerationResult) -> Result<Self> {
        let logits = result
            .final_logits
            .clone()
            .ok_or_else(|| GenError::InvalidArtifact("result has no final logits".into()))?;
        let fed = result.context.len().saturating_sub(1);
        CachedRun::new(result.context[..fed].to_vec(), logits)
    }

    fn validate(&self) -> Result<()> {
        if self.token_ids.is_empty() {
            return Err(GenError::InvalidArtifact("no tokens".into()));
        }
        if self.token_ids.len() > MAX_TOKENS {
            return Err(GenError::InvalidArtifact(format!(
                "{} tokens exceeds the limit of {MAX_TOKENS}",
                self.token_ids.len()
            )));
        }
        if self.logits.is_empty() || self.logits.len() > MAX_VOCAB {
            return Err(GenError::InvalidArtifact(format!(
                "logit vector of length {} is out of range",
                self.logits.len()
            )));
        }
        Ok(())
    }

    /// Write the run in little-endian binary layout.
    ///
    /// Runs that [`CachedRun::read_from`] would reject are refused before
    /// anything is written.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.validate()?;
        writer.write_all(MAGIC)?;
        writer.write_u32::<LittleEndian>(VERSION)?;
        writer.write_u32::<LittleEndian>(self.token_ids.len() as u32)?;
        for &id in &self.token_ids {
            writer.write_u32::<LittleEndian>(id)?;
        }
        writer.write_u32::<LittleEndian>(self.logits.len() as u32)?;
        for &l in &self.logits {
            writer.write_f32::<LittleEndian>(l)?;
        }
        Ok(())
    }

    /// Read a run written by [`CachedRun::write_to`].
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(GenError::InvalidArtifact("bad magic".into()));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != VERSION {
            return Err(GenError::InvalidArtifact(format!(
                "unsupported version {version}"
            )));
        }

        let n_tokens = read_len(reader, MAX_TOKENS, "token count")?;
        let mut token_ids = vec![0u32; n_tokens];
        reader.read_u32_into::<LittleEndian>(&mut token_ids)?;

        let vocab = read_len(reader, MAX_VOCAB, "vocabulary size")?;
        let logits = read_f32_vec(reader, vocab)?;

        CachedRun::new(token_ids, logits)
    }
}

fn read_len<R: Read>(reader: &mut R, max: usize, what: &str) -> Result<usize> {
    let len = reader.read_u32::<LittleEndian>()? as usize;
    if len > max {
        return Err(GenError::InvalidArtifact(format!(
            "{what} {len} exceeds the limit of {max}"
        )));
    }
    Ok(len)
}

fn read_f32_vec<R: Read>(reader: &mut R, count: usize) -> Result<Vec<f32>> {
    let mut buf = vec![0f32; count];
    reader.read_f32_into::<LittleEndian>(&mut buf)?;
    Ok(buf)
}

/// Run only the sampling stage on the cached logits.
///
/// Used after a sampling change (e.g. a new temperature) to refresh the
/// prediction without touching the model.
pub fn resample<T, R>(cached: &CachedRun, sampler: &mut Sampler<R>, tokenizer: &T) -> Result<Decision>
where
    T: Tokenizer + ?Sized,
    R: Rng,
{
    let visibility = Visibility {
        table: true,
        candidates: false,
    };
    sampler.decide(&cached.logits, &cached.token_ids, tokenizer, visibility)
}

/// Replay a cached run as if it were a live prompt-replay generation.
///
/// Progress events match the live path for the same prompt: one
/// `ReadingPrompt` per cached token, one `Generating` for the prediction, then
/// `Finished`.
pub fn replay<T, R, P>(
    cached: &CachedRun,
    sampler: &mut Sampler<R>,
    tokenizer: &T,
    options: &GenerateOptions,
    progress: &mut P,
) -> Result<GenerationResult>
where
    T: Tokenizer + ?Sized,
    R: Rng,
    P: ProgressSink + ?Sized,
{
    cached.validate()?;
    let started = Instant::now();
    let prompt_len = cached.token_ids.len();

    for (i, &token) in cached.token_ids.iter().enumerate() {
        progress.on_step(&StepProgress::reading(token, i + 1, prompt_len));
    }

    let visibility = Visibility {
        table: true,
        candidates: options.show_candidates,
    };
    let decision = sampler.decide(&cached.logits, &cached.token_ids, tokenizer, visibility)?;
    debug!(token = decision.token_id, "replayed cached prediction");

    let candidates = options
        .show_candidates
        .then(|| decision.candidates.clone());
    progress.on_step(&StepProgress::generating(decision.token_id, candidates, 1, 1));
    progress.on_step(&StepProgress::finished(prompt_len, prompt_len, started));

    let mut context = cached.token_ids.clone();
    context.push(decision.token_id);
    let text = tokenizer.decode(&context)?;

    Ok(GenerationResult {
        context,
        text,
        steps: prompt_len,
        final_logits: Some(cached.logits.clone()),
        final_table: decision.table,
        final_sampled: decision.sampled,
    })
}
