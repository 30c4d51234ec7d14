//! Decoding loop: prompt replay, free-running generation, progress and cancellation.

use crate::config::{GenerateOptions, ModelConfig};
use crate::error::{GenError, Result};
use crate::model::{ModelStep, StepOutput, pad_left};
use crate::sample::{Decision, ProbEntry, ProbTable, Sampler, Visibility};
use crate::state::RwkvState;
use crate::tokenizer::{TokenId, Tokenizer, encode_prompt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    ReadingPrompt,
    Generating,
    Finished,
}

/// Progress report emitted once per step, plus one terminal `Finished` event.
///
/// `step_index` and `total_steps` are relative to the phase: prompt tokens
/// count against the prompt length, generated tokens against the number of
/// tokens the budget leaves for generation, and `Finished` against the budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepProgress {
    pub token_id: Option<TokenId>,
    /// Other tokens with nonzero probability, when candidates were requested
    pub candidates: Option<Vec<TokenId>>,
    pub phase: Phase,
    pub step_index: usize,
    pub total_steps: usize,
    pub tokens_per_second: Option<f64>,
}

impl StepProgress {
    pub(crate) fn reading(token_id: TokenId, step_index: usize, total_steps: usize) -> Self {
        StepProgress {
            token_id: Some(token_id),
            candidates: None,
            phase: Phase::ReadingPrompt,
            step_index,
            total_steps,
            tokens_per_second: None,
        }
    }

    pub(crate) fn generating(
        token_id: TokenId,
        candidates: Option<Vec<TokenId>>,
        step_index: usize,
        total_steps: usize,
    ) -> Self {
        StepProgress {
            token_id: Some(token_id),
            candidates,
            phase: Phase::Generating,
            step_index,
            total_steps,
            tokens_per_second: None,
        }
    }

    pub(crate) fn finished(steps: usize, total_steps: usize, started: Instant) -> Self {
        let secs = started.elapsed().as_secs_f64();
        StepProgress {
            token_id: None,
            candidates: None,
            phase: Phase::Finished,
            step_index: steps,
            total_steps,
            tokens_per_second: (secs > 0.0).then(|| steps as f64 / secs),
        }
    }
}

/// Observer of the decoding loop. Calls are fire-and-forget; nothing the sink
/// does affects the decisions the loop makes.
pub trait ProgressSink {
    fn on_step(&mut self, progress: &StepProgress);

    /// Read-only view of the session between steps.
    fn on_session(&mut self, _session: &Session) {}
}

impl<F: FnMut(&StepProgress)> ProgressSink for F {
    fn on_step(&mut self, progress: &StepProgress) {
        self(progress)
    }
}

/// Sink that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_step(&mut self, _progress: &StepProgress) {}
}

/// Cooperative cancellation, polled at the top of each step and again right
/// after the model step returns.
pub trait CancellationSource {
    fn is_cancelled(&self) -> bool;
}

impl CancellationSource for AtomicBool {
    fn is_cancelled(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

impl<C: CancellationSource + ?Sized> CancellationSource for &C {
    fn is_cancelled(&self) -> bool {
        (**self).is_cancelled()
    }
}

/// Source that never cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancel;

impl CancellationSource for NeverCancel {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Shareable cancellation flag; clones observe the same request.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl CancellationSource for CancelFlag {
    fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    /// Every token consumed or produced, seed token first
    pub context: Vec<TokenId>,
    /// Detokenized `context`
    pub text: String,
    /// Model steps that completed
    pub steps: usize,
    /// Logits of the last completed step
    pub final_logits: Option<Vec<f32>>,
    /// Table behind the last generated token, when the last step generated
    pub final_table: Option<ProbTable>,
    pub final_sampled: Option<ProbEntry>,
}

/// How a generation ended. Cancellation is not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(GenerationResult),
    /// Stopped on request; the result holds the context accumulated so far
    Cancelled(GenerationResult),
}

impl Outcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled(_))
    }

    pub fn result(&self) -> &GenerationResult {
        match self {
            Outcome::Completed(r) | Outcome::Cancelled(r) => r,
        }
    }

    pub fn into_result(self) -> GenerationResult {
        match self {
            Outcome::Completed(r) | Outcome::Cancelled(r) => r,
        }
    }
}

/// Mutable state of one generation, exclusively owned by the running loop.
#[derive(Debug, Clone)]
pub struct Session {
    context: Vec<TokenId>,
    state: RwkvState,
    pending: VecDeque<TokenId>,
    prompt_len: usize,
    total_steps: usize,
    steps: usize,
    generated: usize,
}

impl Session {
    /// Consume the first prompt token as the seed and allocate the initial state.
    fn seed(config: &ModelConfig, prompt: Vec<TokenId>, total_steps: usize) -> Result<Self> {
        let prompt_len = prompt.len();
        let mut pending = VecDeque::from(prompt);
        let seed = pending
            .pop_front()
            .ok_or_else(|| GenError::Tokenizer("prompt has no tokens".into()))?;
        Ok(Session {
            context: vec![seed],
            state: RwkvState::new(config),
            pending,
            prompt_len,
            total_steps,
            steps: 0,
            generated: 0,
        })
    }

    pub fn context(&self) -> &[TokenId] {
        &self.context
    }

    pub fn state(&self) -> &RwkvState {
        &self.state
    }

    /// Model steps completed so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Phase of the next step.
    pub fn phase(&self) -> Phase {
        if self.steps >= self.total_steps {
            Phase::Finished
        } else if self.pending.is_empty() {
            Phase::Generating
        } else {
            Phase::ReadingPrompt
        }
    }

    fn generation_total(&self) -> usize {
        self.total_steps
            .saturating_sub(self.prompt_len.saturating_sub(1))
    }
}

/// Drives sessions over an injected model step, tokenizer and sampler.
///
/// Each call to [`Generator::generate`] runs a fresh [`Session`]; nothing is
/// carried between calls except the sampler's random state.
pub struct Generator<M, T, R> {
    config: ModelConfig,
    model: M,
    tokenizer: T,
    sampler: Sampler<R>,
}

impl<M: ModelStep, T: Tokenizer, R: Rng> Generator<M, T, R> {
    pub fn new(config: ModelConfig, model: M, tokenizer: T, sampler: Sampler<R>) -> Result<Self> {
        config.validate()?;
        Ok(Generator {
            config,
            model,
            tokenizer,
            sampler,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    pub fn sampler_mut(&mut self) -> &mut Sampler<R> {
        &mut self.sampler
    }

    /// Tokenize `prompt` and run the decoding loop.
    pub fn generate<P, C>(
        &mut self,
        prompt: &str,
        options: &GenerateOptions,
        progress: &mut P,
        cancel: &C,
    ) -> Result<Outcome>
    where
        P: ProgressSink + ?Sized,
        C: CancellationSource + ?Sized,
    {
        self.ensure_ready()?;
        let tokens = encode_prompt(&self.tokenizer, prompt)?;
        self.generate_from_tokens(tokens, options, progress, cancel)
    }

    /// Run the decoding loop on an already tokenized prompt.
    ///
    /// Each step feeds the left-padded context window and the current state to
    /// the model. While prompt tokens remain the next prompt token is appended
    /// regardless of the logits; afterwards the sampler picks it.
    pub fn generate_from_tokens<P, C>(
        &mut self,
        prompt: Vec<TokenId>,
        options: &GenerateOptions,
        progress: &mut P,
        cancel: &C,
    ) -> Result<Outcome>
    where
        P: ProgressSink + ?Sized,
        C: CancellationSource + ?Sized,
    {
        self.ensure_ready()?;
        let prompt = if prompt.is_empty() {
            encode_prompt(&self.tokenizer, "")?
        } else {
            prompt
        };

        let started = Instant::now();
        let total_steps = options.budget.steps(prompt.len());
        let mut session = Session::seed(&self.config, prompt, total_steps)?;
        info!(
            prompt_len = session.prompt_len,
            total_steps,
            strategy = ?self.sampler.config().strategy,
            "generation started"
        );

        progress.on_step(&StepProgress::reading(
            session.context[0],
            1,
            session.prompt_len,
        ));
        progress.on_session(&session);

        let mut last_logits = None;
        let mut final_decision: Option<Decision> = None;

        while session.steps < total_steps {
            let step = session.steps;
            let phase = session.phase();

            if cancel.is_cancelled() {
                return self.cancelled(session, step);
            }

            let window = pad_left(&session.context, self.config.window);
            let output = self
                .model
                .run(&window, &session.state)
                .and_then(|out| out.validate(&self.config).map(|_| out))
                .map_err(|e| e.at_step(step, phase))?;

            if cancel.is_cancelled() {
                return self.cancelled(session, step);
            }

            let StepOutput { logits, next_state } = output;
            let is_last = step + 1 == total_steps;

            let (token, event) = match session.pending.pop_front() {
                Some(token) => {
                    let index = session.prompt_len - session.pending.len();
                    (
                        token,
                        StepProgress::reading(token, index, session.prompt_len),
                    )
                }
                None => {
                    let visibility = Visibility {
                        table: is_last,
                        candidates: options.show_candidates,
                    };
                    let decision = self
                        .sampler
                        .decide(&logits, &session.context, &self.tokenizer, visibility)
                        .map_err(|e| e.at_step(step, phase))?;
                    session.generated += 1;

                    let candidates = options
                        .show_candidates
                        .then(|| decision.candidates.clone());
                    let event = StepProgress::generating(
                        decision.token_id,
                        candidates,
                        session.generated,
                        session.generation_total(),
                    );
                    let token = decision.token_id;
                    if is_last {
                        final_decision = Some(decision);
                    }
                    (token, event)
                }
            };

            debug!(step, ?phase, token, "step complete");
            session.context.push(token);
            session
                .state
                .advance(next_state)
                .map_err(|e| e.at_step(step, phase))?;
            session.steps += 1;

            if is_last {
                last_logits = Some(logits);
            }

            progress.on_step(&event);
            progress.on_session(&session);
        }

        let finished = StepProgress::finished(session.steps, total_steps, started);
        info!(
            steps = session.steps,
            tokens_per_second = ?finished.tokens_per_second,
            "generation finished"
        );
        progress.on_step(&finished);

        let (final_table, final_sampled) = final_decision
            .map(|d| (d.table, d.sampled))
            .unwrap_or((None, None));
        let text = self.tokenizer.decode(&session.context)?;

        Ok(Outcome::Completed(GenerationResult {
            context: session.context,
            text,
            steps: session.steps,
            final_logits: last_logits,
            final_table,
            final_sampled,
        }))
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.model.is_ready() {
            Ok(())
        } else {
            Err(GenError::UninitializedModel)
        }
    }

    fn cancelled(&self, session: Session, step: usize) -> Result<Outcome> {
        info!(step, context_len = session.context.len(), "generation cancelled");
        let text = self.tokenizer.decode(&session.context)?;
        Ok(Outcome::Cancelled(GenerationResult {
            context: session.context,
            text,
            steps: session.steps,
            final_logits: None,
            final_table: None,
            final_sampled: None,
        }))
    }
}
