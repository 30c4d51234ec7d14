use rand::SeedableRng;
use rand::rngs::StdRng;
use rwkv_gen::{
    Budget, CachedRun, CancelFlag, CancellationSource, GenError, GenerateOptions, Generator,
    ModelConfig, ModelStep, NeverCancel, NoProgress, Outcome, Phase, ProgressSink, Result,
    RwkvState, Sampler, SamplingConfig, Session, StepOutput, StepProgress, Strategy, TokenId,
    Tokenizer, replay,
};

const VOCAB: usize = 16;

fn config() -> ModelConfig {
    ModelConfig {
        n_layers: 2,
        n_embd: 3,
        window: 8,
        vocab_size: VOCAB,
    }
}

/// Space-separated decimal ids. A blank string encodes to token 0.
struct Digits;

impl Tokenizer for Digits {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        if !text.is_empty() && text.trim().is_empty() {
            return Ok(vec![0]);
        }
        text.split_whitespace()
            .map(|w| w.parse().map_err(|_| GenError::Tokenizer(format!("bad id {w}"))))
            .collect()
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        Ok(tokens
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(" "))
    }
}

/// Returns a fixed logit spike and counts calls per session in `xx_att`.
struct Spike {
    config: ModelConfig,
    favored: TokenId,
    spike: f32,
    session_calls: usize,
    windows: Vec<Vec<TokenId>>,
    ready: bool,
    /// Call index at which the logit vector comes back one short
    truncate_at: Option<usize>,
    /// Call index at which every logit is `-inf`
    mask_at: Option<usize>,
    /// Flag to raise while the given call is in flight
    cancel_during: Option<(usize, CancelFlag)>,
}

impl Spike {
    fn new(favored: TokenId) -> Self {
        Spike {
            config: config(),
            favored,
            spike: 100.0,
            session_calls: 0,
            windows: Vec::new(),
            ready: true,
            truncate_at: None,
            mask_at: None,
            cancel_during: None,
        }
    }
}

impl ModelStep for Spike {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn run(&mut self, window: &[TokenId], state: &RwkvState) -> Result<StepOutput> {
        assert_eq!(window.len(), self.config.window);
        // The state handed in must be the one returned by the previous call
        let tick = state.xx_att[0];
        assert!(state.xx_att.iter().all(|&v| v == tick));
        if tick == 0.0 {
            assert!(state.pp_att.iter().all(|&v| v == -1e30));
            self.session_calls = 0;
        }
        assert_eq!(tick, self.session_calls as f32);

        let call = self.session_calls;
        self.session_calls += 1;
        self.windows.push(window.to_vec());

        if let Some((at, flag)) = &self.cancel_during {
            if *at == call {
                flag.cancel();
            }
        }

        let mut logits = vec![0.0f32; VOCAB];
        logits[self.favored as usize] = self.spike;
        if self.truncate_at == Some(call) {
            logits.pop();
        }
        if self.mask_at == Some(call) {
            logits = vec![f32::NEG_INFINITY; VOCAB];
        }

        let mut next_state = state.clone();
        for v in next_state.xx_att.iter_mut() {
            *v += 1.0;
        }
        Ok(StepOutput { logits, next_state })
    }
}

fn generator(model: Spike, sampling: SamplingConfig) -> Generator<Spike, Digits, StdRng> {
    let sampler = Sampler::new(sampling, StdRng::seed_from_u64(11)).unwrap();
    Generator::new(config(), model, Digits, sampler).unwrap()
}

fn tokens(n: usize) -> GenerateOptions {
    GenerateOptions {
        budget: Budget::Tokens(n),
        show_candidates: false,
    }
}

#[derive(Default)]
struct Recorder {
    events: Vec<StepProgress>,
    snapshots: Vec<(usize, usize, usize)>,
}

impl ProgressSink for Recorder {
    fn on_step(&mut self, progress: &StepProgress) {
        self.events.push(progress.clone());
    }

    fn on_session(&mut self, session: &Session) {
        self.snapshots.push((
            session.steps(),
            session.context().len(),
            session.state().xx_att.len(),
        ));
    }
}

#[test]
fn test_greedy_end_to_end() {
    let mut generator = generator(Spike::new(9), SamplingConfig::greedy());
    let mut recorder = Recorder::default();
    let outcome = generator
        .generate("5 9 2", &tokens(3), &mut recorder, &NeverCancel)
        .unwrap();

    let result = match outcome {
        Outcome::Completed(r) => r,
        Outcome::Cancelled(_) => panic!("not cancelled"),
    };
    assert_eq!(result.context, vec![5, 9, 2, 9]);
    assert_eq!(result.text, "5 9 2 9");
    assert_eq!(result.steps, 3);

    let summary: Vec<(Phase, Option<TokenId>, usize, usize)> = recorder
        .events
        .iter()
        .map(|e| (e.phase, e.token_id, e.step_index, e.total_steps))
        .collect();
    assert_eq!(
        summary,
        vec![
            (Phase::ReadingPrompt, Some(5), 1, 3),
            (Phase::ReadingPrompt, Some(9), 2, 3),
            (Phase::ReadingPrompt, Some(2), 3, 3),
            (Phase::Generating, Some(9), 1, 1),
            (Phase::Finished, None, 3, 3),
        ]
    );
    assert!(recorder.events.iter().all(|e| e.candidates.is_none()));
}

#[test]
fn test_context_grows_by_one_per_step() {
    let mut generator = generator(Spike::new(4), SamplingConfig::greedy());
    let mut recorder = Recorder::default();
    generator
        .generate("1", &tokens(12), &mut recorder, &NeverCancel)
        .unwrap();

    assert_eq!(recorder.snapshots.len(), 13);
    for &(steps, context_len, state_len) in &recorder.snapshots {
        assert_eq!(context_len, 1 + steps);
        assert_eq!(state_len, config().state_len());
    }
}

#[test]
fn test_generator_reuse_starts_fresh_session() {
    let mut generator = generator(Spike::new(4), SamplingConfig::greedy());
    let first = generator
        .generate("1 2 3", &tokens(10), &mut NoProgress, &NeverCancel)
        .unwrap();
    assert_eq!(first.result().context.len(), 11);

    // A second run on the same generator starts from a fresh state
    let second = generator
        .generate("7", &tokens(1), &mut NoProgress, &NeverCancel)
        .unwrap();
    assert_eq!(second.result().context, vec![7, 4]);
}

#[test]
fn test_windows_seen_by_model() {
    let mut model = Spike::new(4);
    let sampler = Sampler::new(SamplingConfig::greedy(), StdRng::seed_from_u64(0)).unwrap();
    let mut generator = Generator::new(config(), &mut model, Digits, sampler).unwrap();
    generator
        .generate("1 2 3", &tokens(10), &mut NoProgress, &NeverCancel)
        .unwrap();
    drop(generator);

    assert_eq!(model.windows.len(), 10);
    assert_eq!(model.windows[0], vec![0, 0, 0, 0, 0, 0, 0, 1]);
    assert_eq!(model.windows[1], vec![0, 0, 0, 0, 0, 0, 1, 2]);
    // Context is 10 long by the last call; only the newest 8 ids are fed
    assert_eq!(model.windows[9], vec![3, 4, 4, 4, 4, 4, 4, 4]);
}

#[test]
fn test_prompt_is_replayed_regardless_of_logits() {
    let mut generator = generator(Spike::new(7), SamplingConfig::greedy());
    let outcome = generator
        .generate("3 4 5 6", &tokens(5), &mut NoProgress, &NeverCancel)
        .unwrap();
    assert_eq!(outcome.result().context, vec![3, 4, 5, 6, 7, 7]);
}

/// Raises the flag once it has seen `after` step events past the seed.
struct CancelAfter {
    flag: CancelFlag,
    after: usize,
    seen: usize,
    events: Vec<Phase>,
}

impl ProgressSink for CancelAfter {
    fn on_step(&mut self, progress: &StepProgress) {
        self.events.push(progress.phase);
        if self.events.len() > 1 {
            self.seen += 1;
        }
        if self.seen == self.after {
            self.flag.cancel();
        }
    }
}

#[test]
fn test_cancel_before_third_step() {
    let flag = CancelFlag::new();
    let mut sink = CancelAfter {
        flag: flag.clone(),
        after: 2,
        seen: 0,
        events: Vec::new(),
    };
    let mut generator = generator(Spike::new(3), SamplingConfig::default());
    let outcome = generator
        .generate("1", &tokens(10), &mut sink, &flag)
        .unwrap();

    assert!(outcome.is_cancelled());
    let result = outcome.into_result();
    assert!(result.context.len() <= 4);
    assert_eq!(result.context.len(), 3);
    assert_eq!(result.steps, 2);
    assert!(!sink.events.contains(&Phase::Finished));
    assert!(result.final_logits.is_none());
}

#[test]
fn test_cancel_during_model_call_drops_token() {
    let flag = CancelFlag::new();
    let mut model = Spike::new(3);
    model.cancel_during = Some((1, flag.clone()));
    let mut generator = generator(model, SamplingConfig::greedy());
    let mut recorder = Recorder::default();
    let outcome = generator
        .generate("1", &tokens(10), &mut recorder, &flag)
        .unwrap();

    assert!(outcome.is_cancelled());
    // The in-flight call completed but its token was not appended
    assert_eq!(outcome.result().context, vec![1, 3]);
    assert!(recorder.events.iter().all(|e| e.phase != Phase::Finished));
    assert!(flag.is_cancelled());
}

#[test]
fn test_cancel_before_start_keeps_seed() {
    let flag = CancelFlag::new();
    flag.cancel();
    let mut generator = generator(Spike::new(3), SamplingConfig::greedy());
    let outcome = generator
        .generate("8 1", &tokens(4), &mut NoProgress, &flag)
        .unwrap();
    assert!(outcome.is_cancelled());
    assert_eq!(outcome.result().context, vec![8]);
    assert_eq!(outcome.result().text, "8");
}

#[test]
fn test_shape_mismatch_is_fatal_with_step_context() {
    let mut model = Spike::new(3);
    model.truncate_at = Some(1);
    let mut generator = generator(model, SamplingConfig::greedy());
    let err = generator
        .generate("1 2 3", &tokens(5), &mut NoProgress, &NeverCancel)
        .unwrap_err();

    match &err {
        GenError::Step { step, phase, .. } => {
            assert_eq!(*step, 1);
            assert_eq!(*phase, Phase::ReadingPrompt);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(matches!(
        err.root(),
        GenError::ShapeMismatch {
            what: "logits",
            expected: 16,
            got: 15
        }
    ));
}

#[test]
fn test_masked_logits_fail_while_generating() {
    let mut model = Spike::new(3);
    model.mask_at = Some(1);
    let mut generator = generator(model, SamplingConfig::default());
    let err = generator
        .generate("1", &tokens(3), &mut NoProgress, &NeverCancel)
        .unwrap_err();
    match &err {
        GenError::Step { step, phase, .. } => {
            assert_eq!(*step, 1);
            assert_eq!(*phase, Phase::Generating);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(matches!(err.root(), GenError::DegenerateDistribution));
}

#[test]
fn test_masked_logits_fail_greedy_before_last_step() {
    let mut model = Spike::new(3);
    model.mask_at = Some(1);
    let mut generator = generator(model, SamplingConfig::greedy());
    let err = generator
        .generate("1", &tokens(4), &mut NoProgress, &NeverCancel)
        .unwrap_err();
    assert!(matches!(err, GenError::Step { step: 1, .. }));
    assert!(matches!(err.root(), GenError::DegenerateDistribution));
}

#[test]
fn test_uninitialized_model_aborts_before_seeding() {
    let mut model = Spike::new(3);
    model.ready = false;
    let mut generator = generator(model, SamplingConfig::greedy());
    let mut recorder = Recorder::default();
    let err = generator
        .generate("1 2", &tokens(3), &mut recorder, &NeverCancel)
        .unwrap_err();
    assert!(matches!(err, GenError::UninitializedModel));
    assert!(recorder.events.is_empty());
}

#[test]
fn test_empty_prompt_uses_space_token() {
    let mut generator = generator(Spike::new(5), SamplingConfig::greedy());
    let outcome = generator
        .generate("", &tokens(2), &mut NoProgress, &NeverCancel)
        .unwrap();
    assert_eq!(outcome.result().context, vec![0, 5, 5]);

    let outcome = generator
        .generate_from_tokens(Vec::new(), &tokens(1), &mut NoProgress, &NeverCancel)
        .unwrap();
    assert_eq!(outcome.result().context, vec![0, 5]);
}

#[test]
fn test_zero_budget_finishes_immediately() {
    let mut generator = generator(Spike::new(5), SamplingConfig::greedy());
    let mut recorder = Recorder::default();
    let outcome = generator
        .generate("2 3", &tokens(0), &mut recorder, &NeverCancel)
        .unwrap();
    assert_eq!(outcome.result().context, vec![2]);
    assert_eq!(recorder.events.last().unwrap().phase, Phase::Finished);
    assert!(outcome.result().final_logits.is_none());
}

#[test]
fn test_candidates_reported_on_request() {
    let sampling = SamplingConfig {
        strategy: Strategy::TopK { k: 3 },
        temperature: 1.0,
        repetition_penalty: None,
    };
    let mut model = Spike::new(5);
    model.spike = 2.0;
    let mut generator = generator(model, sampling);
    let mut recorder = Recorder::default();
    let options = GenerateOptions {
        budget: Budget::Tokens(2),
        show_candidates: true,
    };
    generator
        .generate("1", &options, &mut recorder, &NeverCancel)
        .unwrap();

    let generated: Vec<&StepProgress> = recorder
        .events
        .iter()
        .filter(|e| e.phase == Phase::Generating)
        .collect();
    assert_eq!(generated.len(), 2);
    for event in generated {
        let candidates = event.candidates.as_ref().unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(!candidates.contains(&event.token_id.unwrap()));
    }
}

#[test]
fn test_repetition_penalty_applies_to_sampled_strategies() {
    // Token 5 dominates by 100; a penalty of 150 pushes it below the rest.
    let sampling = SamplingConfig {
        strategy: Strategy::TopK { k: 1 },
        temperature: 1.0,
        repetition_penalty: Some(150.0),
    };
    let mut generator = generator(Spike::new(5), sampling);
    let outcome = generator
        .generate("5", &tokens(1), &mut NoProgress, &NeverCancel)
        .unwrap();
    // Remaining logits tie at zero; the lowest id ranks first
    assert_eq!(outcome.result().context, vec![5, 0]);
}

#[test]
fn test_prompt_replay_captures_prediction_and_replays() {
    let sampling = SamplingConfig {
        strategy: Strategy::TopP { p: 0.9 },
        temperature: 1.0,
        repetition_penalty: None,
    };
    let options = GenerateOptions {
        budget: Budget::PromptReplay,
        show_candidates: false,
    };
    let mut generator = generator(Spike::new(6), sampling);
    let mut live = Recorder::default();
    let result = generator
        .generate("1 2 3 4", &options, &mut live, &NeverCancel)
        .unwrap()
        .into_result();

    assert_eq!(result.context, vec![1, 2, 3, 4, 6]);
    let table = result.final_table.as_ref().unwrap();
    assert_eq!(table[0].token_id, 6);
    assert_eq!(result.final_sampled.as_ref().unwrap().token_id, 6);
    assert_eq!(result.final_logits.as_ref().unwrap().len(), VOCAB);

    let cached = CachedRun::from_result(&result).unwrap();
    assert_eq!(cached.token_ids, vec![1, 2, 3, 4]);

    let mut buf = Vec::new();
    cached.write_to(&mut buf).unwrap();
    let cached = CachedRun::read_from(&mut buf.as_slice()).unwrap();

    let mut sampler = Sampler::new(sampling, StdRng::seed_from_u64(11)).unwrap();
    let mut replayed = Recorder::default();
    let again = replay(&cached, &mut sampler, &Digits, &options, &mut replayed).unwrap();

    assert_eq!(again.context, result.context);
    assert_eq!(again.final_table, result.final_table);

    let strip = |events: &[StepProgress]| -> Vec<(Phase, Option<TokenId>, usize, usize)> {
        events
            .iter()
            .map(|e| (e.phase, e.token_id, e.step_index, e.total_steps))
            .collect()
    };
    assert_eq!(strip(&live.events), strip(&replayed.events));
}

#[test]
fn test_independent_sessions_on_threads() {
    let flag = CancelFlag::new();
    std::thread::scope(|s| {
        let handles: Vec<_> = [2u32, 9]
            .into_iter()
            .map(|favored| {
                let flag = flag.clone();
                s.spawn(move || {
                    let mut generator = generator(Spike::new(favored), SamplingConfig::greedy());
                    generator
                        .generate("1", &tokens(3), &mut NoProgress, &flag)
                        .unwrap()
                        .into_result()
                        .context
                })
            })
            .collect();
        let contexts: Vec<Vec<TokenId>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(contexts, vec![vec![1, 2, 2, 2], vec![1, 9, 9, 9]]);
    });
}

#[test]
fn test_sampling_config_rejected_up_front() {
    let bad = SamplingConfig {
        strategy: Strategy::TopP { p: 0.0 },
        ..SamplingConfig::default()
    };
    assert!(Sampler::new(bad, StdRng::seed_from_u64(0)).is_err());
    let bad_model = ModelConfig {
        window: 0,
        ..config()
    };
    let sampler = Sampler::new(SamplingConfig::greedy(), StdRng::seed_from_u64(0)).unwrap();
    assert!(Generator::new(bad_model, Spike::new(1), Digits, sampler).is_err());
}
