//! Generation Loop (C6): drives one request from prompt to completion,
//! alternating draft and target forward calls, verifying each round
//! against the target distribution, and feeding the adaptive controller.
//!
//! A request moves through INIT -> OPENING_LANES -> STEP (repeated) ->
//! CLOSING_LANES -> DONE. Lane cleanup happens on every exit from STEP —
//! success, a stop token, a model failure, or the caller dropping the
//! stream — via [`LaneGuard`]'s `Drop`, not a single success-path release.

pub mod stream;

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::adapter::CachedModelAdapter;
use crate::cache::paged_cache::{LaneId, PagedKvCache};
use crate::config::{ControllerConfig, GenerationConfig};
use crate::controller::AdaptiveController;
use crate::error::CoreError;
use crate::model::LanguageModel;
use crate::speculative::{self, StepVerification};
use crate::tokenizer::Tokenizer;

pub use stream::{Event, FinalReason, FinalSummary, GenerationStream};

/// Releases a cache lane when dropped, regardless of how the enclosing
/// scope is exited.
struct LaneGuard {
    cache: Arc<PagedKvCache>,
    lane: LaneId,
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        self.cache.close_lane(self.lane);
    }
}

/// Result of a non-streaming [`GenerationLoop::generate`] call.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub tokens: Vec<u32>,
    pub summary: FinalSummary,
}

/// Orchestrates one pair of (draft, target) adapters plus a tokenizer
/// through speculative decoding requests. Cheap to clone — every field is
/// an `Arc` or a small config struct — so a streaming request can clone
/// what it needs into a spawned task.
#[derive(Clone)]
pub struct GenerationLoop<D, T, Tok> {
    draft: Arc<CachedModelAdapter<D>>,
    target: Arc<CachedModelAdapter<T>>,
    tokenizer: Arc<Tok>,
    controller_cfg: ControllerConfig,
}

impl<D, T, Tok> GenerationLoop<D, T, Tok>
where
    D: LanguageModel + 'static,
    T: LanguageModel + 'static,
    Tok: Tokenizer + 'static,
{
    pub fn new(
        draft: CachedModelAdapter<D>,
        target: CachedModelAdapter<T>,
        tokenizer: Tok,
        controller_cfg: ControllerConfig,
    ) -> Self {
        Self {
            draft: Arc::new(draft),
            target: Arc::new(target),
            tokenizer: Arc::new(tokenizer),
            controller_cfg,
        }
    }

    /// Run a request to completion and collect every token it produces.
    pub async fn generate(
        &self,
        prompt: &[u32],
        cfg: GenerationConfig,
    ) -> Result<GenerationResult, CoreError> {
        validate_request(prompt, &cfg)?;
        let request_id = Uuid::new_v4();

        let draft_lane = self.draft.cache().open_lane()?;
        let _draft_guard = LaneGuard {
            cache: Arc::clone(self.draft.cache()),
            lane: draft_lane,
        };
        let target_lane = self.target.cache().open_lane()?;
        let _target_guard = LaneGuard {
            cache: Arc::clone(self.target.cache()),
            lane: target_lane,
        };

        let mut tokens = Vec::new();
        let summary = drive_request(
            request_id,
            &self.draft,
            &self.target,
            &*self.tokenizer,
            draft_lane,
            target_lane,
            prompt,
            &cfg,
            &self.controller_cfg,
            |event| {
                if let Event::Token { token_id, .. } = &event {
                    tokens.push(*token_id);
                }
            },
        )
        .await?;

        Ok(GenerationResult { tokens, summary })
    }

    /// Run a request, streaming each [`Event`] as it happens.
    pub fn generate_streaming(&self, prompt: Vec<u32>, cfg: GenerationConfig) -> GenerationStream {
        let draft = Arc::clone(&self.draft);
        let target = Arc::clone(&self.target);
        let tokenizer = Arc::clone(&self.tokenizer);
        let controller_cfg = self.controller_cfg.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let request_id = Uuid::new_v4();

        tokio::spawn(async move {
            let result = (|| async {
                validate_request(&prompt, &cfg)?;
                let draft_lane = draft.cache().open_lane()?;
                let _draft_guard = LaneGuard {
                    cache: Arc::clone(draft.cache()),
                    lane: draft_lane,
                };
                let target_lane = target.cache().open_lane()?;
                let _target_guard = LaneGuard {
                    cache: Arc::clone(target.cache()),
                    lane: target_lane,
                };

                drive_request(
                    request_id,
                    &draft,
                    &target,
                    &*tokenizer,
                    draft_lane,
                    target_lane,
                    &prompt,
                    &cfg,
                    &controller_cfg,
                    |event| {
                        // Receiver dropped: nothing left to do but keep
                        // driving to completion so lanes still close.
                        let _ = tx.send(event);
                    },
                )
                .await
            })()
            .await;

            if let Err(err) = result {
                let _ = tx.send(Event::Final(FinalSummary {
                    reason: FinalReason::Failed(err),
                    num_generated: 0,
                    wall_time_seconds: 0.0,
                    time_to_first_token_seconds: 0.0,
                    mean_acceptance_rate: 0.0,
                    depth_history: Vec::new(),
                }));
            }
        });

        GenerationStream::new(rx)
    }
}

fn validate_request(prompt: &[u32], cfg: &GenerationConfig) -> Result<(), CoreError> {
    if prompt.is_empty() {
        return Err(CoreError::InvalidConfig("prompt must not be empty".into()));
    }
    if cfg.max_new_tokens == 0 {
        return Err(CoreError::InvalidConfig("max_new_tokens must be > 0".into()));
    }
    if cfg.temperature < 0.0 || !cfg.temperature.is_finite() {
        return Err(CoreError::InvalidConfig(format!(
            "temperature must be finite and >= 0, got {}",
            cfg.temperature
        )));
    }
    Ok(())
}

/// Maps each verification position (`0..=k`, where `k` is the bonus
/// position) to the target's softmaxed distribution at that position, or
/// `None` if the target's forward call didn't score enough positions to
/// cover it (§4.6: the target may return `T' <= T` rows when it recognizes
/// a cached prefix internally).
fn resolve_target_probs(
    target_rows: &[Vec<f32>],
    temperature: f32,
    p_target: usize,
    k: usize,
) -> Vec<Option<Vec<f32>>> {
    let t_total = p_target + k;
    let t_prime = target_rows.len();
    let logits_start = t_total.saturating_sub(t_prime);
    (0..=k)
        .map(|idx| {
            let needed = (p_target as isize - 1 + idx as isize) - logits_start as isize;
            if needed >= 0 && (needed as usize) < t_prime {
                Some(speculative::softmax(&target_rows[needed as usize], temperature))
            } else {
                None
            }
        })
        .collect()
}

/// Core driver shared by [`GenerationLoop::generate`] and
/// [`GenerationLoop::generate_streaming`]: runs speculative rounds until a
/// stop token, the length cap, or an error ends the request, calling
/// `on_event` for every [`Event`] along the way (including the terminal
/// `Final`).
async fn drive_request<D: LanguageModel, T: LanguageModel, Tok: Tokenizer>(
    request_id: Uuid,
    draft: &CachedModelAdapter<D>,
    target: &CachedModelAdapter<T>,
    tokenizer: &Tok,
    draft_lane: LaneId,
    target_lane: LaneId,
    prompt: &[u32],
    cfg: &GenerationConfig,
    controller_cfg: &ControllerConfig,
    mut on_event: impl FnMut(Event),
) -> Result<FinalSummary, CoreError> {
    info!(%request_id, prompt_tokens = prompt.len(), max_new_tokens = cfg.max_new_tokens, "starting generation");
    let request_start = Instant::now();
    let mut rng = match cfg.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut controller = AdaptiveController::new(controller_cfg);
    controller.set_k(cfg.initial_k);
    let stop_tokens: Vec<u32> = if cfg.stop_tokens.is_empty() {
        vec![tokenizer.stop_token()]
    } else {
        cfg.stop_tokens.clone()
    };
    // Tokens already *decided* but not yet ingested into each lane's cache.
    // These two diverge after a fully-accepted round: the target lane fed
    // the draft's last token as real verification input and so already has
    // its KV, but the draft model never re-feeds its own last proposal, so
    // it still needs to catch up on it next round alongside the bonus
    // token. See `DESIGN.md` for the derivation.
    let mut pending_draft: Vec<u32> = prompt.to_vec();
    let mut pending_target: Vec<u32> = prompt.to_vec();
    let mut confirmed_draft: usize = 0;
    let mut confirmed_target: usize = 0;
    let mut generated: Vec<u32> = Vec::new();
    let mut acceptance_rates: Vec<f64> = Vec::new();
    let mut depth_history: Vec<usize> = Vec::new();
    let mut ttft: Option<Duration> = None;
    let mut step_index = 0usize;
    let mut token_index = 0usize;

    let reason = loop {
        // `use_speculation = false` forces k = 0 for the whole request: the
        // draft phase below never runs, and the verification protocol
        // degenerates to sampling one bonus token per step directly from
        // the target's own distribution (spec.md §4.6 step 4, vacuously
        // true when there are no draft tokens to accept).
        let k = if cfg.use_speculation { controller.k() } else { 0 };
        depth_history.push(k);
        let p_draft = pending_draft.len();
        let p_target = pending_target.len();

        let mut draft_tokens: Vec<u32> = Vec::new();
        let mut draft_probs: Vec<Vec<f32>> = Vec::new();

        if k > 0 {
            // Draft phase: prime the draft model on `pending_draft`, then
            // draft k tokens autoregressively, one forward call per token.
            let first_row = draft
                .forward(draft_lane, &pending_draft)
                .await?
                .pop()
                .expect("forward over a nonempty input returns at least one row");

            draft_tokens.reserve(k);
            draft_probs.reserve(k);
            let mut row = first_row;
            for _ in 0..k {
                let probs = speculative::softmax(&row, cfg.temperature);
                let token = speculative::sample_categorical(&probs, &mut rng);
                draft_tokens.push(token);
                draft_probs.push(probs);

                if draft_tokens.len() < k {
                    row = draft
                        .forward(draft_lane, &[token])
                        .await?
                        .pop()
                        .expect("forward over a nonempty input returns at least one row");
                }
            }
        }

        // Target phase: verify the whole draft prefix in one pass, also
        // catching the target cache up on `pending_target`.
        let mut new_tokens = pending_target.clone();
        new_tokens.extend_from_slice(&draft_tokens);
        let target_rows = target.forward(target_lane, &new_tokens).await?;

        // The target may have scored fewer positions than it was given
        // (T' <= T) if it recognized a cached prefix internally. Rows this
        // round can't read are filled in via the defensive fallback: the
        // corresponding draft token is accepted unconditionally.
        let resolved = resolve_target_probs(&target_rows, cfg.temperature, p_target, k);
        let mut verify_start = 0;
        while verify_start < k && resolved[verify_start].is_none() {
            verify_start += 1;
        }
        if verify_start > 0 {
            warn!(
                %request_id,
                positions = verify_start,
                "target logits missing for leading draft positions; accepting unconditionally"
            );
        }

        let target_probs: Vec<Vec<f32>> = match resolved[verify_start..].iter().cloned().collect() {
            Some(probs) => probs,
            None => {
                warn!(%request_id, "target logits missing for the bonus position; reusing the last verified distribution");
                let mut probs: Vec<Vec<f32>> = resolved[verify_start..k]
                    .iter()
                    .cloned()
                    .map(|p| p.expect("verified range has every row by construction"))
                    .collect();
                let fallback = probs
                    .last()
                    .cloned()
                    .unwrap_or_else(|| draft_probs.get(verify_start).unwrap_or(&draft_probs[k - 1]).clone());
                probs.push(fallback);
                probs
            }
        };

        let StepVerification {
            tokens: verified_tokens,
            num_accepted: num_verified_accepted,
            rejected,
        } = speculative::verify_step(
            &draft_tokens[verify_start..],
            &draft_probs[verify_start..],
            &target_probs,
            &mut rng,
        );

        let step_tokens: Vec<u32> = draft_tokens[..verify_start]
            .iter()
            .copied()
            .chain(verified_tokens)
            .collect();
        let num_accepted = verify_start + num_verified_accepted;

        let vocab_size = target.vocab_size() as u32;
        if let Some(&bad) = step_tokens.iter().find(|&&t| t >= vocab_size) {
            return Err(CoreError::TokenOutOfRange {
                token: bad,
                vocab_size,
            });
        }

        // The target lane only ever misses the final decided token of this
        // round (it saw every accepted draft token as real input). The
        // draft lane additionally misses its own last proposal whenever
        // that proposal was accepted into the kept sequence (`k-1` is as
        // far as the draft ever feeds itself in one round).
        //
        // A model that never reports KV (§4.4's no-cache degrade) leaves
        // its lane at `lane_len == 0` forever, since `CachedModelAdapter`
        // never calls `ingest` for it. `confirmed_*`/`truncate` must track
        // that instead of assuming every forward call grew the cache, or
        // `truncate` would be asked to keep more tokens than the lane
        // actually holds.
        if target.cache().lane_len(target_lane) > 0 {
            confirmed_target += p_target + num_accepted;
            target.cache().truncate(target_lane, confirmed_target);
        }

        let last_token = *step_tokens.last().expect("a step always produces at least one token");
        pending_target = vec![last_token];

        if k > 0 {
            if draft.cache().lane_len(draft_lane) > 0 {
                confirmed_draft += p_draft + num_accepted.min(k.saturating_sub(1));
                draft.cache().truncate(draft_lane, confirmed_draft);
            }
            pending_draft = if rejected {
                vec![last_token]
            } else {
                vec![draft_tokens[k - 1], last_token]
            };
        } else {
            // The draft model was never invoked this round, so its cache
            // and backlog are untouched; queue the decided token for
            // whenever drafting resumes.
            pending_draft.push(last_token);
        }

        let acceptance_rate = if k > 0 { num_accepted as f64 / k as f64 } else { 0.0 };
        acceptance_rates.push(acceptance_rate);
        controller.record_step(acceptance_rate);

        let mut stop_reason = None;
        for &token in &step_tokens {
            if stop_tokens.contains(&token) {
                stop_reason = Some(FinalReason::StopToken);
                break;
            }
            generated.push(token);
            if ttft.is_none() {
                ttft = Some(request_start.elapsed());
            }
            on_event(Event::Token {
                text: tokenizer.decode(std::slice::from_ref(&token)),
                token_id: token,
                index: token_index,
                acceptance_rate_at_emit: acceptance_rate,
                elapsed_since_start: request_start.elapsed(),
            });
            token_index += 1;
            if generated.len() >= cfg.max_new_tokens {
                stop_reason = Some(FinalReason::LengthCap);
                break;
            }
        }

        on_event(Event::StepSummary {
            step_index,
            speculation_depth: k,
            num_accepted,
            acceptance_rate,
        });

        step_index += 1;

        if let Some(reason) = stop_reason {
            break reason;
        }
    };

    let mean_acceptance_rate = if acceptance_rates.is_empty() {
        0.0
    } else {
        acceptance_rates.iter().sum::<f64>() / acceptance_rates.len() as f64
    };

    let summary = FinalSummary {
        reason,
        num_generated: generated.len(),
        wall_time_seconds: request_start.elapsed().as_secs_f64(),
        time_to_first_token_seconds: ttft.unwrap_or_default().as_secs_f64(),
        mean_acceptance_rate,
        depth_history,
    };

    info!(
        %request_id,
        num_generated = summary.num_generated,
        mean_acceptance_rate = summary.mean_acceptance_rate,
        reason = ?summary.reason,
        "generation finished"
    );

    on_event(Event::Final(summary.clone()));
    Ok(summary)
}
