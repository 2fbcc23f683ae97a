//! Speculative Step (C5): the rejection-sampling core that decides which
//! draft tokens survive verification against the target model.
//!
//! This module is deliberately model- and cache-agnostic — it consumes
//! already-computed probability distributions and returns a decision. That
//! keeps the identity that makes speculative decoding sound (the accepted
//! sequence is distributed exactly as if it had been sampled token-by-token
//! from the target model alone) testable in isolation from any model or
//! cache plumbing. See `original_source/src/speculative.py`'s
//! `compute_acceptance_probability` and the surrounding accept/reject loop,
//! which this reproduces exactly (Leviathan et al., 2022).

use rand::Rng;

/// Softmax over `logits / temperature`. `temperature <= 0` is treated as
/// greedy: all mass on the argmax.
pub fn softmax(logits: &[f32], temperature: f32) -> Vec<f32> {
    if temperature <= 0.0 {
        let mut probs = vec![0.0_f32; logits.len()];
        if let Some((argmax, _)) = logits
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
        {
            probs[argmax] = 1.0;
        }
        return probs;
    }

    let scaled: Vec<f32> = logits.iter().map(|&l| l / temperature).collect();
    let max = scaled.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scaled.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}

/// Sample a token id from a categorical distribution over `[0, probs.len())`.
pub fn sample_categorical(probs: &[f32], rng: &mut impl Rng) -> u32 {
    let draw: f32 = rng.gen_range(0.0..1.0);
    let mut cumulative = 0.0_f32;
    for (idx, &p) in probs.iter().enumerate() {
        cumulative += p;
        if draw < cumulative {
            return idx as u32;
        }
    }
    // Floating-point round-off: fall back to the last nonzero-mass index.
    (probs.len().saturating_sub(1)) as u32
}

/// `accept with probability min(1, p(x)/q(x))`, per the speculative
/// sampling identity.
pub fn acceptance_probability(target_probs: &[f32], draft_probs: &[f32], token: u32) -> f64 {
    let p = target_probs[token as usize] as f64;
    let q = draft_probs[token as usize] as f64;
    if q == 0.0 {
        return 0.0;
    }
    (p / q).min(1.0)
}

/// Resample from the residual distribution `max(0, p(x) - q(x))`,
/// renormalized. Used exactly once per step, only on rejection.
pub fn residual_resample(target_probs: &[f32], draft_probs: &[f32], rng: &mut impl Rng) -> u32 {
    let mut residual: Vec<f32> = target_probs
        .iter()
        .zip(draft_probs)
        .map(|(&p, &q)| (p - q).max(0.0))
        .collect();
    let sum: f32 = residual.iter().sum();
    if sum <= 0.0 {
        // p == q everywhere (or numerically so): fall back to the target
        // distribution itself, which keeps the identity exact in the
        // degenerate draft==target configuration.
        return sample_categorical(target_probs, rng);
    }
    for r in residual.iter_mut() {
        *r /= sum;
    }
    sample_categorical(&residual, rng)
}

/// Outcome of verifying one round of `K` draft tokens.
#[derive(Debug, Clone)]
pub struct StepVerification {
    /// Tokens this step contributes to the generated sequence, in order:
    /// the accepted draft prefix followed by exactly one more token (a
    /// resample on rejection, or a bonus token when the whole prefix is
    /// accepted).
    pub tokens: Vec<u32>,
    /// How many leading draft tokens were accepted, `0..=K`.
    pub num_accepted: usize,
    /// `true` when a draft token was rejected (the last element of
    /// `tokens` is a residual resample); `false` when the whole draft
    /// prefix was accepted (the last element is a target-sampled bonus).
    pub rejected: bool,
}

/// Verify `draft_tokens` (length `K`) against the target model's
/// predictions.
///
/// `target_probs[i]` must be the target distribution used to verify
/// `draft_tokens[i]` (its prediction for the position immediately after
/// it), for `i` in `0..K`. `target_probs[K-1]` doubles as nothing else —
/// the bonus distribution (the target's prediction for the position after
/// the *last* draft token) is `target_probs[K]`, so callers pass `K+1`
/// rows total; this function reads index `K` only when every draft token
/// is accepted.
pub fn verify_step(
    draft_tokens: &[u32],
    draft_probs: &[Vec<f32>],
    target_probs: &[Vec<f32>],
    rng: &mut impl Rng,
) -> StepVerification {
    let k = draft_tokens.len();
    debug_assert_eq!(draft_probs.len(), k);
    debug_assert_eq!(target_probs.len(), k + 1);

    let mut tokens = Vec::with_capacity(k + 1);
    let mut num_accepted = 0;

    for i in 0..k {
        let accept_prob = acceptance_probability(&target_probs[i], &draft_probs[i], draft_tokens[i]);
        if rng.gen_range(0.0..1.0) < accept_prob {
            tokens.push(draft_tokens[i]);
            num_accepted += 1;
        } else {
            let resampled = residual_resample(&target_probs[i], &draft_probs[i], rng);
            tokens.push(resampled);
            return StepVerification {
                tokens,
                num_accepted,
                rejected: true,
            };
        }
    }

    let bonus = sample_categorical(&target_probs[k], rng);
    tokens.push(bonus);
    StepVerification {
        tokens,
        num_accepted,
        rejected: false,
    }
}
