//! Monte Carlo checks of the speculative-sampling identity (§8): for any
//! draft/target distribution pair and any `K`, a token produced by
//! [`specdec_core::verify_step`] is distributed exactly as the target model
//! alone would have sampled it. These are statistical tests, not exact
//! assertions — they sample many trials and bound the total-variation
//! distance between the empirical and target distributions.

use rand::rngs::StdRng;
use rand::SeedableRng;

use specdec_core::speculative::{sample_categorical, softmax, verify_step};

const TRIALS: usize = 150_000;
const TV_TOLERANCE: f64 = 0.01;

fn total_variation_distance(empirical_counts: &[u64], target_probs: &[f32], trials: usize) -> f64 {
    let mut tv = 0.0_f64;
    for (&count, &p) in empirical_counts.iter().zip(target_probs) {
        let empirical = count as f64 / trials as f64;
        tv += (empirical - p as f64).abs();
    }
    tv / 2.0
}

/// Run `TRIALS` independent rounds of speculative verification with a fixed
/// `(q, p)` pair reused at every draft position, and return the empirical
/// histogram of the token that ends up at logical position 0 (the first
/// token this round contributes): the accepted draft token when position 0
/// survives verification, or the residual resample when it doesn't.
fn first_position_histogram(
    draft_probs_row: &[f32],
    target_probs_row: &[f32],
    k: usize,
    seed: u64,
) -> Vec<u64> {
    let vocab = target_probs_row.len();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut counts = vec![0u64; vocab];

    let draft_probs: Vec<Vec<f32>> = std::iter::repeat(draft_probs_row.to_vec()).take(k).collect();
    let target_probs: Vec<Vec<f32>> =
        std::iter::repeat(target_probs_row.to_vec()).take(k + 1).collect();

    for _ in 0..TRIALS {
        let draft_tokens: Vec<u32> = (0..k)
            .map(|_| sample_categorical(draft_probs_row, &mut rng))
            .collect();
        let outcome = verify_step(&draft_tokens, &draft_probs, &target_probs, &mut rng);
        counts[outcome.tokens[0] as usize] += 1;
    }

    counts
}

#[test]
fn position_zero_matches_target_distribution_across_k_and_temperature() {
    // Two deliberately mismatched logit vectors over a small vocabulary, so
    // acceptance is neither always 1 nor always 0.
    let target_logits = [2.0_f32, 0.5, 1.5, -1.0, 0.2];
    let draft_logits = [0.3_f32, 1.8, 0.1, 0.4, -0.5];

    for &temperature in &[0.7_f32, 1.0, 1.5] {
        let target_probs = softmax(&target_logits, temperature);
        let draft_probs = softmax(&draft_logits, temperature);

        for k in 1..=8usize {
            let counts = first_position_histogram(&draft_probs, &target_probs, k, 1000 + k as u64);
            let tv = total_variation_distance(&counts, &target_probs, TRIALS);
            assert!(
                tv < TV_TOLERANCE,
                "k={k} temperature={temperature}: TV distance {tv} exceeds tolerance"
            );
        }
    }
}

#[test]
fn greedy_temperature_always_reproduces_targets_argmax() {
    // theta = 0: softmax collapses to one-hot, so the accepted/resampled
    // token at every position is deterministically the target's argmax,
    // regardless of what the draft proposed.
    let target_logits = [1.0_f32, 4.0, 0.5, -2.0];
    let draft_logits = [9.0_f32, 0.0, 0.0, 0.0]; // draft strongly disagrees
    let target_probs = softmax(&target_logits, 0.0);
    let draft_probs = softmax(&draft_logits, 0.0);
    let (argmax_target, _) = target_probs
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
        .unwrap();

    let mut rng = StdRng::seed_from_u64(99);
    for k in 1..=4usize {
        let draft_tokens: Vec<u32> = (0..k)
            .map(|_| sample_categorical(&draft_probs, &mut rng))
            .collect();
        let draft_rows: Vec<Vec<f32>> = std::iter::repeat(draft_probs.clone()).take(k).collect();
        let target_rows: Vec<Vec<f32>> =
            std::iter::repeat(target_probs.clone()).take(k + 1).collect();
        let outcome = verify_step(&draft_tokens, &draft_rows, &target_rows, &mut rng);
        assert_eq!(outcome.tokens[0] as usize, argmax_target);
    }
}

/// When draft and target distributions coincide, the empirical acceptance
/// rate over many independent draws converges to 1 (§8 "Acceptance
/// identity").
#[test]
fn acceptance_rate_converges_to_one_when_draft_matches_target() {
    let logits = [1.0_f32, 3.0, -0.5, 2.0, 0.0];
    let probs = softmax(&logits, 1.0);
    let k = 6usize;
    let mut rng = StdRng::seed_from_u64(7);

    let mut total_accepted = 0u64;
    let mut total_proposed = 0u64;
    for _ in 0..20_000 {
        let draft_tokens: Vec<u32> = (0..k).map(|_| sample_categorical(&probs, &mut rng)).collect();
        let draft_rows: Vec<Vec<f32>> = std::iter::repeat(probs.clone()).take(k).collect();
        let target_rows: Vec<Vec<f32>> = std::iter::repeat(probs.clone()).take(k + 1).collect();
        let outcome = verify_step(&draft_tokens, &draft_rows, &target_rows, &mut rng);
        total_accepted += outcome.num_accepted as u64;
        total_proposed += k as u64;
    }

    let acceptance_rate = total_accepted as f64 / total_proposed as f64;
    assert!(
        acceptance_rate > 0.99,
        "acceptance rate {acceptance_rate} should converge to 1 when draft == target"
    );
}
