//! End-to-end tests driving `GenerationLoop` through the six canonical
//! scenarios the core is expected to handle, plus the cross-module
//! invariants that only show up once block allocation, caching and
//! verification are wired together.

use std::sync::Arc;

use futures::StreamExt;

use specdec_core::block::{BlockPool, BlockShape, Device};
use specdec_core::cache::{CachedModelAdapter, PagedKvCache};
use specdec_core::config::{ControllerConfig, GenerationConfig};
use specdec_core::generation::{Event, FinalReason, GenerationLoop};
use specdec_core::model::StubModel;
use specdec_core::tokenizer::DecimalTokenizer;
use specdec_core::CoreError;

/// A stop token that can never collide with a sampled id in these tests'
/// small vocabularies, so `stop_tokens: vec![]` really means "never stop
/// on a token".
fn test_tokenizer() -> DecimalTokenizer {
    DecimalTokenizer::new(u32::MAX)
}

fn shape() -> BlockShape {
    BlockShape {
        layers: 2,
        block_size: 4,
        heads: 2,
        head_dim: 8,
    }
}

fn controller_cfg() -> ControllerConfig {
    ControllerConfig {
        smoothing: 0.3,
        target_acceptance: 0.6,
        band: 0.1,
        k_min: 1,
        k_max: 4,
        k_initial: 2,
    }
}

fn loop_with(
    num_blocks: usize,
    draft: StubModel,
    target: StubModel,
) -> GenerationLoop<StubModel, StubModel, DecimalTokenizer> {
    let draft_pool = Arc::new(BlockPool::new(num_blocks, shape(), Device::default()));
    let target_pool = Arc::new(BlockPool::new(num_blocks, shape(), Device::default()));
    let draft_cache = Arc::new(PagedKvCache::new(draft_pool));
    let target_cache = Arc::new(PagedKvCache::new(target_pool));
    GenerationLoop::new(
        CachedModelAdapter::new(draft, draft_cache),
        CachedModelAdapter::new(target, target_cache),
        test_tokenizer(),
        controller_cfg(),
    )
}

/// Trivial generation: draft and target agree, generation proceeds and
/// stops at the length cap with a high acceptance rate.
#[tokio::test]
async fn trivial_generation_hits_length_cap_with_high_acceptance() {
    let gen_loop = loop_with(
        64,
        StubModel::new(100).with_favored_token(42).with_kv_shape(2, 2, 8),
        StubModel::new(100).with_favored_token(42).with_kv_shape(2, 2, 8),
    );
    let cfg = GenerationConfig {
        max_new_tokens: 8,
        stop_tokens: vec![],
        temperature: 1.0,
        seed: Some(11),
        initial_k: 2,
        use_speculation: true,
    };

    let result = gen_loop.generate(&[1, 2, 3], cfg).await.unwrap();
    assert_eq!(result.tokens.len(), 8);
    assert_eq!(result.summary.reason, FinalReason::LengthCap);
    assert!(result.tokens.iter().all(|&t| t == 42));
    assert!(result.summary.mean_acceptance_rate > 0.9);
}

/// Immediate stop token: the very first token sampled is the stop token, so
/// the caller sees zero generated tokens and a `StopToken` reason.
#[tokio::test]
async fn immediate_stop_token_yields_no_tokens() {
    let gen_loop = loop_with(
        64,
        StubModel::new(100).with_favored_token(5).with_kv_shape(2, 2, 8),
        StubModel::new(100).with_favored_token(5).with_kv_shape(2, 2, 8),
    );
    let cfg = GenerationConfig {
        max_new_tokens: 20,
        stop_tokens: vec![5],
        temperature: 1.0,
        seed: Some(12),
        initial_k: 2,
        use_speculation: true,
    };

    let result = gen_loop.generate(&[1, 2, 3], cfg).await.unwrap();
    assert_eq!(result.summary.reason, FinalReason::StopToken);
    assert!(result.tokens.is_empty());
}

/// The length cap dominates even when a stop token is configured but never
/// sampled.
#[tokio::test]
async fn length_cap_dominates_when_stop_token_never_appears() {
    let gen_loop = loop_with(
        64,
        StubModel::new(100).with_favored_token(42).with_kv_shape(2, 2, 8),
        StubModel::new(100).with_favored_token(42).with_kv_shape(2, 2, 8),
    );
    let cfg = GenerationConfig {
        max_new_tokens: 5,
        stop_tokens: vec![999], // never favored, never sampled
        temperature: 1.0,
        seed: Some(13),
        initial_k: 2,
        use_speculation: true,
    };

    let result = gen_loop.generate(&[1, 2, 3], cfg).await.unwrap();
    assert_eq!(result.summary.reason, FinalReason::LengthCap);
    assert_eq!(result.tokens.len(), 5);
}

/// A disagreeing draft model still produces a correct, complete sequence —
/// just via more rejections/resamples. The loop must not panic or stall
/// when the draft and target never agree.
#[tokio::test]
async fn disagreeing_draft_still_completes() {
    let gen_loop = loop_with(
        64,
        StubModel::new(100).with_favored_token(1).with_kv_shape(2, 2, 8),
        StubModel::new(100).with_favored_token(99).with_kv_shape(2, 2, 8),
    );
    let cfg = GenerationConfig {
        max_new_tokens: 6,
        stop_tokens: vec![],
        temperature: 1.0,
        seed: Some(14),
        initial_k: 2,
        use_speculation: true,
    };

    let result = gen_loop.generate(&[1, 2, 3], cfg).await.unwrap();
    assert_eq!(result.tokens.len(), 6);
    assert_eq!(result.summary.reason, FinalReason::LengthCap);
    // Every rejected draft falls back to the target's favored token.
    assert!(result.tokens.iter().all(|&t| t == 99));
}

/// Allocator exhaustion: a pool sized far too small for the prompt plus
/// generated tokens surfaces as `CoreError::OutOfBlocks`, not a panic.
#[tokio::test]
async fn allocator_exhaustion_surfaces_as_out_of_blocks() {
    // block_size = 4, only 2 blocks per lane => 8 tokens of headroom total
    // across both draft and target lanes combined, forcing exhaustion well
    // before the length cap.
    let gen_loop = loop_with(
        2,
        StubModel::new(100).with_favored_token(1).with_kv_shape(2, 2, 8),
        StubModel::new(100).with_favored_token(1).with_kv_shape(2, 2, 8),
    );
    let cfg = GenerationConfig {
        max_new_tokens: 256,
        stop_tokens: vec![],
        temperature: 1.0,
        seed: Some(15),
        initial_k: 2,
        use_speculation: true,
    };

    let err = gen_loop.generate(&[1, 2, 3, 4, 5], cfg).await.unwrap_err();
    assert!(matches!(err, CoreError::OutOfBlocks(_)));
}

/// Cache round trip under repeated ingest, mirroring a 16 + 1 + 15 token
/// sequence of appends against a single lane.
#[tokio::test]
async fn cache_round_trips_across_repeated_ingests() {
    let pool = Arc::new(BlockPool::new(
        16,
        BlockShape {
            layers: 1,
            block_size: 16,
            heads: 1,
            head_dim: 4,
        },
        Device::default(),
    ));
    let cache = PagedKvCache::new(pool);
    let lane = cache.open_lane().unwrap();
    let adapter = CachedModelAdapter::new(
        StubModel::new(50).with_kv_shape(1, 1, 4),
        Arc::new(cache),
    );

    let first: Vec<u32> = (0..16).collect();
    adapter.forward(lane, &first).await.unwrap();
    assert_eq!(adapter.cache().lane_len(lane), 16);

    adapter.forward(lane, &[16]).await.unwrap();
    assert_eq!(adapter.cache().lane_len(lane), 17);

    let more: Vec<u32> = (17..32).collect();
    adapter.forward(lane, &more).await.unwrap();
    assert_eq!(adapter.cache().lane_len(lane), 32);

    adapter.cache().close_lane(lane);
}

/// Streaming and blocking generation must agree on total token count and
/// stop reason for the same seed and config.
#[tokio::test]
async fn streaming_and_blocking_agree_on_outcome() {
    let gen_loop = loop_with(
        64,
        StubModel::new(100).with_favored_token(7).with_kv_shape(2, 2, 8),
        StubModel::new(100).with_favored_token(7).with_kv_shape(2, 2, 8),
    );
    let cfg = GenerationConfig {
        max_new_tokens: 4,
        stop_tokens: vec![],
        temperature: 1.0,
        seed: Some(16),
        initial_k: 2,
        use_speculation: true,
    };

    let blocking = gen_loop.generate(&[1, 2, 3], cfg.clone()).await.unwrap();

    let mut stream = gen_loop.generate_streaming(vec![1, 2, 3], cfg);
    let mut streamed_tokens = Vec::new();
    let mut final_reason = None;
    while let Some(event) = stream.next().await {
        match event {
            Event::Token { token_id, .. } => streamed_tokens.push(token_id),
            Event::StepSummary { .. } => {}
            Event::Final(summary) => final_reason = Some(summary.reason),
        }
    }

    assert_eq!(streamed_tokens, blocking.tokens);
    assert_eq!(final_reason, Some(blocking.summary.reason));
}

/// Lane isolation: two concurrent requests against the same loop must not
/// see each other's tokens, even though their lanes share one pool.
#[tokio::test]
async fn concurrent_requests_do_not_cross_contaminate_lanes() {
    let gen_loop = loop_with(
        128,
        StubModel::new(100).with_favored_token(1).with_kv_shape(2, 2, 8),
        StubModel::new(100).with_favored_token(1).with_kv_shape(2, 2, 8),
    );
    let cfg_a = GenerationConfig {
        max_new_tokens: 4,
        stop_tokens: vec![],
        temperature: 1.0,
        seed: Some(1),
        initial_k: 2,
        use_speculation: true,
    };
    let cfg_b = GenerationConfig {
        max_new_tokens: 4,
        stop_tokens: vec![],
        temperature: 1.0,
        seed: Some(2),
        initial_k: 2,
        use_speculation: true,
    };

    let (a, b) = tokio::join!(
        gen_loop.generate(&[1, 2], cfg_a),
        gen_loop.generate(&[3, 4], cfg_b)
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.tokens.len(), 4);
    assert_eq!(b.tokens.len(), 4);
}

/// Rejects invalid requests before acquiring any lane.
#[tokio::test]
async fn invalid_temperature_is_rejected_before_any_lane_opens() {
    let gen_loop = loop_with(
        16,
        StubModel::new(50).with_kv_shape(1, 1, 4),
        StubModel::new(50).with_kv_shape(1, 1, 4),
    );
    let cfg = GenerationConfig {
        max_new_tokens: 5,
        stop_tokens: vec![],
        temperature: f32::NAN,
        seed: None,
        initial_k: 2,
        use_speculation: true,
    };

    let err = gen_loop.generate(&[1], cfg).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidConfig(_)));
}

/// spec.md §3 places no upper bound on temperature — only non-finite or
/// negative values are `InvalidConfig`; a large-but-finite value must be
/// accepted and run to completion.
#[tokio::test]
async fn large_finite_temperature_is_accepted() {
    let gen_loop = loop_with(
        64,
        StubModel::new(100).with_favored_token(9).with_kv_shape(2, 2, 8),
        StubModel::new(100).with_favored_token(9).with_kv_shape(2, 2, 8),
    );
    let cfg = GenerationConfig {
        max_new_tokens: 3,
        stop_tokens: vec![],
        temperature: 5.0,
        seed: Some(21),
        initial_k: 2,
        use_speculation: true,
    };

    let result = gen_loop.generate(&[1, 2, 3], cfg).await.unwrap();
    assert_eq!(result.tokens.len(), 3);
}
