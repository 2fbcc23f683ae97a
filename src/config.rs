//! Process- and pool-scoped configuration for the speculative decoding core.
//!
//! Per-request knobs (`GenerationConfig`) are constructed by the caller for
//! each call and are not part of this file's `Config::load` surface — they
//! are request-scoped, not process-scoped (see `SPEC_FULL.md`).

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level configuration: everything needed to stand up a `BlockPool`
/// plus the adaptive controller's defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub allocator: AllocatorConfig,
    pub model_shape: ModelShapeConfig,
    pub controller: ControllerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allocator: AllocatorConfig::default(),
            model_shape: ModelShapeConfig::default(),
            controller: ControllerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when
    /// the file is absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            Ok(Config::default())
        }
    }

    /// Validate cross-field invariants that `serde` alone can't express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.allocator.block_size.is_power_of_two() {
            anyhow::bail!(
                "allocator.block_size ({}) must be a power of two",
                self.allocator.block_size
            );
        }
        if self.allocator.num_blocks == 0 {
            anyhow::bail!("allocator.num_blocks must be greater than zero");
        }
        if self.controller.k_min == 0 || self.controller.k_min > self.controller.k_max {
            anyhow::bail!(
                "controller.k_min ({}) must be nonzero and <= k_max ({})",
                self.controller.k_min,
                self.controller.k_max
            );
        }
        if !(0.0..=1.0).contains(&self.controller.target_acceptance) {
            anyhow::bail!("controller.target_acceptance must be in [0, 1]");
        }
        Ok(())
    }
}

/// Sizing for the [`crate::block::pool::BlockPool`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Total number of fixed-size blocks in the pool, `N`.
    pub num_blocks: usize,
    /// Tokens per block, `B`. Must be a power of two.
    pub block_size: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            num_blocks: 1024,
            block_size: 16,
        }
    }
}

/// Shape of the target model's KV tensors, needed to size block storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelShapeConfig {
    /// Transformer layers, `L`.
    pub num_layers: usize,
    /// Attention (KV) heads, `H`.
    pub num_heads: usize,
    /// Head dimension, `D`.
    pub head_dim: usize,
    /// Vocabulary size, used to bounds-check sampled token ids.
    pub vocab_size: usize,
}

impl Default for ModelShapeConfig {
    fn default() -> Self {
        Self {
            num_layers: 32,
            num_heads: 32,
            head_dim: 64,
            vocab_size: 32_000,
        }
    }
}

/// Defaults for the adaptive speculation-depth controller (C7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Smoothing factor for the exponential moving average of acceptance
    /// rate, `alpha` in `ema = alpha * sample + (1 - alpha) * ema`.
    pub smoothing: f64,
    /// Target acceptance rate, `tau`.
    pub target_acceptance: f64,
    /// Half-width of the acceptable band around `tau`, `delta`.
    pub band: f64,
    /// Minimum speculation depth, `K_min`.
    pub k_min: usize,
    /// Maximum speculation depth, `K_max`.
    pub k_max: usize,
    /// Speculation depth a new request starts at.
    pub k_initial: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            smoothing: 0.3,
            target_acceptance: 0.6,
            band: 0.1,
            k_min: 1,
            k_max: 8,
            k_initial: 4,
        }
    }
}

/// Per-request knobs, supplied by the caller for each generation call —
/// not loaded from `Config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Hard cap on generated tokens, independent of stop tokens.
    pub max_new_tokens: usize,
    /// Token ids that terminate generation when sampled from the target
    /// distribution (the stop token itself is not emitted).
    pub stop_tokens: Vec<u32>,
    /// Sampling temperature applied to both draft and target logits.
    pub temperature: f32,
    /// Optional RNG seed for reproducible sampling in tests.
    pub seed: Option<u64>,
    /// Speculation depth this request starts the adaptive controller at,
    /// clamped to the process-wide `[k_min, k_max]` bounds — overrides
    /// `ControllerConfig::k_initial` for this request only, so concurrent
    /// requests can start at different depths.
    pub initial_k: usize,
    /// When `false`, every step runs with speculation depth 0: the draft
    /// model is never called, and the target produces one token per step
    /// via the same rejection-sampling machinery degenerating to plain
    /// sampling (see `generation::drive_request`).
    pub use_speculation: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            stop_tokens: Vec::new(),
            temperature: 1.0,
            seed: None,
            initial_k: 4,
            use_speculation: true,
        }
    }
}
