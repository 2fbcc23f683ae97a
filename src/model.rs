//! `LanguageModel` (§4.5): the trait both the draft and target models
//! implement, plus a deterministic test double.
//!
//! A forward call suspends on the accelerator, so the trait is `async`
//! (via `async-trait`, following the teacher's `llama_ffi` stub pattern
//! generalized from a synchronous FFI call to an awaitable one).

use async_trait::async_trait;

use crate::block::pool::Elem;

/// One forward pass's output: logits for the scored input positions, plus
/// the new KV material produced for every input position (when the model
/// supports incremental caching).
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Row-major `(T', vocab_size)` logits, `T' <= T` where `T` is the
    /// number of input tokens. A model may score fewer positions than it
    /// was given (typically when it internally recognizes a cached
    /// prefix); row `i` always predicts the token immediately after input
    /// position `T - T' + i`. Callers that need a row the model didn't
    /// return fall back to treating that position as unconditionally
    /// accepted, per the speculative verification protocol.
    pub logits: Vec<Vec<f32>>,
    /// New KV material for each input position, one entry per position,
    /// each shaped `(num_layers, num_heads, head_dim)` for K and V. `None`
    /// when the model does not expose incremental KV (forces the adapter's
    /// no-cache degrade path, §4.4). Always `T` entries regardless of `T'`:
    /// caching is independent of whether a logit row was computed.
    pub new_kv: Option<Vec<KvSlice>>,
}

/// One token's freshly produced K and V material, flattened across layers
/// and heads: `num_layers * num_heads * head_dim` elements each.
#[derive(Debug, Clone)]
pub struct KvSlice {
    pub k: Vec<Elem>,
    pub v: Vec<Elem>,
}

/// Previously cached KV material supplied back to the model so it can
/// attend over tokens it did not just see.
#[derive(Debug, Clone)]
pub struct PastKv<'a> {
    /// One entry per past position, each a view into the paged cache.
    pub slices: Vec<PastKvView<'a>>,
}

#[derive(Debug, Clone, Copy)]
pub struct PastKvView<'a> {
    pub k: &'a [Elem],
    pub v: &'a [Elem],
}

/// A model that can be driven incrementally: given new input tokens and
/// (optionally) previously cached KV material, produce next-token logits
/// and the KV this call newly produced.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Vocabulary size; used to bounds-check any token id this model
    /// produces or accepts.
    fn vocab_size(&self) -> usize;

    /// Run one forward pass over `input_tokens`, attending over `past`
    /// (if any) plus the tokens in this call, in order.
    async fn forward(
        &self,
        input_tokens: &[u32],
        past: Option<PastKv<'_>>,
    ) -> Result<ForwardOutput, String>;
}

/// Deterministic test double: logits are a fixed peak at `favored_token`
/// (or derived from the last input token when `favored_token` is `None`),
/// with uniform mass elsewhere. Never fails, never reports new KV unless
/// `emit_kv` is set — exercising both the cached and no-cache adapter
/// paths from the same type.
pub struct StubModel {
    vocab_size: usize,
    favored_token: Option<u32>,
    favored_logit: f32,
    emit_kv: bool,
    kv_shape: (usize, usize, usize), // (num_layers, num_heads, head_dim)
    max_logit_rows: Option<usize>,
}

impl StubModel {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            favored_token: None,
            favored_logit: 8.0,
            emit_kv: true,
            kv_shape: (1, 1, 4),
            max_logit_rows: None,
        }
    }

    pub fn with_favored_token(mut self, token: u32) -> Self {
        self.favored_token = Some(token);
        self
    }

    pub fn with_kv_shape(mut self, num_layers: usize, num_heads: usize, head_dim: usize) -> Self {
        self.kv_shape = (num_layers, num_heads, head_dim);
        self
    }

    pub fn without_kv(mut self) -> Self {
        self.emit_kv = false;
        self
    }

    /// Caps the number of logits rows returned to the last `n` input
    /// positions, simulating a model that only scores a suffix of its
    /// input — exercises the §4.6 defensive-fallback path in callers.
    /// `new_kv`, when emitted, still covers every input position.
    pub fn with_truncated_logits(mut self, n: usize) -> Self {
        self.max_logit_rows = Some(n);
        self
    }

    fn logits_row(&self, favored: u32) -> Vec<f32> {
        let mut row = vec![0.0_f32; self.vocab_size];
        row[favored as usize % self.vocab_size] = self.favored_logit;
        row
    }
}

#[async_trait]
impl LanguageModel for StubModel {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    async fn forward(
        &self,
        input_tokens: &[u32],
        _past: Option<PastKv<'_>>,
    ) -> Result<ForwardOutput, String> {
        let (layers, heads, head_dim) = self.kv_shape;
        let per_elem_count = layers * heads * head_dim;

        let mut logits = Vec::with_capacity(input_tokens.len());
        let mut new_kv = self.emit_kv.then(|| Vec::with_capacity(input_tokens.len()));

        for &tok in input_tokens {
            let favored = self.favored_token.unwrap_or(tok);
            logits.push(self.logits_row(favored));
            if let Some(kv) = new_kv.as_mut() {
                kv.push(KvSlice {
                    k: vec![Elem::from_f32(0.0); per_elem_count],
                    v: vec![Elem::from_f32(0.0); per_elem_count],
                });
            }
        }

        if let Some(max_rows) = self.max_logit_rows {
            let drop = logits.len().saturating_sub(max_rows);
            logits.drain(0..drop);
        }

        Ok(ForwardOutput { logits, new_kv })
    }
}
