//! Cached Model Adapter (C4): wraps a [`LanguageModel`] so a caller can pass
//! either just the tokens newly produced since the last call, or the full
//! accumulated sequence — the adapter slices down to the uncached suffix
//! itself (spec.md §4.4 steps 1-2), reads the lane's prior KV from the
//! paged cache, and writes back whatever the model produces this call.
//!
//! If the wrapped model never reports KV material, the adapter degrades to
//! a no-cache pass-through: every call re-attends over the tokens the
//! caller supplies, which still produces correct logits, just without the
//! asymptotic benefit of caching. The degrade is logged once per lane,
//! since a lane's worth of requests sharing the same warning is enough to
//! avoid flooding the log without hiding the condition from a fresh lane.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::cache::paged_cache::{LaneId, PagedKvCache};
use crate::error::CoreError;
use crate::model::{LanguageModel, PastKv, PastKvView};

pub struct CachedModelAdapter<M> {
    model: M,
    cache: Arc<PagedKvCache>,
    warned_no_kv_lanes: Mutex<HashSet<LaneId>>,
}

impl<M: LanguageModel> CachedModelAdapter<M> {
    pub fn new(model: M, cache: Arc<PagedKvCache>) -> Self {
        Self {
            model,
            cache,
            warned_no_kv_lanes: Mutex::new(HashSet::new()),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.model.vocab_size()
    }

    pub fn cache(&self) -> &Arc<PagedKvCache> {
        &self.cache
    }

    /// Run the model over `input_tokens`, transparently attending over
    /// `lane_id`'s prior KV, and persist whatever new KV the model
    /// produces back into that lane. Returns one logits row per new token.
    ///
    /// Per spec.md §4.4: `input_tokens` may be either just the uncached
    /// suffix (what this crate's own `generation::drive_request` passes on
    /// every call after the first — e.g. a single freshly-drafted token) or
    /// the full accumulated sequence including the already-cached prefix —
    /// this call computes `cached = cache.lane_len(lane_id)` and slices down
    /// to the suffix itself, so either calling convention is safe.
    /// `input_tokens.len() < cached` is the common incremental case, not an
    /// error.
    pub async fn forward(
        &self,
        lane_id: LaneId,
        input_tokens: &[u32],
    ) -> Result<Vec<Vec<f32>>, CoreError> {
        let cached = self.cache.lane_len(lane_id);
        let prior = self.cache.emit(lane_id);
        let suffix = if prior.is_some() && input_tokens.len() > cached {
            &input_tokens[cached..]
        } else {
            input_tokens
        };

        let past = prior.as_ref().map(|c| PastKv {
            slices: c
                .slices
                .iter()
                .map(|s| PastKvView { k: &s.k, v: &s.v })
                .collect(),
        });

        let output = self
            .model
            .forward(suffix, past)
            .await
            .map_err(CoreError::ModelFailure)?;

        match output.new_kv {
            Some(kv) => self.cache.ingest(lane_id, &kv)?,
            None => {
                let first_for_lane = self.warned_no_kv_lanes.lock().unwrap().insert(lane_id);
                if first_for_lane {
                    warn!(lane_id, "model did not report KV material; running lane without a cache");
                }
            }
        }

        Ok(output.logits)
    }
}
