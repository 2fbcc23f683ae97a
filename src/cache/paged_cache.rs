//! Paged KV Cache (C3): coordinates a [`BlockPool`] and one
//! [`SequencePageTable`] per open lane, and is the single place that
//! converts between the pool's per-layer-contiguous storage layout and the
//! per-position layout the model trait speaks.
//!
//! Lanes are opened, ingested into token-by-token, and closed — there is
//! no other way to reach a block's storage from outside this module.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::block::page_table::SequencePageTable;
use crate::block::pool::{AllocatorError, BlockPool};
use crate::model::KvSlice;

/// Handle to one sequence's reservation in the cache. Exclusively owned by
/// the request that opened it (see spec.md §5) — never shared or cloned
/// across requests.
pub type LaneId = u64;

/// Owned snapshot of a lane's cached KV material, reassembled into the
/// per-position layout [`crate::model::LanguageModel::forward`] expects.
#[derive(Debug, Clone, Default)]
pub struct CachedKv {
    pub slices: Vec<KvSlice>,
}

pub struct PagedKvCache {
    pool: Arc<BlockPool>,
    lanes: Mutex<HashMap<LaneId, SequencePageTable>>,
    next_lane: AtomicU64,
}

impl PagedKvCache {
    pub fn new(pool: Arc<BlockPool>) -> Self {
        Self {
            pool,
            lanes: Mutex::new(HashMap::new()),
            next_lane: AtomicU64::new(0),
        }
    }

    pub fn pool(&self) -> &Arc<BlockPool> {
        &self.pool
    }

    /// Reserve a new lane and its first block. Fails with `OutOfBlocks`
    /// before any lane state is recorded.
    pub fn open_lane(&self) -> Result<LaneId, AllocatorError> {
        let block_id = self.pool.allocate()?;
        let mut table = SequencePageTable::new(self.pool.shape().block_size);
        table.add_block(block_id);

        let lane_id = self.next_lane.fetch_add(1, Ordering::Relaxed);
        self.lanes.lock().unwrap().insert(lane_id, table);
        debug!(lane_id, block_id, "opened cache lane");
        Ok(lane_id)
    }

    /// Release every block this lane holds. Idempotent: closing an
    /// already-closed or unknown lane is a no-op, so every exit path
    /// (success, stop, failure, cancellation) can call this unconditionally.
    pub fn close_lane(&self, lane_id: LaneId) {
        let table = self.lanes.lock().unwrap().remove(&lane_id);
        if let Some(table) = table {
            for &block_id in table.block_ids() {
                self.pool.release(block_id);
            }
            info!(lane_id, tokens = table.num_tokens(), "closed cache lane");
        }
    }

    /// Number of tokens currently cached for a lane.
    pub fn lane_len(&self, lane_id: LaneId) -> usize {
        self.lanes
            .lock()
            .unwrap()
            .get(&lane_id)
            .map(SequencePageTable::num_tokens)
            .unwrap_or(0)
    }

    /// Append one token's worth of newly produced KV material per input
    /// token, in order, allocating new blocks as the page table fills.
    pub fn ingest(&self, lane_id: LaneId, kv: &[KvSlice]) -> Result<(), AllocatorError> {
        let shape = self.pool.shape();

        for slice in kv {
            let needs_new_block = {
                let lanes = self.lanes.lock().unwrap();
                lanes
                    .get(&lane_id)
                    .map(SequencePageTable::needs_new_block)
                    .unwrap_or(false)
            };

            if needs_new_block {
                let new_block = self.pool.allocate()?;
                let mut lanes = self.lanes.lock().unwrap();
                if let Some(table) = lanes.get_mut(&lane_id) {
                    table.add_block(new_block);
                }
            }

            let (block_id, offset) = {
                let lanes = self.lanes.lock().unwrap();
                let table = lanes.get(&lane_id).expect("ingest on unknown lane");
                table.next_physical_location()
            };

            scatter_token_into_block(&self.pool, block_id, offset, shape.layers, slice);

            let mut lanes = self.lanes.lock().unwrap();
            if let Some(table) = lanes.get_mut(&lane_id) {
                table.append_token();
            }
        }

        Ok(())
    }

    /// Drop cached entries beyond `keep_tokens`, releasing any block that
    /// becomes wholly unneeded. Used to discard KV material computed for
    /// speculative tokens a verification step rejected; the released
    /// blocks return to the pool's free stack immediately, same as
    /// [`PagedKvCache::close_lane`].
    pub fn truncate(&self, lane_id: LaneId, keep_tokens: usize) {
        let mut lanes = self.lanes.lock().unwrap();
        let Some(table) = lanes.get_mut(&lane_id) else {
            return;
        };
        debug_assert!(keep_tokens <= table.num_tokens());
        let dropped = table.truncate(keep_tokens);
        for block_id in dropped {
            self.pool.release(block_id);
        }
    }

    /// Reassemble every token currently cached for a lane into the
    /// per-position layout the model trait reads. Returns `None` for an
    /// empty or unknown lane (nothing to attend over yet).
    pub fn emit(&self, lane_id: LaneId) -> Option<CachedKv> {
        let lanes = self.lanes.lock().unwrap();
        let table = lanes.get(&lane_id)?;
        if table.num_tokens() == 0 {
            return None;
        }

        let shape = self.pool.shape();
        let mut slices = Vec::with_capacity(table.num_tokens());
        for logical_pos in 0..table.num_tokens() {
            let (block_id, offset) = table.physical_location(logical_pos);
            slices.push(gather_token_from_block(&self.pool, block_id, offset, shape.layers));
        }

        Some(CachedKv { slices })
    }
}

/// Scatter one token's flat `(layers * heads * head_dim)` K/V material into
/// its per-layer-contiguous slot inside `block_id`, at `offset` within the
/// block. This is the runtime-cache format conversion: the model speaks
/// per-position, the pool stores per-layer.
fn scatter_token_into_block(
    pool: &BlockPool,
    block_id: crate::block::pool::BlockId,
    offset: usize,
    layers: usize,
    slice: &KvSlice,
) {
    let per_layer = slice.k.len() / layers;
    let block_size = pool.shape().block_size;
    let mut view = pool.kv_view_mut(block_id);

    for layer in 0..layers {
        let src = layer * per_layer..(layer + 1) * per_layer;
        let dst_base = layer * block_size * per_layer + offset * per_layer;
        let dst = dst_base..dst_base + per_layer;
        view.k[dst.clone()].copy_from_slice(&slice.k[src.clone()]);
        view.v[dst].copy_from_slice(&slice.v[src]);
    }
}

/// Inverse of [`scatter_token_into_block`]: read one token's material back
/// out into a flat per-position buffer.
fn gather_token_from_block(
    pool: &BlockPool,
    block_id: crate::block::pool::BlockId,
    offset: usize,
    layers: usize,
) -> KvSlice {
    let block_size = pool.shape().block_size;
    let heads = pool.shape().heads;
    let head_dim = pool.shape().head_dim;
    let per_layer = heads * head_dim;

    let view = pool.kv_view(block_id);
    let mut k = Vec::with_capacity(layers * per_layer);
    let mut v = Vec::with_capacity(layers * per_layer);

    for layer in 0..layers {
        let src_base = layer * block_size * per_layer + offset * per_layer;
        let src = src_base..src_base + per_layer;
        k.extend_from_slice(&view.k[src.clone()]);
        v.extend_from_slice(&view.v[src]);
    }

    KvSlice { k, v }
}
