//! Block Allocator (C1): a pool of fixed-size KV slots with reference counts.
//!
//! All of the pool's backing storage is allocated once at construction and
//! never moved or resized afterward. Allocation and release only ever touch
//! a free-list and a ref-count array, so both are O(1); reading or writing
//! the KV data of a given block never touches that bookkeeping.

use std::cell::UnsafeCell;
use std::sync::Mutex;

use half::f16;
use thiserror::Error;
use tracing::debug;

/// Element type stored in the pool. 16-bit float, matching the KV Tensor's
/// documented default in the data model.
pub type Elem = f16;

/// Stable index into the block pool, in `[0, N)`.
pub type BlockId = u32;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("out of blocks: pool is fully allocated")]
    OutOfBlocks,
}

/// Opaque handle to the accelerator the pool's storage lives on.
///
/// Device discovery/selection is an external collaborator (see spec.md §1);
/// the allocator only needs a stable identifier to tag its storage with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Device {
    pub id: usize,
}

/// Shape parameters for one model's KV tensors, fixed for the life of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockShape {
    /// Transformer layers, `L`.
    pub layers: usize,
    /// Tokens per block, `B`. Must be a power of two.
    pub block_size: usize,
    /// Attention heads, `H`.
    pub heads: usize,
    /// Head dimension, `D`.
    pub head_dim: usize,
}

impl BlockShape {
    /// Elements per block across both K and V and all layers:
    /// `2 * L * B * H * D`.
    pub fn block_elems(&self) -> usize {
        2 * self.layers * self.block_size * self.heads * self.head_dim
    }

    /// Elements per (K or V) sub-region of one block: `L * B * H * D`.
    fn half_elems(&self) -> usize {
        self.layers * self.block_size * self.heads * self.head_dim
    }
}

struct PoolMeta {
    free_stack: Vec<BlockId>,
    ref_counts: Vec<u32>,
}

/// Pool of `N` fixed-size blocks pre-allocated in one contiguous region,
/// shape `(N, 2, L, B, H, D)`.
///
/// # Safety discipline
///
/// [`BlockPool::kv_view`] and [`BlockPool::kv_view_mut`] hand out slices
/// into `storage` computed from raw pointer arithmetic, because the pool is
/// shared (`Arc<BlockPool>`) across concurrently-running requests while its
/// data must remain writable without a lock on every token. This is sound
/// under the protocol the rest of the crate enforces: a `block_id` is only
/// ever accessed by the single [`crate::block::page_table::SequencePageTable`]
/// that currently holds it (lanes are never shared between requests, per
/// spec.md §5), so two `kv_view_mut` calls for the *same* block never
/// execute concurrently. Calls for *different* block ids touch disjoint
/// memory and may run concurrently without synchronization.
pub struct BlockPool {
    shape: BlockShape,
    device: Device,
    storage: UnsafeCell<Box<[Elem]>>,
    meta: Mutex<PoolMeta>,
}

// Safety: see the struct-level safety discipline note above.
unsafe impl Sync for BlockPool {}

/// Non-owning view into one block's K and V sub-regions, shape `(L, B, H, D)`.
pub struct KvView<'a> {
    pub k: &'a [Elem],
    pub v: &'a [Elem],
}

/// Mutable counterpart of [`KvView`].
pub struct KvViewMut<'a> {
    pub k: &'a mut [Elem],
    pub v: &'a mut [Elem],
}

impl BlockPool {
    /// Allocate the backing storage for `num_blocks` blocks of `shape` on
    /// `device`. This is the only point at which storage is allocated.
    pub fn new(num_blocks: usize, shape: BlockShape, device: Device) -> Self {
        let block_elems = shape.block_elems();
        let storage = vec![Elem::from_f32(0.0); num_blocks * block_elems].into_boxed_slice();

        debug!(
            num_blocks,
            block_elems,
            device = device.id,
            "allocated block pool storage"
        );

        Self {
            shape,
            device,
            storage: UnsafeCell::new(storage),
            meta: Mutex::new(PoolMeta {
                free_stack: (0..num_blocks as u32).rev().collect(),
                ref_counts: vec![0; num_blocks],
            }),
        }
    }

    pub fn shape(&self) -> BlockShape {
        self.shape
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn num_blocks(&self) -> usize {
        self.meta.lock().unwrap().ref_counts.len()
    }

    /// Pop a block off the free stack and set its ref_count to 1.
    pub fn allocate(&self) -> Result<BlockId, AllocatorError> {
        let mut meta = self.meta.lock().unwrap();
        let id = meta.free_stack.pop().ok_or(AllocatorError::OutOfBlocks)?;
        meta.ref_counts[id as usize] = 1;
        Ok(id)
    }

    /// Increment a block's ref_count. Reserved for future copy-on-write
    /// sharing; no caller in this crate uses it yet, but the contract is
    /// stable.
    pub fn retain(&self, block_id: BlockId) {
        let mut meta = self.meta.lock().unwrap();
        meta.ref_counts[block_id as usize] += 1;
    }

    /// Decrement a block's ref_count; push it back on the free stack once
    /// it reaches zero. Releasing a never-allocated block is a programming
    /// error, checked with `debug_assert!`.
    pub fn release(&self, block_id: BlockId) {
        let mut meta = self.meta.lock().unwrap();
        let rc = &mut meta.ref_counts[block_id as usize];
        debug_assert!(*rc > 0, "release of a never-allocated block {block_id}");
        *rc = rc.saturating_sub(1);
        if *rc == 0 {
            meta.free_stack.push(block_id);
        }
    }

    /// Fraction of blocks with `ref_count > 0`.
    pub fn utilization(&self) -> f64 {
        let meta = self.meta.lock().unwrap();
        if meta.ref_counts.is_empty() {
            return 0.0;
        }
        let used = meta.ref_counts.iter().filter(|&&rc| rc > 0).count();
        used as f64 / meta.ref_counts.len() as f64
    }

    /// Non-owning read view into a block's K and V sub-regions.
    pub fn kv_view(&self, block_id: BlockId) -> KvView<'_> {
        let (k, v) = self.slices(block_id);
        KvView { k, v }
    }

    /// Non-owning mutable view into a block's K and V sub-regions.
    pub fn kv_view_mut(&self, block_id: BlockId) -> KvViewMut<'_> {
        let (k, v) = self.slices_mut(block_id);
        KvViewMut { k, v }
    }

    fn slices(&self, block_id: BlockId) -> (&[Elem], &[Elem]) {
        let half = self.shape.half_elems();
        let block_elems = self.shape.block_elems();
        let base = block_id as usize * block_elems;
        // Safety: see struct-level safety discipline note.
        let storage = unsafe { &*self.storage.get() };
        (&storage[base..base + half], &storage[base + half..base + block_elems])
    }

    #[allow(clippy::mut_from_ref)]
    fn slices_mut(&self, block_id: BlockId) -> (&mut [Elem], &mut [Elem]) {
        let half = self.shape.half_elems();
        let block_elems = self.shape.block_elems();
        let base = block_id as usize * block_elems;
        // Safety: see struct-level safety discipline note. The two
        // sub-slices returned here are disjoint (`base..base+half` and
        // `base+half..base+block_elems`), so this does not alias itself.
        let ptr = self.storage.get();
        unsafe {
            let start = (*ptr).as_mut_ptr().add(base);
            let k = std::slice::from_raw_parts_mut(start, half);
            let v = std::slice::from_raw_parts_mut(start.add(half), block_elems - half);
            (k, v)
        }
    }
}
