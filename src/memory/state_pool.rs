//! Variable-size state allocator on top of a [`BlockPool`].
//!
//! Requests are rounded up to a power-of-two bucket. Each bucket keeps a
//! lock-free free list of states of exactly its size plus a bump cursor into
//! a `block_size` block it carves fresh states from. A miss in the requested
//! bucket steals a state from a larger bucket and splits the surplus back
//! into the smaller buckets.
//!
//! Every state owns a record in the pool's [`StateTable`]; the record's index
//! is how free lists link states and how a [`State`] finds its way back.
//!
//! Debug builds also record every live record in a mutex-guarded bit set to
//! catch double frees. That lock serializes `alloc` and `free`, so the
//! lock-free paths only run unserialized in release builds; the loom models
//! and stress tests should be run with `--release` to cover them.

use std::ptr::{self, NonNull};

#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

use super::block_pool::{BlockPool, BlockPoolConfig};
use super::block_state::{AtomicBlockState, BlockState, Reserve};
use super::error::AllocError;
use super::free_list::{EMPTY, FreeList};
use super::state_table::StateTable;
use super::stats;
use crate::sync::atomic::{AtomicUsize, Ordering};
#[cfg(debug_assertions)]
use crate::sync::{Mutex, lock};

/// Smallest state handed out, as a power of two (64 bytes).
pub const MIN_STATE_SIZE_LOG2: u32 = 6;
/// Largest state handed out, as a power of two (2 MiB).
pub const MAX_STATE_SIZE_LOG2: u32 = 21;

pub const MIN_STATE_SIZE: u32 = 1 << MIN_STATE_SIZE_LOG2;
pub const MAX_STATE_SIZE: u32 = 1 << MAX_STATE_SIZE_LOG2;

const BUCKETS: usize = (MAX_STATE_SIZE_LOG2 - MIN_STATE_SIZE_LOG2 + 1) as usize;

/// A region of pool memory.
///
/// `map` is the CPU address of the region, `offset` its position relative to
/// the pool's center (negative for back allocations). A `State` is a plain
/// handle: copying it does not copy ownership, and it must be returned to
/// the pool it came from exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct State {
    pub offset: i32,
    pub alloc_size: u32,
    pub map: *mut u8,
    pub idx: u32,
}

// Safety: State is an address plus bookkeeping; access to the memory behind
// `map` is governed by the unsafe accessors.
unsafe impl Send for State {}
// Safety: see above.
unsafe impl Sync for State {}

impl State {
    /// The zero-size state returned for empty requests.
    pub const NULL: Self = Self {
        offset: 0,
        alloc_size: 0,
        map: ptr::null_mut(),
        idx: EMPTY,
    };

    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.alloc_size == 0
    }

    /// The state's memory as a byte slice.
    ///
    /// # Safety
    ///
    /// The state must be live, its pool alive for `'a`, and no other
    /// reference to the same bytes may exist for `'a`.
    #[must_use]
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        if self.is_null() {
            return &mut [];
        }
        // Safety: upheld by the caller; map covers alloc_size bytes.
        unsafe { std::slice::from_raw_parts_mut(self.map, self.alloc_size as usize) }
    }
}

/// Configuration for [`StatePool`].
#[derive(Clone, Debug)]
pub struct StatePoolConfig {
    /// Granularity of fresh block-pool allocations and the size of every
    /// back-allocated state. Power of two in
    /// `[MIN_STATE_SIZE, MAX_STATE_SIZE]`. Default: 4096.
    pub block_size: u32,

    /// Device address of pool offset 0, added by [`StatePool::address`].
    /// Default: 0.
    pub base_address: u64,

    /// Underlying block pool. Default: [`BlockPoolConfig::default`].
    pub block_pool: BlockPoolConfig,

    /// Maximum number of states the pool can ever create, live or free.
    /// Default: 1 << 20.
    pub table_capacity: u32,
}

impl Default for StatePoolConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            base_address: 0,
            block_pool: BlockPoolConfig::default(),
            table_capacity: 1 << 20,
        }
    }
}

struct Bucket {
    free_list: FreeList,
    /// Carve cursor into this bucket's current block, in pool offsets.
    block: AtomicBlockState,
}

impl Bucket {
    fn new() -> Self {
        Self {
            free_list: FreeList::new(),
            block: AtomicBlockState::new(BlockState::EMPTY),
        }
    }
}

#[inline]
fn bucket_of(size: u32) -> usize {
    let log2 = size.next_power_of_two().trailing_zeros().max(MIN_STATE_SIZE_LOG2);
    (log2 - MIN_STATE_SIZE_LOG2) as usize
}

#[inline]
fn bucket_size(bucket: usize) -> u32 {
    1 << (bucket as u32 + MIN_STATE_SIZE_LOG2)
}

pub struct StatePool {
    block_pool: BlockPool,
    table: StateTable,
    buckets: [Bucket; BUCKETS],
    back: FreeList,
    block_size: u32,
    base_address: u64,
    leaked: AtomicUsize,
    live: AtomicUsize,
    #[cfg(debug_assertions)]
    live_set: Mutex<FixedBitSet>,
}

impl StatePool {
    /// # Errors
    ///
    /// Returns [`AllocError::Init`] if the block pool or the state table
    /// cannot be created.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is not a power of two in
    /// `[MIN_STATE_SIZE, MAX_STATE_SIZE]`.
    pub fn new(config: &StatePoolConfig) -> Result<Self, AllocError> {
        assert!(
            config.block_size.is_power_of_two()
                && (MIN_STATE_SIZE..=MAX_STATE_SIZE).contains(&config.block_size),
            "StatePool block_size {} must be a power of two in [{MIN_STATE_SIZE}, {MAX_STATE_SIZE}]",
            config.block_size
        );

        let block_pool = BlockPool::new(&config.block_pool)?;
        let table = StateTable::new(
            config.table_capacity.min(1024),
            config.table_capacity,
            config.block_pool.strategy,
        )?;

        log::debug!(
            "state pool created: block size {}, base {:#x}, {:?}",
            config.block_size,
            config.base_address,
            config.block_pool.strategy
        );

        Ok(Self {
            block_pool,
            table,
            buckets: std::array::from_fn(|_| Bucket::new()),
            back: FreeList::new(),
            block_size: config.block_size,
            base_address: config.base_address,
            leaked: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            #[cfg(debug_assertions)]
            live_set: Mutex::new(FixedBitSet::new()),
        })
    }

    /// Allocate a state of at least `size` bytes aligned to `align`.
    ///
    /// The state's `alloc_size` is `max(size, align)` rounded up to a power
    /// of two, at least [`MIN_STATE_SIZE`]. `size == 0` returns
    /// [`State::NULL`] without allocating.
    ///
    /// # Errors
    ///
    /// Returns an [`AllocError`] if the block pool or the state table
    /// cannot grow.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two no larger than the block
    /// size, or if the rounded size exceeds [`MAX_STATE_SIZE`].
    pub fn alloc(&self, size: u32, align: u32) -> Result<State, AllocError> {
        if size == 0 {
            return Ok(State::NULL);
        }
        assert!(
            align.is_power_of_two() && align <= self.block_size,
            "state alignment {align} must be a power of two no larger than {}",
            self.block_size
        );
        assert!(
            size.max(align) <= MAX_STATE_SIZE,
            "state of {size} bytes exceeds the largest bucket ({MAX_STATE_SIZE})"
        );

        let bucket = bucket_of(size.max(align));
        let state_size = bucket_size(bucket);

        if let Some(idx) = self.buckets[bucket].free_list.pop(&self.table) {
            return Ok(self.hand_out(idx));
        }

        for larger in bucket + 1..BUCKETS {
            let Some(idx) = self.buckets[larger].free_list.pop(&self.table) else {
                continue;
            };
            let entry = self.table.get(idx);
            let chunk_offset = entry.offset();
            let chunk_size = entry.alloc_size();
            debug_assert_eq!(chunk_size, bucket_size(larger));

            // Keep the front of the chunk, give the rest back.
            entry.set_alloc_size(state_size);
            if let Err(e) = self.split_chunk(
                chunk_offset + state_size as i32,
                chunk_size - state_size,
                state_size,
            ) {
                log::warn!("dropping split remainder of {chunk_size}-byte chunk: {e}");
            }
            return Ok(self.hand_out(idx));
        }

        let offset = self.alloc_new(&self.buckets[bucket], state_size)?;
        let idx = match self.table.add(1) {
            Ok(idx) => idx,
            Err(e) => {
                self.leaked.fetch_add(state_size as usize, Ordering::Relaxed);
                return Err(e);
            }
        };
        self.table.get(idx).set(offset, state_size);
        Ok(self.hand_out(idx))
    }

    /// Fresh memory for a bucket: straight from the block pool for sizes of
    /// a block or more, otherwise carved from the bucket's current block.
    fn alloc_new(&self, bucket: &Bucket, state_size: u32) -> Result<i32, AllocError> {
        if state_size >= self.block_size {
            return self.block_pool.alloc(state_size);
        }
        loop {
            match bucket.block.reserve(state_size) {
                Reserve::Fits(offset) => return Ok(offset as i32),
                Reserve::MustGrow(before) => match self.block_pool.alloc(self.block_size) {
                    Ok(block) => {
                        let start = block as u32;
                        bucket.block.publish(BlockState {
                            next: start + state_size,
                            end: start + self.block_size,
                        });
                        return Ok(block);
                    }
                    Err(e) => {
                        bucket.block.publish(before);
                        return Err(e);
                    }
                },
                Reserve::Wait(observed) => bucket.block.wait(observed),
            }
        }
    }

    /// Allocate one `block_size` state at a negative offset.
    ///
    /// # Errors
    ///
    /// Returns an [`AllocError`] if the block pool or the state table
    /// cannot grow.
    pub fn alloc_back(&self) -> Result<State, AllocError> {
        if let Some(idx) = self.back.pop(&self.table) {
            return Ok(self.hand_out(idx));
        }
        let offset = self.block_pool.alloc_back(self.block_size)?;
        let idx = match self.table.add(1) {
            Ok(idx) => idx,
            Err(e) => {
                self.leaked.fetch_add(self.block_size as usize, Ordering::Relaxed);
                return Err(e);
            }
        };
        self.table.get(idx).set(offset, self.block_size);
        Ok(self.hand_out(idx))
    }

    /// Return `state` to the free list it came from. Freeing
    /// [`State::NULL`] does nothing.
    ///
    /// # Panics
    ///
    /// Panics if `state` was not handed out by this pool's `alloc` or
    /// `alloc_back`, and in debug builds if it is freed twice.
    pub fn free(&self, state: State) {
        if state.is_null() {
            return;
        }
        assert!(
            state.idx != EMPTY && (state.idx as usize) < self.table.len(),
            "state {state:?} was not allocated from this pool"
        );

        #[cfg(debug_assertions)]
        {
            let mut live = lock(&self.live_set);
            assert!(
                live.contains(state.idx as usize),
                "double free of state {} at offset {}",
                state.idx,
                state.offset
            );
            live.set(state.idx as usize, false);
        }

        let entry = self.table.get(state.idx);
        debug_assert_eq!(entry.offset(), state.offset);
        debug_assert_eq!(entry.alloc_size(), state.alloc_size);

        self.live.fetch_sub(1, Ordering::Relaxed);
        stats::sub_saturating(&stats::STATE_POOL_LIVE, 1);

        if state.offset < 0 {
            assert_eq!(
                state.alloc_size, self.block_size,
                "back state must be exactly one block"
            );
            self.back.push(&self.table, state.idx, 1);
        } else {
            self.buckets[bucket_of(state.alloc_size)]
                .free_list
                .push(&self.table, state.idx, 1);
        }
    }

    /// Give the forward range `[offset, offset + size)` to the pool as free
    /// states.
    ///
    /// The range is cut from its high end into the largest pieces that fit:
    /// first `block_size` blocks, then halving sizes down to
    /// [`MIN_STATE_SIZE`]. Bytes left below that are leaked and counted in
    /// [`leaked_bytes`](Self::leaked_bytes).
    ///
    /// The caller must own the range, and its end must be aligned to the
    /// block size for the pieces to be naturally aligned.
    ///
    /// # Errors
    ///
    /// Returns an [`AllocError`] if the state table cannot grow; pieces
    /// already returned stay in the pool and the rest of the range is
    /// counted as leaked.
    pub fn return_chunk(&self, offset: i32, size: u32) -> Result<(), AllocError> {
        self.split_chunk(offset, size, 0)
    }

    /// `small_size`, when non-zero and below half a block, caps the piece
    /// size used for the sub-block remainder. Splitting a stolen chunk
    /// passes the requested size so the remainder lands in that bucket.
    fn split_chunk(&self, chunk_offset: i32, chunk_size: u32, small_size: u32) -> Result<(), AllocError> {
        assert!(chunk_offset >= 0, "return_chunk of back range at {chunk_offset}");
        let mut divisor = self.block_size;
        let mut remaining = chunk_size;

        let blocks = remaining / divisor;
        let rest = remaining - blocks * divisor;
        if blocks > 0 {
            if let Err(e) = self.return_blocks(chunk_offset + rest as i32, blocks, divisor) {
                self.leak(remaining, chunk_offset);
                return Err(e);
            }
        }
        remaining = rest;

        divisor /= 2;
        if small_size > 0 && small_size < divisor {
            divisor = small_size;
        }

        while remaining > 0 && divisor >= MIN_STATE_SIZE {
            let pieces = remaining / divisor;
            let rest = remaining - pieces * divisor;
            if pieces > 0 {
                if let Err(e) = self.return_blocks(chunk_offset + rest as i32, pieces, divisor) {
                    self.leak(remaining, chunk_offset);
                    return Err(e);
                }
                remaining = rest;
            }
            divisor /= 2;
        }

        if remaining > 0 {
            self.leak(remaining, chunk_offset);
        }
        Ok(())
    }

    /// Give up the low `bytes` of the chunk at `chunk_offset`.
    fn leak(&self, bytes: u32, chunk_offset: i32) {
        self.leaked.fetch_add(bytes as usize, Ordering::Relaxed);
        log::trace!("leaked {bytes} bytes at offset {chunk_offset}");
    }

    /// Push `count` consecutive states of `size` bytes starting at `offset`
    /// onto the matching bucket.
    ///
    /// # Errors
    ///
    /// Returns an [`AllocError`] if the state table cannot grow.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a bucket size or `offset` is not aligned to
    /// `min(size, block_size)`.
    pub fn return_blocks(&self, offset: i32, count: u32, size: u32) -> Result<(), AllocError> {
        if count == 0 {
            return Ok(());
        }
        assert!(
            size.is_power_of_two() && (MIN_STATE_SIZE..=MAX_STATE_SIZE).contains(&size),
            "return_blocks of {size}-byte pieces"
        );
        assert!(
            offset >= 0 && (offset as u32).is_multiple_of(size.min(self.block_size)),
            "return_blocks offset {offset} is not aligned for {size}-byte pieces"
        );

        let first = self.table.add(count)?;
        for i in 0..count {
            self.table
                .get(first + i)
                .set(offset + (i * size) as i32, size);
        }
        self.buckets[bucket_of(size)]
            .free_list
            .push(&self.table, first, count);
        Ok(())
    }

    fn hand_out(&self, idx: u32) -> State {
        #[cfg(debug_assertions)]
        {
            let mut live = lock(&self.live_set);
            if live.len() <= idx as usize {
                live.grow(idx as usize + 1);
            }
            assert!(!live.put(idx as usize), "state {idx} handed out twice");
        }
        self.live.fetch_add(1, Ordering::Relaxed);
        stats::STATE_POOL_LIVE.add(1);
        self.state_at(idx)
    }

    /// Rebuild the handle for record `idx`.
    pub(crate) fn state_at(&self, idx: u32) -> State {
        let entry = self.table.get(idx);
        let offset = entry.offset();
        State {
            offset,
            alloc_size: entry.alloc_size(),
            map: self.block_pool.map(offset).as_ptr(),
            idx,
        }
    }

    /// Device address of `state`: the configured base address plus its
    /// offset.
    #[must_use]
    pub fn address(&self, state: &State) -> u64 {
        self.base_address.wrapping_add_signed(i64::from(state.offset))
    }

    /// CPU address of a pool offset.
    #[must_use]
    pub fn map(&self, offset: i32) -> NonNull<u8> {
        self.block_pool.map(offset)
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn block_pool(&self) -> &BlockPool {
        &self.block_pool
    }

    #[must_use]
    pub fn table(&self) -> &StateTable {
        &self.table
    }

    /// Bytes given up by chunk splitting or a failed table growth.
    #[must_use]
    pub fn leaked_bytes(&self) -> usize {
        self.leaked.load(Ordering::Relaxed)
    }

    /// States currently handed out.
    #[must_use]
    pub fn live_states(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for StatePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatePool")
            .field("block_size", &self.block_size)
            .field("base_address", &self.base_address)
            .finish_non_exhaustive()
    }
}

impl Drop for StatePool {
    fn drop(&mut self) {
        let live = self.live.load(Ordering::Relaxed);
        if live > 0 {
            log::debug!("state pool dropped with {live} live states");
            stats::sub_saturating(&stats::STATE_POOL_LIVE, live);
        }
    }
}
