//! Single-threaded bump allocator for many small states that die together.
//!
//! A stream takes whole blocks from a [`StatePool`] and bumps through them.
//! Individual allocations are never freed; the stream returns its blocks in
//! one pass when it is finished or dropped. Blocks are chained through a
//! small header at the start of each block that records the index of the
//! previous block's state.

use super::error::AllocError;
use super::free_list::EMPTY;
use super::state_pool::{MIN_STATE_SIZE, State, StatePool};
use super::stats;

/// Bytes reserved at the start of every stream block for the chain link.
const HEADER_SIZE: u32 = 8;

pub struct StateStream<'a> {
    pool: &'a StatePool,
    block_size: u32,
    /// Newest block; [`State::NULL`] until the first allocation.
    block: State,
    /// Bump cursor inside `block`, relative to its start.
    next: u32,
    blocks: usize,
    total_size: usize,
}

impl<'a> StateStream<'a> {
    /// A stream that takes blocks of at least `block_size` bytes from `pool`.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is not a power of two of at least
    /// [`MIN_STATE_SIZE`].
    #[must_use]
    pub fn new(pool: &'a StatePool, block_size: u32) -> Self {
        assert!(
            block_size.is_power_of_two() && block_size >= MIN_STATE_SIZE,
            "StateStream block_size {block_size} must be a power of two of at least {MIN_STATE_SIZE}"
        );
        Self {
            pool,
            block_size,
            block: State::NULL,
            next: 0,
            blocks: 0,
            total_size: 0,
        }
    }

    /// Carve `size` bytes aligned to `alignment` out of the current block,
    /// starting a new block when they do not fit. `size == 0` returns
    /// [`State::NULL`].
    ///
    /// The returned state has no table record of its own (`idx` is
    /// [`EMPTY`]) and must not be passed to [`StatePool::free`].
    ///
    /// # Errors
    ///
    /// Returns the pool's error if a new block cannot be obtained.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two no larger than the pool's
    /// block size.
    pub fn alloc(&mut self, size: u32, alignment: u32) -> Result<State, AllocError> {
        if size == 0 {
            return Ok(State::NULL);
        }
        assert!(
            alignment.is_power_of_two() && alignment <= self.pool.block_size(),
            "stream alignment {alignment} must be a power of two no larger than {}",
            self.pool.block_size()
        );

        let mut offset = self.next.next_multiple_of(alignment);
        let fits = !self.block.is_null()
            && (self.block.offset as u32).is_multiple_of(alignment)
            && u64::from(offset) + u64::from(size) <= u64::from(self.block.alloc_size);
        if !fits {
            offset = HEADER_SIZE.next_multiple_of(alignment);
            let needed = offset + size;
            let block_size = self.block_size.max(needed.next_power_of_two());
            self.start_block(block_size, alignment)?;
        }

        self.next = offset + size;
        self.total_size += size as usize;
        Ok(State {
            offset: self.block.offset + offset as i32,
            alloc_size: size,
            // Safety: offset + size <= block.alloc_size.
            map: unsafe { self.block.map.add(offset as usize) },
            idx: EMPTY,
        })
    }

    fn start_block(&mut self, block_size: u32, alignment: u32) -> Result<(), AllocError> {
        let block = self.pool.alloc(block_size, alignment.max(MIN_STATE_SIZE))?;
        let prev = if self.block.is_null() {
            EMPTY
        } else {
            self.block.idx
        };
        // Safety: the block is ours and at least HEADER_SIZE bytes; block
        // maps are aligned to MIN_STATE_SIZE.
        unsafe { block.map.cast::<u32>().write(prev) };

        log::trace!(
            "state stream block {} at offset {} ({block_size} bytes)",
            self.blocks,
            block.offset
        );
        self.block = block;
        self.blocks += 1;
        stats::STATE_STREAM_BLOCKS.add(1);
        Ok(())
    }

    /// Bytes handed out by [`alloc`](Self::alloc), excluding padding.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Blocks currently held.
    #[must_use]
    pub fn blocks(&self) -> usize {
        self.blocks
    }

    /// Return every block to the pool.
    pub fn finish(self) {}

    fn release_blocks(&mut self) {
        let mut block = std::mem::replace(&mut self.block, State::NULL);
        while !block.is_null() {
            // Safety: the header was written when the block was taken and the
            // block is still ours.
            let prev = unsafe { block.map.cast::<u32>().read() };
            self.pool.free(block);
            stats::sub_saturating(&stats::STATE_STREAM_BLOCKS, 1);
            block = if prev == EMPTY {
                State::NULL
            } else {
                self.pool.state_at(prev)
            };
        }
        self.blocks = 0;
        self.next = 0;
    }
}

impl Drop for StateStream<'_> {
    fn drop(&mut self) {
        self.release_blocks();
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::state_pool::StatePoolConfig;

    fn pool() -> StatePool {
        StatePool::new(&StatePoolConfig::default()).expect("Failed to create state pool")
    }

    #[test]
    fn test_stream_bumps_within_block() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = pool();
        let mut stream = StateStream::new(&pool, 4096);
        let a = stream.alloc(100, 16).unwrap();
        let b = stream.alloc(100, 64).unwrap();
        assert_eq!(stream.blocks(), 1);
        assert_eq!(a.offset % 16, 0);
        assert_eq!(b.offset % 64, 0);
        assert!(a.offset + 100 <= b.offset);
        assert_eq!((b.offset - a.offset) as usize, b.map as usize - a.map as usize);
        assert_eq!(stream.total_size(), 200);
        assert_eq!(pool.live_states(), 1);
    }

    #[test]
    fn test_stream_chains_blocks_and_frees_them() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = pool();
        let mut stream = StateStream::new(&pool, 1024);
        let mut states = Vec::new();
        for i in 0..100u8 {
            let s = stream.alloc(200, 8).unwrap();
            // Safety: Test code; stream states are disjoint.
            unsafe { s.as_mut_slice().fill(i) };
            states.push(s);
        }
        assert!(stream.blocks() >= 20);
        for (i, s) in states.iter().enumerate() {
            // Safety: Test code.
            assert!(unsafe { s.as_mut_slice() }.iter().all(|&b| b == i as u8));
        }
        assert_eq!(pool.live_states(), stream.blocks());
        stream.finish();
        assert_eq!(pool.live_states(), 0);
    }

    #[test]
    fn test_oversized_alloc_gets_its_own_block() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = pool();
        let mut stream = StateStream::new(&pool, 1024);
        stream.alloc(16, 16).unwrap();
        let big = stream.alloc(5000, 64).unwrap();
        assert_eq!(stream.blocks(), 2);
        assert_eq!(big.alloc_size, 5000);
        // Safety: Test code.
        unsafe { big.as_mut_slice().fill(7) };
        drop(stream);
        assert_eq!(pool.live_states(), 0);
    }

    #[test]
    fn test_zero_size_and_unused_stream() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = pool();
        let mut stream = StateStream::new(&pool, 4096);
        assert!(stream.alloc(0, 64).unwrap().is_null());
        assert_eq!(stream.blocks(), 0);
        stream.finish();
        assert_eq!(pool.table().len(), 0);
    }

    #[test]
    fn test_blocks_are_reused_by_next_stream() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let pool = pool();
        let first = {
            let mut stream = StateStream::new(&pool, 4096);
            stream.alloc(64, 64).unwrap().offset
        };
        let mut stream = StateStream::new(&pool, 4096);
        let again = stream.alloc(64, 64).unwrap().offset;
        assert_eq!(first, again);
    }
}
