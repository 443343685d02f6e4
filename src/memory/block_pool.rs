use std::ptr::NonNull;

use super::block_state::{AtomicBlockState, BlockState, Reserve};
use super::error::AllocError;
use super::mapping::{GrowableMapping, MappingKind, MappingStrategy, Reservation};
use super::vm::{PlatformVmOps, VmOps};
use crate::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use crate::sync::{Mutex, lock};

/// Largest reservation a block pool accepts. Each side gets half, which
/// keeps the 32-bit cursors clear of overflow while waiters pile up past
/// `end`.
pub const MAX_BLOCK_POOL_SIZE: usize = 1 << 32;

/// Configuration for [`BlockPool`].
#[derive(Clone, Debug)]
pub struct BlockPoolConfig {
    /// Bytes mapped up front, all of them on the forward side. Rounded up to
    /// a power of two no smaller than the page size. Default: 64 KiB.
    pub initial_size: usize,

    /// Reserved span, split evenly between back and front. Must be a power
    /// of two no larger than [`MAX_BLOCK_POOL_SIZE`]. Default: 1 GiB.
    pub max_size: usize,

    /// Growth backend. Default: [`MappingStrategy::default`].
    pub strategy: MappingStrategy,
}

impl Default for BlockPoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 64 * 1024,
            max_size: 1024 * 1024 * 1024,
            strategy: MappingStrategy::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Front,
    Back,
}

/// Bump allocator over a [`GrowableMapping`] that grows in both directions.
///
/// Forward allocations return non-negative offsets, back allocations
/// negative ones, both relative to the pool's logical center. Offsets stay
/// valid for the life of the pool; the CPU address of an offset is
/// `map(offset)`, which may change across growth (remap strategy) but always
/// resolves to the same contents.
///
/// Allocation is a single `fetch_add` on the fast path. Growth is serialized
/// by one mutex; threads that arrive while the pool is growing park until
/// the new bounds are published.
pub struct BlockPool {
    front: AtomicBlockState,
    back: AtomicBlockState,
    /// Address of offset 0 in the newest view.
    map: AtomicPtr<u8>,
    size: AtomicUsize,
    center: AtomicUsize,
    mapping: Mutex<GrowableMapping>,
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
fn cursor(bytes: usize) -> u32 {
    debug_assert!(u32::try_from(bytes).is_ok(), "{bytes} does not fit a block cursor");
    bytes as u32
}

impl BlockPool {
    /// Create a pool with `config.initial_size` bytes available on the front.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::Init`] if the backing cannot be created or mapped.
    ///
    /// # Panics
    ///
    /// Panics if `max_size` is not a power of two in
    /// `[2 * page_size, MAX_BLOCK_POOL_SIZE]`.
    pub fn new(config: &BlockPoolConfig) -> Result<Self, AllocError> {
        let page_size = PlatformVmOps::page_size();
        assert!(
            config.max_size.is_power_of_two()
                && config.max_size >= 2 * page_size
                && config.max_size <= MAX_BLOCK_POOL_SIZE,
            "BlockPool max_size {} must be a power of two between {} and {MAX_BLOCK_POOL_SIZE}",
            config.max_size,
            2 * page_size
        );
        let initial_size = config.initial_size.max(page_size).next_power_of_two();

        let mapping = GrowableMapping::with_kind(
            MappingKind::BlockPool,
            initial_size,
            Reservation::centered(config.max_size),
            config.strategy,
        )?;

        Ok(Self {
            front: AtomicBlockState::new(BlockState {
                next: 0,
                end: cursor(initial_size),
            }),
            back: AtomicBlockState::new(BlockState::EMPTY),
            map: AtomicPtr::new(mapping.map().as_ptr()),
            size: AtomicUsize::new(initial_size),
            center: AtomicUsize::new(0),
            mapping: Mutex::new(mapping),
        })
    }

    /// Allocate `block_size` bytes from the front. Returns a non-negative
    /// offset.
    ///
    /// # Errors
    ///
    /// Returns an [`AllocError`] if the pool had to grow and could not.
    ///
    /// # Panics
    ///
    /// Panics if `block_size` is zero or larger than one side of the largest
    /// reservation (`MAX_BLOCK_POOL_SIZE / 2`).
    pub fn alloc(&self, block_size: u32) -> Result<i32, AllocError> {
        assert!(
            block_size > 0 && block_size as usize <= MAX_BLOCK_POOL_SIZE / 2,
            "BlockPool::alloc of {block_size} bytes"
        );
        let offset = self.alloc_new(Side::Front, block_size)?;
        i32::try_from(offset).map_err(|_| AllocError::OutOfReservedSpace {
            requested: offset as usize + block_size as usize,
            reserved: i32::MAX as usize,
        })
    }

    /// Allocate `block_size` bytes from the back. The returned offset `o`
    /// satisfies `o < 0` and `o + block_size <= 0`.
    ///
    /// # Errors
    ///
    /// Returns an [`AllocError`] if the pool had to grow and could not.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`alloc`](Self::alloc).
    pub fn alloc_back(&self, block_size: u32) -> Result<i32, AllocError> {
        assert!(
            block_size > 0 && block_size as usize <= MAX_BLOCK_POOL_SIZE / 2,
            "BlockPool::alloc_back of {block_size} bytes"
        );
        let offset = self.alloc_new(Side::Back, block_size)?;
        // The back cursor counts upward from the center; flip it so the block
        // covers [-(offset + size), -offset).
        let end = i64::from(offset) + i64::from(block_size);
        i32::try_from(-end).map_err(|_| AllocError::OutOfReservedSpace {
            requested: end as usize,
            reserved: i32::MAX as usize,
        })
    }

    fn side(&self, side: Side) -> &AtomicBlockState {
        match side {
            Side::Front => &self.front,
            Side::Back => &self.back,
        }
    }

    fn alloc_new(&self, side: Side, block_size: u32) -> Result<u32, AllocError> {
        let state = self.side(side);
        loop {
            match state.reserve(block_size) {
                Reserve::Fits(offset) => return Ok(offset),
                Reserve::MustGrow(before) => {
                    // While we grow, `next` sits past `end` and everyone else
                    // parks in `wait`.
                    let next = before.next + block_size;
                    let mut end = before.end;
                    while end < next {
                        match self.grow(side) {
                            Ok(new_end) => end = new_end,
                            Err(e) => {
                                state.publish(before);
                                return Err(e);
                            }
                        }
                    }
                    state.publish(BlockState { next, end });
                    return Ok(before.next);
                }
                Reserve::Wait(observed) => state.wait(observed),
            }
        }
    }

    /// Grow so that both sides have at least twice their current usage, and
    /// return the new `end` for `side`.
    ///
    /// Usage is read from the live cursors, which already include the
    /// reservation that triggered growth, so the result always covers it.
    fn grow(&self, side: Side) -> Result<u32, AllocError> {
        let mut mapping = lock(&self.mapping);
        let page_size = PlatformVmOps::page_size();

        let back_used = (self.back.load().next as usize).next_multiple_of(page_size);
        let front_used = (self.front.load().next as usize).next_multiple_of(page_size);
        let total_used = front_used + back_used;

        let old_size = mapping.size();
        let old_center = mapping.center_offset();
        debug_assert!(old_size > 0);
        debug_assert!(side == Side::Front || back_used > 0);

        let back_required = back_used.max(old_center);
        let front_required = front_used.max(old_size - old_center);

        if back_used * 2 > back_required || front_used * 2 > front_required {
            let mut size = old_size * 2;
            while size < back_required + front_required {
                size *= 2;
            }

            let center = if back_used == 0 {
                // Nothing live on the back: keep whatever the back side
                // already maps. A rolled-back back reservation can leave the
                // cursor at 0 after an earlier growth moved the center up.
                back_required
            } else {
                // Keep the back/front usage ratio, page aligned.
                let ratio = (size as u128 * back_used as u128 / total_used as u128) as usize;
                let mut center = ratio & !(page_size - 1);
                if center < back_required {
                    center = back_required;
                }
                if size - center < front_required {
                    center = size - front_required;
                }
                center
            };

            mapping.expand_range(center, size)?;
            self.map.store(mapping.map().as_ptr(), Ordering::Release);
            self.center.store(center, Ordering::Release);
            self.size.store(size, Ordering::Release);

            log::debug!(
                "block pool grew for {side:?}: {old_size} -> {size} bytes, center {old_center} -> {center} \
                 (front used {front_used}, back used {back_used})"
            );
        }

        let end = match side {
            Side::Front => mapping.size() - mapping.center_offset(),
            Side::Back => mapping.center_offset(),
        };
        Ok(cursor(end))
    }

    /// CPU address of `offset`.
    ///
    /// The pointer is valid for as long as the pool lives, even across later
    /// growth.
    #[inline]
    #[must_use]
    pub fn map(&self, offset: i32) -> NonNull<u8> {
        let base = self.map.load(Ordering::Acquire);
        debug_assert!(
            offset >= 0 || offset.unsigned_abs() as usize <= self.center.load(Ordering::Acquire),
            "offset {offset} lies below the mapped back region"
        );
        // Safety: `base` is non-null and every issued offset is inside the
        // window published together with it.
        unsafe { NonNull::new_unchecked(base.offset(offset as isize)) }
    }

    /// Total bytes mapped across both sides. Always a power of two.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Bytes mapped below offset 0.
    #[must_use]
    pub fn center_offset(&self) -> usize {
        self.center.load(Ordering::Acquire)
    }

    /// Bytes handed out from the front.
    #[must_use]
    pub fn front_used(&self) -> usize {
        let s = self.front.load();
        s.next.min(s.end) as usize
    }

    /// Bytes handed out from the back.
    #[must_use]
    pub fn back_used(&self) -> usize {
        let s = self.back.load();
        s.next.min(s.end) as usize
    }

    #[must_use]
    pub fn strategy(&self) -> MappingStrategy {
        lock(&self.mapping).strategy()
    }

    /// Views superseded by growth that are still mapped.
    #[must_use]
    pub fn retired_mappings(&self) -> usize {
        lock(&self.mapping).retired_mappings()
    }
}
