//! Append-only table of state records, addressed by stable index.
//!
//! Records live in their own forward-only [`GrowableMapping`] and are handed
//! out in runs by the same bump-and-grow cursor the block pool uses, counted
//! in records instead of bytes. A record never moves once assigned.

use std::mem::size_of;
use std::ptr::NonNull;

use super::block_state::{AtomicBlockState, BlockState, Reserve};
use super::error::AllocError;
use super::free_list::{EMPTY, FreeListLinks};
use super::mapping::{GrowableMapping, MappingKind, MappingStrategy, Reservation};
use super::vm::{PlatformVmOps, VmOps};
use crate::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, Ordering};
use crate::sync::{Mutex, lock};

/// One state record.
///
/// The fields are atomics because free-list traversal reads `next` of
/// records that may concurrently be reallocated. Ordering between a record's
/// contents and its availability comes from the free list head, so all
/// field accesses are relaxed.
#[repr(C)]
pub struct StateEntry {
    next: AtomicU32,
    idx: AtomicU32,
    offset: AtomicI32,
    alloc_size: AtomicU32,
}

impl StateEntry {
    fn new(idx: u32) -> Self {
        Self {
            next: AtomicU32::new(EMPTY),
            idx: AtomicU32::new(idx),
            offset: AtomicI32::new(0),
            alloc_size: AtomicU32::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn idx(&self) -> u32 {
        self.idx.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn offset(&self) -> i32 {
        self.offset.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn alloc_size(&self) -> u32 {
        self.alloc_size.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set(&self, offset: i32, alloc_size: u32) {
        self.offset.store(offset, Ordering::Relaxed);
        self.alloc_size.store(alloc_size, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_alloc_size(&self, alloc_size: u32) {
        self.alloc_size.store(alloc_size, Ordering::Relaxed);
    }
}

const ENTRY_SIZE: usize = size_of::<StateEntry>();

#[cfg(not(loom))]
const _: () = assert!(ENTRY_SIZE == 16);

pub struct StateTable {
    cursor: AtomicBlockState,
    map: AtomicPtr<StateEntry>,
    mapping: Mutex<GrowableMapping>,
    max_entries: u32,
}

impl StateTable {
    /// Create a table with room for at least `initial_entries` records that
    /// can grow to `max_entries`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::Init`] if the backing cannot be created.
    ///
    /// # Panics
    ///
    /// Panics if `max_entries` is zero or `initial_entries > max_entries`.
    pub fn new(
        initial_entries: u32,
        max_entries: u32,
        strategy: MappingStrategy,
    ) -> Result<Self, AllocError> {
        assert!(
            max_entries > 0 && max_entries < EMPTY && initial_entries <= max_entries,
            "StateTable sized {initial_entries}/{max_entries} entries"
        );
        let page_size = PlatformVmOps::page_size();
        let reserved = (max_entries as usize * ENTRY_SIZE).next_multiple_of(page_size);
        let initial = (initial_entries.max(1) as usize * ENTRY_SIZE)
            .next_power_of_two()
            .clamp(page_size, reserved);

        let mapping = GrowableMapping::with_kind(
            MappingKind::StateTable,
            initial,
            Reservation::front_only(reserved),
            strategy,
        )?;
        let end = Self::entries_in(&mapping, max_entries);

        Ok(Self {
            cursor: AtomicBlockState::new(BlockState { next: 0, end }),
            map: AtomicPtr::new(mapping.map().as_ptr().cast()),
            mapping: Mutex::new(mapping),
            max_entries,
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn entries_in(mapping: &GrowableMapping, max_entries: u32) -> u32 {
        (mapping.size() / ENTRY_SIZE).min(max_entries as usize) as u32
    }

    /// Reserve `count` fresh consecutive records and return the first index.
    /// Each record starts out with its own index, offset 0 and size 0.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::OutOfTableSpace`] once `max_entries` would be
    /// exceeded, or [`AllocError::Vm`] if growth fails.
    pub fn add(&self, count: u32) -> Result<u32, AllocError> {
        assert!(count > 0, "StateTable::add of zero entries");
        loop {
            match self.cursor.reserve(count) {
                Reserve::Fits(first) => {
                    self.init_entries(first, count);
                    return Ok(first);
                }
                Reserve::MustGrow(before) => {
                    let next = before.next + count;
                    let mut end = before.end;
                    while end < next {
                        match self.grow() {
                            Ok(new_end) => end = new_end,
                            Err(e) => {
                                self.cursor.publish(before);
                                return Err(e);
                            }
                        }
                    }
                    self.cursor.publish(BlockState { next, end });
                    self.init_entries(before.next, count);
                    return Ok(before.next);
                }
                Reserve::Wait(observed) => self.cursor.wait(observed),
            }
        }
    }

    fn init_entries(&self, first: u32, count: u32) {
        let base = self.map.load(Ordering::Acquire);
        for idx in first..first + count {
            // Safety: the cursor gave us exclusive ownership of these slots
            // and they lie inside the published window.
            unsafe { base.add(idx as usize).write(StateEntry::new(idx)) };
        }
    }

    /// Double the table until it covers the live cursor, and return the new
    /// end in records.
    fn grow(&self) -> Result<u32, AllocError> {
        let mut mapping = lock(&self.mapping);
        let used = self.cursor.load().next as usize * ENTRY_SIZE;
        let reserved = mapping.reservation().front;
        let old_size = mapping.size();

        if used * 2 > old_size {
            let mut size = old_size * 2;
            while size < used * 2 {
                size *= 2;
            }
            if size > reserved {
                if used > reserved || used > self.max_entries as usize * ENTRY_SIZE {
                    log::warn!(
                        "state table exhausted: {} of {} entries requested",
                        used / ENTRY_SIZE,
                        self.max_entries
                    );
                    return Err(AllocError::OutOfTableSpace {
                        requested: used / ENTRY_SIZE,
                        capacity: self.max_entries as usize,
                    });
                }
                size = reserved;
            }
            if size > old_size {
                mapping.expand_to(size)?;
                self.map.store(mapping.map().as_ptr().cast(), Ordering::Release);
                log::trace!(
                    "state table grew to {} entries",
                    Self::entries_in(&mapping, self.max_entries)
                );
            }
        }

        let end = Self::entries_in(&mapping, self.max_entries);
        if (end as usize) * ENTRY_SIZE < used {
            return Err(AllocError::OutOfTableSpace {
                requested: used / ENTRY_SIZE,
                capacity: self.max_entries as usize,
            });
        }
        Ok(end)
    }

    /// The record at `idx`. Only valid for indices returned by [`add`](Self::add).
    #[inline]
    #[must_use]
    pub fn get(&self, idx: u32) -> &StateEntry {
        debug_assert!(
            idx < self.cursor.load().end,
            "state index {idx} was never added"
        );
        let base = self.map.load(Ordering::Acquire);
        // Safety: idx was handed out by add(), so its slot is initialized and
        // mapped for the life of the table.
        unsafe { &*base.add(idx as usize) }
    }

    /// Number of records handed out.
    #[must_use]
    pub fn len(&self) -> usize {
        let s = self.cursor.load();
        s.next.min(s.end) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.max_entries
    }

    /// Records currently mapped.
    #[must_use]
    pub fn mapped_entries(&self) -> u32 {
        Self::entries_in(&lock(&self.mapping), self.max_entries)
    }

    /// Address of record 0 in the newest view.
    #[must_use]
    pub fn map(&self) -> NonNull<StateEntry> {
        // Safety: the table pointer is never null after construction.
        unsafe { NonNull::new_unchecked(self.map.load(Ordering::Acquire)) }
    }
}

impl FreeListLinks for StateTable {
    #[inline]
    fn link(&self, idx: u32) -> &AtomicU32 {
        &self.get(idx).next
    }
}
