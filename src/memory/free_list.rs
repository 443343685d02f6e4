//! Lock-free LIFO free lists.
//!
//! [`FreeList`] links indices of records that live in an append-only table;
//! the link of a free record is stored in the record itself. [`PtrFreeList`]
//! links page-aligned memory blocks directly through their first word.
//!
//! Both pair the head with a counter in one atomic word. Every successful
//! push or pop bumps the counter, so a CAS prepared against a head that was
//! popped and pushed back in the meantime fails instead of installing a
//! stale `next`.

use std::ptr::NonNull;

use crate::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Head value of an empty [`FreeList`].
pub const EMPTY: u32 = u32::MAX;

/// Storage for the `next` links of a [`FreeList`].
pub trait FreeListLinks {
    /// The link slot of record `idx`.
    fn link(&self, idx: u32) -> &AtomicU32;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Head {
    offset: u32,
    count: u32,
}

impl Head {
    const EMPTY: Self = Self {
        offset: EMPTY,
        count: 0,
    };

    #[inline]
    fn pack(self) -> u64 {
        (u64::from(self.count) << 32) | u64::from(self.offset)
    }

    #[inline]
    fn unpack(word: u64) -> Self {
        Self {
            offset: word as u32,
            count: (word >> 32) as u32,
        }
    }
}

/// Index-linked Treiber stack.
pub struct FreeList {
    head: AtomicU64,
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FreeList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let head = Head::unpack(self.head.load(Ordering::Relaxed));
        f.debug_struct("FreeList")
            .field("head", &head.offset)
            .field("count", &head.count)
            .finish()
    }
}

impl FreeList {
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: AtomicU64::new(Head::EMPTY.pack()),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        Head::unpack(self.head.load(Ordering::Acquire)).offset == EMPTY
    }

    /// Push records `first..first + count` as one run. They come back out of
    /// [`pop`](Self::pop) in ascending order.
    ///
    /// The records must not be on any list.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero or the run would reach [`EMPTY`].
    pub fn push<L: FreeListLinks + ?Sized>(&self, links: &L, first: u32, count: u32) {
        assert!(count > 0, "FreeList::push of an empty run");
        let last = first
            .checked_add(count - 1)
            .filter(|&last| last != EMPTY)
            .expect("FreeList::push run overflows the index space");

        for idx in first..last {
            links.link(idx).store(idx + 1, Ordering::Relaxed);
        }

        let mut current = self.head.load(Ordering::Relaxed);
        loop {
            let old = Head::unpack(current);
            links.link(last).store(old.offset, Ordering::Relaxed);
            let new = Head {
                offset: first,
                count: old.count.wrapping_add(1),
            };
            match self
                .head
                .compare_exchange_weak(current, new.pack(), Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Pop the most recently pushed record.
    pub fn pop<L: FreeListLinks + ?Sized>(&self, links: &L) -> Option<u32> {
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let old = Head::unpack(current);
            if old.offset == EMPTY {
                return None;
            }
            // May read a link rewritten by a racing pop/push; the counter
            // makes the CAS below fail in that case.
            let next = links.link(old.offset).load(Ordering::Relaxed);
            let new = Head {
                offset: next,
                count: old.count.wrapping_add(1),
            };
            match self
                .head
                .compare_exchange_weak(current, new.pack(), Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => return Some(old.offset),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Alignment every [`PtrFreeList`] element must have. The low bits of the
/// head word below this alignment carry the counter.
pub const PTR_FREE_LIST_ALIGN: usize = 4096;

const PTR_COUNT_MASK: usize = PTR_FREE_LIST_ALIGN - 1;

/// Pointer-linked Treiber stack of page-aligned blocks.
///
/// The link lives in the first `usize` of each free block. The head word
/// packs the block address with a 12-bit counter in its low bits.
pub struct PtrFreeList {
    head: AtomicUsize,
}

impl Default for PtrFreeList {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn link_of(block: usize) -> *const AtomicUsize {
    block as *const AtomicUsize
}

impl PtrFreeList {
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) & !PTR_COUNT_MASK == 0
    }

    /// Push `block`.
    ///
    /// # Safety
    ///
    /// `block` must be aligned to [`PTR_FREE_LIST_ALIGN`], valid for writes
    /// of a `usize`, not on any list, and must stay mapped for as long as
    /// this list is used. Its first word is only accessed atomically while
    /// it is on the list.
    pub unsafe fn push(&self, block: NonNull<u8>) {
        let addr = block.as_ptr() as usize;
        assert!(
            addr & PTR_COUNT_MASK == 0,
            "PtrFreeList::push of unaligned block {addr:#x}"
        );

        let mut current = self.head.load(Ordering::Relaxed);
        loop {
            // Safety: the caller hands us a writable, aligned block.
            unsafe { (*link_of(addr)).store(current & !PTR_COUNT_MASK, Ordering::Relaxed) };
            let new = addr | (current.wrapping_add(1) & PTR_COUNT_MASK);
            match self
                .head
                .compare_exchange_weak(current, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Pop the most recently pushed block.
    pub fn pop(&self) -> Option<NonNull<u8>> {
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let addr = current & !PTR_COUNT_MASK;
            if addr == 0 {
                return None;
            }
            // Safety: pushed blocks stay mapped for the life of the list.
            let next = unsafe { (*link_of(addr)).load(Ordering::Relaxed) };
            let new = next | (current.wrapping_add(1) & PTR_COUNT_MASK);
            match self
                .head
                .compare_exchange_weak(current, new, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => return NonNull::new(addr as *mut u8),
                Err(actual) => current = actual,
            }
        }
    }
}
