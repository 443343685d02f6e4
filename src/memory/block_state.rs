//! Packed `next`/`end` bump cursor shared by the block pool, the state table
//! and the state pool buckets.
//!
//! Both halves live in one `AtomicU64` (`next` in the low 32 bits), so a
//! single `fetch_add` reserves space and reports the bound it was checked
//! against. The thread whose reservation straddles `end` owns growth; any
//! thread that lands wholly past `end` parks until the owner publishes new
//! bounds.

use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::{Condvar, Mutex, lock};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BlockState {
    pub next: u32,
    pub end: u32,
}

impl BlockState {
    pub const EMPTY: Self = Self { next: 0, end: 0 };

    #[inline]
    fn pack(self) -> u64 {
        (u64::from(self.end) << 32) | u64::from(self.next)
    }

    #[inline]
    fn unpack(word: u64) -> Self {
        Self {
            next: word as u32,
            end: (word >> 32) as u32,
        }
    }
}

/// Outcome of one reservation attempt.
#[derive(Debug)]
pub(crate) enum Reserve {
    /// `[offset, offset + amount)` is ours.
    Fits(u32),
    /// We crossed `end`: grow, then [`AtomicBlockState::publish`] new bounds.
    /// Carries the pre-add state.
    MustGrow(BlockState),
    /// Someone else is growing. Carries the pre-add state for
    /// [`AtomicBlockState::wait`].
    Wait(BlockState),
}

pub(crate) struct AtomicBlockState {
    word: AtomicU64,
    gate: Mutex<()>,
    published: Condvar,
}

impl AtomicBlockState {
    pub fn new(state: BlockState) -> Self {
        Self {
            word: AtomicU64::new(state.pack()),
            gate: Mutex::new(()),
            published: Condvar::new(),
        }
    }

    #[inline]
    pub fn load(&self) -> BlockState {
        BlockState::unpack(self.word.load(Ordering::Acquire))
    }

    /// Bump `next` by `amount` and classify the result.
    #[inline]
    pub fn reserve(&self, amount: u32) -> Reserve {
        let state = BlockState::unpack(self.word.fetch_add(u64::from(amount), Ordering::AcqRel));
        debug_assert!(
            state.next.checked_add(amount).is_some(),
            "block cursor overflowed into its end field"
        );
        if u64::from(state.next) + u64::from(amount) <= u64::from(state.end) {
            Reserve::Fits(state.next)
        } else if state.next <= state.end {
            Reserve::MustGrow(state)
        } else {
            Reserve::Wait(state)
        }
    }

    /// Replace the cursor and wake every parked thread. Returns the cursor
    /// that was replaced.
    ///
    /// Publishing the pre-add state handed out by [`Reserve::MustGrow`]
    /// undoes a failed growth: `next` drops back inside `end` and waiters
    /// retry on their own.
    pub fn publish(&self, new: BlockState) -> BlockState {
        let old = BlockState::unpack(self.word.swap(new.pack(), Ordering::AcqRel));
        let _gate = lock(&self.gate);
        self.published.notify_all();
        old
    }

    /// Park until the bounds observed in `observed` have been replaced.
    pub fn wait(&self, observed: BlockState) {
        let mut gate = lock(&self.gate);
        loop {
            let current = self.load();
            if current.end != observed.end || current.next <= current.end {
                return;
            }
            gate = match self.published.wait(gate) {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::Arc;
    use crate::sync::thread;

    #[test]
    fn test_pack_roundtrip_keeps_halves_apart() {
        let s = BlockState {
            next: 0xFFFF_FFF0,
            end: 7,
        };
        assert_eq!(BlockState::unpack(s.pack()), s);
    }

    #[test]
    fn test_reserve_classification() {
        let cursor = AtomicBlockState::new(BlockState { next: 0, end: 64 });
        assert!(matches!(cursor.reserve(32), Reserve::Fits(0)));
        assert!(matches!(cursor.reserve(32), Reserve::Fits(32)));
        match cursor.reserve(32) {
            Reserve::MustGrow(s) => assert_eq!(s, BlockState { next: 64, end: 64 }),
            other => panic!("expected MustGrow, got {other:?}"),
        }
        match cursor.reserve(32) {
            Reserve::Wait(s) => assert_eq!(s, BlockState { next: 96, end: 64 }),
            other => panic!("expected Wait, got {other:?}"),
        }
    }

    #[test]
    fn test_straddling_reservation_must_grow() {
        let cursor = AtomicBlockState::new(BlockState { next: 48, end: 64 });
        assert!(matches!(cursor.reserve(32), Reserve::MustGrow(_)));
    }

    #[test]
    fn test_publish_restores_after_failure() {
        let cursor = AtomicBlockState::new(BlockState { next: 64, end: 64 });
        let Reserve::MustGrow(before) = cursor.reserve(16) else {
            panic!("expected MustGrow");
        };
        cursor.publish(before);
        assert_eq!(cursor.load(), BlockState { next: 64, end: 64 });
        // Nobody parks on a restored cursor.
        cursor.wait(BlockState { next: 80, end: 64 });
    }

    #[test]
    fn test_waiter_wakes_on_publish() {
        let cursor = Arc::new(AtomicBlockState::new(BlockState { next: 0, end: 0 }));
        let Reserve::MustGrow(grower) = cursor.reserve(8) else {
            panic!("first reservation must grow");
        };

        let c = cursor.clone();
        let waiter = thread::spawn(move || {
            loop {
                match c.reserve(8) {
                    Reserve::Fits(offset) => return offset,
                    Reserve::Wait(observed) => c.wait(observed),
                    Reserve::MustGrow(_) => panic!("only the first thread grows"),
                }
            }
        });

        thread::yield_now();
        cursor.publish(BlockState {
            next: grower.next + 8,
            end: 64,
        });
        let offset = waiter.join().unwrap();
        assert!(offset >= 8 && offset < 64);
    }
}
