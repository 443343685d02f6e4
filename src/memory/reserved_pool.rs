//! A fixed set of same-size states set aside from a [`StatePool`].

use super::error::AllocError;
use super::free_list::{EMPTY, FreeList};
use super::state_pool::{MIN_STATE_SIZE, State, StatePool};

/// `count` states of one size, allocated up front so that later `alloc`
/// calls cannot fail on growth. Dropping the reservation hands its states
/// back to the parent pool; states still taken at that point are leaked.
pub struct ReservedStatePool<'a> {
    pool: &'a StatePool,
    free_list: FreeList,
    size: u32,
    /// Bucket size every reserved state was rounded to.
    alloc_size: u32,
    count: u32,
}

impl<'a> ReservedStatePool<'a> {
    /// # Errors
    ///
    /// Returns the parent pool's error if it cannot supply `count` states;
    /// states obtained before the failure go back to the parent.
    pub fn new(pool: &'a StatePool, count: u32, size: u32) -> Result<Self, AllocError> {
        assert!(size > 0, "ReservedStatePool of zero-size states");
        let mut reserved = Self {
            pool,
            free_list: FreeList::new(),
            size,
            alloc_size: size.max(MIN_STATE_SIZE).next_power_of_two(),
            count: 0,
        };
        for _ in 0..count {
            let state = pool.alloc(size, 64.min(size.next_power_of_two()))?;
            debug_assert_eq!(state.alloc_size, reserved.alloc_size);
            reserved.free_list.push(pool.table(), state.idx, 1);
            reserved.count += 1;
        }
        Ok(reserved)
    }

    /// Take a state, or `None` once all of them are out.
    #[must_use]
    pub fn alloc(&self) -> Option<State> {
        let idx = self.free_list.pop(self.pool.table())?;
        Some(self.pool.state_at(idx))
    }

    /// Put back a state taken from this reservation.
    ///
    /// # Panics
    ///
    /// Panics if `state` is not a record of the parent pool with this
    /// reservation's size.
    pub fn free(&self, state: State) {
        assert!(
            state.idx != EMPTY
                && (state.idx as usize) < self.pool.table().len()
                && state.alloc_size == self.alloc_size,
            "state {state:?} does not belong to this reservation"
        );
        let entry = self.pool.table().get(state.idx);
        assert!(
            entry.offset() == state.offset && entry.alloc_size() == state.alloc_size,
            "state {state:?} does not match its pool record"
        );
        self.free_list.push(self.pool.table(), state.idx, 1);
    }

    /// Size requested for each state.
    #[must_use]
    pub fn state_size(&self) -> u32 {
        self.size
    }

    /// Number of states set aside.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }
}

impl Drop for ReservedStatePool<'_> {
    fn drop(&mut self) {
        let mut returned = 0;
        while let Some(idx) = self.free_list.pop(self.pool.table()) {
            self.pool.free(self.pool.state_at(idx));
            returned += 1;
        }
        if returned != self.count {
            log::warn!(
                "reserved pool dropped with {} of {} states still taken",
                self.count - returned,
                self.count
            );
        }
    }
}
