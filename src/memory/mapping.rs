//! A single memory region that only ever grows, in both directions, around
//! a fixed logical origin.
//!
//! Callers address the region with signed offsets relative to that origin
//! ("pool offset 0"). The live window is `[-center_offset, size - center_offset)`.
//! Growing moves `center_offset` and `size` outward but never changes what an
//! already-issued offset refers to.
//!
//! Two backends implement growth, selected once at construction:
//!
//! - [`MappingStrategy::Remap`]: a sparse memfd sized to the full reservation.
//!   Each growth maps a fresh `MAP_SHARED` view of the wider window and
//!   retires the previous view. Retired views alias the same pages and stay
//!   mapped until the `GrowableMapping` is dropped, so pointers taken from
//!   them remain usable by threads that have not yet reloaded the base.
//! - [`MappingStrategy::Pinned`]: one `PROT_NONE` reservation; each growth
//!   commits the new segments adjacent to the old window. The base never
//!   moves.

use std::ptr::NonNull;

use super::error::AllocError;
use super::stats::{self, Counter};
use super::vm::{PlatformVmOps, VmError, VmOps};

/// How a [`GrowableMapping`] obtains more memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingStrategy {
    /// Shared-memory backing, new view per growth. Linux only.
    Remap,
    /// One fixed reservation, committed segment by segment.
    Pinned,
}

impl MappingStrategy {
    /// Whether this strategy can be constructed on the current target.
    #[must_use]
    pub fn is_available(self) -> bool {
        match self {
            Self::Pinned => true,
            Self::Remap => cfg!(all(target_os = "linux", not(any(loom, miri)))),
        }
    }
}

impl Default for MappingStrategy {
    fn default() -> Self {
        if Self::Remap.is_available() {
            Self::Remap
        } else {
            Self::Pinned
        }
    }
}

/// Reserved span on each side of pool offset 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reservation {
    /// Bytes available below offset 0 (negative offsets).
    pub back: usize,
    /// Bytes available at and above offset 0.
    pub front: usize,
}

impl Reservation {
    /// Forward-only reservation of `size` bytes.
    #[must_use]
    pub const fn front_only(size: usize) -> Self {
        Self {
            back: 0,
            front: size,
        }
    }

    /// Reservation split evenly around offset 0.
    #[must_use]
    pub const fn centered(size: usize) -> Self {
        Self {
            back: size / 2,
            front: size - size / 2,
        }
    }

    #[must_use]
    pub const fn total(&self) -> usize {
        self.back + self.front
    }
}

/// Which subsystem counter a mapping charges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MappingKind {
    BlockPool,
    StateTable,
}

impl MappingKind {
    fn counter(self) -> &'static Counter {
        match self {
            Self::BlockPool => &stats::BLOCK_POOL_COMMITTED,
            Self::StateTable => &stats::STATE_TABLE_COMMITTED,
        }
    }

    fn backing_name(self) -> &'static std::ffi::CStr {
        match self {
            Self::BlockPool => c"block pool",
            Self::StateTable => c"state table",
        }
    }
}

trait MappingBackend: Send {
    /// Make pool offsets `[-center, size - center)` accessible and return the
    /// address of pool offset 0. Must not invalidate any address previously
    /// returned while `self` is alive.
    fn expand(&mut self, center: usize, size: usize) -> Result<NonNull<u8>, VmError>;

    /// Views superseded by growth and still mapped.
    fn retired(&self) -> usize;

    /// Separately committed pieces of the live window.
    fn segments(&self) -> usize;
}

#[cfg(all(target_os = "linux", not(any(loom, miri))))]
struct RemapBackend {
    backing: super::vm::SharedBacking,
    reservation: Reservation,
    current: Option<(NonNull<u8>, usize)>,
    retired: Vec<(NonNull<u8>, usize)>,
}

#[cfg(all(target_os = "linux", not(any(loom, miri))))]
// Safety: the backend owns its views; the raw pointers are plain addresses
// handed out to callers that synchronize through the owning pool.
unsafe impl Send for RemapBackend {}

#[cfg(all(target_os = "linux", not(any(loom, miri))))]
impl RemapBackend {
    fn new(kind: MappingKind, reservation: Reservation) -> Result<Self, VmError> {
        let backing = super::vm::SharedBacking::new(kind.backing_name(), reservation.total())?;
        Ok(Self {
            backing,
            reservation,
            current: None,
            retired: Vec::new(),
        })
    }
}

#[cfg(all(target_os = "linux", not(any(loom, miri))))]
impl MappingBackend for RemapBackend {
    fn expand(&mut self, center: usize, size: usize) -> Result<NonNull<u8>, VmError> {
        debug_assert!(self.backing.size() >= self.reservation.total());
        let view = self.backing.map(self.reservation.back - center, size)?;
        if let Some(old) = self.current.replace((view, size)) {
            // Other threads may still be reading through the old view.
            self.retired.push(old);
            stats::RETIRED_MAPPINGS.add(1);
        }
        // Safety: center <= size, so the result stays inside the new view.
        Ok(unsafe { view.add(center) })
    }

    fn retired(&self) -> usize {
        self.retired.len()
    }

    fn segments(&self) -> usize {
        usize::from(self.current.is_some())
    }
}

#[cfg(all(target_os = "linux", not(any(loom, miri))))]
impl Drop for RemapBackend {
    fn drop(&mut self) {
        for (view, size) in self.retired.drain(..).chain(self.current.take()) {
            // Safety: dropping the mapping means no borrower is left.
            drop(unsafe { super::vm::SharedBacking::unmap(view, size) });
        }
    }
}

struct PinnedBackend {
    base: NonNull<u8>,
    reservation: Reservation,
    /// Committed window in reservation coordinates.
    lo: usize,
    hi: usize,
    segments: usize,
}

// Safety: the backend owns the reservation; see RemapBackend.
unsafe impl Send for PinnedBackend {}

impl PinnedBackend {
    fn new(reservation: Reservation) -> Result<Self, VmError> {
        // Safety: FFI call to reserve address space.
        let base = unsafe { PlatformVmOps::reserve(reservation.total())? };
        Ok(Self {
            base,
            reservation,
            lo: reservation.back,
            hi: reservation.back,
            segments: 0,
        })
    }

    fn commit(&mut self, start: usize, end: usize) -> Result<(), VmError> {
        if start >= end {
            return Ok(());
        }
        // Safety: start < end <= reservation.total(), inside our reservation.
        unsafe {
            let ptr = NonNull::new_unchecked(self.base.as_ptr().add(start));
            PlatformVmOps::commit(ptr, end - start)?;
        }
        self.segments += 1;
        Ok(())
    }
}

impl MappingBackend for PinnedBackend {
    fn expand(&mut self, center: usize, size: usize) -> Result<NonNull<u8>, VmError> {
        let lo = self.reservation.back - center;
        let hi = lo + size;
        debug_assert!(lo <= self.lo && hi >= self.hi, "pinned window may only grow");

        if self.lo == self.hi {
            self.commit(lo, hi)?;
        } else {
            self.commit(lo, self.lo)?;
            self.commit(self.hi, hi)?;
        }
        self.lo = lo;
        self.hi = hi;

        // Safety: reservation.back <= reservation.total().
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.reservation.back)) })
    }

    fn retired(&self) -> usize {
        0
    }

    fn segments(&self) -> usize {
        self.segments
    }
}

impl Drop for PinnedBackend {
    fn drop(&mut self) {
        // Safety: dropping the mapping means no borrower is left.
        drop(unsafe { PlatformVmOps::release(self.base, self.reservation.total()) });
    }
}

/// A growable, address-stable memory region.
///
/// Dropping the mapping unmaps every view it ever created and releases the
/// backing; it must only happen once nothing reads the region any more.
pub struct GrowableMapping {
    backend: Box<dyn MappingBackend>,
    strategy: MappingStrategy,
    kind: MappingKind,
    reservation: Reservation,
    map: NonNull<u8>,
    center: usize,
    size: usize,
}

// Safety: GrowableMapping owns its backend, which is Send; the map pointer is
// an address into memory owned by that backend.
unsafe impl Send for GrowableMapping {}

impl GrowableMapping {
    /// Create a mapping and make its first `initial_size` bytes (all at
    /// non-negative offsets) accessible.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::Init`] if the backing cannot be created or the
    /// initial window cannot be mapped, and
    /// [`AllocError::OutOfReservedSpace`] if `initial_size` exceeds the
    /// forward reservation.
    ///
    /// # Panics
    ///
    /// Panics if either side of `reservation` is not page aligned.
    pub fn new(
        initial_size: usize,
        reservation: Reservation,
        strategy: MappingStrategy,
    ) -> Result<Self, AllocError> {
        Self::with_kind(MappingKind::BlockPool, initial_size, reservation, strategy)
    }

    pub(crate) fn with_kind(
        kind: MappingKind,
        initial_size: usize,
        reservation: Reservation,
        strategy: MappingStrategy,
    ) -> Result<Self, AllocError> {
        let page_size = PlatformVmOps::page_size();
        assert!(
            reservation.back.is_multiple_of(page_size) && reservation.front.is_multiple_of(page_size),
            "reservation {reservation:?} is not page aligned"
        );
        assert!(initial_size > 0, "GrowableMapping needs a non-zero initial size");
        let initial_size = initial_size.next_multiple_of(page_size);
        if initial_size > reservation.front {
            return Err(AllocError::OutOfReservedSpace {
                requested: initial_size,
                reserved: reservation.front,
            });
        }

        let mut backend: Box<dyn MappingBackend> = match strategy {
            MappingStrategy::Pinned => {
                Box::new(PinnedBackend::new(reservation).map_err(AllocError::Init)?)
            }
            #[cfg(all(target_os = "linux", not(any(loom, miri))))]
            MappingStrategy::Remap => {
                Box::new(RemapBackend::new(kind, reservation).map_err(AllocError::Init)?)
            }
            #[cfg(not(all(target_os = "linux", not(any(loom, miri)))))]
            MappingStrategy::Remap => {
                return Err(AllocError::Init(VmError::InitializationFailed(
                    "remap strategy needs memfd support".to_string(),
                )));
            }
        };

        let map = backend.expand(0, initial_size).map_err(AllocError::Init)?;
        stats::TOTAL_RESERVED.add(reservation.total());
        stats::TOTAL_COMMITTED.add(initial_size);
        kind.counter().add(initial_size);

        Ok(Self {
            backend,
            strategy,
            kind,
            reservation,
            map,
            center: 0,
            size: initial_size,
        })
    }

    /// Grow forward to `new_size` bytes, keeping the current center.
    ///
    /// # Errors
    ///
    /// See [`expand_range`](Self::expand_range).
    pub fn expand_to(&mut self, new_size: usize) -> Result<(), AllocError> {
        self.expand_range(self.center, new_size)
    }

    /// Grow to `new_size` bytes of which `center_offset` lie below offset 0.
    ///
    /// Neither side may shrink. On failure nothing observable changes.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::OutOfReservedSpace`] if either side would leave
    /// its reservation and [`AllocError::Vm`] if the OS refuses to map or
    /// commit the new window.
    ///
    /// # Panics
    ///
    /// Panics if the request would shrink either side, or if the new window
    /// is not page aligned.
    pub fn expand_range(&mut self, center_offset: usize, new_size: usize) -> Result<(), AllocError> {
        assert!(
            center_offset >= self.center && new_size >= center_offset,
            "GrowableMapping::expand_range would shrink the back side"
        );
        assert!(
            new_size - center_offset >= self.size - self.center,
            "GrowableMapping::expand_range would shrink the front side"
        );
        let page_size = PlatformVmOps::page_size();
        assert!(
            center_offset.is_multiple_of(page_size) && new_size.is_multiple_of(page_size),
            "GrowableMapping::expand_range window ({center_offset}, {new_size}) is not page aligned"
        );

        if center_offset > self.reservation.back {
            return Err(AllocError::OutOfReservedSpace {
                requested: center_offset,
                reserved: self.reservation.back,
            });
        }
        if new_size - center_offset > self.reservation.front {
            return Err(AllocError::OutOfReservedSpace {
                requested: new_size - center_offset,
                reserved: self.reservation.front,
            });
        }

        let map = self.backend.expand(center_offset, new_size).map_err(|e| {
            log::warn!("{:?} mapping failed to grow to {new_size} bytes: {e}", self.kind);
            AllocError::Vm(e)
        })?;

        let delta = new_size - self.size;
        stats::TOTAL_COMMITTED.add(delta);
        self.kind.counter().add(delta);

        log::debug!(
            "{:?} mapping grew {} -> {} bytes (center {} -> {}, {:?})",
            self.kind,
            self.size,
            new_size,
            self.center,
            center_offset,
            self.strategy
        );

        self.map = map;
        self.center = center_offset;
        self.size = new_size;
        Ok(())
    }

    /// Address of pool offset 0 in the current view.
    #[inline]
    #[must_use]
    pub fn map(&self) -> NonNull<u8> {
        self.map
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn center_offset(&self) -> usize {
        self.center
    }

    #[must_use]
    pub fn strategy(&self) -> MappingStrategy {
        self.strategy
    }

    #[must_use]
    pub fn reservation(&self) -> Reservation {
        self.reservation
    }

    /// Views kept alive after being superseded by growth.
    #[must_use]
    pub fn retired_mappings(&self) -> usize {
        self.backend.retired()
    }

    /// Separately committed pieces of the live window.
    #[must_use]
    pub fn segments(&self) -> usize {
        self.backend.segments()
    }
}

impl Drop for GrowableMapping {
    fn drop(&mut self) {
        stats::sub_saturating(&stats::RETIRED_MAPPINGS, self.backend.retired());
        stats::sub_saturating(&stats::TOTAL_RESERVED, self.reservation.total());
        stats::sub_saturating(&stats::TOTAL_COMMITTED, self.size);
        stats::sub_saturating(self.kind.counter(), self.size);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    fn strategies() -> Vec<MappingStrategy> {
        [MappingStrategy::Remap, MappingStrategy::Pinned]
            .into_iter()
            .filter(|s| s.is_available())
            .collect()
    }

    #[test]
    fn test_initial_window_is_writable() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = PlatformVmOps::page_size();
        for strategy in strategies() {
            let m = GrowableMapping::with_kind(
                MappingKind::BlockPool,
                page,
                Reservation::centered(4 * MIB),
                strategy,
            )
            .unwrap();
            assert_eq!(m.size(), page);
            assert_eq!(m.center_offset(), 0);
            // Safety: Test code; [0, page) is mapped.
            unsafe {
                *m.map().as_ptr() = 1;
                *m.map().as_ptr().add(page - 1) = 2;
            }
        }
    }

    #[test]
    fn test_public_constructor_grows_forward() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = PlatformVmOps::page_size();
        let mut m = GrowableMapping::new(page, Reservation::front_only(MIB), MappingStrategy::default())
            .unwrap();
        m.expand_to(page * 3).unwrap();
        assert_eq!(m.size(), page * 3);
        assert_eq!(m.reservation(), Reservation::front_only(MIB));
        // Safety: Test code; the last byte of the window is mapped.
        unsafe { *m.map().as_ptr().add(page * 3 - 1) = 9 };
    }

    #[test]
    fn test_initial_size_rounds_to_page() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = PlatformVmOps::page_size();
        let m = GrowableMapping::with_kind(
            MappingKind::StateTable,
            1,
            Reservation::front_only(MIB),
            MappingStrategy::Pinned,
        )
        .unwrap();
        assert_eq!(m.size(), page);
    }

    #[test]
    fn test_offsets_survive_growth() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = PlatformVmOps::page_size();
        for strategy in strategies() {
            let mut m = GrowableMapping::with_kind(
                MappingKind::BlockPool,
                page,
                Reservation::centered(4 * MIB),
                strategy,
            )
            .unwrap();
            let old_ptr = m.map().as_ptr();
            // Safety: Test code.
            unsafe { old_ptr.write(0xC3) };

            m.expand_range(page, page * 4).unwrap();
            assert_eq!(m.center_offset(), page);
            assert_eq!(m.size(), page * 4);

            // Safety: Test code; offset 0 and -page are both inside the window.
            unsafe {
                assert_eq!(*m.map().as_ptr(), 0xC3, "{strategy:?} lost data");
                *m.map().as_ptr().sub(page) = 0x11;
                // The pre-growth pointer is still valid and aliases the same byte.
                assert_eq!(*old_ptr, 0xC3);
                *old_ptr = 0x3C;
                assert_eq!(*m.map().as_ptr(), 0x3C);
            }
        }
    }

    #[test]
    fn test_remap_retires_old_views() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        if !MappingStrategy::Remap.is_available() {
            return;
        }
        let page = PlatformVmOps::page_size();
        let mut m = GrowableMapping::with_kind(
            MappingKind::BlockPool,
            page,
            Reservation::front_only(MIB),
            MappingStrategy::Remap,
        )
        .unwrap();
        m.expand_to(page * 2).unwrap();
        m.expand_to(page * 4).unwrap();
        assert_eq!(m.retired_mappings(), 2);
        assert_eq!(m.segments(), 1);
    }

    #[test]
    fn test_pinned_never_moves() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = PlatformVmOps::page_size();
        let mut m = GrowableMapping::with_kind(
            MappingKind::BlockPool,
            page,
            Reservation::centered(MIB),
            MappingStrategy::Pinned,
        )
        .unwrap();
        let base = m.map();
        m.expand_range(page, page * 4).unwrap();
        m.expand_range(page * 2, page * 8).unwrap();
        assert_eq!(m.map(), base);
        assert_eq!(m.retired_mappings(), 0);
        // Initial window, then back+front pieces for each growth.
        assert_eq!(m.segments(), 5);
    }

    #[test]
    fn test_growth_past_reservation_fails_cleanly() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = PlatformVmOps::page_size();
        for strategy in strategies() {
            let mut m = GrowableMapping::with_kind(
                MappingKind::BlockPool,
                page,
                Reservation::front_only(page * 2),
                strategy,
            )
            .unwrap();
            match m.expand_to(page * 4) {
                Err(AllocError::OutOfReservedSpace { requested, reserved }) => {
                    assert_eq!(requested, page * 4);
                    assert_eq!(reserved, page * 2);
                }
                other => panic!("expected OutOfReservedSpace, got {other:?}"),
            }
            assert_eq!(m.size(), page, "failed growth must not change the size");
            assert!(matches!(
                m.expand_range(page, page * 2),
                Err(AllocError::OutOfReservedSpace { .. })
            ));
        }
    }

    #[test]
    fn test_initial_size_over_reservation() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = PlatformVmOps::page_size();
        let r = GrowableMapping::with_kind(
            MappingKind::BlockPool,
            page * 4,
            Reservation::front_only(page * 2),
            MappingStrategy::Pinned,
        );
        assert!(matches!(r, Err(AllocError::OutOfReservedSpace { .. })));
    }

    #[test]
    #[should_panic(expected = "would shrink")]
    fn test_shrink_is_rejected() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let page = PlatformVmOps::page_size();
        let mut m = GrowableMapping::with_kind(
            MappingKind::BlockPool,
            page * 2,
            Reservation::front_only(MIB),
            MappingStrategy::Pinned,
        )
        .unwrap();
        drop(m.expand_to(page));
    }

    #[test]
    fn test_stats_follow_lifecycle() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let page = PlatformVmOps::page_size();
        let before = stats::STATE_TABLE_COMMITTED.get();
        {
            let mut m = GrowableMapping::with_kind(
                MappingKind::StateTable,
                page,
                Reservation::front_only(MIB),
                MappingStrategy::Pinned,
            )
            .unwrap();
            m.expand_to(page * 4).unwrap();
            assert_eq!(stats::STATE_TABLE_COMMITTED.get(), before + page * 4);
        }
        assert_eq!(stats::STATE_TABLE_COMMITTED.get(), before);
    }
}
