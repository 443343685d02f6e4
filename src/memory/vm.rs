use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum VmError {
    ReservationFailed(std::io::Error),
    CommitFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
    InitializationFailed(String),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::ReservationFailed(e) => write!(f, "VM reservation failed: {e}"),
            VmError::CommitFailed(e) => write!(f, "VM commit failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "VM release failed: {e}"),
            VmError::InitializationFailed(msg) => write!(f, "VM initialization failed: {msg}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::ReservationFailed(e)
            | VmError::CommitFailed(e)
            | VmError::ReleaseFailed(e) => Some(e),
            VmError::InitializationFailed(_) => None,
        }
    }
}

/// Abstract interface for virtual memory operations.
pub(crate) trait VmOps {
    /// Reserve address space without committing physical pages.
    /// Returns a pointer to the start of the reserved range.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Commit (back with physical pages) a range within a reservation.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformVmOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVmOps, VmError, VmOps};
    use std::io;

    impl VmOps for PlatformVmOps {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap. PROT_NONE keeps the range inaccessible
            // until commit.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            NonNull::new(ptr.cast::<u8>()).ok_or_else(|| {
                VmError::ReservationFailed(io::Error::other("mmap returned null"))
            })
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            // Safety: FFI call to madvise. Pool growth is followed by immediate
            // use of the new range, so ask for physical backing up front.
            unsafe {
                libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_WILLNEED);
            }

            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // This crate supports only 64-bit targets; page size fits in usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed VmOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls: loom runs inside a
// single OS process with its own scheduler. Instead we back every "reservation"
// with a plain zeroed heap allocation. The same mock serves Miri and non-unix
// hosts.
//
// `commit` is a no-op: the memory is always accessible once
// reserved. `release` frees the heap block.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri, not(unix)))]
impl VmOps for PlatformVmOps {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

// ---------------------------------------------------------------------------
// Shared backing object (Linux memfd)
//
// A memfd is truncated to the full reserved size once; the file stays sparse
// until pages are touched. Any number of MAP_SHARED views of it alias the
// same physical pages, which is what lets a remapping pool move its base
// without copying: the old view keeps working for threads that still hold
// pointers into it.
// ---------------------------------------------------------------------------
#[cfg(all(target_os = "linux", not(any(loom, miri))))]
pub(crate) use shared::SharedBacking;

#[cfg(all(target_os = "linux", not(any(loom, miri))))]
mod shared {
    use super::{NonNull, VmError};
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    pub(crate) struct SharedBacking {
        fd: OwnedFd,
        size: usize,
    }

    impl SharedBacking {
        /// Create a sparse shared memory object of `size` bytes.
        pub(crate) fn new(name: &std::ffi::CStr, size: usize) -> Result<Self, VmError> {
            // Safety: FFI call to memfd_create with a valid C string.
            let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
            if raw < 0 {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }
            // Safety: memfd_create returned a fresh descriptor that nothing else owns.
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            let len = libc::off_t::try_from(size).map_err(|_| {
                VmError::InitializationFailed(format!("backing size {size} overflows off_t"))
            })?;
            // Safety: FFI call to ftruncate on a descriptor we own.
            if unsafe { libc::ftruncate(fd.as_raw_fd(), len) } != 0 {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            Ok(Self { fd, size })
        }

        pub(crate) fn size(&self) -> usize {
            self.size
        }

        /// Map `[offset, offset + size)` of the backing object read/write.
        pub(crate) fn map(&self, offset: usize, size: usize) -> Result<NonNull<u8>, VmError> {
            debug_assert!(
                offset.checked_add(size).is_some_and(|end| end <= self.size),
                "SharedBacking::map out of range: offset {offset} size {size} backing {}",
                self.size
            );
            let file_offset = libc::off_t::try_from(offset).map_err(|_| {
                VmError::CommitFailed(io::Error::other("mapping offset overflows off_t"))
            })?;

            // Safety: FFI call to mmap over a descriptor we own.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_POPULATE,
                    self.fd.as_raw_fd(),
                    file_offset,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }
            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| VmError::CommitFailed(io::Error::other("mmap returned null")))
        }

        /// Unmap a view previously returned by [`map`](Self::map).
        ///
        /// # Safety
        /// No pointer derived from the view may be used afterwards.
        pub(crate) unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap; caller guarantees the view is dead.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }
    }
}
