//! Allocation errors surfaced by every pool layer.

use std::error::Error;
use std::fmt;

use super::vm::VmError;

/// Recoverable allocation failure.
///
/// Growth failures bubble up through every layer unchanged so the caller
/// (typically command-buffer recording) can latch them and report
/// out-of-memory when recording finishes.
#[derive(Debug)]
pub enum AllocError {
    /// Creating, committing or mapping the initial backing failed.
    Init(VmError),
    /// Committing or mapping additional memory during growth failed.
    Vm(VmError),
    /// Growth would exceed the reserved virtual span.
    OutOfReservedSpace {
        /// Bytes the pool would have to span on the exhausted side.
        requested: usize,
        /// Bytes reserved for that side.
        reserved: usize,
    },
    /// The state table has no room for more entries.
    OutOfTableSpace {
        /// Entries the table would have to hold.
        requested: usize,
        /// Maximum number of entries.
        capacity: usize,
    },
}

impl AllocError {
    /// Whether this error means "no more memory", as opposed to a failed
    /// initialization. Both are reported to Vulkan-style callers as
    /// out-of-memory, but only the former can occur mid-recording.
    #[must_use]
    pub fn is_exhaustion(&self) -> bool {
        !matches!(self, Self::Init(_))
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init(e) => write!(f, "pool initialization failed: {e}"),
            Self::Vm(e) => write!(f, "pool growth failed: {e}"),
            Self::OutOfReservedSpace {
                requested,
                reserved,
            } => write!(
                f,
                "out of reserved space: need {requested} bytes, {reserved} bytes reserved"
            ),
            Self::OutOfTableSpace {
                requested,
                capacity,
            } => write!(
                f,
                "state table exhausted: need {requested} entries, capacity {capacity}"
            ),
        }
    }
}

impl Error for AllocError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Init(e) | Self::Vm(e) => Some(e),
            Self::OutOfReservedSpace { .. } | Self::OutOfTableSpace { .. } => None,
        }
    }
}
