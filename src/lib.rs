#[cfg(not(target_pointer_width = "64"))]
compile_error!("statepool supports only 64-bit targets.");

pub(crate) mod sync;

// public module: per-component APIs plus TEST_MUTEX (public for tests)
pub mod memory;

// pools
pub use memory::block_pool::{BlockPool, BlockPoolConfig};
pub use memory::mapping::{GrowableMapping, MappingStrategy, Reservation};
pub use memory::reserved_pool::ReservedStatePool;
pub use memory::state_pool::{
    MAX_STATE_SIZE, MIN_STATE_SIZE, State, StatePool, StatePoolConfig,
};
pub use memory::state_stream::StateStream;

// lock-free building blocks
pub use memory::free_list::{FreeList, FreeListLinks, PtrFreeList};
pub use memory::state_table::{StateEntry, StateTable};

// registry/stats
pub use memory::registry::{DeviceId, MemoryStats, memory_stats};

// errors
pub use memory::error::AllocError;
pub use memory::vm::VmError;
