//! Process-wide state pools, one per device.
//!
//! The first [`open`] of a device creates its pool; every later `open`
//! shares it and bumps a reference count. The pool is dropped from the
//! registry when [`close`] brings the count back to zero. All bookkeeping
//! sits behind one mutex; allocation never touches it.

use std::collections::HashMap;

use super::error::AllocError;
use super::state_pool::{StatePool, StatePoolConfig};
use super::stats;
use crate::sync::atomic::Ordering;
use crate::sync::{Arc, Mutex, OnceLock, lock};

/// Opaque device handle, e.g. a DRM render node's `st_rdev`.
pub type DeviceId = u64;

struct Entry {
    pool: Arc<StatePool>,
    refs: usize,
}

static REGISTRY: OnceLock<Mutex<HashMap<DeviceId, Entry>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<DeviceId, Entry>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Get the pool of `device`, creating it with `config` on first use.
///
/// `config` is ignored when the device is already open.
///
/// # Errors
///
/// Returns the pool's construction error; the registry is left unchanged.
pub fn open(device: DeviceId, config: &StatePoolConfig) -> Result<Arc<StatePool>, AllocError> {
    let mut devices = lock(registry());
    if let Some(entry) = devices.get_mut(&device) {
        entry.refs += 1;
        log::trace!("device {device:#x} reopened ({} refs)", entry.refs);
        return Ok(entry.pool.clone());
    }

    let pool = Arc::new(StatePool::new(config)?);
    devices.insert(
        device,
        Entry {
            pool: pool.clone(),
            refs: 1,
        },
    );
    log::debug!("device {device:#x} opened");
    Ok(pool)
}

/// Drop one reference to `device`. Returns `true` if this was the last one
/// and the registry let go of the pool.
///
/// The pool itself lives on until every `Arc` handed out by [`open`] is gone.
pub fn close(device: DeviceId) -> bool {
    let released = {
        let mut devices = lock(registry());
        let Some(entry) = devices.get_mut(&device) else {
            log::warn!("close of unknown device {device:#x}");
            return false;
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            return false;
        }
        devices.remove(&device)
    };
    // Drop outside the lock: tearing down mappings can take a while.
    drop(released);
    log::debug!("device {device:#x} closed");
    true
}

/// Devices with at least one open reference.
#[must_use]
pub fn live_devices() -> Vec<DeviceId> {
    let mut devices: Vec<DeviceId> = lock(registry()).keys().copied().collect();
    devices.sort_unstable();
    devices
}

/// Snapshot of the process-wide diagnostic counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_reserved: usize,
    pub total_committed: usize,
    pub block_pool_committed: usize,
    pub state_table_committed: usize,
    pub retired_mappings: usize,
    pub live_states: usize,
    pub stream_blocks: usize,
}

#[must_use]
pub fn memory_stats() -> MemoryStats {
    MemoryStats {
        total_reserved: stats::TOTAL_RESERVED.load(Ordering::Relaxed),
        total_committed: stats::TOTAL_COMMITTED.load(Ordering::Relaxed),
        block_pool_committed: stats::BLOCK_POOL_COMMITTED.load(Ordering::Relaxed),
        state_table_committed: stats::STATE_TABLE_COMMITTED.load(Ordering::Relaxed),
        retired_mappings: stats::RETIRED_MAPPINGS.load(Ordering::Relaxed),
        live_states: stats::STATE_POOL_LIVE.load(Ordering::Relaxed),
        stream_blocks: stats::STATE_STREAM_BLOCKS.load(Ordering::Relaxed),
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::block_pool::BlockPoolConfig;

    fn small_config() -> StatePoolConfig {
        StatePoolConfig {
            block_pool: BlockPoolConfig {
                max_size: 16 * 1024 * 1024,
                ..BlockPoolConfig::default()
            },
            table_capacity: 4096,
            ..StatePoolConfig::default()
        }
    }

    // Tests run in parallel against the one registry, so each uses its own
    // device ids.

    #[test]
    fn test_open_shares_pool_until_last_close() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dev = 0xA000_0001;
        let a = open(dev, &small_config()).unwrap();
        let b = open(dev, &small_config()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(live_devices().contains(&dev));

        assert!(!close(dev));
        assert!(live_devices().contains(&dev));
        assert!(close(dev));
        assert!(!live_devices().contains(&dev));

        // Handles outlive the registry entry.
        let s = a.alloc(64, 64).unwrap();
        a.free(s);
    }

    #[test]
    fn test_reopen_after_close_creates_new_pool() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dev = 0xA000_0002;
        let first = open(dev, &small_config()).unwrap();
        assert!(close(dev));
        let second = open(dev, &small_config()).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(close(dev));
    }

    #[test]
    fn test_close_unknown_device() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        assert!(!close(0xA000_DEAD));
    }

    #[test]
    fn test_failed_open_leaves_no_entry() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dev = 0xA000_0003;
        // The initial window is larger than the forward half of the
        // reservation, which fails with either backend.
        let config = StatePoolConfig {
            block_pool: BlockPoolConfig {
                initial_size: 2 * 1024 * 1024,
                max_size: 2 * 1024 * 1024,
                ..BlockPoolConfig::default()
            },
            ..StatePoolConfig::default()
        };
        let err = open(dev, &config).unwrap_err();
        assert!(matches!(err, AllocError::OutOfReservedSpace { .. }), "got {err:?}");
        assert!(!live_devices().contains(&dev));

        // The id is still free for a working pool.
        let pool = open(dev, &small_config()).unwrap();
        drop(pool);
        assert!(close(dev));
    }

    #[test]
    fn test_memory_stats_follow_pool_lifetime() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let before = memory_stats();
        let dev = 0xA000_0004;
        let pool = open(dev, &small_config()).unwrap();
        let s = pool.alloc(128, 64).unwrap();

        let during = memory_stats();
        assert_eq!(during.live_states, before.live_states + 1);
        assert!(during.block_pool_committed > before.block_pool_committed);
        assert!(during.state_table_committed > before.state_table_committed);
        assert!(during.total_reserved >= before.total_reserved + 16 * 1024 * 1024);

        pool.free(s);
        assert!(close(dev));
        drop(pool);
        assert_eq!(memory_stats(), before);
    }
}
