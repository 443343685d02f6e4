#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::block_pool::BlockPoolConfig;
    use crate::memory::error::AllocError;
    use crate::memory::mapping::MappingStrategy;
    use crate::memory::registry;
    use crate::memory::reserved_pool::ReservedStatePool;
    use crate::memory::state_pool::{State, StatePool, StatePoolConfig};
    use crate::memory::state_stream::StateStream;
    use crate::memory::stats;
    use crate::sync::Arc;
    use crate::sync::thread;

    fn strategies() -> Vec<MappingStrategy> {
        [MappingStrategy::Remap, MappingStrategy::Pinned]
            .into_iter()
            .filter(|s| s.is_available())
            .collect()
    }

    fn config(max_size: usize, strategy: MappingStrategy) -> StatePoolConfig {
        StatePoolConfig {
            block_size: 4096,
            base_address: 0x8000_0000,
            block_pool: BlockPoolConfig {
                initial_size: 16 * 1024,
                max_size,
                strategy,
            },
            table_capacity: 1 << 18,
        }
    }

    #[test]
    fn test_integration_stress_mix() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // pool states, a stream and a reservation sharing one pool
        for strategy in strategies() {
            let pool = StatePool::new(&config(64 << 20, strategy)).unwrap();
            let reserved = ReservedStatePool::new(&pool, 8, 192).unwrap();
            let mut stream = StateStream::new(&pool, 2048);

            let mut states = Vec::new();
            let mut from_reserve = Vec::new();
            for i in 0u32..300 {
                match i % 3 {
                    0 => states.push(pool.alloc(32 + i * 7, 32).unwrap()),
                    1 => {
                        let s = stream.alloc(24 + i % 100, 8).unwrap();
                        // Safety: Test code.
                        unsafe { s.as_mut_slice().fill(0xA5) };
                    }
                    _ => {
                        if let Some(s) = reserved.alloc() {
                            from_reserve.push(s);
                        } else if let Some(s) = from_reserve.pop() {
                            reserved.free(s);
                        }
                    }
                }
                if i % 10 == 9 {
                    let s = states.swap_remove(0);
                    pool.free(s);
                }
            }

            for s in from_reserve {
                reserved.free(s);
            }
            drop(reserved);
            stream.finish();
            for s in states {
                pool.free(s);
            }
            assert_eq!(pool.live_states(), 0, "{strategy:?}");
        }
    }

    #[test]
    fn test_integration_thread_contention() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // every thread runs its own stream over a shared pool
        let pool = Arc::new(StatePool::new(&config(256 << 20, MappingStrategy::default())).unwrap());
        let barrier = Arc::new(crate::sync::barrier::Barrier::new(8));

        let handles: Vec<_> = (0..8u8)
            .map(|t| {
                let pool = pool.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let mut stream = StateStream::new(&pool, 4096);
                    let mut mine = Vec::new();
                    barrier.wait();
                    for i in 0..500u32 {
                        let s = stream.alloc(16 + (i % 13) * 16, 16).unwrap();
                        // Safety: Test code; stream states are disjoint.
                        unsafe { s.as_mut_slice().fill(t) };
                        mine.push(s);
                        let back = pool.alloc_back().unwrap();
                        pool.free(back);
                    }
                    for s in &mine {
                        // Safety: Test code.
                        assert!(unsafe { s.as_mut_slice() }.iter().all(|&b| b == t));
                    }
                    assert_eq!(
                        stream.total_size(),
                        mine.iter().map(|s| s.alloc_size as usize).sum::<usize>()
                    );
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.live_states(), 0);
    }

    #[test]
    fn test_integration_oom_handling() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // exhaustion is an error value, and freed memory is still usable
        let pool = StatePool::new(&config(256 * 1024, MappingStrategy::Pinned)).unwrap();
        let mut held: Vec<State> = Vec::new();
        let err = loop {
            match pool.alloc(4096, 64) {
                Ok(s) => held.push(s),
                Err(e) => break e,
            }
        };
        assert!(err.is_exhaustion());
        assert!(matches!(err, AllocError::OutOfReservedSpace { .. }), "got {err:?}");
        // Front side of a 256 KiB reservation.
        assert_eq!(held.len(), 32);

        let victim = held.pop().unwrap();
        pool.free(victim);
        let again = pool.alloc(1024, 64).unwrap();
        assert_eq!(again.offset, victim.offset);
        assert!(pool.alloc(8192, 64).is_err());
    }

    #[test]
    fn test_integration_address_stability() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // stale pointers keep working while other threads grow the pool
        for strategy in strategies() {
            let pool = Arc::new(StatePool::new(&config(256 << 20, strategy)).unwrap());
            let marker = pool.alloc(256, 64).unwrap();
            // Safety: Test code.
            unsafe { marker.as_mut_slice().fill(0x3C) };

            let growers: Vec<_> = (0..4)
                .map(|_| {
                    let pool = pool.clone();
                    thread::spawn(move || {
                        for _ in 0..64 {
                            pool.alloc(16 * 1024, 64).unwrap();
                        }
                    })
                })
                .collect();

            for _ in 0..200 {
                // Safety: Test code; the pre-growth pointer stays mapped.
                let bytes = unsafe { marker.as_mut_slice() };
                assert!(bytes.iter().all(|&b| b == 0x3C));
                thread::yield_now();
            }
            for g in growers {
                g.join().unwrap();
            }

            let current = pool.map(marker.offset);
            // Safety: Test code.
            let fresh = unsafe { std::slice::from_raw_parts(current.as_ptr(), 256) };
            assert!(fresh.iter().all(|&b| b == 0x3C), "{strategy:?}");
            assert!(pool.block_pool().size() >= 4 * 64 * 16 * 1024);
        }
    }

    #[test]
    fn test_integration_strategies_agree_on_offsets() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // offsets depend only on the request sequence, not the backend
        let run = |strategy| {
            let pool = StatePool::new(&config(64 << 20, strategy)).unwrap();
            let mut offsets = Vec::new();
            for i in 0..100u32 {
                let s = pool.alloc(64 << (i % 7), 64).unwrap();
                offsets.push(s.offset);
                if i % 4 == 0 {
                    pool.free(s);
                }
                if i % 9 == 0 {
                    offsets.push(pool.alloc_back().unwrap().offset);
                }
            }
            (offsets, pool.block_pool().size(), pool.block_pool().center_offset())
        };
        let results: Vec<_> = strategies().into_iter().map(run).collect();
        for pair in results.windows(2) {
            assert_eq!(pair[0], pair[1]);
        }
    }

    #[test]
    fn test_integration_gpu_addresses() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        // device addresses straddle the base for back and front states
        let pool = StatePool::new(&config(16 << 20, MappingStrategy::default())).unwrap();
        let front = pool.alloc(512, 512).unwrap();
        let back = pool.alloc_back().unwrap();
        assert_eq!(pool.address(&front), 0x8000_0000 + front.offset as u64);
        assert_eq!(pool.address(&back), 0x8000_0000 - back.offset.unsigned_abs() as u64);
        assert!(pool.address(&back) < 0x8000_0000);
        assert_eq!(pool.address(&front) % 512, 0);
    }

    #[test]
    fn test_integration_leak_detection() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        // all counters return to baseline once every owner is gone
        let before = registry::memory_stats();
        {
            let pool = StatePool::new(&config(64 << 20, MappingStrategy::default())).unwrap();
            let mut stream = StateStream::new(&pool, 4096);
            for i in 0..2000u32 {
                stream.alloc(8 + i % 500, 8).unwrap();
            }
            assert!(stats::STATE_STREAM_BLOCKS.get() > before.stream_blocks);
            let _orphan = pool.alloc(128, 64).unwrap();
            let during = registry::memory_stats();
            assert!(during.total_committed > before.total_committed);
        }
        assert_eq!(registry::memory_stats(), before);
    }
}
