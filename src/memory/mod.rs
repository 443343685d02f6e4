pub mod block_pool;
pub(crate) mod block_state;
pub mod error;
pub mod free_list;
pub(crate) mod integration;
pub mod mapping;
pub mod registry;
pub mod reserved_pool;
pub mod state_pool;
pub mod state_stream;
pub mod state_table;
pub(crate) mod stats;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
