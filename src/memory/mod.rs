pub(crate) mod central_cache;
pub(crate) mod classes;
pub(crate) mod free_list;
pub(crate) mod integration;
pub(crate) mod loom_tests;
pub(crate) mod page_cache;
pub(crate) mod pool;
pub(crate) mod span;
pub(crate) mod stats;
pub(crate) mod thread_cache;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
