//! Integration tests for the syncable store

mod access_control;
mod lock_store;
mod shared_secret;
mod store_backing;
mod sync_engine;
mod task_queue;
mod test_utils;
