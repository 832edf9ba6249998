//! Per-agent key-value persistence.

pub mod store;

pub use store::{agent_store_path, JsonFileStore, KeyValueStore, MemoryStore};
