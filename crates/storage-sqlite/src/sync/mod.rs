//! SQLite storage for the sync queue and engine state.

pub mod queue;

pub use queue::{write_queue_entry, SyncQueueRepository};
