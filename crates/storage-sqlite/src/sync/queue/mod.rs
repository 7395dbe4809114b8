mod model;
mod repository;

pub use model::{NewSyncQueueEntryDB, SyncEngineStateDB, SyncQueueEntryDB};
pub use repository::{write_queue_entry, SyncQueueRepository};
