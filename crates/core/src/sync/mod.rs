//! Sync queue, connectivity monitor, conflict resolution and drain engine.

mod connectivity;
mod sync_conflict;
mod sync_engine;
mod sync_queue_model;
mod sync_retry;
mod sync_scheduler;
mod sync_traits;

pub use connectivity::*;
pub use sync_conflict::*;
pub use sync_engine::*;
pub use sync_queue_model::*;
pub use sync_retry::*;
pub use sync_scheduler::*;
pub use sync_traits::*;

#[cfg(test)]
mod tests;
