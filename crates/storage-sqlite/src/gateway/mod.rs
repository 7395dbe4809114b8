//! SQLite storage for the offline gateway: response cache and request queue.

mod model;
mod repository;

pub use model::{CachedResponseDB, NewRequestQueueEntryDB, RequestQueueEntryDB};
pub use repository::GatewayRepository;
