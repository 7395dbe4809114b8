//! SQLite entity store.

mod model;
mod repository;

pub use model::EntityRowDB;
pub use repository::{load_record, save_record, set_sync_status, EntityRepository};
