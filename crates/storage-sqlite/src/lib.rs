//! SQLite storage for the dairy sync engine: entity tables, sync queue,
//! engine state, response cache and gateway request queue.

pub mod db;
pub mod entities;
pub mod errors;
pub mod gateway;
pub mod schema;
pub mod sync;

pub use db::write_actor::spawn_writer;
pub use db::{create_pool, get_connection, init, run_migrations, DbConnection, DbPool, WriteHandle};
pub use entities::EntityRepository;
pub use errors::StorageError;
pub use gateway::GatewayRepository;
pub use sync::{write_queue_entry, SyncQueueRepository};
