//! Local-first sync engine for the dairy back-office: entity store contract,
//! sync queue, connectivity monitor, conflict resolution and offline gateway.

pub mod entities;
pub mod errors;
pub mod gateway;
pub mod sync;
pub mod utils;

pub use errors::{Error, Result};
