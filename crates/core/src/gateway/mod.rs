//! Offline gateway: read-through cache and write queue for server-only resources.

mod gateway_model;
mod gateway_service;
mod gateway_traits;

pub use gateway_model::*;
pub use gateway_service::*;
pub use gateway_traits::*;
