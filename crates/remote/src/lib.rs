//! HTTP client for the remote authority: entity delivery, health probing and
//! the gateway transport.

mod client;
mod error;

pub use client::RemoteClient;
pub use error::{RemoteError, Result};
