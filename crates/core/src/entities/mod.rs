//! Entity store models, query model and repository contract.

mod entities_model;
mod entities_query;
mod entities_service;
mod entities_traits;
mod entities_typed;

pub use entities_model::*;
pub use entities_query::*;
pub use entities_service::*;
pub use entities_traits::*;
pub use entities_typed::*;
