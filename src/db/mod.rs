//! SQLite-backed storage for instances, watchlists, symbols, bindings,
//! orders, positions, market data and alerts.

mod schema;
mod store;

pub use schema::SCHEMA_SQL;
pub use store::{Store, WriteResult};
