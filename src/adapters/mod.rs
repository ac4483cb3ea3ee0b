// src/adapters/mod.rs
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{FailPoint, MemoryAdapter};
#[cfg(feature = "postgres")]
pub use postgres::PostgresAdapter;
