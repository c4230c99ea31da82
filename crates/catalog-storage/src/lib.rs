//! Postgres-backed persistence for the AppHub Catalog workflow engine
//! (`spec.md` §4.6, §6).
//!
//! [`StateStore`] is the seam `catalog-engine` programs against;
//! [`PostgresStateStore`] and [`InMemoryStateStore`] are its two
//! implementations. The Postgres backend applies its own schema via
//! [`migrations::run`] rather than `sqlx::migrate!`.

pub mod memory;
pub mod migrations;
pub mod postgres;
pub mod store;

pub use memory::InMemoryStateStore;
pub use postgres::PostgresStateStore;
pub use store::{ClaimedSchedule, ClaimedStep, NewDefinition, NewRun, StateStore};
