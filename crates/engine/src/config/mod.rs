//! Configuration loading from environment variables.
//!
//! Engine settings use the `PIPELINE_` prefix, PostgreSQL settings the
//! `POSTGRES_` prefix. Both are parsed with `envy`.

mod app;
mod database;

pub use app::{EngineConfig, StoreBackend};
pub use database::DatabaseConfig;
