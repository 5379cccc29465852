//! Pipeline Orchestration Engine
//!
//! Executes compiled pipeline plans durably:
//!
//! - **Plans**: immutable node graphs parsed from JSON or YAML
//! - **Execution**: node executions driven through facilitators, step
//!   handlers and advisers, with looping and matrix strategies
//! - **Interrupts**: abort, pause, resume, retry and mark operations applied
//!   asynchronously in registration order
//! - **Persistence**: every transition goes through an [`store::ExecutionStore`]
//!   so a restarted engine resumes where it stopped
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`engine`]: The orchestration core
//! - [`handlers`]: HTTP route handlers
//! - [`nats`]: Task transport and transition events over NATS
//! - [`store`]: In-memory and PostgreSQL execution stores
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pipeline_engine::engine::{ChannelTransport, Orchestrator, TriggerMetadata};
//! use pipeline_engine::store::MemoryStore;
//!
//! let (transport, tasks) = ChannelTransport::new();
//! let (orchestrator, work) = Orchestrator::builder(Arc::new(MemoryStore::new()), Arc::new(transport)).build();
//! orchestrator.spawn_background(work);
//! let execution = orchestrator.start_execution(plan, TriggerMetadata::default()).await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod nats;
pub mod plan;
pub mod result_ext;
pub mod state;
pub mod store;
pub mod template;

pub use error::{EngineError, EngineResult};
pub use result_ext::ResultExt;
