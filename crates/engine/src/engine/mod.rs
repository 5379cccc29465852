//! Execution engine.
//!
//! Walks compiled plans: creates node executions, hands them to step
//! handlers in the mode a facilitator picks, advises terminal nodes, applies
//! interrupts and keeps every change durable in the store.

pub mod advisers;
pub mod ambiance;
pub mod dispatch;
pub mod evaluator;
pub mod events;
pub mod execution;
pub mod facilitator;
pub mod failure;
pub mod interrupts;
pub mod locks;
pub mod orchestrator;
pub mod outputs;
pub mod status;
pub mod steps;
pub mod strategy;
pub mod transition;
pub mod work;


pub use dispatch::{ChannelTransport, TaskProgress, TaskRequest, TaskResponse, TaskTransport, TransportMessage};
pub use events::{BroadcastSink, EventSink, LogSink, TransitionEvent};
pub use execution::{NodeExecution, PlanExecution, TriggerMetadata};
pub use interrupts::{Interrupt, InterruptRequest, InterruptState, InterruptType};
pub use orchestrator::{AdmissionControl, AllowAll, ExecutionDetail, Orchestrator, OrchestratorBuilder, OrchestratorSettings};
pub use status::Status;
