//! Compiled execution plans.
//!
//! A plan is the immutable graph the engine walks:
//! - Type definitions for plans and plan nodes
//! - JSON/YAML parsing
//! - Structural validation

pub mod parser;
pub mod types;

pub use parser::{parse_plan, validate_plan};
pub use types::{NodeGroup, Plan, PlanNode, TimeoutObtainment};
