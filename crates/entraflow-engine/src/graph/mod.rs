//! DAG workflow execution.
//!
//! A [`WorkflowDefinition`](entraflow_core::workflow::WorkflowDefinition) is
//! validated into an [`ExecutionGraph`] (cycle detection, deterministic
//! topological order, levels). The [`Orchestrator`] walks that graph: a node
//! becomes ready once its inbound edges are satisfied, runs under its timeout,
//! retries with exponential backoff, and is skipped when a dependency failed or
//! a conditional edge evaluated false.

pub mod builder;
pub mod executor;
pub mod readiness;

pub use builder::{ExecutionGraph, Inbound};
pub use executor::Orchestrator;
pub use readiness::Readiness;
