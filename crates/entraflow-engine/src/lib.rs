pub mod backoff;
pub mod builtin;
pub mod checkpoint;
pub mod graph;
pub mod registry;
pub mod run_log;

pub use builtin::{CommandAgent, ConstantAgent, PassthroughAgent};
pub use checkpoint::{MemoryStateStore, SqliteStateStore};
pub use graph::{ExecutionGraph, Orchestrator, Readiness};
pub use registry::AgentRegistry;
pub use run_log::RunLogger;
