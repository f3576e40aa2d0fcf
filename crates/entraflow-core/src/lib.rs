pub mod condition;
pub mod config;
pub mod error;
pub mod event;
pub mod payload;
pub mod traits;
pub mod types;
pub mod workflow;

pub use condition::{CompareOp, Condition};
pub use config::AppConfig;
pub use error::{EntraflowError, Result};
pub use event::EventBus;
pub use payload::Payload;
pub use types::*;
pub use workflow::{BackoffPolicy, EdgeSpec, NodeSpec, WorkflowDefinition, WorkflowFile};
