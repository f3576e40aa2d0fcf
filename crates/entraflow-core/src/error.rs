use thiserror::Error;

#[derive(Debug, Error)]
pub enum EntraflowError {
    // Definition errors
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Agent not registered: {0}")]
    AgentNotFound(String),

    // Node errors
    #[error("Input validation failed: {0}")]
    Validation(String),

    #[error("Agent execution failed: {agent}: {message}")]
    Execution { agent: String, message: String },

    #[error("Node timed out after {timeout_ms}ms: {node}")]
    Timeout { node: String, timeout_ms: u64 },

    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run cancelled")]
    Cancelled,

    // Storage errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EntraflowError {
    /// Structural errors abort a run before any node is dispatched.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            EntraflowError::InvalidDefinition(_)
                | EntraflowError::CycleDetected { .. }
                | EntraflowError::AgentNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EntraflowError>;
