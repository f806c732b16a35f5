use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Lookup errors
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    // Lifecycle errors
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Principal {principal} is not allowed to act on task {task_id}")]
    Unauthorized { principal: String, task_id: String },

    // Definition / expression errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Handler errors
    #[error("Handler failed: {service_type}: {message}")]
    HandlerFailure {
        service_type: String,
        message: String,
    },

    #[error("Handler timeout after {timeout_secs}s: {service_type}")]
    HandlerTimeout {
        service_type: String,
        timeout_secs: u64,
    },

    // Walk errors
    #[error("Engine fault: {0}")]
    EngineFault(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn handler(service_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HandlerFailure {
            service_type: service_type.into(),
            message: message.into(),
        }
    }

    /// Stable tag for logs and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Validation(_) => "validation",
            Self::HandlerFailure { .. } | Self::HandlerTimeout { .. } => "handler_failure",
            Self::EngineFault(_) => "engine_fault",
            Self::Config(_) | Self::ConfigNotFound(_) => "config",
            Self::Database(_) => "database",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// Handler failures are resolved by the node's error policy; everything
    /// else propagates to the orchestrator.
    pub fn is_handler_failure(&self) -> bool {
        matches!(
            self,
            Self::HandlerFailure { .. } | Self::HandlerTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
