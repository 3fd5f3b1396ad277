use thiserror::Error;

/// Structural error taxonomy from spec §7. Internal modules return this;
/// the `Engine` facade folds it into `anyhow::Result` the way
/// `BpmnLiteEngine` does for the teacher's `ProcessStore`/`Vm` errors.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("definition error: {0}")]
    Definition(String),

    #[error("expression error: {0}")]
    Expression(String),

    #[error("task {element_id} failed: {code}: {message}")]
    TaskFailed {
        element_id: String,
        code: String,
        message: String,
    },

    #[error("task {element_id} timed out")]
    Timeout { element_id: String },

    #[error("cancelled")]
    Cancelled,

    #[error("user rejected task {element_id}")]
    UserRejected { element_id: String },

    #[error("no path matched at gateway {element_id}")]
    NoPathMatched { element_id: String },

    #[error("multi-instance fan-out at {element_id} exceeds limit {limit}")]
    MultiInstanceOverflow { element_id: String, limit: usize },
}

impl EngineError {
    /// The `errorCode` surfaced on `element.failed` / matched against
    /// boundary-error `errorCode` substrings (spec §4.7, §7).
    pub fn error_code(&self) -> String {
        match self {
            EngineError::Definition(_) => "DefinitionError".to_string(),
            EngineError::Expression(_) => "ExpressionError".to_string(),
            EngineError::TaskFailed { code, .. } => code.clone(),
            EngineError::Timeout { .. } => "Timeout".to_string(),
            EngineError::Cancelled => "Cancelled".to_string(),
            EngineError::UserRejected { .. } => "UserRejected".to_string(),
            EngineError::NoPathMatched { .. } => "NoPathMatched".to_string(),
            EngineError::MultiInstanceOverflow { .. } => "MultiInstanceOverflow".to_string(),
        }
    }

    pub fn element_id(&self) -> Option<&str> {
        match self {
            EngineError::TaskFailed { element_id, .. }
            | EngineError::Timeout { element_id }
            | EngineError::UserRejected { element_id }
            | EngineError::NoPathMatched { element_id }
            | EngineError::MultiInstanceOverflow { element_id, .. } => Some(element_id),
            _ => None,
        }
    }

    /// Cancellation is never a terminal failure (spec §7).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}
