//! Shared data-model errors. Validation, compilation, and expression
//! errors each get their own richer type in `flowcore-core`; this one
//! covers failures intrinsic to the data model itself (e.g. malformed
//! alias graphs discovered while building a `CompiledWorkflow`).

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum WorkflowError {
    #[error("circular alias reference: {0}")]
    CircularAlias(String),

    #[error("step '{0}' not found")]
    StepNotFound(String),

    #[error("workflow execution was canceled")]
    Canceled,

    #[error("workflow deadline exceeded")]
    DeadlineExceeded,

    #[error("{locator}: {message}")]
    Located { locator: String, message: String },

    #[error("{0}")]
    Other(String),
}

impl WorkflowError {
    pub fn located(locator: impl Into<String>, message: impl Into<String>) -> Self {
        WorkflowError::Located {
            locator: locator.into(),
            message: message.into(),
        }
    }
}
