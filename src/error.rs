//! Error type for submitted computations.

use thiserror::Error;

/// Error produced by a submitted computation.
///
/// `Failed` carries an error the computation returned and is delivered to
/// failure subscribers verbatim. `Panicked` carries the payload of a panic
/// that unwound out of the computation, downcast back to the original
/// message so no scheduling-layer artifact is visible.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Shorthand for a [`TaskError::Failed`] with the given message.
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}
