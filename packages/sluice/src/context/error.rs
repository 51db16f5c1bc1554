// context error types.

use std::sync::Arc;
use thiserror::Error;


/// Reason a [`Context`](crate::Context) was cancelled
///
/// A cancelled context and all of its descendants report the same reason through
/// [`err`](crate::Context::err).
#[derive(Debug, Clone, Eq, PartialEq, Hash, Error)]
pub enum ContextError {
    /// Cancelled explicitly, or because an external parent's done channel closed
    #[error("context canceled")]
    Canceled,
    /// The context's deadline passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    /// Cancelled explicitly with a custom reason
    #[error("{0}")]
    Reason(Arc<str>),
}

impl ContextError {
    /// Construct a custom cancellation reason
    pub fn reason<S: Into<Arc<str>>>(reason: S) -> Self {
        ContextError::Reason(reason.into())
    }

    /// Whether retrying the operation that observed this error could succeed
    ///
    /// Only a passed deadline is considered temporary.
    pub fn is_temporary(&self) -> bool {
        matches!(self, ContextError::DeadlineExceeded)
    }
}
