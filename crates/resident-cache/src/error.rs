use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// The shared source of a [`ResourceError::CreationFailed`].
pub type CreationError = Arc<dyn StdError + Send + Sync + 'static>;

/// An error that happens when acquiring a shared resource.
///
/// This error is [`Clone`] since the outcome of one generation is delivered to every awaiter of
/// that generation.
#[derive(Debug, Clone, Error)]
pub enum ResourceError {
    /// The resource factory failed or panicked.
    ///
    /// The same error is reported to every current and future awaiter of the generation, until
    /// the handle goes through a full release and a new generation is started.
    #[error("resource creation failed: {0}")]
    CreationFailed(#[source] CreationError),
    /// The operation observed a cancellation request.
    ///
    /// This is produced both for work items that were cancelled before the scheduler started
    /// them, and for [`rent`](crate::SharedResourceHandle::rent) calls that were cancelled
    /// while waiting.
    #[error("operation cancelled")]
    Cancelled,
    /// The owning registry or the scheduler has been torn down permanently.
    #[error("resource owner has been disposed")]
    Disposed,
    /// `release` was called on a handle that holds no references.
    #[error("handle holds no references")]
    Unreferenced,
}

impl ResourceError {
    /// Wraps an error returned by a resource factory.
    pub fn creation_failed(err: anyhow::Error) -> Self {
        let boxed: Box<dyn StdError + Send + Sync + 'static> = err.into();
        Self::CreationFailed(Arc::from(boxed))
    }

    /// Short, static name of the error kind, used as a metric tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreationFailed(_) => "creation_failed",
            Self::Cancelled => "cancelled",
            Self::Disposed => "disposed",
            Self::Unreferenced => "unreferenced",
        }
    }

    /// Whether this error is a [`Cancelled`](Self::Cancelled) error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
