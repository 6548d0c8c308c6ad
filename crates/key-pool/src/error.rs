//! Error types for pool operations

/// Errors returned by [`KeyPool::acquire`](crate::KeyPool::acquire).
///
/// Neither variant is a defect: `AtCapacity` is ordinary backpressure and
/// `NoCredentialsConfigured` is a deployment problem the caller reports as-is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("no API keys configured")]
    NoCredentialsConfigured,

    #[error("{message}")]
    AtCapacity {
        queue_position: usize,
        message: String,
    },
}

impl Error {
    /// Build the capacity error for the given queue position.
    pub fn at_capacity(queue_position: usize) -> Self {
        Error::AtCapacity {
            queue_position,
            message: format!(
                "All API keys are busy. You are in the queue at position {queue_position}, please retry shortly."
            ),
        }
    }

    /// Queue position carried by a capacity error.
    pub fn queue_position(&self) -> Option<usize> {
        match self {
            Error::AtCapacity { queue_position, .. } => Some(*queue_position),
            Error::NoCredentialsConfigured => None,
        }
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
