//! Error types for the scheduler crate.

use std::fmt;

/// Errors from a wait-task sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollerError {
    /// Reading parked tasks or clearing a deadline failed.
    Store,
    /// A ready event could not be published.
    Publish,
    /// The id generator refused to mint a message id.
    IdGeneration,
}

impl fmt::Display for PollerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store => write!(f, "wait-task store failure"),
            Self::Publish => write!(f, "failed to publish ready event"),
            Self::IdGeneration => write!(f, "failed to generate message id"),
        }
    }
}

impl std::error::Error for PollerError {}
