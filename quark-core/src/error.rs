//! Error Types
//!
//! Errors surfaced through pending futures and lifecycle events.
//!
//! The error type is `Clone` because a single resolution is shared by every
//! caller that asked for it while it was in flight.

use std::error::Error as StdError;
use std::rc::Rc;

/// Errors produced by the engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A producer or action future resolved with an error.
    ///
    /// The cached value of the atom is left untouched (stale-on-error).
    #[error("producer failed: {0}")]
    Producer(Rc<dyn StdError>),

    /// The atom behind a pending future was released before it settled.
    #[error("atom was released before its value settled")]
    Released,

    /// The scope has been torn down.
    #[error("scope has already ended")]
    Ended,
}

impl Error {
    /// Wrap a producer failure.
    pub fn producer<E>(error: E) -> Self
    where
        E: Into<Box<dyn StdError>>,
    {
        Self::Producer(Rc::from(error.into()))
    }

    /// Check if this error came from a producer.
    pub fn is_producer(&self) -> bool {
        matches!(self, Self::Producer(_))
    }
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_error_keeps_message() {
        let error = Error::producer("book not found");
        assert!(error.is_producer());
        assert_eq!(error.to_string(), "producer failed: book not found");
    }

    #[test]
    fn errors_are_cloneable() {
        let error = Error::producer(String::from("timeout"));
        let cloned = error.clone();
        assert_eq!(error.to_string(), cloned.to_string());
        assert!(!Error::Released.is_producer());
    }
}
