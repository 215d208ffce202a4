//! Error types for the node fabric.
//!
//! Only programming errors and driver failures are reported through
//! [`Error`]. Expected outcomes such as allocator exhaustion or a failed
//! introduction are plain values (a null [`Fragment`](crate::Fragment) or a
//! `None` link) and never surface here.

use thiserror::Error;

/// Result type alias for the fabric.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the fabric.
#[derive(Debug, Error)]
pub enum Error {
    /// A node name was assigned twice.
    #[error("node name is already assigned")]
    AlreadyAssigned,

    /// A broker names itself and never accepts an assigned name.
    #[error("brokers assign their own name")]
    BrokerSelfAssigned,

    /// The object is not in a state that permits the operation.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The caller passed an unsupported argument combination.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The driver refused or failed an operation.
    #[error("driver error: {0}")]
    Driver(String),

    /// A link message could not be decoded or encoded.
    #[error("message codec error: {0}")]
    Decode(#[from] bincode::Error),

    /// A memory layout does not fit its buffer.
    #[error("invalid memory layout: {0}")]
    InvalidLayout(String),

    /// The link has been deactivated.
    #[error("link is inactive")]
    LinkInactive,
}

impl Error {
    /// Convenience constructor for [`Error::FailedPrecondition`].
    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::FailedPrecondition(msg.into())
    }

    /// Convenience constructor for [`Error::InvalidArgument`].
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Convenience constructor for [`Error::Driver`].
    pub fn driver(msg: impl Into<String>) -> Self {
        Error::Driver(msg.into())
    }
}
