//! Error types for cmod-ca
//!
//! Failures never stop the pipeline: every variant below is logged and
//! degrades the affected comment to "render as original" at worst.

use thiserror::Error;

use crate::classifier::ClassifierError;
use crate::dom::OccurrenceId;
use crate::identity::{CommentId, IdentityUnavailable};
use crate::registry::RegistryError;

/// Main error type for cmod-ca
#[derive(Error, Debug)]
pub enum Error {
    /// Text is empty or is one of the display placeholders
    #[error("Identity unavailable: {0}")]
    IdentityUnavailable(#[from] IdentityUnavailable),

    /// Network or HTTP-level failure talking to the classifier
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Classifier answered OK but the payload is missing or invalid
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// A result referenced an identity that is not in flight
    #[error("Late or unknown result for {0}")]
    LateOrUnknownResult(CommentId),

    /// Guarded registry transition refused
    #[error("Registry error: {0}")]
    Registry(RegistryError),

    /// Action targeted an occurrence the pipeline has not rendered
    #[error("Unknown occurrence {0}")]
    UnknownOccurrence(OccurrenceId),

    /// Invalid request from a user action
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Configuration loading or resolution errors
    #[error("Configuration error: {0}")]
    Config(#[from] cmod_common::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ClassifierError> for Error {
    fn from(err: ClassifierError) -> Self {
        match err {
            ClassifierError::Network(_) | ClassifierError::HttpStatus(..) => {
                Error::TransportFailure(err.to_string())
            }
            ClassifierError::MalformedResponse(msg) => Error::MalformedResponse(msg),
            ClassifierError::Rejected { .. } => Error::MalformedResponse(err.to_string()),
            ClassifierError::InvalidReport(msg) => Error::BadRequest(msg),
        }
    }
}

impl From<RegistryError> for Error {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::LateOrUnknownResult { identity, .. } => Error::LateOrUnknownResult(identity),
            other => Error::Registry(other),
        }
    }
}

/// Convenience Result type using cmod-ca Error
pub type Result<T> = std::result::Result<T, Error>;
