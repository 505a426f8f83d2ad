//! # Error Definitions
//!
//! Failures of the protocol layer itself: building envelopes, framing
//! messages, and converting values.

use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// serde_json could not encode or decode a value or frame.
    Json(serde_json::Error),
    /// A frame arrived with no bytes in it.
    EmptyMessage,
    /// Parameter names, types, and values were not the same length.
    AsymmetricParameters { method: String, names: usize, types: usize, values: usize },
    /// The same parameter name was added twice to one envelope.
    DuplicateParameter { method: String, name: String },
    /// A value could not be read as the requested type.
    Conversion { expected: String, details: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(e) => write!(f, "JSON error: {}", e),
            Self::EmptyMessage => write!(f, "Empty message"),
            Self::AsymmetricParameters { method, names, types, values } => write!(
                f,
                "Parameters of '{}' are asymmetric: {} names, {} types, {} values",
                method, names, types, values
            ),
            Self::DuplicateParameter { method, name } => {
                write!(f, "Parameter '{}' of '{}' was added twice", name, method)
            }
            Self::Conversion { expected, details } => {
                write!(f, "Could not convert value to {}: {}", expected, details)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// A specialized Result type for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;
