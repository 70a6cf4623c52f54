//! JSON error envelope.
//!
//! The control plane consumes errors as a two-field JSON document with a
//! fixed key order: `{"errorType":"...","errorMessage":"..."}`. Quotes and
//! backslashes are escaped, forward slashes are not, and Unicode is carried
//! through as UTF-8.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BoxError, RuntimeError};

/// Error type reported for unclassified handler failures, both as the
/// envelope `errorType` and as the fixed error-type request header.
pub const UNHANDLED_ERROR_TYPE: &str = "Unhandled";

/// The error envelope exchanged with the control plane.
///
/// Field order matters: serialization must emit `errorType` before
/// `errorMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    #[serde(rename = "errorType")]
    pub error_type: String,
    #[serde(rename = "errorMessage")]
    pub error_message: String,
}

impl Diagnostic {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
        }
    }

    /// Classify a handler error. A `Diagnostic` raised by the handler keeps
    /// its own type; anything else is reported as `Unhandled`.
    pub(crate) fn from_handler_error(err: &BoxError) -> Self {
        match err.downcast_ref::<Diagnostic>() {
            Some(diagnostic) => diagnostic.clone(),
            None => Self::new(UNHANDLED_ERROR_TYPE, err.to_string()),
        }
    }

    /// Serialize the envelope. Infallible in practice; a failure here is a
    /// protocol-level defect.
    pub(crate) fn to_json(&self) -> Result<Vec<u8>, RuntimeError> {
        serde_json::to_vec(self)
            .map_err(|e| RuntimeError::Protocol(format!("error envelope encoding failed: {e}")))
    }

    /// Decode an envelope received off the wire.
    pub fn from_json(bytes: &[u8]) -> Result<Self, RuntimeError> {
        serde_json::from_slice(bytes)
            .map_err(|e| RuntimeError::Protocol(format!("malformed error envelope: {e}")))
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.error_message)
    }
}

impl std::error::Error for Diagnostic {}
