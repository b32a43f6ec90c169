//! Error types for the acquisition engine.
//!
//! Two layers, following the crate-wide split between the public contract and
//! strategy internals:
//!
//! - [`ScanError`] is the closed taxonomy surfaced to scan consumers. It is
//!   `Clone` so the same terminal fault can be observed by every pull
//!   consumer of a closed queue, and it carries an optional cause chain from
//!   the failing source strategy.
//! - [`EngineError`] covers synchronous API failures: state-machine
//!   violations, unsupported operations, configuration problems. These are
//!   reported to the caller immediately, never deferred into the data path.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::controller::AcquisitionState;
use crate::scan::FrozenScanItem;

/// Closed set of failure codes for single-item fetch operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ScanErrorCode {
    /// The source failed while reading or generating an event.
    ReadError,
    /// The source produced an event that violates the data-model invariants.
    InvalidData,
    /// A blocking operation exceeded its deadline.
    Timeout,
    /// A buffer handoff overflowed.
    BufferOverflow,
    /// The operation was cancelled cooperatively.
    Cancelled,
    /// The backing source or connection went away.
    Disconnected,
}

impl fmt::Display for ScanErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanErrorCode::ReadError => "read-error",
            ScanErrorCode::InvalidData => "invalid-data",
            ScanErrorCode::Timeout => "timeout",
            ScanErrorCode::BufferOverflow => "buffer-overflow",
            ScanErrorCode::Cancelled => "cancelled",
            ScanErrorCode::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Failure half of a [`ScanResult`].
///
/// Always carries a code from the closed [`ScanErrorCode`] set and a message;
/// the cause is optional. Cheap to clone, so a session fault can be handed to
/// an arbitrary number of consumers.
#[derive(Clone, Debug, Error)]
#[error("{code}: {message}")]
pub struct ScanError {
    /// Machine-readable failure code.
    pub code: ScanErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Underlying cause reported by a source strategy, if any.
    pub cause: Option<Arc<anyhow::Error>>,
}

impl ScanError {
    /// Creates an error with the given code and message.
    pub fn new(code: ScanErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// Attaches an underlying cause.
    pub fn with_cause(mut self, cause: anyhow::Error) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// A cooperative-cancellation marker.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ScanErrorCode::Cancelled, message)
    }

    /// A source read/generation failure.
    pub fn read(message: impl Into<String>) -> Self {
        Self::new(ScanErrorCode::ReadError, message)
    }

    /// Whether this error only reports cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.code == ScanErrorCode::Cancelled
    }
}

/// Result of a single-item fetch: a frozen scan or a coded failure.
pub type ScanResult = Result<Arc<FrozenScanItem>, ScanError>;

/// Synchronous API errors from the controller and session surface.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An acquisition was started while another run is live.
    #[error("cannot start acquisition while {0}")]
    InvalidState(AcquisitionState),

    /// The instrument does not support the requested operation.
    #[error("{0} is not supported by this instrument")]
    Unsupported(&'static str),

    /// Configuration could not be loaded or validated.
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    /// No acquisition session is live.
    #[error("no active acquisition session")]
    NoActiveSession,

    /// An acquisition fault propagated to a synchronous call.
    #[error("acquisition fault: {0}")]
    Scan(#[from] ScanError),
}

/// Convenience alias for results using the engine error type.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_render_kebab_case() {
        assert_eq!(ScanErrorCode::ReadError.to_string(), "read-error");
        assert_eq!(ScanErrorCode::BufferOverflow.to_string(), "buffer-overflow");
        assert_eq!(ScanErrorCode::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn scan_error_displays_code_and_message() {
        let err = ScanError::new(ScanErrorCode::Timeout, "no event within 5s");
        assert_eq!(err.to_string(), "timeout: no event within 5s");
    }

    #[test]
    fn cause_survives_cloning() {
        let err = ScanError::read("generator failed")
            .with_cause(anyhow::anyhow!("socket reset"));
        let cloned = err.clone();
        assert_eq!(cloned.code, ScanErrorCode::ReadError);
        let cause = cloned.cause.as_ref().map(|c| c.to_string());
        assert_eq!(cause.as_deref(), Some("socket reset"));
    }

    #[test]
    fn invalid_state_mentions_the_state() {
        let err = EngineError::InvalidState(AcquisitionState::Acquiring);
        assert!(err.to_string().contains("Acquiring"));
    }
}
