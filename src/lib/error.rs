//! Error taxonomy for conformance scenarios.
//!
//! Four failure classes exist. Unsupported features are skips, not failures.
//! Driver failures, verification mismatches and timeouts are fatal to the
//! scenario or worker process that hit them; nothing is retried.

use std::path::PathBuf;

use thiserror::Error;

use crate::bundle::BundleError;
use crate::driver::{DriverError, Timeout};
use crate::negotiate::NegotiationError;

/// Top-level error of a scenario run.
#[derive(Error, Debug)]
pub enum ConformanceError {
    /// The device lacks a capability the scenario needs.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("driver call failed: {0}")]
    Driver(#[from] DriverError),

    #[error("synchronize did not complete within {0}")]
    Timeout(Timeout),

    #[error("output mismatch at index {index}: expected {expected}, got {actual}")]
    Mismatch {
        index: usize,
        expected: u64,
        actual: u64,
    },

    #[error("group-size negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("command bundle misuse: {0}")]
    Usage(String),

    #[error("failed to read module {path:?}: {source}")]
    Module {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConformanceError {
    /// Whether this error means "skip the scenario" rather than "fail it".
    pub fn is_skip(&self) -> bool {
        matches!(self, ConformanceError::Unsupported(_))
    }

    /// Whether this is a synchronize timeout, reported apart from driver failures.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConformanceError::Timeout(_))
    }
}

impl From<BundleError> for ConformanceError {
    fn from(err: BundleError) -> Self {
        match err {
            BundleError::Driver(e) => ConformanceError::Driver(e),
            BundleError::Timeout(t) => ConformanceError::Timeout(t),
            other => ConformanceError::Usage(other.to_string()),
        }
    }
}

/// Outcome of a scenario that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict<T> {
    Passed(T),
    Skipped(String),
}

impl<T> Verdict<T> {
    pub fn is_passed(&self) -> bool {
        matches!(self, Verdict::Passed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_bundle_errors_keep_their_class() {
        let t = Timeout::After(Duration::from_millis(5));
        assert!(ConformanceError::from(BundleError::Timeout(t)).is_timeout());
        assert!(matches!(
            ConformanceError::from(BundleError::Driver(DriverError::DeviceLost("x".into()))),
            ConformanceError::Driver(_)
        ));
        assert!(matches!(
            ConformanceError::from(BundleError::CloseOnImmediate),
            ConformanceError::Usage(_)
        ));
    }

    #[test]
    fn test_only_unsupported_is_skip() {
        assert!(ConformanceError::Unsupported("no cooperative queue".into()).is_skip());
        assert!(!ConformanceError::Mismatch {
            index: 0,
            expected: 2,
            actual: 1
        }
        .is_skip());
    }
}
