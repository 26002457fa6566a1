//! Error types for report aggregation
//!
//! Arithmetic degeneracy (zero denominators) and measurement noise (negative
//! native CPU counts) are recovered locally and never surface here. The only
//! fatal conditions are I/O and serialization failures: a report that
//! includes a file whose source cannot be read is not meaningfully correct,
//! so that failure propagates instead of being skipped.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while building or merging a profile report
#[derive(Error, Debug)]
pub enum ProfileError {
    /// A source file required for report emission could not be read
    #[error("source unavailable: {path}: {source}")]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A child process failed to write its statistics store
    #[error("failed to persist statistics to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Statistics store serialization failed
    #[error("failed to encode statistics: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// A persisted child store could not be decoded
    #[error("failed to decode statistics from {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: rmp_serde::decode::Error,
    },

    /// The auxiliary directory holding child stores could not be scanned
    #[error("failed to scan auxiliary directory {path}: {source}")]
    AuxDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result type for report aggregation operations
pub type Result<T> = std::result::Result<T, ProfileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_unavailable_display() {
        let err = ProfileError::SourceUnavailable {
            path: PathBuf::from("/tmp/missing.py"),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        };
        let msg = err.to_string();
        assert!(msg.contains("source unavailable"));
        assert!(msg.contains("/tmp/missing.py"));
    }

    #[test]
    fn test_aux_dir_display() {
        let err = ProfileError::AuxDir {
            path: PathBuf::from("/tmp/aux"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().contains("/tmp/aux"));
    }
}
