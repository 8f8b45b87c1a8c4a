//! Error taxonomy.
//!
//! Collector-level errors never escape a run: the orchestrator folds every
//! `CollectError` into a `Failed` status plus "no observation". Only
//! `HistoryError::Read`/`Write`/`Lock`/`Serialize` surface to the caller, because they
//! mean freshly collected data was lost.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Why a single collector invocation produced no observation.
#[derive(Debug, Error)]
pub enum CollectError {
    /// No endpoint configured for the source.
    #[error("no endpoint configured for source '{0}'")]
    ConfigurationMissing(String),

    /// Network failure or non-success HTTP status.
    #[error("source unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),

    /// The invocation exceeded its time budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Parse target not found (row, column, JSON field, regex match, link).
    #[error("content structure not recognized: {0}")]
    StructureNotRecognized(String),

    /// Text found but not convertible to a positive decimal.
    #[error("value not parsable as a positive rate: {0:?}")]
    ValueUnparsable(String),

    /// The rendering session could not be started, driven or released.
    #[error("rendering session error: {0}")]
    SessionResource(String),

    #[error("collector panicked: {0}")]
    Panicked(String),

    #[error("cancelled by interrupt")]
    Cancelled,
}

impl CollectError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::ConfigurationMissing(_) => FailureKind::ConfigurationMissing,
            Self::Unreachable(_) => FailureKind::Unreachable,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::StructureNotRecognized(_) => FailureKind::StructureNotRecognized,
            Self::ValueUnparsable(_) => FailureKind::ValueUnparsable,
            Self::SessionResource(_) => FailureKind::SessionResource,
            Self::Panicked(_) => FailureKind::Panicked,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// Classified outcome shown in the final summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ConfigurationMissing,
    Unreachable,
    Timeout,
    StructureNotRecognized,
    ValueUnparsable,
    SessionResource,
    Panicked,
    Cancelled,
    /// The stateless phase deadline passed before the worker reported.
    Unreported,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ConfigurationMissing => "configuration missing",
            Self::Unreachable => "unreachable",
            Self::Timeout => "timeout",
            Self::StructureNotRecognized => "structure not recognized",
            Self::ValueUnparsable => "value unparsable",
            Self::SessionResource => "session error",
            Self::Panicked => "collector panicked",
            Self::Cancelled => "cancelled",
            Self::Unreported => "no report before phase deadline",
        };
        f.write_str(s)
    }
}

/// Persistence errors of the history store.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Existing dataset is malformed. Recovered locally by starting empty.
    #[error("history dataset at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// Existing dataset could not be read (permissions, I/O). Not recovered:
    /// overwriting a file we cannot read could destroy good data.
    #[error("failed to read history dataset {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write history dataset {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode history dataset: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("could not lock {path} within {waited:?}")]
    Lock { path: PathBuf, waited: Duration },
}
