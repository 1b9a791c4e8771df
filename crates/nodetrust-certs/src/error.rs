//! Error types for certificate distribution
//!
//! Store failures during synchronization and watching are handled where
//! they happen and only logged. What reaches callers is either a fatal
//! startup condition that must abort the process, or a call made in the
//! wrong lifecycle phase.

use std::fmt;

use thiserror::Error;

use crate::store::StoreError;

/// Startup phase that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPhase {
    /// Publishing the local certificate
    Publish,
    /// Initial listing of peers
    Sync,
}

impl fmt::Display for StartupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publish => f.write_str("publish"),
            Self::Sync => f.write_str("sync"),
        }
    }
}

/// Main error type for certificate distribution
#[derive(Debug, Error)]
pub enum Error {
    /// Startup cannot continue; the node must not run without trust
    #[error("fatal startup error during {phase}: {source}")]
    FatalStartup {
        /// Phase that failed
        phase: StartupPhase,
        /// What went wrong
        source: StoreError,
    },

    /// Operation invoked in the wrong lifecycle phase
    #[error("lifecycle error: {operation} requires phase {expected}, currently {actual}")]
    Lifecycle {
        /// Operation that was attempted
        operation: &'static str,
        /// Phase the operation requires
        expected: String,
        /// Phase the distributor is in
        actual: String,
    },
}

impl Error {
    /// Create a fatal startup error
    pub fn fatal_startup(phase: StartupPhase, source: StoreError) -> Self {
        Self::FatalStartup { phase, source }
    }

    /// Create a lifecycle ordering error
    pub fn lifecycle(
        operation: &'static str,
        expected: impl fmt::Display,
        actual: impl fmt::Display,
    ) -> Self {
        Self::Lifecycle {
            operation,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Whether the process must abort
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalStartup { .. })
    }
}
