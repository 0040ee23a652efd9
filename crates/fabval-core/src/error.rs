//! Error types for the fabric validation core.

use thiserror::Error;

/// Structural failures. Any of these aborts a run before (or instead of)
/// executing checks; per-device problems never surface here.
#[derive(Debug, Error)]
pub enum FabricError {
    /// The topology description failed validation.
    #[error("malformed topology: {reason}")]
    MalformedTopology {
        /// What was wrong with the description.
        reason: String,
    },

    /// A versioned input declared a schema version this build does not read.
    #[error("unsupported {what} version {got} (supported: {supported})")]
    UnsupportedVersion {
        /// Which input carried the version.
        what: &'static str,
        /// Version found in the input.
        got: u32,
        /// Version understood by this build.
        supported: u32,
    },

    /// Input could not be decoded at all.
    #[error("parse error: {0}")]
    Parse(String),

    /// The worker pool could not be started.
    #[error("worker pool: {0}")]
    WorkerPool(String),

    /// A baseline could not be loaded.
    #[error("baseline error: {0}")]
    Baseline(String),

    /// A check id was registered twice.
    #[error("duplicate check id: {0}")]
    DuplicateCheck(String),

    /// A check id was referenced but never registered.
    #[error("unknown check id: {0}")]
    UnknownCheck(String),

    /// A device id was referenced but is not in the topology.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl FabricError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        FabricError::MalformedTopology {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FabricError>;
