//! Error types.

use thiserror::Error;

/// Result alias for supervisor operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Errors raised inside the start and stop sequences.
///
/// None of these escape [`Supervisor::start`](crate::Supervisor::start) or
/// [`Supervisor::stop`](crate::Supervisor::stop); they are logged there and
/// the only visible outcome is an absent endpoint.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Every port from the floor up to 65535 is already bound.
    #[error("no free port at or above {floor}")]
    ResourceExhausted {
        /// The lowest port that was considered.
        floor: u16,
    },

    /// Spawning, installing or starting the resolver failed, or its process
    /// could not be found afterwards.
    #[error("launch failed: {0}")]
    Launch(String),

    /// The resolver's configuration file could not be updated.
    #[error("config patch failed: {0}")]
    ConfigPatch(String),

    /// The caller's cancellation token fired while patching the config.
    #[error("operation cancelled")]
    Cancelled,

    /// Stopping the service or killing the process failed.
    #[error("teardown failed: {0}")]
    Teardown(String),

    /// Filesystem or process I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Returns `true` if the error came from a cancelled token.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` if the error is port exhaustion.
    #[must_use]
    pub const fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }
}
