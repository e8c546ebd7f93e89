use thiserror::Error;

/// Errors surfaced by the nap controller and its collaborators.
///
/// Races between timers, stream deliveries and `stop()` never show up here;
/// those are settled inside the controller by epoch comparison.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NapError {
    #[error("invalid nap configuration: {0}")]
    InvalidConfig(String),

    #[error("a nap session is already active")]
    AlreadyActive,

    /// REM-based early wake is unavailable for the rest of the session.
    #[error("sleep sample stream unavailable: {0}")]
    StreamUnavailable(String),

    #[error("wake sink failed to alert: {0}")]
    SinkFailure(String),

    #[error("failed to load observations: {0}")]
    Load(String),
}
