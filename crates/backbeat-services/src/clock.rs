//! Audio clock abstraction

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("Audio clock could not be resumed: {0}")]
    ResumeFailed(String),
}

/// Lifecycle of the audio device behind the clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Suspended,
    Running,
}

/// Monotonic time source owned by the audio subsystem.
///
/// Times are seconds on the device timeline; events scheduled against it
/// sound at exactly that time regardless of when the scheduling call ran.
pub trait AudioClock: Send + Sync {
    fn current_time(&self) -> f64;
    fn state(&self) -> ClockState;
    /// Blocks until the clock runs
    fn resume(&self) -> Result<(), ClockError>;
}
