//! Best-effort "keep the display awake" capability

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WakeLockError {
    #[error("Wake lock not supported on this host")]
    Unsupported,
    #[error("Wake lock request denied: {0}")]
    Denied(String),
}

/// Token returned by a successful request
#[derive(Debug)]
pub struct WakeLockHandle(pub u64);

pub trait WakeLock: Send {
    fn request(&mut self) -> Result<WakeLockHandle, WakeLockError>;
    fn release(&mut self, handle: WakeLockHandle) -> Result<(), WakeLockError>;
}

/// Host without a wake lock
#[derive(Debug, Default)]
pub struct NoWakeLock;

impl WakeLock for NoWakeLock {
    fn request(&mut self) -> Result<WakeLockHandle, WakeLockError> {
        Err(WakeLockError::Unsupported)
    }

    fn release(&mut self, _handle: WakeLockHandle) -> Result<(), WakeLockError> {
        Ok(())
    }
}
