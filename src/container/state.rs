//! Per-container power lock and phase-transition flags
//!
//! The power lock ensures only one power operation (start/stop/kill)
//! runs at a time per container; the removing flag uses the same
//! compare-exchange "try-start" idiom to make the `removing` phase
//! transition race-free.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit, TryAcquireError};

#[derive(Debug, Error)]
pub enum LockerError {
    #[error("lock is currently held")]
    Busy,

    #[error("lock acquisition was cancelled")]
    Cancelled,

    #[error("lock acquisition timed out")]
    Timeout,
}

/// A sequential locker ensuring only one power operation runs at a time
/// for a given container.
pub struct Locker {
    semaphore: Semaphore,
}

impl Locker {
    pub fn new() -> Self {
        Self { semaphore: Semaphore::new(1) }
    }

    pub async fn acquire(&self) -> Result<LockerGuard<'_>, LockerError> {
        let permit = self.semaphore.acquire().await.map_err(|_| LockerError::Cancelled)?;
        Ok(LockerGuard { _permit: permit })
    }

    pub fn try_acquire(&self) -> Result<LockerGuard<'_>, LockerError> {
        match self.semaphore.try_acquire() {
            Ok(permit) => Ok(LockerGuard { _permit: permit }),
            Err(TryAcquireError::NoPermits) => Err(LockerError::Busy),
            Err(TryAcquireError::Closed) => Err(LockerError::Cancelled),
        }
    }

    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<LockerGuard<'_>, LockerError> {
        match tokio::time::timeout(timeout, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => Ok(LockerGuard { _permit: permit }),
            Ok(Err(_)) => Err(LockerError::Cancelled),
            Err(_) => Err(LockerError::Timeout),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

impl Default for Locker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct LockerGuard<'a> {
    _permit: SemaphorePermit<'a>,
}

/// Atomic flags layered on top of the power lock for transitions that
/// need a try-start idiom rather than blocking acquisition.
#[derive(Debug, Default)]
pub struct ContainerFlags {
    removing: AtomicBool,
}

impl ContainerFlags {
    pub fn new() -> Self {
        Self { removing: AtomicBool::new(false) }
    }

    pub fn is_removing(&self) -> bool {
        self.removing.load(Ordering::SeqCst)
    }

    /// Returns `false` if a remove is already in flight.
    pub fn try_start_removing(&self) -> bool {
        self.removing.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    pub fn clear_removing(&self) {
        self.removing.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn locker_serializes_acquisition() {
        let locker = Locker::new();
        assert!(!locker.is_locked());
        let guard = locker.acquire().await.unwrap();
        assert!(locker.is_locked());
        assert!(locker.try_acquire().is_err());
        drop(guard);
        assert!(!locker.is_locked());
    }

    #[tokio::test]
    async fn locker_times_out() {
        let locker = Locker::new();
        let _guard = locker.acquire().await.unwrap();
        let result = locker.acquire_timeout(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(LockerError::Timeout)));
    }

    #[test]
    fn try_start_removing_is_exclusive() {
        let flags = ContainerFlags::new();
        assert!(flags.try_start_removing());
        assert!(!flags.try_start_removing());
        flags.clear_removing();
        assert!(flags.try_start_removing());
    }
}
