//! Per-connection mutual exclusion.
//!
//! A [`ConnectionGuard`] admits one holder at a time. Holding it is expressed by
//! owning a [`GuardPermit`]; the permit is released when dropped, so a batch that
//! is abandoned halfway (or panics) still frees the connection.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Single-slot lock shared by every caller of one connection.
///
/// # Example
///
/// ```
/// use pmac_remote::guard::ConnectionGuard;
///
/// # tokio_test::block_on(async {
/// let guard = ConnectionGuard::new();
/// let permit = guard.acquire().await;
/// assert!(guard.try_acquire().is_none());
/// drop(permit);
/// assert!(!guard.is_held());
/// # })
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionGuard {
    slot: Arc<Semaphore>,
}

/// Proof of exclusive access to a connection.
#[derive(Debug)]
pub struct GuardPermit {
    _permit: OwnedSemaphorePermit,
}

impl Default for ConnectionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionGuard {
    /// Create an unheld guard.
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait until the guard is free and take it.
    pub async fn acquire(&self) -> GuardPermit {
        let permit = match self.slot.clone().acquire_owned().await {
            Ok(permit) => permit,
            // The semaphore is never closed while a ConnectionGuard exists.
            Err(_) => unreachable!("connection guard semaphore closed"),
        };
        GuardPermit { _permit: permit }
    }

    /// Take the guard only if nobody holds it.
    pub fn try_acquire(&self) -> Option<GuardPermit> {
        match self.slot.clone().try_acquire_owned() {
            Ok(permit) => Some(GuardPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    /// `true` while some caller owns a permit.
    pub fn is_held(&self) -> bool {
        self.slot.available_permits() == 0
    }
}
