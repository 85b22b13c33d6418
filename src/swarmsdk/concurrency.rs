//! Capacity limiters and cooperative deadlines.
//!
//! Two levels of concurrency control run through a swarm:
//!
//! - a *global* [`CapacityLimiter`] shared by every agent, bounding
//!   concurrent in-flight LLM requests across the whole swarm tree;
//! - a *local* limiter per agent, bounding parallel tool executions within
//!   one turn.
//!
//! A capacity-1 limiter doubles as the per-agent *ask-semaphore* that
//! serializes concurrent `ask` calls so conversation messages can never
//! interleave.
//!
//! All waiting is cooperative: permits are acquired with `.await`, and
//! wall-clock deadlines are enforced with [`deadline`], which cancels
//! in-flight child futures on expiry by dropping them.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A shareable semaphore with a fixed capacity.
///
/// Cloning hands out another handle onto the same permit pool.
#[derive(Clone)]
pub struct CapacityLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl CapacityLimiter {
    /// Create a limiter with `capacity` permits.  Zero is clamped to one —
    /// a zero-capacity semaphore would deadlock every acquire.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        CapacityLimiter {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a permit.  The permit is released when the returned guard
    /// drops.
    pub async fn acquire(&self) -> CapacityPermit {
        // The semaphore lives as long as the limiter and is never closed.
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("capacity limiter semaphore closed");
        CapacityPermit { _permit: permit }
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// RAII guard for one unit of capacity.
pub struct CapacityPermit {
    _permit: OwnedSemaphorePermit,
}

/// Outcome of [`deadline`] when the wrapped future did not finish in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlineExceeded;

/// Run `future` under an optional wall-clock deadline.
///
/// With `limit = None` the future simply runs to completion.  On expiry the
/// future is dropped, cancelling all of its in-flight child work at the next
/// await point.
pub async fn deadline<F, T>(limit: Option<Duration>, future: F) -> Result<T, DeadlineExceeded>
where
    F: std::future::Future<Output = T>,
{
    match limit {
        Some(duration) => tokio::time::timeout(duration, future)
            .await
            .map_err(|_| DeadlineExceeded),
        None => Ok(future.await),
    }
}
