use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::ActivationError;

/// Bounds how many groups may be starting up at once.
#[derive(Debug, Clone)]
pub struct StartupThrottle {
    permits: Arc<Semaphore>,
    next_name: Arc<AtomicU64>,
}

/// Admission to start one group process. Releases its slot when dropped.
#[derive(Debug)]
pub struct ThrottlePermit {
    name: String,
    _permit: OwnedSemaphorePermit,
}

impl ThrottlePermit {
    /// Process name assigned with this admission (`Group-N`).
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl StartupThrottle {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity.max(1))),
            next_name: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Waits for a free slot. Waiters are admitted in arrival order.
    pub async fn acquire(&self) -> Result<ThrottlePermit, ActivationError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ActivationError::ShuttingDown)?;
        let n = self.next_name.fetch_add(1, Ordering::Relaxed);
        Ok(ThrottlePermit {
            name: format!("Group-{n}"),
            _permit: permit,
        })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Fails every current and future `acquire`.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn release_admits_next_waiter() {
        let throttle = StartupThrottle::new(1);
        let first = throttle.acquire().await.unwrap();
        assert_eq!(first.name(), "Group-0");

        let waiter = {
            let throttle = throttle.clone();
            tokio::spawn(async move { throttle.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.name(), "Group-1");
        assert_eq!(throttle.available(), 0);
    }

    #[tokio::test]
    async fn close_fails_waiters() {
        let throttle = StartupThrottle::new(1);
        let _held = throttle.acquire().await.unwrap();
        let waiter = {
            let throttle = throttle.clone();
            tokio::spawn(async move { throttle.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        throttle.close();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(ActivationError::ShuttingDown)
        ));
    }
}
