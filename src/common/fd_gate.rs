use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Process-wide bound on concurrently accepted sockets.
///
/// Listeners acquire a permit before every `accept` and the permit rides
/// with the handler task, releasing itself on drop. The gate never rejects:
/// at the limit, `acquire` parks the accept loop until a handler finishes.
/// This keeps the process under its file-descriptor ulimit without turning
/// overload into connection errors.
pub struct FdGate {
    sem: Arc<Semaphore>,
    max: usize,
}

pub type FdPermit = OwnedSemaphorePermit;

impl FdGate {
    pub fn new(max: usize) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(max)),
            max,
        }
    }

    pub async fn acquire(&self) -> FdPermit {
        match self.sem.clone().acquire_owned().await {
            Ok(permit) => permit,
            // The semaphore is never closed.
            Err(_) => unreachable!("fd gate semaphore closed"),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Permits currently handed out.
    pub fn in_use(&self) -> usize {
        self.max - self.sem.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn bounds_concurrent_permits() {
        let gate = FdGate::new(2);
        let p1 = gate.acquire().await;
        let _p2 = gate.acquire().await;
        assert_eq!(gate.in_use(), 2);

        // third acquire blocks until a permit is returned
        let blocked = tokio::time::timeout(Duration::from_millis(20), gate.acquire()).await;
        assert!(blocked.is_err());

        drop(p1);
        let _p3 = tokio::time::timeout(Duration::from_millis(100), gate.acquire())
            .await
            .expect("permit should free up");
        assert_eq!(gate.in_use(), 2);
    }

    #[tokio::test]
    async fn never_exceeds_max() {
        let gate = FdGate::new(4);
        let mut permits = Vec::new();
        for _ in 0..4 {
            permits.push(gate.acquire().await);
        }
        assert_eq!(gate.in_use(), gate.max());
        permits.clear();
        assert_eq!(gate.in_use(), 0);
    }
}
