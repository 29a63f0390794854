use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::StoreError;

/// A live handle to a storage engine
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Cheap round trip proving the engine is reachable
    async fn ping(&self) -> Result<(), StoreError>;

    /// Release the handle. Calls after the first are no-ops.
    async fn close(&self) -> Result<(), StoreError>;

    fn driver_name(&self) -> &'static str;
}

/// How long a replacement connection may take to become reachable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapPolicy {
    pub interval: Duration,
    pub ceiling: Duration,
}

impl Default for SwapPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            ceiling: Duration::from_secs(7),
        }
    }
}

/// Owns the single live connection of a backend and replaces it atomically.
///
/// Readers hold a shared guard for the whole duration of a call. A swap
/// validates the candidate without any lock, then takes the exclusive lock,
/// installs the candidate and closes the old handle before releasing it, so
/// no reader ever observes a closed or half-installed connection.
pub struct ConnectionManager<C: Connection> {
    slot: RwLock<Option<C>>,
    swap_gate: Mutex<()>,
    policy: SwapPolicy,
    generation: AtomicU64,
}

impl<C: Connection> ConnectionManager<C> {
    pub fn new(initial: C, policy: SwapPolicy) -> Self {
        Self {
            slot: RwLock::new(Some(initial)),
            swap_gate: Mutex::new(()),
            policy,
            generation: AtomicU64::new(1),
        }
    }

    /// Number of connections installed so far, starting at 1
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Shared access to the current connection. Swaps wait until the
    /// returned guard is dropped.
    pub async fn acquire(&self) -> Result<RwLockReadGuard<'_, C>, StoreError> {
        let guard = self.slot.read().await;
        RwLockReadGuard::try_map(guard, Option::as_ref)
            .map_err(|_| StoreError::connection("connection is closed"))
    }

    /// Round trip to the current connection, bounded by `deadline`
    pub async fn ping(&self, deadline: Duration) -> Result<(), StoreError> {
        let started = Instant::now();
        let result = timeout(deadline, async {
            let conn = self.acquire().await?;
            conn.ping().await
        })
        .await
        .map_err(|_| {
            StoreError::connection(format!("ping exceeded deadline of {:?}", deadline))
        })?;

        debug!(
            response_time_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Ping completed"
        );
        result
    }

    /// Replace the live connection with `candidate`.
    ///
    /// The candidate is pinged every `interval` until it answers or
    /// `ceiling` elapses. On failure the candidate is closed and the current
    /// connection stays installed. Dropping the returned future before the
    /// exclusive lock is taken leaves the current connection untouched.
    pub async fn swap(&self, candidate: C) -> Result<(), StoreError> {
        let _gate = self.swap_gate.lock().await;
        let driver = candidate.driver_name();
        let started = Instant::now();

        if let Err(e) = self.await_reachable(&candidate).await {
            warn!(driver, error = %e, "Replacement connection never became reachable");
            if let Err(close_err) = candidate.close().await {
                debug!(driver, error = %close_err, "Failed to close rejected connection");
            }
            return Err(e);
        }

        let mut slot = self.slot.write().await;
        let previous = slot.replace(candidate);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        if let Some(old) = previous
            && let Err(e) = old.close().await
        {
            warn!(driver, error = %e, "Failed to close previous connection after swap");
        }
        drop(slot);

        info!(
            driver,
            generation,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Connection swapped"
        );
        Ok(())
    }

    /// Close and remove the live connection. Later calls fail with
    /// `Connection` errors.
    pub async fn close(&self) -> Result<(), StoreError> {
        let _gate = self.swap_gate.lock().await;
        let mut slot = self.slot.write().await;
        match slot.take() {
            Some(conn) => {
                let driver = conn.driver_name();
                conn.close().await?;
                info!(driver, "Connection closed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn await_reachable(&self, candidate: &C) -> Result<(), StoreError> {
        let SwapPolicy { interval, ceiling } = self.policy;
        let attempts = async {
            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                match candidate.ping().await {
                    Ok(()) => return attempt,
                    Err(e) => debug!(attempt, error = %e, "Replacement connection not ready"),
                }
                sleep(interval).await;
            }
        };

        match timeout(ceiling, attempts).await {
            Ok(attempt) => {
                debug!(attempt, "Replacement connection reachable");
                Ok(())
            }
            Err(_) => Err(StoreError::connection(format!(
                "replacement {} connection unreachable after {:?}",
                candidate.driver_name(),
                ceiling
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    struct FakeConnection {
        id: u32,
        reachable_after: u32,
        pings: AtomicU64,
        closed: AtomicBool,
    }

    impl FakeConnection {
        fn new(id: u32) -> Self {
            Self::reachable_after(id, 0)
        }

        fn reachable_after(id: u32, pings: u32) -> Self {
            Self {
                id,
                reachable_after: pings,
                pings: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn ping(&self) -> Result<(), StoreError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(StoreError::connection("closed"));
            }
            let seen = self.pings.fetch_add(1, Ordering::SeqCst);
            if seen < self.reachable_after as u64 {
                return Err(StoreError::connection("not ready"));
            }
            Ok(())
        }

        async fn close(&self) -> Result<(), StoreError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn driver_name(&self) -> &'static str {
            "fake"
        }
    }

    fn fast_policy() -> SwapPolicy {
        SwapPolicy {
            interval: Duration::from_millis(10),
            ceiling: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = SwapPolicy::default();
        assert_eq!(policy.interval, Duration::from_millis(500));
        assert_eq!(policy.ceiling, Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_swap_installs_reachable_candidate() {
        let manager = ConnectionManager::new(FakeConnection::new(1), fast_policy());
        manager
            .swap(FakeConnection::reachable_after(2, 3))
            .await
            .expect("swap should succeed");

        assert_eq!(manager.acquire().await.unwrap().id, 2);
        assert_eq!(manager.generation(), 2);
        assert!(manager.ping(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_candidate_keeps_current() {
        let manager = ConnectionManager::new(FakeConnection::new(1), fast_policy());
        let err = manager
            .swap(FakeConnection::reachable_after(2, u32::MAX))
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Connection(_)));
        let current = manager.acquire().await.unwrap();
        assert_eq!(current.id, 1);
        assert!(!current.closed.load(Ordering::SeqCst));
        assert_eq!(manager.generation(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_swap_leaves_current_installed() {
        let manager = Arc::new(ConnectionManager::new(
            FakeConnection::new(1),
            SwapPolicy {
                interval: Duration::from_millis(10),
                ceiling: Duration::from_secs(5),
            },
        ));

        let swapping = Arc::clone(&manager);
        let handle = tokio::spawn(async move {
            swapping
                .swap(FakeConnection::reachable_after(2, u32::MAX))
                .await
        });
        sleep(Duration::from_millis(50)).await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        let current = manager.acquire().await.unwrap();
        assert_eq!(current.id, 1);
        assert!(!current.closed.load(Ordering::SeqCst));
        drop(current);
        assert!(manager.ping(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_close_then_acquire_fails() {
        let manager = ConnectionManager::new(FakeConnection::new(1), fast_policy());
        manager.close().await.unwrap();
        assert!(matches!(
            manager.acquire().await,
            Err(StoreError::Connection(_))
        ));
        assert!(manager.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_ping_deadline() {
        struct Hanging;

        #[async_trait]
        impl Connection for Hanging {
            async fn ping(&self) -> Result<(), StoreError> {
                sleep(Duration::from_secs(60)).await;
                Ok(())
            }
            async fn close(&self) -> Result<(), StoreError> {
                Ok(())
            }
            fn driver_name(&self) -> &'static str {
                "hanging"
            }
        }

        let manager = ConnectionManager::new(Hanging, fast_policy());
        let err = manager.ping(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, StoreError::Connection(_)));
    }
}
