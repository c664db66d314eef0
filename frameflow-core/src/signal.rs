use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

use tokio::sync::Semaphore;

/// Frame-arrival signal: a counting semaphore released once per successful
/// cache insert. It only says *that* a frame arrived, never which one; the
/// waiter re-probes the cache after every permit.
///
/// Permits are minted only while someone is registered as waiting, so an
/// hour of playback with nobody blocked does not pile up stale permits for
/// the next waiter to churn through.
pub(crate) struct FrameSignal {
    waiters: AtomicUsize,
    arrivals: Semaphore,
}

impl FrameSignal {
    pub(crate) fn new() -> FrameSignal {
        FrameSignal {
            waiters: AtomicUsize::new(0),
            arrivals: Semaphore::new(0),
        }
    }

    pub(crate) fn notify(&self) {
        if self.waiters.load(Relaxed) > 0 {
            self.arrivals.add_permits(1);
        }
    }

    pub(crate) fn register(&self) -> WaiterGuard<'_> {
        self.waiters.fetch_add(1, Relaxed);
        WaiterGuard(self)
    }

    /// Consumes one arrival permit.
    pub(crate) async fn acquire(&self) {
        if let Ok(permit) = self.arrivals.acquire().await {
            permit.forget();
        }
    }
}

pub(crate) struct WaiterGuard<'a>(&'a FrameSignal);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.waiters.fetch_sub(1, Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_notify_wakes_registered_waiter() {
        let signal = Arc::new(FrameSignal::new());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move {
                let _guard = signal.register();
                signal.acquire().await;
            })
        };
        // Give the waiter a chance to register before notifying.
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.notify();
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_notify_without_waiter_leaves_no_permit() {
        let signal = FrameSignal::new();
        signal.notify();
        let _guard = signal.register();
        assert!(timeout(Duration::from_millis(20), signal.acquire())
            .await
            .is_err());
    }
}
