//! Counter of outstanding propagation attempts that can be awaited.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Wait-group style counter owned by one replica instance. Each propagation
/// attempt holds an `InFlightGuard`; dropping the last guard wakes whoever
/// waits in `wait_idle()`.
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicUsize,
    notify: Notify,
}

/// RAII token for one outstanding attempt.
#[derive(Debug)]
pub struct InFlightGuard {
    inflight: Arc<InFlight>,
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(InFlight::default())
    }

    /// Registers a new outstanding attempt.
    pub fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            inflight: self.clone(),
        }
    }

    /// Current number of outstanding attempts.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Waits until no attempt is outstanding.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register interest before checking to not miss a wakeup
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inflight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inflight.notify.notify_waiters();
        }
    }
}
