//! Metadata Waiter (C1): blocks callers until metadata freshness crosses a
//! threshold, broadcasting to every waiter after each successful refresh.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The last update was already within the freshness threshold.
    AlreadyFresh,
    /// A successful update newer than the waiter's entry time arrived.
    Updated,
    TimedOut,
    CallerCancelled,
    ClientCancelled,
}

pub struct MetadataWaiter {
    last_updated: Mutex<Instant>,
    freshness: Duration,
    updated: Notify,
    hard_trigger: tokio::sync::mpsc::Sender<()>,
}

impl MetadataWaiter {
    pub fn new(freshness: Duration, hard_trigger: tokio::sync::mpsc::Sender<()>) -> Self {
        Self {
            // Start "stale": the very first waiter should trigger a refresh
            // rather than observe a spuriously-fresh epoch start.
            last_updated: Mutex::new(Instant::now() - freshness - Duration::from_secs(1)),
            freshness,
            updated: Notify::new(),
            hard_trigger,
        }
    }

    /// Called by the refresh loop (C2) after every successful refresh.
    /// Wakes every current waiter in one broadcast.
    pub fn signal_updated(&self) {
        *self.last_updated.lock().expect("metadata waiter mutex poisoned") = Instant::now();
        self.updated.notify_waiters();
    }

    /// Blocks until metadata freshness crossed the threshold, or one of
    /// `timeout`, `caller_cancel`, `client_shutdown` fires first.
    pub async fn wait(
        &self,
        timeout: Duration,
        caller_cancel: &Notify,
        client_shutdown: &Notify,
    ) -> WaitOutcome {
        let entry = Instant::now();
        let outcome = self.wait_inner(entry, timeout, caller_cancel, client_shutdown).await;
        metrics::histogram!("metadata_wait_seconds").record(entry.elapsed().as_secs_f64());
        outcome
    }

    async fn wait_inner(
        &self,
        entry: Instant,
        timeout: Duration,
        caller_cancel: &Notify,
        client_shutdown: &Notify,
    ) -> WaitOutcome {
        {
            let last = *self.last_updated.lock().expect("metadata waiter mutex poisoned");
            if entry.duration_since(last) < self.freshness {
                return WaitOutcome::AlreadyFresh;
            }
        }

        // Trigger an immediate refresh; non-blocking, drops if the hard
        // trigger channel (capacity 1) is already full.
        let _ = self.hard_trigger.try_send(());

        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        // Every exit path below returns directly; there is no separate
        // helper task to unblock, since `tokio::select!` drops the losing
        // branches' futures (including the `notified()` registration) the
        // moment one of them completes.
        loop {
            tokio::select! {
                _ = self.updated.notified() => {
                    let last = *self.last_updated.lock().expect("metadata waiter mutex poisoned");
                    if last > entry {
                        return WaitOutcome::Updated;
                    }
                    debug!("metadata waiter woke to a stale update, re-arming");
                }
                _ = &mut sleep => return WaitOutcome::TimedOut,
                _ = caller_cancel.notified() => return WaitOutcome::CallerCancelled,
                _ = client_shutdown.notified() => return WaitOutcome::ClientCancelled,
            }
        }
    }
}
