//! Bounded retry envelope around transactional requests that encounter a
//! "concurrent transactions" broker error (C6, spec §4.6 / P7).

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::debug;

use crate::error::ConcurrentTxnError;

/// Returned by the wrapped operation to tell the envelope whether to retry.
pub enum Outcome<T> {
    Done(T),
    ConcurrentTransactions,
}

/// Retries `f` while it reports `ConcurrentTransactions`, as long as less
/// than `window` wall-clock time has elapsed since the first attempt (P7).
/// `shutdown` cancels an in-progress backoff sleep.
pub async fn with_concurrent_txn_retry<T, E, F, Fut>(
    name: &str,
    backoff: Duration,
    window: Duration,
    shutdown: &Notify,
    mut f: F,
) -> Result<T, ConcurrentTxnError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Outcome<T>, E>>,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        match f().await.map_err(ConcurrentTxnError::Inner)? {
            Outcome::Done(value) => return Ok(value),
            Outcome::ConcurrentTransactions => {
                if started.elapsed() >= window {
                    return Err(ConcurrentTxnError::WindowExceeded);
                }
                attempt += 1;
                debug!(name, attempt, ?backoff, "retrying after ConcurrentTransactions");
                metrics::counter!("concurrent_txn_retries_total").increment(1);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.notified() => return Err(ConcurrentTxnError::ShuttingDown),
                }
            }
        }
    }
}
