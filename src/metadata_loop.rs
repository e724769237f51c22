//! Metadata Refresh Loop (C2): periodic and on-demand metadata refresh with
//! retry/backoff and trigger coalescing (spec §4.2).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::config::MetadataConfig;
use crate::liveness::LivenessHandle;
use crate::merge::TopicsManager;

/// Sender handles for the two trigger channels described in spec §4.2:
/// capacity 1, non-blocking send that drops when full.
#[derive(Clone)]
pub struct MetadataTriggers {
    pub soft: mpsc::Sender<()>,
    pub hard: mpsc::Sender<()>,
}

impl MetadataTriggers {
    /// "Update when appropriate": coalesces with any other pending soft
    /// trigger.
    pub fn request_soft_refresh(&self) {
        let _ = self.soft.try_send(());
    }

    /// "Update now, regardless of min-age": coalesces with any other
    /// pending hard trigger.
    pub fn request_hard_refresh(&self) {
        let _ = self.hard.try_send(());
    }
}

pub fn new_triggers() -> (MetadataTriggers, mpsc::Receiver<()>, mpsc::Receiver<()>) {
    let (soft_tx, soft_rx) = mpsc::channel(1);
    let (hard_tx, hard_rx) = mpsc::channel(1);
    (
        MetadataTriggers {
            soft: soft_tx,
            hard: hard_tx,
        },
        soft_rx,
        hard_rx,
    )
}

/// Runs the metadata refresh loop until `shutdown` fires. Spawn this with
/// `tokio::spawn`; it never returns otherwise.
pub async fn run(
    topics: Arc<TopicsManager>,
    config: MetadataConfig,
    mut soft_rx: mpsc::Receiver<()>,
    mut hard_rx: mpsc::Receiver<()>,
    shutdown: Arc<Notify>,
    liveness: Option<LivenessHandle>,
) {
    let mut last_refresh: Option<Instant> = None;
    let mut consecutive_errors: u32 = 0;
    let mut ticker = tokio::time::interval(config.max_age());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    'outer: loop {
        let mut is_hard_trigger;
        tokio::select! {
            _ = ticker.tick() => { is_hard_trigger = false; }
            Some(()) = soft_rx.recv() => { is_hard_trigger = false; }
            Some(()) = hard_rx.recv() => { is_hard_trigger = true; }
            _ = shutdown.notified() => break 'outer,
        }

        if !is_hard_trigger {
            if let Some(last) = last_refresh {
                let elapsed = last.elapsed();
                if elapsed < config.min_age() {
                    let remaining = config.min_age() - elapsed;
                    tokio::select! {
                        _ = tokio::time::sleep(remaining) => {}
                        Some(()) = hard_rx.recv() => { is_hard_trigger = true; }
                        _ = shutdown.notified() => break 'outer,
                    }
                }
            }
        } else {
            tokio::select! {
                _ = tokio::time::sleep(config.hard_trigger_coalesce()) => {}
                _ = shutdown.notified() => break 'outer,
            }
        }

        drain(&mut soft_rx);
        drain(&mut hard_rx);

        let mut hard_attempts: u32 = 0;
        loop {
            record_attempt();
            let outcome = topics.refresh(false).await;
            let (needs_retry, errored) = match &outcome {
                Ok(o) => (o.needs_retry, false),
                Err(e) => {
                    warn!(error = %e, "metadata refresh failed");
                    (false, true)
                }
            };

            if (needs_retry || errored) && is_hard_trigger && hard_attempts < config.kafka_hard_trigger_max_attempts {
                hard_attempts += 1;
                debug!(hard_attempts, "retrying metadata refresh immediately");
                continue;
            }

            if errored {
                consecutive_errors += 1;
                metrics::counter!("metadata_refresh_errors_total").increment(1);
                let backoff = config.retry_backoff(consecutive_errors);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.notified() => break 'outer,
                }
            } else {
                consecutive_errors = 0;
                last_refresh = Some(Instant::now());
                if let Some(h) = &liveness {
                    h.report_healthy();
                }
            }
            break;
        }
    }
}

fn drain<T>(rx: &mut mpsc::Receiver<T>) {
    while rx.try_recv().is_ok() {}
}

/// Exposed for tests/metrics: how many refresh attempts have happened in
/// the current process, independent of the loop's own state.
pub static REFRESH_ATTEMPTS: AtomicU32 = AtomicU32::new(0);

pub fn record_attempt() {
    REFRESH_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
    metrics::counter!("metadata_refresh_attempts_total").increment(1);
}
