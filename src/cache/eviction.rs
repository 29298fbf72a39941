//! Eviction Engine
//!
//! Background task that keeps the data store under the configured byte
//! bound and, when idle expiry is enabled, drops entries nobody touched
//! for too long.
//!
//! # Flow
//!
//! ```text
//! admission ──notify(key)──▶ [request channel] ──▶ run loop ──▶ evict_pass
//!                                                      │
//!                              interval tick ──────────┼──▶ expire_pass
//!                                                      │
//! quiesce() ◀──────── completed sequence (watch) ◀─────┘
//! ```
//!
//! Requests carry a sequence number; after each pass the engine publishes
//! the highest sequence it has handled, which is what `quiesce` waits on.
//! Shutdown is only observed between passes so a pass never stops halfway
//! through removing an entry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::entry::{CacheKey, StatRecord};
use super::state::CacheState;
use crate::domain::events::CacheEvent;
use crate::error::{Error, Result};

// =============================================================================
// Reports
// =============================================================================

/// Outcome of one eviction or expiry pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Removed entries with their sizes, in removal order
    pub removed: Vec<(CacheKey, u64)>,
    /// Victims skipped because they were touched or pinned after planning
    pub skipped: usize,
    /// Victims whose removal failed (retried on the next pass)
    pub failures: usize,
}

impl EvictionReport {
    pub fn freed_bytes(&self) -> u64 {
        self.removed.iter().map(|(_, s)| s).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.skipped == 0 && self.failures == 0
    }
}

/// Snapshots taken by one pass when victims keep changing under it
const MAX_PLAN_ROUNDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Evict,
    Expire,
}

// =============================================================================
// Passes
// =============================================================================

/// Bring usage back under the bound, oldest access first.
///
/// `protect` is the key whose admission triggered the pass.
#[instrument(skip(state))]
pub(crate) async fn evict_pass(state: &CacheState, protect: Option<&CacheKey>) -> EvictionReport {
    state.metrics.record_eviction_pass();
    state.locks.prune();
    let cleared = state.meta.retry_orphans().await;
    if cleared > 0 {
        debug!(cleared, "Removed orphaned stat records");
    }

    let mut report = EvictionReport::default();
    for round in 1..=MAX_PLAN_ROUNDS {
        let total = state.data.total_bytes();
        if !state.policy.limit.exceeded_by(total) {
            return report;
        }

        let snapshot = state.meta.snapshot();
        let victims = state
            .policy
            .plan_victims(&snapshot, total, protect, |k| state.pins.is_pinned(k));
        debug!(
            round,
            total_bytes = total,
            victims = victims.len(),
            "Planned eviction"
        );
        if victims.is_empty() {
            break;
        }

        let skipped = report.skipped;
        for (key, _) in victims {
            if !state.policy.limit.exceeded_by(state.data.total_bytes()) {
                break;
            }
            let planned = planned_record(&snapshot, &key);
            remove_victim(state, &key, planned, Removal::Evict, &mut report).await;
        }

        // Victims read or pinned since the snapshot were skipped; replan
        // against fresh access times.
        if report.skipped == skipped {
            break;
        }
    }

    if state.policy.limit.exceeded_by(state.data.total_bytes()) {
        debug!(
            total_bytes = state.data.total_bytes(),
            "Still over the limit after pass; retrying on next admission"
        );
    }
    report
}

/// Drop entries idle for longer than the configured expiry
#[instrument(skip(state))]
pub(crate) async fn expire_pass(state: &CacheState) -> EvictionReport {
    let mut report = EvictionReport::default();
    let snapshot = state.meta.snapshot();
    let expired = state
        .policy
        .expired(&snapshot, Utc::now(), |k| state.pins.is_pinned(k));

    for key in expired {
        let planned = planned_record(&snapshot, &key);
        remove_victim(state, &key, planned, Removal::Expire, &mut report).await;
    }
    report
}

fn planned_record<'a>(
    snapshot: &'a [(CacheKey, StatRecord)],
    key: &CacheKey,
) -> Option<&'a StatRecord> {
    snapshot
        .binary_search_by(|(k, _)| k.cmp(key))
        .ok()
        .map(|i| &snapshot[i].1)
}

/// Remove one planned victim under its key lock
async fn remove_victim(
    state: &CacheState,
    key: &CacheKey,
    planned: Option<&StatRecord>,
    kind: Removal,
    report: &mut EvictionReport,
) {
    let _guard = state.locks.lock(key).await;

    // Re-check under the lock: the entry may have been read, rewritten,
    // removed or opened since the snapshot was taken.
    let current = state.meta.get(key);
    let unchanged = match (current.as_ref(), planned) {
        (Some(now), Some(then)) => now.last_access == then.last_access,
        _ => false,
    };
    if !unchanged || state.pins.is_pinned(key) {
        report.skipped += 1;
        return;
    }

    match state.purge(key).await {
        Ok(freed) => {
            let size = freed.unwrap_or(0);
            report.removed.push((key.clone(), size));
            match kind {
                Removal::Evict => {
                    state.metrics.record_eviction(size);
                    info!(key = %key, bytes = size, "Evicted cache entry");
                    state.publish(CacheEvent::evicted(key.as_str(), size)).await;
                }
                Removal::Expire => {
                    state.metrics.record_expiration(size);
                    info!(key = %key, bytes = size, "Expired idle cache entry");
                    state.publish(CacheEvent::expired(key.as_str(), size)).await;
                }
            }
        }
        Err(e) => {
            let err = Error::Eviction {
                key: key.to_string(),
                reason: e.to_string(),
            };
            warn!(error = %err, "Skipping victim");
            state.metrics.record_eviction_failure();
            report.failures += 1;
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Debug)]
struct EvictionRequest {
    seq: u64,
    trigger: Option<CacheKey>,
}

struct Submitter {
    tx: mpsc::UnboundedSender<EvictionRequest>,
    last_seq: u64,
}

/// Handle to the background eviction task
pub struct EvictionEngine {
    submitter: Mutex<Submitter>,
    done_rx: watch::Receiver<u64>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EvictionEngine {
    /// Spawn the engine on the current runtime.
    ///
    /// `expiry_interval` enables the periodic idle scan.
    pub(crate) fn spawn(state: Arc<CacheState>, expiry_interval: Option<Duration>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(0u64);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run(state, rx, done_tx, cancel.clone(), expiry_interval));

        Self {
            submitter: Mutex::new(Submitter { tx, last_seq: 0 }),
            done_rx,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue a check triggered by an admission of `trigger`.
    ///
    /// Returns the request's sequence number without waiting for the pass.
    pub fn notify(&self, trigger: Option<CacheKey>) -> Result<u64> {
        // Sequence assignment and send happen under one lock so the
        // channel carries requests in sequence order.
        let mut submitter = self.submitter.lock();
        let seq = submitter.last_seq + 1;
        submitter
            .tx
            .send(EvictionRequest { seq, trigger })
            .map_err(|_| Error::EngineStopped)?;
        submitter.last_seq = seq;
        Ok(seq)
    }

    /// Highest sequence number fully processed
    pub fn completed(&self) -> u64 {
        *self.done_rx.borrow()
    }

    /// Wait until every request submitted before this call has been handled.
    ///
    /// Returns immediately once the engine has stopped.
    pub async fn quiesce(&self) {
        let target = self.submitter.lock().last_seq;
        let mut done = self.done_rx.clone();
        loop {
            if *done.borrow_and_update() >= target {
                return;
            }
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop after the in-flight pass, if any, and wait for the task to exit
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Eviction task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl Drop for EvictionEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Engine main loop
async fn run(
    state: Arc<CacheState>,
    mut rx: mpsc::UnboundedReceiver<EvictionRequest>,
    done_tx: watch::Sender<u64>,
    cancel: CancellationToken,
    expiry_interval: Option<Duration>,
) {
    info!(
        limit = ?state.policy.limit.max_total_bytes,
        expire_after = ?state.policy.expire_after,
        "Starting eviction engine"
    );

    let mut expiry_tick = expiry_interval.map(|period| {
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick
    });

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("Eviction engine shutting down");
                break;
            }

            request = rx.recv() => {
                let Some(first) = request else {
                    break;
                };
                // Coalesce everything queued so far into one pass
                let mut latest = first;
                let mut batched = 1usize;
                while let Ok(next) = rx.try_recv() {
                    latest = next;
                    batched += 1;
                }

                let report = evict_pass(&state, latest.trigger.as_ref()).await;
                if !report.is_empty() {
                    debug!(
                        batched,
                        removed = report.removed.len(),
                        freed_bytes = report.freed_bytes(),
                        skipped = report.skipped,
                        failures = report.failures,
                        "Eviction pass complete"
                    );
                }
                done_tx.send_replace(latest.seq);
            }

            _ = next_tick(&mut expiry_tick) => {
                let report = expire_pass(&state).await;
                if !report.removed.is_empty() {
                    info!(
                        expired = report.removed.len(),
                        freed_bytes = report.freed_bytes(),
                        "Idle expiry pass complete"
                    );
                }
            }
        }
    }
}

async fn next_tick(tick: &mut Option<Interval>) {
    match tick {
        Some(tick) => {
            tick.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
