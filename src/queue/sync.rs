//! Sync engine: queue-first writes and replay against the remote store.
//!
//! Entries for one visit replay strictly in sequence order, one at a time.
//! Different visits replay concurrently up to `parallelism`. Before each
//! replay the visit is re-read from the remote store (inside
//! [`VisitService::apply`]) and the request is planned against what is there
//! now, never against what the device saw when it queued the mutation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, warn};

use super::backoff::{self, backoff};
use super::storage::QueueStore;
use crate::error::{Error, Result, RetryClass};
use crate::event::{Event, EventKind};
use crate::lifecycle;
use crate::model::{EnqueueResult, EntryState, NewMutation, PendingMutation, VisitId};
use crate::service::{self, VisitService};
use crate::telemetry::metrics;
use crate::telemetry::sync::{record_state_transition, start_drain_span, start_mutation_span};

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Failed replays before an entry is marked failed and held for the user.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub backoff_base: Duration,
    /// Doublings after which the retry delay stops growing.
    pub backoff_max_exponent: u32,
    /// Bound on each remote call made during replay.
    pub remote_timeout: Duration,
    /// Visits replayed concurrently.
    pub parallelism: usize,
    /// Drain interval while online.
    pub poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: backoff::DEFAULT_BASE,
            backoff_max_exponent: backoff::DEFAULT_MAX_EXPONENT,
            remote_timeout: service::DEFAULT_REMOTE_TIMEOUT,
            parallelism: 4,
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// What a drain did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries whose change was written by this drain.
    pub committed: usize,
    /// Entries removed because the remote already reflected them.
    pub already_applied: usize,
    /// Entries discarded because the remote moved past them.
    pub conflicts: usize,
    /// Entries put back with a backoff deadline.
    pub retried: usize,
    /// Entries that moved to failed during this drain.
    pub failed: usize,
    /// Entries not attempted because an earlier entry for the same visit
    /// is failed, backing off, or was just retried.
    pub blocked: usize,
    /// Connectivity dropped; in-flight work was returned to pending.
    pub interrupted: bool,
    /// The drain did not run (offline, or another drain was active).
    pub skipped: bool,
}

impl DrainReport {
    fn merge(&mut self, other: DrainReport) {
        self.committed += other.committed;
        self.already_applied += other.already_applied;
        self.conflicts += other.conflicts;
        self.retried += other.retried;
        self.failed += other.failed;
        self.blocked += other.blocked;
        self.interrupted |= other.interrupted;
    }

    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// How a single replay settled.
enum Replay {
    Committed { already_applied: bool },
    Discarded,
    Retry,
    Failed,
    Interrupted,
}

pub struct SyncEngine {
    queue: Arc<QueueStore>,
    service: Arc<VisitService>,
    config: SyncConfig,
    connectivity: watch::Receiver<bool>,
    shutdown: Arc<Notify>,
    draining: Arc<tokio::sync::Mutex<()>>,
}

impl Clone for SyncEngine {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            service: Arc::clone(&self.service),
            config: self.config.clone(),
            connectivity: self.connectivity.clone(),
            shutdown: Arc::clone(&self.shutdown),
            draining: Arc::clone(&self.draining),
        }
    }
}

impl SyncEngine {
    /// `connectivity` carries `true` while the device is online.
    pub fn new(
        queue: Arc<QueueStore>,
        service: Arc<VisitService>,
        config: SyncConfig,
        connectivity: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            service,
            config,
            connectivity,
            shutdown: Arc::new(Notify::new()),
            draining: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn queue(&self) -> &Arc<QueueStore> {
        &self.queue
    }

    pub fn is_online(&self) -> bool {
        *self.connectivity.borrow()
    }

    /// Signal the run loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    // -----------------------------------------------------------------------
    // Queue operations
    // -----------------------------------------------------------------------

    /// Durably record a mutation. Never touches the network.
    pub fn enqueue(&self, mutation: NewMutation) -> Result<EnqueueResult> {
        let result = self.queue.enqueue(&mutation)?;
        let operation = match &result {
            EnqueueResult::Queued(entry) => {
                info!(seq = entry.seq, visit_id = %entry.visit_id, kind = %entry.kind(), "mutation queued");
                "enqueue"
            }
            EnqueueResult::Replaced(entry) => {
                info!(seq = entry.seq, visit_id = %entry.visit_id, kind = %entry.kind(), "queued mutation replaced");
                "replace"
            }
            EnqueueResult::Duplicate { .. } => "duplicate",
        };
        metrics::queue_operations().add(1, &[KeyValue::new("operation", operation)]);
        Ok(result)
    }

    pub fn list(&self, state: Option<EntryState>) -> Result<Vec<PendingMutation>> {
        self.queue.list(state)
    }

    /// Put a failed entry back in the queue for the next drain.
    pub fn retry(&self, seq: u64) -> Result<()> {
        self.queue.retry(seq)?;
        info!(seq, "failed mutation returned to queue");
        metrics::queue_operations().add(1, &[KeyValue::new("operation", "retry")]);
        Ok(())
    }

    pub fn retry_failed(&self) -> Result<Vec<u64>> {
        let seqs = self.queue.retry_failed()?;
        if !seqs.is_empty() {
            info!(count = seqs.len(), "failed mutations returned to queue");
            metrics::queue_operations()
                .add(seqs.len() as u64, &[KeyValue::new("operation", "retry")]);
        }
        Ok(seqs)
    }

    /// Drop a failed entry at the user's request.
    pub fn dismiss(&self, seq: u64) -> Result<PendingMutation> {
        let entry = self.queue.dismiss(seq)?;
        warn!(seq, visit_id = %entry.visit_id, kind = %entry.kind(), "failed mutation dismissed");
        metrics::queue_operations().add(1, &[KeyValue::new("operation", "dismiss")]);
        Ok(entry)
    }

    pub fn events_since(&self, seq: u64) -> Result<Vec<Event>> {
        self.queue.events_since(seq)
    }

    // -----------------------------------------------------------------------
    // Drain
    // -----------------------------------------------------------------------

    /// Replay queued mutations against the remote store.
    ///
    /// Skipped when offline or when another drain is already running.
    pub async fn drain(&self) -> Result<DrainReport> {
        let Ok(_guard) = self.draining.try_lock() else {
            debug!("drain already running");
            return Ok(DrainReport::skipped());
        };
        if !self.is_online() {
            debug!("offline; drain skipped");
            return Ok(DrainReport::skipped());
        }

        let entries = self.queue.list(None)?;
        let pending = entries
            .iter()
            .filter(|e| e.state == EntryState::Pending)
            .count();
        if pending == 0 {
            return Ok(DrainReport::default());
        }

        let span = start_drain_span();
        span.record("drain.entries", pending);
        let started = Instant::now();
        self.queue.record_event(EventKind::DrainStarted { pending })?;

        let mut by_visit: BTreeMap<VisitId, Vec<PendingMutation>> = BTreeMap::new();
        for entry in entries {
            by_visit.entry(entry.visit_id).or_default().push(entry);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let mut workers = JoinSet::new();
        for (visit_id, entries) in by_visit {
            let engine = self.clone();
            let semaphore = Arc::clone(&semaphore);
            workers.spawn(
                async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| Error::Other(format!("drain worker pool closed: {e}")))?;
                    engine.drain_visit(visit_id, entries).await
                }
                .instrument(span.clone()),
            );
        }

        let mut report = DrainReport::default();
        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(visit_report)) => report.merge(visit_report),
                Ok(Err(e)) => {
                    error!(error = %e, "drain worker failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "drain worker panicked");
                    first_error.get_or_insert(Error::Other(format!("drain worker panicked: {e}")));
                }
            }
        }

        let elapsed = started.elapsed();
        metrics::drain_duration_ms().record(elapsed.as_secs_f64() * 1000.0, &[]);
        self.queue.record_event(EventKind::DrainFinished {
            committed: report.committed + report.already_applied,
            conflicts: report.conflicts,
            retried: report.retried,
            failed: report.failed,
            interrupted: report.interrupted,
            duration_ms: elapsed.as_millis() as u64,
        })?;
        span.in_scope(|| {
            info!(
                committed = report.committed,
                already_applied = report.already_applied,
                conflicts = report.conflicts,
                retried = report.retried,
                failed = report.failed,
                blocked = report.blocked,
                interrupted = report.interrupted,
                "drain finished"
            );
        });

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Replay one visit's entries in order, stopping at the first entry
    /// that does not settle.
    async fn drain_visit(
        &self,
        visit_id: VisitId,
        entries: Vec<PendingMutation>,
    ) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let total = entries.len();

        for (index, entry) in entries.into_iter().enumerate() {
            let remaining = total - index - 1;

            if entry.state != EntryState::Pending {
                debug!(%visit_id, seq = entry.seq, state = %entry.state, "visit blocked by unsettled entry");
                report.blocked += remaining + 1;
                break;
            }
            if entry.is_deferred(self.service.clock().now()) {
                debug!(%visit_id, seq = entry.seq, "entry backing off");
                report.blocked += remaining + 1;
                break;
            }

            match self.replay(&entry).await? {
                Replay::Committed { already_applied } => {
                    if already_applied {
                        report.already_applied += 1;
                    } else {
                        report.committed += 1;
                    }
                }
                Replay::Discarded => report.conflicts += 1,
                Replay::Retry => {
                    report.retried += 1;
                    report.blocked += remaining;
                    break;
                }
                Replay::Failed => {
                    report.failed += 1;
                    report.blocked += remaining;
                    break;
                }
                Replay::Interrupted => {
                    report.interrupted = true;
                    break;
                }
            }
        }

        Ok(report)
    }

    async fn replay(&self, queued: &PendingMutation) -> Result<Replay> {
        // Re-read on claim: the actor may have replaced the request since
        // the drain listed the queue.
        let entry = &self.queue.mark_in_flight(queued.seq)?;
        let kind = entry.kind();
        let span = start_mutation_span(entry.seq, &entry.visit_id, kind);
        record_state_transition(&span, "pending", "in_flight");

        let mut connectivity = self.connectivity.clone();
        let result = tokio::select! {
            biased;
            _ = wait_offline(&mut connectivity) => None,
            result = self
                .service
                .apply(entry.visit_id, &entry.actor, &entry.request)
                .instrument(span.clone()) => Some(result),
        };

        let Some(result) = result else {
            self.queue.revert_pending(entry.seq)?;
            record_state_transition(&span, "in_flight", "pending");
            span.record("mutation.outcome", "interrupted");
            info!(seq = entry.seq, "went offline mid-replay; entry returned to pending");
            return Ok(Replay::Interrupted);
        };

        match result {
            Ok(applied) => {
                self.queue.settle(
                    entry.seq,
                    EventKind::MutationCommitted {
                        seq: entry.seq,
                        visit_id: entry.visit_id,
                        status: applied.visit.status,
                        already_applied: applied.already_applied,
                    },
                )?;
                record_state_transition(&span, "in_flight", "committed");
                span.record("mutation.outcome", "committed");
                metrics::queue_operations().add(1, &[KeyValue::new("operation", "commit")]);
                Ok(Replay::Committed {
                    already_applied: applied.already_applied,
                })
            }
            Err(Error::InvalidTransition { from, .. }) if lifecycle::is_superseded(from, kind) => {
                self.queue.settle(
                    entry.seq,
                    EventKind::ConflictDiscarded {
                        seq: entry.seq,
                        visit_id: entry.visit_id,
                        kind,
                        remote_status: from,
                    },
                )?;
                record_state_transition(&span, "in_flight", "conflict_discarded");
                span.record("mutation.outcome", "conflict_discarded");
                let conflict = Error::ConflictDiscarded {
                    visit_id: entry.visit_id,
                    status: from,
                };
                info!(seq = entry.seq, %kind, "{conflict}");
                metrics::queue_conflicts().add(1, &[KeyValue::new("kind", kind.as_str())]);
                Ok(Replay::Discarded)
            }
            Err(e) => self.fail_or_retry(entry, &span, e),
        }
    }

    fn fail_or_retry(
        &self,
        entry: &PendingMutation,
        span: &tracing::Span,
        error: Error,
    ) -> Result<Replay> {
        let message = error.to_string();
        let class = error.retry_class();
        let attempts = if class == RetryClass::NotRetryable {
            entry.attempts
        } else {
            entry.attempts + 1
        };

        if class == RetryClass::NotRetryable || attempts >= self.config.max_attempts {
            self.queue.mark_failed(entry.seq, attempts, &message)?;
            record_state_transition(span, "in_flight", "failed");
            span.record("mutation.outcome", "failed");
            warn!(
                seq = entry.seq,
                visit_id = %entry.visit_id,
                kind = %entry.kind(),
                attempts,
                retry = ?class,
                error = %message,
                "mutation failed; held for manual action"
            );
            metrics::queue_operations().add(1, &[KeyValue::new("operation", "fail")]);
            return Ok(Replay::Failed);
        }

        let delay = backoff(attempts, self.config.backoff_base, self.config.backoff_max_exponent);
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| Error::Other(format!("backoff out of range: {e}")))?;
        let next_attempt_at = self.service.clock().now() + delay;
        self.queue
            .schedule_retry(entry.seq, attempts, next_attempt_at, class, &message)?;
        record_state_transition(span, "in_flight", "pending");
        span.record("mutation.outcome", "retry_scheduled");
        debug!(
            seq = entry.seq,
            attempts,
            retry = ?class,
            %next_attempt_at,
            error = %message,
            "mutation will be retried"
        );
        metrics::queue_operations().add(1, &[KeyValue::new("operation", "retry_scheduled")]);
        Ok(Replay::Retry)
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    /// Drain on every offline → online transition and periodically while
    /// online, until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<()> {
        let mut connectivity = self.connectivity.clone();
        let mut online = *connectivity.borrow_and_update();
        let mut watching = true;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(online, "sync loop started");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("sync loop shutting down");
                    return Ok(());
                }
                changed = connectivity.changed(), if watching => {
                    if changed.is_err() {
                        warn!("connectivity source closed; relying on periodic drains");
                        watching = false;
                        continue;
                    }
                    let now_online = *connectivity.borrow_and_update();
                    let reconnected = now_online && !online;
                    online = now_online;
                    if reconnected {
                        info!("back online; draining queue");
                        self.drain_logged().await;
                    }
                }
                _ = ticker.tick() => {
                    if self.is_online() {
                        self.drain_logged().await;
                    }
                }
            }
        }
    }

    async fn drain_logged(&self) {
        if let Err(e) = self.drain().await {
            error!("drain error: {e}");
        }
    }
}

/// Resolve once the connectivity flag reads offline. Never resolves if the
/// sender is gone.
async fn wait_offline(connectivity: &mut watch::Receiver<bool>) {
    let closed = connectivity.wait_for(|online| !*online).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}
