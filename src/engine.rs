//! Sync Engine: drains the scheduler while connectivity allows, classifies
//! each submission outcome, and writes results back through the store.
//!
//! Only one drain pass runs at a time per engine. Cancellation and
//! connectivity are checked before each dispatch, never mid-submission:
//! in-flight work always completes and its outcome is written back.

use crate::classify;
use crate::model::{ConflictType, SyncState, WorkRecord};
use crate::remote::{RemoteAcceptor, SubmitOutcome};
use crate::scheduler;
use crate::store::{self, Pool, StoreError, StoreResult};
use anyhow::{Result, anyhow};
use chrono::{Duration as ChronoDuration, Utc};
use futures::FutureExt;
use rand::Rng;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Concurrent submissions per drain pass. The scheduler never hands out
    /// two records for the same garden at once.
    pub max_in_flight: usize,
    pub backoff_base_secs: i64,
    pub max_backoff_secs: i64,
    /// Periodic drain interval while online.
    pub drain_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            backoff_base_secs: 5,
            max_backoff_secs: 3600,
            drain_interval: Duration::from_secs(60),
        }
    }
}

/// One drain pass. `succeeded` counts synced records (auto-resolved
/// duplicates included), `failed` counts transient failures left queued for
/// retry, `skipped` counts records parked in `conflict` for user action.
/// Never persisted; a restart simply starts a fresh session.
#[derive(Debug, Default)]
pub struct SyncSession {
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
    cancelled: Arc<AtomicBool>,
}

impl SyncSession {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// State-change notification for UI subscribers.
#[derive(Debug, Clone)]
pub struct RecordEvent {
    pub record_id: String,
    pub sync_state: SyncState,
}

pub struct SyncEngine {
    pool: Pool,
    acceptor: Arc<dyn RemoteAcceptor>,
    config: SyncConfig,
    connectivity: watch::Receiver<bool>,
    active: tokio::sync::Mutex<()>,
    cancel: Arc<AtomicBool>,
    events: broadcast::Sender<RecordEvent>,
}

impl SyncEngine {
    pub fn new(
        pool: Pool,
        acceptor: Arc<dyn RemoteAcceptor>,
        config: SyncConfig,
        connectivity: watch::Receiver<bool>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            pool,
            acceptor,
            config,
            connectivity,
            active: tokio::sync::Mutex::new(()),
            cancel: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RecordEvent> {
        self.events.subscribe()
    }

    /// Request cancellation of the active pass. Checked before each new
    /// dispatch; in-flight submissions still complete.
    pub fn cancel_active(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn online(&self) -> bool {
        *self.connectivity.borrow()
    }

    fn emit(&self, record_id: &str, sync_state: SyncState) {
        let _ = self.events.send(RecordEvent {
            record_id: record_id.to_string(),
            sync_state,
        });
    }

    /// One drain pass. Returns `None` when a pass is already active.
    /// Storage errors abort the pass; per-record outcomes never do.
    #[instrument(skip_all)]
    pub async fn drain(&self) -> StoreResult<Option<SyncSession>> {
        let Ok(_guard) = self.active.try_lock() else {
            return Ok(None);
        };
        self.cancel.store(false, Ordering::SeqCst);
        let mut session = SyncSession {
            cancelled: Arc::clone(&self.cancel),
            ..Default::default()
        };

        let mut in_flight: JoinSet<(WorkRecord, Result<SubmitOutcome>)> = JoinSet::new();
        let mut busy_gardens: Vec<String> = Vec::new();
        loop {
            while in_flight.len() < self.config.max_in_flight
                && !session.is_cancelled()
                && self.online()
            {
                let Some(record) =
                    scheduler::next_eligible(&self.pool, Utc::now(), &busy_gardens).await?
                else {
                    break;
                };
                if !store::mark_submitting(&self.pool, &record.id, Utc::now()).await? {
                    // Raced by a user action; the record is no longer queued.
                    continue;
                }
                self.emit(&record.id, SyncState::Submitting);
                busy_gardens.push(record.garden_id.clone());
                let acceptor = Arc::clone(&self.acceptor);
                in_flight.spawn(async move {
                    let mut record = record;
                    record.submission_attempts += 1;
                    // A panicking acceptor must not leak the record (or its
                    // garden slot); unwinds become transient failures.
                    let outcome = AssertUnwindSafe(acceptor.submit(&record))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err(anyhow!("submission task panicked")));
                    (record, outcome)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let Ok((record, outcome)) = joined else {
                warn!("submission task aborted; record recovers at next store open");
                continue;
            };
            busy_gardens.retain(|g| g != &record.garden_id);
            match self.apply_outcome(&mut session, &record, outcome).await {
                Ok(()) => {}
                // Discarded by the user while in flight; drop the outcome.
                Err(StoreError::NotFound(id)) => {
                    warn!(record_id = %id, "record removed mid-flight; outcome dropped");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Some(session))
    }

    async fn apply_outcome(
        &self,
        session: &mut SyncSession,
        record: &WorkRecord,
        outcome: Result<SubmitOutcome>,
    ) -> StoreResult<()> {
        match outcome {
            Ok(SubmitOutcome::Accepted { remote_id }) => {
                store::mark_synced(&self.pool, &record.id, Some(&remote_id)).await?;
                session.succeeded += 1;
                self.emit(&record.id, SyncState::Synced);
                info!(record_id = %record.id, remote_id = %remote_id, "submission accepted");
                Ok(())
            }
            Ok(SubmitOutcome::Rejected { reason, details }) => {
                let Some(conflict) = classify::classify(record, reason, &details) else {
                    return self.transient_failure(session, record, details.message).await;
                };
                if conflict.auto_resolvable {
                    // Idempotence path: the work was accepted on a prior
                    // attempt whose acknowledgement never arrived.
                    store::resolve_duplicate(&self.pool, &record.id, &conflict).await?;
                    session.succeeded += 1;
                    self.emit(&record.id, SyncState::Synced);
                    info!(record_id = %record.id, "duplicate auto-resolved to synced");
                } else {
                    if conflict.conflict_type == ConflictType::SchemaMismatch {
                        error!(
                            record_id = %record.id,
                            "payload failed remote validation; likely client/remote version skew"
                        );
                    }
                    store::mark_conflict(&self.pool, &record.id, &conflict).await?;
                    session.skipped += 1;
                    self.emit(&record.id, SyncState::Conflict);
                    warn!(
                        record_id = %record.id,
                        conflict_type = conflict.conflict_type.as_str(),
                        "submission conflicted; awaiting user action"
                    );
                }
                Ok(())
            }
            Err(err) => {
                self.transient_failure(session, record, Some(err.to_string()))
                    .await
            }
        }
    }

    async fn transient_failure(
        &self,
        session: &mut SyncSession,
        record: &WorkRecord,
        detail: Option<String>,
    ) -> StoreResult<()> {
        let delay = backoff_delay(
            record.submission_attempts,
            self.config.backoff_base_secs,
            self.config.max_backoff_secs,
        );
        store::mark_transient_failure(&self.pool, &record.id, Utc::now() + delay).await?;
        session.failed += 1;
        self.emit(&record.id, SyncState::Queued);
        warn!(
            record_id = %record.id,
            attempts = record.submission_attempts,
            retry_in_secs = delay.num_seconds(),
            detail = detail.as_deref().unwrap_or(""),
            "transient failure; backing off"
        );
        Ok(())
    }

    /// Long-running loop for the daemon: drain on every offline-to-online
    /// transition and on a timer while online. Returns when the connectivity
    /// channel closes.
    pub async fn run(&self) {
        let mut rx = self.connectivity.clone();
        let mut ticker = tokio::time::interval(self.config.drain_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut was_online = *rx.borrow();
        if was_online {
            self.drain_logged().await;
        }
        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let online = *rx.borrow();
                    if online && !was_online {
                        info!("connectivity restored; draining queue");
                        self.drain_logged().await;
                    } else if !online && was_online {
                        info!("connectivity lost; cancelling active pass");
                        self.cancel_active();
                    }
                    was_online = online;
                }
                _ = ticker.tick() => {
                    if was_online {
                        self.drain_logged().await;
                    }
                }
            }
        }
    }

    async fn drain_logged(&self) {
        match self.drain().await {
            Ok(Some(session)) => {
                if session.succeeded + session.failed + session.skipped > 0 {
                    info!(
                        succeeded = session.succeeded,
                        failed = session.failed,
                        skipped = session.skipped,
                        "drain pass finished"
                    );
                } else if let Ok(eligible) = scheduler::eligible_count(&self.pool, Utc::now()).await
                {
                    if eligible > 0 {
                        debug!(eligible, "drain pass idle with eligible backlog");
                    }
                }
            }
            Ok(None) => {}
            // The store itself is unhealthy; abandon the pass and surface it.
            Err(err) => error!(%err, "drain pass halted by storage error"),
        }
    }
}

/// Exponential backoff with jitter. Strictly increasing per attempt until the
/// cap: jitter spans 0.8x to 1.2x, so consecutive windows never overlap.
pub(crate) fn backoff_delay(attempts: i64, base_secs: i64, cap_secs: i64) -> ChronoDuration {
    let exp = attempts.saturating_sub(1).clamp(0, 20) as u32;
    let raw_ms = base_secs
        .saturating_mul(1000)
        .saturating_mul(1_i64 << exp);
    let jitter: f64 = rand::thread_rng().gen_range(0.8..1.2);
    let jittered = (raw_ms as f64 * jitter) as i64;
    ChronoDuration::milliseconds(jittered.min(cap_secs.saturating_mul(1000)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, RecordKind};
    use async_trait::async_trait;
    use serde_json::json;
    use sqlx::SqlitePool;

    struct UnreachableAcceptor;

    #[async_trait]
    impl RemoteAcceptor for UnreachableAcceptor {
        async fn submit(&self, _record: &WorkRecord) -> Result<SubmitOutcome> {
            panic!("acceptor must not be called");
        }
    }

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[test]
    fn backoff_gaps_grow_strictly() {
        let d1 = backoff_delay(1, 5, 3600);
        let d2 = backoff_delay(2, 5, 3600);
        let d3 = backoff_delay(3, 5, 3600);
        assert!(d1 < d2, "{d1:?} !< {d2:?}");
        assert!(d2 < d3, "{d2:?} !< {d3:?}");
    }

    #[test]
    fn backoff_respects_cap_and_jitter_band() {
        let capped = backoff_delay(30, 5, 60);
        assert!(capped <= ChronoDuration::seconds(60));
        let first = backoff_delay(1, 10, 3600);
        assert!(first >= ChronoDuration::seconds(8));
        assert!(first <= ChronoDuration::seconds(12));
    }

    #[tokio::test]
    async fn drain_while_offline_touches_nothing() {
        let pool = setup_pool().await;
        let record = WorkRecord::new(
            RecordKind::Submission,
            "garden-1".into(),
            json!({"title": "offline"}),
            vec![],
            Priority::Normal,
        );
        store::put(&pool, &record).await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let engine = SyncEngine::new(
            pool.clone(),
            Arc::new(UnreachableAcceptor),
            SyncConfig::default(),
            rx,
        );
        let session = engine.drain().await.unwrap().unwrap();
        assert_eq!((session.succeeded, session.failed, session.skipped), (0, 0, 0));

        let loaded = store::get(&pool, &record.id).await.unwrap().unwrap();
        assert_eq!(loaded.sync_state, SyncState::Queued);
        assert_eq!(loaded.submission_attempts, 0);
    }
}
