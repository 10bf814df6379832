//! Scheduler: a pure projection over the Record Store. Nothing here is
//! cached; every call re-reads the store, so the view survives crashes and
//! rebuilds for free.
//!
//! Eligibility: `queued`, not user-skipped, and past its retry timer.
//! Ordering: priority band first (urgent > high > normal > low), then FIFO
//! by `created_at` within a band.

use crate::model::WorkRecord;
use crate::store::{Pool, StoreResult};
use chrono::{DateTime, Utc};
use sqlx::QueryBuilder;
use tracing::instrument;

const ELIGIBLE_WHERE: &str = "sync_state = 'queued' AND user_skipped = 0 \
     AND (next_retry_at IS NULL OR next_retry_at <= ";

const PRIORITY_ORDER: &str = "CASE priority \
     WHEN 'urgent' THEN 0 WHEN 'high' THEN 1 WHEN 'normal' THEN 2 ELSE 3 END, \
     created_at ASC";

/// Next record to dispatch. Gardens named in `exclude_gardens` already have a
/// submission in flight; handing out a second record for the same garden
/// would let the two race each other into a `garden_changed` conflict.
#[instrument(skip_all)]
pub async fn next_eligible(
    pool: &Pool,
    now: DateTime<Utc>,
    exclude_gardens: &[String],
) -> StoreResult<Option<WorkRecord>> {
    let mut qb = QueryBuilder::new(
        "SELECT id, kind, garden_id, payload, media, content_hash, sync_state, \
         submission_attempts, last_attempt_at, next_retry_at, priority, user_skipped, \
         remote_id, created_at, updated_at FROM work_records WHERE ",
    );
    qb.push(ELIGIBLE_WHERE);
    qb.push_bind(now);
    qb.push(")");
    if !exclude_gardens.is_empty() {
        qb.push(" AND garden_id NOT IN (");
        let mut parts = qb.separated(", ");
        for garden in exclude_gardens {
            parts.push_bind(garden);
        }
        qb.push(")");
    }
    qb.push(" ORDER BY ");
    qb.push(PRIORITY_ORDER);
    qb.push(" LIMIT 1");

    let row = qb.build().fetch_optional(pool).await?;
    row.as_ref().map(crate::store::record_from_row).transpose()
}

/// How many records are currently eligible. Used for idle-loop logging only.
#[instrument(skip_all)]
pub async fn eligible_count(pool: &Pool, now: DateTime<Utc>) -> StoreResult<i64> {
    let mut qb = QueryBuilder::new("SELECT COUNT(*) AS n FROM work_records WHERE ");
    qb.push(ELIGIBLE_WHERE);
    qb.push_bind(now);
    qb.push(")");
    let row = qb.build().fetch_one(pool).await?;
    use sqlx::Row;
    Ok(row.get::<i64, _>("n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, RecordKind, SyncState, WorkRecord};
    use crate::store;
    use chrono::Duration;
    use serde_json::json;
    use sqlx::SqlitePool;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn record(garden: &str, title: &str, priority: Priority) -> WorkRecord {
        WorkRecord::new(
            RecordKind::Submission,
            garden.to_string(),
            json!({"title": title}),
            vec![],
            priority,
        )
    }

    #[tokio::test]
    async fn priority_bands_then_fifo() {
        let pool = setup_pool().await;
        let base = Utc::now();
        // Inserted out of order on purpose: normal@t1, high@t2, urgent@t3.
        let mut normal = record("g1", "normal", Priority::Normal);
        normal.created_at = base;
        let mut high = record("g2", "high", Priority::High);
        high.created_at = base + Duration::seconds(1);
        let mut urgent = record("g3", "urgent", Priority::Urgent);
        urgent.created_at = base + Duration::seconds(2);
        for rec in [&normal, &high, &urgent] {
            store::put(&pool, rec).await.unwrap();
        }

        let mut order = vec![];
        while let Some(next) = next_eligible(&pool, Utc::now(), &[]).await.unwrap() {
            order.push(next.priority);
            store::mark_synced(&pool, &next.id, None).await.unwrap();
        }
        assert_eq!(order, vec![Priority::Urgent, Priority::High, Priority::Normal]);
    }

    #[tokio::test]
    async fn fifo_within_band() {
        let pool = setup_pool().await;
        let base = Utc::now();
        let mut second = record("g1", "second", Priority::Normal);
        second.created_at = base + Duration::seconds(5);
        let mut first = record("g2", "first", Priority::Normal);
        first.created_at = base;
        store::put(&pool, &second).await.unwrap();
        store::put(&pool, &first).await.unwrap();

        let next = next_eligible(&pool, Utc::now(), &[]).await.unwrap().unwrap();
        assert_eq!(next.id, first.id);
    }

    #[tokio::test]
    async fn retry_timer_gates_eligibility() {
        let pool = setup_pool().await;
        let mut rec = record("g1", "backing off", Priority::Normal);
        rec.next_retry_at = Some(Utc::now() + Duration::minutes(5));
        store::put(&pool, &rec).await.unwrap();

        assert!(next_eligible(&pool, Utc::now(), &[]).await.unwrap().is_none());
        let later = Utc::now() + Duration::minutes(6);
        let due = next_eligible(&pool, later, &[]).await.unwrap();
        assert_eq!(due.unwrap().id, rec.id);
    }

    #[tokio::test]
    async fn skipped_and_non_queued_records_excluded() {
        let pool = setup_pool().await;
        let mut skipped = record("g1", "skipped", Priority::Urgent);
        skipped.sync_state = SyncState::Conflict;
        skipped.user_skipped = true;
        store::put(&pool, &skipped).await.unwrap();
        let mut synced = record("g2", "done", Priority::Urgent);
        synced.sync_state = SyncState::Synced;
        store::put(&pool, &synced).await.unwrap();

        assert!(next_eligible(&pool, Utc::now(), &[]).await.unwrap().is_none());
        assert_eq!(eligible_count(&pool, Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn in_flight_gardens_excluded() {
        let pool = setup_pool().await;
        let busy = record("g1", "first for garden", Priority::Urgent);
        let other = record("g2", "other garden", Priority::Low);
        store::put(&pool, &busy).await.unwrap();
        store::put(&pool, &other).await.unwrap();

        let next = next_eligible(&pool, Utc::now(), &["g1".to_string()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, other.id);
    }
}
