//! Draft Manager: ephemeral, user-editable drafts. A draft has no sync state;
//! promotion converts it into exactly one queued `WorkRecord` and the draft
//! ceases to exist.

use crate::model::{Draft, MediaRef, Priority, RecordKind, WorkRecord, content_hash};
use crate::store::{self, Pool, StoreError, StoreResult};
use chrono::Utc;
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::{info, instrument};
use uuid::Uuid;

/// Partial update applied to a draft; unset fields are left as-is.
#[derive(Debug, Default, Clone)]
pub struct DraftPatch {
    pub garden_id: Option<String>,
    pub payload: Option<Value>,
    pub media: Option<Vec<MediaRef>>,
}

fn draft_from_row(row: &SqliteRow) -> StoreResult<Draft> {
    let id: String = row.get("id");
    let corrupt = |field| StoreError::Corrupt {
        id: id.clone(),
        field,
    };
    let kind: String = row.get("kind");
    let payload: String = row.get("payload");
    let media: String = row.get("media");
    Ok(Draft {
        kind: RecordKind::parse(&kind).ok_or_else(|| corrupt("kind"))?,
        garden_id: row.get("garden_id"),
        payload: serde_json::from_str(&payload).map_err(|_| corrupt("payload"))?,
        media: serde_json::from_str::<Vec<MediaRef>>(&media).map_err(|_| corrupt("media"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        id,
    })
}

#[instrument(skip_all)]
pub async fn create_draft(
    pool: &Pool,
    kind: RecordKind,
    garden_id: &str,
    payload: Value,
    media: Vec<MediaRef>,
) -> StoreResult<Draft> {
    let now = Utc::now();
    let draft = Draft {
        id: Uuid::new_v4().to_string(),
        kind,
        garden_id: garden_id.to_string(),
        payload,
        media,
        created_at: now,
        updated_at: now,
    };
    sqlx::query(
        "INSERT INTO drafts (id, kind, garden_id, payload, media, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&draft.id)
    .bind(draft.kind.as_str())
    .bind(&draft.garden_id)
    .bind(draft.payload.to_string())
    .bind(serde_json::to_string(&draft.media).unwrap_or_else(|_| "[]".into()))
    .bind(draft.created_at)
    .bind(draft.updated_at)
    .execute(pool)
    .await?;
    Ok(draft)
}

#[instrument(skip_all)]
pub async fn get_draft(pool: &Pool, id: &str) -> StoreResult<Option<Draft>> {
    let row = sqlx::query(
        "SELECT id, kind, garden_id, payload, media, created_at, updated_at \
         FROM drafts WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(draft_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn update_draft(pool: &Pool, id: &str, patch: DraftPatch) -> StoreResult<Draft> {
    let mut draft = get_draft(pool, id)
        .await?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    if let Some(garden_id) = patch.garden_id {
        draft.garden_id = garden_id;
    }
    if let Some(payload) = patch.payload {
        draft.payload = payload;
    }
    if let Some(media) = patch.media {
        draft.media = media;
    }
    draft.updated_at = Utc::now();
    sqlx::query(
        "UPDATE drafts SET garden_id = ?, payload = ?, media = ?, updated_at = ? WHERE id = ?",
    )
    .bind(&draft.garden_id)
    .bind(draft.payload.to_string())
    .bind(serde_json::to_string(&draft.media).unwrap_or_else(|_| "[]".into()))
    .bind(draft.updated_at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(draft)
}

#[instrument(skip_all)]
pub async fn discard_draft(pool: &Pool, id: &str) -> StoreResult<()> {
    let res = sqlx::query("DELETE FROM drafts WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Promote a draft into the queue. Idempotent: if a record with the same
/// canonical content hash is already active, that record is returned and no
/// second one is created. The draft is consumed either way, in the same
/// transaction.
#[instrument(skip_all)]
pub async fn promote(pool: &Pool, id: &str, priority: Option<Priority>) -> StoreResult<WorkRecord> {
    let draft = get_draft(pool, id)
        .await?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    let hash = content_hash(draft.kind, &draft.garden_id, &draft.payload, &draft.media);

    let mut tx = pool.begin().await?;
    if let Some(existing) = store::find_active_by_content_hash_tx(&mut tx, &hash).await? {
        sqlx::query("DELETE FROM drafts WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(draft_id = id, record_id = %existing.id, "promotion matched existing record");
        return Ok(existing);
    }

    let record = WorkRecord::new(
        draft.kind,
        draft.garden_id,
        draft.payload,
        draft.media,
        priority.unwrap_or(Priority::Normal),
    );
    store::put_tx(&mut tx, &record).await?;
    sqlx::query("DELETE FROM drafts WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    info!(draft_id = id, record_id = %record.id, "draft promoted");
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SyncState;
    use serde_json::json;
    use sqlx::SqlitePool;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn create_update_discard() {
        let pool = setup_pool().await;
        let draft = create_draft(
            &pool,
            RecordKind::Submission,
            "garden-1",
            json!({"title": "wip"}),
            vec![],
        )
        .await
        .unwrap();

        let updated = update_draft(
            &pool,
            &draft.id,
            DraftPatch {
                payload: Some(json!({"title": "Plant 10 trees"})),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.payload, json!({"title": "Plant 10 trees"}));
        assert_eq!(updated.garden_id, "garden-1");

        discard_draft(&pool, &draft.id).await.unwrap();
        assert!(get_draft(&pool, &draft.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn promote_creates_queued_record_and_consumes_draft() {
        let pool = setup_pool().await;
        let draft = create_draft(
            &pool,
            RecordKind::Submission,
            "garden-1",
            json!({"title": "Plant 10 trees"}),
            vec![],
        )
        .await
        .unwrap();

        let record = promote(&pool, &draft.id, Some(Priority::High)).await.unwrap();
        assert_eq!(record.sync_state, SyncState::Queued);
        assert_eq!(record.priority, Priority::High);
        assert!(get_draft(&pool, &draft.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn promotion_is_idempotent_per_content_hash() {
        let pool = setup_pool().await;
        let d1 = create_draft(
            &pool,
            RecordKind::Submission,
            "garden-1",
            json!({"title": "Plant 10 trees"}),
            vec![],
        )
        .await
        .unwrap();
        // Same logical payload, different key order.
        let d2 = create_draft(
            &pool,
            RecordKind::Submission,
            "garden-1",
            json!({"title": "Plant 10 trees"}),
            vec![],
        )
        .await
        .unwrap();

        let r1 = promote(&pool, &d1.id, None).await.unwrap();
        let r2 = promote(&pool, &d2.id, None).await.unwrap();
        assert_eq!(r1.id, r2.id);
        assert_eq!(store::list_by_sync_state(&pool, SyncState::Queued)
            .await
            .unwrap()
            .len(), 1);
        assert!(get_draft(&pool, &d2.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn promotion_ignores_failed_records() {
        let pool = setup_pool().await;
        let d1 = create_draft(
            &pool,
            RecordKind::Submission,
            "garden-1",
            json!({"title": "retry after failure"}),
            vec![],
        )
        .await
        .unwrap();
        let mut r1 = promote(&pool, &d1.id, None).await.unwrap();
        r1.sync_state = SyncState::Failed;
        store::put(&pool, &r1).await.unwrap();

        let d2 = create_draft(
            &pool,
            RecordKind::Submission,
            "garden-1",
            json!({"title": "retry after failure"}),
            vec![],
        )
        .await
        .unwrap();
        let r2 = promote(&pool, &d2.id, None).await.unwrap();
        assert_ne!(r1.id, r2.id);
        assert_eq!(r2.sync_state, SyncState::Queued);
    }
}
