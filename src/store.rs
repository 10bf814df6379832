//! Record Store: the single authoritative owner of persisted queue state.
//!
//! Every `sync_state` transition goes through one SQLite transaction so a
//! crash between "mark submitting" and "receive outcome" cannot lose a
//! record. The scheduler and engine never cache rows across operations.

use crate::model::{
    ConflictRecord, ConflictType, MediaRef, Priority, RecordKind, SyncState, WorkRecord,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::{info, instrument};

pub type Pool = SqlitePool;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("corrupt row {id}: bad {field}")]
    Corrupt { id: String, field: &'static str },
}

pub type StoreResult<T> = Result<T, StoreError>;

pub async fn init_pool(database_url: &str) -> StoreResult<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // WAL plus full sync: queued work must survive power loss.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    Ok(pool)
}

/// Expand `~/` in file-backed SQLite URLs and create the parent directory.
/// In-memory URLs and non-sqlite schemes pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let expanded = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{expanded}?{q}"),
        None => format!("sqlite://{expanded}"),
    }
}

pub async fn run_migrations(pool: &Pool) -> StoreResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Crash recovery, run at store open: any record left `submitting` by a dead
/// process reverts to `queued` with its retry timer cleared, so it is
/// eligible on the next drain. The remote may have accepted it before the
/// crash; the `already_submitted` conflict path reconciles that on retry.
#[instrument(skip_all)]
pub async fn recover_interrupted(pool: &Pool) -> StoreResult<u64> {
    let res = sqlx::query(
        "UPDATE work_records SET sync_state = 'queued', next_retry_at = NULL, updated_at = ? \
         WHERE sync_state = 'submitting'",
    )
    .bind(Utc::now())
    .execute(pool)
    .await?;
    let n = res.rows_affected();
    if n > 0 {
        info!(recovered = n, "reset interrupted submissions to queued");
    }
    Ok(n)
}

pub(crate) fn record_from_row(row: &SqliteRow) -> StoreResult<WorkRecord> {
    let id: String = row.get("id");
    let corrupt = |field| StoreError::Corrupt {
        id: id.clone(),
        field,
    };
    let kind: String = row.get("kind");
    let payload: String = row.get("payload");
    let media: String = row.get("media");
    let sync_state: String = row.get("sync_state");
    let priority: String = row.get("priority");
    Ok(WorkRecord {
        kind: RecordKind::parse(&kind).ok_or_else(|| corrupt("kind"))?,
        garden_id: row.get("garden_id"),
        payload: serde_json::from_str(&payload).map_err(|_| corrupt("payload"))?,
        media: serde_json::from_str::<Vec<MediaRef>>(&media).map_err(|_| corrupt("media"))?,
        content_hash: row.get("content_hash"),
        sync_state: SyncState::parse(&sync_state).ok_or_else(|| corrupt("sync_state"))?,
        submission_attempts: row.get("submission_attempts"),
        last_attempt_at: row.get("last_attempt_at"),
        next_retry_at: row.get("next_retry_at"),
        priority: Priority::parse(&priority).ok_or_else(|| corrupt("priority"))?,
        user_skipped: row.get::<i64, _>("user_skipped") != 0,
        remote_id: row.get("remote_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        id,
    })
}

const RECORD_COLUMNS: &str = "id, kind, garden_id, payload, media, content_hash, sync_state, \
     submission_attempts, last_attempt_at, next_retry_at, priority, user_skipped, remote_id, \
     created_at, updated_at";

#[instrument(skip_all)]
pub async fn put(pool: &Pool, record: &WorkRecord) -> StoreResult<()> {
    let mut tx = pool.begin().await?;
    put_tx(&mut tx, record).await?;
    tx.commit().await?;
    Ok(())
}

pub async fn put_tx(tx: &mut Transaction<'_, Sqlite>, record: &WorkRecord) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO work_records (id, kind, garden_id, payload, media, content_hash, \
         sync_state, submission_attempts, last_attempt_at, next_retry_at, priority, \
         user_skipped, remote_id, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (id) DO UPDATE SET \
         payload = excluded.payload, media = excluded.media, \
         content_hash = excluded.content_hash, sync_state = excluded.sync_state, \
         submission_attempts = excluded.submission_attempts, \
         last_attempt_at = excluded.last_attempt_at, next_retry_at = excluded.next_retry_at, \
         priority = excluded.priority, user_skipped = excluded.user_skipped, \
         remote_id = excluded.remote_id, updated_at = excluded.updated_at",
    )
    .bind(&record.id)
    .bind(record.kind.as_str())
    .bind(&record.garden_id)
    .bind(record.payload.to_string())
    .bind(serde_json::to_string(&record.media).unwrap_or_else(|_| "[]".into()))
    .bind(&record.content_hash)
    .bind(record.sync_state.as_str())
    .bind(record.submission_attempts)
    .bind(record.last_attempt_at)
    .bind(record.next_retry_at)
    .bind(record.priority.as_str())
    .bind(i64::from(record.user_skipped))
    .bind(&record.remote_id)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get(pool: &Pool, id: &str) -> StoreResult<Option<WorkRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {RECORD_COLUMNS} FROM work_records WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(record_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_by_sync_state(pool: &Pool, state: SyncState) -> StoreResult<Vec<WorkRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {RECORD_COLUMNS} FROM work_records WHERE sync_state = ? ORDER BY created_at ASC"
    ))
    .bind(state.as_str())
    .fetch_all(pool)
    .await?;
    rows.iter().map(record_from_row).collect()
}

/// Idempotent-promotion lookup: an existing record with the same content hash
/// in any state other than `failed` claims the promotion.
pub async fn find_active_by_content_hash_tx(
    tx: &mut Transaction<'_, Sqlite>,
    hash: &str,
) -> StoreResult<Option<WorkRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {RECORD_COLUMNS} FROM work_records WHERE content_hash = ? AND sync_state != 'failed'"
    ))
    .bind(hash)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(record_from_row).transpose()
}

/// Claim a queued record for submission. Returns false when the record is no
/// longer `queued` (raced by a user action), in which case the caller must
/// not dispatch it.
#[instrument(skip_all)]
pub async fn mark_submitting(pool: &Pool, id: &str, now: DateTime<Utc>) -> StoreResult<bool> {
    let res = sqlx::query(
        "UPDATE work_records SET sync_state = 'submitting', \
         submission_attempts = submission_attempts + 1, last_attempt_at = ?, updated_at = ? \
         WHERE id = ? AND sync_state = 'queued'",
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn mark_synced(pool: &Pool, id: &str, remote_id: Option<&str>) -> StoreResult<()> {
    let res = sqlx::query(
        "UPDATE work_records SET sync_state = 'synced', next_retry_at = NULL, \
         remote_id = COALESCE(?, remote_id), updated_at = ? WHERE id = ?",
    )
    .bind(remote_id)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_transient_failure(
    pool: &Pool,
    id: &str,
    next_retry_at: DateTime<Utc>,
) -> StoreResult<()> {
    let res = sqlx::query(
        "UPDATE work_records SET sync_state = 'queued', next_retry_at = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(next_retry_at)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    Ok(())
}

/// Attach a conflict and halt automatic retries, atomically.
#[instrument(skip_all)]
pub async fn mark_conflict(pool: &Pool, id: &str, conflict: &ConflictRecord) -> StoreResult<()> {
    let mut tx = pool.begin().await?;
    insert_conflict_tx(&mut tx, conflict).await?;
    let res = sqlx::query(
        "UPDATE work_records SET sync_state = 'conflict', next_retry_at = NULL, updated_at = ? \
         WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    tx.commit().await?;
    Ok(())
}

/// Duplicate rejection is the idempotence path: the remote already holds the
/// work, so record the conflict for audit and land on `synced` in one step.
#[instrument(skip_all)]
pub async fn resolve_duplicate(pool: &Pool, id: &str, conflict: &ConflictRecord) -> StoreResult<()> {
    let mut tx = pool.begin().await?;
    insert_conflict_tx(&mut tx, conflict).await?;
    let res = sqlx::query(
        "UPDATE work_records SET sync_state = 'synced', next_retry_at = NULL, updated_at = ? \
         WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    tx.commit().await?;
    Ok(())
}

async fn insert_conflict_tx(
    tx: &mut Transaction<'_, Sqlite>,
    conflict: &ConflictRecord,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO conflicts (id, work_id, conflict_type, local_snapshot, remote_snapshot, \
         auto_resolvable, description, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&conflict.id)
    .bind(&conflict.work_id)
    .bind(conflict.conflict_type.as_str())
    .bind(conflict.local_snapshot.as_ref().map(|v| v.to_string()))
    .bind(conflict.remote_snapshot.as_ref().map(|v| v.to_string()))
    .bind(i64::from(conflict.auto_resolvable))
    .bind(&conflict.description)
    .bind(conflict.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_conflict(pool: &Pool, work_id: &str) -> StoreResult<Option<ConflictRecord>> {
    let row = sqlx::query(
        "SELECT id, work_id, conflict_type, local_snapshot, remote_snapshot, auto_resolvable, \
         description, created_at FROM conflicts WHERE work_id = ? \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(work_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let id: String = row.get("id");
    let conflict_type: String = row.get("conflict_type");
    let conflict_type = ConflictType::parse(&conflict_type).ok_or_else(|| StoreError::Corrupt {
        id: id.clone(),
        field: "conflict_type",
    })?;
    let parse_snapshot = |col: &str| -> Option<serde_json::Value> {
        row.get::<Option<String>, _>(col)
            .and_then(|s| serde_json::from_str(&s).ok())
    };
    Ok(Some(ConflictRecord {
        local_snapshot: parse_snapshot("local_snapshot"),
        remote_snapshot: parse_snapshot("remote_snapshot"),
        work_id: row.get("work_id"),
        conflict_type,
        auto_resolvable: row.get::<i64, _>("auto_resolvable") != 0,
        description: row.get("description"),
        created_at: row.get("created_at"),
        id,
    }))
}

/// User action: retry a conflicted record. Clears the conflict, requeues, and
/// makes it immediately eligible.
#[instrument(skip_all)]
pub async fn retry_conflict(pool: &Pool, id: &str) -> StoreResult<()> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE work_records SET sync_state = 'queued', next_retry_at = NULL, \
         user_skipped = 0, updated_at = ? WHERE id = ? AND sync_state = 'conflict'",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    sqlx::query("DELETE FROM conflicts WHERE work_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// User action: dismiss a conflict without resolving it. The record stays in
/// the store for later manual action but leaves active scheduling.
#[instrument(skip_all)]
pub async fn skip_conflict(pool: &Pool, id: &str) -> StoreResult<()> {
    let res = sqlx::query(
        "UPDATE work_records SET user_skipped = 1, updated_at = ? \
         WHERE id = ? AND sync_state = 'conflict'",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    Ok(())
}

/// User action: discard a record entirely, conflicts included.
#[instrument(skip_all)]
pub async fn discard_record(pool: &Pool, id: &str) -> StoreResult<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM conflicts WHERE work_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let res = sqlx::query("DELETE FROM work_records WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    if res.rows_affected() == 0 {
        return Err(StoreError::NotFound(id.to_string()));
    }
    tx.commit().await?;
    Ok(())
}
