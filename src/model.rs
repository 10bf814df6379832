use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Queued,
    Submitting,
    Synced,
    Failed,
    Conflict,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Queued => "queued",
            SyncState::Submitting => "submitting",
            SyncState::Synced => "synced",
            SyncState::Failed => "failed",
            SyncState::Conflict => "conflict",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(SyncState::Queued),
            "submitting" => Some(SyncState::Submitting),
            "synced" => Some(SyncState::Synced),
            "failed" => Some(SyncState::Failed),
            "conflict" => Some(SyncState::Conflict),
            _ => None,
        }
    }
}

/// Two producer flows feed the same queue: user-authored submissions and a
/// reviewer's decision on prior work.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Submission,
    Decision,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Submission => "submission",
            RecordKind::Decision => "decision",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submission" => Some(RecordKind::Submission),
            "decision" => Some(RecordKind::Decision),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "urgent" => Some(Priority::Urgent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Local payload no longer matches what the remote expects.
    DataModified,
    /// The remote already holds this exact submission; a prior
    /// acknowledgement was lost.
    AlreadySubmitted,
    /// The garden the record targets was altered or removed between
    /// queuing and submission.
    GardenChanged,
    /// Payload fails remote-side structural validation; client/remote skew.
    SchemaMismatch,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::DataModified => "data_modified",
            ConflictType::AlreadySubmitted => "already_submitted",
            ConflictType::GardenChanged => "garden_changed",
            ConflictType::SchemaMismatch => "schema_mismatch",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "data_modified" => Some(ConflictType::DataModified),
            "already_submitted" => Some(ConflictType::AlreadySubmitted),
            "garden_changed" => Some(ConflictType::GardenChanged),
            "schema_mismatch" => Some(ConflictType::SchemaMismatch),
            _ => None,
        }
    }
}

/// Reference to an already-uploaded media object. The queue never stores
/// media bytes, only names and content hashes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaRef {
    pub name: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRecord {
    pub id: String,
    pub kind: RecordKind,
    pub garden_id: String,
    pub payload: Value,
    pub media: Vec<MediaRef>,
    pub content_hash: String,
    pub sync_state: SyncState,
    pub submission_attempts: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub user_skipped: bool,
    pub remote_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkRecord {
    /// Fresh queued record. Computes the idempotency hash from the envelope.
    pub fn new(
        kind: RecordKind,
        garden_id: String,
        payload: Value,
        media: Vec<MediaRef>,
        priority: Priority,
    ) -> Self {
        let now = Utc::now();
        let hash = content_hash(kind, &garden_id, &payload, &media);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            garden_id,
            payload,
            media,
            content_hash: hash,
            sync_state: SyncState::Queued,
            submission_attempts: 0,
            last_attempt_at: None,
            next_retry_at: None,
            priority,
            user_skipped: false,
            remote_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    pub work_id: String,
    pub conflict_type: ConflictType,
    pub local_snapshot: Option<Value>,
    pub remote_snapshot: Option<Value>,
    pub auto_resolvable: bool,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub id: String,
    pub kind: RecordKind,
    pub garden_id: String,
    pub payload: Value,
    pub media: Vec<MediaRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Idempotency key: SHA-256 over the canonicalized submission envelope.
/// Two drafts with the same logical content always hash identically,
/// regardless of JSON key order in the payload.
pub fn content_hash(
    kind: RecordKind,
    garden_id: &str,
    payload: &Value,
    media: &[MediaRef],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(garden_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_json(payload).as_bytes());
    hasher.update(b"\n");
    for m in media {
        hasher.update(m.name.as_bytes());
        hasher.update(b":");
        hasher.update(m.hash.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// Serialize a JSON value with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                out.push('{');
                let mut entries: Vec<(&String, &Value)> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                for (i, (key, entry)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    write(entry, out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}
