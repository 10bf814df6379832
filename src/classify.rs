//! Conflict Classifier: pure mapping from a rejection to a `ConflictRecord`.
//! No I/O here; the engine persists the result.

use crate::model::{ConflictRecord, ConflictType, WorkRecord};
use crate::remote::{RejectReason, RejectionDetails};
use chrono::Utc;
use uuid::Uuid;

/// Classify a rejection against the record it hit. Returns `None` for
/// transient rejections, which are a retry matter and never a conflict.
///
/// Only `already_submitted` is auto-resolvable. A changed garden is treated
/// conservatively: renamed, removed, or reassigned all require a human.
pub fn classify(record: &WorkRecord, reason: RejectReason, details: &RejectionDetails) -> Option<ConflictRecord> {
    let (conflict_type, auto_resolvable, default_description) = match reason {
        RejectReason::Transient => return None,
        RejectReason::Duplicate => (
            ConflictType::AlreadySubmitted,
            true,
            "The ledger already holds this submission; a previous acknowledgement was lost.",
        ),
        RejectReason::StaleLocalState => (
            ConflictType::DataModified,
            false,
            "This submission's data changed on the ledger after it was queued.",
        ),
        RejectReason::ParentContextChanged => (
            ConflictType::GardenChanged,
            false,
            "The garden this submission targets was changed or removed.",
        ),
        RejectReason::SchemaInvalid => (
            ConflictType::SchemaMismatch,
            false,
            "The ledger rejected the submission's structure; the app may be out of date.",
        ),
    };

    let description = match &details.message {
        Some(message) => format!("{default_description} ({message})"),
        None => default_description.to_string(),
    };
    Some(ConflictRecord {
        id: Uuid::new_v4().to_string(),
        work_id: record.id.clone(),
        conflict_type,
        local_snapshot: Some(record.payload.clone()),
        remote_snapshot: details.remote_snapshot.clone(),
        auto_resolvable,
        description,
        created_at: Utc::now(),
    })
}
