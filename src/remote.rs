//! Remote acceptor: the external system of record. The engine only sees the
//! closed `SubmitOutcome`/`RejectReason` surface; the HTTP client below maps
//! the ledger API onto it.

use crate::model::WorkRecord;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Closed taxonomy of rejection reasons. The conflict classifier is a total
/// match over this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Timeout, connection drop, remote overload. Retried with backoff.
    Transient,
    /// The remote already holds this exact submission.
    Duplicate,
    /// Local payload no longer matches remote expectations.
    StaleLocalState,
    /// The target garden was altered or removed.
    ParentContextChanged,
    /// Payload fails remote-side structural validation.
    SchemaInvalid,
}

/// Remote-provided context accompanying a rejection.
#[derive(Debug, Clone, Default)]
pub struct RejectionDetails {
    pub message: Option<String>,
    pub remote_snapshot: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Accepted {
        remote_id: String,
    },
    Rejected {
        reason: RejectReason,
        details: RejectionDetails,
    },
}

/// One call, one durable answer. Implementations must honor the
/// `content_hash` idempotency key: resubmitting an already-accepted record
/// yields `Rejected { reason: Duplicate, .. }`, never a second acceptance.
/// A transport-level `Err` is treated as transient by the engine.
#[async_trait]
pub trait RemoteAcceptor: Send + Sync {
    async fn submit(&self, record: &WorkRecord) -> Result<SubmitOutcome>;
}

pub struct HttpAcceptor {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for HttpAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAcceptor")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpAcceptor {
    pub fn new(base_url: &str, token: String, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid remote base URL")?;
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }
}

#[async_trait]
impl RemoteAcceptor for HttpAcceptor {
    async fn submit(&self, record: &WorkRecord) -> Result<SubmitOutcome> {
        let url = self.base_url.join("v1/submissions")?;
        let body = json!({
            "kind": record.kind.as_str(),
            "garden_id": record.garden_id,
            "payload": record.payload,
            "media": record.media,
            "content_hash": record.content_hash,
        });
        let sent = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header("Idempotency-Key", &record.content_hash)
            .json(&body)
            .send()
            .await;
        let resp = match sent {
            Ok(resp) => resp,
            Err(err) if err.is_timeout() || err.is_connect() => {
                debug!(record_id = %record.id, ?err, "transport failure, treating as transient");
                return Ok(SubmitOutcome::Rejected {
                    reason: RejectReason::Transient,
                    details: RejectionDetails {
                        message: Some(err.to_string()),
                        remote_snapshot: None,
                    },
                });
            }
            Err(err) => return Err(err.into()),
        };

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        outcome_from_response(status, &body)
    }
}

#[derive(Debug, Deserialize)]
struct AcceptedBody {
    id: String,
}

#[derive(Debug, Deserialize, Default)]
struct RejectionBody {
    error: Option<String>,
    message: Option<String>,
    remote: Option<Value>,
}

fn outcome_from_response(status: StatusCode, body: &str) -> Result<SubmitOutcome> {
    if status.is_success() {
        let parsed: AcceptedBody =
            serde_json::from_str(body).context("acceptance response missing submission id")?;
        return Ok(SubmitOutcome::Accepted {
            remote_id: parsed.id,
        });
    }

    let parsed: RejectionBody = serde_json::from_str(body).unwrap_or_default();
    let details = RejectionDetails {
        message: parsed.message.or(parsed.error),
        remote_snapshot: parsed.remote,
    };
    let reason = match status.as_u16() {
        409 => RejectReason::Duplicate,
        412 => RejectReason::StaleLocalState,
        410 => RejectReason::ParentContextChanged,
        422 => RejectReason::SchemaInvalid,
        408 | 429 => RejectReason::Transient,
        500..=599 => RejectReason::Transient,
        _ => {
            return Err(anyhow!(
                "unexpected status {status} from remote: {}",
                details.message.as_deref().unwrap_or("no detail")
            ));
        }
    };
    Ok(SubmitOutcome::Rejected { reason, details })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason_for(status: StatusCode, body: &str) -> RejectReason {
        match outcome_from_response(status, body).unwrap() {
            SubmitOutcome::Rejected { reason, .. } => reason,
            SubmitOutcome::Accepted { .. } => panic!("expected rejection"),
        }
    }

    #[test]
    fn maps_acceptance() {
        let out = outcome_from_response(StatusCode::CREATED, r#"{"id": "sub-9"}"#).unwrap();
        match out {
            SubmitOutcome::Accepted { remote_id } => assert_eq!(remote_id, "sub-9"),
            SubmitOutcome::Rejected { .. } => panic!("expected acceptance"),
        }
    }

    #[test]
    fn maps_rejection_statuses() {
        assert_eq!(
            reason_for(StatusCode::CONFLICT, r#"{"error": "duplicate"}"#),
            RejectReason::Duplicate
        );
        assert_eq!(
            reason_for(StatusCode::PRECONDITION_FAILED, "{}"),
            RejectReason::StaleLocalState
        );
        assert_eq!(reason_for(StatusCode::GONE, "{}"), RejectReason::ParentContextChanged);
        assert_eq!(
            reason_for(StatusCode::UNPROCESSABLE_ENTITY, "{}"),
            RejectReason::SchemaInvalid
        );
        assert_eq!(
            reason_for(StatusCode::SERVICE_UNAVAILABLE, ""),
            RejectReason::Transient
        );
    }

    #[test]
    fn rejection_details_carry_remote_snapshot() {
        let body = r#"{"message": "garden renamed", "remote": {"name": "North Plot"}}"#;
        match outcome_from_response(StatusCode::PRECONDITION_FAILED, body).unwrap() {
            SubmitOutcome::Rejected { details, .. } => {
                assert_eq!(details.message.as_deref(), Some("garden renamed"));
                assert!(details.remote_snapshot.is_some());
            }
            SubmitOutcome::Accepted { .. } => panic!("expected rejection"),
        }
    }

    #[test]
    fn unknown_status_is_an_error() {
        assert!(outcome_from_response(StatusCode::UNAUTHORIZED, "{}").is_err());
    }
}
