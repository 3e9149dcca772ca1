//! Job payloads, results, and lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, TransactionId};

/// Payload of a submit job while it travels through the queue.
///
/// `operation` and `args` are fixed at enqueue time; the transaction
/// bookkeeping fields are rewritten by the worker between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobData {
    /// Tenant identity the operation executes under.
    pub principal: String,

    /// Named ledger operation to invoke.
    pub operation: String,

    /// Ordered operation arguments, immutable for the life of the job.
    pub args: Vec<String>,

    /// Every transaction identity used by an attempt of this job, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transaction_ids: Vec<TransactionId>,

    /// Serialized in-flight transaction for same-identity resubmission.
    /// Present only while a timeout-retry is pending; opaque to the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_state: Option<Vec<u8>>,
}

impl JobData {
    pub fn new(
        principal: impl Into<String>,
        operation: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            principal: principal.into(),
            operation: operation.into(),
            args,
            transaction_ids: Vec::new(),
            transaction_state: None,
        }
    }
}

/// Terminal result of a job.
///
/// At most one of the fields is set. Both unset is the deliberate soft-fail
/// shape for jobs that had nothing to execute against (unknown principal).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_payload: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_error: Option<String>,
}

impl JobResult {
    /// Success with the gateway's result payload, byte-for-byte.
    pub fn success(payload: Vec<u8>) -> Self {
        Self {
            transaction_payload: Some(payload),
            transaction_error: None,
        }
    }

    /// Terminal failure with a caller-facing description.
    pub fn failure(description: impl Into<String>) -> Self {
        Self {
            transaction_payload: None,
            transaction_error: Some(description.into()),
        }
    }

    /// Nothing to do: no payload, no error.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Queue lifecycle state of a job.
///
/// Waiting -> Active -> Completed
/// Waiting -> Active -> Delayed -> Waiting (until the attempt ceiling)
/// Waiting -> Active -> Failed (ceiling reached)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Deliverable to a worker.
    Waiting,

    /// Currently leased by a worker.
    Active,

    /// Waiting out a retry backoff.
    Delayed,

    /// Terminal with a result (which may carry a failure description).
    Completed,

    /// Terminal: the attempt ceiling was reached without resolution.
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Read-only snapshot of a job, as returned by `DurableQueue::get_job`.
///
/// `data` is optional: a degenerate record may carry no payload and callers
/// of the status service must still get a summary out of it.
#[derive(Debug, Clone)]
pub struct JobView {
    pub id: JobId,
    pub data: Option<JobData>,
    pub state: JobState,
    pub attempts_made: u32,
    pub result: Option<JobResult>,
    pub enqueued_at: DateTime<Utc>,
}
