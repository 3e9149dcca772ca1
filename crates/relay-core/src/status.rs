//! Caller-facing job submission and status service.
//!
//! Callers never see raw transport errors: a job resolves to a payload, a
//! normalized failure description, or a not-found condition once it ages out
//! of retention.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::domain::{JobData, JobId, TransactionId};
use crate::queue::{DurableQueue, JobCounts, QueueError};

/// Raised when a job id is unknown to the queue: it never existed, or the
/// finished record aged out of the retention window.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job {0} not found")]
pub struct JobNotFoundError(pub JobId);

/// Caller-facing summary of a job's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: JobId,

    /// Every transaction identity the job's attempts have used.
    pub transaction_ids: Vec<TransactionId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_error: Option<String>,

    /// Result payload as text. Present once the job has a result, even when
    /// the payload was empty; absent while the job is still in flight.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_payload: Option<String>,
}

/// Enqueue a submit job, returning the queue-assigned id immediately without
/// waiting for ledger execution.
pub async fn add_submit_job(
    queue: &dyn DurableQueue,
    principal: impl Into<String>,
    operation: impl Into<String>,
    args: Vec<String>,
) -> Result<JobId, QueueError> {
    let job_id = queue
        .add(JobData::new(principal, operation, args))
        .await?;
    debug!(%job_id, "added submit job");
    Ok(job_id)
}

/// Summarize a job for a polling caller.
///
/// Tolerates partially-populated records: a job with no data reports an
/// empty identity list, and a job with no result yet reports neither a
/// payload nor an error.
pub async fn get_job_summary(
    queue: &dyn DurableQueue,
    job_id: JobId,
) -> Result<JobSummary, JobNotFoundError> {
    let Some(job) = queue.get_job(job_id).await else {
        return Err(JobNotFoundError(job_id));
    };

    let transaction_ids = job
        .data
        .map(|data| data.transaction_ids)
        .unwrap_or_default();

    let (transaction_error, transaction_payload) = match job.result {
        Some(result) => (
            result.transaction_error,
            Some(
                result
                    .transaction_payload
                    .map(|payload| String::from_utf8_lossy(&payload).into_owned())
                    .unwrap_or_default(),
            ),
        ),
        None => (None, None),
    };

    Ok(JobSummary {
        job_id,
        transaction_ids,
        transaction_error,
        transaction_payload,
    })
}

/// Current job counts for the queue.
pub async fn get_job_counts(queue: &dyn DurableQueue) -> JobCounts {
    queue.counts().await
}
