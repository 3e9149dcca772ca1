//! Durable queue port: delivery, attempt bookkeeping, backoff, retention.
//!
//! The queue owns every piece of retry state: attempt counters, backoff
//! scheduling, retention of finished jobs. Workers only ever touch the
//! domain payload through a [`JobLease`].

mod backoff;
mod memory;
mod scheduler;

pub use backoff::{BackoffKind, BackoffPolicy};
pub use memory::InMemoryJobQueue;
pub use scheduler::QueueScheduler;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{JobData, JobId, JobResult, JobView};

/// Queue-level failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("job {0} is not known to the queue")]
    UnknownJob(JobId),

    /// The delivery this lease belonged to was reclaimed (worker presumed
    /// dead); any result it produced must be discarded.
    #[error("lease on job {0} expired before the attempt finished")]
    LeaseExpired(JobId),
}

/// Delivery and retention options applied to every job added to a queue.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Attempt ceiling; a job failing this many times is terminally failed.
    pub attempts: u32,

    /// Backoff applied between failed attempts.
    pub backoff: BackoffPolicy,

    /// How many completed jobs are retained for status queries.
    pub keep_completed: usize,

    /// How many failed jobs are retained for status queries.
    pub keep_failed: usize,

    /// How long an active delivery may run before it is considered stalled
    /// and returned to the waiting queue.
    pub lease_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: BackoffPolicy::fixed(Duration::from_millis(3000)),
            keep_completed: 1000,
            keep_failed: 1000,
            lease_timeout: Duration::from_secs(30),
        }
    }
}

/// Job counts by state, for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub active: usize,
    pub completed: usize,
    pub delayed: usize,
    pub failed: usize,
    pub waiting: usize,
}

/// One delivery of one job to one worker.
///
/// The worker owns the lease and must finish it with `complete` or `fail`;
/// the queue decides what a failure means (delayed retry or terminal).
#[async_trait]
pub trait JobLease: Send {
    fn id(&self) -> JobId;

    fn data(&self) -> &JobData;

    /// Attempts made including this delivery (1-indexed).
    fn attempts_made(&self) -> u32;

    /// Persist a new domain payload for this job. Used for resumable-state
    /// bookkeeping between attempts.
    async fn update_data(&mut self, data: JobData) -> Result<(), QueueError>;

    /// Finish terminally with a result; the record moves to the bounded
    /// completed set.
    async fn complete(self: Box<Self>, result: JobResult) -> Result<(), QueueError>;

    /// Report a failed attempt; the queue schedules a delayed retry or, at
    /// the attempt ceiling, fails the job terminally with `error` as its
    /// failure description.
    async fn fail(self: Box<Self>, error: String) -> Result<(), QueueError>;
}

/// Durable queue port.
///
/// The in-memory implementation backs development and tests; the seam
/// exists so a broker-backed queue can be swapped in without touching the
/// worker.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Add a job, returning its queue-assigned id immediately. Never waits
    /// for execution.
    async fn add(&self, data: JobData) -> Result<JobId, QueueError>;

    /// Snapshot a job by id. Evicted and never-known ids return `None`.
    async fn get_job(&self, id: JobId) -> Option<JobView>;

    /// Wait for the next deliverable job. Returns `None` once the queue is
    /// shut down. At most one live lease exists per job id.
    async fn next_job(&self) -> Option<Box<dyn JobLease>>;

    /// Job counts by state.
    async fn counts(&self) -> JobCounts;
}
