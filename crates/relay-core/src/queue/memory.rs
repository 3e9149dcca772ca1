//! In-memory durable queue implementation.
//!
//! Backs development and tests. State transitions all happen inside one
//! mutex-guarded state struct; leases validate themselves against the
//! attempt counter so a stalled delivery that was reclaimed cannot finish
//! the job behind the queue's back.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use super::{DurableQueue, JobCounts, JobLease, QueueError, QueueOptions};
use crate::domain::{JobData, JobId, JobResult, JobState, JobView};

/// Delayed-queue entry; reversed ordering turns `BinaryHeap` into a
/// min-heap (earliest `next_run_at` first).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DelayedJob {
    next_run_at: Instant,
    id: JobId,
}

impl PartialOrd for DelayedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .next_run_at
            .cmp(&self.next_run_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Single source of truth for one job.
#[derive(Debug)]
struct JobEntry {
    data: JobData,
    state: JobState,
    attempts_made: u32,
    result: Option<JobResult>,
    last_error: Option<String>,
    lease_deadline: Option<Instant>,
    enqueued_at: DateTime<Utc>,
}

/// Mutex-guarded queue state. All transitions are methods here so field
/// borrows stay within one `&mut self`.
struct QueueState {
    entries: HashMap<JobId, JobEntry>,
    ready: VecDeque<JobId>,
    delayed: BinaryHeap<DelayedJob>,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    shutdown: bool,
}

impl QueueState {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            ready: VecDeque::new(),
            delayed: BinaryHeap::new(),
            completed: VecDeque::new(),
            failed: VecDeque::new(),
            shutdown: false,
        }
    }

    fn insert_waiting(&mut self, id: JobId, data: JobData) {
        self.entries.insert(
            id,
            JobEntry {
                data,
                state: JobState::Waiting,
                attempts_made: 0,
                result: None,
                last_error: None,
                lease_deadline: None,
                enqueued_at: Utc::now(),
            },
        );
        self.ready.push_back(id);
    }

    /// Validates that `lease` still owns its job and returns the entry.
    fn leased_entry(
        &mut self,
        id: JobId,
        attempts_made: u32,
    ) -> Result<&mut JobEntry, QueueError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(QueueError::UnknownJob(id))?;
        if entry.state != JobState::Active || entry.attempts_made != attempts_made {
            return Err(QueueError::LeaseExpired(id));
        }
        Ok(entry)
    }

    fn complete(
        &mut self,
        id: JobId,
        attempts_made: u32,
        result: JobResult,
        keep_completed: usize,
    ) -> Result<(), QueueError> {
        let entry = self.leased_entry(id, attempts_made)?;
        entry.state = JobState::Completed;
        entry.result = Some(result);
        entry.lease_deadline = None;
        self.completed.push_back(id);
        self.retain_completed(keep_completed);
        Ok(())
    }

    fn fail(
        &mut self,
        id: JobId,
        attempts_made: u32,
        error: String,
        options: &QueueOptions,
    ) -> Result<(), QueueError> {
        let entry = self.leased_entry(id, attempts_made)?;
        entry.lease_deadline = None;
        if attempts_made >= options.attempts {
            // Attempt ceiling reached: the last real error becomes the
            // terminal failure description.
            entry.state = JobState::Failed;
            entry.last_error = Some(error.clone());
            entry.result = Some(JobResult::failure(error));
            self.failed.push_back(id);
            self.retain_failed(options.keep_failed);
        } else {
            let next_run_at = Instant::now() + options.backoff.delay_for(attempts_made);
            entry.state = JobState::Delayed;
            entry.last_error = Some(error);
            self.delayed.push(DelayedJob { next_run_at, id });
        }
        Ok(())
    }

    fn update_data(
        &mut self,
        id: JobId,
        attempts_made: u32,
        data: JobData,
    ) -> Result<(), QueueError> {
        let entry = self.leased_entry(id, attempts_made)?;
        entry.data = data;
        Ok(())
    }

    /// Move delayed jobs whose backoff has elapsed back to waiting.
    fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some(next) = self.delayed.peek() {
            if next.next_run_at > now {
                break;
            }
            let DelayedJob { id, .. } = self.delayed.pop().expect("peeked delayed entry");
            if let Some(entry) = self.entries.get_mut(&id)
                && entry.state == JobState::Delayed
            {
                entry.state = JobState::Waiting;
                self.ready.push_back(id);
                promoted += 1;
            }
        }
        promoted
    }

    /// Return stalled active jobs (lease deadline passed) to waiting, or
    /// fail them terminally once the attempt ceiling is reached.
    fn requeue_stalled(&mut self, now: Instant, options: &QueueOptions) -> usize {
        let stalled: Vec<JobId> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.state == JobState::Active
                    && entry.lease_deadline.is_some_and(|deadline| deadline <= now)
            })
            .map(|(id, _)| *id)
            .collect();

        let reclaimed = stalled.len();
        for id in stalled {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            entry.lease_deadline = None;
            if entry.attempts_made >= options.attempts {
                entry.state = JobState::Failed;
                entry.last_error = Some("job stalled beyond the attempt limit".to_string());
                entry.result = Some(JobResult::failure("job stalled beyond the attempt limit"));
                self.failed.push_back(id);
            } else {
                entry.state = JobState::Waiting;
                self.ready.push_back(id);
            }
        }
        self.retain_failed(options.keep_failed);
        reclaimed
    }

    /// Evict the oldest completed jobs beyond the retention bound. Evicted
    /// ids become unknown to `get_job`.
    fn retain_completed(&mut self, keep: usize) {
        while self.completed.len() > keep {
            if let Some(evicted) = self.completed.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    /// Evict the oldest terminally-failed jobs beyond the retention bound.
    fn retain_failed(&mut self, keep: usize) {
        while self.failed.len() > keep {
            if let Some(evicted) = self.failed.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for entry in self.entries.values() {
            match entry.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

/// In-memory durable queue.
pub struct InMemoryJobQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    options: QueueOptions,
}

impl InMemoryJobQueue {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::new())),
            notify: Arc::new(Notify::new()),
            options,
        }
    }

    /// Move delayed jobs whose backoff has elapsed back to the waiting
    /// queue, waking a worker per promoted job. Normally driven by a
    /// [`super::QueueScheduler`].
    pub async fn promote_due_jobs(&self) -> usize {
        let promoted = {
            let mut state = self.state.lock().await;
            state.promote_due(Instant::now())
        };
        for _ in 0..promoted {
            self.notify.notify_one();
        }
        promoted
    }

    /// Reclaim active jobs whose lease deadline has passed (worker presumed
    /// dead) and make them deliverable again. Normally driven by a
    /// [`super::QueueScheduler`].
    pub async fn requeue_stalled_jobs(&self) -> usize {
        let reclaimed = {
            let mut state = self.state.lock().await;
            state.requeue_stalled(Instant::now(), &self.options)
        };
        for _ in 0..reclaimed {
            self.notify.notify_one();
        }
        reclaimed
    }

    /// Shut the queue down: pending and future `next_job` calls return
    /// `None`.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.shutdown = true;
        drop(state);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(QueueOptions::default())
    }
}

#[async_trait]
impl DurableQueue for InMemoryJobQueue {
    async fn add(&self, data: JobData) -> Result<JobId, QueueError> {
        let id = JobId::generate();
        let mut state = self.state.lock().await;
        state.insert_waiting(id, data);
        drop(state);
        self.notify.notify_one();
        debug!(job_id = %id, "job added");
        Ok(id)
    }

    async fn get_job(&self, id: JobId) -> Option<JobView> {
        let state = self.state.lock().await;
        state.entries.get(&id).map(|entry| JobView {
            id,
            data: Some(entry.data.clone()),
            state: entry.state,
            attempts_made: entry.attempts_made,
            result: entry.result.clone(),
            enqueued_at: entry.enqueued_at,
        })
    }

    async fn next_job(&self) -> Option<Box<dyn JobLease>> {
        loop {
            {
                let mut state = self.state.lock().await;
                if state.shutdown {
                    drop(state);
                    // Chain the wakeup so every parked worker drains out.
                    self.notify.notify_one();
                    return None;
                }
                while let Some(id) = state.ready.pop_front() {
                    if let Some(entry) = state.entries.get_mut(&id)
                        && entry.state == JobState::Waiting
                    {
                        entry.state = JobState::Active;
                        entry.attempts_made += 1;
                        entry.lease_deadline = Some(Instant::now() + self.options.lease_timeout);
                        let lease = InMemoryLease {
                            id,
                            attempts_made: entry.attempts_made,
                            data: entry.data.clone(),
                            state: Arc::clone(&self.state),
                            options: self.options.clone(),
                        };
                        return Some(Box::new(lease));
                    }
                }
            }
            self.notify.notified().await;
        }
    }

    async fn counts(&self) -> JobCounts {
        let state = self.state.lock().await;
        state.counts()
    }
}

/// Lease handed to a worker for one delivery.
struct InMemoryLease {
    id: JobId,
    attempts_made: u32,
    data: JobData,
    state: Arc<Mutex<QueueState>>,
    options: QueueOptions,
}

#[async_trait]
impl JobLease for InMemoryLease {
    fn id(&self) -> JobId {
        self.id
    }

    fn data(&self) -> &JobData {
        &self.data
    }

    fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    async fn update_data(&mut self, data: JobData) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.update_data(self.id, self.attempts_made, data.clone())?;
        self.data = data;
        Ok(())
    }

    async fn complete(self: Box<Self>, result: JobResult) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.complete(
            self.id,
            self.attempts_made,
            result,
            self.options.keep_completed,
        )
    }

    async fn fail(self: Box<Self>, error: String) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.fail(self.id, self.attempts_made, error, &self.options)
    }
}
