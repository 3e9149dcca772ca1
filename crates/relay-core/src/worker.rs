//! Submission worker: drives one job through one attempt, and a bounded
//! pool of workers through the queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::domain::{JobData, JobResult};
use crate::ledger::{
    ContractRegistry, GatewayError, LedgerTransaction, RetryDirective, TimeoutPhase,
    classify_contract_message, retry_directive,
};
use crate::queue::{DurableQueue, JobLease, QueueError};

/// Capabilities a worker needs to process submit jobs.
///
/// Constructed once at startup and shared read-only across the pool.
#[derive(Clone)]
pub struct WorkerEnvironment {
    pub contracts: Arc<ContractRegistry>,

    /// Outer deadline for one submit call, covering endorsement and commit
    /// wait. Expiry surfaces as a submit timeout, not a generic failure, so
    /// the retry keeps the in-flight transaction identity.
    pub submit_timeout: Duration,
}

impl WorkerEnvironment {
    pub fn new(contracts: Arc<ContractRegistry>, submit_timeout: Duration) -> Self {
        Self {
            contracts,
            submit_timeout,
        }
    }
}

/// Tagged result of one processing attempt.
///
/// The queue-integration layer in [`WorkerGroup`] turns this into the
/// matching lease call; the retry policy itself stays free of queue side
/// effects.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Terminal success: a payload, or deliberately empty for jobs that had
    /// nothing to execute against.
    Success(JobResult),

    /// Terminal failure resolved locally; the queue must not retry.
    TerminalFailure(JobResult),

    /// The attempt failed but the queue should schedule a retry.
    RetriableFailure(GatewayError),
}

/// Rewrites the job payload's transaction bookkeeping.
///
/// With a transaction, records its identity and resumable serialization so
/// the next attempt can resubmit under the same identity; without one, drops
/// the resumable state so the next attempt mints a fresh transaction. The
/// identity history is kept either way.
pub fn apply_transaction_state(
    mut data: JobData,
    transaction: Option<&dyn LedgerTransaction>,
) -> JobData {
    match transaction {
        Some(transaction) => {
            let id = transaction.transaction_id();
            if data.transaction_ids.last() != Some(&id) {
                data.transaction_ids.push(id);
            }
            data.transaction_state = Some(transaction.serialize());
        }
        None => data.transaction_state = None,
    }
    data
}

/// Process one delivery of a submit job.
///
/// Queue errors (`LeaseExpired`) abort the attempt: the redelivery owns the
/// job from that point on, so nothing may be recorded against the lease.
pub async fn process_submit_job(
    env: &WorkerEnvironment,
    lease: &mut dyn JobLease,
) -> Result<AttemptOutcome, QueueError> {
    let mut data = lease.data().clone();
    debug!(
        job_id = %lease.id(),
        operation = %data.operation,
        attempt = lease.attempts_made(),
        "processing submit job"
    );

    let Some(contract) = env.contracts.get(&data.principal) else {
        // Deliberate soft-fail: a job routed to an unprovisioned principal
        // has nothing to execute against, and retrying cannot change that.
        warn!(job_id = %lease.id(), principal = %data.principal, "no contract for principal");
        return Ok(AttemptOutcome::Success(JobResult::empty()));
    };

    let saved_state = data.transaction_state.clone();
    let mut transaction = match saved_state {
        Some(state) => match contract.deserialize_transaction(&state) {
            Ok(transaction) => transaction,
            Err(err) => {
                // Unusable resumable state: drop it so the retry mints a
                // fresh transaction.
                warn!(job_id = %lease.id(), %err, "discarding unusable transaction state");
                data = apply_transaction_state(data, None);
                lease.update_data(data).await?;
                return Ok(AttemptOutcome::RetriableFailure(err));
            }
        },
        None => {
            let transaction = contract.create_transaction(&data.operation);
            // Record the fresh identity and its resumable state before
            // submitting, so a timeout on this attempt can resubmit under
            // the same identity.
            data = apply_transaction_state(data, Some(transaction.as_ref()));
            lease.update_data(data.clone()).await?;
            transaction
        }
    };

    let transaction_id = transaction.transaction_id();
    let submitted = match tokio::time::timeout(env.submit_timeout, transaction.submit(&data.args))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout {
            phase: TimeoutPhase::Submit,
        }),
    };
    match submitted {
        Ok(payload) => {
            debug!(job_id = %lease.id(), %transaction_id, "transaction committed");
            data = apply_transaction_state(data, None);
            lease.update_data(data).await?;
            Ok(AttemptOutcome::Success(JobResult::success(payload)))
        }
        Err(err) => {
            let err = classify_contract_message(&transaction_id, err);
            match retry_directive(&err) {
                RetryDirective::NoRetry => {
                    error!(job_id = %lease.id(), %err, "fatal transaction error");
                    data = apply_transaction_state(data, None);
                    lease.update_data(data).await?;
                    Ok(AttemptOutcome::TerminalFailure(JobResult::failure(
                        err.to_string(),
                    )))
                }
                RetryDirective::RetryKeepIdentity => {
                    warn!(job_id = %lease.id(), %err, "retrying with the existing transaction");
                    data = apply_transaction_state(data, Some(transaction.as_ref()));
                    lease.update_data(data).await?;
                    Ok(AttemptOutcome::RetriableFailure(err))
                }
                RetryDirective::RetryNewIdentity => {
                    warn!(job_id = %lease.id(), %err, "retrying with a new transaction");
                    data = apply_transaction_state(data, None);
                    lease.update_data(data).await?;
                    Ok(AttemptOutcome::RetriableFailure(err))
                }
            }
        }
    }
}

/// Bounded pool of submission workers over one queue.
///
/// Dropping the group does not cancel in-flight attempts; shutdown stops
/// workers from taking new leases and waits for the current ones to finish.
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers sharing `queue` and `env`.
    pub fn spawn(n: usize, queue: Arc<dyn DurableQueue>, env: WorkerEnvironment) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let queue = Arc::clone(&queue);
            let env = env.clone();
            let mut shutdown_rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, queue, env, &mut shutdown_rx).await;
            }));
        }

        Self { shutdown_tx, joins }
    }

    /// Request shutdown for all workers without waiting.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        let _ = self.shutdown_tx.send(true);
        for join in self.joins {
            let _ = join.await;
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<dyn DurableQueue>,
    env: WorkerEnvironment,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let lease = tokio::select! {
            _ = shutdown_rx.changed() => continue,
            lease = queue.next_job() => lease,
        };
        let Some(mut lease) = lease else {
            // Queue shut down.
            break;
        };
        let job_id = lease.id();

        let outcome = process_submit_job(&env, lease.as_mut()).await;
        match outcome {
            Ok(AttemptOutcome::Success(result)) => {
                debug!(worker_id, %job_id, "job completed");
                if let Err(err) = lease.complete(result).await {
                    error!(worker_id, %job_id, %err, "failed to record job completion");
                }
            }
            Ok(AttemptOutcome::TerminalFailure(result)) => {
                warn!(worker_id, %job_id, "job failed without retry");
                if let Err(err) = lease.complete(result).await {
                    error!(worker_id, %job_id, %err, "failed to record job failure");
                }
            }
            Ok(AttemptOutcome::RetriableFailure(gateway_err)) => {
                warn!(worker_id, %job_id, err = %gateway_err, "job attempt failed");
                if let Err(err) = lease.fail(gateway_err.to_string()).await {
                    error!(worker_id, %job_id, %err, "failed to report job failure");
                }
            }
            Err(err) => {
                // The lease was reclaimed mid-attempt; the redelivery owns
                // the job now.
                warn!(worker_id, %job_id, %err, "dropping lost lease");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::domain::TransactionId;
    use crate::ledger::{LedgerContract, TimeoutPhase};
    use crate::queue::{BackoffPolicy, InMemoryJobQueue, QueueOptions, QueueScheduler};
    use crate::status::{add_submit_job, get_job_summary};

    type ScriptedResults = Arc<Mutex<VecDeque<Result<Vec<u8>, GatewayError>>>>;

    struct MockTransaction {
        id: TransactionId,
        results: ScriptedResults,
    }

    #[async_trait]
    impl LedgerTransaction for MockTransaction {
        fn transaction_id(&self) -> TransactionId {
            self.id.clone()
        }

        fn serialize(&self) -> Vec<u8> {
            format!("STATE:{}", self.id).into_bytes()
        }

        async fn submit(&mut self, _args: &[String]) -> Result<Vec<u8>, GatewayError> {
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .expect("scripted submit result")
        }
    }

    /// Contract whose submit results are scripted per test, with distinct
    /// transaction ids per created transaction.
    struct MockContract {
        results: ScriptedResults,
        created: AtomicUsize,
        deserialized: AtomicUsize,
    }

    impl MockContract {
        fn scripted(results: Vec<Result<Vec<u8>, GatewayError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Arc::new(Mutex::new(results.into())),
                created: AtomicUsize::new(0),
                deserialized: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LedgerContract for MockContract {
        fn create_transaction(&self, _operation: &str) -> Box<dyn LedgerTransaction> {
            let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
            Box::new(MockTransaction {
                id: TransactionId::new(format!("txn{n}")),
                results: Arc::clone(&self.results),
            })
        }

        fn deserialize_transaction(
            &self,
            state: &[u8],
        ) -> Result<Box<dyn LedgerTransaction>, GatewayError> {
            let state = std::str::from_utf8(state)
                .map_err(|_| GatewayError::Other("corrupt transaction state".into()))?;
            let id = state
                .strip_prefix("STATE:")
                .ok_or_else(|| GatewayError::Other("corrupt transaction state".into()))?;
            self.deserialized.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockTransaction {
                id: TransactionId::new(id),
                results: Arc::clone(&self.results),
            }))
        }

        async fn evaluate(
            &self,
            _operation: &str,
            _args: &[String],
        ) -> Result<Vec<u8>, GatewayError> {
            Ok(Vec::new())
        }
    }

    fn environment_with(contract: Arc<MockContract>) -> WorkerEnvironment {
        let registry = ContractRegistry::new();
        registry.register("Org1MSP", contract);
        WorkerEnvironment::new(Arc::new(registry), Duration::from_secs(5))
    }

    fn test_queue() -> InMemoryJobQueue {
        InMemoryJobQueue::new(QueueOptions {
            attempts: 5,
            backoff: BackoffPolicy::fixed(Duration::from_millis(5)),
            ..QueueOptions::default()
        })
    }

    fn submit_data() -> JobData {
        JobData::new("Org1MSP", "CreateAsset", vec!["arg1".into(), "arg2".into()])
    }

    #[test]
    fn recording_a_transaction_appends_its_id_and_state() {
        let contract = MockContract::scripted(vec![]);
        let transaction = contract.create_transaction("CreateAsset");

        let mut data = submit_data();
        data.transaction_ids.push(TransactionId::new("txn0"));
        let data = apply_transaction_state(data, Some(transaction.as_ref()));

        assert_eq!(
            data.transaction_ids,
            vec![TransactionId::new("txn0"), TransactionId::new("txn1")]
        );
        assert_eq!(data.transaction_state.as_deref(), Some(&b"STATE:txn1"[..]));
    }

    #[test]
    fn clearing_the_transaction_keeps_the_id_history() {
        let mut data = submit_data();
        data.transaction_ids.push(TransactionId::new("txn1"));
        data.transaction_state = Some(b"STATE:txn1".to_vec());

        let data = apply_transaction_state(data, None);

        assert_eq!(data.transaction_ids, vec![TransactionId::new("txn1")]);
        assert_eq!(data.transaction_state, None);
    }

    #[test]
    fn re_recording_the_same_transaction_does_not_duplicate_its_id() {
        let contract = MockContract::scripted(vec![]);
        let transaction = contract.create_transaction("CreateAsset");

        let data = apply_transaction_state(submit_data(), Some(transaction.as_ref()));
        let data = apply_transaction_state(data, Some(transaction.as_ref()));

        assert_eq!(data.transaction_ids, vec![TransactionId::new("txn1")]);
    }

    #[tokio::test]
    async fn unknown_principal_soft_fails_with_an_empty_result() {
        let env = environment_with(MockContract::scripted(vec![]));
        let queue = test_queue();
        queue
            .add(JobData::new("missingMSP", "CreateAsset", vec![]))
            .await
            .unwrap();

        let mut lease = queue.next_job().await.unwrap();
        let outcome = process_submit_job(&env, lease.as_mut()).await.unwrap();

        let AttemptOutcome::Success(result) = outcome else {
            panic!("expected a soft-fail success, got {outcome:?}");
        };
        assert_eq!(result, JobResult::empty());
    }

    #[tokio::test]
    async fn first_attempt_success_returns_the_payload() {
        let contract = MockContract::scripted(vec![Ok(b"MOCK PAYLOAD".to_vec())]);
        let env = environment_with(Arc::clone(&contract));
        let queue = test_queue();
        let id = queue.add(submit_data()).await.unwrap();

        let mut lease = queue.next_job().await.unwrap();
        let outcome = process_submit_job(&env, lease.as_mut()).await.unwrap();

        let AttemptOutcome::Success(result) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(result, JobResult::success(b"MOCK PAYLOAD".to_vec()));

        // The identity was recorded, and the resumable state cleared once
        // the attempt went terminal.
        let data = queue.get_job(id).await.unwrap().data.unwrap();
        assert_eq!(data.transaction_ids, vec![TransactionId::new("txn1")]);
        assert_eq!(data.transaction_state, None);
    }

    #[tokio::test]
    async fn saved_state_is_resumed_instead_of_creating_a_transaction() {
        let contract = MockContract::scripted(vec![Ok(b"MOCK PAYLOAD".to_vec())]);
        let env = environment_with(Arc::clone(&contract));
        let queue = test_queue();

        let mut data = submit_data();
        data.transaction_ids.push(TransactionId::new("txn9"));
        data.transaction_state = Some(b"STATE:txn9".to_vec());
        queue.add(data).await.unwrap();

        let mut lease = queue.next_job().await.unwrap();
        let outcome = process_submit_job(&env, lease.as_mut()).await.unwrap();

        assert!(matches!(outcome, AttemptOutcome::Success(_)));
        assert_eq!(contract.deserialized.load(Ordering::SeqCst), 1);
        assert_eq!(contract.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn contract_errors_resolve_terminally_with_a_typed_description() {
        let contract = MockContract::scripted(vec![Err(GatewayError::Other(
            "Failed to get transaction with id txn, error Entry not found in index".into(),
        ))]);
        let env = environment_with(contract);
        let queue = test_queue();
        let id = queue.add(submit_data()).await.unwrap();

        let mut lease = queue.next_job().await.unwrap();
        let outcome = process_submit_job(&env, lease.as_mut()).await.unwrap();

        let AttemptOutcome::TerminalFailure(result) = outcome else {
            panic!("expected a terminal failure, got {outcome:?}");
        };
        assert_eq!(
            result.transaction_error.as_deref(),
            Some("OperationNotFoundError: Failed to get transaction with id txn, error Entry not found in index")
        );
        assert_eq!(result.transaction_payload, None);

        let data = queue.get_job(id).await.unwrap().data.unwrap();
        assert_eq!(data.transaction_state, None);
    }

    #[tokio::test]
    async fn duplicate_commits_resolve_terminally() {
        let contract = MockContract::scripted(vec![Err(GatewayError::CommitFailure {
            transaction_id: TransactionId::new("txn1"),
            code: "DUPLICATE_TXID".into(),
        })]);
        let env = environment_with(contract);
        let queue = test_queue();
        queue.add(submit_data()).await.unwrap();

        let mut lease = queue.next_job().await.unwrap();
        let outcome = process_submit_job(&env, lease.as_mut()).await.unwrap();

        let AttemptOutcome::TerminalFailure(result) = outcome else {
            panic!("expected a terminal failure, got {outcome:?}");
        };
        assert_eq!(
            result.transaction_error.as_deref(),
            Some("transaction txn1 failed to commit with status DUPLICATE_TXID")
        );
    }

    #[tokio::test]
    async fn generic_errors_retry_under_a_new_identity() {
        let contract = MockContract::scripted(vec![Err(GatewayError::Other("MOCK ERROR".into()))]);
        let env = environment_with(contract);
        let queue = test_queue();
        let id = queue.add(submit_data()).await.unwrap();

        let mut lease = queue.next_job().await.unwrap();
        let outcome = process_submit_job(&env, lease.as_mut()).await.unwrap();

        let AttemptOutcome::RetriableFailure(err) = outcome else {
            panic!("expected a retriable failure, got {outcome:?}");
        };
        assert_eq!(err, GatewayError::Other("MOCK ERROR".into()));

        // Identity history survives, but the state is cleared so the retry
        // mints a fresh transaction.
        let data = queue.get_job(id).await.unwrap().data.unwrap();
        assert_eq!(data.transaction_ids, vec![TransactionId::new("txn1")]);
        assert_eq!(data.transaction_state, None);
    }

    #[tokio::test]
    async fn timeouts_retry_under_the_same_identity() {
        let contract = MockContract::scripted(vec![
            Err(GatewayError::Timeout {
                phase: TimeoutPhase::Submit,
            }),
            Ok(b"MOCK PAYLOAD".to_vec()),
        ]);
        let env = environment_with(Arc::clone(&contract));
        let queue = test_queue();
        let id = queue.add(submit_data()).await.unwrap();

        let mut lease = queue.next_job().await.unwrap();
        let outcome = process_submit_job(&env, lease.as_mut()).await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::RetriableFailure(_)));

        // The serialized in-flight transaction is persisted for the retry.
        let data = queue.get_job(id).await.unwrap().data.unwrap();
        assert_eq!(data.transaction_ids, vec![TransactionId::new("txn1")]);
        assert_eq!(data.transaction_state.as_deref(), Some(&b"STATE:txn1"[..]));
        lease.fail("timeout".to_string()).await.unwrap();

        // The next delivery resumes the same transaction.
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.promote_due_jobs().await;
        let mut lease = queue.next_job().await.unwrap();
        let outcome = process_submit_job(&env, lease.as_mut()).await.unwrap();

        assert!(matches!(outcome, AttemptOutcome::Success(_)));
        assert_eq!(contract.deserialized.load(Ordering::SeqCst), 1);
        assert_eq!(contract.created.load(Ordering::SeqCst), 1);

        let data = queue.get_job(id).await.unwrap().data.unwrap();
        assert_eq!(data.transaction_ids, vec![TransactionId::new("txn1")]);
    }

    struct HangingTransaction;

    #[async_trait]
    impl LedgerTransaction for HangingTransaction {
        fn transaction_id(&self) -> TransactionId {
            TransactionId::new("txn1")
        }

        fn serialize(&self) -> Vec<u8> {
            b"STATE:txn1".to_vec()
        }

        async fn submit(&mut self, _args: &[String]) -> Result<Vec<u8>, GatewayError> {
            std::future::pending().await
        }
    }

    struct HangingContract;

    #[async_trait]
    impl LedgerContract for HangingContract {
        fn create_transaction(&self, _operation: &str) -> Box<dyn LedgerTransaction> {
            Box::new(HangingTransaction)
        }

        fn deserialize_transaction(
            &self,
            _state: &[u8],
        ) -> Result<Box<dyn LedgerTransaction>, GatewayError> {
            Ok(Box::new(HangingTransaction))
        }

        async fn evaluate(
            &self,
            _operation: &str,
            _args: &[String],
        ) -> Result<Vec<u8>, GatewayError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn slow_submits_hit_the_outer_deadline_and_keep_their_identity() {
        let registry = ContractRegistry::new();
        registry.register("Org1MSP", Arc::new(HangingContract));
        let env = WorkerEnvironment::new(Arc::new(registry), Duration::from_millis(10));

        let queue = test_queue();
        let id = queue.add(submit_data()).await.unwrap();

        let mut lease = queue.next_job().await.unwrap();
        let outcome = process_submit_job(&env, lease.as_mut()).await.unwrap();

        let AttemptOutcome::RetriableFailure(err) = outcome else {
            panic!("expected a retriable failure, got {outcome:?}");
        };
        assert_eq!(
            err,
            GatewayError::Timeout {
                phase: TimeoutPhase::Submit
            }
        );

        // The in-flight identity survives for the resumed retry.
        let data = queue.get_job(id).await.unwrap().data.unwrap();
        assert_eq!(data.transaction_state.as_deref(), Some(&b"STATE:txn1"[..]));
    }

    #[tokio::test]
    async fn unusable_saved_state_is_discarded_and_retried() {
        let contract = MockContract::scripted(vec![]);
        let env = environment_with(contract);
        let queue = test_queue();

        let mut data = submit_data();
        data.transaction_state = Some(b"GARBAGE".to_vec());
        let id = queue.add(data).await.unwrap();

        let mut lease = queue.next_job().await.unwrap();
        let outcome = process_submit_job(&env, lease.as_mut()).await.unwrap();

        assert!(matches!(outcome, AttemptOutcome::RetriableFailure(_)));
        let data = queue.get_job(id).await.unwrap().data.unwrap();
        assert_eq!(data.transaction_state, None);
    }

    #[tokio::test]
    async fn worker_group_drives_a_job_through_retry_to_completion() {
        let contract = MockContract::scripted(vec![
            Err(GatewayError::Timeout {
                phase: TimeoutPhase::Submit,
            }),
            Ok(b"MOCK PAYLOAD".to_vec()),
        ]);
        let env = environment_with(Arc::clone(&contract));

        let queue = Arc::new(test_queue());
        let scheduler = QueueScheduler::spawn(Arc::clone(&queue), Duration::from_millis(5));
        let workers = WorkerGroup::spawn(2, Arc::clone(&queue) as Arc<dyn DurableQueue>, env);

        let id = add_submit_job(
            queue.as_ref(),
            "Org1MSP",
            "CreateAsset",
            vec!["arg1".into(), "arg2".into()],
        )
        .await
        .unwrap();

        let mut summary = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let current = get_job_summary(queue.as_ref(), id).await.unwrap();
            if current.transaction_payload.is_some() {
                summary = Some(current);
                break;
            }
        }
        let summary = summary.expect("job did not complete in time");

        assert_eq!(summary.transaction_error, None);
        assert_eq!(summary.transaction_payload.as_deref(), Some("MOCK PAYLOAD"));
        assert_eq!(summary.transaction_ids, vec![TransactionId::new("txn1")]);

        workers.shutdown_and_join().await;
        scheduler.shutdown_and_join().await;
    }
}
