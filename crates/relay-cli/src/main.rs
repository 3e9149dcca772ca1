//! Demo driver for the submission pipeline.
//!
//! Wires the in-memory queue, scheduler, and worker pool against a flaky
//! in-process ledger contract, then enqueues a few jobs and polls their
//! summaries: one succeeds after a timeout-retry that resumes the same
//! transaction, one is rejected by the contract and resolves without
//! retries, one is routed to an unknown principal and soft-fails.

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_core::config::Config;
use relay_core::domain::TransactionId;
use relay_core::ledger::{
    ContractRegistry, GatewayError, LedgerContract, LedgerTransaction, TimeoutPhase,
};
use relay_core::queue::{DurableQueue, InMemoryJobQueue, QueueScheduler};
use relay_core::status::{add_submit_job, get_job_counts, get_job_summary};
use relay_core::worker::{WorkerEnvironment, WorkerGroup};

/// In-process contract with scripted behavior per operation:
/// - `CreateAsset` times out once, then commits and echoes its arguments
/// - `CreateDuplicate` is always rejected by the contract logic
struct DemoContract {
    remaining_timeouts: Arc<AtomicU32>,
    next_transaction: AtomicU64,
}

impl DemoContract {
    fn new(timeouts: u32) -> Self {
        Self {
            remaining_timeouts: Arc::new(AtomicU32::new(timeouts)),
            next_transaction: AtomicU64::new(1),
        }
    }
}

struct DemoTransaction {
    id: TransactionId,
    operation: String,
    remaining_timeouts: Arc<AtomicU32>,
}

#[async_trait]
impl LedgerTransaction for DemoTransaction {
    fn transaction_id(&self) -> TransactionId {
        self.id.clone()
    }

    fn serialize(&self) -> Vec<u8> {
        format!("demo:{}:{}", self.operation, self.id).into_bytes()
    }

    async fn submit(&mut self, args: &[String]) -> Result<Vec<u8>, GatewayError> {
        match self.operation.as_str() {
            "CreateDuplicate" => Err(GatewayError::Other(format!(
                "the asset {} already exists",
                args.first().map(String::as_str).unwrap_or("asset1")
            ))),
            _ => {
                let timed_out = self
                    .remaining_timeouts
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                        left.checked_sub(1)
                    })
                    .is_ok();
                if timed_out {
                    return Err(GatewayError::Timeout {
                        phase: TimeoutPhase::Commit,
                    });
                }
                let payload = serde_json::json!({
                    "operation": self.operation,
                    "args": args,
                });
                Ok(payload.to_string().into_bytes())
            }
        }
    }
}

#[async_trait]
impl LedgerContract for DemoContract {
    fn create_transaction(&self, operation: &str) -> Box<dyn LedgerTransaction> {
        let n = self.next_transaction.fetch_add(1, Ordering::SeqCst);
        Box::new(DemoTransaction {
            id: TransactionId::new(format!("txn{n}")),
            operation: operation.to_string(),
            remaining_timeouts: Arc::clone(&self.remaining_timeouts),
        })
    }

    fn deserialize_transaction(
        &self,
        state: &[u8],
    ) -> Result<Box<dyn LedgerTransaction>, GatewayError> {
        let state = std::str::from_utf8(state)
            .map_err(|_| GatewayError::Other("corrupt transaction state".into()))?;
        let mut parts = state.splitn(3, ':');
        let (Some("demo"), Some(operation), Some(id)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(GatewayError::Other("corrupt transaction state".into()));
        };
        Ok(Box::new(DemoTransaction {
            id: TransactionId::new(id),
            operation: operation.to_string(),
            remaining_timeouts: Arc::clone(&self.remaining_timeouts),
        }))
    }

    async fn evaluate(&self, operation: &str, args: &[String]) -> Result<Vec<u8>, GatewayError> {
        let payload = serde_json::json!({ "operation": operation, "args": args });
        Ok(payload.to_string().into_bytes())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = Config::from_env()?;
    // Keep the demo snappy regardless of the configured production backoff.
    config.submit_backoff.delay = Duration::from_millis(500);
    config.scheduler_tick = Duration::from_millis(100);

    let registry = Arc::new(ContractRegistry::new());
    registry.register("Org1MSP", Arc::new(DemoContract::new(1)));

    let queue = Arc::new(InMemoryJobQueue::new(config.queue_options()));
    let scheduler = config
        .scheduler_enabled
        .then(|| QueueScheduler::spawn(Arc::clone(&queue), config.scheduler_tick));
    let workers = WorkerGroup::spawn(
        config.submit_concurrency,
        Arc::clone(&queue) as Arc<dyn DurableQueue>,
        WorkerEnvironment::new(registry, config.submit_timeout + config.commit_timeout),
    );

    let create = add_submit_job(
        queue.as_ref(),
        "Org1MSP",
        "CreateAsset",
        vec!["asset1".into(), "blue".into()],
    )
    .await?;
    let duplicate = add_submit_job(
        queue.as_ref(),
        "Org1MSP",
        "CreateDuplicate",
        vec!["asset1".into()],
    )
    .await?;
    let misrouted = add_submit_job(queue.as_ref(), "GhostMSP", "CreateAsset", vec![]).await?;
    info!(%create, %duplicate, %misrouted, "jobs enqueued");

    for job_id in [create, duplicate, misrouted] {
        let summary = loop {
            let summary = get_job_summary(queue.as_ref(), job_id).await?;
            if summary.transaction_payload.is_some() || summary.transaction_error.is_some() {
                break summary;
            }
            sleep(Duration::from_millis(100)).await;
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    let counts = get_job_counts(queue.as_ref()).await;
    println!("{}", serde_json::to_string(&counts)?);

    workers.shutdown_and_join().await;
    if let Some(scheduler) = scheduler {
        scheduler.shutdown_and_join().await;
    }
    queue.close().await;

    Ok(())
}
