//! Ledger gateway boundary.
//!
//! The consensus-backed ledger is an external collaborator: this module
//! defines the narrow ports the pipeline consumes it through, the decoded
//! error shapes that cross the boundary, and the principal-to-contract
//! registry used to route jobs.

pub mod error;
pub mod registry;

pub use error::{
    ContractError, ContractErrorKind, GatewayError, RetryDirective, TimeoutPhase,
    classify_contract_message, is_duplicate_transaction_error, retry_directive,
};
pub use registry::ContractRegistry;

use async_trait::async_trait;

use crate::domain::TransactionId;

/// A named-operation endpoint on the ledger, scoped to one principal's
/// endorsement context.
///
/// Contract handles are long-lived and shared across workers; creating one
/// per call defeats connection reuse in real gateway implementations.
#[async_trait]
pub trait LedgerContract: Send + Sync {
    /// Start a new state-mutating transaction under a fresh identity.
    fn create_transaction(&self, operation: &str) -> Box<dyn LedgerTransaction>;

    /// Rehydrate an in-flight transaction from its serialized state,
    /// preserving the original identity and argument bindings.
    fn deserialize_transaction(
        &self,
        state: &[u8],
    ) -> Result<Box<dyn LedgerTransaction>, GatewayError>;

    /// Run a read-only operation. No identity bookkeeping is involved
    /// because nothing is committed.
    async fn evaluate(&self, operation: &str, args: &[String]) -> Result<Vec<u8>, GatewayError>;
}

/// One state-mutating ledger call in flight.
#[async_trait]
pub trait LedgerTransaction: Send {
    /// The identity this transaction will commit under.
    fn transaction_id(&self) -> TransactionId;

    /// Opaque resumable state; [`LedgerContract::deserialize_transaction`]
    /// round-trips it. The pipeline never inspects the bytes.
    fn serialize(&self) -> Vec<u8>;

    /// Submit for endorsement and commit, returning the result payload.
    async fn submit(&mut self, args: &[String]) -> Result<Vec<u8>, GatewayError>;
}
