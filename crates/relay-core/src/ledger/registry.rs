//! Principal-to-contract resolution.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::LedgerContract;

/// Maps principals (tenant identities) to their ledger contract handles.
///
/// Populated at process start and appended to when new principals are
/// provisioned; reads vastly outnumber writes, so a `RwLock` keeps the
/// steady-state lookup path contention-free. Workers receive the registry
/// as an injected capability, never through process-global state.
#[derive(Default)]
pub struct ContractRegistry {
    contracts: RwLock<HashMap<String, Arc<dyn LedgerContract>>>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a principal to a contract handle, replacing any previous binding.
    pub fn register(&self, principal: impl Into<String>, contract: Arc<dyn LedgerContract>) {
        let mut contracts = self.contracts.write().expect("contract registry poisoned");
        contracts.insert(principal.into(), contract);
    }

    /// Resolve the contract handle for a principal.
    pub fn get(&self, principal: &str) -> Option<Arc<dyn LedgerContract>> {
        let contracts = self.contracts.read().expect("contract registry poisoned");
        contracts.get(principal).cloned()
    }

    pub fn len(&self) -> usize {
        self.contracts
            .read()
            .expect("contract registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
