//! relay-core
//!
//! Asynchronous transaction-submission pipeline for consensus-backed
//! ledgers: accept a request to mutate ledger state, queue it for
//! out-of-band processing, execute it against the ledger gateway, classify
//! the outcome, and retry without double effect.
//!
//! # Modules
//! - **domain**: identifiers, job payloads, results, lifecycle state
//! - **ledger**: gateway ports, decoded error shapes, retry classification,
//!   principal-to-contract registry
//! - **queue**: durable queue port, in-memory implementation, scheduler
//! - **worker**: submission worker pool
//! - **status**: caller-facing submission and status service
//! - **config**: process configuration

pub mod config;
pub mod domain;
pub mod ledger;
pub mod queue;
pub mod status;
pub mod worker;
