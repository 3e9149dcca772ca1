//! Gateway error decode, retry classification, and business-error matching.
//!
//! Everything the remote side can surface is decoded into [`GatewayError`]
//! at the gateway boundary; the worker and the classifier only ever see this
//! closed set of shapes.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::domain::TransactionId;

/// Commit status code reported when a transaction id was already committed.
const DUPLICATE_TXID_CODE: &str = "DUPLICATE_TXID";

/// Endorsement detail prefix reported by peers that saw the id before.
const DUPLICATE_ENDORSEMENT_DETAIL: &str = "duplicate transaction found";

/// Phase of the ledger call whose deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Evaluate,
    Submit,
    Commit,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            TimeoutPhase::Evaluate => "evaluate",
            TimeoutPhase::Submit => "submit",
            TimeoutPhase::Commit => "commit",
        };
        f.write_str(phase)
    }
}

/// Kind of business-rule rejection reported by the remote operation logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractErrorKind {
    /// The named operation is not implemented by the contract.
    OperationNotFound,

    /// The record being created already exists.
    RecordExists,

    /// The record being read or mutated does not exist.
    RecordNotFound,

    /// The operation logic rejected the call for some other reason.
    Other,
}

impl ContractErrorKind {
    /// Error type name used in caller-facing failure descriptions.
    pub fn type_name(self) -> &'static str {
        match self {
            ContractErrorKind::OperationNotFound => "OperationNotFoundError",
            ContractErrorKind::RecordExists => "RecordExistsError",
            ContractErrorKind::RecordNotFound => "RecordNotFoundError",
            ContractErrorKind::Other => "ContractError",
        }
    }
}

/// Business-rule rejection from the remote operation logic.
///
/// Not transient: retrying does not change the answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: {}", .kind.type_name(), .message)]
pub struct ContractError {
    pub kind: ContractErrorKind,
    pub message: String,

    /// Identity of the transaction whose submission surfaced the error.
    pub transaction_id: TransactionId,
}

impl ContractError {
    pub fn new(
        kind: ContractErrorKind,
        message: impl Into<String>,
        transaction_id: TransactionId,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            transaction_id,
        }
    }
}

/// Everything the ledger gateway can surface, decoded into a closed set of
/// shapes at the boundary. No field probing happens downstream of this type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The ordering service rejected the commit with an explicit status code.
    #[error("transaction {transaction_id} failed to commit with status {code}")]
    CommitFailure {
        transaction_id: TransactionId,
        code: String,
    },

    /// Endorsement was refused; one detail string per responding peer.
    #[error("endorsement of transaction {transaction_id} was refused")]
    EndorsementFailure {
        transaction_id: TransactionId,
        details: Vec<String>,
    },

    /// A per-call deadline expired. The remote side may still have committed,
    /// so this is never folded into `Network`.
    #[error("{phase} timeout expired")]
    Timeout { phase: TimeoutPhase },

    /// Transport-level failure before the transaction reached the backend.
    #[error("network error: {0}")]
    Network(String),

    /// The remote operation logic rejected the call.
    #[error(transparent)]
    Contract(#[from] ContractError),

    /// Anything else the backend surfaced, verbatim.
    #[error("{0}")]
    Other(String),
}

/// What the next attempt, if any, should do about transaction identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDirective {
    /// Terminal: duplicate submissions and contract rejections are never
    /// retried.
    NoRetry,

    /// Retry under the same transaction identity, so that a late commit of
    /// the original attempt is caught as a duplicate instead of applied
    /// twice.
    RetryKeepIdentity,

    /// Retry under a fresh transaction identity.
    RetryNewIdentity,
}

/// Checks whether an error was caused by a duplicate transaction.
///
/// Commit failures carry an explicit status code; endorsement failures only
/// expose per-peer detail strings, and one matching peer is enough.
pub fn is_duplicate_transaction_error(err: &GatewayError) -> bool {
    match err {
        GatewayError::CommitFailure { code, .. } => code == DUPLICATE_TXID_CODE,
        GatewayError::EndorsementFailure { details, .. } => details
            .iter()
            .any(|detail| detail.starts_with(DUPLICATE_ENDORSEMENT_DETAIL)),
        _ => false,
    }
}

/// Maps a gateway error to the retry directive for the next attempt.
///
/// Transactions are retriable unless they failed as duplicates or were
/// rejected by the contract; timeouts keep the in-flight identity because
/// the outcome is unknown, everything else mints a new one.
pub fn retry_directive(err: &GatewayError) -> RetryDirective {
    if is_duplicate_transaction_error(err) || matches!(err, GatewayError::Contract(_)) {
        RetryDirective::NoRetry
    } else if matches!(err, GatewayError::Timeout { .. }) {
        RetryDirective::RetryKeepIdentity
    } else {
        RetryDirective::RetryNewIdentity
    }
}

static RECORD_EXISTS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:[tT]he )?(?:[aA]sset|[rR]ecord) \w* already exists")
        .expect("record-exists pattern compiles")
});

static RECORD_NOT_FOUND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:[tT]he )?(?:[aA]sset|[rR]ecord) \w* does not exist")
        .expect("record-not-found pattern compiles")
});

static OPERATION_NOT_FOUND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"Failed to get transaction with id [^,]*, error (?:(?:Entry not found)|(?:no such transaction ID \[[^\]]*\])) in index",
    )
    .expect("operation-not-found pattern compiles")
});

/// Converts known business-error messages into typed [`ContractError`]s.
///
/// The remote operation layer reports no structured error codes, so matching
/// message text is the only option, and the wording differs between contract
/// implementation languages. An error matching none of the patterns is
/// returned unchanged; an error that is already a contract error is left
/// alone.
pub fn classify_contract_message(
    transaction_id: &TransactionId,
    err: GatewayError,
) -> GatewayError {
    if matches!(err, GatewayError::Contract(_)) {
        return err;
    }

    let message = err.to_string();
    let matched = RECORD_EXISTS_RE
        .find(&message)
        .map(|m| (ContractErrorKind::RecordExists, m))
        .or_else(|| {
            RECORD_NOT_FOUND_RE
                .find(&message)
                .map(|m| (ContractErrorKind::RecordNotFound, m))
        })
        .or_else(|| {
            OPERATION_NOT_FOUND_RE
                .find(&message)
                .map(|m| (ContractErrorKind::OperationNotFound, m))
        });

    match matched {
        Some((kind, found)) => {
            debug!(%transaction_id, kind = kind.type_name(), "matched contract error message");
            GatewayError::Contract(ContractError::new(
                kind,
                found.as_str(),
                transaction_id.clone(),
            ))
        }
        None => err,
    }
}
