//! Error taxonomy shared across ingress, workers, and runners.
//!
//! Display strings lead with the kind name: clients match on it, and a
//! job's terminal `error` field carries it verbatim.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    /// Missing or invalid request fields, malformed base64, wrong WASM
    /// magic at ingress. Rejected before a job exists.
    #[error("BadInput: {0}")]
    BadInput(String),

    #[error("Unauthorized")]
    Unauthorized,

    /// Ownership mismatch.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Per-tier periodic limit reached.
    #[error("QuotaExceeded: {current}/{limit}")]
    QuotaExceeded { current: i64, limit: i64 },

    #[error("NotFound: {0}")]
    NotFound(String),

    /// Required CLI not on PATH.
    #[error("ToolchainMissing: {0}")]
    ToolchainMissing(String),

    /// Toolchain exited nonzero; carries the stderr summary.
    #[error("CompilerFailed: {0}")]
    CompilerFailed(String),

    #[error("CompilerDidNotProduceArtifact: no .wasm found in build output")]
    CompilerDidNotProduceArtifact,

    /// WASM validation rejected the bytes before deploy.
    #[error("InvalidWasm: {0}")]
    InvalidWasm(String),

    /// Deploy CLI output had no recognizable contract identifier.
    #[error("ContractIdNotFound: deploy output had no contract id")]
    ContractIdNotFound,

    /// Subprocess could not be started.
    #[error("SpawnError: {0}")]
    SpawnError(String),

    /// A second job claimed an existing broker handle.
    #[error("Duplicate: broker handle {0} already exists")]
    Duplicate(String),

    /// Broker, store, or bus unavailable. Retryable.
    #[error("Transient: {0}")]
    Transient(String),
}

impl JobError {
    /// Transient errors surface as 5xx at ingress and as broker retries
    /// on workers; everything else is recorded terminally.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Transient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_leads_with_kind() {
        assert!(JobError::InvalidWasm("bad magic".into())
            .to_string()
            .starts_with("InvalidWasm"));
        assert!(JobError::QuotaExceeded {
            current: 5,
            limit: 5
        }
        .to_string()
        .contains("5/5"));
        assert!(JobError::ContractIdNotFound
            .to_string()
            .starts_with("ContractIdNotFound"));
    }

    #[test]
    fn only_transient_is_transient() {
        assert!(JobError::Transient("broker down".into()).is_transient());
        assert!(!JobError::ToolchainMissing("cargo".into()).is_transient());
    }
}
