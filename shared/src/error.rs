//! Agent error taxonomy
//!
//! Connectivity errors are recovered internally by reconnection; task- and
//! job-level errors are surfaced upstream as terminal results.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    /// Handshake or transport failure. Recovered by reconnection.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Action denied by the allowlist/blocklist. Reported, never retried.
    #[error("Policy violation: action '{0}' is not permitted")]
    PolicyViolation(String),

    /// Task or network deadline exceeded.
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Action ran but failed.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Downloaded image checksum does not match the manifest. Fatal to the job.
    #[error("Checksum mismatch: expected {expected}, computed {computed}")]
    ChecksumMismatch { expected: String, computed: String },

    /// Flashing the image failed. Fatal to the job.
    #[error("Flash failed: {0}")]
    Flash(String),

    /// Referenced an unknown task or job id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A second update was requested while one is active.
    #[error("Update in progress")]
    UpdateInProgress,
}

impl AgentError {
    /// Short machine-readable code for error reports sent upstream
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Connectivity(_) => "connectivity",
            AgentError::PolicyViolation(_) => "policy_violation",
            AgentError::Timeout(_) => "timeout",
            AgentError::Execution(_) => "execution",
            AgentError::ChecksumMismatch { .. } => "checksum_mismatch",
            AgentError::Flash(_) => "flash",
            AgentError::NotFound(_) => "not_found",
            AgentError::UpdateInProgress => "update_in_progress",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = AgentError::ChecksumMismatch {
            expected: "abc123".into(),
            computed: "xyz789".into(),
        };
        assert_eq!(err.code(), "checksum_mismatch");
        assert!(err.to_string().contains("abc123"));
        assert!(err.to_string().contains("xyz789"));
    }

    #[test]
    fn test_update_in_progress_display() {
        assert_eq!(AgentError::UpdateInProgress.to_string(), "Update in progress");
    }
}
