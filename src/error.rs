//! Error taxonomy for the incident pipeline
//!
//! Transient failures are retried by the owning component and are never fatal
//! to the pipeline. Integrity violations are resolved by defined tie-breaks
//! (drop the sample, reuse the incident) and surface only in logs and
//! counters. Configuration problems are anyhow errors raised at startup,
//! never mid-stream.

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A dependency failed in a way that is expected to heal (schedule store
    /// timeout, channel send failure). Retried per component policy.
    #[error("transient dependency failure: {0}")]
    Transient(String),

    /// An internal record invariant was violated. The offending input is
    /// dropped or reconciled, never propagated to the caller.
    #[error("data integrity violation: {0}")]
    DataIntegrity(&'static str),
}

impl PipelineError {
    /// Whether a retry by the caller can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::Transient(_))
    }
}
