//! Retention-driven anonymization
//!
//! Periodically rewrites the subject identifier on incidents older than the
//! retention horizon with a salted hash. The rewrite is deterministic, so
//! re-running the job (or racing two instances) converges on the same
//! pseudonym, and the store refuses the no-op second write.
//!
//! Only settled incidents are touched: a record still carrying live
//! delivery attempts keeps its subject until the dispatcher is done with it.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::domain::incident::IncidentStatus;
use crate::domain::types::{epoch_ms, SubjectId};
use crate::error::PipelineError;
use crate::infra::{Config, Metrics};
use crate::io::store::IncidentStore;

/// Salted, deterministic pseudonym for a subject identifier
pub fn pseudonym(salt: &str, subject: &SubjectId) -> SubjectId {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(subject.0.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(2 + 32);
    for byte in &digest[..16] {
        hex.push_str(&format!("{byte:02x}"));
    }
    SubjectId(format!("anon-{hex}"))
}

pub struct AnonymizationJob {
    store: Arc<dyn IncidentStore>,
    metrics: Arc<Metrics>,
    retention_ms: u64,
    interval: std::time::Duration,
    salt: String,
}

impl AnonymizationJob {
    pub fn new(config: &Config, store: Arc<dyn IncidentStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            metrics,
            retention_ms: config.retention_ms(),
            interval: config.anonymizer_interval(),
            salt: config.pseudonym_salt().to_string(),
        }
    }

    /// Periodic loop; runs until shutdown flips
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(epoch_ms()).await {
                        warn!(error = %e, "anonymization_pass_failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// One retention pass. Returns the number of records anonymized.
    pub async fn run_once(&self, now_ms: u64) -> Result<usize, PipelineError> {
        let cutoff = now_ms.saturating_sub(self.retention_ms);
        let expired = self.store.incidents_confirmed_before(cutoff).await?;

        let mut anonymized = 0;
        for incident in expired {
            if incident.status != IncidentStatus::Notified {
                continue;
            }
            let attempts = self.store.attempts_for(&incident.incident_id).await?;
            if attempts.is_empty() || attempts.iter().any(|a| !a.status.is_terminal()) {
                // Delivery not settled; pick it up on a later pass
                continue;
            }

            let pseudonym = pseudonym(&self.salt, &incident.subject_id);
            if self.store.anonymize_subject(&incident.incident_id, pseudonym).await? {
                self.metrics.record_incident_anonymized();
                anonymized += 1;
            }
        }

        if anonymized > 0 {
            info!(anonymized, cutoff_ms = cutoff, "anonymization_pass");
        }
        Ok(anonymized)
    }
}
