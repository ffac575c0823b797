//! Durable incident/attempt record store
//!
//! The persistence engine itself is external; the pipeline relies on two
//! idempotent primitives: insert-if-absent by dedup key, and status updates
//! keyed by (incident_id, channel). The in-memory implementation here backs
//! tests and the simulator; production hosts supply their own.

use crate::domain::incident::{
    AttemptStatus, ChannelKind, Incident, IncidentStatus, NotificationAttempt,
};
use crate::domain::types::SubjectId;
use crate::error::PipelineError;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::debug;

#[async_trait]
pub trait IncidentStore: Send + Sync {
    /// Insert the incident unless one with the same dedup key exists.
    /// Returns the stored record and whether it was freshly inserted.
    /// A losing race or an event replay reuses the existing record.
    async fn insert_incident_if_absent(
        &self,
        incident: Incident,
    ) -> Result<(Incident, bool), PipelineError>;

    async fn get_incident(&self, incident_id: &str) -> Result<Option<Incident>, PipelineError>;

    async fn set_incident_status(
        &self,
        incident_id: &str,
        status: IncidentStatus,
    ) -> Result<(), PipelineError>;

    /// Write-ahead attempt row for (incident, channel). If the row already
    /// exists it is returned unchanged - re-dispatch of a `Sent` row must be
    /// a no-op at the caller.
    async fn upsert_attempt(
        &self,
        incident_id: &str,
        channel: ChannelKind,
    ) -> Result<NotificationAttempt, PipelineError>;

    async fn set_attempt_status(
        &self,
        incident_id: &str,
        channel: ChannelKind,
        attempt_number: u32,
        status: AttemptStatus,
        next_retry_at: Option<u64>,
    ) -> Result<(), PipelineError>;

    async fn attempts_for(
        &self,
        incident_id: &str,
    ) -> Result<Vec<NotificationAttempt>, PipelineError>;

    /// Incidents confirmed strictly before the cutoff, for retention scans.
    async fn incidents_confirmed_before(
        &self,
        cutoff_ms: u64,
    ) -> Result<Vec<Incident>, PipelineError>;

    /// Rewrite the subject identifier and flip status to Anonymized.
    /// Returns false (no-op) if the record is already anonymized.
    async fn anonymize_subject(
        &self,
        incident_id: &str,
        pseudonym: SubjectId,
    ) -> Result<bool, PipelineError>;
}

#[derive(Default)]
struct StoreInner {
    incidents: Vec<Incident>,
    by_dedup: FxHashMap<String, usize>,
    by_id: FxHashMap<String, usize>,
    attempts: FxHashMap<(String, ChannelKind), NotificationAttempt>,
}

/// In-memory store guarded by a single mutex. Record-level transactionality
/// only - the pipeline never needs cross-incident transactions.
pub struct MemoryStore {
    inner: parking_lot::Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { inner: parking_lot::Mutex::new(StoreInner::default()) }
    }

    /// Total incident count, for tests and the simulator summary.
    pub fn incident_count(&self) -> usize {
        self.inner.lock().incidents.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IncidentStore for MemoryStore {
    async fn insert_incident_if_absent(
        &self,
        incident: Incident,
    ) -> Result<(Incident, bool), PipelineError> {
        let mut inner = self.inner.lock();
        if let Some(&idx) = inner.by_dedup.get(&incident.dedup_key) {
            debug!(dedup_key = %incident.dedup_key, "incident_insert_deduped");
            return Ok((inner.incidents[idx].clone(), false));
        }

        let idx = inner.incidents.len();
        inner.by_dedup.insert(incident.dedup_key.clone(), idx);
        inner.by_id.insert(incident.incident_id.clone(), idx);
        inner.incidents.push(incident.clone());
        Ok((incident, true))
    }

    async fn get_incident(&self, incident_id: &str) -> Result<Option<Incident>, PipelineError> {
        let inner = self.inner.lock();
        Ok(inner.by_id.get(incident_id).map(|&idx| inner.incidents[idx].clone()))
    }

    async fn set_incident_status(
        &self,
        incident_id: &str,
        status: IncidentStatus,
    ) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.by_id.get(incident_id) else {
            return Err(PipelineError::DataIntegrity("status update for unknown incident"));
        };
        inner.incidents[idx].status = status;
        Ok(())
    }

    async fn upsert_attempt(
        &self,
        incident_id: &str,
        channel: ChannelKind,
    ) -> Result<NotificationAttempt, PipelineError> {
        let mut inner = self.inner.lock();
        let key = (incident_id.to_string(), channel);
        let attempt = inner
            .attempts
            .entry(key)
            .or_insert_with(|| NotificationAttempt::pending(incident_id, channel));
        Ok(attempt.clone())
    }

    async fn set_attempt_status(
        &self,
        incident_id: &str,
        channel: ChannelKind,
        attempt_number: u32,
        status: AttemptStatus,
        next_retry_at: Option<u64>,
    ) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock();
        let key = (incident_id.to_string(), channel);
        let Some(attempt) = inner.attempts.get_mut(&key) else {
            return Err(PipelineError::DataIntegrity("attempt update before write-ahead row"));
        };
        attempt.attempt_number = attempt_number;
        attempt.status = status;
        attempt.next_retry_at = next_retry_at;
        Ok(())
    }

    async fn attempts_for(
        &self,
        incident_id: &str,
    ) -> Result<Vec<NotificationAttempt>, PipelineError> {
        let inner = self.inner.lock();
        Ok(inner
            .attempts
            .values()
            .filter(|a| a.incident_id == incident_id)
            .cloned()
            .collect())
    }

    async fn incidents_confirmed_before(
        &self,
        cutoff_ms: u64,
    ) -> Result<Vec<Incident>, PipelineError> {
        let inner = self.inner.lock();
        Ok(inner.incidents.iter().filter(|i| i.confirmed_at < cutoff_ms).cloned().collect())
    }

    async fn anonymize_subject(
        &self,
        incident_id: &str,
        pseudonym: SubjectId,
    ) -> Result<bool, PipelineError> {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.by_id.get(incident_id) else {
            return Err(PipelineError::DataIntegrity("anonymize for unknown incident"));
        };
        if inner.incidents[idx].status == IncidentStatus::Anonymized {
            return Ok(false);
        }
        inner.incidents[idx].subject_id = pseudonym;
        inner.incidents[idx].status = IncidentStatus::Anonymized;
        Ok(true)
    }
}
