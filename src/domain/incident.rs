//! Incident record and notification attempt model

use crate::domain::types::{SubjectId, TrackId, Zone};
use serde::Serialize;
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Incident status - the only mutable part of an incident after creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    /// Created, dispatch not yet accepted
    Confirmed,
    /// Accepted into the durable attempt log on at least one channel
    Notified,
    /// Subject identifier rewritten by the retention job
    Anonymized,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Confirmed => "confirmed",
            IncidentStatus::Notified => "notified",
            IncidentStatus::Anonymized => "anonymized",
        }
    }
}

/// Deterministic deduplication key.
///
/// Re-processing a window for the same track within the same time bucket
/// yields the same key, so at-least-once delivery of scoring events can
/// never create a second incident for one real-world event.
pub fn dedup_key(track_id: TrackId, ts_ms: u64, bucket_ms: u64) -> String {
    let bucket = if bucket_ms == 0 { ts_ms } else { ts_ms / bucket_ms };
    format!("t{}:b{}", track_id.0, bucket)
}

/// A confirmed anomaly. Created exactly once per dedup key.
#[derive(Debug, Clone)]
pub struct Incident {
    pub incident_id: String,
    pub track_id: TrackId,
    pub subject_id: SubjectId,
    /// Epoch ms of the first sample that started the suspicion
    pub first_detected_at: u64,
    /// Epoch ms of the Suspected -> Confirmed transition
    pub confirmed_at: u64,
    pub zone: Zone,
    /// Opaque snapshot handle (frame capture reference)
    pub evidence_ref: Option<String>,
    pub dedup_key: String,
    pub status: IncidentStatus,
}

impl Incident {
    pub fn new(
        track_id: TrackId,
        subject_id: SubjectId,
        first_detected_at: u64,
        confirmed_at: u64,
        zone: Zone,
        dedup_key: String,
    ) -> Self {
        Self {
            incident_id: new_uuid_v7(),
            track_id,
            subject_id,
            first_detected_at,
            confirmed_at,
            zone,
            evidence_ref: None,
            dedup_key,
            status: IncidentStatus::Confirmed,
        }
    }

    pub fn with_evidence(mut self, evidence_ref: &str) -> Self {
        self.evidence_ref = Some(evidence_ref.to_string());
        self
    }
}

/// Notification channel identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Sms,
    Email,
    Push,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Sms => "sms",
            ChannelKind::Email => "email",
            ChannelKind::Push => "push",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status of one (incident, channel) attempt record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Pending,
    Sent,
    Failed,
    Exhausted,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Sent => "sent",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Exhausted => "exhausted",
        }
    }

    /// Terminal states - no further sends will happen for this record.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptStatus::Sent | AttemptStatus::Exhausted)
    }
}

/// Durable per-channel delivery record.
/// One row per (incident, channel); attempt_number counts sends over time.
#[derive(Debug, Clone)]
pub struct NotificationAttempt {
    pub incident_id: String,
    pub channel: ChannelKind,
    pub attempt_number: u32,
    pub status: AttemptStatus,
    /// Epoch ms of the next scheduled retry, when status is Failed
    pub next_retry_at: Option<u64>,
}

impl NotificationAttempt {
    pub fn pending(incident_id: &str, channel: ChannelKind) -> Self {
        Self {
            incident_id: incident_id.to_string(),
            channel,
            attempt_number: 0,
            status: AttemptStatus::Pending,
            next_retry_at: None,
        }
    }
}

/// Payload handed to notification channels
#[derive(Debug, Clone, Serialize)]
pub struct IncidentSummary {
    pub incident_id: String,
    pub subject_id: String,
    pub zone: &'static str,
    pub first_detected_at: u64,
    pub confirmed_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evidence_ref: Option<String>,
}

impl From<&Incident> for IncidentSummary {
    fn from(incident: &Incident) -> Self {
        Self {
            incident_id: incident.incident_id.clone(),
            subject_id: incident.subject_id.0.clone(),
            zone: incident.zone.as_str(),
            first_detected_at: incident.first_detected_at,
            confirmed_at: incident.confirmed_at,
            evidence_ref: incident.evidence_ref.clone(),
        }
    }
}
