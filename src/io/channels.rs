//! Notification channel send interface
//!
//! Provider protocol details (Twilio, SendGrid, FCM and friends) live behind
//! this trait. The dispatcher only ever calls `send` through its retry
//! wrapper; implementations must not retry internally.

use crate::domain::incident::{ChannelKind, IncidentSummary};
use crate::error::PipelineError;
use async_trait::async_trait;
use tracing::info;

/// Provider acknowledgement for one send
#[derive(Debug, Clone)]
pub struct Ack {
    /// Provider-side message reference, if any
    pub provider_ref: Option<String>,
}

impl Ack {
    pub fn new() -> Self {
        Self { provider_ref: None }
    }

    pub fn with_ref(provider_ref: &str) -> Self {
        Self { provider_ref: Some(provider_ref.to_string()) }
    }
}

impl Default for Ack {
    fn default() -> Self {
        Self::new()
    }
}

/// One notification transport (SMS, email, push).
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Fire one send. A `Transient` error makes the dispatcher retry with
    /// backoff; any success is final for this attempt record.
    async fn send(
        &self,
        recipient: &str,
        summary: &IncidentSummary,
    ) -> Result<Ack, PipelineError>;
}

/// Channel stub that acks every send and logs the payload.
/// Used by the simulator in place of live provider credentials.
pub struct LogChannel {
    kind: ChannelKind,
}

impl LogChannel {
    pub fn new(kind: ChannelKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(
        &self,
        recipient: &str,
        summary: &IncidentSummary,
    ) -> Result<Ack, PipelineError> {
        let payload = serde_json::to_string(summary)
            .map_err(|e| PipelineError::Transient(format!("payload encoding: {e}")))?;
        info!(
            channel = %self.kind,
            recipient = %recipient,
            payload = %payload,
            "channel_send_logged"
        );
        Ok(Ack::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_channel_acks() {
        let channel = LogChannel::new(ChannelKind::Email);
        let summary = IncidentSummary {
            incident_id: "inc-1".into(),
            subject_id: "s-1".into(),
            zone: "unauthorized",
            first_detected_at: 1000,
            confirmed_at: 7000,
            evidence_ref: None,
        };

        let ack = channel.send("hod@school.example", &summary).await.unwrap();
        assert!(ack.provider_ref.is_none());
        assert_eq!(channel.kind(), ChannelKind::Email);
    }
}
