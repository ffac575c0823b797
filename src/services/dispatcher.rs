//! Multi-channel notification dispatch
//!
//! Every (incident, channel) pair gets a durable attempt row BEFORE the
//! first send, so a crash between accept and send leaves a Pending row an
//! operator can reconcile instead of a silently lost notification.
//!
//! Sends run concurrently per channel with exponential backoff between
//! retries. A channel that exhausts its attempts is marked Exhausted and
//! raised as an operator alert; it never blocks the other channels.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::domain::incident::{AttemptStatus, ChannelKind, Incident, IncidentSummary};
use crate::domain::types::epoch_ms;
use crate::error::PipelineError;
use crate::infra::{Config, Metrics};
use crate::io::channels::NotificationChannel;
use crate::io::store::IncidentStore;

/// Delay before retry `attempt` (1-based): base * 2^(attempt-1), capped
pub(crate) fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// A notification channel bound to its configured recipient
pub struct ChannelBinding {
    pub channel: Arc<dyn NotificationChannel>,
    pub recipient: String,
}

pub struct Dispatcher {
    bindings: Vec<ChannelBinding>,
    store: Arc<dyn IncidentStore>,
    metrics: Arc<Metrics>,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    send_timeout: Duration,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        bindings: Vec<ChannelBinding>,
        store: Arc<dyn IncidentStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            bindings,
            store,
            metrics,
            max_attempts: config.max_attempts(),
            backoff_base: config.backoff_base(),
            backoff_cap: config.backoff_cap(),
            send_timeout: config.send_timeout(),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    /// Accept an incident for delivery on every bound channel.
    ///
    /// Writes the attempt rows first, then spawns one delivery task per
    /// channel. Returns the number of channels accepted; channels whose
    /// rows are already terminal (a replayed incident) are skipped.
    pub async fn dispatch(self: &Arc<Self>, incident: &Incident) -> Result<usize, PipelineError> {
        let summary = IncidentSummary::from(incident);
        let mut accepted = 0;

        for (idx, binding) in self.bindings.iter().enumerate() {
            let kind = binding.channel.kind();
            let row = self.store.upsert_attempt(&incident.incident_id, kind).await?;
            if row.status.is_terminal() {
                info!(
                    incident_id = %incident.incident_id,
                    channel = kind.as_str(),
                    status = row.status.as_str(),
                    "dispatch_channel_already_settled"
                );
                continue;
            }

            let this = self.clone();
            let summary = summary.clone();
            let incident_id = incident.incident_id.clone();
            self.tasks.lock().await.spawn(async move {
                this.send_with_retry(idx, kind, incident_id, summary, row.attempt_number).await;
            });
            accepted += 1;
        }

        Ok(accepted)
    }

    /// Wait for all in-flight delivery tasks to settle. Called on shutdown.
    pub async fn drain(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "dispatch_task_panicked");
            }
        }
    }

    async fn send_with_retry(
        self: Arc<Self>,
        binding_idx: usize,
        kind: ChannelKind,
        incident_id: String,
        summary: IncidentSummary,
        attempts_so_far: u32,
    ) {
        let binding = &self.bindings[binding_idx];

        for attempt in (attempts_so_far + 1)..=self.max_attempts {
            if let Err(e) = self
                .store
                .set_attempt_status(&incident_id, kind, attempt, AttemptStatus::Pending, None)
                .await
            {
                warn!(incident_id = %incident_id, channel = kind.as_str(), error = %e, "attempt_write_failed");
                return;
            }

            let outcome = timeout(
                self.send_timeout,
                binding.channel.send(&binding.recipient, &summary),
            )
            .await;

            match outcome {
                Ok(Ok(ack)) => {
                    self.metrics.record_notification_sent();
                    info!(
                        incident_id = %incident_id,
                        channel = kind.as_str(),
                        attempt,
                        provider_ref = ack.provider_ref.as_deref().unwrap_or("-"),
                        "notification_sent"
                    );
                    if let Err(e) = self
                        .store
                        .set_attempt_status(&incident_id, kind, attempt, AttemptStatus::Sent, None)
                        .await
                    {
                        warn!(incident_id = %incident_id, error = %e, "attempt_write_failed");
                    }
                    return;
                }
                Ok(Err(e)) => {
                    self.metrics.record_notification_failed();
                    warn!(
                        incident_id = %incident_id,
                        channel = kind.as_str(),
                        attempt,
                        error = %e,
                        "notification_send_failed"
                    );
                }
                Err(_) => {
                    self.metrics.record_notification_failed();
                    warn!(
                        incident_id = %incident_id,
                        channel = kind.as_str(),
                        attempt,
                        timeout_ms = %self.send_timeout.as_millis(),
                        "notification_send_timeout"
                    );
                }
            }

            if attempt == self.max_attempts {
                break;
            }

            let delay = backoff_delay(self.backoff_base, attempt, self.backoff_cap);
            let next_retry_at = epoch_ms() + delay.as_millis() as u64;
            if let Err(e) = self
                .store
                .set_attempt_status(
                    &incident_id,
                    kind,
                    attempt,
                    AttemptStatus::Failed,
                    Some(next_retry_at),
                )
                .await
            {
                warn!(incident_id = %incident_id, error = %e, "attempt_write_failed");
                return;
            }
            tokio::time::sleep(delay).await;
        }

        // Out of attempts: settle the row and raise the operator alert
        self.metrics.record_notification_exhausted();
        error!(
            incident_id = %incident_id,
            channel = kind.as_str(),
            attempts = self.max_attempts,
            "notification_exhausted"
        );
        if let Err(e) = self
            .store
            .set_attempt_status(
                &incident_id,
                kind,
                self.max_attempts,
                AttemptStatus::Exhausted,
                None,
            )
            .await
        {
            warn!(incident_id = %incident_id, error = %e, "attempt_write_failed");
        }
    }
}
