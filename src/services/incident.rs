//! Per-track incident state machine
//!
//! Drives each track through Idle -> Suspected -> Confirmed -> Notified ->
//! Cooldown -> Idle based on classifier scores, dwell time, and schedule
//! validation. Confirmation is the only path that creates an incident
//! record; the dedup key makes that creation exactly-once per time bucket.
//!
//! Concurrency model: one async mutex per track cell, looked up through a
//! short-lived read lock on the cell map. Scoring tasks for different
//! tracks never contend; the schedule lookup is awaited with the cell lock
//! RELEASED and a single-outstanding-call flag set, so a slow store cannot
//! stall the track or pile up duplicate lookups.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::incident::{dedup_key, Incident, IncidentStatus};
use crate::domain::types::{TrackId, TrackState, WindowReady, Zone};
use crate::error::PipelineError;
use crate::infra::{Config, Metrics};
use crate::io::schedule::{Authorization, ScheduleValidator};
use crate::io::store::IncidentStore;

/// What the caller should do after a window has been absorbed
#[derive(Debug)]
pub enum MachineAction {
    /// Nothing to deliver
    None,
    /// A fresh incident was created; hand it to the dispatcher
    Dispatch(Incident),
}

#[derive(Debug)]
struct TrackCell {
    state: TrackState,
    /// Epoch ms of the window that raised the suspicion
    suspected_since: u64,
    /// Epoch ms of the earliest sample backing the suspicion
    first_detected_at: u64,
    cooldown_until: u64,
    /// True while a schedule lookup is awaited with the cell unlocked
    validation_inflight: bool,
    incident_id: Option<String>,
}

impl TrackCell {
    fn idle() -> Self {
        Self {
            state: TrackState::Idle,
            suspected_since: 0,
            first_detected_at: 0,
            cooldown_until: 0,
            validation_inflight: false,
            incident_id: None,
        }
    }

    fn reset(&mut self) {
        self.state = TrackState::Idle;
        self.suspected_since = 0;
        self.first_detected_at = 0;
        self.incident_id = None;
    }
}

pub struct IncidentMachine {
    threshold: f32,
    min_dwell_ms: u64,
    cooldown_ms: u64,
    dedup_bucket_ms: u64,
    cells: RwLock<FxHashMap<i64, Arc<Mutex<TrackCell>>>>,
    validator: ScheduleValidator,
    store: Arc<dyn IncidentStore>,
    metrics: Arc<Metrics>,
}

impl IncidentMachine {
    pub fn new(
        config: &Config,
        validator: ScheduleValidator,
        store: Arc<dyn IncidentStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            threshold: config.anomaly_threshold(),
            min_dwell_ms: config.min_dwell_ms(),
            cooldown_ms: config.cooldown_ms(),
            dedup_bucket_ms: config.dedup_bucket_ms(),
            cells: RwLock::new(FxHashMap::default()),
            validator,
            store,
            metrics,
        }
    }

    fn cell(&self, track_id: TrackId) -> Arc<Mutex<TrackCell>> {
        if let Some(cell) = self.cells.read().get(&track_id.0) {
            return cell.clone();
        }
        let mut cells = self.cells.write();
        cells.entry(track_id.0).or_insert_with(|| Arc::new(Mutex::new(TrackCell::idle()))).clone()
    }

    /// Absorb one scored window for its track
    pub async fn on_window_scored(
        &self,
        window: &WindowReady,
        score: f32,
    ) -> Result<MachineAction, PipelineError> {
        let cell = self.cell(window.track_id);
        let mut guard = cell.lock().await;

        // An expired cooldown ends at the next window, which is then
        // evaluated like any other idle-state window.
        if guard.state == TrackState::Cooldown && window.emitted_at >= guard.cooldown_until {
            info!(track_id = window.track_id.0, "cooldown_expired");
            guard.reset();
        }

        match guard.state {
            TrackState::Idle => {
                if self.is_anomalous(score, window.zone) {
                    guard.state = TrackState::Suspected;
                    guard.suspected_since = window.emitted_at;
                    guard.first_detected_at =
                        window.samples.first().map(|s| s.ts).unwrap_or(window.emitted_at);
                    self.metrics.record_suspicion_raised();
                    info!(
                        track_id = window.track_id.0,
                        score,
                        zone = window.zone.as_str(),
                        "track_suspected"
                    );
                }
                Ok(MachineAction::None)
            }
            TrackState::Suspected => {
                if !self.is_anomalous(score, window.zone) {
                    info!(track_id = window.track_id.0, score, "suspicion_cleared");
                    guard.reset();
                    return Ok(MachineAction::None);
                }
                let dwell_ms = window.emitted_at.saturating_sub(guard.suspected_since);
                if dwell_ms < self.min_dwell_ms {
                    debug!(track_id = window.track_id.0, dwell_ms, "dwell_pending");
                    return Ok(MachineAction::None);
                }
                self.try_confirm(&cell, guard, window).await
            }
            // Dispatch in flight or already notified; new windows are absorbed
            // silently until the cooldown brings the track back to idle.
            TrackState::Confirmed | TrackState::Notified | TrackState::Cooldown => {
                Ok(MachineAction::None)
            }
            TrackState::Lost => Ok(MachineAction::None),
        }
    }

    /// Dwell is satisfied: validate the schedule and confirm if unauthorized.
    /// Takes ownership of the cell guard so the lock can be released around
    /// the store call.
    async fn try_confirm(
        &self,
        cell: &Arc<Mutex<TrackCell>>,
        mut guard: tokio::sync::MutexGuard<'_, TrackCell>,
        window: &WindowReady,
    ) -> Result<MachineAction, PipelineError> {
        let Some(subject) = window.subject.clone() else {
            // No resolved identity yet. Treat like an Unknown verdict:
            // stay suspected and retry on a later window.
            self.metrics.record_validation_unknown();
            debug!(track_id = window.track_id.0, "validation_skipped_no_subject");
            return Ok(MachineAction::None);
        };

        if guard.validation_inflight {
            return Ok(MachineAction::None);
        }
        guard.validation_inflight = true;
        drop(guard);

        let verdict = self.validator.is_authorized(&subject, window.emitted_at).await;

        let mut guard = cell.lock().await;
        guard.validation_inflight = false;

        // The track may have been cleared or reset while the lookup ran
        if guard.state != TrackState::Suspected {
            return Ok(MachineAction::None);
        }

        match verdict {
            Authorization::Authorized => {
                info!(track_id = window.track_id.0, subject = %subject, "track_authorized");
                guard.reset();
                Ok(MachineAction::None)
            }
            Authorization::Unknown => {
                self.metrics.record_validation_unknown();
                Ok(MachineAction::None)
            }
            Authorization::Unauthorized => {
                let key = dedup_key(window.track_id, window.emitted_at, self.dedup_bucket_ms);
                let incident = Incident::new(
                    window.track_id,
                    subject,
                    guard.first_detected_at,
                    window.emitted_at,
                    window.zone,
                    key,
                );
                let (stored, inserted) = self.store.insert_incident_if_absent(incident).await?;
                self.metrics.record_incident_confirmed(!inserted);

                if inserted {
                    guard.state = TrackState::Confirmed;
                    guard.incident_id = Some(stored.incident_id.clone());
                    info!(
                        track_id = window.track_id.0,
                        incident_id = %stored.incident_id,
                        zone = window.zone.as_str(),
                        "incident_confirmed"
                    );
                    Ok(MachineAction::Dispatch(stored))
                } else if stored.status == IncidentStatus::Confirmed {
                    // Same bucket, but delivery was never accepted (dispatch
                    // failed after the insert). Pick the record back up; the
                    // dispatcher resumes off its write-ahead attempt rows.
                    guard.state = TrackState::Confirmed;
                    guard.incident_id = Some(stored.incident_id.clone());
                    info!(
                        track_id = window.track_id.0,
                        incident_id = %stored.incident_id,
                        "incident_dispatch_retried"
                    );
                    Ok(MachineAction::Dispatch(stored))
                } else {
                    // Same bucket, notifications already on their way.
                    // Go straight to cooldown off the existing incident.
                    guard.state = TrackState::Notified;
                    guard.cooldown_until = window.emitted_at + self.cooldown_ms;
                    guard.incident_id = Some(stored.incident_id.clone());
                    info!(
                        track_id = window.track_id.0,
                        incident_id = %stored.incident_id,
                        "incident_deduped"
                    );
                    Ok(MachineAction::None)
                }
            }
        }
    }

    /// Dispatch accepted the incident: record it and start the cooldown
    pub async fn mark_notified(
        &self,
        track_id: TrackId,
        incident_id: &str,
        now_ms: u64,
    ) -> Result<(), PipelineError> {
        self.store.set_incident_status(incident_id, IncidentStatus::Notified).await?;
        // The track may have been swept between dispatch acceptance and this
        // call; the store update above is all that is left to do then.
        let cell = self.cells.read().get(&track_id.0).cloned();
        if let Some(cell) = cell {
            let mut guard = cell.lock().await;
            guard.state = TrackState::Notified;
            guard.cooldown_until = now_ms + self.cooldown_ms;
        }
        info!(track_id = track_id.0, incident_id, "incident_notified");
        Ok(())
    }

    /// Advance time-driven transitions. Cells with a lookup in flight are
    /// skipped; the next tick catches them.
    pub fn tick(&self, now_ms: u64) {
        let cells: Vec<_> = self.cells.read().values().cloned().collect();
        for cell in cells {
            let Ok(mut guard) = cell.try_lock() else { continue };
            match guard.state {
                TrackState::Notified => {
                    guard.state = TrackState::Cooldown;
                }
                TrackState::Cooldown if now_ms >= guard.cooldown_until => {
                    guard.reset();
                }
                _ => {}
            }
        }
    }

    /// The aggregator evicted the track; drop its cell
    pub async fn mark_lost(&self, track_id: TrackId) {
        let cell = self.cells.write().remove(&track_id.0);
        if let Some(cell) = cell {
            let mut guard = cell.lock().await;
            guard.state = TrackState::Lost;
        }
    }

    /// Error isolation: a failed scoring or store call resets this track
    /// without touching any other
    pub async fn reset_track(&self, track_id: TrackId) {
        let cell = self.cell(track_id);
        let mut guard = cell.lock().await;
        warn!(track_id = track_id.0, state = guard.state.as_str(), "track_reset");
        guard.reset();
        guard.validation_inflight = false;
        self.metrics.record_track_error();
    }

    /// Current state of a track, if the machine has seen it
    pub async fn track_state(&self, track_id: TrackId) -> Option<TrackState> {
        let cell = self.cells.read().get(&track_id.0).cloned()?;
        let guard = cell.lock().await;
        Some(guard.state)
    }

    #[inline]
    fn is_anomalous(&self, score: f32, zone: Zone) -> bool {
        score >= self.threshold && zone == Zone::Unauthorized
    }
}
