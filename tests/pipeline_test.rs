//! End-to-end pipeline tests
//!
//! Drive the full chain with scripted collaborators: detector output ->
//! track aggregation -> scoring -> dwell/validation -> incident ->
//! multi-channel dispatch -> anonymization. Only the external model,
//! schedule store and providers are stand-ins.

use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, watch};

use campus_watch::domain::incident::{AttemptStatus, ChannelKind, IncidentStatus, IncidentSummary};
use campus_watch::domain::types::{BoundingBox, Detection, SubjectId, Zone};
use campus_watch::error::PipelineError;
use campus_watch::infra::{Config, Metrics};
use campus_watch::io::{
    Ack, FrameDetector, FrameHandle, IncidentStore, LogChannel, MemoryScheduleStore, MemoryStore,
    NotificationChannel, ScheduleValidator, ScheduleWindow, TemporalClassifier,
};
use campus_watch::services::dispatcher::ChannelBinding;
use campus_watch::services::{AnonymizationJob, Dispatcher, IncidentMachine, Pipeline};

fn test_config() -> Config {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file
        .write_all(
            br#"
[site]
id = "test-campus"

[aggregator]
window_ready_interval_ms = 500

[incident]
min_dwell_ms = 2000
cooldown_ms = 60000

[dispatcher]
max_attempts = 3
backoff_base_ms = 10
backoff_cap_ms = 50
send_timeout_ms = 500
channels = [
    { kind = "sms", recipient = "+15550001111" },
    { kind = "email", recipient = "security@test.example" },
]
"#,
        )
        .unwrap();
    temp_file.flush().unwrap();
    Config::from_file(temp_file.path()).unwrap()
}

/// Detector replaying one subject drifting through the restricted zone
struct LoiterScene {
    subject: Option<SubjectId>,
}

#[async_trait]
impl FrameDetector for LoiterScene {
    async fn detect(&self, frame: &FrameHandle) -> Result<Vec<Detection>, PipelineError> {
        let y = 0.6 + frame.frame_no as f64 * 0.004;
        Ok(vec![Detection {
            bbox: BoundingBox { x1: 0.48, y1: y, x2: 0.52, y2: y + 0.1 },
            confidence: 0.9,
            zone: Zone::Unauthorized,
            subject: self.subject.clone(),
        }])
    }
}

struct FixedScore(f32);

#[async_trait]
impl TemporalClassifier for FixedScore {
    async fn score(&self, _: &[[f32; 4]]) -> Result<f32, PipelineError> {
        Ok(self.0)
    }
}

/// Channel whose provider is down for good
struct DeadChannel {
    kind: ChannelKind,
    sends: AtomicU32,
}

#[async_trait]
impl NotificationChannel for DeadChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, _: &str, _: &IncidentSummary) -> Result<Ack, PipelineError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        Err(PipelineError::Transient("provider unreachable".into()))
    }
}

struct Rig {
    store: Arc<MemoryStore>,
    schedule: Arc<MemoryScheduleStore>,
    config: Config,
    pipeline: Pipeline,
    dead_sms: Arc<DeadChannel>,
}

fn rig(subject: Option<SubjectId>, score: f32, schedule_windows: Vec<ScheduleWindow>) -> Rig {
    let config = test_config();
    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(MemoryStore::new());

    let schedule = Arc::new(MemoryScheduleStore::new());
    for window in schedule_windows {
        schedule.add_window(window);
    }

    let validator = ScheduleValidator::new(schedule.clone(), config.lookup_timeout());
    let machine =
        Arc::new(IncidentMachine::new(&config, validator, store.clone(), metrics.clone()));

    let dead_sms =
        Arc::new(DeadChannel { kind: ChannelKind::Sms, sends: AtomicU32::new(0) });
    let bindings = vec![
        ChannelBinding { channel: dead_sms.clone(), recipient: "+15550001111".into() },
        ChannelBinding {
            channel: Arc::new(LogChannel::new(ChannelKind::Email)),
            recipient: "security@test.example".into(),
        },
    ];
    let dispatcher = Arc::new(Dispatcher::new(&config, bindings, store.clone(), metrics.clone()));

    let pipeline = Pipeline::new(
        &config,
        Arc::new(LoiterScene { subject }),
        Arc::new(FixedScore(score)),
        machine,
        dispatcher,
        metrics,
    );

    Rig { store, schedule, config, pipeline, dead_sms }
}

async fn feed(pipeline: Pipeline, frames: u64) {
    let (tx, rx) = mpsc::channel(64);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    for frame_no in 0..frames {
        tx.send(FrameHandle::new(frame_no, 1000 + frame_no * 1000)).await.unwrap();
    }
    drop(tx);
    tokio::time::timeout(Duration::from_secs(10), pipeline.run(rx, shutdown_rx))
        .await
        .expect("pipeline did not settle");
}

#[tokio::test]
async fn test_loiterer_confirmed_notified_and_partially_exhausted() {
    let r = rig(Some(SubjectId("student-3".into())), 0.85, Vec::new());
    feed(r.pipeline, 14).await;

    assert_eq!(r.store.incident_count(), 1);
    let incident = &r.store.incidents_confirmed_before(u64::MAX).await.unwrap()[0];
    assert_eq!(incident.subject_id, SubjectId("student-3".into()));
    assert_eq!(incident.zone, Zone::Unauthorized);
    assert_eq!(incident.status, IncidentStatus::Notified);
    // Dwell: confirmation strictly after the first suspicious window
    assert!(incident.confirmed_at >= incident.first_detected_at + r.config.min_dwell_ms());

    let attempts = r.store.attempts_for(&incident.incident_id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    let sms = attempts.iter().find(|a| a.channel == ChannelKind::Sms).unwrap();
    let email = attempts.iter().find(|a| a.channel == ChannelKind::Email).unwrap();
    // Dead provider burned all its attempts and was flagged for operators
    assert_eq!(sms.status, AttemptStatus::Exhausted);
    assert_eq!(r.dead_sms.sends.load(Ordering::SeqCst), 3);
    // The healthy channel delivered regardless
    assert_eq!(email.status, AttemptStatus::Sent);
}

#[tokio::test]
async fn test_scheduled_subject_raises_no_incident() {
    let window = ScheduleWindow {
        subject_id: SubjectId("staff-8".into()),
        start_ms: 0,
        end_ms: u64::MAX,
        authorized_zone: Zone::Unauthorized,
    };
    let r = rig(Some(SubjectId("staff-8".into())), 0.85, vec![window]);
    feed(r.pipeline, 14).await;

    assert_eq!(r.store.incident_count(), 0);
    assert_eq!(r.dead_sms.sends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_low_score_raises_no_incident() {
    let r = rig(Some(SubjectId("student-3".into())), 0.3, Vec::new());
    feed(r.pipeline, 14).await;
    assert_eq!(r.store.incident_count(), 0);
}

#[tokio::test]
async fn test_unidentified_subject_raises_no_incident() {
    let r = rig(None, 0.85, Vec::new());
    feed(r.pipeline, 14).await;
    assert_eq!(r.store.incident_count(), 0);
}

#[tokio::test]
async fn test_schedule_added_mid_stream_is_respected() {
    // The validator consults the store per confirmation attempt, so a
    // schedule change takes effect without restarting anything
    let r = rig(Some(SubjectId("student-3".into())), 0.85, Vec::new());
    r.schedule.add_window(ScheduleWindow {
        subject_id: SubjectId("student-3".into()),
        start_ms: 0,
        end_ms: u64::MAX,
        authorized_zone: Zone::Unauthorized,
    });
    feed(r.pipeline, 14).await;
    assert_eq!(r.store.incident_count(), 0);
}

#[tokio::test]
async fn test_retention_anonymizes_notified_incident() {
    let r = rig(Some(SubjectId("student-3".into())), 0.85, Vec::new());
    let store = r.store.clone();
    let config = test_config();
    feed(r.pipeline, 14).await;

    let incident = store.incidents_confirmed_before(u64::MAX).await.unwrap()[0].clone();
    let metrics = Arc::new(Metrics::new());
    let job = AnonymizationJob::new(&config, store.clone(), metrics);

    // Before the horizon: untouched
    assert_eq!(job.run_once(incident.confirmed_at + 1000).await.unwrap(), 0);

    // Past the horizon: pseudonymized exactly once
    let later = incident.confirmed_at + config.retention_ms() + 1000;
    assert_eq!(job.run_once(later).await.unwrap(), 1);
    assert_eq!(job.run_once(later).await.unwrap(), 0);

    let stored = store.get_incident(&incident.incident_id).await.unwrap().unwrap();
    assert_eq!(stored.status, IncidentStatus::Anonymized);
    assert!(stored.subject_id.0.starts_with("anon-"));
    assert!(!stored.subject_id.0.contains("student"));
}
