//! Offline pipeline simulator
//!
//! Replays a synthetic corridor scene through the full pipeline: a staff
//! member crossing the hallway and an unscheduled subject loitering in a
//! restricted area. Detection and classification are replaced by
//! deterministic stand-ins; everything downstream (aggregation, the state
//! machine, validation, dispatch, anonymization) is the production code.

use clap::Parser;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

use campus_watch::domain::types::{epoch_ms, BoundingBox, Detection, SubjectId, Zone};
use campus_watch::error::PipelineError;
use campus_watch::infra::{Config, Metrics};
use campus_watch::io::{
    FrameDetector, FrameHandle, LogChannel, MemoryScheduleStore, MemoryStore, ScheduleValidator,
    ScheduleWindow, TemporalClassifier,
};
use campus_watch::services::{
    AnonymizationJob, Dispatcher, IncidentMachine, Pipeline,
};
use campus_watch::services::dispatcher::ChannelBinding;

/// Incident pipeline simulator
#[derive(Parser, Debug)]
#[command(name = "watch-sim", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Number of frames to replay
    #[arg(long, default_value_t = 200)]
    frames: u64,

    /// Simulated capture rate (frames per second of stream time)
    #[arg(long, default_value_t = 5)]
    fps: u64,

    /// Jitter seed, for reproducible runs
    #[arg(long, default_value_t = 7)]
    seed: u64,
}

/// Scripted scene detector. Positions are a function of the frame number
/// plus a little jitter, so tracks look like real detector output.
struct SceneDetector {
    rng: Mutex<StdRng>,
    frame_interval_ms: u64,
}

impl SceneDetector {
    fn new(seed: u64, frame_interval_ms: u64) -> Self {
        Self { rng: Mutex::new(StdRng::seed_from_u64(seed)), frame_interval_ms }
    }

    fn jitter(&self) -> f64 {
        self.rng.lock().gen_range(-0.003..0.003)
    }
}

#[async_trait]
impl FrameDetector for SceneDetector {
    async fn detect(&self, frame: &FrameHandle) -> Result<Vec<Detection>, PipelineError> {
        let t = frame.frame_no as f64 * self.frame_interval_ms as f64 / 1000.0;
        let mut detections = Vec::new();

        // Staff member walking the hallway, left to right over ~40s
        if t < 40.0 {
            let x = 0.05 + t / 40.0 * 0.9 + self.jitter();
            detections.push(Detection {
                bbox: BoundingBox { x1: x - 0.02, y1: 0.28, x2: x + 0.02, y2: 0.40 },
                confidence: 0.92,
                zone: Zone::Hallway,
                subject: Some(SubjectId("staff-17".into())),
            });
        }

        // Unscheduled subject entering the restricted area at t=6s and
        // loitering near the storage door
        if t >= 6.0 {
            let x = 0.70 + (t * 0.7).sin() * 0.01 + self.jitter();
            let y = 0.75 + (t * 0.5).cos() * 0.01 + self.jitter();
            detections.push(Detection {
                bbox: BoundingBox { x1: x - 0.02, y1: y - 0.06, x2: x + 0.02, y2: y + 0.06 },
                confidence: 0.88,
                zone: Zone::Unauthorized,
                subject: Some(SubjectId("student-42".into())),
            });
        }

        Ok(detections)
    }
}

/// Heuristic loiter scorer standing in for the sequence model: high score
/// for windows that barely move and sit in the restricted zone.
struct LoiterClassifier;

#[async_trait]
impl TemporalClassifier for LoiterClassifier {
    async fn score(&self, features: &[[f32; 4]]) -> Result<f32, PipelineError> {
        if features.len() < 2 {
            return Ok(0.0);
        }
        let restricted_code = Zone::Unauthorized.feature_code();
        let restricted =
            features.iter().filter(|f| f[3] == restricted_code).count() as f32 / features.len() as f32;

        let mut travel = 0.0f32;
        for pair in features.windows(2) {
            let dx = pair[1][0] - pair[0][0];
            let dy = pair[1][1] - pair[0][1];
            travel += (dx * dx + dy * dy).sqrt();
        }
        let mean_step = travel / (features.len() - 1) as f32;
        let stillness = (1.0 - mean_step / 0.02).clamp(0.0, 1.0);

        Ok(restricted * stillness)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!("watch-sim starting");

    let args = Args::parse();
    let config = if Path::new(&args.config).exists() {
        Config::from_file(&args.config)?
    } else {
        info!(config_file = %args.config, "config_file_missing_using_defaults");
        Config::default()
    };
    info!(
        config_file = %config.config_file(),
        site_id = %config.site_id(),
        anomaly_threshold = %config.anomaly_threshold(),
        min_dwell_ms = %config.min_dwell_ms(),
        cooldown_ms = %config.cooldown_ms(),
        max_attempts = %config.max_attempts(),
        scoring_workers = %config.scoring_workers(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(MemoryStore::new());

    // The staff member is scheduled everywhere for the whole run; the
    // loiterer is not on any schedule
    let base_ts = epoch_ms();
    let schedule = Arc::new(MemoryScheduleStore::new());
    schedule.add_window(ScheduleWindow {
        subject_id: SubjectId("staff-17".into()),
        start_ms: base_ts,
        end_ms: base_ts + 24 * 3600 * 1000,
        authorized_zone: Zone::Hallway,
    });

    let validator = ScheduleValidator::new(schedule, config.lookup_timeout());
    let machine = Arc::new(IncidentMachine::new(
        &config,
        validator,
        store.clone(),
        metrics.clone(),
    ));

    let bindings: Vec<ChannelBinding> = config
        .channels()
        .iter()
        .map(|route| ChannelBinding {
            channel: Arc::new(LogChannel::new(route.kind)),
            recipient: route.recipient.clone(),
        })
        .collect();
    let dispatcher = Arc::new(Dispatcher::new(&config, bindings, store.clone(), metrics.clone()));

    let anonymizer = AnonymizationJob::new(&config, store.clone(), metrics.clone());
    let anonymizer_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        anonymizer.run(anonymizer_shutdown).await;
    });

    let frame_interval_ms = 1000 / args.fps.max(1);
    let detector = Arc::new(SceneDetector::new(args.seed, frame_interval_ms));
    let pipeline = Pipeline::new(
        &config,
        detector,
        Arc::new(LoiterClassifier),
        machine,
        dispatcher,
        metrics.clone(),
    );

    let (frame_tx, frame_rx) = mpsc::channel(256);
    let frame_count = args.frames;
    tokio::spawn(async move {
        for frame_no in 0..frame_count {
            let ts = base_ts + frame_no * frame_interval_ms;
            let frame = FrameHandle::new(frame_no, ts)
                .with_evidence(&format!("frame/{frame_no}.jpg"));
            if frame_tx.send(frame).await.is_err() {
                return;
            }
        }
        info!(frames = frame_count, "frame_feed_complete");
    });

    let shutdown_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    pipeline.run(frame_rx, shutdown_rx).await;
    let _ = shutdown_tx.send(true);

    info!(
        incidents = store.incident_count(),
        confirmed = metrics.incidents_confirmed_total(),
        exhausted = metrics.notifications_exhausted_total(),
        "watch-sim complete"
    );
    Ok(())
}
