//! Frame processing loop
//!
//! Owns the track aggregator and wires the stages together: frames come in
//! over a channel, detections flow through aggregation, and emitted windows
//! are scored on a bounded pool of spawned tasks. Scoring and delivery
//! never run on the frame path, so a slow classifier or provider degrades
//! alerting latency, not ingestion.
//!
//! Error isolation: a failed scoring task resets its own track and nothing
//! else; a failed frame detection drops that frame only.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::domain::types::{TrackUpdate, WindowReady};
use crate::error::PipelineError;
use crate::infra::{Config, Metrics};
use crate::io::classifier::{encode_window, TemporalClassifier};
use crate::io::detector::{FrameDetector, FrameHandle};
use crate::services::aggregator::TrackAggregator;
use crate::services::dispatcher::Dispatcher;
use crate::services::incident::{IncidentMachine, MachineAction};

pub struct Pipeline {
    aggregator: TrackAggregator,
    detector: Arc<dyn FrameDetector>,
    classifier: Arc<dyn TemporalClassifier>,
    machine: Arc<IncidentMachine>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
    scoring_permits: Arc<Semaphore>,
    scoring_tasks: JoinSet<()>,
    metrics_interval: Duration,
    /// Newest frame timestamp seen; the pipeline's clock for evictions and
    /// cooldowns, so replayed footage behaves like live footage
    last_frame_ts: u64,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        detector: Arc<dyn FrameDetector>,
        classifier: Arc<dyn TemporalClassifier>,
        machine: Arc<IncidentMachine>,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            aggregator: TrackAggregator::new(config, metrics.clone()),
            detector,
            classifier,
            machine,
            dispatcher,
            metrics,
            scoring_permits: Arc::new(Semaphore::new(config.scoring_workers())),
            scoring_tasks: JoinSet::new(),
            metrics_interval: Duration::from_secs(config.metrics_interval_secs()),
            last_frame_ts: 0,
        }
    }

    /// Main loop. Runs until the frame source closes or shutdown is
    /// signalled, then settles in-flight scoring and delivery.
    pub async fn run(
        mut self,
        mut frame_rx: mpsc::Receiver<FrameHandle>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut sweep = tokio::time::interval(Duration::from_secs(1));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let start = tokio::time::Instant::now() + self.metrics_interval;
        let mut report = tokio::time::interval_at(start, self.metrics_interval);
        report.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("pipeline_started");
        loop {
            tokio::select! {
                maybe_frame = frame_rx.recv() => {
                    match maybe_frame {
                        Some(frame) => self.process_frame(frame).await,
                        None => {
                            info!("frame_source_closed");
                            break;
                        }
                    }
                }
                _ = sweep.tick() => {
                    let now = self.last_frame_ts;
                    self.sweep(now).await;
                }
                _ = report.tick() => {
                    self.metrics.report(self.aggregator.active_tracks()).log();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("pipeline_shutdown");
                        break;
                    }
                }
            }
        }

        while let Some(result) = self.scoring_tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "scoring_task_panicked");
            }
        }
        self.dispatcher.drain().await;
        self.metrics.report(self.aggregator.active_tracks()).log();
        info!("pipeline_stopped");
    }

    async fn process_frame(&mut self, frame: FrameHandle) {
        let started = Instant::now();
        self.last_frame_ts = self.last_frame_ts.max(frame.ts);

        let detections = match self.detector.detect(&frame).await {
            Ok(detections) => detections,
            Err(e) => {
                warn!(frame_no = frame.frame_no, error = %e, "frame_detect_failed");
                return;
            }
        };

        for detection in &detections {
            if let TrackUpdate::Tracked { window: Some(window), .. } =
                self.aggregator.ingest(detection, frame.ts)
            {
                self.spawn_scoring(window);
            }
        }

        self.metrics.record_frame(started.elapsed().as_micros() as u64);
    }

    /// Time-driven maintenance: evict stale tracks, advance cooldowns,
    /// reap finished scoring tasks
    async fn sweep(&mut self, now_ms: u64) {
        for track_id in self.aggregator.sweep_lost(now_ms) {
            self.machine.mark_lost(track_id).await;
        }
        self.machine.tick(now_ms);
        while self.scoring_tasks.try_join_next().is_some() {}
    }

    fn spawn_scoring(&mut self, window: WindowReady) {
        let permits = self.scoring_permits.clone();
        let classifier = self.classifier.clone();
        let machine = self.machine.clone();
        let dispatcher = self.dispatcher.clone();
        let metrics = self.metrics.clone();

        self.scoring_tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) =
                score_and_advance(&window, classifier, &machine, dispatcher, metrics).await
            {
                warn!(track_id = window.track_id.0, error = %e, "scoring_task_failed");
                machine.reset_track(window.track_id).await;
            }
        });
    }
}

async fn score_and_advance(
    window: &WindowReady,
    classifier: Arc<dyn TemporalClassifier>,
    machine: &IncidentMachine,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
) -> Result<(), PipelineError> {
    let features = encode_window(&window.samples);
    let score = classifier.score(&features).await?;
    metrics.record_window_scored();

    match machine.on_window_scored(window, score).await? {
        MachineAction::None => Ok(()),
        MachineAction::Dispatch(incident) => {
            if let Err(e) = dispatcher.dispatch(&incident).await {
                // The record stays Confirmed; the next anomalous window on
                // this track re-dispatches it off the write-ahead rows.
                error!(
                    incident_id = %incident.incident_id,
                    error = %e,
                    "incident_dispatch_failed"
                );
                return Err(e);
            }
            machine
                .mark_notified(incident.track_id, &incident.incident_id, window.emitted_at)
                .await
        }
    }
}
