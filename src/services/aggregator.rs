//! Track aggregation
//!
//! Groups per-frame detections into movement tracks by nearest-neighbor
//! matching on bounding-box centers. Each track keeps a bounded ring of
//! movement samples and periodically emits a `WindowReady` snapshot for
//! temporal classification.
//!
//! The aggregator is single-threaded on the frame path and owned by the
//! pipeline loop; no internal locking.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::domain::types::{
    Detection, MovementSample, SubjectId, TrackId, TrackUpdate, WindowReady, Zone,
};
use crate::infra::{Config, Metrics};

struct TrackEntry {
    samples: VecDeque<MovementSample>,
    subject: Option<SubjectId>,
    last_pos: (f64, f64),
    last_seen_ms: u64,
    last_window_emit_ms: u64,
}

/// Groups detections into tracks and emits classification windows
pub struct TrackAggregator {
    min_confidence: f64,
    max_match_distance: f64,
    max_match_gap_ms: u64,
    lost_timeout_ms: u64,
    window_capacity: usize,
    window_duration_ms: u64,
    min_window_samples: usize,
    window_ready_interval_ms: u64,
    next_track_id: i64,
    tracks: FxHashMap<i64, TrackEntry>,
    metrics: Arc<Metrics>,
}

impl TrackAggregator {
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> Self {
        Self {
            min_confidence: config.min_confidence(),
            max_match_distance: config.max_match_distance(),
            max_match_gap_ms: config.max_match_gap_ms(),
            lost_timeout_ms: config.lost_timeout_ms(),
            window_capacity: config.window_capacity(),
            window_duration_ms: config.window_duration_ms(),
            min_window_samples: config.min_window_samples(),
            window_ready_interval_ms: config.window_ready_interval_ms(),
            next_track_id: 1,
            tracks: FxHashMap::default(),
            metrics,
        }
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Feed one detection into the aggregator
    ///
    /// Low-confidence detections are discarded. Samples that would move a
    /// track's timeline backwards are rejected so every window stays
    /// strictly time-ordered.
    pub fn ingest(&mut self, detection: &Detection, ts_ms: u64) -> TrackUpdate {
        if detection.confidence < self.min_confidence {
            self.metrics.record_detection(false);
            return TrackUpdate::Discarded;
        }
        self.metrics.record_detection(true);

        let center = detection.bbox.center();

        match self.match_track(detection, center, ts_ms) {
            Some(track_id) => {
                let entry = self.tracks.get_mut(&track_id).unwrap();
                if ts_ms <= entry.last_seen_ms {
                    self.metrics.record_out_of_order_sample();
                    debug!(
                        track_id,
                        ts_ms,
                        last_seen_ms = entry.last_seen_ms,
                        "sample_rejected_out_of_order"
                    );
                    return TrackUpdate::Rejected { track_id: TrackId(track_id) };
                }

                entry.samples.push_back(MovementSample {
                    x: center.0,
                    y: center.1,
                    ts: ts_ms,
                    zone: detection.zone,
                });
                Self::trim_window(
                    &mut entry.samples,
                    self.window_capacity,
                    ts_ms.saturating_sub(self.window_duration_ms),
                );
                entry.last_pos = center;
                entry.last_seen_ms = ts_ms;
                if entry.subject.is_none() {
                    entry.subject = detection.subject.clone();
                }

                let window = Self::maybe_window(
                    track_id,
                    entry,
                    ts_ms,
                    self.min_window_samples,
                    self.window_ready_interval_ms,
                );
                TrackUpdate::Tracked { track_id: TrackId(track_id), created: false, window }
            }
            None => {
                let track_id = self.next_track_id;
                self.next_track_id += 1;

                let mut samples = VecDeque::with_capacity(self.window_capacity);
                samples.push_back(MovementSample {
                    x: center.0,
                    y: center.1,
                    ts: ts_ms,
                    zone: detection.zone,
                });
                self.tracks.insert(
                    track_id,
                    TrackEntry {
                        samples,
                        subject: detection.subject.clone(),
                        last_pos: center,
                        last_seen_ms: ts_ms,
                        last_window_emit_ms: 0,
                    },
                );
                info!(track_id, zone = detection.zone.as_str(), "track_created");
                TrackUpdate::Tracked { track_id: TrackId(track_id), created: true, window: None }
            }
        }
    }

    /// Evict tracks not seen within the lost timeout, returning their ids
    pub fn sweep_lost(&mut self, now_ms: u64) -> SmallVec<[TrackId; 8]> {
        let cutoff = now_ms.saturating_sub(self.lost_timeout_ms);
        let mut lost: SmallVec<[TrackId; 8]> = SmallVec::new();
        self.tracks.retain(|&id, entry| {
            if entry.last_seen_ms < cutoff {
                lost.push(TrackId(id));
                false
            } else {
                true
            }
        });
        for track_id in &lost {
            self.metrics.record_track_lost();
            info!(track_id = track_id.0, "track_lost");
        }
        lost
    }

    /// Nearest candidate within the match distance that was seen recently
    /// and does not carry a conflicting subject identity
    fn match_track(&self, detection: &Detection, center: (f64, f64), ts_ms: u64) -> Option<i64> {
        let mut best: Option<(i64, f64)> = None;
        for (&id, entry) in &self.tracks {
            if ts_ms.saturating_sub(entry.last_seen_ms) > self.max_match_gap_ms {
                continue;
            }
            if let (Some(a), Some(b)) = (&detection.subject, &entry.subject) {
                if a != b {
                    continue;
                }
            }
            let dx = center.0 - entry.last_pos.0;
            let dy = center.1 - entry.last_pos.1;
            let dist = (dx * dx + dy * dy).sqrt();
            if dist > self.max_match_distance {
                continue;
            }
            if best.map_or(true, |(_, d)| dist < d) {
                best = Some((id, dist));
            }
        }
        best.map(|(id, _)| id)
    }

    fn trim_window(samples: &mut VecDeque<MovementSample>, capacity: usize, oldest_ts: u64) {
        while samples.len() > capacity {
            samples.pop_front();
        }
        while samples.front().map_or(false, |s| s.ts < oldest_ts) {
            samples.pop_front();
        }
    }

    fn maybe_window(
        track_id: i64,
        entry: &mut TrackEntry,
        ts_ms: u64,
        min_samples: usize,
        interval_ms: u64,
    ) -> Option<WindowReady> {
        if entry.samples.len() < min_samples {
            return None;
        }
        if ts_ms - entry.last_window_emit_ms < interval_ms {
            return None;
        }
        entry.last_window_emit_ms = ts_ms;
        let zone = entry.samples.back().map(|s| s.zone).unwrap_or(Zone::Unknown);
        Some(WindowReady {
            track_id: TrackId(track_id),
            subject: entry.subject.clone(),
            zone,
            samples: entry.samples.iter().cloned().collect(),
            emitted_at: ts_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::BoundingBox;

    fn detection(x: f64, y: f64, confidence: f64) -> Detection {
        Detection {
            bbox: BoundingBox { x1: x - 0.01, y1: y - 0.01, x2: x + 0.01, y2: y + 0.01 },
            confidence,
            zone: Zone::Unauthorized,
            subject: None,
        }
    }

    fn aggregator() -> TrackAggregator {
        let config = Config::default().with_window_ready_interval_ms(0);
        TrackAggregator::new(&config, Arc::new(Metrics::new()))
    }

    #[test]
    fn test_low_confidence_discarded() {
        let mut agg = aggregator();
        assert!(matches!(agg.ingest(&detection(0.5, 0.5, 0.3), 1000), TrackUpdate::Discarded));
        assert_eq!(agg.active_tracks(), 0);
    }

    #[test]
    fn test_nearby_detection_joins_existing_track() {
        let mut agg = aggregator();
        let first = agg.ingest(&detection(0.5, 0.5, 0.9), 1000);
        let TrackUpdate::Tracked { track_id, created: true, .. } = first else {
            panic!("expected new track, got {first:?}");
        };

        let second = agg.ingest(&detection(0.52, 0.5, 0.9), 1500);
        assert!(matches!(
            second,
            TrackUpdate::Tracked { track_id: id, created: false, .. } if id == track_id
        ));
        assert_eq!(agg.active_tracks(), 1);
    }

    #[test]
    fn test_distant_detection_spawns_new_track() {
        let mut agg = aggregator();
        agg.ingest(&detection(0.1, 0.1, 0.9), 1000);
        let update = agg.ingest(&detection(0.9, 0.9, 0.9), 1500);
        assert!(matches!(update, TrackUpdate::Tracked { created: true, .. }));
        assert_eq!(agg.active_tracks(), 2);
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let mut agg = aggregator();
        agg.ingest(&detection(0.5, 0.5, 0.9), 2000);
        let update = agg.ingest(&detection(0.51, 0.5, 0.9), 1500);
        assert!(matches!(update, TrackUpdate::Rejected { .. }));
    }

    #[test]
    fn test_window_emitted_after_min_samples() {
        let mut agg = aggregator();
        let mut window = None;
        for i in 0..10 {
            let update = agg.ingest(&detection(0.5 + i as f64 * 0.005, 0.5, 0.9), 1000 + i * 500);
            if let TrackUpdate::Tracked { window: Some(w), .. } = update {
                window = Some(w);
            }
        }
        let window = window.expect("window should be emitted once min samples accumulate");
        assert!(window.samples.len() >= 8);
        assert_eq!(window.zone, Zone::Unauthorized);
        // Samples strictly ordered
        for pair in window.samples.windows(2) {
            assert!(pair[0].ts < pair[1].ts);
        }
    }

    #[test]
    fn test_window_emission_throttled() {
        let config = Config::default().with_window_ready_interval_ms(10_000);
        let mut agg = TrackAggregator::new(&config, Arc::new(Metrics::new()));
        let mut emitted = 0;
        for i in 0..20 {
            let update = agg.ingest(&detection(0.5, 0.5 + i as f64 * 0.003, 0.9), 1000 + i * 500);
            if matches!(update, TrackUpdate::Tracked { window: Some(_), .. }) {
                emitted += 1;
            }
        }
        assert_eq!(emitted, 1);
    }

    #[test]
    fn test_window_capacity_bounded() {
        let mut agg = aggregator();
        let mut last_window = None;
        for i in 0..100 {
            let update = agg.ingest(&detection(0.5, 0.5 + (i % 5) as f64 * 0.004, 0.9), 1000 + i * 500);
            if let TrackUpdate::Tracked { window: Some(w), .. } = update {
                last_window = Some(w);
            }
        }
        assert!(last_window.expect("window").samples.len() <= 32);
    }

    #[test]
    fn test_sweep_lost_evicts_stale_tracks() {
        let mut agg = aggregator();
        agg.ingest(&detection(0.5, 0.5, 0.9), 1000);
        agg.ingest(&detection(0.9, 0.9, 0.9), 9000);

        let lost = agg.sweep_lost(10_000);
        assert_eq!(lost.len(), 1);
        assert_eq!(agg.active_tracks(), 1);
    }

    #[test]
    fn test_subject_adopted_from_detection() {
        let mut agg = aggregator();
        agg.ingest(&detection(0.5, 0.5, 0.9), 1000);
        let mut tagged = detection(0.51, 0.5, 0.9);
        tagged.subject = Some(SubjectId("s-42".into()));
        for i in 0..10 {
            tagged.bbox = BoundingBox { x1: 0.5, y1: 0.5, x2: 0.52, y2: 0.52 };
            let update = agg.ingest(&tagged, 1500 + i * 500);
            if let TrackUpdate::Tracked { window: Some(w), .. } = update {
                assert_eq!(w.subject, Some(SubjectId("s-42".into())));
                return;
            }
        }
        panic!("no window emitted");
    }
}
