//! Shared types for the incident pipeline

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Newtype wrapper for track IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TrackId(pub i64);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resolved subject identity (student ID from the upstream identity service)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SubjectId(pub String);

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Coarse frame zone as labelled by the detection adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Zone {
    Classroom,
    Hallway,
    Unauthorized,
    Unknown,
}

impl Zone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Classroom => "classroom",
            Zone::Hallway => "hallway",
            Zone::Unauthorized => "unauthorized",
            Zone::Unknown => "unknown",
        }
    }

    /// Numeric code used as the fourth classifier feature.
    #[inline]
    pub fn feature_code(&self) -> f32 {
        match self {
            Zone::Classroom => 0.0,
            Zone::Hallway => 1.0,
            Zone::Unauthorized => 2.0,
            Zone::Unknown => 3.0,
        }
    }
}

impl std::str::FromStr for Zone {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "classroom" => Zone::Classroom,
            "hallway" => Zone::Hallway,
            "unauthorized" => Zone::Unauthorized,
            _ => Zone::Unknown,
        })
    }
}

/// Axis-aligned bounding box, frame-normalized to 0..1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    #[inline]
    pub fn center(&self) -> (f64, f64) {
        ((self.x1 + self.x2) * 0.5, (self.y1 + self.y2) * 0.5)
    }
}

/// Candidate subject detection produced by the detection adapter for one frame
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Detector confidence in [0, 1]
    pub confidence: f64,
    /// Coarse zone hint from the detector
    pub zone: Zone,
    /// Subject identity, if the upstream identity service resolved one
    pub subject: Option<SubjectId>,
}

/// One position observation inside a track's sliding window.
/// Immutable once appended; ordering within a window is non-decreasing by ts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MovementSample {
    /// Frame-normalized center x in 0..1
    pub x: f64,
    /// Frame-normalized center y in 0..1
    pub y: f64,
    /// Epoch milliseconds
    pub ts: u64,
    pub zone: Zone,
}

/// Incident lifecycle state of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Idle,
    Suspected,
    Confirmed,
    Notified,
    Cooldown,
    /// Terminal - track dropped by the aggregator
    Lost,
}

impl TrackState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackState::Idle => "idle",
            TrackState::Suspected => "suspected",
            TrackState::Confirmed => "confirmed",
            TrackState::Notified => "notified",
            TrackState::Cooldown => "cooldown",
            TrackState::Lost => "lost",
        }
    }
}

/// Snapshot of one track's window, ready for temporal classification.
///
/// Samples are an owned copy so scoring never holds the aggregator's state.
#[derive(Debug, Clone)]
pub struct WindowReady {
    pub track_id: TrackId,
    pub subject: Option<SubjectId>,
    /// Zone of the newest sample
    pub zone: Zone,
    /// Time-ordered samples, oldest first
    pub samples: Vec<MovementSample>,
    /// Epoch ms at emission
    pub emitted_at: u64,
}

/// Result of feeding one detection through the aggregator
#[derive(Debug, Clone)]
pub enum TrackUpdate {
    /// Confidence below the configured floor; dropped before matching
    Discarded,
    /// Sample older than the window tail; dropped to preserve ordering
    Rejected { track_id: TrackId },
    /// Detection associated with a track (existing or freshly spawned)
    Tracked { track_id: TrackId, created: bool, window: Option<WindowReady> },
}
