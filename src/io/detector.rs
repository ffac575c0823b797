//! Detection adapter contract
//!
//! The object detection model itself is an external collaborator. The
//! pipeline only sees its output: candidate subject boxes with a confidence
//! and a coarse zone label per frame.

use crate::domain::types::Detection;
use crate::error::PipelineError;
use async_trait::async_trait;

/// Opaque handle to one captured frame. The pipeline never decodes video;
/// the handle carries only what downstream consumers need.
#[derive(Debug, Clone)]
pub struct FrameHandle {
    /// Monotonic frame sequence number from the video source
    pub frame_no: u64,
    /// Capture timestamp, epoch ms
    pub ts: u64,
    /// Snapshot reference usable as incident evidence
    pub evidence_ref: Option<String>,
}

impl FrameHandle {
    pub fn new(frame_no: u64, ts: u64) -> Self {
        Self { frame_no, ts, evidence_ref: None }
    }

    pub fn with_evidence(mut self, evidence_ref: &str) -> Self {
        self.evidence_ref = Some(evidence_ref.to_string());
        self
    }
}

/// Per-frame detection scoring service.
#[async_trait]
pub trait FrameDetector: Send + Sync {
    /// Return candidate subject detections for one frame.
    /// Confidence filtering happens downstream in the aggregator.
    async fn detect(&self, frame: &FrameHandle) -> Result<Vec<Detection>, PipelineError>;
}
