//! Temporal classifier adapter contract
//!
//! The sequence model scoring a movement window is external. The pipeline
//! encodes windows into the fixed feature order the model was trained on
//! and consumes a single anomaly probability back.

use crate::domain::types::MovementSample;
use crate::error::PipelineError;
use async_trait::async_trait;

/// Fixed per-sample feature order: normalized-x, normalized-y,
/// timestamp-delta (seconds since previous sample), zone-code.
pub const FEATURES_PER_SAMPLE: usize = 4;

/// Movement window anomaly scoring service.
#[async_trait]
pub trait TemporalClassifier: Send + Sync {
    /// Score an encoded window. Returns an anomaly probability in [0, 1].
    async fn score(&self, features: &[[f32; FEATURES_PER_SAMPLE]]) -> Result<f32, PipelineError>;
}

/// Encode a time-ordered window into the classifier's feature layout.
/// The first sample's timestamp-delta is 0.
pub fn encode_window(samples: &[MovementSample]) -> Vec<[f32; FEATURES_PER_SAMPLE]> {
    let mut features = Vec::with_capacity(samples.len());
    let mut prev_ts = samples.first().map(|s| s.ts).unwrap_or(0);
    for sample in samples {
        let dt_s = (sample.ts.saturating_sub(prev_ts)) as f32 / 1000.0;
        features.push([sample.x as f32, sample.y as f32, dt_s, sample.zone.feature_code()]);
        prev_ts = sample.ts;
    }
    features
}
