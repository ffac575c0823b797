//! Pipeline services
//!
//! - `aggregator`: groups per-frame detections into movement tracks
//! - `incident`: per-track incident state machine with dedup
//! - `dispatcher`: multi-channel notification delivery with retry
//! - `anonymizer`: retention-driven anonymization job
//! - `pipeline`: frame loop wiring the stages together

pub mod aggregator;
pub mod anonymizer;
pub mod dispatcher;
pub mod incident;
pub mod pipeline;

pub use aggregator::TrackAggregator;
pub use anonymizer::AnonymizationJob;
pub use dispatcher::Dispatcher;
pub use incident::{IncidentMachine, MachineAction};
pub use pipeline::Pipeline;
