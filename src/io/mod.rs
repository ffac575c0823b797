//! IO modules - external collaborator interfaces
//!
//! This module contains the contracts for everything the pipeline does not
//! own:
//! - `detector` - per-frame detection adapter (model internals external)
//! - `classifier` - temporal anomaly scoring adapter (model internals external)
//! - `schedule` - schedule store read interface and time-bounded validator
//! - `channels` - notification channel send interface (SMS/email/push)
//! - `store` - durable incident/attempt record store

pub mod channels;
pub mod classifier;
pub mod detector;
pub mod schedule;
pub mod store;

// Re-export commonly used types
pub use channels::{Ack, LogChannel, NotificationChannel};
pub use classifier::{encode_window, TemporalClassifier};
pub use detector::{FrameDetector, FrameHandle};
pub use schedule::{
    Authorization, MemoryScheduleStore, ScheduleStore, ScheduleValidator, ScheduleWindow,
};
pub use store::{IncidentStore, MemoryStore};
