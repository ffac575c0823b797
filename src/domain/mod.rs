//! Domain models - core business types for the incident pipeline
//!
//! This module contains the canonical data types used throughout the system:
//! - `Track` state and `MovementSample` - per-subject motion history
//! - `Detection` - candidate subject boxes from the upstream detector
//! - `Incident` - confirmed anomaly record with deduplication key
//! - `NotificationAttempt` - per-channel durable delivery record

pub mod incident;
pub mod types;
