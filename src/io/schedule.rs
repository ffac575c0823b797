//! Schedule store read interface and time-bounded validator
//!
//! The schedule store is a possibly-slow, possibly-unavailable external
//! dependency. The validator wraps every lookup in a timeout and maps
//! timeouts and store errors to `Authorization::Unknown` - the state machine
//! must treat Unknown as "do not confirm, retry later". Defaulting a
//! transient outage to authorized or unauthorized is a correctness bug.

use crate::domain::types::{SubjectId, Zone};
use crate::error::PipelineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Tri-state schedule validation result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    /// Subject is scheduled to be where it is
    Authorized,
    /// Subject has no schedule entry covering this time
    Unauthorized,
    /// Store unavailable or timed out - no decision can be made
    Unknown,
}

impl Authorization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Authorization::Authorized => "authorized",
            Authorization::Unauthorized => "unauthorized",
            Authorization::Unknown => "unknown",
        }
    }
}

/// External schedule entry, read-only to this pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub subject_id: SubjectId,
    /// Epoch ms, inclusive
    pub start_ms: u64,
    /// Epoch ms, exclusive
    pub end_ms: u64,
    pub authorized_zone: Zone,
}

impl ScheduleWindow {
    #[inline]
    pub fn covers(&self, ts_ms: u64) -> bool {
        ts_ms >= self.start_ms && ts_ms < self.end_ms
    }
}

/// Read interface against the external schedule store.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Whether the subject is scheduled (authorized) at the given time.
    /// Errors are transient store failures, never a verdict.
    async fn lookup(&self, subject: &SubjectId, ts_ms: u64) -> Result<bool, PipelineError>;
}

/// Time-bounded wrapper around the schedule store.
///
/// One validator is shared across tracks; the per-track single-outstanding-
/// call rule is enforced by the state machine, not here.
pub struct ScheduleValidator {
    store: Arc<dyn ScheduleStore>,
    timeout: Duration,
}

impl ScheduleValidator {
    pub fn new(store: Arc<dyn ScheduleStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Validate one subject at one timestamp, bounded by the configured
    /// timeout. Never returns an error - outages become `Unknown`.
    pub async fn is_authorized(&self, subject: &SubjectId, ts_ms: u64) -> Authorization {
        match tokio::time::timeout(self.timeout, self.store.lookup(subject, ts_ms)).await {
            Ok(Ok(true)) => Authorization::Authorized,
            Ok(Ok(false)) => Authorization::Unauthorized,
            Ok(Err(e)) => {
                warn!(subject = %subject, error = %e, "schedule_lookup_failed");
                Authorization::Unknown
            }
            Err(_) => {
                warn!(subject = %subject, timeout_ms = %self.timeout.as_millis(), "schedule_lookup_timeout");
                Authorization::Unknown
            }
        }
    }
}

/// In-memory schedule store used by tests and the simulator
pub struct MemoryScheduleStore {
    windows: parking_lot::RwLock<Vec<ScheduleWindow>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self { windows: parking_lot::RwLock::new(Vec::new()) }
    }

    pub fn add_window(&self, window: ScheduleWindow) {
        self.windows.write().push(window);
    }
}

impl Default for MemoryScheduleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn lookup(&self, subject: &SubjectId, ts_ms: u64) -> Result<bool, PipelineError> {
        let windows = self.windows.read();
        Ok(windows.iter().any(|w| w.subject_id == *subject && w.covers(ts_ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingStore;

    #[async_trait]
    impl ScheduleStore for FailingStore {
        async fn lookup(&self, _: &SubjectId, _: u64) -> Result<bool, PipelineError> {
            Err(PipelineError::Transient("connection refused".into()))
        }
    }

    struct SlowStore;

    #[async_trait]
    impl ScheduleStore for SlowStore {
        async fn lookup(&self, _: &SubjectId, _: u64) -> Result<bool, PipelineError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(true)
        }
    }

    fn subject() -> SubjectId {
        SubjectId("s-1".into())
    }

    #[tokio::test]
    async fn test_scheduled_subject_is_authorized() {
        let store = Arc::new(MemoryScheduleStore::new());
        store.add_window(ScheduleWindow {
            subject_id: subject(),
            start_ms: 1000,
            end_ms: 2000,
            authorized_zone: Zone::Classroom,
        });

        let validator = ScheduleValidator::new(store, Duration::from_millis(100));
        assert_eq!(validator.is_authorized(&subject(), 1500).await, Authorization::Authorized);
    }

    #[tokio::test]
    async fn test_unscheduled_subject_is_unauthorized() {
        let store = Arc::new(MemoryScheduleStore::new());
        let validator = ScheduleValidator::new(store, Duration::from_millis(100));

        assert_eq!(validator.is_authorized(&subject(), 1500).await, Authorization::Unauthorized);
    }

    #[tokio::test]
    async fn test_window_boundary_exclusive_end() {
        let store = Arc::new(MemoryScheduleStore::new());
        store.add_window(ScheduleWindow {
            subject_id: subject(),
            start_ms: 1000,
            end_ms: 2000,
            authorized_zone: Zone::Classroom,
        });
        let validator = ScheduleValidator::new(store, Duration::from_millis(100));

        assert_eq!(validator.is_authorized(&subject(), 2000).await, Authorization::Unauthorized);
        assert_eq!(validator.is_authorized(&subject(), 1000).await, Authorization::Authorized);
    }

    #[tokio::test]
    async fn test_store_error_maps_to_unknown() {
        let validator = ScheduleValidator::new(Arc::new(FailingStore), Duration::from_millis(100));
        assert_eq!(validator.is_authorized(&subject(), 1500).await, Authorization::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_maps_to_unknown() {
        let validator = ScheduleValidator::new(Arc::new(SlowStore), Duration::from_millis(50));
        assert_eq!(validator.is_authorized(&subject(), 1500).await, Authorization::Unknown);
    }
}
