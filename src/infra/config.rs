//! Configuration loading from TOML files
//!
//! Invalid thresholds, empty channel sets or missing recipients fail at
//! startup - configuration is never re-read or re-validated mid-stream.

use crate::domain::incident::ChannelKind;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Site identifier included in logs (e.g. "north-campus")
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "campus".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    /// Detections below this confidence are discarded before matching
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Maximum center distance (frame-normalized) for nearest-neighbor match
    #[serde(default = "default_max_match_distance")]
    pub max_match_distance: f64,
    /// Maximum time gap between a track's last sample and a new detection
    #[serde(default = "default_max_match_gap_ms")]
    pub max_match_gap_ms: u64,
    /// Tracks silent for longer than this become terminal Lost
    #[serde(default = "default_lost_timeout_ms")]
    pub lost_timeout_ms: u64,
    /// Maximum samples kept per window (ring-buffer capacity)
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    /// Maximum window span; older samples are evicted
    #[serde(default = "default_window_duration_ms")]
    pub window_duration_ms: u64,
    /// Minimum samples before WindowReady may be emitted
    #[serde(default = "default_min_window_samples")]
    pub min_window_samples: usize,
    /// Per-track throttle between WindowReady emissions
    #[serde(default = "default_window_ready_interval_ms")]
    pub window_ready_interval_ms: u64,
}

fn default_min_confidence() -> f64 {
    0.5
}
fn default_max_match_distance() -> f64 {
    0.08
}
fn default_max_match_gap_ms() -> u64 {
    2000
}
fn default_lost_timeout_ms() -> u64 {
    5000
}
fn default_window_capacity() -> usize {
    32
}
fn default_window_duration_ms() -> u64 {
    20_000
}
fn default_min_window_samples() -> usize {
    8
}
fn default_window_ready_interval_ms() -> u64 {
    1000
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            max_match_distance: default_max_match_distance(),
            max_match_gap_ms: default_max_match_gap_ms(),
            lost_timeout_ms: default_lost_timeout_ms(),
            window_capacity: default_window_capacity(),
            window_duration_ms: default_window_duration_ms(),
            min_window_samples: default_min_window_samples(),
            window_ready_interval_ms: default_window_ready_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncidentConfig {
    /// Classifier probability at or above which a window is anomalous
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f32,
    /// Minimum time in Suspected before confirmation (debounce)
    #[serde(default = "default_min_dwell_ms")]
    pub min_dwell_ms: u64,
    /// Re-trigger suppression after notification
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Dedup key time-bucket width
    #[serde(default = "default_dedup_bucket_ms")]
    pub dedup_bucket_ms: u64,
}

fn default_anomaly_threshold() -> f32 {
    0.7
}
fn default_min_dwell_ms() -> u64 {
    4000
}
fn default_cooldown_ms() -> u64 {
    300_000
}
fn default_dedup_bucket_ms() -> u64 {
    300_000
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            anomaly_threshold: default_anomaly_threshold(),
            min_dwell_ms: default_min_dwell_ms(),
            cooldown_ms: default_cooldown_ms(),
            dedup_bucket_ms: default_dedup_bucket_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    /// Hard bound on one schedule store lookup
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
}

fn default_lookup_timeout_ms() -> u64 {
    500
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self { lookup_timeout_ms: default_lookup_timeout_ms() }
    }
}

/// Routing entry for one notification channel
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelRoute {
    pub kind: ChannelKind,
    pub recipient: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Configured channels; at least one is required
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelRoute>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Backoff ceiling
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Per-send hard timeout
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

fn default_channels() -> Vec<ChannelRoute> {
    vec![
        ChannelRoute { kind: ChannelKind::Sms, recipient: "+0000000000".to_string() },
        ChannelRoute { kind: ChannelKind::Email, recipient: "alerts@school.example".to_string() },
    ]
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_cap_ms() -> u64 {
    30_000
}
fn default_send_timeout_ms() -> u64 {
    2000
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnonymizerConfig {
    /// Age after which closed incidents are eligible for anonymization
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
    /// Scan interval
    #[serde(default = "default_anonymizer_interval_ms")]
    pub interval_ms: u64,
    /// Salt mixed into the one-way pseudonym derivation
    #[serde(default = "default_pseudonym_salt")]
    pub pseudonym_salt: String,
}

fn default_retention_ms() -> u64 {
    30 * 24 * 3600 * 1000
}
fn default_anonymizer_interval_ms() -> u64 {
    3_600_000
}
fn default_pseudonym_salt() -> String {
    "campus-watch".to_string()
}

impl Default for AnonymizerConfig {
    fn default() -> Self {
        Self {
            retention_ms: default_retention_ms(),
            interval_ms: default_anonymizer_interval_ms(),
            pseudonym_salt: default_pseudonym_salt(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Bound on concurrent scoring/validation tasks
    #[serde(default = "default_scoring_workers")]
    pub scoring_workers: usize,
}

fn default_scoring_workers() -> usize {
    4
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { scoring_workers: default_scoring_workers() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

fn default_metrics_interval_secs() -> u64 {
    10
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct TomlConfig {
    #[serde(default)]
    site: SiteConfig,
    #[serde(default)]
    aggregator: AggregatorConfig,
    #[serde(default)]
    incident: IncidentConfig,
    #[serde(default)]
    validator: ValidatorConfig,
    #[serde(default)]
    dispatcher: DispatcherConfig,
    #[serde(default)]
    anonymizer: AnonymizerConfig,
    #[serde(default)]
    pipeline: PipelineConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    aggregator: AggregatorConfig,
    incident: IncidentConfig,
    validator: ValidatorConfig,
    dispatcher: DispatcherConfig,
    anonymizer: AnonymizerConfig,
    pipeline: PipelineConfig,
    metrics: MetricsConfig,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            aggregator: AggregatorConfig::default(),
            incident: IncidentConfig::default(),
            validator: ValidatorConfig::default(),
            dispatcher: DispatcherConfig::default(),
            anonymizer: AnonymizerConfig::default(),
            pipeline: PipelineConfig::default(),
            metrics: MetricsConfig::default(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. Fails on unreadable files,
    /// parse errors and invalid values - all fatal at startup.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self {
            site_id: toml_config.site.id,
            aggregator: toml_config.aggregator,
            incident: toml_config.incident,
            validator: toml_config.validator,
            dispatcher: toml_config.dispatcher,
            anonymizer: toml_config.anonymizer,
            pipeline: toml_config.pipeline,
            metrics: toml_config.metrics,
            config_file: path.display().to_string(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would misbehave mid-stream.
    pub fn validate(&self) -> anyhow::Result<()> {
        let threshold = self.incident.anomaly_threshold;
        if !(0.0..=1.0).contains(&threshold) || threshold == 0.0 {
            bail!("incident.anomaly_threshold must be in (0, 1], got {threshold}");
        }
        if !(0.0..1.0).contains(&self.aggregator.min_confidence) {
            bail!(
                "aggregator.min_confidence must be in [0, 1), got {}",
                self.aggregator.min_confidence
            );
        }
        if self.aggregator.min_window_samples < 2 {
            bail!("aggregator.min_window_samples must be at least 2");
        }
        if self.aggregator.window_capacity < self.aggregator.min_window_samples {
            bail!("aggregator.window_capacity must be >= min_window_samples");
        }
        if self.dispatcher.channels.is_empty() {
            bail!("dispatcher.channels must not be empty");
        }
        if let Some(route) = self.dispatcher.channels.iter().find(|c| c.recipient.is_empty()) {
            bail!("dispatcher channel {} has an empty recipient", route.kind);
        }
        if self.dispatcher.max_attempts == 0 {
            bail!("dispatcher.max_attempts must be at least 1");
        }
        if self.anonymizer.pseudonym_salt.is_empty() {
            bail!("anonymizer.pseudonym_salt must not be empty");
        }
        if self.pipeline.scoring_workers == 0 {
            bail!("pipeline.scoring_workers must be at least 1");
        }
        Ok(())
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    // Aggregator getters
    pub fn min_confidence(&self) -> f64 {
        self.aggregator.min_confidence
    }

    pub fn max_match_distance(&self) -> f64 {
        self.aggregator.max_match_distance
    }

    pub fn max_match_gap_ms(&self) -> u64 {
        self.aggregator.max_match_gap_ms
    }

    pub fn lost_timeout_ms(&self) -> u64 {
        self.aggregator.lost_timeout_ms
    }

    pub fn window_capacity(&self) -> usize {
        self.aggregator.window_capacity
    }

    pub fn window_duration_ms(&self) -> u64 {
        self.aggregator.window_duration_ms
    }

    pub fn min_window_samples(&self) -> usize {
        self.aggregator.min_window_samples
    }

    pub fn window_ready_interval_ms(&self) -> u64 {
        self.aggregator.window_ready_interval_ms
    }

    // Incident state machine getters
    pub fn anomaly_threshold(&self) -> f32 {
        self.incident.anomaly_threshold
    }

    pub fn min_dwell_ms(&self) -> u64 {
        self.incident.min_dwell_ms
    }

    pub fn cooldown_ms(&self) -> u64 {
        self.incident.cooldown_ms
    }

    pub fn dedup_bucket_ms(&self) -> u64 {
        self.incident.dedup_bucket_ms
    }

    // Validator getters
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.validator.lookup_timeout_ms)
    }

    // Dispatcher getters
    pub fn channels(&self) -> &[ChannelRoute] {
        &self.dispatcher.channels
    }

    pub fn max_attempts(&self) -> u32 {
        self.dispatcher.max_attempts
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.dispatcher.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.dispatcher.backoff_cap_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatcher.send_timeout_ms)
    }

    // Anonymizer getters
    pub fn retention_ms(&self) -> u64 {
        self.anonymizer.retention_ms
    }

    pub fn anonymizer_interval(&self) -> Duration {
        Duration::from_millis(self.anonymizer.interval_ms)
    }

    pub fn pseudonym_salt(&self) -> &str {
        &self.anonymizer.pseudonym_salt
    }

    // Pipeline getters
    pub fn scoring_workers(&self) -> usize {
        self.pipeline.scoring_workers
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics.interval_secs
    }

    /// Builder method for tests to set min_dwell_ms
    #[cfg(test)]
    pub fn with_min_dwell_ms(mut self, ms: u64) -> Self {
        self.incident.min_dwell_ms = ms;
        self
    }

    /// Builder method for tests to set the WindowReady throttle
    #[cfg(test)]
    pub fn with_window_ready_interval_ms(mut self, ms: u64) -> Self {
        self.aggregator.window_ready_interval_ms = ms;
        self
    }

    /// Builder method for tests to set cooldown
    #[cfg(test)]
    pub fn with_cooldown_ms(mut self, ms: u64) -> Self {
        self.incident.cooldown_ms = ms;
        self
    }
}
