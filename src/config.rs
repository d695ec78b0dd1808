//! TOML configuration for DriftSentinel.
//!
//! Layered model: compiled-in defaults, overridden section by section by a
//! TOML file. The file is located through `SENTINEL_CONFIG`, then the standard
//! system path. Every tuning knob of the detector and the resolution policy
//! lives here rather than in code.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::SentinelError;

const SYSTEM_CONFIG_PATH: &str = "/etc/driftsentinel/driftsentinel.toml";

// Upper bounds for configured look-back spans.
const DAYS_PER_YEAR: i64 = 366;
const HOURS_PER_YEAR: i64 = DAYS_PER_YEAR * 24;
const MINUTES_PER_YEAR: i64 = HOURS_PER_YEAR * 60;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the sentinel process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SentinelConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub baseline: BaselineConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub diagnosis: DiagnosisConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SentinelConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate()?;
        info!(path = %path.display(), "loaded sentinel configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `SENTINEL_CONFIG` environment variable.
    /// 2. `/etc/driftsentinel/driftsentinel.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("SENTINEL_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SENTINEL_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject threshold combinations that would make the policy incoherent.
    pub fn validate(&self) -> Result<(), SentinelError> {
        let p = &self.policy;
        if !(0.0..=1.0).contains(&p.escalate_below_confidence)
            || !(0.0..=1.0).contains(&p.auto_execute_confidence)
        {
            return Err(SentinelError::Config(
                "policy confidences must lie in [0, 1]".into(),
            ));
        }
        if p.escalate_below_confidence > p.auto_execute_confidence {
            return Err(SentinelError::Config(format!(
                "escalate_below_confidence ({}) exceeds auto_execute_confidence ({})",
                p.escalate_below_confidence, p.auto_execute_confidence
            )));
        }
        let d = &self.detection;
        for (name, threshold) in [("kl_threshold", d.kl_threshold), ("zone_threshold", d.zone_threshold)] {
            if !threshold.is_finite() || threshold <= 0.0 {
                return Err(SentinelError::Config(format!(
                    "{name} must be a positive finite number, got {threshold}"
                )));
            }
        }
        if !d.epsilon.is_finite() || d.epsilon <= 0.0 {
            return Err(SentinelError::Config(format!(
                "epsilon must be a positive finite number, got {}",
                d.epsilon
            )));
        }
        let spans = [
            ("detection.recent_window_minutes", d.recent_window_minutes, MINUTES_PER_YEAR),
            ("baseline.window_days", self.baseline.window_days, DAYS_PER_YEAR),
            ("baseline.max_age_hours", self.baseline.max_age_hours, HOURS_PER_YEAR),
            ("diagnosis.lookback_hours", self.diagnosis.lookback_hours, HOURS_PER_YEAR),
            ("diagnosis.bucket_minutes", self.diagnosis.bucket_minutes, MINUTES_PER_YEAR),
            ("monitor.discover_window_minutes", self.monitor.discover_window_minutes, MINUTES_PER_YEAR),
        ];
        for (name, value, max) in spans {
            if !(1..=max).contains(&value) {
                return Err(SentinelError::Config(format!("{name} must lie in [1, {max}], got {value}")));
            }
        }
        let tolerance = self.diagnosis.scheduled_job_tolerance_minutes;
        if !(0..=MINUTES_PER_YEAR).contains(&tolerance) {
            return Err(SentinelError::Config(format!(
                "diagnosis.scheduled_job_tolerance_minutes must lie in [0, {MINUTES_PER_YEAR}], got {tolerance}"
            )));
        }
        if d.max_parallel_checks == 0 {
            return Err(SentinelError::Config(
                "max_parallel_checks must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server / storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP API binds to.
    pub bind: String,
    /// Origins allowed by the CORS layer. Empty means any origin.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            cors_origins: vec![
                "http://localhost:5173".to_string(),
                "http://localhost:3000".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/driftsentinel.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Drift detector thresholds and windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Whole-distribution KL threshold that opens an incident.
    pub kl_threshold: f64,
    /// Per-zone KL threshold used to mark a zone as affected.
    pub zone_threshold: f64,
    /// Additive smoothing applied to both distributions before taking logs.
    pub epsilon: f64,
    pub recent_window_minutes: i64,
    pub min_current_samples: usize,
    pub min_zone_samples: usize,
    pub check_interval_secs: u64,
    pub max_parallel_checks: usize,
    /// Business impact per severity unit when no per-algorithm multiplier is set.
    pub default_impact_multiplier: f64,
    pub impact_multipliers: HashMap<String, f64>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            kl_threshold: 0.3,
            zone_threshold: 0.3,
            epsilon: 1e-8,
            recent_window_minutes: 30,
            min_current_samples: 20,
            min_zone_samples: 5,
            check_interval_secs: 60,
            max_parallel_checks: 4,
            default_impact_multiplier: 230_000.0,
            impact_multipliers: HashMap::new(),
        }
    }
}

impl DetectionConfig {
    pub fn impact_multiplier(&self, algorithm: &str) -> f64 {
        self.impact_multipliers
            .get(algorithm)
            .copied()
            .unwrap_or(self.default_impact_multiplier)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    pub window_days: i64,
    /// A stored baseline younger than this is served from cache.
    pub max_age_hours: i64,
    /// Below this many samples the baseline is flagged low-confidence.
    pub min_samples: usize,
    /// Cron expression (with seconds) for the fleet-wide recompute.
    pub refresh_cron: String,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            window_days: 7,
            max_age_hours: 24,
            min_samples: 30,
            refresh_cron: "0 0 3 * * *".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution policy
// ---------------------------------------------------------------------------

/// Confidence gates for automatic remediation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// At or above this confidence the recommended fix is applied automatically.
    pub auto_execute_confidence: f64,
    /// Below this confidence the incident is escalated to humans.
    pub escalate_below_confidence: f64,
    /// Wait before re-checking divergence after an automatic fix.
    pub verification_grace_secs: u64,
    /// Post-fix decisions required before verification can pass.
    pub verification_min_samples: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            auto_execute_confidence: 0.85,
            escalate_below_confidence: 0.60,
            verification_grace_secs: 120,
            verification_min_samples: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Diagnosis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosisConfig {
    pub lookback_hours: i64,
    pub bucket_minutes: i64,
    pub min_bucket_samples: usize,
    /// How far a scheduled job may fire from the drift onset and still be blamed.
    pub scheduled_job_tolerance_minutes: i64,
    pub scheduled_jobs: Vec<ScheduledJob>,
    /// Standardized mean shift above which an input feature is a suspect.
    pub feature_shift_sigma: f64,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            lookback_hours: 6,
            bucket_minutes: 5,
            min_bucket_samples: 5,
            scheduled_job_tolerance_minutes: 10,
            scheduled_jobs: Vec::new(),
            feature_shift_sigma: 3.0,
        }
    }
}

/// A known batch job whose firing times can explain a sudden drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub name: String,
    /// Cron expression with a leading seconds field.
    pub cron: String,
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Algorithms monitored from startup.
    pub algorithms: Vec<String>,
    /// Add algorithms that recently produced decisions on every scan.
    pub auto_discover: bool,
    pub discover_window_minutes: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            algorithms: Vec::new(),
            auto_discover: true,
            discover_window_minutes: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub jira: JiraConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JiraConfig {
    pub url: Option<String>,
    pub email: Option<String>,
    pub api_token: Option<String>,
    pub project_key: String,
}

impl Default for JiraConfig {
    fn default() -> Self {
        Self {
            url: None,
            email: None,
            api_token: None,
            project_key: "CS".to_string(),
        }
    }
}

impl JiraConfig {
    pub fn is_configured(&self) -> bool {
        self.url.is_some() && self.email.is_some() && self.api_token.is_some()
    }
}

/// External diagnostic/remediation agent endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Converse endpoint. `None` disables the agent; heuristics are used alone.
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub diagnostician_id: String,
    pub resolver_id: String,
    /// Agent suggestions below this confidence are ignored.
    pub min_confidence: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: 30,
            diagnostician_id: "drift-diagnostician".to_string(),
            resolver_id: "drift-resolver".to_string(),
            min_confidence: 0.5,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// `pretty` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
