//! Session settings.
//!
//! Every tunable of an open instrument: exchange timeouts and retries, the
//! probe baud list and budget, calibration negotiation bounds and cache
//! location, stabilization thresholds and the switch poller cadence. Each field
//! has a serde default so a partial TOML table is enough.
//!
//! # Example
//!
//! ```toml
//! [transport]
//! timeout_ms = 2000
//!
//! [probe]
//! baud_rates = [115200, 9600]
//!
//! [stabilization]
//! max_samples = 16
//! accept_degraded = true
//! ```

use colorcal_core::error::{ColorError, ColorResult};
use colorcal_core::error_recovery::RetryPolicy;
use colorcal_core::measurement::StabilizationConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Baud rates supported by the serial families.
pub const SUPPORTED_BAUD_RATES: [u32; 6] = [921_600, 115_200, 57_600, 38_400, 19_200, 9_600];

/// All settings for one instrument session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SessionSettings {
    /// Exchange timeouts and retries.
    pub transport: TransportSettings,
    /// Auto-probe.
    pub probe: ProbeSettings,
    /// Calibration negotiation and cache.
    pub calibration: CalibrationSettings,
    /// Overrides the driver's convergence thresholds when present.
    pub stabilization: Option<StabilizationConfig>,
    /// Background switch poller.
    pub poller: PollerSettings,
}

/// Exchange timeouts and retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Timeout for one request/response exchange.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Total tries for a failing exchange.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between tries.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Use RTS/CTS on serial links.
    #[serde(default)]
    pub flow_control: bool,
}

/// Auto-probe settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// Baud rates tried in order.
    #[serde(default = "default_baud_rates")]
    pub baud_rates: Vec<u32>,
    /// Timeout for each identification attempt.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Budget for the whole probe.
    #[serde(default = "default_budget_ms")]
    pub budget_ms: u64,
}

/// Calibration negotiation and cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// How long to wait for the host to arrange a condition.
    #[serde(default = "default_setup_timeout_secs")]
    pub setup_timeout_secs: u64,
    /// Consecutive rounds without progress before giving up.
    #[serde(default = "default_max_rounds")]
    pub max_rounds_without_progress: u32,
    /// Load and store calibrations on disk.
    #[serde(default = "default_true")]
    pub use_cache: bool,
    /// Cache directory; the platform cache dir when unset.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Display correction matrix (JSON).
    #[serde(default)]
    pub correction_path: Option<PathBuf>,
}

/// Switch poller settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerSettings {
    /// Spawn the poller for devices with a trigger switch.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Tick interval.
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    /// How long a tick waits for the link before skipping.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Exchange timeout for the status query.
    #[serde(default = "default_status_timeout_ms")]
    pub status_timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    100
}

fn default_baud_rates() -> Vec<u32> {
    SUPPORTED_BAUD_RATES.to_vec()
}

fn default_attempt_timeout_ms() -> u64 {
    300
}

fn default_budget_ms() -> u64 {
    5000
}

fn default_setup_timeout_secs() -> u64 {
    300
}

fn default_max_rounds() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_lock_timeout_ms() -> u64 {
    50
}

fn default_status_timeout_ms() -> u64 {
    200
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            flow_control: false,
        }
    }
}

impl TransportSettings {
    /// Exchange timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Retry policy for failing exchanges.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_delay: Duration::from_millis(self.backoff_ms),
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            baud_rates: default_baud_rates(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            budget_ms: default_budget_ms(),
        }
    }
}

impl ProbeSettings {
    /// Timeout for each identification attempt.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Budget for the whole probe.
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            setup_timeout_secs: default_setup_timeout_secs(),
            max_rounds_without_progress: default_max_rounds(),
            use_cache: true,
            cache_dir: None,
            correction_path: None,
        }
    }
}

impl CalibrationSettings {
    /// How long to wait for the host.
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_secs(self.setup_timeout_secs)
    }
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_poll_interval_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            status_timeout_ms: default_status_timeout_ms(),
        }
    }
}

impl PollerSettings {
    /// Tick interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Lock wait per tick.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Status exchange timeout.
    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }
}

impl SessionSettings {
    /// Settings suitable for tests and simulations: no cache, no poller, short
    /// timeouts.
    pub fn ephemeral() -> Self {
        let mut settings = Self::default();
        settings.calibration.use_cache = false;
        settings.poller.enabled = false;
        settings.transport.timeout_ms = 200;
        settings.transport.backoff_ms = 10;
        settings
    }

    /// Defaults, then `path` if it exists, then `COLORCAL_SESSION_*` variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("COLORCAL_SESSION_").split("__"))
            .extract()
    }

    /// Check value ranges.
    pub fn validate(&self) -> ColorResult<()> {
        if self.transport.timeout_ms == 0 {
            return Err(ColorError::Configuration(
                "transport.timeout_ms must be positive".into(),
            ));
        }
        if self.transport.max_attempts == 0 {
            return Err(ColorError::Configuration(
                "transport.max_attempts must be at least 1".into(),
            ));
        }
        if self.probe.baud_rates.is_empty() {
            return Err(ColorError::Configuration(
                "probe.baud_rates must not be empty".into(),
            ));
        }
        if let Some(bad) = self
            .probe
            .baud_rates
            .iter()
            .find(|b| !SUPPORTED_BAUD_RATES.contains(b))
        {
            return Err(ColorError::Configuration(format!(
                "unsupported baud rate {bad}; expected one of {SUPPORTED_BAUD_RATES:?}"
            )));
        }
        if self.probe.attempt_timeout_ms == 0 || self.probe.budget_ms == 0 {
            return Err(ColorError::Configuration(
                "probe timeouts must be positive".into(),
            ));
        }
        if self.calibration.max_rounds_without_progress == 0 {
            return Err(ColorError::Configuration(
                "calibration.max_rounds_without_progress must be at least 1".into(),
            ));
        }
        if self.poller.interval_ms == 0 {
            return Err(ColorError::Configuration(
                "poller.interval_ms must be positive".into(),
            ));
        }
        if let Some(stab) = &self.stabilization {
            stab.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = SessionSettings::default();
        assert_eq!(settings.probe.baud_rates[0], 921_600);
        assert_eq!(settings.probe.attempt_timeout(), Duration::from_millis(300));
        assert_eq!(settings.probe.budget(), Duration::from_secs(5));
        assert_eq!(settings.poller.interval(), Duration::from_millis(500));
        assert_eq!(settings.calibration.max_rounds_without_progress, 4);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[probe]\nbaud_rates = [9600]\n\n[stabilization]\nmax_samples = 4\n"
        )
        .unwrap();
        let settings = SessionSettings::load_from(file.path()).unwrap();
        assert_eq!(settings.probe.baud_rates, vec![9600]);
        assert_eq!(settings.probe.budget_ms, 5000);
        let stab = settings.stabilization.unwrap();
        assert_eq!(stab.max_samples, 4);
        assert!((stab.monotonic_band - 0.005).abs() < 1e-12);
    }

    #[test]
    fn test_validation_rejects_unknown_baud() {
        let mut settings = SessionSettings::default();
        settings.probe.baud_rates = vec![12_345];
        assert!(matches!(
            settings.validate(),
            Err(ColorError::Configuration(_))
        ));
    }
}
