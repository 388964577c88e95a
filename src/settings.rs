use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Max number of intervals ever tracked in one session, whether or not they keep samples.
pub const MAX_INTERVAL_COUNT: usize = 100;

const ENV_PREFIX: &str = "WATCHDOG";

/// Thresholds and limits consumed by the detector and the sampler.
///
/// Values are read once at construction. Defaults match what a mobile client runs with in
/// production: a 100ms heartbeat, a 1s blockage threshold and room for 80 stack samples per
/// blockage.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub probe_interval_ms: u64,
    pub blocked_duration_threshold_ms: u64,
    /// Monitor lag after which the whole process is assumed to have been frozen.
    pub monitor_timeout_ms: u64,
    pub sample_backoff_factor: f64,
    pub max_intervals_per_session: usize,
    pub max_stacktraces_per_interval: usize,
    pub stacktrace_frame_limit: usize,
    pub max_intervals_hard_cap: usize,
    pub dedupe_consecutive_stacks: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 100,
            blocked_duration_threshold_ms: 1000,
            monitor_timeout_ms: 60_000,
            sample_backoff_factor: 0.5,
            max_intervals_per_session: 5,
            max_stacktraces_per_interval: 80,
            stacktrace_frame_limit: 200,
            max_intervals_hard_cap: MAX_INTERVAL_COUNT,
            dedupe_consecutive_stacks: false,
        }
    }
}

impl WatchdogConfig {
    /// Layers defaults, an optional TOML file and `WATCHDOG_*` environment variables, in that
    /// order of precedence.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let cfg: WatchdogConfig = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe_interval_ms == 0 {
            return Err(invalid("probe_interval_ms", "must be greater than zero"));
        }
        if self.blocked_duration_threshold_ms == 0 {
            return Err(invalid(
                "blocked_duration_threshold_ms",
                "must be greater than zero",
            ));
        }
        if self.monitor_timeout_ms <= self.blocked_duration_threshold_ms {
            return Err(invalid(
                "monitor_timeout_ms",
                format!(
                    "must exceed blocked_duration_threshold_ms ({})",
                    self.blocked_duration_threshold_ms
                ),
            ));
        }
        if !self.sample_backoff_factor.is_finite() || self.sample_backoff_factor < 0.0 {
            return Err(invalid(
                "sample_backoff_factor",
                format!("{} is not a finite, non-negative factor", self.sample_backoff_factor),
            ));
        }
        if self.max_stacktraces_per_interval == 0 {
            return Err(invalid(
                "max_stacktraces_per_interval",
                "must be greater than zero",
            ));
        }
        if self.stacktrace_frame_limit == 0 {
            return Err(invalid("stacktrace_frame_limit", "must be greater than zero"));
        }
        if self.max_intervals_per_session > self.max_intervals_hard_cap {
            return Err(invalid(
                "max_intervals_per_session",
                format!("must not exceed the hard cap of {}", self.max_intervals_hard_cap),
            ));
        }
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Minimum spacing between two monitor ticks for the second one to take a sample.
    pub fn sample_backoff_ms(&self) -> f64 {
        self.probe_interval_ms as f64 * self.sample_backoff_factor
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let cfg = WatchdogConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.max_stacktraces_per_interval, 80);
        assert_eq!(cfg.max_intervals_hard_cap, MAX_INTERVAL_COUNT);
        assert_eq!(cfg.sample_backoff_ms(), 50.0);
    }

    #[test]
    fn rejects_zero_probe_interval() {
        let cfg = WatchdogConfig {
            probe_interval_ms: 0,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "probe_interval_ms",
                ..
            }
        ));
    }

    #[test]
    fn rejects_soft_cap_above_hard_cap() {
        let cfg = WatchdogConfig {
            max_intervals_per_session: 101,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_monitor_timeout_below_threshold() {
        let cfg = WatchdogConfig {
            monitor_timeout_ms: 500,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_partial_toml_over_defaults() {
        let dir = std::env::temp_dir().join(format!("watchdog-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("watchdog.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "probe_interval_ms = 50").unwrap();
        writeln!(file, "max_intervals_per_session = 10").unwrap();
        drop(file);

        let cfg = WatchdogConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.probe_interval_ms, 50);
        assert_eq!(cfg.max_intervals_per_session, 10);
        assert_eq!(cfg.blocked_duration_threshold_ms, 1000);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
