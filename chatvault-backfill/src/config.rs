//! Engine configuration.
//!
//! Values come from [`BackfillConfig::default`], optionally overlaid with
//! `CHATVAULT_*` environment variables via [`BackfillConfig::from_env`].

use crate::error::{BackfillError, BackfillResult};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Uniform delay bounds in seconds for one kind of conversation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DelayRange {
    pub day_min_secs: f64,
    pub day_max_secs: f64,
    pub night_min_secs: f64,
    pub night_max_secs: f64,
}

impl DelayRange {
    /// A range that never sleeps.
    pub const fn zero() -> Self {
        Self {
            day_min_secs: 0.0,
            day_max_secs: 0.0,
            night_min_secs: 0.0,
            night_max_secs: 0.0,
        }
    }

    fn validate(&self, label: &str) -> BackfillResult<()> {
        let bounds = [
            self.day_min_secs,
            self.day_max_secs,
            self.night_min_secs,
            self.night_max_secs,
        ];
        if bounds.iter().any(|b| !b.is_finite() || *b < 0.0) {
            return Err(BackfillError::Config(format!(
                "{label} delays must be finite and non-negative"
            )));
        }
        if self.day_min_secs > self.day_max_secs || self.night_min_secs > self.night_max_secs {
            return Err(BackfillError::Config(format!(
                "{label} delay range is inverted: require min <= max"
            )));
        }
        Ok(())
    }
}

/// Human-scale pacing between recovered messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PacingConfig {
    /// IANA timezone used to decide day vs. night.
    pub timezone: String,
    /// Local hour at which night begins (inclusive).
    pub night_start_hour: u32,
    /// Local hour at which night ends (exclusive).
    pub night_end_hour: u32,
    pub chat: DelayRange,
    pub channel: DelayRange,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            timezone: "Europe/Moscow".to_string(),
            night_start_hour: 22,
            night_end_hour: 6,
            chat: DelayRange {
                day_min_secs: 1.0,
                day_max_secs: 3.0,
                night_min_secs: 2.0,
                night_max_secs: 6.0,
            },
            channel: DelayRange {
                day_min_secs: 5.0,
                day_max_secs: 10.0,
                night_min_secs: 10.0,
                night_max_secs: 20.0,
            },
        }
    }
}

impl PacingConfig {
    /// Pacing that never sleeps, for tests and bulk imports.
    pub fn immediate() -> Self {
        Self {
            chat: DelayRange::zero(),
            channel: DelayRange::zero(),
            ..Self::default()
        }
    }
}

/// Configuration for the backfill scheduler and gap detector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Sleep between scheduler cycles; also the activity window (seconds).
    pub idle_interval_secs: u64,
    /// Live messages tolerated inside the window before a cycle is skipped.
    pub activity_threshold: usize,
    /// Messages requested per source call.
    pub batch_size: usize,
    /// Added to every rate-limit wait (seconds).
    pub rate_limit_padding_secs: u64,
    /// Upper bound on a single rate-limit sleep (seconds).
    pub max_backoff_secs: u64,
    /// Rate-limit retries per unit of work before deferring it to the next cycle.
    pub max_rate_limit_retries: u32,
    /// Messages older than this are not recovered. 0 = unbounded.
    pub max_age_days: u32,
    /// Period of the gap reconciliation loop (seconds).
    pub gap_scan_interval_secs: u64,
    pub pacing: PacingConfig,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            idle_interval_secs: 10,
            activity_threshold: 0,
            batch_size: 50,
            rate_limit_padding_secs: 60,
            max_backoff_secs: 300,
            max_rate_limit_retries: 3,
            max_age_days: 0,
            gap_scan_interval_secs: 1800,
            pacing: PacingConfig::default(),
        }
    }
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_f64(var: &str, fallback: f64) -> f64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<f64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn overlay_delays(prefix: &str, range: &mut DelayRange) {
    range.day_min_secs = env_or_f64(&format!("{prefix}_DELAY_MIN_DAY"), range.day_min_secs);
    range.day_max_secs = env_or_f64(&format!("{prefix}_DELAY_MAX_DAY"), range.day_max_secs);
    range.night_min_secs = env_or_f64(&format!("{prefix}_DELAY_MIN_NIGHT"), range.night_min_secs);
    range.night_max_secs = env_or_f64(&format!("{prefix}_DELAY_MAX_NIGHT"), range.night_max_secs);
}

impl BackfillConfig {
    /// Defaults overlaid with `CHATVAULT_*` environment variables, validated.
    pub fn from_env() -> BackfillResult<Self> {
        let mut cfg = Self::default();
        cfg.idle_interval_secs = env_or_u64("CHATVAULT_IDLE_INTERVAL_SECS", cfg.idle_interval_secs);
        cfg.activity_threshold =
            env_or_u64("CHATVAULT_ACTIVITY_THRESHOLD", cfg.activity_threshold as u64) as usize;
        cfg.batch_size = env_or_u64("CHATVAULT_BATCH_SIZE", cfg.batch_size as u64) as usize;
        cfg.rate_limit_padding_secs =
            env_or_u64("CHATVAULT_RATE_LIMIT_PADDING_SECS", cfg.rate_limit_padding_secs);
        cfg.max_backoff_secs = env_or_u64("CHATVAULT_MAX_BACKOFF_SECS", cfg.max_backoff_secs);
        cfg.max_rate_limit_retries = env_or_u64(
            "CHATVAULT_MAX_RATE_LIMIT_RETRIES",
            cfg.max_rate_limit_retries as u64,
        ) as u32;
        cfg.max_age_days = env_or_u64("CHATVAULT_MAX_AGE_DAYS", cfg.max_age_days as u64) as u32;
        cfg.gap_scan_interval_secs =
            env_or_u64("CHATVAULT_GAP_SCAN_INTERVAL_SECS", cfg.gap_scan_interval_secs);

        cfg.pacing.timezone = env_or_string("CHATVAULT_TIMEZONE", &cfg.pacing.timezone);
        cfg.pacing.night_start_hour =
            env_or_u64("CHATVAULT_NIGHT_START_HOUR", cfg.pacing.night_start_hour as u64) as u32;
        cfg.pacing.night_end_hour =
            env_or_u64("CHATVAULT_NIGHT_END_HOUR", cfg.pacing.night_end_hour as u64) as u32;
        overlay_delays("CHATVAULT_CHAT", &mut cfg.pacing.chat);
        overlay_delays("CHATVAULT_CHANNEL", &mut cfg.pacing.channel);

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> BackfillResult<()> {
        if self.idle_interval_secs == 0 {
            return Err(BackfillError::Config(
                "idle interval must be >= 1 second".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(BackfillError::Config("batch size must be >= 1".to_string()));
        }
        if self.gap_scan_interval_secs == 0 {
            return Err(BackfillError::Config(
                "gap scan interval must be >= 1 second".to_string(),
            ));
        }
        if self.pacing.night_start_hour >= 24 || self.pacing.night_end_hour >= 24 {
            return Err(BackfillError::Config(
                "night hours must be in 0..24".to_string(),
            ));
        }
        if self.pacing.timezone.parse::<Tz>().is_err() {
            return Err(BackfillError::Config(format!(
                "unknown timezone: {}",
                self.pacing.timezone
            )));
        }
        self.pacing.chat.validate("chat")?;
        self.pacing.channel.validate("channel")?;
        Ok(())
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs)
    }

    pub fn gap_scan_interval(&self) -> Duration {
        Duration::from_secs(self.gap_scan_interval_secs)
    }

    /// Sleep for a rate-limit signal: `min(wait + padding, max_backoff)`.
    pub fn backoff_for(&self, signaled: Duration) -> Duration {
        let padded = signaled.saturating_add(Duration::from_secs(self.rate_limit_padding_secs));
        padded.min(Duration::from_secs(self.max_backoff_secs))
    }

    /// Oldest eligible message age, if a cutoff is configured.
    pub fn max_age(&self) -> Option<chrono::Duration> {
        (self.max_age_days > 0).then(|| chrono::Duration::days(self.max_age_days as i64))
    }
}
