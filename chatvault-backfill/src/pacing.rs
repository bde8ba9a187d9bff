//! Randomized per-message delays with a day/night profile.

use crate::config::{DelayRange, PacingConfig};
use crate::error::{BackfillError, BackfillResult};
use chatvault_types::ConversationKind;
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use rand::Rng;
use std::time::Duration;

/// Chooses how long to wait before handing over each recovered message.
#[derive(Clone, Debug)]
pub struct PacingPolicy {
    config: PacingConfig,
    tz: Tz,
}

impl PacingPolicy {
    pub fn new(config: PacingConfig) -> BackfillResult<Self> {
        let tz = config
            .timezone
            .parse::<Tz>()
            .map_err(|e| BackfillError::Config(format!("unknown timezone {}: {e}", config.timezone)))?;
        Ok(Self { config, tz })
    }

    /// Night is `[night_start_hour, night_end_hour)` in local time, wrapping
    /// past midnight when start > end.
    pub fn is_night(&self, at: DateTime<Utc>) -> bool {
        let hour = at.with_timezone(&self.tz).hour();
        let (start, end) = (self.config.night_start_hour, self.config.night_end_hour);
        if start == end {
            false
        } else if start < end {
            (start..end).contains(&hour)
        } else {
            hour >= start || hour < end
        }
    }

    fn range_for(&self, kind: ConversationKind) -> &DelayRange {
        match kind {
            ConversationKind::Chat => &self.config.chat,
            ConversationKind::Channel => &self.config.channel,
        }
    }

    /// `(min, max)` seconds that apply to `kind` at `at`.
    pub fn bounds(&self, kind: ConversationKind, at: DateTime<Utc>) -> (f64, f64) {
        let range = self.range_for(kind);
        if self.is_night(at) {
            (range.night_min_secs, range.night_max_secs)
        } else {
            (range.day_min_secs, range.day_max_secs)
        }
    }

    pub fn delay_at(&self, kind: ConversationKind, at: DateTime<Utc>) -> Duration {
        let (min, max) = self.bounds(kind, at);
        let secs = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    pub fn delay(&self, kind: ConversationKind) -> Duration {
        self.delay_at(kind, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy() -> PacingPolicy {
        PacingPolicy::new(PacingConfig::default()).unwrap()
    }

    #[test]
    fn moscow_night_wraps_midnight() {
        let p = policy();
        // 20:30 UTC = 23:30 MSK
        assert!(p.is_night(Utc.with_ymd_and_hms(2024, 5, 1, 20, 30, 0).unwrap()));
        // 02:00 UTC = 05:00 MSK
        assert!(p.is_night(Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap()));
        // 03:00 UTC = 06:00 MSK, night has ended
        assert!(!p.is_night(Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap()));
        // 12:00 UTC = 15:00 MSK
        assert!(!p.is_night(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
    }

    #[test]
    fn delays_stay_inside_bounds() {
        let p = policy();
        let noon = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        for _ in 0..100 {
            let d = p.delay_at(ConversationKind::Channel, noon).as_secs_f64();
            assert!((5.0..=10.0).contains(&d), "delay {d} out of range");
        }
        let night = Utc.with_ymd_and_hms(2024, 5, 1, 22, 0, 0).unwrap();
        for _ in 0..100 {
            let d = p.delay_at(ConversationKind::Chat, night).as_secs_f64();
            assert!((2.0..=6.0).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn zero_ranges_never_sleep() {
        let p = PacingPolicy::new(PacingConfig::immediate()).unwrap();
        assert_eq!(p.delay(ConversationKind::Chat), Duration::ZERO);
        assert_eq!(p.delay(ConversationKind::Channel), Duration::ZERO);
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let config = PacingConfig {
            timezone: "Mars/Olympus".into(),
            ..PacingConfig::default()
        };
        assert!(PacingPolicy::new(config).is_err());
    }
}
