//! Artificial timing: pre-send delay, slow windows, and the reveal gate.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::FeatureConfiguration;
use crate::features::FeatureFlag;
use crate::settings::SettingKey;

/// Slowdown parameters snapshotted from the live configuration for one turn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingPolicy {
    enabled: bool,
    period_s: u64,
    window_s: u64,
    min_delay: Duration,
    permanent_after: Option<Duration>,
}

impl TimingPolicy {
    /// Session-control settings always resolve on the primary side.
    pub fn from_config(config: &FeatureConfiguration) -> Self {
        let permanent_after = config
            .toggle(SettingKey::SlowdownPermanentAfterEnabled)
            .then(|| secs(config.seconds(SettingKey::SlowdownPermanentAfterS)));
        Self {
            enabled: config.is_enabled(FeatureFlag::Slowdown),
            period_s: config.int(SettingKey::SlowdownPeriodS).max(1) as u64,
            window_s: config.int(SettingKey::SlowdownWindowS).max(0) as u64,
            min_delay: secs(config.seconds(SettingKey::SlowdownMinDelayS)),
            permanent_after,
        }
    }

    /// Cyclic window of `window_s` slow seconds after every `period_s` normal ones.
    pub fn in_slow_window(&self, elapsed: Duration) -> bool {
        if !self.enabled || self.window_s == 0 {
            return false;
        }
        let cycle = (self.period_s + self.window_s) as f64;
        elapsed.as_secs_f64() % cycle >= self.period_s as f64
    }

    pub fn permanent_active(&self, elapsed: Duration) -> bool {
        self.enabled && self.permanent_after.is_some_and(|after| elapsed >= after)
    }

    /// Decide the reveal deadline for a request sent at `send`.
    pub fn decide(&self, session_start: Instant, send: Instant) -> TimingDecision {
        let elapsed = send.saturating_duration_since(session_start);
        if self.permanent_active(elapsed) || self.in_slow_window(elapsed) {
            TimingDecision {
                earliest_reveal: send
                    .checked_add(self.min_delay)
                    .or_else(|| send.checked_add(MAX_SETTING_DELAY)),
            }
        } else {
            TimingDecision::immediate()
        }
    }
}

/// Reveal deadline for one turn; consumed by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingDecision {
    earliest_reveal: Option<Instant>,
}

impl TimingDecision {
    pub fn immediate() -> Self {
        Self {
            earliest_reveal: None,
        }
    }

    pub fn must_delay(&self) -> bool {
        self.earliest_reveal.is_some()
    }

    pub fn earliest_reveal(&self) -> Option<Instant> {
        self.earliest_reveal
    }

    /// Delay still pending at `now`; zero once the deadline has passed.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.earliest_reveal
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Run `action` once the reveal deadline has passed.
    pub async fn maybe_delay_then<F, T>(self, action: F) -> T
    where
        F: FnOnce() -> T,
    {
        if let Some(at) = self.earliest_reveal {
            if at > Instant::now() {
                tokio::time::sleep_until(at).await;
            }
        }
        action()
    }
}

/// Delay between accepting a message and requesting generation, if any.
pub fn pre_send_delay(config: &FeatureConfiguration) -> Option<Duration> {
    if !config.is_enabled(FeatureFlag::DelayBeforeSend) {
        return None;
    }
    let delay = secs(config.seconds(SettingKey::DelaySeconds));
    (!delay.is_zero()).then_some(delay)
}

/// Longest delay any setting can produce. Keeps `Instant` arithmetic in range.
pub const MAX_SETTING_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Seconds from config; negative and NaN values read as zero, huge ones as
/// [`MAX_SETTING_DELAY`].
pub(crate) fn secs(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value)
        .unwrap_or(MAX_SETTING_DELAY)
        .min(MAX_SETTING_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureSet;
    use crate::settings::SettingsTable;

    fn slowdown_config(settings: &[(&str, serde_json::Value)]) -> FeatureConfiguration {
        let mut table = SettingsTable::default();
        for (k, v) in settings {
            table.insert(*k, v.clone());
        }
        FeatureConfiguration::new(FeatureSet::all_disabled().with(FeatureFlag::Slowdown), table)
    }

    #[test]
    fn cyclic_window_follows_period_plus_window() {
        let policy = TimingPolicy::from_config(&slowdown_config(&[]));
        let at = |s| policy.in_slow_window(Duration::from_secs(s));

        assert!(!at(90));
        assert!(at(110));
        // Second cycle starts at 120: 219 is 99s in, 220 is 100s in.
        assert!(!at(219));
        assert!(at(220));
        assert!(!at(240));
    }

    #[test]
    fn zero_window_never_slows() {
        let policy =
            TimingPolicy::from_config(&slowdown_config(&[("slowdown_window_s", 0.into())]));
        assert!(!policy.in_slow_window(Duration::from_secs(110)));
    }

    #[test]
    fn period_is_floored_at_one() {
        let policy = TimingPolicy::from_config(&slowdown_config(&[
            ("slowdown_period_s", 0.into()),
            ("slowdown_window_s", 1.into()),
        ]));
        assert!(!policy.in_slow_window(Duration::from_millis(500)));
        assert!(policy.in_slow_window(Duration::from_millis(1500)));
    }

    #[test]
    fn slowdown_flag_gates_everything() {
        let config = FeatureConfiguration::new(FeatureSet::all_disabled(), SettingsTable::default());
        let policy = TimingPolicy::from_config(&config);
        assert!(!policy.in_slow_window(Duration::from_secs(110)));
        assert!(!policy.permanent_active(Duration::from_secs(10_000)));
    }

    #[test]
    fn permanent_slowdown_after_threshold() {
        let policy = TimingPolicy::from_config(&slowdown_config(&[
            ("slowdown_permanent_after_enabled", true.into()),
            ("slowdown_permanent_after_s", 30.into()),
            ("slowdown_window_s", 0.into()),
        ]));
        assert!(!policy.permanent_active(Duration::from_secs(29)));
        assert!(policy.permanent_active(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn decision_sets_deadline_from_send_time() {
        let policy = TimingPolicy::from_config(&slowdown_config(&[]));
        let start = Instant::now();

        let fast = policy.decide(start, start + Duration::from_secs(90));
        assert!(!fast.must_delay());
        assert_eq!(fast.earliest_reveal(), None);

        let send = start + Duration::from_secs(110);
        let slow = policy.decide(start, send);
        assert_eq!(slow.earliest_reveal(), Some(send + Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn gate_waits_out_the_remaining_delay() {
        let now = Instant::now();
        let decision = TimingDecision {
            earliest_reveal: Some(now + Duration::from_secs(4)),
        };
        assert_eq!(decision.remaining(now), Duration::from_secs(4));

        let revealed_at = decision.maybe_delay_then(Instant::now).await;
        assert!(revealed_at >= now + Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn gate_runs_immediately_when_deadline_passed() {
        let now = Instant::now();
        let decision = TimingDecision {
            earliest_reveal: Some(now),
        };
        tokio::time::advance(Duration::from_secs(1)).await;
        let before = Instant::now();
        let revealed_at = decision.maybe_delay_then(Instant::now).await;
        assert_eq!(revealed_at, before);
    }

    #[test]
    fn oversized_seconds_clamp_instead_of_panicking() {
        assert_eq!(secs(1e20), MAX_SETTING_DELAY);
        assert_eq!(secs(f64::INFINITY), MAX_SETTING_DELAY);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(-3.0), Duration::ZERO);
        assert_eq!(secs(1.5), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_min_delay_defers_by_the_ceiling() {
        let policy = TimingPolicy::from_config(&slowdown_config(&[
            ("slowdown_permanent_after_enabled", true.into()),
            ("slowdown_permanent_after_s", 0.into()),
            ("slowdown_min_delay_s", 1e20.into()),
        ]));
        let start = Instant::now();
        let decision = policy.decide(start, start);
        assert_eq!(decision.earliest_reveal(), Some(start + MAX_SETTING_DELAY));
    }

    #[test]
    fn pre_send_delay_requires_flag() {
        let off = FeatureConfiguration::new(FeatureSet::all_disabled(), SettingsTable::default());
        assert_eq!(pre_send_delay(&off), None);

        let on = FeatureConfiguration::new(
            FeatureSet::all_disabled().with(FeatureFlag::DelayBeforeSend),
            SettingsTable::default(),
        );
        assert_eq!(pre_send_delay(&on), Some(Duration::from_secs(2)));
    }
}
