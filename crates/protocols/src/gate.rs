use chrono::{NaiveDate, NaiveTime, Utc};
use rand::Rng;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Delays execution until a schedule predicate is satisfied.
#[async_trait::async_trait]
pub trait Gate: Send + Sync {
    async fn wait_if_needed(&self);
}

#[derive(Debug, thiserror::Error)]
#[error("invalid time of day '{0}', expected HH:MM")]
pub struct InvalidTimeOfDay(String);

/// Blocks until the next occurrence of a wall-clock time.
///
/// Only UTC schedules are interpreted; other `tz` values fall back to UTC
/// with a warning.
pub struct ScheduledDailyGate {
    time_of_day: NaiveTime,
    startup_skip_if_already_today: bool,
    last_execution: Mutex<Option<NaiveDate>>,
}

impl ScheduledDailyGate {
    pub fn new(
        time_of_day: &str,
        tz: &str,
        startup_skip_if_already_today: bool,
    ) -> Result<Self, InvalidTimeOfDay> {
        let time_of_day = NaiveTime::parse_from_str(time_of_day, "%H:%M")
            .map_err(|_| InvalidTimeOfDay(time_of_day.to_string()))?;
        if !tz.eq_ignore_ascii_case("utc") {
            tracing::warn!(tz, "unsupported gate timezone, falling back to UTC");
        }
        Ok(Self {
            time_of_day,
            startup_skip_if_already_today,
            last_execution: Mutex::new(None),
        })
    }

    /// Seconds until the next occurrence of `time_of_day` after `now`.
    fn wait_duration(&self, now: chrono::DateTime<Utc>) -> Duration {
        let today_target = now.date_naive().and_time(self.time_of_day).and_utc();
        let target = if today_target <= now {
            today_target + chrono::Duration::days(1)
        } else {
            today_target
        };
        (target - now).to_std().unwrap_or(Duration::ZERO)
    }
}

#[async_trait::async_trait]
impl Gate for ScheduledDailyGate {
    async fn wait_if_needed(&self) {
        let now = Utc::now();
        let today = now.date_naive();

        let mut last = self.last_execution.lock().await;
        if self.startup_skip_if_already_today && *last == Some(today) {
            return;
        }

        let wait = self.wait_duration(now);
        if !wait.is_zero() {
            tracing::debug!(wait_secs = wait.as_secs(), "daily gate waiting");
            tokio::time::sleep(wait).await;
        }
        *last = Some(today);
    }
}

/// Keeps successive executions at least `interval` apart, plus uniform
/// random jitter in `[0, jitter]`.
pub struct OncePerIntervalGate {
    interval: Duration,
    jitter: Duration,
    last_execution: Mutex<Option<Instant>>,
}

impl OncePerIntervalGate {
    pub fn new(interval: Duration, jitter: Duration) -> Self {
        Self {
            interval,
            jitter,
            last_execution: Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl Gate for OncePerIntervalGate {
    async fn wait_if_needed(&self) {
        let mut last = self.last_execution.lock().await;
        if let Some(previous) = *last {
            let since = Instant::now().saturating_duration_since(previous);
            if since < self.interval {
                let mut wait = self.interval - since;
                if !self.jitter.is_zero() {
                    wait += Duration::from_secs_f64(
                        rand::thread_rng().gen_range(0.0..=self.jitter.as_secs_f64()),
                    );
                }
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn daily_gate_waits_until_target_time() {
        let gate = ScheduledDailyGate::new("06:30", "UTC", true).unwrap();

        let before = Utc.with_ymd_and_hms(2024, 3, 1, 5, 0, 0).unwrap();
        assert_eq!(gate.wait_duration(before), Duration::from_secs(90 * 60));

        let after = Utc.with_ymd_and_hms(2024, 3, 1, 7, 0, 0).unwrap();
        // Past today's slot: wait for tomorrow, including across month ends.
        assert_eq!(
            gate.wait_duration(after),
            Duration::from_secs(23 * 3600 + 30 * 60)
        );
    }

    #[test]
    fn daily_gate_rejects_bad_times() {
        assert!(ScheduledDailyGate::new("25:99", "UTC", true).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn interval_gate_spaces_executions() {
        let gate = OncePerIntervalGate::new(Duration::from_secs(60), Duration::ZERO);
        let started = Instant::now();
        gate.wait_if_needed().await;
        assert_eq!(started.elapsed(), Duration::ZERO);

        gate.wait_if_needed().await;
        assert!(started.elapsed() >= Duration::from_secs(60));
    }
}
