//! Background loops: the daily word post and the processed-event sweep.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, TimeZone, Utc};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info};

use crate::repository::Resolution;
use crate::workflow::{self, PostOutcome};
use crate::AppState;

/// The configured local time of day the daily post fires at.
#[derive(Debug, Clone, Copy)]
pub struct DailySchedule {
    hour: u32,
    minute: u32,
    tz: chrono_tz::Tz,
}

impl DailySchedule {
    /// Parse an "HH:MM" time and an IANA timezone name.
    pub fn parse(daily_time: &str, timezone: &str) -> Result<Self> {
        let (hour, minute) = daily_time
            .split_once(':')
            .context("daily time must be HH:MM")?;
        let hour: u32 = hour.parse().context("daily time hour must be a number")?;
        let minute: u32 = minute
            .parse()
            .context("daily time minute must be a number")?;
        anyhow::ensure!(hour < 24 && minute < 60, "daily time out of range");

        let tz: chrono_tz::Tz = timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("unknown timezone {}: {}", timezone, e))?;

        Ok(Self { hour, minute, tz })
    }

    /// Time to sleep until the next occurrence of the configured local time.
    pub fn duration_until_next(&self, now: DateTime<Utc>) -> Duration {
        let local_now = now.with_timezone(&self.tz);
        let today = local_now.date_naive();

        // Scanning a couple of days covers DST transitions where the
        // configured time does not exist on a given date.
        for days_ahead in 0..=2u64 {
            let date = today + chrono::Days::new(days_ahead);
            let candidate = self
                .tz
                .with_ymd_and_hms(
                    date.year(),
                    date.month(),
                    date.day(),
                    self.hour,
                    self.minute,
                    0,
                )
                .earliest();

            if let Some(candidate) = candidate {
                if candidate > local_now {
                    return (candidate - local_now).to_std().unwrap_or(Duration::ZERO);
                }
            }
        }

        Duration::from_secs(24 * 3600)
    }
}

/// One daily tick: post a new word unless the system is dormant awaiting a
/// response to the last one.
pub async fn run_daily_tick(state: &AppState) {
    info!("Daily word scheduling check initiated");

    match state.repository.latest_resolution().await {
        Ok(Some(Resolution::Pending)) => {
            info!("System dormant: waiting for user response to last word");
        }
        Ok(_) => match workflow::post_new_word(state).await {
            Ok(PostOutcome::Posted(entry)) => {
                info!("Successfully posted daily word '{}'", entry.word);
            }
            Ok(PostOutcome::Waiting) => {
                info!("Daily tick found a pending word; nothing to post");
            }
            Err(e) => {
                error!("Failed to post daily word: {:#}", e);
            }
        },
        Err(e) => {
            error!("Daily tick could not read history: {}", e);
        }
    }
}

/// Post the first word at process start when history is empty.
pub async fn run_startup_check(state: &AppState) {
    match state.repository.count_words().await {
        Ok(0) => {
            info!("No words in history, posting the first word");
            run_daily_tick(state).await;
        }
        Ok(_) => {}
        Err(e) => error!("Startup check could not read history: {}", e),
    }
}

/// Fire the daily post at the configured local time until shutdown.
pub async fn daily_post_loop(
    state: Arc<AppState>,
    schedule: DailySchedule,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let wait = schedule.duration_until_next(Utc::now());
        info!(
            "Next daily word post in {:.0} minutes",
            wait.as_secs_f64() / 60.0
        );

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                run_daily_tick(&state).await;
            }
            _ = shutdown.changed() => {
                info!("Daily post loop stopping");
                return;
            }
        }
    }
}

/// Periodically purge processed-event rows past the retention window.
pub async fn cleanup_loop(
    state: Arc<AppState>,
    sweep_interval: Duration,
    retention: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(sweep_interval);
    // The immediate first tick would sweep at startup; skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match state.dedup.purge_older_than(retention).await {
                    Ok(removed) if removed > 0 => {
                        info!("Cleanup sweep removed {} processed events", removed);
                    }
                    Ok(_) => {}
                    Err(e) => error!("Cleanup sweep failed: {}", e),
                }
            }
            _ = shutdown.changed() => {
                info!("Cleanup loop stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_valid_schedule() {
        let schedule = DailySchedule::parse("09:00", "America/New_York").unwrap();
        assert_eq!(schedule.hour, 9);
        assert_eq!(schedule.minute, 0);
    }

    #[test]
    fn parse_rejects_bad_inputs() {
        assert!(DailySchedule::parse("25:00", "UTC").is_err());
        assert!(DailySchedule::parse("09:61", "UTC").is_err());
        assert!(DailySchedule::parse("nine", "UTC").is_err());
        assert!(DailySchedule::parse("09:00", "Atlantis/Lost_City").is_err());
    }

    #[test]
    fn next_occurrence_later_today() {
        let schedule = DailySchedule::parse("09:00", "UTC").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        assert_eq!(
            schedule.duration_until_next(now),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn next_occurrence_rolls_to_tomorrow() {
        let schedule = DailySchedule::parse("09:00", "UTC").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        assert_eq!(
            schedule.duration_until_next(now),
            Duration::from_secs(23 * 3600)
        );
    }

    #[test]
    fn exact_scheduled_instant_waits_a_full_day() {
        let schedule = DailySchedule::parse("09:00", "UTC").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        assert_eq!(
            schedule.duration_until_next(now),
            Duration::from_secs(24 * 3600)
        );
    }

    #[test]
    fn respects_timezone_offset() {
        // 13:00 UTC is 09:00 in New York (EDT, UTC-4) on this date.
        let schedule = DailySchedule::parse("09:00", "America/New_York").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(
            schedule.duration_until_next(now),
            Duration::from_secs(3600)
        );
    }
}
