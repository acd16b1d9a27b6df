use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default dedup cache capacity.
pub const DEDUP_CACHE_SIZE: usize = 10_000;
/// Default dedup cache TTL.
pub const DEDUP_CACHE_TTL: Duration = Duration::from_secs(3600);
/// How long processed-event rows are retained before the sweep removes them.
pub const EVENT_RETENTION: Duration = Duration::from_secs(24 * 3600);
/// Interval between cleanup sweeps.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
/// Platform API limit: calls per window.
pub const PLATFORM_RATE_LIMIT: usize = 30;
pub const PLATFORM_RATE_WINDOW: Duration = Duration::from_secs(60);
/// Generative backend limit: calls per window.
pub const BACKEND_RATE_LIMIT: usize = 10;
pub const BACKEND_RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct Config {
    pub slack_bot_token: String,
    pub slack_channel_id: String,
    pub slack_signing_secret: String,
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_temperature: f32,
    pub openai_max_tokens: u32,
    /// Local time of day for the daily post, "HH:MM".
    pub daily_word_time: String,
    /// IANA timezone name the daily time is interpreted in.
    pub timezone: String,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Optional thread ref that seeds the theme-thread setting at startup.
    pub theme_thread: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let slack_bot_token =
            env::var("SLACK_BOT_TOKEN").context("SLACK_BOT_TOKEN environment variable is required")?;

        let slack_channel_id = env::var("SLACK_CHANNEL_ID")
            .context("SLACK_CHANNEL_ID environment variable is required")?;

        let slack_signing_secret = env::var("SLACK_SIGNING_SECRET")
            .context("SLACK_SIGNING_SECRET environment variable is required")?;

        let openai_api_key =
            env::var("OPENAI_API_KEY").context("OPENAI_API_KEY environment variable is required")?;

        let openai_model = env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());

        let openai_temperature = env::var("OPENAI_TEMPERATURE")
            .unwrap_or_else(|_| "0.7".to_string())
            .parse::<f32>()
            .context("OPENAI_TEMPERATURE must be a valid number")?;

        let openai_max_tokens = env::var("OPENAI_MAX_TOKENS")
            .unwrap_or_else(|_| "300".to_string())
            .parse::<u32>()
            .context("OPENAI_MAX_TOKENS must be a valid number")?;

        let daily_word_time = parse_daily_time(env::var("DAILY_WORD_TIME").ok());

        let timezone = env::var("TIMEZONE").unwrap_or_else(|_| "America/New_York".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let theme_thread = env::var("THEME_THREAD")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Ok(Config {
            slack_bot_token,
            slack_channel_id,
            slack_signing_secret,
            openai_api_key,
            openai_model,
            openai_temperature,
            openai_max_tokens,
            daily_word_time,
            timezone,
            port,
            state_dir,
            theme_thread,
        })
    }
}

/// Parse DAILY_WORD_TIME from an optional string value.
///
/// Falls back to "09:00" when the value is missing or not a valid "HH:MM".
pub fn parse_daily_time(value: Option<String>) -> String {
    const DEFAULT: &str = "09:00";

    let Some(value) = value else {
        return DEFAULT.to_string();
    };

    if is_valid_daily_time(&value) {
        value
    } else {
        tracing::warn!(
            "Invalid DAILY_WORD_TIME format: {}, using default {}",
            value,
            DEFAULT
        );
        DEFAULT.to_string()
    }
}

fn is_valid_daily_time(value: &str) -> bool {
    let Some((hours, minutes)) = value.split_once(':') else {
        return false;
    };
    let Ok(hours) = hours.parse::<u8>() else {
        return false;
    };
    let Ok(minutes) = minutes.parse::<u8>() else {
        return false;
    };
    hours < 24 && minutes < 60 && !value.contains(' ')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_daily_time_none() {
        assert_eq!(parse_daily_time(None), "09:00");
    }

    #[test]
    fn test_parse_daily_time_valid() {
        assert_eq!(parse_daily_time(Some("18:30".to_string())), "18:30");
        assert_eq!(parse_daily_time(Some("0:05".to_string())), "0:05");
    }

    #[test]
    fn test_parse_daily_time_invalid() {
        assert_eq!(parse_daily_time(Some("25:00".to_string())), "09:00");
        assert_eq!(parse_daily_time(Some("12:60".to_string())), "09:00");
        assert_eq!(parse_daily_time(Some("noonish".to_string())), "09:00");
        assert_eq!(parse_daily_time(Some("".to_string())), "09:00");
    }
}
