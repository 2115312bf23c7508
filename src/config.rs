use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

use crate::sources::invidious::DEFAULT_INSTANCES;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // Para comandos de desarrollo

    // Audio
    pub default_volume: f32,
    pub max_queue_size: usize,
    pub max_playlist_size: usize,

    // Sesiones
    #[serde(with = "humantime_serde_compat")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde_compat")]
    pub resolve_timeout: Duration,
    #[serde(with = "humantime_serde_compat")]
    pub recommend_timeout: Duration,
    pub resolver_concurrency: usize,
    pub max_resolve_failures: u8,

    // Autoplay
    pub enable_autoplay: bool,
    pub autoplay_buffer_depth: usize,
    pub autoplay_seed_count: usize,
    pub autoplay_recency_decay: f32,
    pub history_limit: usize,
    pub invidious_instances: Vec<String>,
}

/// The part of the configuration the playback core needs. Constructible
/// without Discord credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSettings {
    pub idle_timeout: Duration,
    pub resolve_timeout: Duration,
    pub recommend_timeout: Duration,
    pub max_resolve_failures: u8,
    pub max_queue_size: usize,
    pub max_playlist_size: usize,
    pub autoplay_by_default: bool,
    pub autoplay_buffer_depth: usize,
    pub autoplay_seed_count: usize,
    pub autoplay_recency_decay: f32,
    pub history_limit: usize,
    pub default_volume: f32,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300), // 5 minutos
            resolve_timeout: Duration::from_secs(10),
            recommend_timeout: Duration::from_secs(10),
            max_resolve_failures: 3,
            max_queue_size: 1000,
            max_playlist_size: 100,
            autoplay_by_default: false,
            autoplay_buffer_depth: 3,
            autoplay_seed_count: 3,
            autoplay_recency_decay: 1.0,
            history_limit: 50,
            default_volume: 0.5,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN").context("DISCORD_TOKEN no definido")?,
            application_id: std::env::var("APPLICATION_ID")
                .context("APPLICATION_ID no definido")?
                .parse()?,
            guild_id: std::env::var("GUILD_ID").ok().and_then(|s| s.parse().ok()),

            // Audio
            default_volume: env_or("DEFAULT_VOLUME", defaults.default_volume)?,
            max_queue_size: env_or("MAX_QUEUE_SIZE", defaults.max_queue_size)?,
            max_playlist_size: env_or("MAX_PLAYLIST_SIZE", defaults.max_playlist_size)?,

            // Sesiones
            idle_timeout: env_duration_or("IDLE_TIMEOUT", defaults.idle_timeout)?,
            resolve_timeout: env_duration_or("RESOLVE_TIMEOUT", defaults.resolve_timeout)?,
            recommend_timeout: env_duration_or("RECOMMEND_TIMEOUT", defaults.recommend_timeout)?,
            resolver_concurrency: env_or("RESOLVER_CONCURRENCY", defaults.resolver_concurrency)?,
            max_resolve_failures: env_or("MAX_RESOLVE_FAILURES", defaults.max_resolve_failures)?,

            // Autoplay
            enable_autoplay: env_or("ENABLE_AUTOPLAY", defaults.enable_autoplay)?,
            autoplay_buffer_depth: env_or("AUTOPLAY_BUFFER_DEPTH", defaults.autoplay_buffer_depth)?,
            autoplay_seed_count: env_or("AUTOPLAY_SEED_COUNT", defaults.autoplay_seed_count)?,
            autoplay_recency_decay: env_or("AUTOPLAY_RECENCY_DECAY", defaults.autoplay_recency_decay)?,
            history_limit: env_or("HISTORY_LIMIT", defaults.history_limit)?,
            invidious_instances: match std::env::var("INVIDIOUS_INSTANCES") {
                Ok(val) if !val.trim().is_empty() => parse_list(&val),
                _ => defaults.invidious_instances,
            },
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// Catches zero-sized limits and out-of-range tuning values before the
    /// bot starts accepting commands.
    pub fn validate(&self) -> Result<()> {
        if self.default_volume < 0.0 || self.default_volume > 2.0 {
            anyhow::bail!("Default volume must be between 0.0 and 2.0, got: {}", self.default_volume);
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.guild_id == Some(0) {
            anyhow::bail!("GUILD_ID must be non-zero");
        }

        if self.resolver_concurrency == 0 {
            anyhow::bail!("Resolver concurrency must be greater than 0");
        }

        if self.max_resolve_failures == 0 {
            anyhow::bail!("Max resolve failures must be greater than 0");
        }

        if self.idle_timeout.is_zero() || self.resolve_timeout.is_zero() || self.recommend_timeout.is_zero() {
            anyhow::bail!("Timeouts must be greater than 0");
        }

        if self.autoplay_buffer_depth == 0 || self.autoplay_seed_count == 0 || self.history_limit == 0 {
            anyhow::bail!("Autoplay buffer depth, seed count and history limit must be greater than 0");
        }

        if !(self.autoplay_recency_decay > 0.0) {
            anyhow::bail!("Autoplay recency decay must be positive, got: {}", self.autoplay_recency_decay);
        }

        Ok(())
    }

    /// Projects the settings the playback core consumes.
    pub fn player_settings(&self) -> PlayerSettings {
        PlayerSettings {
            idle_timeout: self.idle_timeout,
            resolve_timeout: self.resolve_timeout,
            recommend_timeout: self.recommend_timeout,
            max_resolve_failures: self.max_resolve_failures,
            max_queue_size: self.max_queue_size,
            max_playlist_size: self.max_playlist_size,
            autoplay_by_default: self.enable_autoplay,
            autoplay_buffer_depth: self.autoplay_buffer_depth,
            autoplay_seed_count: self.autoplay_seed_count,
            autoplay_recency_decay: self.autoplay_recency_decay,
            history_limit: self.history_limit,
            default_volume: self.default_volume,
        }
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Excludes the token.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: App ID {} (Guild: {})\n  \
            Audio: {}% vol, {} queue, {} playlist\n  \
            Sessions: idle {}, resolve {} x{}, recommend {}, {} retries\n  \
            Autoplay: {} (buffer {}, seeds {}, decay {}, history {})",
            self.application_id,
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            (self.default_volume * 100.0) as u32,
            self.max_queue_size,
            self.max_playlist_size,
            humantime::format_duration(self.idle_timeout),
            humantime::format_duration(self.resolve_timeout),
            self.resolver_concurrency,
            humantime::format_duration(self.recommend_timeout),
            self.max_resolve_failures,
            self.enable_autoplay,
            self.autoplay_buffer_depth,
            self.autoplay_seed_count,
            self.autoplay_recency_decay,
            self.history_limit,
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        let player = PlayerSettings::default();
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,

            default_volume: player.default_volume,
            max_queue_size: player.max_queue_size,
            max_playlist_size: player.max_playlist_size,

            idle_timeout: player.idle_timeout,
            resolve_timeout: player.resolve_timeout,
            recommend_timeout: player.recommend_timeout,
            resolver_concurrency: 3,
            max_resolve_failures: player.max_resolve_failures,

            enable_autoplay: player.autoplay_by_default,
            autoplay_buffer_depth: player.autoplay_buffer_depth,
            autoplay_seed_count: player.autoplay_seed_count,
            autoplay_recency_decay: player.autoplay_recency_decay,
            history_limit: player.history_limit,
            invidious_instances: DEFAULT_INSTANCES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => val
            .trim()
            .parse()
            .with_context(|| format!("{} inválido: {}", key, val)),
        _ => Ok(default),
    }
}

fn env_duration_or(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => parse_duration(&val).with_context(|| format!("{} inválido: {}", key, val)),
        _ => Ok(default),
    }
}

/// Acepta "5m", "10s" o segundos sueltos ("300")
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    Ok(humantime::parse_duration(value)?)
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Serializa duraciones como texto humantime ("5m")
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("300").unwrap(), Duration::from_secs(300));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(
            parse_list(" https://a.example/, ,https://b.example "),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.player_settings(), PlayerSettings::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.resolver_concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.autoplay_recency_decay = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.default_volume = 3.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialized_durations_are_human_readable() {
        let json = serde_json::to_value(Config::default()).unwrap();
        assert_eq!(json["idle_timeout"], "5m");
        let back: Config = serde_json::from_value(json).unwrap();
        assert_eq!(back.idle_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_summary_hides_token() {
        let mut config = Config::default();
        config.discord_token = "super-secret".to_string();
        assert!(!config.summary().contains("super-secret"));
    }
}
