use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::distribution::RoomConfig;
use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Absent means the in-memory store.
    pub database_url: Option<String>,
    pub log_level: String,
    pub subscriber_buffer: usize,
    pub room_idle_secs: u64,
    pub telemetry_queue: usize,
    pub sse_keepalive_secs: u64,
    pub snapshot_retain: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv().is_ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let port = lookup("PORT").ok_or(ConfigError::Missing("PORT"))?;
        let port = parse("PORT", port)?;

        Ok(Self {
            host: lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            subscriber_buffer: parse_or(&lookup, "SUBSCRIBER_BUFFER", 16)?,
            room_idle_secs: parse_or(&lookup, "ROOM_IDLE_SECS", 300)?,
            telemetry_queue: parse_or(&lookup, "TELEMETRY_QUEUE", 256)?,
            sse_keepalive_secs: parse_or(&lookup, "SSE_KEEPALIVE_SECS", 15)?,
            snapshot_retain: parse_or(&lookup, "SNAPSHOT_RETAIN", 2)?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            subscriber_buffer: self.subscriber_buffer,
            idle_timeout: Duration::from_secs(self.room_idle_secs),
        }
    }

    pub fn sse_keepalive(&self) -> Duration {
        Duration::from_secs(self.sse_keepalive_secs)
    }
}

fn parse<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { key, value })
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => parse(key, value),
        None => Ok(default),
    }
}
