//! TTL adapter configuration.
//!
//! The adapter reads a JSON file of the shape
//! `{"adapter": {"ttlrefreshtime": "24h", "ttlrefreshvalue": "48h",
//! "ttldefaultvalue": "240h"}}`. All three durations are required and must
//! be non-zero.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Missing(&'static str),
    BadDuration(&'static str, humantime::DurationError),
    Zero(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "cannot read config: {err}"),
            ConfigError::Json(err) => write!(f, "cannot parse config: {err}"),
            ConfigError::Missing(field) => write!(f, "config field {field} is required"),
            ConfigError::BadDuration(field, err) => {
                write!(f, "config field {field} is not a duration: {err}")
            }
            ConfigError::Zero(field) => write!(f, "config field {field} must be non-zero"),
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    adapter: AdapterSection,
}

#[derive(Deserialize)]
struct AdapterSection {
    ttlrefreshtime: Option<String>,
    ttlrefreshvalue: Option<String>,
    ttldefaultvalue: Option<String>,
}

/// The three TTL policy knobs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TtlConfig {
    /// Blocks whose remaining TTL is at least this long are not refreshed.
    pub refresh_time: Duration,
    /// TTL written when a block is refreshed.
    pub refresh_value: Duration,
    /// TTL applied to newly inserted blocks.
    pub default_value: Duration,
}

impl TtlConfig {
    pub fn new(
        refresh_time: Duration,
        refresh_value: Duration,
        default_value: Duration,
    ) -> Result<Self, ConfigError> {
        if refresh_time.is_zero() {
            return Err(ConfigError::Zero("ttlrefreshtime"));
        }
        if refresh_value.is_zero() {
            return Err(ConfigError::Zero("ttlrefreshvalue"));
        }
        if default_value.is_zero() {
            return Err(ConfigError::Zero("ttldefaultvalue"));
        }
        Ok(Self { refresh_time, refresh_value, default_value })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(text).map_err(ConfigError::Json)?;
        let refresh_time = parse_field(file.adapter.ttlrefreshtime, "ttlrefreshtime")?;
        let refresh_value = parse_field(file.adapter.ttlrefreshvalue, "ttlrefreshvalue")?;
        let default_value = parse_field(file.adapter.ttldefaultvalue, "ttldefaultvalue")?;
        Self::new(refresh_time, refresh_value, default_value)
    }
}

fn parse_field(value: Option<String>, field: &'static str) -> Result<Duration, ConfigError> {
    let text = value.ok_or(ConfigError::Missing(field))?;
    humantime::parse_duration(&text).map_err(|err| ConfigError::BadDuration(field, err))
}
