use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer};
use tracing::warn;

use crate::{Error, Result};

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
pub const DEFAULT_STATE_CHECK_INTERVAL_MS: u64 = 600_000;

/// Top-level configuration, immutable after load.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub hass_options: HubOptions,
    pub hvac_options: HvacOptions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubOptions {
    pub ws_url: String,
    /// Kept for config compatibility; the controller is WebSocket-only.
    #[serde(default)]
    pub rest_url: String,
    #[serde(default, alias = "token")]
    pub access_token: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(
        default = "default_state_check_interval_ms",
        alias = "state_check_interval"
    )]
    pub state_check_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HvacOptions {
    /// Indoor temperature sensor entity id.
    pub temp_sensor: String,
    #[serde(default)]
    pub system_mode: SystemMode,
    #[serde(default)]
    pub entities: Vec<Entity>,
    pub heating: HeatingParams,
    pub cooling: CoolingParams,
    pub active_hours: ActiveHours,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, alias = "defrost")]
    pub defrost_capable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeatingParams {
    pub setpoint_c: f64,
    pub preset_mode: String,
    pub thresholds: Thresholds,
    #[serde(default)]
    pub defrost: DefrostParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoolingParams {
    pub setpoint_c: f64,
    pub preset_mode: String,
    pub thresholds: Thresholds,
}

/// All bounds are inclusive and in degrees Celsius.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Thresholds {
    pub indoor_min: f64,
    pub indoor_max: f64,
    pub outdoor_min: f64,
    pub outdoor_max: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DefrostParams {
    pub temperature_threshold_c: f64,
    pub period_seconds: u64,
    pub duration_seconds: u64,
}

impl Default for DefrostParams {
    fn default() -> Self {
        Self {
            temperature_threshold_c: 0.0,
            period_seconds: 7200,
            duration_seconds: 300,
        }
    }
}

/// Hours during which the controller may command heating or cooling.
/// `start` applies on weekends, `start_weekday` on weekdays.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ActiveHours {
    pub start: u32,
    pub start_weekday: u32,
    #[serde(alias = "end")]
    pub end_hour: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemMode {
    HeatOnly,
    CoolOnly,
    #[default]
    Auto,
    Off,
}

impl SystemMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemMode::HeatOnly => "heat_only",
            SystemMode::CoolOnly => "cool_only",
            SystemMode::Auto => "auto",
            SystemMode::Off => "off",
        }
    }

    /// Unknown values fall back to `auto`.
    pub fn from_config_str(s: &str) -> Self {
        match s {
            "heat_only" => SystemMode::HeatOnly,
            "cool_only" => SystemMode::CoolOnly,
            "auto" => SystemMode::Auto,
            "off" => SystemMode::Off,
            other => {
                warn!(mode = other, "unknown system_mode, falling back to auto");
                SystemMode::Auto
            }
        }
    }
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SystemMode {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(SystemMode::from_config_str(&s))
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;

        if let Ok(token) = std::env::var("HASS_TOKEN")
            && !token.trim().is_empty()
        {
            config.hass_options.access_token = token.trim().to_string();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hass_options.ws_url.is_empty() {
            return Err(Error::Config("hass_options.ws_url is required".into()));
        }
        if self.hass_options.access_token.is_empty() {
            return Err(Error::Config(
                "hass_options.access_token is required (or set HASS_TOKEN)".into(),
            ));
        }
        if self.hvac_options.temp_sensor.is_empty() {
            return Err(Error::Config("hvac_options.temp_sensor is required".into()));
        }
        let hours = self.hvac_options.active_hours;
        for (name, hour) in [
            ("active_hours.start", hours.start),
            ("active_hours.start_weekday", hours.start_weekday),
            ("active_hours.end_hour", hours.end_hour),
        ] {
            if hour > 23 {
                return Err(Error::Config(format!("{name} must be 0-23, got {hour}")));
            }
        }
        for (name, th) in [
            ("heating", &self.hvac_options.heating.thresholds),
            ("cooling", &self.hvac_options.cooling.thresholds),
        ] {
            if th.indoor_min > th.indoor_max {
                return Err(Error::Config(format!(
                    "{name}.thresholds: indoor_min > indoor_max"
                )));
            }
            if th.outdoor_min > th.outdoor_max {
                return Err(Error::Config(format!(
                    "{name}.thresholds: outdoor_min > outdoor_max"
                )));
            }
        }
        Ok(())
    }

    /// Entities the controller actually drives.
    pub fn enabled_entities(&self) -> impl Iterator<Item = &Entity> {
        self.hvac_options.entities.iter().filter(|e| e.enabled)
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

fn default_state_check_interval_ms() -> u64 {
    DEFAULT_STATE_CHECK_INTERVAL_MS
}
