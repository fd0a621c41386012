use std::collections::HashSet;
use std::fs;
use chrono::NaiveTime;
use chrono_tz::Tz;
use log::LevelFilter;
use serde::Deserialize;
use crate::device::Device;
use crate::errors::ConfigError;
use crate::tariffs::TariffRule;

#[derive(Deserialize)]
pub struct General {
    pub log_path: String,
    pub log_level: LevelFilter,
    pub log_to_stdout: bool,
}

#[derive(Deserialize)]
pub struct Files {
    pub backup_dir: String,
    pub price_dir: String,
    pub manual_file: String,
    pub reset_debt_file: String,
    pub snapshot_file: String,
    /// Where the device driver picks up the flat decision list, if set
    pub decisions_file: Option<String>,
    /// Open-Meteo hourly forecast for weather adjusted devices, if set
    pub forecast_file: Option<String>,
}

#[derive(Deserialize)]
pub struct PriceParameters {
    pub area: String,
    #[serde(default = "default_vat_rate")]
    pub vat_rate: f64,
    #[serde(default)]
    pub fixed_fees_per_kwh: f64,
    #[serde(default = "default_slot_minutes")]
    pub slot_minutes: i64,
    #[serde(default = "default_max_horizon_hours")]
    pub max_horizon_hours: i64,
    #[serde(default = "default_min_horizon_hours")]
    pub min_horizon_hours: i64,
}

#[derive(Deserialize)]
pub struct TariffParameters {
    pub timezone: Tz,
    pub provider: Option<String>,
    pub package: Option<String>,
    #[serde(default)]
    pub default_add_on: f64,
    #[serde(default)]
    pub rules: Vec<TariffRule>,
}

#[derive(Deserialize, Clone)]
pub struct SchedulingParameters {
    #[serde(default = "default_refresh_minutes")]
    pub refresh_minutes: i64,
    #[serde(default = "default_period_anchor")]
    pub period_anchor: String,
    #[serde(default = "default_max_debt_hours")]
    pub max_debt_hours: f64,
    #[serde(default)]
    pub max_credit_hours: f64,
    pub max_total_power_w: Option<f64>,
    #[serde(default = "default_event_log_size")]
    pub event_log_size: usize,
    #[serde(skip)]
    pub anchor: NaiveTime,
}

#[derive(Deserialize)]
pub struct Config {
    pub general: General,
    pub files: Files,
    pub prices: PriceParameters,
    pub tariff: TariffParameters,
    pub scheduling: SchedulingParameters,
    #[serde(default)]
    pub devices: Vec<Device>,
}

fn default_vat_rate() -> f64 { 1.0 }
fn default_slot_minutes() -> i64 { 15 }
fn default_max_horizon_hours() -> i64 { 48 }
fn default_min_horizon_hours() -> i64 { 1 }
fn default_refresh_minutes() -> i64 { 15 }
fn default_period_anchor() -> String { "22:00".to_string() }
fn default_max_debt_hours() -> f64 { 24.0 }
fn default_event_log_size() -> usize { 200 }

/// Loads the configuration file and returns a struct with all configuration items
///
/// # Arguments
///
/// * 'config_path' - path to the configuration file
pub fn load_config(config_path: &str) -> Result<Config, ConfigError> {
    let toml = fs::read_to_string(config_path)?;
    parse_config(&toml)
}

/// Parses and validates a configuration document
///
/// Problems with a single device are not reported here, such a device is instead
/// excluded at refresh time so that other devices are still scheduled.
///
/// # Arguments
///
/// * 'toml' - the configuration document
pub fn parse_config(toml: &str) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml)?;

    config.scheduling.anchor = NaiveTime::parse_from_str(&config.scheduling.period_anchor, "%H:%M")
        .map_err(|e| format!("period_anchor '{}': {}", config.scheduling.period_anchor, e))?;

    let slot_minutes = config.prices.slot_minutes;
    if slot_minutes <= 0 || 60 % slot_minutes != 0 {
        return Err(ConfigError::from(format!("slot_minutes must be a divisor of 60, got {}", slot_minutes)));
    }
    if config.prices.max_horizon_hours <= 0 {
        return Err(ConfigError::from("max_horizon_hours must be positive"));
    }
    if config.prices.min_horizon_hours > config.prices.max_horizon_hours {
        return Err(ConfigError::from("min_horizon_hours can't exceed max_horizon_hours"));
    }
    if config.prices.vat_rate <= 0.0 {
        return Err(ConfigError::from("vat_rate must be positive"));
    }
    if config.scheduling.refresh_minutes <= 0 {
        return Err(ConfigError::from("refresh_minutes must be positive"));
    }
    if config.scheduling.max_debt_hours < 0.0 || config.scheduling.max_credit_hours < 0.0 {
        return Err(ConfigError::from("debt and credit ceilings are magnitudes and can't be negative"));
    }

    let mut ids: HashSet<&str> = HashSet::new();
    for device in config.devices.iter() {
        if !ids.insert(device.id.as_str()) {
            return Err(ConfigError::from(format!("duplicate device id '{}'", device.id)));
        }
    }

    Ok(config)
}
