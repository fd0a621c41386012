use std::fmt;
use std::fmt::Formatter;
use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use crate::errors::SchedulingError;

/// How a device's runtime is decided
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    /// Fixed hours per period during the cheapest slots
    Period,
    /// Every slot at or below a price threshold
    Threshold,
}

/// Implementation of the Display Trait for pretty print
impl fmt::Display for ScheduleMode {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ScheduleMode::Period    => write!(f, "Period   "),
            ScheduleMode::Threshold => write!(f, "Threshold"),
        }
    }
}

/// A controlled load as given in the configuration
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Device {
    pub id: String,
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub mode: ScheduleMode,
    #[serde(default)]
    pub required_hours: f64,
    #[serde(default = "default_period_hours")]
    pub period_hours: u32,
    /// Effective price per kWh, same unit as the price table
    pub threshold_price: Option<f64>,
    pub max_hours_per_period: Option<f64>,
    /// Lower value means higher priority
    #[serde(default = "default_priority")]
    pub priority: u32,
    pub max_concurrent_others: Option<usize>,
    #[serde(default)]
    pub estimated_power_w: f64,
    pub min_price_rank: Option<f64>,
    pub max_price_rank: Option<f64>,
    pub always_on_hours: Option<String>,
    pub always_off_hours: Option<String>,
    /// Slots with an effective price per kWh below this are forced on. The unit is the
    /// price table's (e.g. €/kWh), not cents.
    pub always_on_price: Option<f64>,
    pub max_debt_hours: Option<f64>,
    pub max_credit_hours: Option<f64>,
    /// Raise required_hours from the temperature forecast using a heating curve
    #[serde(default)]
    pub weather_adjustment: bool,
    /// Heating curve offset, -4 to 8
    #[serde(default)]
    pub heating_curve: f64,
    #[serde(default = "default_power_factor")]
    pub power_factor: f64,
}

fn default_enabled() -> bool { true }
fn default_period_hours() -> u32 { 24 }
fn default_priority() -> u32 { 100 }
fn default_power_factor() -> f64 { 0.5 }

/// No heating is needed at or above this apparent temperature
const HEATING_MAX_TEMP: f64 = 16.0;

impl Device {
    /// Creates a device with default settings
    ///
    /// # Arguments
    ///
    /// * 'id' - unique device id
    /// * 'mode' - schedule mode
    #[cfg(test)]
    pub fn new(id: &str, mode: ScheduleMode) -> Device {
        Device {
            id: id.to_string(),
            name: None,
            enabled: true,
            mode,
            required_hours: 0.0,
            period_hours: default_period_hours(),
            threshold_price: None,
            max_hours_per_period: None,
            priority: default_priority(),
            max_concurrent_others: None,
            estimated_power_w: 0.0,
            min_price_rank: None,
            max_price_rank: None,
            always_on_hours: None,
            always_off_hours: None,
            always_on_price: None,
            max_debt_hours: None,
            max_credit_hours: None,
            weather_adjustment: false,
            heating_curve: 0.0,
            power_factor: default_power_factor(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn period_length(&self) -> TimeDelta {
        TimeDelta::hours(self.period_hours as i64)
    }

    /// Checks the device configuration for the selected mode
    pub fn validate(&self) -> Result<(), SchedulingError> {
        if self.period_hours == 0 {
            return Err(SchedulingError::invalid_config(&self.id, "period_hours must be positive"));
        }
        if !self.required_hours.is_finite() || self.required_hours < 0.0 {
            return Err(SchedulingError::invalid_config(&self.id, "required_hours must be zero or positive"));
        }
        if self.required_hours > self.period_hours as f64 {
            return Err(SchedulingError::invalid_config(&self.id,
                format!("required_hours ({}) exceeds period_hours ({})", self.required_hours, self.period_hours)));
        }
        if self.mode == ScheduleMode::Threshold && self.threshold_price.is_none_or(|p| !p.is_finite()) {
            return Err(SchedulingError::invalid_config(&self.id, "threshold mode needs threshold_price"));
        }
        if self.max_hours_per_period.is_some_and(|h| !h.is_finite() || h < 0.0) {
            return Err(SchedulingError::invalid_config(&self.id, "max_hours_per_period must be zero or positive"));
        }
        for rank in [self.min_price_rank, self.max_price_rank].into_iter().flatten() {
            if !(0.0..=100.0).contains(&rank) {
                return Err(SchedulingError::invalid_config(&self.id, "price ranks are percentiles 0 - 100"));
            }
        }
        if self.max_debt_hours.is_some_and(|h| h < 0.0) || self.max_credit_hours.is_some_and(|h| h < 0.0) {
            return Err(SchedulingError::invalid_config(&self.id, "debt and credit ceilings can't be negative"));
        }
        if self.weather_adjustment {
            if self.mode != ScheduleMode::Period {
                return Err(SchedulingError::invalid_config(&self.id, "weather adjustment needs period mode"));
            }
            if !(-4.0..=8.0).contains(&self.heating_curve) {
                return Err(SchedulingError::invalid_config(&self.id, "heating_curve must be within -4 - 8"));
            }
            if !self.power_factor.is_finite() {
                return Err(SchedulingError::invalid_config(&self.id, "power_factor must be a number"));
            }
        }
        self.always_on_hours()?;
        self.always_off_hours()?;

        Ok(())
    }

    /// Returns the device with required_hours raised to what the heating curve asks
    /// for at the given average apparent temperature. Without adjustment or without a
    /// forecast the device is returned as configured.
    ///
    /// # Arguments
    ///
    /// * 'temperature' - forecasted average apparent temperature over the period
    pub fn weather_adjusted(&self, temperature: Option<f64>) -> Device {
        let mut device = self.clone();
        if let (true, Some(temp)) = (self.weather_adjustment, temperature) {
            let heating = heating_hours(temp, self.heating_curve, self.power_factor, self.period_hours);
            device.required_hours = self.required_hours.max(heating);
        }
        device
    }

    /// Local hours during which the device is forced on
    pub fn always_on_hours(&self) -> Result<Vec<u32>, SchedulingError> {
        parse_hour_ranges(&self.id, self.always_on_hours.as_deref())
    }

    /// Local hours during which the device is forced off, overrides everything else
    pub fn always_off_hours(&self) -> Result<Vec<u32>, SchedulingError> {
        parse_hour_ranges(&self.id, self.always_off_hours.as_deref())
    }
}

/// Heating hours per period for a forecasted apparent temperature
///
/// The daily need is `(max - t) * power_factor + 2 * curve - 2` hours, split evenly
/// over the periods of a day, truncated to whole quarters and capped to the period.
///
/// # Arguments
///
/// * 'temperature' - forecasted average apparent temperature
/// * 'heating_curve' - curve offset
/// * 'power_factor' - power factor
/// * 'period_hours' - period length in hours
pub fn heating_hours(temperature: f64, heating_curve: f64, power_factor: f64, period_hours: u32) -> f64 {
    if temperature >= HEATING_MAX_TEMP || period_hours == 0 {
        return 0.0;
    }

    let diff = HEATING_MAX_TEMP - temperature;
    let mut hours = (diff * (power_factor - 1.0) + (diff + heating_curve * 2.0 - 2.0)).max(0.0);
    if period_hours < 24 {
        hours /= (24 / period_hours) as f64;
    }

    ((hours * 4.0).floor() / 4.0).min(period_hours as f64)
}

/// Parses an hour range string into a sorted list of hours
///
/// Format is "9-11,13-15,20" where the end hour of a range is not included.
///
/// # Arguments
///
/// * 'device' - device id for error reporting
/// * 'hours' - the hour range string
fn parse_hour_ranges(device: &str, hours: Option<&str>) -> Result<Vec<u32>, SchedulingError> {
    let mut result: Vec<u32> = Vec::new();
    let Some(hours) = hours else { return Ok(result) };

    let parse = |s: &str| -> Result<u32, SchedulingError> {
        s.trim().parse::<u32>()
            .map_err(|_| SchedulingError::invalid_config(device, format!("illegal hour '{}'", s.trim())))
    };

    for range in hours.split(',').map(str::trim).filter(|r| !r.is_empty()) {
        if let Some((start, end)) = range.split_once('-') {
            let (start, end) = (parse(start)?, parse(end)?);
            if start > end || end > 24 {
                return Err(SchedulingError::invalid_config(device, format!("illegal hour range '{}'", range)));
            }
            result.extend(start..end);
        } else {
            let hour = parse(range)?;
            if hour > 23 {
                return Err(SchedulingError::invalid_config(device, format!("illegal hour '{}'", hour)));
            }
            result.push(hour);
        }
    }

    result.sort();
    result.dedup();
    Ok(result)
}

/// Persistent per device accounting state
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DeviceState {
    pub device_id: String,
    pub current_period_start: DateTime<Utc>,
    pub hours_delivered: f64,
    pub debt_hours: f64,
    /// Slots starting before this instant have already been credited
    pub accounted_until: DateTime<Utc>,
}

/// Implementation of the Display Trait for pretty print
impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:<16} period {} delivered {:>5.2} h, debt {:>6.2} h",
               self.device_id, self.current_period_start.format("%Y-%m-%d %H:%M"),
               self.hours_delivered, self.debt_hours)
    }
}

impl DeviceState {
    /// Creates the state for a device seen for the first time
    ///
    /// # Arguments
    ///
    /// * 'device' - the device
    /// * 'now' - current time
    /// * 'anchor' - local time of day periods are aligned to
    /// * 'timezone' - timezone for the anchor
    pub fn new(device: &Device, now: DateTime<Utc>, anchor: NaiveTime, timezone: Tz) -> DeviceState {
        let current_period_start = period_start_for(now, device.period_hours.max(1), anchor, timezone);

        DeviceState {
            device_id: device.id.clone(),
            current_period_start,
            hours_delivered: 0.0,
            debt_hours: 0.0,
            accounted_until: current_period_start,
        }
    }

    pub fn period_end(&self, device: &Device) -> DateTime<Utc> {
        self.current_period_start + device.period_length()
    }
}

/// Returns the latest period boundary at or before now, boundaries being aligned
/// to the anchor time of the local day of now
///
/// # Arguments
///
/// * 'now' - current time
/// * 'period_hours' - period length in hours
/// * 'anchor' - local time of day to align to
/// * 'timezone' - timezone for the anchor
pub fn period_start_for(now: DateTime<Utc>, period_hours: u32, anchor: NaiveTime, timezone: Tz) -> DateTime<Utc> {
    let local_date = now.with_timezone(&timezone).date_naive();
    let anchor_utc = local_date.and_time(anchor)
        .and_local_timezone(timezone)
        .earliest()
        .map(|a| a.with_timezone(&Utc))
        .unwrap_or_else(|| local_date.and_time(anchor).and_utc());

    let period_secs = period_hours as i64 * 3600;
    let periods = (now - anchor_utc).num_seconds().div_euclid(period_secs);

    anchor_utc + TimeDelta::seconds(periods * period_secs)
}
