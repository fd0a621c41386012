use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use log::warn;
use serde::{Deserialize, Serialize};
use crate::config::TariffParameters;

/// Network packages are priced per MWh
const MWH_TO_KWH: f64 = 1000.0;

const WINTER: [u32; 5] = [11, 12, 1, 2, 3];
const SUMMER: [u32; 7] = [3, 4, 5, 6, 7, 8, 9];
const WINTER_IMATRA: [u32; 5] = [10, 11, 12, 1, 2];
const WORKDAYS: [Weekday; 5] = [Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri];
const WEEKEND: [Weekday; 2] = [Weekday::Sat, Weekday::Sun];

/// One network tariff rule, matched against the local start time of a slot
///
/// Empty month and weekday lists match everything. The hour range is end exclusive
/// and wraps around midnight when start is after end, e.g. 22 - 7.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TariffRule {
    #[serde(default)]
    pub months: Vec<u32>,
    #[serde(default)]
    pub weekdays: Vec<Weekday>,
    #[serde(default)]
    pub start_hour: u32,
    #[serde(default = "default_end_hour")]
    pub end_hour: u32,
    pub add_on: f64,
}

fn default_end_hour() -> u32 { 24 }

impl TariffRule {
    fn new(months: &[u32], weekdays: &[Weekday], start_hour: u32, end_hour: u32, add_on: f64) -> Self {
        TariffRule { months: months.to_vec(), weekdays: weekdays.to_vec(), start_hour, end_hour, add_on }
    }

    /// Returns true if the rule applies to the given local time
    ///
    /// # Arguments
    ///
    /// * 'local' - slot start in the tariff's timezone
    pub fn matches(&self, local: &DateTime<Tz>) -> bool {
        if !self.months.is_empty() && !self.months.contains(&local.month()) {
            return false;
        }
        if !self.weekdays.is_empty() && !self.weekdays.contains(&local.weekday()) {
            return false;
        }

        let hour = local.hour();
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Maps slot start times to an additive network price
#[derive(Clone, Debug)]
pub struct TariffSchedule {
    pub timezone: Tz,
    pub rules: Vec<TariffRule>,
    pub default_add_on: f64,
    pub context: String,
}

impl TariffSchedule {
    /// Creates a tariff schedule from configuration
    ///
    /// Explicit rules take precedence over a named package. Package fees are
    /// given excluding VAT, hence they are scaled with the VAT rate.
    ///
    /// # Arguments
    ///
    /// * 'params' - tariff section of the configuration
    /// * 'vat_rate' - VAT multiplier, e.g. 1.24
    pub fn from_config(params: &TariffParameters, vat_rate: f64) -> TariffSchedule {
        if !params.rules.is_empty() {
            return TariffSchedule {
                timezone: params.timezone,
                rules: params.rules.clone(),
                default_add_on: params.default_add_on,
                context: "custom".to_string(),
            };
        }

        match (&params.provider, &params.package) {
            (Some(provider), Some(package)) => {
                match package_rules(provider, package) {
                    Some((rules, base)) => TariffSchedule {
                        timezone: params.timezone,
                        rules: rules.into_iter()
                            .map(|mut r| { r.add_on = r.add_on / MWH_TO_KWH * vat_rate; r })
                            .collect(),
                        default_add_on: base / MWH_TO_KWH * vat_rate,
                        context: format!("{} {}", provider, package.to_uppercase()),
                    },
                    None => {
                        warn!("unknown network provider '{}', using default add-on", provider);
                        Self::flat(params.timezone, params.default_add_on)
                    }
                }
            },
            _ => Self::flat(params.timezone, params.default_add_on),
        }
    }

    /// A schedule applying the same add-on to every slot
    ///
    /// # Arguments
    ///
    /// * 'timezone' - timezone used for local hours
    /// * 'add_on' - the additive price
    pub fn flat(timezone: Tz, add_on: f64) -> TariffSchedule {
        TariffSchedule { timezone, rules: Vec::new(), default_add_on: add_on, context: "flat".to_string() }
    }

    /// Returns the add-on for a slot starting at the given time, first matching rule wins
    ///
    /// # Arguments
    ///
    /// * 'start' - slot start
    pub fn add_on(&self, start: DateTime<Utc>) -> f64 {
        let local = start.with_timezone(&self.timezone);
        self.rules.iter()
            .find(|r| r.matches(&local))
            .map_or(self.default_add_on, |r| r.add_on)
    }

    /// Returns the local hour of day for a slot start
    pub fn local_hour(&self, start: DateTime<Utc>) -> u32 {
        start.with_timezone(&self.timezone).hour()
    }
}

/// Returns rules and base rate (both in €/MWh excluding VAT) for a known network package.
/// An unknown package of a known provider gets the provider's base rate only.
///
/// # Arguments
///
/// * 'provider' - network provider, elektrilevi, imatra or latvia
/// * 'package' - the provider's package name
fn package_rules(provider: &str, package: &str) -> Option<(Vec<TariffRule>, f64)> {
    let all: &[u32] = &[];
    let any_day: &[Weekday] = &[];

    let day_night = |night: f64, day: f64| -> (Vec<TariffRule>, f64) {
        (vec![
            TariffRule::new(all, &WEEKEND, 0, 24, night),
            TariffRule::new(all, any_day, 22, 7, night),
        ], day)
    };

    let seasonal_day_night = |night: f64, day: f64| -> (Vec<TariffRule>, f64) {
        (vec![
            TariffRule::new(all, &WEEKEND, 0, 24, night),
            TariffRule::new(&SUMMER, any_day, 0, 8, night),
            TariffRule::new(&WINTER_IMATRA, any_day, 23, 7, night),
        ], day)
    };

    match provider {
        "elektrilevi" => Some(match package {
            "vork2" => day_night(35.1, 60.7),
            "vork4" => day_night(21.0, 36.9),
            "vork5" => (vec![
                TariffRule::new(&WINTER, &WEEKEND, 16, 20, 47.4),
                TariffRule::new(&WINTER, &WORKDAYS, 9, 12, 81.8),
                TariffRule::new(&WINTER, &WORKDAYS, 16, 20, 81.8),
                TariffRule::new(all, &WEEKEND, 0, 24, 30.3),
                TariffRule::new(all, any_day, 22, 7, 30.3),
            ], 52.9),
            _ => (Vec::new(), 77.2),
        }),
        "imatra" => Some(match package {
            "partn24pl" => (Vec::new(), 38.6),
            "partn12" => seasonal_day_night(42.0, 72.4),
            "partn12pl" => seasonal_day_night(27.1, 46.4),
            _ => (Vec::new(), 60.7),
        }),
        "latvia" => Some(match package {
            "special1" => (Vec::new(), 158.48),
            _ => (Vec::new(), 39.62),
        }),
        _ => None,
    }
}
