use chrono_tz::Tz;
use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct Hourly {
    /// Local times in the document's timezone, e.g. "2025-01-15T13:00"
    pub time: Vec<String>,
    pub apparent_temperature: Vec<Option<f64>>,
}

/// Hourly forecast document as returned by the Open-Meteo forecast API
#[derive(Deserialize, Debug)]
pub struct OpenMeteoForecast {
    pub timezone: Option<Tz>,
    pub hourly: Hourly,
}
