use std::fs;
use std::path::Path;
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use log::debug;
use crate::errors::WeatherError;
use crate::models::open_meteo::OpenMeteoForecast;

/// Hourly apparent temperatures
#[derive(Clone, Debug, PartialEq)]
pub struct Forecast {
    pub hourly: Vec<(DateTime<Utc>, f64)>,
}

impl Forecast {
    /// Average apparent temperature over the hours from the given time, None if the
    /// forecast doesn't cover any of them
    ///
    /// # Arguments
    ///
    /// * 'from' - start of the window
    /// * 'hours' - window length
    pub fn avg_temperature(&self, from: DateTime<Utc>, hours: u32) -> Option<f64> {
        let to = from + TimeDelta::hours(hours as i64);
        let temps: Vec<f64> = self.hourly.iter()
            .filter(|(t, _)| *t + TimeDelta::hours(1) > from && *t < to)
            .map(|(_, temp)| *temp)
            .collect();

        if temps.is_empty() {
            None
        } else {
            Some(temps.iter().sum::<f64>() / temps.len() as f64)
        }
    }
}

/// Temperature forecasts read from an Open-Meteo document kept up to date by an external fetcher
pub struct WeatherSource {
    forecast_file: String,
    timezone: Tz,
}

impl WeatherSource {
    /// Creates a weather source
    ///
    /// # Arguments
    ///
    /// * 'forecast_file' - the forecast document
    /// * 'timezone' - timezone of the document's times unless it names one itself
    pub fn new(forecast_file: &str, timezone: Tz) -> WeatherSource {
        WeatherSource { forecast_file: forecast_file.to_string(), timezone }
    }

    /// Reads the forecast, None if there is no forecast document
    pub fn forecast(&self) -> Result<Option<Forecast>, WeatherError> {
        let path = Path::new(&self.forecast_file);
        if !path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(path)?;
        let document: OpenMeteoForecast = serde_json::from_str(&json)?;
        let timezone = document.timezone.unwrap_or(self.timezone);

        let mut hourly: Vec<(DateTime<Utc>, f64)> = Vec::new();
        for (time, temp) in document.hourly.time.iter().zip(document.hourly.apparent_temperature.iter()) {
            let Some(temp) = temp else { continue };
            let local = NaiveDateTime::parse_from_str(time, "%Y-%m-%dT%H:%M")
                .map_err(|e| WeatherError(format!("time '{}': {}", time, e)))?;
            if let Some(t) = local.and_local_timezone(timezone).earliest() {
                hourly.push((t.with_timezone(&Utc), *temp));
            }
        }
        debug!("{} forecast hour(s) from {}", hourly.len(), self.forecast_file);

        Ok(Some(Forecast { hourly }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap()
    }

    #[test]
    fn reads_local_times() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("forecast.json");
        fs::write(&file, r#"{
            "timezone": "Europe/Tallinn",
            "hourly": {
                "time": ["2025-01-15T02:00", "2025-01-15T03:00", "2025-01-15T04:00"],
                "apparent_temperature": [-4.0, null, -2.0]
            }
        }"#).unwrap();

        let source = WeatherSource::new(file.to_str().unwrap(), chrono_tz::UTC);
        let forecast = source.forecast().unwrap().unwrap();
        assert_eq!(forecast.hourly, vec![(t0(), -4.0), (t0() + TimeDelta::hours(2), -2.0)]);
    }

    #[test]
    fn missing_document_is_no_forecast() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("forecast.json");

        assert_eq!(WeatherSource::new(file.to_str().unwrap(), chrono_tz::UTC).forecast().unwrap(), None);
    }

    #[test]
    fn average_over_window() {
        let forecast = Forecast { hourly: (0..6).map(|h| (t0() + TimeDelta::hours(h), h as f64)).collect() };

        assert_eq!(forecast.avg_temperature(t0() + TimeDelta::minutes(90), 2), Some(2.0));
        assert_eq!(forecast.avg_temperature(t0(), 24), Some(2.5));
        assert_eq!(forecast.avg_temperature(t0() + TimeDelta::hours(6), 6), None);
    }
}
