use std::fmt;
use std::fmt::Formatter;
use chrono::{Local, RoundingError};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("ConfigError: {0}")]
pub struct ConfigError(pub String);
impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self { ConfigError(e.to_string()) }
}
impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self { ConfigError(e.to_string()) }
}
impl From<&str> for ConfigError {
    fn from(e: &str) -> Self { ConfigError(e.to_string()) }
}
impl From<String> for ConfigError {
    fn from(e: String) -> Self { ConfigError(e) }
}

/// Errors from the price source and from building a price table
#[derive(Error, Debug)]
pub enum PriceError {
    #[error("PriceError::IncompleteData: {0}")]
    IncompleteData(String),
    #[error("PriceError::Source: {0}")]
    Source(String),
}
impl From<std::io::Error> for PriceError {
    fn from(e: std::io::Error) -> Self { PriceError::Source(e.to_string()) }
}
impl From<serde_json::Error> for PriceError {
    fn from(e: serde_json::Error) -> Self { PriceError::Source(format!("json document error: {}", e)) }
}
impl From<glob::PatternError> for PriceError {
    fn from(e: glob::PatternError) -> Self { PriceError::Source(e.to_string()) }
}
impl From<RoundingError> for PriceError {
    fn from(e: RoundingError) -> Self { PriceError::Source(e.to_string()) }
}

/// Per device scheduling errors, they never abort a refresh for other devices
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulingError {
    #[error("SchedulingError::InvalidConfig: device {device}: {reason}")]
    InvalidConfig { device: String, reason: String },
    #[error("SchedulingError::Reconciliation: device {device}: {reason}")]
    Reconciliation { device: String, reason: String },
}

impl SchedulingError {
    pub fn invalid_config(device: &str, reason: impl Into<String>) -> Self {
        SchedulingError::InvalidConfig { device: device.to_string(), reason: reason.into() }
    }

    pub fn reconciliation(device: &str, reason: impl Into<String>) -> Self {
        SchedulingError::Reconciliation { device: device.to_string(), reason: reason.into() }
    }
}

#[derive(Error, Debug)]
#[error("BackupError: {0}")]
pub struct BackupError(pub String);
impl From<std::io::Error> for BackupError {
    fn from(e: std::io::Error) -> Self { BackupError(e.to_string()) }
}
impl From<serde_json::Error> for BackupError {
    fn from(e: serde_json::Error) -> Self { BackupError(format!("json document error: {}", e)) }
}

#[derive(Error, Debug)]
#[error("WeatherError: {0}")]
pub struct WeatherError(pub String);
impl From<std::io::Error> for WeatherError {
    fn from(e: std::io::Error) -> Self { WeatherError(e.to_string()) }
}
impl From<serde_json::Error> for WeatherError {
    fn from(e: serde_json::Error) -> Self { WeatherError(format!("json document error: {}", e)) }
}

#[derive(Error, Debug)]
#[error("ManualError: {0}")]
pub struct ManualError(pub String);
impl From<std::io::Error> for ManualError {
    fn from(e: std::io::Error) -> Self { ManualError(e.to_string()) }
}
impl From<serde_json::Error> for ManualError {
    fn from(e: serde_json::Error) -> Self { ManualError(format!("json document error: {}", e)) }
}

#[derive(Error, Debug)]
#[error("InitError: {0}")]
pub struct InitError(pub String);
impl From<std::io::Error> for InitError {
    fn from(e: std::io::Error) -> Self { InitError(e.to_string()) }
}
impl From<ConfigError> for InitError {
    fn from(e: ConfigError) -> Self { InitError(e.to_string()) }
}
impl From<BackupError> for InitError {
    fn from(e: BackupError) -> Self { InitError(e.to_string()) }
}
impl From<log::SetLoggerError> for InitError {
    fn from(e: log::SetLoggerError) -> Self { InitError(e.to_string()) }
}

/// Error from a worker step, printed with a caption for the log
#[derive(Debug)]
pub struct WorkerError {
    msg: String,
}
impl WorkerError {
    pub fn new(msg: impl Into<String>) -> WorkerError {
        WorkerError { msg: msg.into() }
    }

    /// The error without caption
    pub fn message(&self) -> &str {
        &self.msg
    }
}
impl std::error::Error for WorkerError {}
impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let report_time = format!("{}", Local::now().format("%Y-%m-%d %H:%M:%S"));
        let caption = format!("{} WorkerError ", report_time);
        write!(f, "{:=<100}\n", caption)?;
        write!(f, "{}", self.msg)
    }
}
impl From<BackupError> for WorkerError {
    fn from(e: BackupError) -> Self { WorkerError::new(e.to_string()) }
}
impl From<ManualError> for WorkerError {
    fn from(e: ManualError) -> Self { WorkerError::new(e.to_string()) }
}
