use std::collections::BTreeMap;
use std::env;
use log::info;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config as LogConfig, Root};
use log4rs::encode::pattern::PatternEncoder;
use crate::backup::{load_device_states, load_snapshot};
use crate::config::{load_config, Config, General};
use crate::device::DeviceState;
use crate::errors::InitError;
use crate::events::EventLog;
use crate::manager_prices::PriceSource;
use crate::manager_weather::WeatherSource;
use crate::manual::ManualSwitches;
use crate::publisher::Snapshot;
use crate::tariffs::TariffSchedule;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} {l:<5} {t} - {m}{n}";

/// Everything the worker needs between refreshes
pub struct Mgr {
    pub prices: PriceSource,
    pub tariffs: TariffSchedule,
    pub weather: Option<WeatherSource>,
    pub states: BTreeMap<String, DeviceState>,
    /// False while states hold changes not yet written to the backup
    pub states_saved: bool,
    pub snapshot: Option<Snapshot>,
    pub events: EventLog,
    pub switches: ManualSwitches,
}

/// Loads configuration, sets up logging and restores persisted state
///
pub fn init() -> Result<(Config, Mgr), InitError> {
    let config_path = env::var("CONFIG_PATH").ok()
        .or_else(|| env::args().nth(1))
        .ok_or(InitError("config path missing, set CONFIG_PATH or give it as argument".to_string()))?;

    let config = load_config(&config_path)?;
    setup_logger(&config.general)?;

    // Print version
    info!("gridloads version: {}", env!("CARGO_PKG_VERSION"));

    let prices = PriceSource::new(&config.files.price_dir, &config.prices);
    let tariffs = TariffSchedule::from_config(&config.tariff, config.prices.vat_rate);
    info!("network tariff: {}", tariffs.context);
    let weather = config.files.forecast_file.as_ref()
        .map(|file| WeatherSource::new(file, tariffs.timezone));

    let states = load_device_states(&config.files.backup_dir, &config.devices)?;
    for state in states.values() {
        info!("{}", state);
    }
    let snapshot = load_snapshot(&config.files.snapshot_file)?;
    let events = EventLog::with_events(config.scheduling.event_log_size,
                                       snapshot.as_ref().map(|s| s.events.clone()).unwrap_or_default());

    let mgr = Mgr {
        prices,
        tariffs,
        weather,
        states,
        states_saved: true,
        snapshot,
        events,
        switches: ManualSwitches::default(),
    };

    Ok((config, mgr))
}

/// Sets up log4rs with a file appender and, if configured, a console appender
///
/// # Arguments
///
/// * 'general' - general configuration
fn setup_logger(general: &General) -> Result<(), InitError> {
    let file = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build(&general.log_path)?;

    let mut builder = LogConfig::builder()
        .appender(Appender::builder().build("file", Box::new(file)));
    let mut root = Root::builder().appender("file");

    if general.log_to_stdout {
        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build();
        builder = builder.appender(Appender::builder().build("stdout", Box::new(stdout)));
        root = root.appender("stdout");
    }

    let log_config = builder.build(root.build(general.log_level))
        .map_err(|e| InitError(e.to_string()))?;
    log4rs::init_config(log_config)?;

    Ok(())
}
