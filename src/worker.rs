use std::thread;
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, error, info, warn};
use crate::backup::{save_decisions, save_device_states, save_snapshot};
use crate::config::Config;
use crate::errors::WorkerError;
use crate::events::{Event, EventKind};
use crate::initialization::Mgr;
use crate::manager_weather::Forecast;
use crate::manual::{apply_reset, check_manual, switch_events, take_reset_request};
use crate::publisher::{publish, Snapshot};
use crate::scheduling::refresh;

/// Runs the scheduler
///
/// Every ten seconds manual switches and debt reset requests are checked. A refresh
/// runs when refresh_minutes have passed, when price documents changed, when a
/// switch changed or after a debt reset. Refreshes never overlap, and a failing step
/// is logged and recorded on the event feed without stopping the loop.
///
/// # Arguments
///
/// * 'config' - the configuration
/// * 'mgr' - state carried between refreshes
pub fn run(config: Config, mut mgr: Mgr) -> ! {
    let refresh_interval = TimeDelta::minutes(config.scheduling.refresh_minutes);
    let mut last_refresh: Option<DateTime<Utc>> = None;

    loop {
        let now = Utc::now();
        let refresh_due = last_refresh.is_none_or(|t| now - t >= refresh_interval);

        if tick(&config, &mut mgr, now, refresh_due) {
            last_refresh = Some(now);
        }

        thread::sleep(std::time::Duration::from_secs(10));
    }
}

/// One pass of the worker loop, returns true if a refresh was run
///
/// # Arguments
///
/// * 'config' - the configuration
/// * 'mgr' - state carried between refreshes
/// * 'now' - current time
/// * 'refresh_due' - whether refresh_minutes have passed since the last refresh
fn tick(config: &Config, mgr: &mut Mgr, now: DateTime<Utc>, refresh_due: bool) -> bool {
    let mut refresh_needed = refresh_due;

    match check_switches(config, mgr, now) {
        Ok(changed) => refresh_needed |= changed,
        Err(e) => error!("{}", e),
    }

    match check_reset(config, mgr, now) {
        Ok(reset) => refresh_needed |= reset,
        Err(e) => record_failure(mgr, now, e.message()),
    }

    match mgr.prices.has_update() {
        Ok(true) => {
            info!("price documents updated");
            refresh_needed = true;
        },
        Ok(false) => {},
        Err(e) => error!("{}", e),
    }

    if refresh_needed {
        if let Err(e) = update_schedule(config, mgr, now) {
            record_failure(mgr, now, e.message());
        }
    }

    refresh_needed
}

/// Reads the manual file, returns true if any switch changed
///
/// # Arguments
///
/// * 'config' - the configuration
/// * 'mgr' - state carried between refreshes
/// * 'now' - current time
fn check_switches(config: &Config, mgr: &mut Mgr, now: DateTime<Utc>) -> Result<bool, WorkerError> {
    let Some(switches) = check_manual(&config.files.manual_file, &mgr.switches, now, mgr.tariffs.timezone)? else {
        return Ok(false);
    };

    mgr.events.extend(switch_events(&mgr.switches, &switches, now));
    mgr.switches = switches;

    Ok(true)
}

/// Applies a pending debt reset request, returns true if there was one
///
/// # Arguments
///
/// * 'config' - the configuration
/// * 'mgr' - state carried between refreshes
/// * 'now' - current time
fn check_reset(config: &Config, mgr: &mut Mgr, now: DateTime<Utc>) -> Result<bool, WorkerError> {
    let Some(reset) = take_reset_request(&config.files.reset_debt_file)? else {
        return Ok(false);
    };

    mgr.events.extend(apply_reset(&mut mgr.states, &reset, now));
    mgr.states_saved = false;
    save_states(config, mgr)?;

    Ok(true)
}

/// Runs one refresh and publishes its snapshot
///
/// If no price table can be built the previous snapshot stays in effect with the
/// error attached. State is kept in memory even when it can't be saved, saving is
/// retried on the next refresh.
///
/// # Arguments
///
/// * 'config' - the configuration
/// * 'mgr' - state carried between refreshes
/// * 'now' - current time
fn update_schedule(config: &Config, mgr: &mut Mgr, now: DateTime<Utc>) -> Result<(), WorkerError> {
    let table = match mgr.prices.price_table(&mgr.tariffs, now) {
        Ok(table) => table,
        Err(e) => {
            record_failure(mgr, now, &e.to_string());
            return persist(config, mgr);
        },
    };

    let forecast = read_forecast(mgr);
    let result = refresh(&table, &config.devices, &mgr.states, mgr.snapshot.as_ref(), now,
                         &config.scheduling, mgr.tariffs.timezone, &mgr.switches, forecast.as_ref());
    mgr.events.extend(result.events);
    if result.state_changed {
        mgr.states_saved = false;
    }
    mgr.states = result.states;

    let snapshot = publish(&table, result.schedules, mgr.switches.enabled, &mgr.tariffs.context,
                           mgr.events.events(), now);
    for d in snapshot.devices.iter() {
        let on = snapshot.decision_at(&d.id, now).unwrap_or(false);
        debug!("{} is {} now", d.id, if on { "on" } else { "off" });
    }
    print_snapshot(&snapshot, "Update");
    mgr.snapshot = Some(snapshot);

    persist(config, mgr)
}

/// Reads the temperature forecast, if a weather source is configured
///
/// # Arguments
///
/// * 'mgr' - state carried between refreshes
fn read_forecast(mgr: &Mgr) -> Option<Forecast> {
    let weather = mgr.weather.as_ref()?;

    match weather.forecast() {
        Ok(forecast) => forecast,
        Err(e) => {
            warn!("{}, weather adjusted devices use their configured hours", e);
            None
        },
    }
}

/// Saves device states if they changed since last saved
///
/// # Arguments
///
/// * 'config' - the configuration
/// * 'mgr' - state carried between refreshes
fn save_states(config: &Config, mgr: &mut Mgr) -> Result<(), WorkerError> {
    if !mgr.states_saved {
        save_device_states(&config.files.backup_dir, &mgr.states)?;
        mgr.states_saved = true;
    }

    Ok(())
}

/// Saves device states and the snapshot in effect
///
/// # Arguments
///
/// * 'config' - the configuration
/// * 'mgr' - state carried between refreshes
fn persist(config: &Config, mgr: &mut Mgr) -> Result<(), WorkerError> {
    save_states(config, mgr)?;

    if let Some(snapshot) = &mgr.snapshot {
        save_snapshot(&config.files.snapshot_file, snapshot)?;
        if let Some(decisions_file) = &config.files.decisions_file {
            save_decisions(decisions_file, &snapshot.decisions())?;
        }
    }

    Ok(())
}

/// Records a failed step on the event feed and on the snapshot in effect
///
/// # Arguments
///
/// * 'mgr' - state carried between refreshes
/// * 'now' - current time
/// * 'reason' - what failed
fn record_failure(mgr: &mut Mgr, now: DateTime<Utc>, reason: &str) {
    mgr.events.push(Event::new(now, None, EventKind::RefreshFailed { reason: reason.to_string() }));

    if let Some(snapshot) = mgr.snapshot.as_mut() {
        snapshot.last_error = Some(reason.to_string());
        snapshot.events = mgr.events.events();
    }
}

/// Logs a snapshot with a caption
///
/// # Arguments
///
/// * 'snapshot' - the snapshot to print
/// * 'caption' - the caption to print
fn print_snapshot(snapshot: &Snapshot, caption: &str) {
    let report_time = format!("{}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
    let caption = format!("{} {} ", report_time, caption);

    info!("{:=<100}\n{}", caption, snapshot);
}
