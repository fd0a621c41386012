use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use log::warn;
use serde::Deserialize;
use crate::device::DeviceState;
use crate::errors::ManualError;
use crate::events::{Event, EventKind};
use crate::reconciler::reset_debt;

#[derive(Deserialize)]
struct ManualSettings {
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    disabled_dates: Vec<NaiveDate>,
    #[serde(default)]
    disabled_devices: BTreeSet<String>,
}

fn default_enabled() -> bool { true }

/// Switches set by hand through the manual file
#[derive(Clone, Debug, PartialEq)]
pub struct ManualSwitches {
    /// Master switch
    pub enabled: bool,
    /// Devices switched off at runtime
    pub disabled_devices: BTreeSet<String>,
}

impl Default for ManualSwitches {
    fn default() -> Self {
        ManualSwitches { enabled: true, disabled_devices: BTreeSet::new() }
    }
}

#[derive(Deserialize)]
struct ResetRequest {
    #[serde(default)]
    all: bool,
    #[serde(default)]
    devices: Vec<String>,
}

/// Which devices to clear the debt for
#[derive(Clone, Debug, PartialEq)]
pub enum DebtReset {
    All,
    Devices(Vec<String>),
}

/// Checks whether there is any manual file and if so reads the master switch, the
/// disabled dates and the devices switched off. A missing file means everything is enabled.
///
/// The return value depends on the switches when entering the function,
/// if they change then it returns Some(new switches) otherwise it returns None
///
/// # Arguments
///
/// * 'manual_file' - the file holding the switches
/// * 'current' - switches currently in effect
/// * 'date' - time to check, the local date is matched against disabled dates
/// * 'timezone' - local timezone
pub fn check_manual(manual_file: &str, current: &ManualSwitches, date: DateTime<Utc>, timezone: Tz)
    -> Result<Option<ManualSwitches>, ManualError> {

    let mut switches = ManualSwitches::default();

    let path = Path::new(manual_file);
    if path.exists() {
        let json = fs::read_to_string(path)?;
        let manual: ManualSettings = serde_json::from_str(&json)?;
        let local_date = date.with_timezone(&timezone).date_naive();

        switches.enabled = manual.enabled && !manual.disabled_dates.contains(&local_date);
        switches.disabled_devices = manual.disabled_devices;
    }

    if switches != *current { Ok(Some(switches)) } else { Ok(None) }
}

/// Returns events describing what changed between two sets of switches
///
/// # Arguments
///
/// * 'before' - switches in effect so far
/// * 'after' - new switches
/// * 'time' - time to stamp the events with
pub fn switch_events(before: &ManualSwitches, after: &ManualSwitches, time: DateTime<Utc>) -> Vec<Event> {
    let mut events: Vec<Event> = Vec::new();

    if before.enabled != after.enabled {
        events.push(Event::new(time, None, EventKind::MasterSwitch { enabled: after.enabled }));
    }
    for id in after.disabled_devices.difference(&before.disabled_devices) {
        events.push(Event::for_device(time, id, EventKind::DeviceSwitch { enabled: false }));
    }
    for id in before.disabled_devices.difference(&after.disabled_devices) {
        events.push(Event::for_device(time, id, EventKind::DeviceSwitch { enabled: true }));
    }

    events
}

/// Reads and removes a pending debt reset request
///
/// # Arguments
///
/// * 'reset_file' - file holding the request
pub fn take_reset_request(reset_file: &str) -> Result<Option<DebtReset>, ManualError> {
    let path = Path::new(reset_file);
    if !path.exists() {
        return Ok(None);
    }

    let json = fs::read_to_string(path)?;
    fs::remove_file(path)?;
    let request: ResetRequest = serde_json::from_str(&json)?;

    if request.all {
        Ok(Some(DebtReset::All))
    } else if request.devices.is_empty() {
        Err(ManualError("reset request names no devices".to_string()))
    } else {
        Ok(Some(DebtReset::Devices(request.devices)))
    }
}

/// Clears debt as requested and returns the reset events
///
/// # Arguments
///
/// * 'states' - device states
/// * 'reset' - the request
/// * 'time' - time to stamp the events with
pub fn apply_reset(states: &mut BTreeMap<String, DeviceState>, reset: &DebtReset, time: DateTime<Utc>) -> Vec<Event> {
    match reset {
        DebtReset::All => states.values_mut().map(|s| reset_debt(s, time)).collect(),
        DebtReset::Devices(ids) => ids.iter()
            .filter_map(|id| {
                let state = states.get_mut(id);
                if state.is_none() {
                    warn!("debt reset requested for unknown device {}", id);
                }
                state.map(|s| reset_debt(s, time))
            })
            .collect(),
    }
}
