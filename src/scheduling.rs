use std::collections::{BTreeMap, BTreeSet};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use crate::arbiter::{arbitrate, Deferral, Selections};
use crate::config::SchedulingParameters;
use crate::device::{Device, DeviceState, ScheduleMode};
use crate::events::{Event, EventKind};
use crate::manager_weather::Forecast;
use crate::manual::ManualSwitches;
use crate::price_table::PriceTable;
use crate::publisher::{DeviceSchedule, DeviceStatus, Snapshot};
use crate::reconciler::{account, DebtLimits, ExecutedSlot};
use crate::selector::{current_period_window, remaining_target_hours, select};

/// Result of one scheduling pass
pub struct Refresh {
    pub states: BTreeMap<String, DeviceState>,
    pub schedules: Vec<DeviceSchedule>,
    pub events: Vec<Event>,
    pub state_changed: bool,
}

/// Runs one scheduling pass over all devices
///
/// Delivery since the previous snapshot is credited and crossed periods reconciled,
/// then every device selects its slots independently before the arbiter resolves
/// conflicts between them. Each device is handled in isolation, a fault in one
/// device turns only that device off. With the master switch off all devices are
/// off and no state is touched.
///
/// A device that is kept off isn't accounted, its elapsed on slots from the previous
/// snapshot are instead carried into the new one so they are credited once it runs again.
///
/// The pass is pure, the caller publishes the schedules and persists the states.
///
/// # Arguments
///
/// * 'table' - price table for the horizon
/// * 'devices' - configured devices
/// * 'states' - device states from the previous pass
/// * 'previous' - the snapshot published by the previous pass
/// * 'now' - current time
/// * 'params' - scheduling parameters
/// * 'timezone' - timezone used for period alignment
/// * 'switches' - master switch and devices switched off by hand
/// * 'forecast' - temperature forecast for weather adjusted devices, if any
pub fn refresh(table: &PriceTable, devices: &[Device], states: &BTreeMap<String, DeviceState>,
               previous: Option<&Snapshot>, now: DateTime<Utc>, params: &SchedulingParameters,
               timezone: Tz, switches: &ManualSwitches, forecast: Option<&Forecast>) -> Refresh {

    let mut result = Refresh {
        states: states.clone(),
        schedules: Vec::new(),
        events: Vec::new(),
        state_changed: false,
    };
    let empty: BTreeSet<usize> = BTreeSet::new();

    if !switches.enabled {
        for device in devices {
            let state = states.get(&device.id);
            let mut schedule = DeviceSchedule::new(table, device, state, &empty, DeviceStatus::Suspended);
            schedule.uncredited = uncredited(previous, &device.id, state, now);
            result.schedules.push(schedule);
        }
        return result;
    }

    let devices: Vec<Device> = devices.iter()
        .map(|d| {
            let mut device = d.weather_adjusted(forecast.and_then(|f| f.avg_temperature(now, d.period_hours)));
            if switches.disabled_devices.contains(&d.id) {
                device.enabled = false;
            }
            device
        })
        .collect();

    let mut statuses: BTreeMap<String, DeviceStatus> = BTreeMap::new();
    let mut selections: Selections = BTreeMap::new();

    for device in devices.iter() {
        let status = match schedule_device(table, device, &mut result, previous, now, params, timezone) {
            Ok(selection) => {
                selections.insert(device.id.clone(), selection);
                DeviceStatus::Scheduled
            },
            Err(status) => status,
        };
        statuses.insert(device.id.clone(), status);
    }

    let (arbitrated, deferrals) = arbitrate(&selections, &devices, params.max_total_power_w);
    result.events.extend(deferral_events(table, &deferrals, now));

    for device in devices.iter() {
        let selection = arbitrated.get(&device.id).unwrap_or(&empty);
        let state = result.states.get(&device.id);

        if let (Some(state), Some(before)) = (state, selections.get(&device.id)) {
            if let Some(event) = unsatisfiable(table, device, state, before, selection, now) {
                result.events.push(event);
            }
        }

        let status = statuses.remove(&device.id).unwrap_or(DeviceStatus::Scheduled);
        let mut schedule = DeviceSchedule::new(table, device, state, selection, status);
        if schedule.status != DeviceStatus::Scheduled {
            schedule.uncredited = uncredited(previous, &device.id, state, now);
        }
        result.schedules.push(schedule);
    }

    result
}

/// Elapsed on slots of the previous snapshot that the device hasn't been credited for
///
/// # Arguments
///
/// * 'previous' - the previously published snapshot
/// * 'device_id' - the device
/// * 'state' - the device's state, if it has one
/// * 'now' - current time
fn uncredited(previous: Option<&Snapshot>, device_id: &str, state: Option<&DeviceState>,
              now: DateTime<Utc>) -> Vec<ExecutedSlot> {
    previous.map(|p| p.executed_slots(device_id))
        .unwrap_or_default()
        .into_iter()
        .filter(|s| s.end <= now && state.is_none_or(|st| s.start >= st.accounted_until))
        .collect()
}

/// Accounts and selects for one device, returns the status to publish if the device
/// is to be kept off
///
/// # Arguments
///
/// * 'table' - price table for the horizon
/// * 'device' - the device
/// * 'result' - the pass result, receives state updates and events
/// * 'previous' - the previously published snapshot
/// * 'now' - current time
/// * 'params' - scheduling parameters
/// * 'timezone' - timezone used for period alignment
fn schedule_device(table: &PriceTable, device: &Device, result: &mut Refresh, previous: Option<&Snapshot>,
                   now: DateTime<Utc>, params: &SchedulingParameters, timezone: Tz)
    -> Result<BTreeSet<usize>, DeviceStatus> {

    if !device.enabled {
        return Err(DeviceStatus::Disabled);
    }

    if let Err(e) = device.validate() {
        result.events.push(Event::for_device(now, &device.id, EventKind::InvalidConfig { reason: e.to_string() }));
        return Err(DeviceStatus::InvalidConfig(e.to_string()));
    }

    let state = match result.states.get(&device.id) {
        Some(state) => state.clone(),
        None => {
            let state = DeviceState::new(device, now, params.anchor, timezone);
            result.events.push(Event::for_device(now, &device.id,
                EventKind::StateCreated { period_start: state.current_period_start }));
            result.states.insert(device.id.clone(), state.clone());
            result.state_changed = true;
            state
        },
    };

    let executed = previous.map(|p| p.executed_slots(&device.id)).unwrap_or_default();
    let state = match account(device, &state, &executed, now, DebtLimits::for_device(device, params)) {
        Ok((next, events)) => {
            if next != state {
                result.states.insert(device.id.clone(), next.clone());
                result.state_changed = true;
            }
            result.events.extend(events);
            next
        },
        Err(e) => {
            result.events.push(Event::for_device(now, &device.id,
                EventKind::ReconciliationFailed { reason: e.to_string() }));
            return Err(DeviceStatus::ReconciliationFailed(e.to_string()));
        },
    };

    select(table, device, &state, now).map_err(|e| {
        result.events.push(Event::for_device(now, &device.id, EventKind::InvalidConfig { reason: e.to_string() }));
        DeviceStatus::InvalidConfig(e.to_string())
    })
}

/// Reports deferrals, consecutive slots of the same device and reason as one event
///
/// # Arguments
///
/// * 'table' - price table the slots index into
/// * 'deferrals' - deferrals from the arbiter
/// * 'now' - time to stamp the events with
fn deferral_events(table: &PriceTable, deferrals: &[Deferral], now: DateTime<Utc>) -> Vec<Event> {
    let mut sorted: Vec<&Deferral> = deferrals.iter().collect();
    sorted.sort_by(|a, b| a.device_id.cmp(&b.device_id).then(a.slot.cmp(&b.slot)));

    let mut events: Vec<Event> = Vec::new();
    let mut run: Option<(&Deferral, usize)> = None;

    for d in sorted {
        run = match run {
            Some((first, len)) if first.device_id == d.device_id && first.reason == d.reason && first.slot + len == d.slot =>
                Some((first, len + 1)),
            Some((first, len)) => {
                events.push(deferral_event(table, first, len, now));
                Some((d, 1))
            },
            None => Some((d, 1)),
        };
    }
    if let Some((first, len)) = run {
        events.push(deferral_event(table, first, len, now));
    }

    events
}

fn deferral_event(table: &PriceTable, first: &Deferral, slots: usize, now: DateTime<Utc>) -> Event {
    Event::for_device(now, &first.device_id, EventKind::Deferred {
        slot_start: table.entries[first.slot].start,
        slots,
        reason: first.reason.to_string(),
    })
}

/// Returns an event if arbitration left a period mode device without any slot for
/// the rest of its current period while it still has hours to run
///
/// # Arguments
///
/// * 'table' - price table for the horizon
/// * 'device' - the device
/// * 'state' - the device's state after accounting
/// * 'before' - selection before arbitration
/// * 'after' - selection after arbitration
/// * 'now' - current time
fn unsatisfiable(table: &PriceTable, device: &Device, state: &DeviceState, before: &BTreeSet<usize>,
                 after: &BTreeSet<usize>, now: DateTime<Utc>) -> Option<Event> {
    if device.mode != ScheduleMode::Period || remaining_target_hours(device, state) <= 0.0 {
        return None;
    }

    let window = current_period_window(table, device, state, now);
    let had_slots = window.iter().any(|i| before.contains(i));
    let has_slots = window.iter().any(|i| after.contains(i));

    if had_slots && !has_slots {
        Some(Event::for_device(now, &device.id, EventKind::UnsatisfiableRequirement {
            period_start: state.current_period_start,
            period_end: state.period_end(device),
        }))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeDelta, TimeZone};
    use crate::price_table::hourly_table;
    use crate::publisher::publish;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap()
    }

    fn params() -> SchedulingParameters {
        SchedulingParameters {
            refresh_minutes: 15,
            period_anchor: "00:00".to_string(),
            max_debt_hours: 24.0,
            max_credit_hours: 0.0,
            max_total_power_w: None,
            event_log_size: 100,
            anchor: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
        }
    }

    fn period_device(id: &str, required_hours: f64, period_hours: u32, priority: u32) -> Device {
        let mut device = Device::new(id, ScheduleMode::Period);
        device.required_hours = required_hours;
        device.period_hours = period_hours;
        device.priority = priority;
        device
    }

    fn run(table: &PriceTable, devices: &[Device], states: &BTreeMap<String, DeviceState>,
           previous: Option<&Snapshot>, now: DateTime<Utc>, enabled: bool) -> (Refresh, Snapshot) {
        let switches = ManualSwitches { enabled, ..ManualSwitches::default() };
        run_with(table, devices, states, previous, now, &switches, None)
    }

    fn run_with(table: &PriceTable, devices: &[Device], states: &BTreeMap<String, DeviceState>,
                previous: Option<&Snapshot>, now: DateTime<Utc>, switches: &ManualSwitches,
                forecast: Option<&Forecast>) -> (Refresh, Snapshot) {
        let mut r = refresh(table, devices, states, previous, now, &params(), chrono_tz::UTC, switches, forecast);
        let snapshot = publish(table, std::mem::take(&mut r.schedules), switches.enabled, "flat", r.events.clone(), now);
        (r, snapshot)
    }

    #[test]
    fn creates_state_and_selects() {
        let table = hourly_table(t0(), &[10.0, 5.0, 20.0, 8.0]);
        let devices = vec![period_device("boiler", 2.0, 4, 100)];

        let (r, snapshot) = run(&table, &devices, &BTreeMap::new(), None, t0(), true);
        assert!(r.state_changed);
        assert_eq!(r.states["boiler"].current_period_start, t0());
        assert!(matches!(r.events[0].kind, EventKind::StateCreated { .. }));
        assert_eq!(snapshot.devices[0].slots, vec![false, true, false, true]);
    }

    #[test]
    fn repeated_refresh_is_stable() {
        let table = hourly_table(t0(), &[10.0, 5.0, 20.0, 8.0]);
        let devices = vec![period_device("boiler", 2.0, 4, 100)];

        let (first, snapshot) = run(&table, &devices, &BTreeMap::new(), None, t0(), true);
        let (second, again) = run(&table, &devices, &first.states, Some(&snapshot), t0(), true);
        assert!(!second.state_changed);
        assert_eq!(second.states, first.states);
        assert_eq!(again.devices, snapshot.devices);
    }

    #[test]
    fn executed_slots_are_credited() {
        let table = hourly_table(t0(), &[5.0, 10.0, 20.0, 8.0]);
        let devices = vec![period_device("boiler", 2.0, 4, 100)];

        let (first, snapshot) = run(&table, &devices, &BTreeMap::new(), None, t0(), true);
        assert_eq!(snapshot.devices[0].slots, vec![true, false, false, true]);

        let now = t0() + TimeDelta::hours(1);
        let (second, again) = run(&table, &devices, &first.states, Some(&snapshot), now, true);
        assert_eq!(second.states["boiler"].hours_delivered, 1.0);
        assert_eq!(again.devices[0].slots, vec![false, false, false, true]);
    }

    #[test]
    fn master_switch_off_publishes_all_off() {
        let table = hourly_table(t0(), &[10.0, 5.0, 20.0, 8.0]);
        let devices = vec![period_device("boiler", 2.0, 4, 100)];
        let (first, _) = run(&table, &devices, &BTreeMap::new(), None, t0(), true);

        let (off, snapshot) = run(&table, &devices, &first.states, None, t0() + TimeDelta::hours(9), false);
        assert!(!off.state_changed);
        assert_eq!(off.states, first.states);
        assert!(snapshot.devices[0].slots.iter().all(|on| !on));
        assert_eq!(snapshot.devices[0].status, DeviceStatus::Suspended);
    }

    #[test]
    fn invalid_device_is_isolated() {
        let table = hourly_table(t0(), &[10.0, 5.0, 20.0, 8.0]);
        let devices = vec![
            period_device("broken", 6.0, 4, 100),
            period_device("boiler", 1.0, 4, 100),
        ];

        let (r, snapshot) = run(&table, &devices, &BTreeMap::new(), None, t0(), true);
        assert!(!r.states.contains_key("broken"));
        assert!(matches!(snapshot.devices[0].status, DeviceStatus::InvalidConfig(_)));
        assert!(snapshot.devices[0].slots.iter().all(|on| !on));
        assert_eq!(snapshot.devices[1].slots, vec![false, true, false, false]);
        assert!(r.events.iter().any(|e| matches!(e.kind, EventKind::InvalidConfig { .. })));
    }

    #[test]
    fn disabled_device_keeps_state() {
        let table = hourly_table(t0(), &[10.0, 5.0, 20.0, 8.0]);
        let mut devices = vec![period_device("boiler", 2.0, 4, 100)];
        let (first, _) = run(&table, &devices, &BTreeMap::new(), None, t0(), true);

        devices[0].enabled = false;
        let (r, snapshot) = run(&table, &devices, &first.states, None, t0() + TimeDelta::hours(5), true);
        assert_eq!(r.states, first.states);
        assert_eq!(snapshot.devices[0].status, DeviceStatus::Disabled);
    }

    #[test]
    fn arbitration_reports_unsatisfiable_requirement() {
        let table = hourly_table(t0(), &[10.0, 5.0, 20.0, 8.0]);
        let mut heater = period_device("heater", 4.0, 4, 1);
        heater.max_concurrent_others = Some(0);
        let devices = vec![heater, period_device("boiler", 1.0, 4, 2)];

        let (r, snapshot) = run(&table, &devices, &BTreeMap::new(), None, t0(), true);
        assert!(snapshot.devices[0].slots.iter().all(|&on| on));
        assert!(snapshot.devices[1].slots.iter().all(|&on| !on));

        let deferred: Vec<&Event> = r.events.iter().filter(|e| matches!(e.kind, EventKind::Deferred { .. })).collect();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].device_id.as_deref(), Some("boiler"));
        assert!(r.events.iter().any(|e| matches!(e.kind, EventKind::UnsatisfiableRequirement { .. })));
    }

    #[test]
    fn deferred_slots_are_not_credited() {
        let table = hourly_table(t0(), &[5.0, 10.0, 20.0, 8.0]);
        let mut heater = period_device("heater", 1.0, 4, 1);
        heater.max_concurrent_others = Some(0);
        let devices = vec![heater, period_device("boiler", 1.0, 4, 2)];

        let (first, snapshot) = run(&table, &devices, &BTreeMap::new(), None, t0(), true);
        assert_eq!(snapshot.devices[1].slots, vec![false, false, false, false]);

        let now = t0() + TimeDelta::hours(1);
        let (second, again) = run(&table, &devices, &first.states, Some(&snapshot), now, true);
        assert_eq!(second.states["heater"].hours_delivered, 1.0);
        assert_eq!(second.states["boiler"].hours_delivered, 0.0);
        assert_eq!(again.devices[1].slots, vec![false, false, false, true]);
    }

    #[test]
    fn delivery_before_master_switch_off_is_credited() {
        let table = hourly_table(t0(), &[1.0, 9.0, 9.0, 9.0]);
        let devices = vec![period_device("boiler", 1.0, 4, 100)];

        let (first, snapshot) = run(&table, &devices, &BTreeMap::new(), None, t0(), true);
        assert_eq!(snapshot.devices[0].slots, vec![true, false, false, false]);

        let (off, suspended) = run(&table, &devices, &first.states, Some(&snapshot), t0() + TimeDelta::minutes(70), false);
        assert_eq!(off.states, first.states);
        assert_eq!(suspended.devices[0].uncredited.len(), 1);

        let now = t0() + TimeDelta::minutes(80);
        let (on, again) = run(&table, &devices, &off.states, Some(&suspended), now, true);
        assert_eq!(on.states["boiler"].hours_delivered, 1.0);
        assert_eq!(again.devices[0].slots, vec![false, false, false, false]);
        assert!(again.devices[0].uncredited.is_empty());

        // credited once only
        let (later, _) = run(&table, &devices, &on.states, Some(&again), now + TimeDelta::minutes(10), true);
        assert_eq!(later.states["boiler"].hours_delivered, 1.0);
    }

    #[test]
    fn delivery_before_device_switched_off_is_credited() {
        let table = hourly_table(t0(), &[1.0, 9.0, 9.0, 9.0]);
        let devices = vec![period_device("boiler", 1.0, 4, 100)];
        let (first, snapshot) = run(&table, &devices, &BTreeMap::new(), None, t0(), true);

        let mut switches = ManualSwitches::default();
        switches.disabled_devices.insert("boiler".to_string());
        let (off, disabled) = run_with(&table, &devices, &first.states, Some(&snapshot),
                                       t0() + TimeDelta::minutes(70), &switches, None);
        assert_eq!(off.states, first.states);
        assert_eq!(disabled.devices[0].status, DeviceStatus::Disabled);
        assert!(disabled.devices[0].slots.iter().all(|on| !on));

        let (on, again) = run(&table, &devices, &off.states, Some(&disabled), t0() + TimeDelta::minutes(80), true);
        assert_eq!(on.states["boiler"].hours_delivered, 1.0);
        assert_eq!(again.devices[0].slots, vec![false, false, false, false]);
    }

    #[test]
    fn slot_in_progress_at_first_sight_is_credited() {
        let table = hourly_table(t0(), &[1.0, 9.0, 9.0, 9.0]);
        let devices = vec![period_device("boiler", 1.0, 4, 100)];

        let (first, snapshot) = run(&table, &devices, &BTreeMap::new(), None, t0() + TimeDelta::minutes(5), true);
        assert_eq!(snapshot.devices[0].slots, vec![true, false, false, false]);

        let (second, again) = run(&table, &devices, &first.states, Some(&snapshot), t0() + TimeDelta::minutes(65), true);
        assert_eq!(second.states["boiler"].hours_delivered, 1.0);
        assert_eq!(again.devices[0].slots, vec![false, false, false, false]);
    }

    #[test]
    fn cold_forecast_raises_requirement() {
        let table = hourly_table(t0(), &[4.0, 1.0, 3.0, 2.0, 5.0, 6.0]);
        let mut heater = period_device("heater", 1.0, 24, 100);
        heater.weather_adjustment = true;
        // (16 - 10) * 0.5 + 2 * 0.5 - 2 = 2 hours
        heater.heating_curve = 0.5;
        let devices = vec![heater];

        let forecast = Forecast { hourly: (0..24).map(|h| (t0() + TimeDelta::hours(h), 10.0)).collect() };
        let switches = ManualSwitches::default();
        let (_, snapshot) = run_with(&table, &devices, &BTreeMap::new(), None, t0(), &switches, Some(&forecast));
        assert_eq!(snapshot.devices[0].required_hours, 2.0);
        assert_eq!(snapshot.devices[0].slots, vec![false, true, false, true, false, false]);

        let (_, snapshot) = run_with(&table, &devices, &BTreeMap::new(), None, t0(), &switches, None);
        assert_eq!(snapshot.devices[0].required_hours, 1.0);
        assert_eq!(snapshot.devices[0].slots, vec![false, true, false, false, false, false]);
    }
}
