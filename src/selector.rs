use std::collections::BTreeSet;
use chrono::{DateTime, Utc};
use crate::device::{Device, DeviceState, ScheduleMode};
use crate::errors::SchedulingError;
use crate::price_table::PriceTable;

/// Tolerance when converting hours to slot counts
const EPSILON: f64 = 1e-9;

/// Per slot overrides derived from a device's always on/off settings
struct SlotConstraints {
    forced_on: Vec<bool>,
    forced_off: Vec<bool>,
}

impl SlotConstraints {
    /// Marks forced slots for a device, always off wins over always on
    ///
    /// # Arguments
    ///
    /// * 'table' - the price table
    /// * 'device' - the device to derive constraints for
    fn for_device(table: &PriceTable, device: &Device) -> Result<SlotConstraints, SchedulingError> {
        let on_hours = device.always_on_hours()?;
        let off_hours = device.always_off_hours()?;

        let forced_off: Vec<bool> = table.entries.iter()
            .map(|e| off_hours.contains(&e.local_hour))
            .collect();
        let forced_on: Vec<bool> = table.entries.iter().zip(forced_off.iter())
            .map(|(e, &off)| {
                !off && (on_hours.contains(&e.local_hour)
                    || device.always_on_price.is_some_and(|p| e.effective_price < p))
            })
            .collect();

        Ok(SlotConstraints { forced_on, forced_off })
    }
}

/// Selects the slots a device should be on for over the remaining horizon
///
/// The current period gets the remaining, debt adjusted, target while any following
/// periods inside the horizon get the plain per period requirement. The result only
/// depends on the inputs, so repeated calls give identical selections.
///
/// # Arguments
///
/// * 'table' - the price table for the horizon
/// * 'device' - the device configuration
/// * 'state' - the device's accounting state
/// * 'now' - current time, slots that have ended are never selected
pub fn select(table: &PriceTable, device: &Device, state: &DeviceState, now: DateTime<Utc>)
    -> Result<BTreeSet<usize>, SchedulingError> {

    device.validate()?;
    let constraints = SlotConstraints::for_device(table, device)?;

    let mut selected: BTreeSet<usize> = BTreeSet::new();
    let Some(table_end) = table.end() else { return Ok(selected) };

    let mut period_start = state.current_period_start;
    let mut is_current = true;
    while period_start < table_end {
        let period_end = period_start + device.period_length();
        let window = window_indices(table, period_start, period_end, now);

        let chosen = match device.mode {
            ScheduleMode::Period => {
                let target = if is_current { remaining_target_hours(device, state) } else { device.required_hours };
                select_cheapest(table, device, &window, &constraints, target)
            },
            ScheduleMode::Threshold => {
                let cap = device.max_hours_per_period.map(|h| {
                    if is_current { (h - state.hours_delivered).max(0.0) } else { h }
                });
                select_below_threshold(table, device, &window, &constraints, cap)
            },
        };
        selected.extend(chosen);

        period_start = period_end;
        is_current = false;
    }

    Ok(selected)
}

/// Hours still to run in the current period, debt increases and credit decreases it
///
/// # Arguments
///
/// * 'device' - the device configuration
/// * 'state' - the device's accounting state
pub fn remaining_target_hours(device: &Device, state: &DeviceState) -> f64 {
    (device.required_hours - state.hours_delivered + state.debt_hours).max(0.0)
}

/// Returns table indices for slots of the device's current period that have not yet ended
///
/// # Arguments
///
/// * 'table' - the price table
/// * 'device' - the device configuration
/// * 'state' - the device's accounting state
/// * 'now' - current time
pub fn current_period_window(table: &PriceTable, device: &Device, state: &DeviceState, now: DateTime<Utc>) -> Vec<usize> {
    window_indices(table, state.current_period_start, state.period_end(device), now)
}

/// Number of slots needed to cover the given hours, rounded up
///
/// # Arguments
///
/// * 'hours' - hours to cover
/// * 'slot_hours' - slot length in hours
pub fn slots_for_hours(hours: f64, slot_hours: f64) -> usize {
    if hours <= 0.0 || slot_hours <= 0.0 {
        return 0;
    }
    ((hours / slot_hours) - EPSILON).ceil().max(0.0) as usize
}

fn window_indices(table: &PriceTable, start: DateTime<Utc>, end: DateTime<Utc>, now: DateTime<Utc>) -> Vec<usize> {
    table.entries.iter().enumerate()
        .filter(|(_, e)| e.end > now && e.start >= start && e.start < end)
        .map(|(i, _)| i)
        .collect()
}

/// Period mode: the target number of cheapest slots within the window, earlier slot
/// wins on equal price. Forced on slots count toward the target.
///
/// # Arguments
///
/// * 'table' - the price table
/// * 'device' - the device configuration
/// * 'window' - candidate slot indices in time order
/// * 'constraints' - forced on/off slots
/// * 'target_hours' - hours to cover within the window
fn select_cheapest(table: &PriceTable, device: &Device, window: &[usize],
                   constraints: &SlotConstraints, target_hours: f64) -> Vec<usize> {
    let target_slots = slots_for_hours(target_hours, table.slot_hours());

    let mut chosen: Vec<usize> = window.iter()
        .copied()
        .filter(|&i| constraints.forced_on[i])
        .collect();

    let mut candidates: Vec<usize> = window.iter()
        .copied()
        .filter(|&i| !constraints.forced_off[i] && !constraints.forced_on[i])
        .collect();
    candidates.sort_by(|&a, &b| {
        table.entries[a].effective_price.total_cmp(&table.entries[b].effective_price)
            .then(a.cmp(&b))
    });
    candidates = within_price_rank(device, candidates);

    let remaining = target_slots.saturating_sub(chosen.len());
    chosen.extend(candidates.into_iter().take(remaining));
    chosen
}

/// Keeps the candidates whose percentile rank, cheapest first, lies within the
/// device's min and max price rank
///
/// # Arguments
///
/// * 'device' - the device configuration
/// * 'by_price' - candidate slot indices sorted by price, cheapest first
fn within_price_rank(device: &Device, by_price: Vec<usize>) -> Vec<usize> {
    if device.min_price_rank.is_none() && device.max_price_rank.is_none() {
        return by_price;
    }

    let len = by_price.len() as f64;
    by_price.into_iter().enumerate()
        .filter(|(rank, _)| {
            let percentile = *rank as f64 / len * 100.0;
            device.min_price_rank.is_none_or(|min| percentile >= min)
                && device.max_price_rank.is_none_or(|max| percentile <= max)
        })
        .map(|(_, i)| i)
        .collect()
}

/// Threshold mode: every slot at or below the threshold price, earliest first until
/// the optional cap is reached. Forced on slots are always kept and count toward the cap.
/// A price rank, if given, further limits the slots to those within it.
///
/// # Arguments
///
/// * 'table' - the price table
/// * 'device' - the device configuration
/// * 'window' - candidate slot indices in time order
/// * 'constraints' - forced on/off slots
/// * 'cap_hours' - optional max hours within the window
fn select_below_threshold(table: &PriceTable, device: &Device, window: &[usize],
                          constraints: &SlotConstraints, cap_hours: Option<f64>) -> Vec<usize> {
    let threshold = device.threshold_price.unwrap_or(f64::NEG_INFINITY);
    let cap_slots = cap_hours.map(|h| ((h / table.slot_hours()) + EPSILON).floor() as usize);

    let mut chosen: Vec<usize> = window.iter()
        .copied()
        .filter(|&i| constraints.forced_on[i])
        .collect();

    let mut by_price: Vec<usize> = window.iter()
        .copied()
        .filter(|&i| !constraints.forced_off[i] && !constraints.forced_on[i])
        .collect();
    by_price.sort_by(|&a, &b| {
        table.entries[a].effective_price.total_cmp(&table.entries[b].effective_price)
            .then(a.cmp(&b))
    });
    let ranked: BTreeSet<usize> = within_price_rank(device, by_price).into_iter().collect();

    for &i in window.iter() {
        if !ranked.contains(&i) {
            continue;
        }
        if table.entries[i].effective_price <= threshold {
            if cap_slots.is_some_and(|cap| chosen.len() >= cap) {
                break;
            }
            chosen.push(i);
        }
    }

    chosen
}
