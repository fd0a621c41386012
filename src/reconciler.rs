use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::config::SchedulingParameters;
use crate::device::{Device, DeviceState};
use crate::errors::SchedulingError;
use crate::events::{Event, EventKind};

/// Ceilings for carried over hours, both given as magnitudes
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DebtLimits {
    pub max_debt: f64,
    pub max_credit: f64,
}

impl DebtLimits {
    /// Returns the limits for a device, device settings override the global ones
    ///
    /// # Arguments
    ///
    /// * 'device' - the device
    /// * 'params' - global scheduling parameters
    pub fn for_device(device: &Device, params: &SchedulingParameters) -> DebtLimits {
        DebtLimits {
            max_debt: device.max_debt_hours.unwrap_or(params.max_debt_hours),
            max_credit: device.max_credit_hours.unwrap_or(params.max_credit_hours),
        }
    }
}

/// A slot the device was published as on for
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct ExecutedSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ExecutedSlot {
    fn hours(&self) -> f64 {
        (self.end - self.start).num_seconds() as f64 / 3600.0
    }
}

/// Closes the device's current period, carrying the shortfall (or surplus) into debt
/// and advancing the period start by exactly one period length
///
/// # Arguments
///
/// * 'device' - the device
/// * 'state' - the state to reconcile, left untouched on error
/// * 'limits' - debt and credit ceilings
/// * 'time' - time to stamp the event with
pub fn reconcile(device: &Device, state: &DeviceState, limits: DebtLimits, time: DateTime<Utc>)
    -> Result<(DeviceState, Event), SchedulingError> {

    let shortfall = device.required_hours - state.hours_delivered;
    let debt = (state.debt_hours + shortfall).min(limits.max_debt).max(-limits.max_credit);

    if !shortfall.is_finite() || !debt.is_finite() {
        return Err(SchedulingError::reconciliation(&device.id,
            format!("non finite debt (delivered {}, debt {})", state.hours_delivered, state.debt_hours)));
    }
    if limits.max_debt < 0.0 || limits.max_credit < 0.0 {
        return Err(SchedulingError::reconciliation(&device.id, "negative debt ceiling"));
    }

    let next = DeviceState {
        device_id: state.device_id.clone(),
        current_period_start: state.current_period_start + device.period_length(),
        hours_delivered: 0.0,
        debt_hours: debt,
        accounted_until: state.accounted_until,
    };

    let event = Event::for_device(time, &device.id, EventKind::Reconciled {
        period_start: state.current_period_start,
        delivered_hours: state.hours_delivered,
        shortfall_hours: shortfall,
        debt_before: state.debt_hours,
        debt_after: debt,
    });

    Ok((next, event))
}

/// Credits elapsed executed slots and reconciles every period boundary crossed up to now
///
/// Each executed slot is credited once, to the period its start falls in, and only
/// when it has ended. Periods are closed in order, so a late run reconciles each
/// missed period separately. The whole step is all or nothing: on error the caller
/// keeps the state it passed in.
///
/// # Arguments
///
/// * 'device' - the device
/// * 'state' - the current state
/// * 'executed' - slots the device was on for according to the last published schedule
/// * 'now' - current time
/// * 'limits' - debt and credit ceilings
pub fn account(device: &Device, state: &DeviceState, executed: &[ExecutedSlot], now: DateTime<Utc>, limits: DebtLimits)
    -> Result<(DeviceState, Vec<Event>), SchedulingError> {

    if device.period_hours == 0 {
        return Err(SchedulingError::invalid_config(&device.id, "period_hours must be positive"));
    }

    let mut next = state.clone();
    let mut events: Vec<Event> = Vec::new();

    let mut elapsed: Vec<ExecutedSlot> = executed.iter()
        .copied()
        .filter(|s| s.start >= state.accounted_until && s.end <= now)
        .collect();
    elapsed.sort_by_key(|s| s.start);

    for slot in elapsed.iter() {
        while slot.start >= next.period_end(device) {
            let (reconciled, event) = reconcile(device, &next, limits, now)?;
            next = reconciled;
            events.push(event);
        }
        if slot.start >= next.current_period_start {
            next.hours_delivered += slot.hours();
        }
    }

    while now >= next.period_end(device) {
        let (reconciled, event) = reconcile(device, &next, limits, now)?;
        next = reconciled;
        events.push(event);
    }

    next.accounted_until = elapsed.iter()
        .map(|s| s.end)
        .fold(state.accounted_until, |acc, end| acc.max(end));

    Ok((next, events))
}

/// Clears the debt of a device, returns the reset event
///
/// # Arguments
///
/// * 'state' - state to reset
/// * 'time' - time to stamp the event with
pub fn reset_debt(state: &mut DeviceState, time: DateTime<Utc>) -> Event {
    let debt_before = state.debt_hours;
    state.debt_hours = 0.0;
    Event::for_device(time, &state.device_id, EventKind::DebtReset { debt_before })
}
