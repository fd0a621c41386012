use std::collections::BTreeSet;
use std::fmt;
use std::fmt::Formatter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::device::{Device, DeviceState, ScheduleMode};
use crate::events::Event;
use crate::price_table::{PriceEntry, PriceStats, PriceTable};
use crate::reconciler::ExecutedSlot;

/// How a device was handled in the refresh that produced a snapshot
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "code", content = "reason", rename_all = "snake_case")]
pub enum DeviceStatus {
    Scheduled,
    /// Device is disabled in the configuration
    Disabled,
    /// Master switch is off
    Suspended,
    InvalidConfig(String),
    ReconciliationFailed(String),
}

/// Implementation of the Display Trait for pretty print
impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            DeviceStatus::Scheduled               => write!(f, "Scheduled"),
            DeviceStatus::Disabled                => write!(f, "Disabled "),
            DeviceStatus::Suspended               => write!(f, "Suspended"),
            DeviceStatus::InvalidConfig(_)        => write!(f, "Invalid  "),
            DeviceStatus::ReconciliationFailed(_) => write!(f, "Failed   "),
        }
    }
}

/// The published on/off sequence of one device over the horizon, with summary figures
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DeviceSchedule {
    pub id: String,
    pub name: String,
    pub mode: ScheduleMode,
    pub status: DeviceStatus,
    /// One flag per price table slot
    pub slots: Vec<bool>,
    /// Elapsed on slots of earlier snapshots not yet credited to the device
    #[serde(default)]
    pub uncredited: Vec<ExecutedSlot>,
    /// Requirement in effect, weather adjusted where configured
    pub required_hours: f64,
    pub scheduled_hours: f64,
    pub hours_delivered: f64,
    pub debt_hours: f64,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
}

/// Implementation of the Display Trait for pretty print
impl fmt::Display for DeviceSchedule {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let bitmap: String = self.slots.iter().map(|&on| if on { '#' } else { '.' }).collect();
        write!(f, "{:<16} {} {} -> scheduled {:>5.2} h, delivered {:>5.2} h, debt {:>6.2} h {}",
               self.name, self.mode, self.status, self.scheduled_hours, self.hours_delivered, self.debt_hours, bitmap)
    }
}

impl DeviceSchedule {
    /// Builds the schedule of a device from its final slot selection
    ///
    /// # Arguments
    ///
    /// * 'table' - the price table the selection indexes into
    /// * 'device' - the device
    /// * 'state' - the device's state, if it has one
    /// * 'selection' - final selected slot indices
    /// * 'status' - how the device was handled
    pub fn new(table: &PriceTable, device: &Device, state: Option<&DeviceState>,
               selection: &BTreeSet<usize>, status: DeviceStatus) -> DeviceSchedule {
        let slots: Vec<bool> = (0..table.len()).map(|i| selection.contains(&i)).collect();
        let scheduled_hours = slots.iter().filter(|&&on| on).count() as f64 * table.slot_hours();

        DeviceSchedule {
            id: device.id.clone(),
            name: device.display_name().to_string(),
            mode: device.mode,
            status,
            slots,
            uncredited: Vec::new(),
            required_hours: device.required_hours,
            scheduled_hours,
            hours_delivered: state.map_or(0.0, |s| s.hours_delivered),
            debt_hours: state.map_or(0.0, |s| s.debt_hours),
            period_start: state.map(|s| s.current_period_start),
            period_end: state.map(|s| s.period_end(device)),
        }
    }
}

/// One on/off decision for the device driver
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ScheduleDecision {
    pub device_id: String,
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    pub on: bool,
}

/// Read only view of a refresh for the device driver and the status interface
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub generated_at: DateTime<Utc>,
    pub enabled: bool,
    pub slot_minutes: i64,
    pub tariff_context: String,
    pub prices: Vec<PriceEntry>,
    pub price_stats: PriceStats,
    pub devices: Vec<DeviceSchedule>,
    pub total_scheduled_hours: f64,
    pub events: Vec<Event>,
    /// Set when the latest refresh failed and this snapshot is still in effect
    pub last_error: Option<String>,
}

/// Implementation of the Display Trait for pretty print
impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "generated {}, scheduling {}, tariff {}",
                 self.generated_at.format("%Y-%m-%d %H:%M:%S"),
                 if self.enabled { "enabled" } else { "disabled" },
                 self.tariff_context)?;
        writeln!(f, "price min {:.4}, max {:.4}, avg {:.4}, median {:.4}, total scheduled {:.2} h",
                 self.price_stats.min, self.price_stats.max, self.price_stats.avg,
                 self.price_stats.median, self.total_scheduled_hours)?;
        for d in &self.devices {
            writeln!(f, "{}", d)?;
        }
        if let Some(e) = &self.last_error {
            writeln!(f, "last error: {}", e)?;
        }
        Ok(())
    }
}

/// Assembles the snapshot of a refresh. Nothing is mutated, the result is plain data.
///
/// # Arguments
///
/// * 'table' - the price table used in the refresh
/// * 'devices' - per device schedules
/// * 'enabled' - state of the master switch
/// * 'tariff_context' - description of the network tariff in use
/// * 'events' - recent events for the status feed
/// * 'now' - generation time
pub fn publish(table: &PriceTable, devices: Vec<DeviceSchedule>, enabled: bool, tariff_context: &str,
               events: Vec<Event>, now: DateTime<Utc>) -> Snapshot {
    let total_scheduled_hours = devices.iter().map(|d| d.scheduled_hours).sum();

    Snapshot {
        generated_at: now,
        enabled,
        slot_minutes: table.slot_minutes,
        tariff_context: tariff_context.to_string(),
        prices: table.entries.clone(),
        price_stats: table.stats(),
        devices,
        total_scheduled_hours,
        events,
        last_error: None,
    }
}

impl Snapshot {
    /// Flattens the snapshot into one decision per device and slot
    pub fn decisions(&self) -> Vec<ScheduleDecision> {
        self.devices.iter()
            .flat_map(|d| {
                self.prices.iter().zip(d.slots.iter()).map(move |(p, &on)| ScheduleDecision {
                    device_id: d.id.clone(),
                    slot_start: p.start,
                    slot_end: p.end,
                    on,
                })
            })
            .collect()
    }

    /// Returns whether the device should be on at the given time, None if the
    /// device or time isn't covered
    ///
    /// # Arguments
    ///
    /// * 'device_id' - the device
    /// * 'time' - point in time to look up
    pub fn decision_at(&self, device_id: &str, time: DateTime<Utc>) -> Option<bool> {
        let device = self.devices.iter().find(|d| d.id == device_id)?;
        let idx = self.prices.iter().position(|p| p.start <= time && time < p.end)?;
        device.slots.get(idx).copied()
    }

    /// Slots the device was published as on for, including those carried over
    /// uncredited from earlier snapshots
    ///
    /// # Arguments
    ///
    /// * 'device_id' - the device
    pub fn executed_slots(&self, device_id: &str) -> Vec<ExecutedSlot> {
        let Some(device) = self.devices.iter().find(|d| d.id == device_id) else { return Vec::new() };

        device.uncredited.iter()
            .copied()
            .chain(self.prices.iter().zip(device.slots.iter())
                .filter(|(_, on)| **on)
                .map(|(p, _)| ExecutedSlot { start: p.start, end: p.end }))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use crate::price_table::hourly_table;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap()
    }

    fn snapshot() -> Snapshot {
        let table = hourly_table(t0(), &[10.0, 5.0, 20.0, 8.0]);
        let mut device = Device::new("boiler", ScheduleMode::Period);
        device.required_hours = 2.0;
        let state = DeviceState {
            device_id: "boiler".to_string(),
            current_period_start: t0(),
            hours_delivered: 0.5,
            debt_hours: 1.0,
            accounted_until: t0(),
        };
        let selection: BTreeSet<usize> = [1, 3].into_iter().collect();
        let schedule = DeviceSchedule::new(&table, &device, Some(&state), &selection, DeviceStatus::Scheduled);

        publish(&table, vec![schedule], true, "flat", Vec::new(), t0())
    }

    #[test]
    fn publish_summarizes() {
        let snapshot = snapshot();
        let device = &snapshot.devices[0];

        assert_eq!(device.slots, vec![false, true, false, true]);
        assert_eq!(device.scheduled_hours, 2.0);
        assert_eq!(device.debt_hours, 1.0);
        assert_eq!(device.period_end, Some(t0() + TimeDelta::hours(24)));
        assert_eq!(snapshot.total_scheduled_hours, 2.0);
        assert_eq!(snapshot.price_stats.min, 5.0);
    }

    #[test]
    fn decisions_cover_every_slot() {
        let decisions = snapshot().decisions();

        assert_eq!(decisions.len(), 4);
        assert_eq!(decisions.iter().filter(|d| d.on).map(|d| d.slot_start).collect::<Vec<_>>(),
                   vec![t0() + TimeDelta::hours(1), t0() + TimeDelta::hours(3)]);
    }

    #[test]
    fn lookups() {
        let snapshot = snapshot();

        assert_eq!(snapshot.decision_at("boiler", t0() + TimeDelta::minutes(90)), Some(true));
        assert_eq!(snapshot.decision_at("boiler", t0() + TimeDelta::minutes(150)), Some(false));
        assert_eq!(snapshot.decision_at("boiler", t0() + TimeDelta::hours(5)), None);
        assert_eq!(snapshot.decision_at("heater", t0()), None);

        let executed = snapshot.executed_slots("boiler");
        assert_eq!(executed.len(), 2);
        assert_eq!(executed[1].end, t0() + TimeDelta::hours(4));
        assert!(snapshot.executed_slots("heater").is_empty());
    }

    #[test]
    fn uncredited_slots_are_executed() {
        let mut snapshot = snapshot();
        let earlier = ExecutedSlot { start: t0() - TimeDelta::hours(1), end: t0() };
        snapshot.devices[0].uncredited = vec![earlier];

        let executed = snapshot.executed_slots("boiler");
        assert_eq!(executed.len(), 3);
        assert_eq!(executed[0], earlier);
    }

    #[test]
    fn survives_json() {
        let snapshot = snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
