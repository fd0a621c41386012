use std::collections::VecDeque;
use std::fmt;
use std::fmt::Formatter;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

/// What happened, reported on the status feed
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    StateCreated { period_start: DateTime<Utc> },
    Reconciled {
        period_start: DateTime<Utc>,
        delivered_hours: f64,
        shortfall_hours: f64,
        debt_before: f64,
        debt_after: f64,
    },
    Deferred { slot_start: DateTime<Utc>, slots: usize, reason: String },
    UnsatisfiableRequirement { period_start: DateTime<Utc>, period_end: DateTime<Utc> },
    InvalidConfig { reason: String },
    ReconciliationFailed { reason: String },
    DebtReset { debt_before: f64 },
    RefreshFailed { reason: String },
    MasterSwitch { enabled: bool },
    DeviceSwitch { enabled: bool },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Event {
    pub time: DateTime<Utc>,
    pub device_id: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Implementation of the Display Trait for pretty print
impl fmt::Display for Event {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} [{}] ", self.time.format("%Y-%m-%d %H:%M:%S"), self.device_id.as_deref().unwrap_or("-"))?;
        match &self.kind {
            EventKind::StateCreated { period_start } =>
                write!(f, "state created, period starts {}", period_start.format("%Y-%m-%d %H:%M")),
            EventKind::Reconciled { period_start, delivered_hours, shortfall_hours, debt_before, debt_after } =>
                write!(f, "period {} reconciled: delivered {:.2} h, shortfall {:.2} h, debt {:.2} -> {:.2} h",
                       period_start.format("%Y-%m-%d %H:%M"), delivered_hours, shortfall_hours, debt_before, debt_after),
            EventKind::Deferred { slot_start, slots, reason } =>
                write!(f, "{} slot(s) from {} deferred: {}", slots, slot_start.format("%Y-%m-%d %H:%M"), reason),
            EventKind::UnsatisfiableRequirement { period_start, period_end } =>
                write!(f, "no slots left for period {} - {}, requirement can't be met",
                       period_start.format("%Y-%m-%d %H:%M"), period_end.format("%Y-%m-%d %H:%M")),
            EventKind::InvalidConfig { reason } => write!(f, "invalid config, device kept off: {}", reason),
            EventKind::ReconciliationFailed { reason } => write!(f, "reconciliation failed, state kept: {}", reason),
            EventKind::DebtReset { debt_before } => write!(f, "debt reset from {:.2} h", debt_before),
            EventKind::RefreshFailed { reason } => write!(f, "refresh failed: {}", reason),
            EventKind::MasterSwitch { enabled } =>
                write!(f, "scheduling {}", if *enabled { "enabled" } else { "disabled" }),
            EventKind::DeviceSwitch { enabled } =>
                write!(f, "device {}", if *enabled { "enabled" } else { "disabled" }),
        }
    }
}

impl Event {
    pub fn new(time: DateTime<Utc>, device_id: Option<&str>, kind: EventKind) -> Event {
        Event { time, device_id: device_id.map(str::to_string), kind }
    }

    pub fn for_device(time: DateTime<Utc>, device_id: &str, kind: EventKind) -> Event {
        Self::new(time, Some(device_id), kind)
    }

    /// Logs the event with a level matching its severity
    pub fn log(&self) {
        match self.kind {
            EventKind::InvalidConfig { .. }
            | EventKind::ReconciliationFailed { .. }
            | EventKind::RefreshFailed { .. } => error!("{}", self),
            EventKind::UnsatisfiableRequirement { .. }
            | EventKind::Deferred { .. } => warn!("{}", self),
            _ => info!("{}", self),
        }
    }
}

/// Bounded feed of the most recent events, oldest dropped first
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EventLog {
    capacity: usize,
    events: VecDeque<Event>,
}

impl EventLog {
    pub fn new(capacity: usize) -> EventLog {
        EventLog { capacity: capacity.max(1), events: VecDeque::new() }
    }

    /// Restores a feed, e.g. from a saved snapshot, keeping the most recent events
    pub fn with_events(capacity: usize, events: Vec<Event>) -> EventLog {
        let mut log = EventLog::new(capacity);
        let skip = events.len().saturating_sub(log.capacity);
        log.events.extend(events.into_iter().skip(skip));
        log
    }

    /// Logs and records an event
    pub fn push(&mut self, event: Event) {
        event.log();
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.push(event);
        }
    }

    /// Returns the recorded events, oldest first
    pub fn events(&self) -> Vec<Event> {
        self.events.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_when_full() {
        let mut log = EventLog::new(2);
        for i in 0..3 {
            log.push(Event::new(Utc::now(), None, EventKind::DebtReset { debt_before: i as f64 }));
        }

        let events = log.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::DebtReset { debt_before: 1.0 });
        assert_eq!(events[1].kind, EventKind::DebtReset { debt_before: 2.0 });

        let restored = EventLog::with_events(1, events);
        assert_eq!(restored.events()[0].kind, EventKind::DebtReset { debt_before: 2.0 });
    }

    #[test]
    fn serializes_with_kind_tag() {
        let event = Event::for_device(Utc::now(), "boiler", EventKind::MasterSwitch { enabled: false });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"master_switch\""));
        assert!(json.contains("\"device_id\":\"boiler\""));

        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
