use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fmt::Formatter;
use crate::device::Device;

/// Slot selections per device id
pub type Selections = BTreeMap<String, BTreeSet<usize>>;

/// Why a device lost a slot
#[derive(Clone, Debug, PartialEq)]
pub enum DeferralReason {
    /// The named device allows at most `limit` other devices on at the same time
    Concurrency { device: String, limit: usize },
    /// Summed estimated power exceeded the budget
    PowerBudget { budget: f64 },
}

/// Implementation of the Display Trait for pretty print
impl fmt::Display for DeferralReason {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            DeferralReason::Concurrency { device, limit } =>
                write!(f, "{} allows at most {} other device(s) on", device, limit),
            DeferralReason::PowerBudget { budget } =>
                write!(f, "total power above budget {:.0} W", budget),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Deferral {
    pub device_id: String,
    pub slot: usize,
    pub reason: DeferralReason,
}

/// Resolves conflicts between the devices' independent selections
///
/// For every slot the devices that are on are ranked by priority (lower value first)
/// and then by id. While any device's max_concurrent_others is exceeded, or the
/// power budget is exceeded, the lowest ranked device is deferred. Slots are only
/// ever removed, never added.
///
/// # Arguments
///
/// * 'selections' - per device selected slot indices
/// * 'devices' - device configurations
/// * 'max_total_power_w' - optional shared power budget
pub fn arbitrate(selections: &Selections, devices: &[Device], max_total_power_w: Option<f64>) -> (Selections, Vec<Deferral>) {
    let by_id: BTreeMap<&str, &Device> = devices.iter().map(|d| (d.id.as_str(), d)).collect();

    let mut result = selections.clone();
    let mut deferrals: Vec<Deferral> = Vec::new();

    let slots: BTreeSet<usize> = selections.values().flatten().copied().collect();
    for slot in slots {
        let mut on: Vec<&Device> = result.iter()
            .filter(|(_, selected)| selected.contains(&slot))
            .filter_map(|(id, _)| by_id.get(id.as_str()).copied())
            .collect();
        on.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

        loop {
            let others = on.len().saturating_sub(1);
            let reason = if let Some(capped) = on.iter().find(|d| d.max_concurrent_others.is_some_and(|k| others > k)) {
                DeferralReason::Concurrency {
                    device: capped.id.clone(),
                    limit: capped.max_concurrent_others.unwrap_or(0),
                }
            } else if let Some(budget) = max_total_power_w.filter(|&b| on.iter().map(|d| d.estimated_power_w).sum::<f64>() > b) {
                DeferralReason::PowerBudget { budget }
            } else {
                break;
            };

            let Some(lowest) = on.pop() else { break };
            if let Some(selected) = result.get_mut(&lowest.id) {
                selected.remove(&slot);
            }
            deferrals.push(Deferral { device_id: lowest.id.clone(), slot, reason });
        }
    }

    (result, deferrals)
}
