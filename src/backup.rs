use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use log::{info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use crate::device::{Device, DeviceState};
use crate::errors::BackupError;
use crate::publisher::{ScheduleDecision, Snapshot};

const STATES_FILE: &str = "device_states.json";

/// Saves device states to file
///
/// # Arguments
///
/// * 'backup_dir' - the directory to save the file to
/// * 'states' - device states keyed by device id
pub fn save_device_states(backup_dir: &str, states: &BTreeMap<String, DeviceState>) -> Result<(), BackupError> {
    let file_path = Path::new(backup_dir).join(STATES_FILE);
    write_json(&file_path, states)
}

/// Loads device states from file, states for devices no longer configured are dropped
///
/// # Arguments
///
/// * 'backup_dir' - the directory to load the file from
/// * 'devices' - configured devices
pub fn load_device_states(backup_dir: &str, devices: &[Device]) -> Result<BTreeMap<String, DeviceState>, BackupError> {
    let file_path = Path::new(backup_dir).join(STATES_FILE);
    let Some(mut states) = read_json::<BTreeMap<String, DeviceState>>(&file_path)? else {
        return Ok(BTreeMap::new());
    };

    let configured: HashSet<&str> = devices.iter().map(|d| d.id.as_str()).collect();
    states.retain(|id, _| {
        let keep = configured.contains(id.as_str());
        if !keep {
            warn!("dropping state of unconfigured device {}", id);
        }
        keep
    });
    info!("loaded {} device state(s)", states.len());

    Ok(states)
}

/// Saves the published snapshot
///
/// # Arguments
///
/// * 'snapshot_file' - file to write
/// * 'snapshot' - the snapshot
pub fn save_snapshot(snapshot_file: &str, snapshot: &Snapshot) -> Result<(), BackupError> {
    write_json(Path::new(snapshot_file), snapshot)
}

/// Loads the last published snapshot, if any
///
/// # Arguments
///
/// * 'snapshot_file' - file to read
pub fn load_snapshot(snapshot_file: &str) -> Result<Option<Snapshot>, BackupError> {
    read_json(Path::new(snapshot_file))
}

/// Saves the decision list for the device driver
///
/// # Arguments
///
/// * 'decisions_file' - file to write
/// * 'decisions' - decisions of the latest snapshot
pub fn save_decisions(decisions_file: &str, decisions: &[ScheduleDecision]) -> Result<(), BackupError> {
    write_json(Path::new(decisions_file), decisions)
}

/// Writes json through a temporary file so a crash never leaves a partial file behind
fn write_json<T: Serialize + ?Sized>(file_path: &Path, value: &T) -> Result<(), BackupError> {
    let json = serde_json::to_string_pretty(value)?;

    let tmp_path = file_path.with_extension("json.tmp");
    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, file_path)?;

    Ok(())
}

fn read_json<T: DeserializeOwned>(file_path: &Path) -> Result<Option<T>, BackupError> {
    if file_path.exists() {
        let json = fs::read_to_string(file_path)?;
        Ok(Some(serde_json::from_str(&json)?))
    } else {
        Ok(None)
    }
}
