use std::collections::HashMap;
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Deserialize, Debug)]
pub struct IndexEntry {
    #[serde(rename = "deliveryStart")]
    pub delivery_start: DateTime<Utc>,
    #[serde(rename = "deliveryEnd")]
    pub delivery_end: DateTime<Utc>,
    /// Price in currency per MWh keyed by area, e.g. "EE"
    #[serde(rename = "entryPerArea")]
    pub entry_per_area: HashMap<String, f64>,
}

/// Day ahead price indices document as saved from the Nord Pool data portal
#[derive(Deserialize, Debug)]
pub struct DayAheadPriceIndices {
    #[serde(rename = "multiIndexEntries")]
    pub multi_index_entries: Vec<IndexEntry>,
}
