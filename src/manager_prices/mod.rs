use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use glob::glob;
use log::{debug, info};
use crate::config::PriceParameters;
use crate::errors::PriceError;
use crate::models::nordpool_prices::DayAheadPriceIndices;
use crate::price_table::{MarketPrice, PriceTable};
use crate::tariffs::TariffSchedule;

/// Day ahead prices read from Nord Pool documents dropped into a directory
pub struct PriceSource {
    price_dir: String,
    area: String,
    vat_rate: f64,
    fixed_fees_per_kwh: f64,
    slot_minutes: i64,
    max_horizon_hours: i64,
    min_horizon_hours: i64,
    fingerprint: Vec<(PathBuf, Option<SystemTime>)>,
}

impl PriceSource {
    /// Creates a price source
    ///
    /// # Arguments
    ///
    /// * 'price_dir' - directory holding the `*_prices.json` documents
    /// * 'params' - price parameters from the configuration
    pub fn new(price_dir: &str, params: &PriceParameters) -> PriceSource {
        PriceSource {
            price_dir: price_dir.to_string(),
            area: params.area.clone(),
            vat_rate: params.vat_rate,
            fixed_fees_per_kwh: params.fixed_fees_per_kwh,
            slot_minutes: params.slot_minutes,
            max_horizon_hours: params.max_horizon_hours,
            min_horizon_hours: params.min_horizon_hours,
            fingerprint: Vec::new(),
        }
    }

    /// Returns true if price documents were added, removed or modified since the last call
    pub fn has_update(&mut self) -> Result<bool, PriceError> {
        let mut fingerprint: Vec<(PathBuf, Option<SystemTime>)> = Vec::new();
        for path in self.price_files()? {
            let modified = fs::metadata(&path).and_then(|m| m.modified()).ok();
            fingerprint.push((path, modified));
        }

        if fingerprint != self.fingerprint {
            self.fingerprint = fingerprint;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Reads all price documents and returns per kWh market prices, fees and VAT included,
    /// one per slot. Documents are read in name order and later documents override
    /// earlier ones for the same slot.
    pub fn get_market_prices(&self) -> Result<Vec<MarketPrice>, PriceError> {
        let mut prices: BTreeMap<DateTime<Utc>, f64> = BTreeMap::new();

        for path in self.price_files()? {
            let json = fs::read_to_string(&path)?;
            let document: DayAheadPriceIndices = serde_json::from_str(&json)
                .map_err(|e| PriceError::Source(format!("{}: {}", path.display(), e)))?;

            let slots = self.document_to_slots(&document)
                .map_err(|e| PriceError::Source(format!("{}: {}", path.display(), e)))?;
            debug!("{} price slot(s) from {}", slots.len(), path.display());
            prices.extend(slots);
        }

        Ok(prices.into_iter().map(|(start, price)| MarketPrice { start, price }).collect())
    }

    /// Returns the scheduling horizon: from the current slot as far as prices are
    /// contiguously available, at most max_horizon_hours.
    ///
    /// # Arguments
    ///
    /// * 'prices' - market prices
    /// * 'now' - current time
    pub fn horizon(&self, prices: &[MarketPrice], now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>), PriceError> {
        let slot_len = TimeDelta::minutes(self.slot_minutes);
        let start = now.duration_trunc(slot_len)?;
        let limit = start + TimeDelta::hours(self.max_horizon_hours);

        let mut end = start;
        let mut iter = prices.iter().skip_while(|p| p.start < start);
        while end < limit && iter.next().is_some_and(|p| p.start == end) {
            end = end + slot_len;
        }

        if end - start < TimeDelta::hours(self.min_horizon_hours) {
            return Err(PriceError::IncompleteData(
                format!("prices only cover {} - {}, at least {} hour(s) needed",
                        start.format("%Y-%m-%d %H:%M"), end.format("%Y-%m-%d %H:%M"), self.min_horizon_hours)));
        }

        Ok((start, end))
    }

    /// Builds the price table for the current horizon
    ///
    /// # Arguments
    ///
    /// * 'tariffs' - network tariff schedule
    /// * 'now' - current time
    pub fn price_table(&self, tariffs: &TariffSchedule, now: DateTime<Utc>) -> Result<PriceTable, PriceError> {
        let prices = self.get_market_prices()?;
        let (start, end) = self.horizon(&prices, now)?;
        let table = PriceTable::build(&prices, tariffs, start, end, self.slot_minutes)?;
        info!("price table {} - {}, {} slot(s)", start.format("%Y-%m-%d %H:%M"), end.format("%Y-%m-%d %H:%M"), table.len());
        for entry in table.entries.iter() {
            debug!("{}", entry);
        }

        Ok(table)
    }

    fn price_files(&self) -> Result<Vec<PathBuf>, PriceError> {
        let pattern = Path::new(&self.price_dir).join("*_prices.json");
        let mut files: Vec<PathBuf> = glob(&pattern.to_string_lossy())?
            .filter_map(Result::ok)
            .collect();
        files.sort();

        Ok(files)
    }

    /// Converts a document to slot prices
    ///
    /// Entries at least one slot long are spread over the slots they cover, shorter
    /// entries are averaged into the slot they start in.
    ///
    /// # Arguments
    ///
    /// * 'document' - the price document
    fn document_to_slots(&self, document: &DayAheadPriceIndices) -> Result<BTreeMap<DateTime<Utc>, f64>, PriceError> {
        let slot_len = TimeDelta::minutes(self.slot_minutes);
        let mut sums: BTreeMap<DateTime<Utc>, (f64, u32)> = BTreeMap::new();

        for entry in document.multi_index_entries.iter() {
            let eur_mwh = *entry.entry_per_area.get(&self.area)
                .ok_or_else(|| PriceError::Source(format!("no price for area {} at {}", self.area, entry.delivery_start)))?;
            let price = self.to_kwh_price(eur_mwh);

            if entry.delivery_end - entry.delivery_start >= slot_len {
                let mut start = entry.delivery_start.duration_trunc(slot_len)?;
                if start < entry.delivery_start {
                    start = start + slot_len;
                }
                while start + slot_len <= entry.delivery_end {
                    sums.insert(start, (price, 1));
                    start = start + slot_len;
                }
            } else {
                let sum = sums.entry(entry.delivery_start.duration_trunc(slot_len)?).or_insert((0.0, 0));
                sum.0 += price;
                sum.1 += 1;
            }
        }

        Ok(sums.into_iter().map(|(start, (sum, count))| (start, sum / count as f64)).collect())
    }

    /// Converts a price per MWh to per kWh with fixed fees and VAT added
    fn to_kwh_price(&self, per_mwh: f64) -> f64 {
        (per_mwh / 1000.0 + self.fixed_fees_per_kwh) * self.vat_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use crate::config::tests::EXAMPLE;
    use crate::config::parse_config;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap()
    }

    fn document(start: DateTime<Utc>, minutes: i64, prices: &[f64]) -> String {
        let entries: Vec<String> = prices.iter().enumerate()
            .map(|(i, p)| {
                let s = start + TimeDelta::minutes(minutes * i as i64);
                let e = s + TimeDelta::minutes(minutes);
                format!(r#"{{"deliveryStart":"{}","deliveryEnd":"{}","entryPerArea":{{"EE":{}}}}}"#,
                        s.to_rfc3339(), e.to_rfc3339(), p)
            })
            .collect();
        format!(r#"{{"deliveryDateCET":"2025-01-15","multiIndexEntries":[{}]}}"#, entries.join(","))
    }

    fn source(dir: &tempfile::TempDir, slot_minutes: i64) -> PriceSource {
        let mut config = parse_config(EXAMPLE).unwrap();
        config.prices.area = "EE".to_string();
        config.prices.vat_rate = 1.0;
        config.prices.fixed_fees_per_kwh = 0.0;
        config.prices.slot_minutes = slot_minutes;
        config.prices.max_horizon_hours = 48;
        config.prices.min_horizon_hours = 2;
        PriceSource::new(dir.path().to_str().unwrap(), &config.prices)
    }

    #[test]
    fn hourly_prices_spread_over_quarters() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("20250115_prices.json"), document(t0(), 60, &[100.0, 50.0])).unwrap();

        let prices = source(&dir, 15).get_market_prices().unwrap();
        assert_eq!(prices.len(), 8);
        assert_eq!(prices[3], MarketPrice { start: t0() + TimeDelta::minutes(45), price: 0.1 });
        assert_eq!(prices[4].price, 0.05);
    }

    #[test]
    fn quarter_prices_average_into_hours() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("20250115_prices.json"), document(t0(), 15, &[10.0, 20.0, 30.0, 40.0])).unwrap();

        let prices = source(&dir, 60).get_market_prices().unwrap();
        assert_eq!(prices.len(), 1);
        assert!((prices[0].price - 0.025).abs() < 1e-12);
    }

    #[test]
    fn later_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("20250115_prices.json"), document(t0(), 60, &[100.0, 100.0])).unwrap();
        fs::write(dir.path().join("20250116_prices.json"), document(t0() + TimeDelta::hours(1), 60, &[200.0])).unwrap();

        let prices = source(&dir, 60).get_market_prices().unwrap();
        assert_eq!(prices.iter().map(|p| p.price).collect::<Vec<f64>>(), vec![0.1, 0.2]);
    }

    #[test]
    fn horizon_is_clipped_to_coverage() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("20250115_prices.json"), document(t0(), 60, &[1.0, 2.0, 3.0, 4.0])).unwrap();
        let source = source(&dir, 60);
        let prices = source.get_market_prices().unwrap();

        let now = t0() + TimeDelta::minutes(70);
        assert_eq!(source.horizon(&prices, now).unwrap(), (t0() + TimeDelta::hours(1), t0() + TimeDelta::hours(4)));

        let late = t0() + TimeDelta::minutes(190);
        assert!(matches!(source.horizon(&prices, late), Err(PriceError::IncompleteData(_))));
    }

    #[test]
    fn gap_ends_horizon() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a_prices.json"), document(t0(), 60, &[1.0, 2.0, 3.0])).unwrap();
        fs::write(dir.path().join("b_prices.json"), document(t0() + TimeDelta::hours(4), 60, &[5.0, 6.0])).unwrap();
        let source = source(&dir, 60);
        let prices = source.get_market_prices().unwrap();

        assert_eq!(source.horizon(&prices, t0()).unwrap().1, t0() + TimeDelta::hours(3));
    }

    #[test]
    fn detects_new_documents() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source(&dir, 60);
        assert!(!source.has_update().unwrap());

        fs::write(dir.path().join("20250115_prices.json"), document(t0(), 60, &[1.0])).unwrap();
        assert!(source.has_update().unwrap());
        assert!(!source.has_update().unwrap());

        fs::write(dir.path().join("20250116_prices.json"), document(t0(), 60, &[1.0])).unwrap();
        assert!(source.has_update().unwrap());
    }

    #[test]
    fn fees_and_vat() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = source(&dir, 60);
        source.fixed_fees_per_kwh = 0.01;
        source.vat_rate = 1.5;

        assert!((source.to_kwh_price(100.0) - 0.165).abs() < 1e-12);
    }
}
