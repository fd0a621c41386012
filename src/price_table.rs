use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Formatter;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use crate::errors::PriceError;
use crate::tariffs::TariffSchedule;

/// A raw market price for one slot, per kWh
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct MarketPrice {
    pub start: DateTime<Utc>,
    pub price: f64,
}

/// One priced slot in the scheduling horizon
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PriceEntry {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub local_hour: u32,
    pub market_price: f64,
    pub tariff_add_on: f64,
    pub effective_price: f64,
}

/// Implementation of the Display Trait for pretty print
impl fmt::Display for PriceEntry {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} -> market {:>8.4}, tariff {:>7.4}, effective {:>8.4}",
               self.start.format("%Y-%m-%d %H:%M"), self.market_price, self.tariff_add_on, self.effective_price)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct PriceStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub median: f64,
}

/// Ordered, gap free sequence of priced slots covering [start, end)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PriceTable {
    pub slot_minutes: i64,
    pub entries: Vec<PriceEntry>,
}

impl PriceTable {
    /// Builds a price table from market prices and a network tariff schedule
    ///
    /// Every slot in the horizon must have a market price, otherwise IncompleteData
    /// is returned. Market prices outside the horizon are ignored.
    ///
    /// # Arguments
    ///
    /// * 'market_prices' - market prices per slot start
    /// * 'tariffs' - the network tariff schedule to add per slot
    /// * 'horizon_start' - first slot start
    /// * 'horizon_end' - end (exclusive) of the horizon
    /// * 'slot_minutes' - slot length in minutes
    pub fn build(market_prices: &[MarketPrice], tariffs: &TariffSchedule, horizon_start: DateTime<Utc>,
                 horizon_end: DateTime<Utc>, slot_minutes: i64) -> Result<PriceTable, PriceError> {
        if slot_minutes <= 0 {
            return Err(PriceError::Source(format!("illegal slot length {}", slot_minutes)));
        }
        if horizon_end <= horizon_start {
            return Err(PriceError::IncompleteData(
                format!("empty horizon {} - {}", horizon_start, horizon_end)));
        }

        let by_start: BTreeMap<DateTime<Utc>, f64> = market_prices.iter()
            .map(|p| (p.start, p.price))
            .collect();

        let slot_len = TimeDelta::minutes(slot_minutes);
        let mut entries: Vec<PriceEntry> = Vec::new();
        let mut start = horizon_start;
        while start < horizon_end {
            let market_price = *by_start.get(&start)
                .ok_or_else(|| PriceError::IncompleteData(format!("no market price for slot {}", start)))?;
            let tariff_add_on = tariffs.add_on(start);
            entries.push(PriceEntry {
                start,
                end: start + slot_len,
                local_hour: tariffs.local_hour(start),
                market_price,
                tariff_add_on,
                effective_price: market_price + tariff_add_on,
            });
            start = start + slot_len;
        }

        Ok(PriceTable { slot_minutes, entries })
    }

    /// Slot length in hours
    pub fn slot_hours(&self) -> f64 {
        self.slot_minutes as f64 / 60.0
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.entries.last().map(|e| e.end)
    }

    /// Returns min, max, average and median effective price
    pub fn stats(&self) -> PriceStats {
        if self.entries.is_empty() {
            return PriceStats::default();
        }

        let mut prices: Vec<f64> = self.entries.iter().map(|e| e.effective_price).collect();
        prices.sort_by(|a, b| a.total_cmp(b));

        PriceStats {
            min: prices[0],
            max: prices[prices.len() - 1],
            avg: prices.iter().sum::<f64>() / prices.len() as f64,
            median: prices[prices.len() / 2],
        }
    }
}

/// Test helper building an hourly table from plain prices
#[cfg(test)]
pub(crate) fn hourly_table(start: DateTime<Utc>, prices: &[f64]) -> PriceTable {
    table_with_slots(start, prices, 60)
}

/// Test helper building a table with zero tariff
#[cfg(test)]
pub(crate) fn table_with_slots(start: DateTime<Utc>, prices: &[f64], slot_minutes: i64) -> PriceTable {
    let market: Vec<MarketPrice> = prices.iter().enumerate()
        .map(|(i, &price)| MarketPrice { start: start + TimeDelta::minutes(slot_minutes * i as i64), price })
        .collect();
    let end = start + TimeDelta::minutes(slot_minutes * prices.len() as i64);
    PriceTable::build(&market, &TariffSchedule::flat(chrono_tz::UTC, 0.0), start, end, slot_minutes).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap()
    }

    #[test]
    fn build_adds_tariff() {
        let market = vec![
            MarketPrice { start: t0(), price: 0.10 },
            MarketPrice { start: t0() + TimeDelta::hours(1), price: -0.02 },
        ];
        let tariffs = TariffSchedule::flat(chrono_tz::UTC, 0.05);
        let table = PriceTable::build(&market, &tariffs, t0(), t0() + TimeDelta::hours(2), 60).unwrap();

        assert_eq!(table.len(), 2);
        assert!((table.entries[0].effective_price - 0.15).abs() < 1e-12);
        assert!((table.entries[1].effective_price - 0.03).abs() < 1e-12);
        assert_eq!(table.entries[1].local_hour, 1);
        assert_eq!(table.end(), Some(t0() + TimeDelta::hours(2)));
    }

    #[test]
    fn gap_is_incomplete_data() {
        let market = vec![
            MarketPrice { start: t0(), price: 0.10 },
            MarketPrice { start: t0() + TimeDelta::minutes(30), price: 0.10 },
        ];
        let tariffs = TariffSchedule::flat(chrono_tz::UTC, 0.0);
        let result = PriceTable::build(&market, &tariffs, t0(), t0() + TimeDelta::minutes(45), 15);

        assert!(matches!(result, Err(PriceError::IncompleteData(_))));
    }

    #[test]
    fn prices_outside_horizon_are_ignored() {
        let table = hourly_table(t0() - TimeDelta::hours(1), &[1.0, 2.0, 3.0, 4.0]);
        let market: Vec<MarketPrice> = table.entries.iter()
            .map(|e| MarketPrice { start: e.start, price: e.market_price })
            .collect();
        let tariffs = TariffSchedule::flat(chrono_tz::UTC, 0.0);
        let sub = PriceTable::build(&market, &tariffs, t0(), t0() + TimeDelta::hours(2), 60).unwrap();

        assert_eq!(sub.entries.iter().map(|e| e.effective_price).collect::<Vec<f64>>(), vec![2.0, 3.0]);
    }

    #[test]
    fn stats() {
        let stats = hourly_table(t0(), &[10.0, 5.0, 20.0, 8.0]).stats();
        assert_eq!(stats.min, 5.0);
        assert_eq!(stats.max, 20.0);
        assert_eq!(stats.avg, 10.75);
        assert_eq!(stats.median, 10.0);
    }
}
