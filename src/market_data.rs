use crate::models::DailyBar;
use anyhow::{ensure, Result};
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};

/// Daily bars and the trading calendar, already materialized for a run.
pub trait MarketDataSource {
    /// Bars for `symbol` with `start <= date <= end`, oldest first.
    fn get_daily_bars(&self, symbol: &str, start: NaiveDate, end: NaiveDate)
        -> Result<Vec<DailyBar>>;

    /// Trading days with `start <= date <= end`, ascending.
    fn get_trading_days(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>>;
}

/// Groups bars by symbol, optionally restricted to a known set, each group sorted by date.
pub fn group_bars_by_symbol(
    bars: Vec<DailyBar>,
    symbols: Option<&[String]>,
) -> BTreeMap<String, Vec<DailyBar>> {
    let known: Option<BTreeSet<&str>> =
        symbols.map(|list| list.iter().map(|s| s.as_str()).collect());
    let mut grouped: BTreeMap<String, Vec<DailyBar>> = BTreeMap::new();

    for bar in bars {
        if let Some(known) = &known {
            if !known.contains(bar.symbol.as_str()) {
                continue;
            }
        }
        grouped.entry(bar.symbol.clone()).or_default().push(bar);
    }

    for values in grouped.values_mut() {
        values.sort_by(|a, b| a.date.cmp(&b.date));
        values.dedup_by(|later, earlier| later.date == earlier.date);
    }

    grouped
}

/// In-memory source backed by a flat list of bars.
///
/// The calendar is the union of all bar dates unless one is supplied.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMarketData {
    bars: BTreeMap<String, Vec<DailyBar>>,
    calendar: Option<Vec<NaiveDate>>,
}

impl InMemoryMarketData {
    pub fn from_bars(bars: Vec<DailyBar>) -> Self {
        Self {
            bars: group_bars_by_symbol(bars, None),
            calendar: None,
        }
    }

    pub fn with_calendar(mut self, mut calendar: Vec<NaiveDate>) -> Self {
        calendar.sort();
        calendar.dedup();
        self.calendar = Some(calendar);
        self
    }

    pub fn symbols(&self) -> Vec<String> {
        self.bars.keys().cloned().collect()
    }
}

impl MarketDataSource for InMemoryMarketData {
    fn get_daily_bars(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyBar>> {
        ensure!(start <= end, "start {} is after end {}", start, end);
        Ok(self
            .bars
            .get(symbol)
            .map(|bars| {
                bars.iter()
                    .filter(|bar| bar.date >= start && bar.date <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_trading_days(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
        ensure!(start <= end, "start {} is after end {}", start, end);
        let days = match &self.calendar {
            Some(calendar) => calendar
                .iter()
                .copied()
                .filter(|date| *date >= start && *date <= end)
                .collect(),
            None => self
                .bars
                .values()
                .flatten()
                .map(|bar| bar.date)
                .filter(|date| *date >= start && *date <= end)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        };
        Ok(days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn bar(symbol: &str, day: u32, close: f64) -> DailyBar {
        DailyBar {
            symbol: symbol.to_string(),
            date: date(day),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1_000,
        }
    }

    #[test]
    fn groups_sorts_and_filters_by_symbol() {
        let bars = vec![bar("BBB", 3, 11.0), bar("AAA", 4, 2.0), bar("BBB", 2, 10.0)];
        let restrict = vec!["BBB".to_string()];
        let grouped = group_bars_by_symbol(bars, Some(&restrict));
        assert_eq!(grouped.len(), 1);
        let dates: Vec<_> = grouped["BBB"].iter().map(|b| b.date).collect();
        assert_eq!(dates, vec![date(2), date(3)]);
    }

    #[test]
    fn calendar_defaults_to_union_of_bar_dates() {
        let data = InMemoryMarketData::from_bars(vec![
            bar("AAA", 2, 1.0),
            bar("AAA", 3, 1.0),
            bar("BBB", 4, 1.0),
            bar("BBB", 9, 1.0),
        ]);
        assert_eq!(
            data.get_trading_days(date(3), date(8)).unwrap(),
            vec![date(3), date(4)]
        );
        assert_eq!(data.get_daily_bars("AAA", date(3), date(9)).unwrap().len(), 1);
        assert!(data.get_daily_bars("ZZZ", date(1), date(9)).unwrap().is_empty());
        assert!(data.get_trading_days(date(9), date(1)).is_err());
    }

    #[test]
    fn explicit_calendar_overrides_bar_dates() {
        let data = InMemoryMarketData::from_bars(vec![bar("AAA", 2, 1.0)])
            .with_calendar(vec![date(5), date(2), date(3), date(3)]);
        assert_eq!(
            data.get_trading_days(date(1), date(31)).unwrap(),
            vec![date(2), date(3), date(5)]
        );
    }
}
