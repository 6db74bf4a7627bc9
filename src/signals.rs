use crate::models::{DailyBar, Signals};
use anyhow::Result;
use chrono::NaiveDate;
use log::warn;
use std::collections::BTreeMap;

/// Bars per symbol visible on a given day, oldest first, ending at that day.
pub type PriceHistory<'a> = BTreeMap<String, &'a [DailyBar]>;

/// Produces per-symbol strengths in [-1, 1] from price history.
pub trait SignalGenerator {
    fn generate_signals(&self, date: NaiveDate, history: &PriceHistory<'_>) -> Result<Signals>;
}

impl<F> SignalGenerator for F
where
    F: Fn(NaiveDate, &PriceHistory<'_>) -> Result<Signals>,
{
    fn generate_signals(&self, date: NaiveDate, history: &PriceHistory<'_>) -> Result<Signals> {
        self(date, history)
    }
}

/// Signals computed ahead of time, keyed by date.
#[derive(Debug, Clone, Default)]
pub struct PrecomputedSignals {
    by_date: BTreeMap<NaiveDate, Signals>,
}

impl PrecomputedSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, date: NaiveDate, symbol: &str, value: f64) {
        self.by_date
            .entry(date)
            .or_default()
            .insert(symbol.to_string(), value);
    }

    /// Signals held for every date from `start` up to and including `end`.
    pub fn hold_range(&mut self, start: NaiveDate, end: NaiveDate, signals: &Signals) {
        let mut date = start;
        while date <= end {
            for (symbol, value) in signals {
                self.insert(date, symbol, *value);
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_date.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_date.is_empty()
    }
}

impl FromIterator<(NaiveDate, String, f64)> for PrecomputedSignals {
    fn from_iter<I: IntoIterator<Item = (NaiveDate, String, f64)>>(iter: I) -> Self {
        let mut signals = Self::new();
        for (date, symbol, value) in iter {
            signals.insert(date, &symbol, value);
        }
        signals
    }
}

impl SignalGenerator for PrecomputedSignals {
    /// Signals stored for `date`, limited to symbols present in `history`.
    fn generate_signals(&self, date: NaiveDate, history: &PriceHistory<'_>) -> Result<Signals> {
        Ok(self
            .by_date
            .get(&date)
            .map(|signals| {
                signals
                    .iter()
                    .filter(|(symbol, _)| history.contains_key(symbol.as_str()))
                    .map(|(symbol, value)| (symbol.clone(), *value))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Drops non-finite strengths and clamps the rest to [-1, 1].
pub fn sanitize_signals(raw: Signals) -> Signals {
    raw.into_iter()
        .filter_map(|(symbol, value)| {
            if !value.is_finite() {
                warn!("Dropping non-finite signal for {}: {}", symbol, value);
                return None;
            }
            if !(-1.0..=1.0).contains(&value) {
                warn!("Clamping out-of-range signal for {}: {}", symbol, value);
                return Some((symbol, value.clamp(-1.0, 1.0)));
            }
            Some((symbol, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    #[test]
    fn precomputed_signals_are_limited_to_known_symbols() {
        let signals: PrecomputedSignals = vec![
            (date(1), "AAA".to_string(), 0.5),
            (date(1), "ZZZ".to_string(), 0.9),
            (date(2), "AAA".to_string(), -0.2),
        ]
        .into_iter()
        .collect();

        let bars: Vec<DailyBar> = Vec::new();
        let mut history = PriceHistory::new();
        history.insert("AAA".to_string(), bars.as_slice());

        let day_one = signals.generate_signals(date(1), &history).unwrap();
        assert_eq!(day_one.len(), 1);
        assert_eq!(day_one["AAA"], 0.5);
        assert!(signals.generate_signals(date(3), &history).unwrap().is_empty());
    }

    #[test]
    fn hold_range_repeats_signals_daily() {
        let mut signals = PrecomputedSignals::new();
        let held: Signals = [("AAA".to_string(), 0.7)].into_iter().collect();
        signals.hold_range(date(1), date(5), &held);
        assert_eq!(signals.len(), 5);
    }

    fn all_long(_: NaiveDate, history: &PriceHistory<'_>) -> Result<Signals> {
        Ok(history.keys().map(|s| (s.clone(), 1.0)).collect())
    }

    #[test]
    fn functions_act_as_generators() {
        let bars: Vec<DailyBar> = Vec::new();
        let mut history = PriceHistory::new();
        history.insert("AAA".to_string(), bars.as_slice());
        let signals = all_long.generate_signals(date(1), &history).unwrap();
        assert_eq!(signals["AAA"], 1.0);
    }

    #[test]
    fn sanitize_drops_nan_and_clamps() {
        let raw: Signals = [
            ("AAA".to_string(), f64::NAN),
            ("BBB".to_string(), 1.7),
            ("CCC".to_string(), -0.4),
        ]
        .into_iter()
        .collect();
        let clean = sanitize_signals(raw);
        assert_eq!(clean.len(), 2);
        assert_eq!(clean["BBB"], 1.0);
        assert_eq!(clean["CCC"], -0.4);
    }
}
