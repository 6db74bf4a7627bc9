use crate::models::RebalanceCadence;
use chrono::{Datelike, NaiveDate};

/// Calendar bucket a trading day falls in for a cadence.
fn period_key(cadence: RebalanceCadence, date: NaiveDate) -> (i32, u32) {
    match cadence {
        RebalanceCadence::Daily => (date.year(), date.ordinal()),
        RebalanceCadence::Weekly => {
            let week = date.iso_week();
            (week.year(), week.week())
        }
        RebalanceCadence::Monthly => (date.year(), date.month()),
    }
}

/// Decides rebalance days as trading days are visited in order.
///
/// A day rebalances when it is the first trading day seen in its period:
/// every day, ISO week, or calendar month. Weeks are keyed by ISO year so
/// a week spanning New Year counts once.
#[derive(Debug, Clone)]
pub struct RebalanceSchedule {
    cadence: RebalanceCadence,
    last_period: Option<(i32, u32)>,
}

impl RebalanceSchedule {
    pub fn new(cadence: RebalanceCadence) -> Self {
        Self {
            cadence,
            last_period: None,
        }
    }

    pub fn cadence(&self) -> RebalanceCadence {
        self.cadence
    }

    /// Must be called once per trading day in ascending order.
    pub fn is_rebalance_day(&mut self, date: NaiveDate) -> bool {
        let key = period_key(self.cadence, date);
        if self.last_period == Some(key) {
            return false;
        }
        self.last_period = Some(key);
        true
    }
}

/// The rebalance days among `days` (ascending) for `cadence`.
pub fn rebalance_days(cadence: RebalanceCadence, days: &[NaiveDate]) -> Vec<NaiveDate> {
    let mut schedule = RebalanceSchedule::new(cadence);
    days.iter()
        .copied()
        .filter(|date| schedule.is_rebalance_day(*date))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn weekdays(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        start
            .iter_days()
            .take_while(|d| *d <= end)
            .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
            .collect()
    }

    #[test]
    fn daily_rebalances_every_trading_day() {
        let days = weekdays(date(2024, 1, 1), date(2024, 1, 31));
        assert_eq!(rebalance_days(RebalanceCadence::Daily, &days), days);
    }

    #[test]
    fn weekly_uses_first_trading_day_of_each_week() {
        // 2024-01-15 is a holiday Monday
        let days: Vec<_> = weekdays(date(2024, 1, 8), date(2024, 1, 19))
            .into_iter()
            .filter(|d| *d != date(2024, 1, 15))
            .collect();
        assert_eq!(
            rebalance_days(RebalanceCadence::Weekly, &days),
            vec![date(2024, 1, 8), date(2024, 1, 16)]
        );
    }

    #[test]
    fn weekly_does_not_repeat_across_new_year() {
        // ISO week 1 of 2025 starts Monday 2024-12-30
        let days = weekdays(date(2024, 12, 23), date(2025, 1, 10));
        assert_eq!(
            rebalance_days(RebalanceCadence::Weekly, &days),
            vec![date(2024, 12, 23), date(2024, 12, 30), date(2025, 1, 6)]
        );
    }

    #[test]
    fn monthly_uses_first_trading_day_of_each_month() {
        let days = weekdays(date(2024, 1, 1), date(2024, 4, 30));
        assert_eq!(
            rebalance_days(RebalanceCadence::Monthly, &days),
            vec![
                date(2024, 1, 1),
                date(2024, 2, 1),
                date(2024, 3, 1),
                date(2024, 4, 1)
            ]
        );
    }
}
