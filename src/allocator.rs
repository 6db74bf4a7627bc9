use crate::config::{
    check_max_position_size, AllocationConfig, AllocationMode, SimulationConfig,
};
use crate::error::ConfigResult;
use crate::models::{Order, OrderAction, PortfolioState, Signals, TargetWeights, PRICE_EPSILON};
use log::{debug, warn};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Splits an investable budget across already-selected symbols.
///
/// `selected` is ordered strongest signal first and contains only positive
/// signals. Implementations return one raw weight per selected symbol; the
/// allocator applies the position cap and assigns Cash afterwards.
pub trait AllocationStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn weigh(&self, selected: &[(String, f64)], budget: f64) -> Vec<(String, f64)>;
}

/// Weights proportional to signal strength.
pub struct SignalWeighted;

impl AllocationStrategy for SignalWeighted {
    fn name(&self) -> &'static str {
        "signal-weighted"
    }

    fn weigh(&self, selected: &[(String, f64)], budget: f64) -> Vec<(String, f64)> {
        let total: f64 = selected.iter().map(|(_, signal)| signal).sum();
        if total <= 0.0 {
            return Vec::new();
        }
        selected
            .iter()
            .map(|(symbol, signal)| (symbol.clone(), signal / total * budget))
            .collect()
    }
}

pub struct EqualWeight;

impl AllocationStrategy for EqualWeight {
    fn name(&self) -> &'static str {
        "equal-weight"
    }

    fn weigh(&self, selected: &[(String, f64)], budget: f64) -> Vec<(String, f64)> {
        if selected.is_empty() {
            return Vec::new();
        }
        let each = budget / selected.len() as f64;
        selected
            .iter()
            .map(|(symbol, _)| (symbol.clone(), each))
            .collect()
    }
}

pub fn strategy_for_mode(mode: AllocationMode) -> Box<dyn AllocationStrategy> {
    match mode {
        AllocationMode::SignalWeighted => Box::new(SignalWeighted),
        AllocationMode::EqualWeight => Box::new(EqualWeight),
    }
}

/// How far a target allocation moves from current holdings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationMetrics {
    /// One-way turnover: half the summed absolute weight change.
    pub turnover: f64,
    pub herfindahl_index: f64,
    pub position_count: usize,
    pub exposure: f64,
}

pub struct Allocator {
    config: AllocationConfig,
    max_position_size: f64,
    strategy: Box<dyn AllocationStrategy>,
}

impl Allocator {
    /// Fails when `config` or the position cap is out of range.
    pub fn new(config: AllocationConfig, max_position_size: f64) -> ConfigResult<Self> {
        config.validate()?;
        check_max_position_size(max_position_size)?;
        let strategy = strategy_for_mode(config.mode);
        Ok(Self {
            config,
            max_position_size,
            strategy,
        })
    }

    pub fn from_config(config: &SimulationConfig) -> ConfigResult<Self> {
        Self::new(config.allocation.clone(), config.risk.max_position_size)
    }

    /// Replaces the weighting rule while keeping filtering and capping.
    pub fn with_strategy(mut self, strategy: Box<dyn AllocationStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn config(&self) -> &AllocationConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Converts signals into weights that sum to one, Cash included.
    ///
    /// Signals at or below `min_signal_threshold` are dropped, and so are
    /// negative signals since positions are long-only. At most
    /// `max_positions` of the strongest survive, with ties broken by symbol.
    /// Each weight is capped at the position limit and the excess stays in Cash.
    pub fn calculate_target_weights(&self, signals: &Signals) -> TargetWeights {
        let selected = self.select_candidates(signals);
        if selected.is_empty() {
            debug!(
                "No signals above threshold {:.2}; allocating fully to cash",
                self.config.min_signal_threshold
            );
            return TargetWeights::all_cash();
        }

        let budget = 1.0 - self.config.cash_buffer;
        let mut capped = 0usize;
        let weights: Vec<(String, f64)> = self
            .strategy
            .weigh(&selected, budget)
            .into_iter()
            .map(|(symbol, weight)| {
                if weight > self.max_position_size {
                    capped += 1;
                    (symbol, self.max_position_size)
                } else {
                    (symbol, weight)
                }
            })
            .collect();

        if capped > 0 {
            debug!(
                "Capped {} weight(s) at {:.1}%; excess left in cash",
                capped,
                self.max_position_size * 100.0
            );
        }

        let target = TargetWeights::from_symbol_weights(weights);
        debug!(
            "{} allocation over {} symbol(s), cash {:.4}",
            self.strategy.name(),
            selected.len(),
            target.cash()
        );
        target
    }

    fn select_candidates(&self, signals: &Signals) -> Vec<(String, f64)> {
        let threshold = self.config.min_signal_threshold;
        let mut candidates: Vec<(String, f64)> = signals
            .iter()
            .filter(|(_, signal)| signal.is_finite() && **signal > threshold)
            .map(|(symbol, signal)| (symbol.clone(), *signal))
            .collect();

        candidates.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        candidates.truncate(self.config.max_positions);
        candidates
    }

    /// Orders that move `state` toward `target`, all SELLs before any BUY.
    ///
    /// Symbols without a usable price are skipped with a warning. Differences
    /// smaller than `min_trade_value` are ignored. Share counts truncate toward
    /// zero and a SELL never exceeds the shares held; a held symbol with no
    /// remaining target weight is sold in full.
    pub fn generate_orders(
        &self,
        state: &PortfolioState,
        target: &TargetWeights,
        total_value: f64,
        prices: &BTreeMap<String, f64>,
    ) -> Vec<Order> {
        let symbols: BTreeSet<&str> = state
            .positions()
            .keys()
            .map(|s| s.as_str())
            .chain(target.symbols())
            .collect();

        let mut sells = Vec::new();
        let mut buys = Vec::new();

        for symbol in symbols {
            let price = match prices.get(symbol).copied() {
                Some(price) if price.is_finite() && price > 0.0 => price,
                _ => {
                    warn!("Skipping {}: no current price for rebalance", symbol);
                    continue;
                }
            };

            let held = state.shares_held(symbol);
            let target_weight = target.get(symbol).unwrap_or(0.0);
            let target_value = target_weight * total_value;
            let current_value = held as f64 * price;
            let diff = target_value - current_value;

            if diff.abs() < self.config.min_trade_value {
                continue;
            }

            let shares = (diff.abs() / price + PRICE_EPSILON).floor() as u64;
            if diff < 0.0 {
                let shares = if target_weight <= 0.0 {
                    held
                } else {
                    shares.min(held)
                };
                if shares > 0 {
                    sells.push(Order::new(OrderAction::Sell, symbol, shares, price));
                }
            } else if shares > 0 {
                buys.push(Order::new(OrderAction::Buy, symbol, shares, price));
            }
        }

        debug!(
            "Generated {} sell and {} buy order(s)",
            sells.len(),
            buys.len()
        );
        sells.extend(buys);
        sells
    }
}

/// Turnover and concentration of `target` relative to `current`.
pub fn allocation_metrics(current: &TargetWeights, target: &TargetWeights) -> AllocationMetrics {
    let symbols: BTreeSet<&str> = current.symbols().chain(target.symbols()).collect();
    let turnover = symbols
        .iter()
        .map(|symbol| {
            (target.get(symbol).unwrap_or(0.0) - current.get(symbol).unwrap_or(0.0)).abs()
        })
        .sum::<f64>()
        / 2.0;

    AllocationMetrics {
        turnover,
        herfindahl_index: target.non_cash().map(|(_, w)| w * w).sum(),
        position_count: target.non_cash().filter(|(_, w)| *w > 0.0).count(),
        exposure: target.exposure(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::models::Position;
    use chrono::NaiveDate;

    fn signals(entries: &[(&str, f64)]) -> Signals {
        entries
            .iter()
            .map(|(symbol, value)| (symbol.to_string(), *value))
            .collect()
    }

    fn allocator(threshold: f64, max_positions: usize, max_position_size: f64) -> Allocator {
        Allocator::new(
            AllocationConfig {
                min_signal_threshold: threshold,
                max_positions,
                ..AllocationConfig::default()
            },
            max_position_size,
        )
        .unwrap()
    }

    fn position(symbol: &str, shares: u64, average_cost: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            shares,
            average_cost,
            peak_price: None,
            opened_on: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
        }
    }

    #[test]
    fn weights_are_proportional_to_signals() {
        let allocator = allocator(0.25, 10, 1.0);
        let weights = allocator.calculate_target_weights(&signals(&[
            ("AAPL", 0.8),
            ("MSFT", 0.5),
            ("GOOGL", 0.3),
        ]));

        assert!((weights.get("AAPL").unwrap() - 0.45).abs() < 1e-9);
        assert!((weights.get("MSFT").unwrap() - 0.28125).abs() < 1e-9);
        assert!((weights.get("GOOGL").unwrap() - 0.16875).abs() < 1e-9);
        assert!((weights.cash() - 0.10).abs() < 1e-9);
        assert!(weights.is_normalized());
    }

    #[test]
    fn signal_at_threshold_is_discarded() {
        let allocator = allocator(0.3, 10, 1.0);
        let weights =
            allocator.calculate_target_weights(&signals(&[("AAPL", 0.8), ("GOOGL", 0.3)]));
        assert!(weights.get("GOOGL").is_none());
        assert!((weights.get("AAPL").unwrap() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn no_qualifying_signals_means_all_cash() {
        let allocator = allocator(0.3, 10, 0.2);
        let weights =
            allocator.calculate_target_weights(&signals(&[("AAPL", 0.1), ("MSFT", -0.9)]));
        assert_eq!(weights, TargetWeights::all_cash());
    }

    #[test]
    fn keeps_top_n_with_symbol_tiebreak_and_caps_excess_into_cash() {
        let allocator = allocator(0.0, 2, 0.4);
        let weights = allocator.calculate_target_weights(&signals(&[
            ("CCC", 0.6),
            ("BBB", 0.6),
            ("AAA", 0.5),
            ("DDD", 0.9),
        ]));

        let kept: Vec<&str> = weights.symbols().collect();
        assert_eq!(kept, vec!["BBB", "DDD"]);
        assert!((weights.get("DDD").unwrap() - 0.4).abs() < 1e-9);
        assert!((weights.get("BBB").unwrap() - 0.36).abs() < 1e-9);
        assert!((weights.cash() - 0.24).abs() < 1e-9);
    }

    #[test]
    fn equal_weight_strategy_splits_budget_evenly() {
        let allocator = allocator(0.3, 10, 1.0).with_strategy(Box::new(EqualWeight));
        let weights = allocator.calculate_target_weights(&signals(&[
            ("AAPL", 0.9),
            ("MSFT", 0.4),
            ("IBM", 0.1),
        ]));
        assert_eq!(allocator.strategy_name(), "equal-weight");
        assert!((weights.get("AAPL").unwrap() - 0.45).abs() < 1e-9);
        assert!((weights.get("MSFT").unwrap() - 0.45).abs() < 1e-9);
    }

    #[test]
    fn orders_put_sells_first_and_skip_small_or_unpriced_diffs() {
        let allocator = allocator(0.3, 10, 1.0);
        let state = PortfolioState::with_positions(
            5_000.0,
            vec![position("OLD", 40, 50.0), position("KEEP", 10, 100.0)],
        );
        let target = TargetWeights::from_symbol_weights(vec![
            ("NEW".to_string(), 0.5),
            ("KEEP".to_string(), 0.13),
            ("GONE".to_string(), 0.1),
        ]);
        let prices: BTreeMap<String, f64> = [("OLD", 50.0), ("KEEP", 100.0), ("NEW", 33.0)]
            .into_iter()
            .map(|(s, p)| (s.to_string(), p))
            .collect();

        let orders = allocator.generate_orders(&state, &target, 8_000.0, &prices);

        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].action, OrderAction::Sell);
        assert_eq!(orders[0].symbol, "OLD");
        assert_eq!(orders[0].shares, 40);
        assert_eq!(orders[1].action, OrderAction::Buy);
        assert_eq!(orders[1].symbol, "NEW");
        // 4000 / 33 truncates to 121
        assert_eq!(orders[1].shares, 121);
        assert!((orders[1].estimated_value - 121.0 * 33.0).abs() < 1e-9);
    }

    #[test]
    fn partial_sell_never_exceeds_held_shares() {
        let allocator = allocator(0.3, 10, 1.0);
        let state = PortfolioState::with_positions(0.0, vec![position("AAPL", 10, 100.0)]);
        let target = TargetWeights::from_symbol_weights(vec![("AAPL".to_string(), 0.05)]);
        let prices: BTreeMap<String, f64> = [("AAPL".to_string(), 100.0)].into_iter().collect();

        let orders = allocator.generate_orders(&state, &target, 1_000.0, &prices);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].action, OrderAction::Sell);
        assert_eq!(orders[0].shares, 9);
    }

    #[test]
    fn metrics_report_turnover_and_concentration() {
        let current = TargetWeights::from_symbol_weights(vec![("AAA".to_string(), 0.5)]);
        let target = TargetWeights::from_symbol_weights(vec![
            ("AAA".to_string(), 0.2),
            ("BBB".to_string(), 0.2),
        ]);
        let metrics = allocation_metrics(&current, &target);
        assert!((metrics.turnover - 0.25).abs() < 1e-12);
        assert!((metrics.herfindahl_index - 0.08).abs() < 1e-12);
        assert_eq!(metrics.position_count, 2);
        assert!((metrics.exposure - 0.4).abs() < 1e-12);
    }

    #[test]
    fn rejects_out_of_range_config_at_construction() {
        let oversized_buffer = AllocationConfig {
            cash_buffer: 1.5,
            ..AllocationConfig::default()
        };
        assert!(matches!(
            Allocator::new(oversized_buffer, 0.2),
            Err(ConfigError::OutOfRange {
                name: "cash_buffer",
                ..
            })
        ));
        assert!(matches!(
            Allocator::new(AllocationConfig::default(), 1.2),
            Err(ConfigError::OutOfRange {
                name: "max_position_size",
                ..
            })
        ));
        assert!(Allocator::new(AllocationConfig::default(), 0.2).is_ok());
    }
}
