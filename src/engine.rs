use crate::allocator::{allocation_metrics, AllocationStrategy, Allocator};
use crate::config::SimulationConfig;
use crate::error::ConfigResult;
use crate::execution::{FillSimulator, OrderExecutor};
use crate::market_data::MarketDataSource;
use crate::models::*;
use crate::monitor::PortfolioMonitor;
use crate::performance::{PerformanceCalculator, PerformanceInputs};
use crate::risk::{PositionRiskCheck, RiskAction, RiskValidator};
use crate::schedule::RebalanceSchedule;
use crate::signals::{sanitize_signals, PriceHistory, SignalGenerator};
use anyhow::{ensure, Context, Result};
use chrono::{Duration, NaiveDate};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Counters a run accumulates alongside its fills
#[derive(Debug, Default, Clone, Copy)]
struct RunCounters {
    rebalances: usize,
    forced_exits: usize,
    circuit_breaker_halts: usize,
    price_gaps: usize,
}

/// Mutable state owned by a single run
struct RunState {
    portfolio: PortfolioState,
    schedule: RebalanceSchedule,
    monitor: PortfolioMonitor,
    fills: Vec<Fill>,
    equity_curve: Vec<EquityPoint>,
    counters: RunCounters,
}

/// Walks the trading calendar once, sequencing position checks,
/// rebalancing and valuation for every day.
pub struct SimulationDriver {
    config: SimulationConfig,
    allocator: Allocator,
    risk: RiskValidator,
    executor: Box<dyn OrderExecutor>,
}

impl SimulationDriver {
    /// Validates `config` and wires the default components.
    pub fn new(config: SimulationConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            allocator: Allocator::from_config(&config)?,
            risk: RiskValidator::new(&config.risk)?,
            executor: Box::new(FillSimulator::new(config.execution.clone())?),
            config,
        })
    }

    pub fn with_executor(mut self, executor: Box<dyn OrderExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_allocation_strategy(mut self, strategy: Box<dyn AllocationStrategy>) -> Self {
        self.allocator = self.allocator.with_strategy(strategy);
        self
    }

    pub fn with_risk_checks(mut self, checks: Vec<Box<dyn PositionRiskCheck>>) -> Self {
        self.risk = self.risk.with_checks(checks);
        self
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Simulates `symbols` over the trading days in `[start, end]`.
    ///
    /// Fails only when the calendar is unusable or the signal generator
    /// errors. Missing bars and infeasible orders are logged and skipped.
    pub fn run(
        &self,
        data: &dyn MarketDataSource,
        signals: &dyn SignalGenerator,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BacktestResult> {
        ensure!(start <= end, "start date {} is after end date {}", start, end);

        let trading_days = data
            .get_trading_days(start, end)
            .with_context(|| format!("Failed to load trading days {} to {}", start, end))?;
        ensure!(
            !trading_days.is_empty(),
            "No trading days between {} and {}",
            start,
            end
        );
        ensure!(
            trading_days.windows(2).all(|w| w[0] < w[1]),
            "Trading days must be strictly ascending"
        );

        let bars_by_symbol = self.load_bars(data, symbols, start, end);
        let initial_capital = self.config.initial_capital;

        info!(
            "Starting {} backtest: {} trading days ({} to {}), {} symbols, {} allocation",
            self.config.rebalance_cadence.as_str(),
            trading_days.len(),
            trading_days[0],
            trading_days[trading_days.len() - 1],
            bars_by_symbol.len(),
            self.allocator.strategy_name()
        );

        let mut run = RunState {
            portfolio: PortfolioState::new(initial_capital),
            schedule: RebalanceSchedule::new(self.config.rebalance_cadence),
            monitor: PortfolioMonitor::new(self.config.monitor.clone(), initial_capital),
            fills: Vec::new(),
            equity_curve: Vec::with_capacity(trading_days.len()),
            counters: RunCounters::default(),
        };

        for &day in &trading_days {
            self.step_day(day, &bars_by_symbol, signals, &mut run)?;
        }

        let RunState {
            portfolio,
            fills,
            equity_curve,
            counters,
            ..
        } = run;

        let start_date = trading_days[0];
        let end_date = trading_days[trading_days.len() - 1];
        let final_value = portfolio.total_value();
        let round_trips = PerformanceCalculator::pair_round_trips(&fills);
        let mut metrics = PerformanceCalculator::calculate_performance(PerformanceInputs {
            fills: &fills,
            round_trips: &round_trips,
            equity_curve: &equity_curve,
            initial_capital,
            final_value,
            start_date,
            end_date,
        });
        metrics.rebalance_count = counters.rebalances;
        metrics.forced_exit_count = counters.forced_exits;
        metrics.circuit_breaker_halts = counters.circuit_breaker_halts;

        if counters.price_gaps > 0 {
            warn!(
                "{} symbol-day price gap(s) carried at last known price",
                counters.price_gaps
            );
        }
        info!(
            "Backtest complete: final value ${:.2}, total return {:.2}%, Sharpe {:.2}, max drawdown {:.2}%, {} fills ({} rejected)",
            final_value,
            metrics.total_return * 100.0,
            metrics.sharpe_ratio,
            metrics.max_drawdown * 100.0,
            metrics.filled_orders,
            metrics.rejected_orders
        );

        let benchmark = self.compare_to_benchmark(data, &equity_curve, start_date, end_date);

        Ok(BacktestResult {
            id: Uuid::new_v4().to_string(),
            start_date,
            end_date,
            initial_capital,
            final_value,
            equity_curve,
            trades: fills,
            round_trips,
            metrics,
            benchmark,
        })
    }

    /// Compares the equity curve with the configured benchmark's closes.
    ///
    /// A benchmark that cannot be loaded is logged and left out of the result.
    fn compare_to_benchmark(
        &self,
        data: &dyn MarketDataSource,
        equity_curve: &[EquityPoint],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Option<BenchmarkComparison> {
        let symbol = self.config.benchmark_symbol.as_deref()?;
        let bars = match data.get_daily_bars(symbol, start, end) {
            Ok(bars) => bars,
            Err(err) => {
                warn!("Benchmark {} unavailable: {:#}", symbol, err);
                return None;
            }
        };
        let closes: BTreeMap<NaiveDate, f64> = bars
            .iter()
            .filter(|bar| bar.close.is_finite() && bar.close > 0.0)
            .map(|bar| (bar.date, bar.close))
            .collect();
        let comparison = PerformanceCalculator::compare_to_benchmark(symbol, equity_curve, &closes);
        match &comparison {
            Some(cmp) => info!(
                "Benchmark {}: excess return {:.2}%, beta {:.2}",
                symbol,
                cmp.excess_return * 100.0,
                cmp.beta
            ),
            None => warn!("Benchmark {} shares too few days with the run", symbol),
        }
        comparison
    }

    /// Fetches each symbol's bars once, from the history window start to `end`.
    fn load_bars(
        &self,
        data: &dyn MarketDataSource,
        symbols: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> BTreeMap<String, Vec<DailyBar>> {
        let history_start = match self.config.history_lookback_days {
            Some(days) => start
                .checked_sub_signed(Duration::days(days as i64))
                .unwrap_or(NaiveDate::MIN),
            None => NaiveDate::MIN,
        };

        let unique: BTreeSet<&String> = symbols.iter().collect();
        let mut bars_by_symbol = BTreeMap::new();

        for symbol in unique {
            let mut bars = match data.get_daily_bars(symbol, history_start, end) {
                Ok(bars) => bars,
                Err(err) => {
                    warn!("Failed to load bars for {}: {:#}", symbol, err);
                    continue;
                }
            };

            let before = bars.len();
            bars.retain(|bar| bar.close.is_finite() && bar.close > 0.0);
            if bars.len() < before {
                warn!(
                    "Dropped {} bar(s) for {} with unusable close prices",
                    before - bars.len(),
                    symbol
                );
            }
            bars.sort_by_key(|bar| bar.date);
            bars.dedup_by_key(|bar| bar.date);

            if bars.is_empty() {
                warn!("No usable bars for {} between {} and {}", symbol, history_start, end);
                continue;
            }
            bars_by_symbol.insert(symbol.clone(), bars);
        }

        bars_by_symbol
    }

    fn step_day(
        &self,
        day: NaiveDate,
        bars_by_symbol: &BTreeMap<String, Vec<DailyBar>>,
        signals: &dyn SignalGenerator,
        run: &mut RunState,
    ) -> Result<()> {
        let today_prices = self.mark_to_market(day, bars_by_symbol, run);
        let exited = self.apply_position_exits(day, &today_prices, run);

        if run.schedule.is_rebalance_day(day) {
            match run.monitor.check(run.portfolio.total_value()) {
                Some(tripped) => {
                    warn!("{}: {}; skipping rebalance", day, tripped);
                    run.counters.circuit_breaker_halts += 1;
                }
                None => {
                    self.rebalance(day, bars_by_symbol, &today_prices, &exited, signals, run)?;
                    run.counters.rebalances += 1;
                }
            }
        }

        let portfolio = &run.portfolio;
        let point = EquityPoint {
            date: day,
            portfolio_value: portfolio.total_value(),
            cash: portfolio.cash(),
            positions_value: portfolio.positions_value(),
            position_count: portfolio.positions().len(),
        };
        run.monitor.close_day(point.portfolio_value);
        run.equity_curve.push(point);
        Ok(())
    }

    /// Records today's closes and returns them. Held symbols without a bar
    /// today keep their last known price.
    fn mark_to_market(
        &self,
        day: NaiveDate,
        bars_by_symbol: &BTreeMap<String, Vec<DailyBar>>,
        run: &mut RunState,
    ) -> BTreeMap<String, f64> {
        let mut today_prices = BTreeMap::new();
        for (symbol, bars) in bars_by_symbol {
            if let Ok(index) = bars.binary_search_by_key(&day, |bar| bar.date) {
                today_prices.insert(symbol.clone(), bars[index].close);
            }
        }

        for (symbol, price) in &today_prices {
            run.portfolio.record_price(symbol, *price);
        }

        for symbol in run.portfolio.positions().keys() {
            if !today_prices.contains_key(symbol) {
                warn!(
                    "{}: no price for held {}; valuing at last known price",
                    day, symbol
                );
                run.counters.price_gaps += 1;
            }
        }

        today_prices
    }

    /// Runs the exit rules on every priced position and sells whatever fires.
    /// Returns the symbols that were closed.
    fn apply_position_exits(
        &self,
        day: NaiveDate,
        today_prices: &BTreeMap<String, f64>,
        run: &mut RunState,
    ) -> BTreeSet<String> {
        let mut exit_orders = Vec::new();
        let mut peaks = Vec::new();

        for (symbol, position) in run.portfolio.positions() {
            let Some(&price) = today_prices.get(symbol) else {
                continue;
            };
            let assessment = self.risk.check_position_risk(position, price, day);
            peaks.push((symbol.clone(), assessment.peak_price));
            if let Some(exit) = assessment.exit {
                warn!(
                    "{}: forced exit of {} {} ({})",
                    day, exit.shares, exit.symbol, exit.reason
                );
                exit_orders.push(exit.to_order());
            }
        }

        for (symbol, peak) in peaks {
            run.portfolio.set_peak_price(&symbol, peak);
        }

        if exit_orders.is_empty() {
            return BTreeSet::new();
        }

        let fills = self
            .executor
            .execute(&exit_orders, today_prices, &mut run.portfolio, day);
        let exited: BTreeSet<String> = fills
            .iter()
            .filter(|fill| fill.is_filled())
            .map(|fill| fill.order.symbol.clone())
            .collect();
        run.counters.forced_exits += exited.len();
        run.fills.extend(fills);
        exited
    }

    fn rebalance(
        &self,
        day: NaiveDate,
        bars_by_symbol: &BTreeMap<String, Vec<DailyBar>>,
        today_prices: &BTreeMap<String, f64>,
        exited: &BTreeSet<String>,
        signals: &dyn SignalGenerator,
        run: &mut RunState,
    ) -> Result<()> {
        let history = self.history_for(day, bars_by_symbol);
        let raw = signals
            .generate_signals(day, &history)
            .with_context(|| format!("Signal generation failed on {}", day))?;

        let mut clean = sanitize_signals(raw);
        clean.retain(|symbol, _| {
            history.contains_key(symbol.as_str())
                && today_prices.contains_key(symbol.as_str())
                && !exited.contains(symbol.as_str())
        });

        let target = self.allocator.calculate_target_weights(&clean);
        let validation = self.risk.validate_weights(&target);
        if validation.action == RiskAction::Adjust {
            debug!("{}: risk adjustments: {}", day, validation.log());
        }
        let weights = validation.weights;

        let total_value = run.portfolio.total_value();
        let diagnostics = allocation_metrics(&run.portfolio.current_weights(), &weights);
        debug!(
            "{}: rebalancing {} signal(s) into {} position(s), turnover {:.4}, HHI {:.4}",
            day,
            clean.len(),
            diagnostics.position_count,
            diagnostics.turnover,
            diagnostics.herfindahl_index
        );

        let orders = self
            .allocator
            .generate_orders(&run.portfolio, &weights, total_value, today_prices);
        if orders.is_empty() {
            return Ok(());
        }

        let warnings = self.risk.validate_orders(&orders, &run.portfolio, total_value);
        if !warnings.is_empty() {
            debug!("{}: {} order(s) breach limits as estimated", day, warnings.len());
        }
        let fills = self
            .executor
            .execute(&orders, today_prices, &mut run.portfolio, day);
        run.fills.extend(fills);
        Ok(())
    }

    /// Bars up to and including `day`, bounded by the lookback window.
    fn history_for<'a>(
        &self,
        day: NaiveDate,
        bars_by_symbol: &'a BTreeMap<String, Vec<DailyBar>>,
    ) -> PriceHistory<'a> {
        let window_start = self
            .config
            .history_lookback_days
            .and_then(|days| day.checked_sub_signed(Duration::days(days as i64)));

        bars_by_symbol
            .iter()
            .filter_map(|(symbol, bars)| {
                let end = bars.partition_point(|bar| bar.date <= day);
                let begin = match window_start {
                    Some(from) => bars[..end].partition_point(|bar| bar.date < from),
                    None => 0,
                };
                (begin < end).then(|| (symbol.clone(), &bars[begin..end]))
            })
            .collect()
    }
}
