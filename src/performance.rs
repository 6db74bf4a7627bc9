use crate::models::*;
use chrono::NaiveDate;
use log::debug;
use statrs::statistics::{Data, OrderStatistics, Statistics};
use std::collections::{BTreeMap, VecDeque};

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Everything a finished run hands to the calculator
pub struct PerformanceInputs<'a> {
    pub fills: &'a [Fill],
    pub round_trips: &'a [ClosedTrade],
    pub equity_curve: &'a [EquityPoint],
    pub initial_capital: f64,
    pub final_value: f64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, Copy)]
struct OpenLot {
    date: NaiveDate,
    shares: u64,
    price: f64,
    commission_per_share: f64,
}

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    pub fn calculate_performance(inputs: PerformanceInputs<'_>) -> BacktestMetrics {
        let PerformanceInputs {
            fills,
            round_trips,
            equity_curve,
            initial_capital,
            final_value,
            start_date,
            end_date,
        } = inputs;

        let final_value = if final_value.is_finite() {
            final_value
        } else {
            equity_curve
                .last()
                .map(|p| p.portfolio_value)
                .unwrap_or(initial_capital)
        };

        let total_return = if initial_capital > 0.0 {
            (final_value - initial_capital) / initial_capital
        } else {
            0.0
        };
        let elapsed_days = (end_date - start_date).num_days();
        let annualized_return = Self::calculate_annualized_return(total_return, elapsed_days);

        let daily_returns = Self::daily_returns(equity_curve);
        let sharpe_ratio = Self::calculate_sharpe_ratio(&daily_returns);
        let sortino_ratio = Self::calculate_sortino_ratio(&daily_returns);
        let annualized_volatility = Self::calculate_volatility(&daily_returns);
        let max_drawdown = Self::calculate_max_drawdown(equity_curve);
        let calmar_ratio = Self::calculate_calmar_ratio(annualized_return, max_drawdown);
        let var_95 = Self::calculate_value_at_risk(&daily_returns, 0.95);
        let var_99 = Self::calculate_value_at_risk(&daily_returns, 0.99);
        let cvar_95 = Self::calculate_expected_shortfall(&daily_returns, 0.95);
        let omega_ratio = Self::calculate_omega_ratio(&daily_returns);
        let ulcer_index = Self::calculate_ulcer_index(equity_curve);

        let filled_orders = fills.iter().filter(|f| f.is_filled()).count();
        let rejected_orders = fills.len() - filled_orders;
        let total_commission: f64 = fills
            .iter()
            .filter(|f| f.is_filled())
            .map(|f| f.commission)
            .sum();

        let trade_pnls: Vec<f64> = round_trips.iter().map(|t| t.pnl).collect();
        let winning_trades = round_trips.iter().filter(|t| t.is_win()).count();
        let losing_trades = round_trips.iter().filter(|t| t.pnl < 0.0).count();
        let win_rate = if round_trips.is_empty() {
            0.0
        } else {
            winning_trades as f64 / round_trips.len() as f64
        };

        let best_trade = if trade_pnls.is_empty() {
            0.0
        } else {
            trade_pnls.iter().copied().fold(f64::NEG_INFINITY, f64::max)
        };
        let worst_trade = if trade_pnls.is_empty() {
            0.0
        } else {
            trade_pnls.iter().copied().fold(f64::INFINITY, f64::min)
        };

        BacktestMetrics {
            total_return,
            annualized_return,
            sharpe_ratio,
            sortino_ratio,
            max_drawdown,
            calmar_ratio,
            annualized_volatility,
            var_95,
            var_99,
            cvar_95,
            omega_ratio,
            ulcer_index,
            trading_days: equity_curve.len(),
            filled_orders,
            rejected_orders,
            closed_trades: round_trips.len(),
            winning_trades,
            losing_trades,
            win_rate,
            total_commission,
            avg_trade_pnl: Self::average(&trade_pnls),
            best_trade: finite_or_zero(best_trade),
            worst_trade: finite_or_zero(worst_trade),
            ..BacktestMetrics::default()
        }
    }

    /// Pairs filled SELLs with the earliest open BUY lots of the same symbol.
    ///
    /// A SELL spanning several lots yields one record per lot portion. Entry
    /// and exit commissions are pro-rated by shares into each record's P&L.
    pub fn pair_round_trips(fills: &[Fill]) -> Vec<ClosedTrade> {
        let mut open_lots: BTreeMap<&str, VecDeque<OpenLot>> = BTreeMap::new();
        let mut closed = Vec::new();

        for fill in fills.iter().filter(|f| f.is_filled() && f.shares > 0) {
            let symbol = fill.order.symbol.as_str();
            let commission_per_share = fill.commission / fill.shares as f64;

            match fill.order.action {
                OrderAction::Buy => {
                    open_lots.entry(symbol).or_default().push_back(OpenLot {
                        date: fill.date,
                        shares: fill.shares,
                        price: fill.fill_price,
                        commission_per_share,
                    });
                }
                OrderAction::Sell => {
                    let lots = open_lots.entry(symbol).or_default();
                    let mut remaining = fill.shares;

                    while remaining > 0 {
                        let Some(lot) = lots.front_mut() else {
                            debug!(
                                "{} {} shares sold without a recorded entry lot",
                                symbol, remaining
                            );
                            break;
                        };
                        let take = remaining.min(lot.shares);
                        let shares = take as f64;
                        let pnl = (fill.fill_price - lot.price) * shares
                            - (lot.commission_per_share + commission_per_share) * shares;
                        let cost = lot.price * shares;

                        closed.push(ClosedTrade {
                            symbol: symbol.to_string(),
                            entry_date: lot.date,
                            exit_date: fill.date,
                            shares: take,
                            entry_price: lot.price,
                            exit_price: fill.fill_price,
                            pnl,
                            return_pct: if cost > 0.0 { pnl / cost } else { 0.0 },
                        });

                        lot.shares -= take;
                        remaining -= take;
                        if lot.shares == 0 {
                            lots.pop_front();
                        }
                    }
                }
            }
        }

        closed
    }

    fn calculate_annualized_return(total_return: f64, elapsed_days: i64) -> f64 {
        if elapsed_days <= 0 || !total_return.is_finite() {
            return 0.0;
        }
        let growth = 1.0 + total_return;
        if growth <= 0.0 {
            return -1.0;
        }
        growth.powf(365.0 / elapsed_days as f64) - 1.0
    }

    fn daily_returns(equity_curve: &[EquityPoint]) -> Vec<f64> {
        equity_curve
            .windows(2)
            .map(|window| {
                let prev_value = window[0].portfolio_value;
                let curr_value = window[1].portfolio_value;
                if prev_value > 0.0 {
                    (curr_value - prev_value) / prev_value
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Annualized mean over standard deviation of daily returns, zero
    /// risk-free rate. Zero when the deviation is zero or undefined.
    pub fn calculate_sharpe_ratio(daily_returns: &[f64]) -> f64 {
        if daily_returns.len() < 2 {
            return 0.0;
        }

        let mean_return = daily_returns.mean();
        let std_dev = daily_returns.std_dev();

        if !std_dev.is_finite() || std_dev <= f64::EPSILON {
            return 0.0;
        }

        finite_or_zero(mean_return / std_dev * TRADING_DAYS_PER_YEAR.sqrt())
    }

    /// Like Sharpe, but only downside deviation (returns below zero) counts.
    pub fn calculate_sortino_ratio(daily_returns: &[f64]) -> f64 {
        if daily_returns.len() < 2 {
            return 0.0;
        }

        let mean_return = daily_returns.mean();
        let downside_sq: f64 = daily_returns
            .iter()
            .map(|r| r.min(0.0).powi(2))
            .sum::<f64>()
            / daily_returns.len() as f64;
        let downside_dev = downside_sq.sqrt();

        if !downside_dev.is_finite() || downside_dev <= f64::EPSILON {
            return 0.0;
        }

        finite_or_zero(mean_return / downside_dev * TRADING_DAYS_PER_YEAR.sqrt())
    }

    fn calculate_volatility(daily_returns: &[f64]) -> f64 {
        if daily_returns.len() < 2 {
            return 0.0;
        }
        finite_or_zero(daily_returns.std_dev() * TRADING_DAYS_PER_YEAR.sqrt())
    }

    /// Deepest decline from a running peak, as a non-positive fraction.
    pub fn calculate_max_drawdown(equity_curve: &[EquityPoint]) -> f64 {
        let Some(first) = equity_curve.first() else {
            return 0.0;
        };

        let mut peak_value = first.portfolio_value;
        let mut max_drawdown = 0.0_f64;

        for point in equity_curve {
            if point.portfolio_value > peak_value {
                peak_value = point.portfolio_value;
            } else if peak_value > 0.0 {
                let drawdown = (point.portfolio_value - peak_value) / peak_value;
                max_drawdown = max_drawdown.min(drawdown);
            }
        }

        max_drawdown
    }

    /// Drawdown from the running peak at each point, as non-positive fractions.
    pub fn drawdown_series(equity_curve: &[EquityPoint]) -> Vec<f64> {
        let mut peak_value = f64::NEG_INFINITY;
        equity_curve
            .iter()
            .map(|point| {
                peak_value = peak_value.max(point.portfolio_value);
                if peak_value > 0.0 {
                    (point.portfolio_value - peak_value) / peak_value
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Root mean square of the drawdown series.
    pub fn calculate_ulcer_index(equity_curve: &[EquityPoint]) -> f64 {
        if equity_curve.len() < 2 {
            return 0.0;
        }
        let drawdowns = Self::drawdown_series(equity_curve);
        let mean_sq = drawdowns.iter().map(|d| d * d).sum::<f64>() / drawdowns.len() as f64;
        finite_or_zero(mean_sq.sqrt())
    }

    fn loss_quantile(daily_returns: &[f64], confidence: f64) -> Option<f64> {
        let returns: Vec<f64> = daily_returns.iter().copied().filter(|r| r.is_finite()).collect();
        if returns.is_empty() || !(0.0..1.0).contains(&confidence) {
            return None;
        }
        let quantile = Data::new(returns).quantile(1.0 - confidence);
        quantile.is_finite().then_some(quantile)
    }

    /// Historical VaR: the loss at the `1 - confidence` quantile of daily
    /// returns, reported as a positive fraction. Zero when that quantile is
    /// not a loss.
    pub fn calculate_value_at_risk(daily_returns: &[f64], confidence: f64) -> f64 {
        Self::loss_quantile(daily_returns, confidence)
            .map(|q| (-q).max(0.0))
            .unwrap_or(0.0)
    }

    /// Expected shortfall: mean loss over the days at or below the VaR
    /// quantile, as a positive fraction.
    pub fn calculate_expected_shortfall(daily_returns: &[f64], confidence: f64) -> f64 {
        let Some(quantile) = Self::loss_quantile(daily_returns, confidence) else {
            return 0.0;
        };
        let tail: Vec<f64> = daily_returns
            .iter()
            .copied()
            .filter(|r| r.is_finite() && *r <= quantile)
            .collect();
        if tail.is_empty() {
            return (-quantile).max(0.0);
        }
        finite_or_zero((-tail.as_slice().mean()).max(0.0))
    }

    /// Sum of gains over sum of losses around a zero return.
    pub fn calculate_omega_ratio(daily_returns: &[f64]) -> Option<f64> {
        let gains: f64 = daily_returns.iter().filter(|r| **r > 0.0).sum();
        let losses: f64 = daily_returns.iter().filter(|r| **r < 0.0).map(|r| -r).sum();
        if !losses.is_finite() || losses <= f64::EPSILON {
            return None;
        }
        let omega = gains / losses;
        omega.is_finite().then_some(omega)
    }

    /// Compares the equity curve with a benchmark price or value series.
    ///
    /// Only dates present in both series are used, and returns are taken
    /// between consecutive shared dates. `None` with fewer than two such
    /// returns.
    pub fn compare_to_benchmark(
        symbol: &str,
        equity_curve: &[EquityPoint],
        benchmark: &BTreeMap<NaiveDate, f64>,
    ) -> Option<BenchmarkComparison> {
        let aligned: Vec<(f64, f64)> = equity_curve
            .iter()
            .filter_map(|point| {
                benchmark
                    .get(&point.date)
                    .filter(|value| value.is_finite() && **value > 0.0)
                    .map(|value| (point.portfolio_value, *value))
            })
            .collect();
        if aligned.len() < 3 {
            return None;
        }

        let (portfolio, bench): (Vec<f64>, Vec<f64>) = aligned
            .windows(2)
            .map(|w| {
                let portfolio = if w[0].0 > 0.0 {
                    (w[1].0 - w[0].0) / w[0].0
                } else {
                    0.0
                };
                (portfolio, (w[1].1 - w[0].1) / w[0].1)
            })
            .unzip();
        let excess: Vec<f64> = portfolio.iter().zip(&bench).map(|(p, b)| p - b).collect();

        let compound = |returns: &[f64]| returns.iter().fold(1.0, |acc, r| acc * (1.0 + r)) - 1.0;
        let portfolio_return = compound(portfolio.as_slice());
        let benchmark_return = compound(bench.as_slice());

        let bench_variance = bench.as_slice().variance();
        let beta = if bench_variance.is_finite() && bench_variance > f64::EPSILON {
            finite_or_zero(portfolio.as_slice().covariance(bench.as_slice()) / bench_variance)
        } else {
            0.0
        };

        Some(BenchmarkComparison {
            symbol: symbol.to_string(),
            aligned_days: aligned.len(),
            portfolio_return,
            benchmark_return,
            excess_return: portfolio_return - benchmark_return,
            tracking_error: finite_or_zero(
                excess.as_slice().std_dev() * TRADING_DAYS_PER_YEAR.sqrt(),
            ),
            beta,
        })
    }

    fn calculate_calmar_ratio(annualized_return: f64, max_drawdown: f64) -> f64 {
        if !annualized_return.is_finite() || !max_drawdown.is_finite() {
            return 0.0;
        }

        let drawdown_ratio = max_drawdown.abs();
        if drawdown_ratio <= f64::EPSILON {
            return 0.0;
        }

        annualized_return / drawdown_ratio
    }

    fn average(values: &[f64]) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;

        for value in values.iter().copied() {
            if value.is_finite() {
                sum += value;
                count += 1;
            }
        }

        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
