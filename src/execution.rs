use crate::config::ExecutionSettings;
use crate::error::ConfigResult;
use crate::models::{Fill, FillStatus, Order, OrderAction, PortfolioState, Position};
use chrono::NaiveDate;
use log::{info, warn};
use std::collections::BTreeMap;

/// Turns orders into fills against a portfolio.
///
/// The simulation depends only on this seam, so a brokerage-backed
/// implementation can stand in for [`FillSimulator`].
pub trait OrderExecutor {
    /// Executes `orders` in sequence, one fill per order. Infeasible orders
    /// come back as rejected fills and leave `state` untouched.
    fn execute(
        &self,
        orders: &[Order],
        prices: &BTreeMap<String, f64>,
        state: &mut PortfolioState,
        date: NaiveDate,
    ) -> Vec<Fill>;
}

/// Simulated fills at the day's price with slippage and commission.
#[derive(Debug, Clone)]
pub struct FillSimulator {
    settings: ExecutionSettings,
}

impl FillSimulator {
    pub fn new(settings: ExecutionSettings) -> ConfigResult<Self> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    /// Applies each order in turn. Orders are all-or-nothing.
    pub fn apply(
        &self,
        orders: &[Order],
        prices: &BTreeMap<String, f64>,
        state: &mut PortfolioState,
        date: NaiveDate,
    ) -> Vec<Fill> {
        orders
            .iter()
            .map(|order| self.apply_one(order, prices, state, date))
            .collect()
    }

    fn apply_one(
        &self,
        order: &Order,
        prices: &BTreeMap<String, f64>,
        state: &mut PortfolioState,
        date: NaiveDate,
    ) -> Fill {
        let price = match prices.get(&order.symbol).copied() {
            Some(price) if price.is_finite() && price > 0.0 => price,
            _ => return Self::reject(order, date, 0.0, "no price available".to_string()),
        };
        if order.shares == 0 {
            return Self::reject(order, date, price, "order has zero shares".to_string());
        }

        match order.action {
            OrderAction::Buy => self.fill_buy(order, price, state, date),
            OrderAction::Sell => self.fill_sell(order, price, state, date),
        }
    }

    fn fill_buy(
        &self,
        order: &Order,
        price: f64,
        state: &mut PortfolioState,
        date: NaiveDate,
    ) -> Fill {
        let fill_price = self.apply_entry_slippage(price);
        let commission = self.settings.commission_for(order.shares);
        let required_cash = fill_price * order.shares as f64 + commission;

        if required_cash > state.cash() {
            return Self::reject(
                order,
                date,
                fill_price,
                format!(
                    "insufficient funds: need ${:.2}, have ${:.2}",
                    required_cash,
                    state.cash()
                ),
            );
        }

        state.debit_cash(required_cash);
        if let Some(position) = state.position_mut(&order.symbol) {
            let total_shares = position.shares + order.shares;
            position.average_cost = (position.cost_basis() + fill_price * order.shares as f64)
                / total_shares as f64;
            position.shares = total_shares;
        } else {
            state.insert_position(Position {
                symbol: order.symbol.clone(),
                shares: order.shares,
                average_cost: fill_price,
                peak_price: None,
                opened_on: date,
            });
        }
        state.record_price(&order.symbol, price);

        info!(
            "BUY {} {} @ ${:.2} (commission ${:.2})",
            order.shares, order.symbol, fill_price, commission
        );

        Fill {
            order: order.clone(),
            date,
            fill_price,
            shares: order.shares,
            commission,
            status: FillStatus::Filled,
            realized_pnl: None,
            reason: None,
        }
    }

    fn fill_sell(
        &self,
        order: &Order,
        price: f64,
        state: &mut PortfolioState,
        date: NaiveDate,
    ) -> Fill {
        let fill_price = self.apply_exit_slippage(price);
        let held = state.shares_held(&order.symbol);
        if order.shares > held {
            return Self::reject(
                order,
                date,
                fill_price,
                format!("insufficient shares: need {}, have {}", order.shares, held),
            );
        }

        let commission = self.settings.commission_for(order.shares);
        let mut realized_pnl = 0.0;
        let mut closed = false;
        if let Some(position) = state.position_mut(&order.symbol) {
            realized_pnl =
                (fill_price - position.average_cost) * order.shares as f64 - commission;
            position.shares -= order.shares;
            closed = position.shares == 0;
        }
        if closed {
            state.remove_position(&order.symbol);
        }
        state.credit_cash(fill_price * order.shares as f64 - commission);
        state.record_price(&order.symbol, price);

        info!(
            "SELL {} {} @ ${:.2} (P&L ${:.2})",
            order.shares, order.symbol, fill_price, realized_pnl
        );

        Fill {
            order: order.clone(),
            date,
            fill_price,
            shares: order.shares,
            commission,
            status: FillStatus::Filled,
            realized_pnl: Some(realized_pnl),
            reason: None,
        }
    }

    fn reject(order: &Order, date: NaiveDate, fill_price: f64, reason: String) -> Fill {
        warn!(
            "Rejected {} {} {}: {}",
            order.action, order.shares, order.symbol, reason
        );
        Fill {
            order: order.clone(),
            date,
            fill_price,
            shares: 0,
            commission: 0.0,
            status: FillStatus::Rejected,
            realized_pnl: None,
            reason: Some(reason),
        }
    }

    fn apply_entry_slippage(&self, price: f64) -> f64 {
        price * (1.0 + self.settings.slippage_pct)
    }

    fn apply_exit_slippage(&self, price: f64) -> f64 {
        price * (1.0 - self.settings.slippage_pct)
    }
}

impl OrderExecutor for FillSimulator {
    fn execute(
        &self,
        orders: &[Order],
        prices: &BTreeMap<String, f64>,
        state: &mut PortfolioState,
        date: NaiveDate,
    ) -> Vec<Fill> {
        self.apply(orders, prices, state, date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn prices(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
        entries
            .iter()
            .map(|(symbol, price)| (symbol.to_string(), *price))
            .collect()
    }

    fn simulator(slippage_pct: f64, per_share: f64, minimum: f64) -> FillSimulator {
        FillSimulator::new(ExecutionSettings {
            slippage_pct,
            commission_per_share: per_share,
            commission_minimum: minimum,
        })
        .unwrap()
    }

    #[test]
    fn buy_applies_slippage_and_minimum_commission() {
        let simulator = simulator(0.001, 0.005, 1.0);
        let mut state = PortfolioState::new(10_000.0);
        let order = Order::new(OrderAction::Buy, "AAPL", 50, 100.0);

        let fills = simulator.apply(&[order], &prices(&[("AAPL", 100.0)]), &mut state, date());

        assert_eq!(fills.len(), 1);
        let fill = &fills[0];
        assert_eq!(fill.status, FillStatus::Filled);
        assert!((fill.fill_price - 100.1).abs() < 1e-9);
        assert!((fill.commission - 1.0).abs() < 1e-12);
        assert!((state.cash() - (10_000.0 - 5_005.0 - 1.0)).abs() < 1e-9);
        let position = state.position("AAPL").unwrap();
        assert_eq!(position.shares, 50);
        assert!((position.average_cost - 100.1).abs() < 1e-9);
        assert_eq!(position.opened_on, date());
    }

    #[test]
    fn buy_beyond_cash_is_rejected_without_side_effects() {
        let simulator = simulator(0.0, 0.0, 0.0);
        let mut state = PortfolioState::new(10_000.0);
        let before = state.clone();
        let order = Order::new(OrderAction::Buy, "AAPL", 500, 100.0);

        let fills = simulator.apply(&[order], &prices(&[("AAPL", 100.0)]), &mut state, date());

        assert_eq!(fills[0].status, FillStatus::Rejected);
        assert_eq!(fills[0].shares, 0);
        assert!(fills[0].reason.as_deref().unwrap().starts_with("insufficient funds"));
        assert_eq!(state, before);
    }

    #[test]
    fn repeated_buys_average_cost_without_commission() {
        let simulator = simulator(0.0, 1.0, 0.0);
        let mut state = PortfolioState::new(100_000.0);
        simulator.apply(
            &[Order::new(OrderAction::Buy, "AAPL", 10, 100.0)],
            &prices(&[("AAPL", 100.0)]),
            &mut state,
            date(),
        );
        simulator.apply(
            &[Order::new(OrderAction::Buy, "AAPL", 30, 120.0)],
            &prices(&[("AAPL", 120.0)]),
            &mut state,
            date().succ_opt().unwrap(),
        );

        let position = state.position("AAPL").unwrap();
        assert_eq!(position.shares, 40);
        assert!((position.average_cost - 115.0).abs() < 1e-9);
        assert_eq!(position.opened_on, date());
        assert!((state.cash() - (100_000.0 - 1_010.0 - 3_630.0)).abs() < 1e-9);
    }

    #[test]
    fn sell_realizes_pnl_and_closes_position() {
        let simulator = simulator(0.01, 0.0, 2.0);
        let mut state = PortfolioState::with_positions(
            0.0,
            vec![Position {
                symbol: "MSFT".to_string(),
                shares: 10,
                average_cost: 200.0,
                peak_price: Some(260.0),
                opened_on: date(),
            }],
        );

        let fills = simulator.apply(
            &[Order::new(OrderAction::Sell, "MSFT", 10, 250.0)],
            &prices(&[("MSFT", 250.0)]),
            &mut state,
            date(),
        );

        let fill = &fills[0];
        assert_eq!(fill.status, FillStatus::Filled);
        assert!((fill.fill_price - 247.5).abs() < 1e-9);
        assert!((fill.realized_pnl.unwrap() - (475.0 - 2.0)).abs() < 1e-9);
        assert!((state.cash() - 2_473.0).abs() < 1e-9);
        assert!(state.position("MSFT").is_none());
    }

    #[test]
    fn oversized_sell_is_rejected_and_siblings_still_execute() {
        let simulator = simulator(0.0, 0.0, 0.0);
        let mut state = PortfolioState::with_positions(
            1_000.0,
            vec![Position {
                symbol: "MSFT".to_string(),
                shares: 5,
                average_cost: 100.0,
                peak_price: None,
                opened_on: date(),
            }],
        );
        let orders = vec![
            Order::new(OrderAction::Sell, "MSFT", 6, 100.0),
            Order::new(OrderAction::Sell, "MSFT", 2, 100.0),
            Order::new(OrderAction::Buy, "IBM", 1, 50.0),
        ];

        let fills = simulator.execute(
            &orders,
            &prices(&[("MSFT", 100.0)]),
            &mut state,
            date(),
        );

        assert_eq!(fills.len(), 3);
        assert_eq!(fills[0].status, FillStatus::Rejected);
        assert!(fills[0].reason.as_deref().unwrap().starts_with("insufficient shares"));
        assert_eq!(fills[1].status, FillStatus::Filled);
        assert_eq!(fills[2].status, FillStatus::Rejected);
        assert_eq!(fills[2].reason.as_deref(), Some("no price available"));
        assert_eq!(state.shares_held("MSFT"), 3);
        assert!((state.cash() - 1_200.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_out_of_range_settings_at_construction() {
        let negative_commission = ExecutionSettings {
            commission_per_share: -0.01,
            ..ExecutionSettings::default()
        };
        assert!(matches!(
            FillSimulator::new(negative_commission),
            Err(ConfigError::OutOfRange {
                name: "commission_per_share",
                ..
            })
        ));
        let full_slippage = ExecutionSettings {
            slippage_pct: 1.0,
            ..ExecutionSettings::default()
        };
        assert!(FillSimulator::new(full_slippage).is_err());
    }
}
