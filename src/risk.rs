use crate::config::RiskConfig;
use crate::error::ConfigResult;
use crate::models::{Order, OrderAction, PortfolioState, Position, TargetWeights, WEIGHT_TOLERANCE};
use chrono::NaiveDate;
use log::{debug, info, warn};
use serde::Serialize;

/// Slack for float noise when comparing weights against limits.
const LIMIT_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskAction {
    Approve,
    Adjust,
}

/// Outcome of [`RiskValidator::validate_weights`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightValidation {
    pub weights: TargetWeights,
    pub violations: Vec<String>,
    pub adjustments: Vec<String>,
    pub action: RiskAction,
}

impl WeightValidation {
    /// Adjustments joined with "; ". Empty when nothing fired.
    pub fn log(&self) -> String {
        self.adjustments.join("; ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitTrigger {
    StopLoss,
    TakeProfit,
    TrailingStop,
    TimeExit,
}

impl ExitTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitTrigger::StopLoss => "stop_loss",
            ExitTrigger::TakeProfit => "take_profit",
            ExitTrigger::TrailingStop => "trailing_stop",
            ExitTrigger::TimeExit => "time_exit",
        }
    }
}

/// Instruction to close a whole position outside the rebalance cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitSignal {
    pub symbol: String,
    pub shares: u64,
    pub trigger: ExitTrigger,
    pub reason: String,
    pub current_price: f64,
}

impl ExitSignal {
    pub fn to_order(&self) -> Order {
        Order::new(OrderAction::Sell, &self.symbol, self.shares, self.current_price)
    }
}

/// Result of a daily position check. `peak_price` already includes today's price.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionAssessment {
    pub peak_price: f64,
    pub exit: Option<ExitSignal>,
}

/// What a position check sees for one position on one day.
#[derive(Debug, Clone, Copy)]
pub struct PositionSnapshot<'a> {
    pub position: &'a Position,
    pub current_price: f64,
    pub peak_price: f64,
    pub pnl_pct: f64,
    pub days_held: i64,
}

/// A single exit rule. Rules run in the validator's order and the first
/// one returning `Some` wins.
pub trait PositionRiskCheck: Send + Sync {
    fn trigger(&self) -> ExitTrigger;
    /// Human-readable reason when the rule fires.
    fn evaluate(&self, snapshot: &PositionSnapshot<'_>) -> Option<String>;
}

pub struct StopLoss {
    pub pct: f64,
}

impl PositionRiskCheck for StopLoss {
    fn trigger(&self) -> ExitTrigger {
        ExitTrigger::StopLoss
    }

    fn evaluate(&self, snapshot: &PositionSnapshot<'_>) -> Option<String> {
        (snapshot.pnl_pct < -self.pct)
            .then(|| format!("Stop-loss triggered ({:.1}% loss)", snapshot.pnl_pct * 100.0))
    }
}

pub struct TakeProfit {
    pub pct: f64,
}

impl PositionRiskCheck for TakeProfit {
    fn trigger(&self) -> ExitTrigger {
        ExitTrigger::TakeProfit
    }

    fn evaluate(&self, snapshot: &PositionSnapshot<'_>) -> Option<String> {
        (snapshot.pnl_pct > self.pct)
            .then(|| format!("Take-profit triggered ({:.1}% gain)", snapshot.pnl_pct * 100.0))
    }
}

pub struct TrailingStop {
    pub pct: f64,
}

impl PositionRiskCheck for TrailingStop {
    fn trigger(&self) -> ExitTrigger {
        ExitTrigger::TrailingStop
    }

    fn evaluate(&self, snapshot: &PositionSnapshot<'_>) -> Option<String> {
        if snapshot.peak_price <= 0.0 {
            return None;
        }
        let from_peak = (snapshot.current_price - snapshot.peak_price) / snapshot.peak_price;
        (from_peak < -self.pct).then(|| {
            format!(
                "Trailing stop ({:.1}% from peak ${:.2})",
                from_peak * 100.0,
                snapshot.peak_price
            )
        })
    }
}

pub struct TimeExit {
    pub max_holding_days: u32,
}

impl PositionRiskCheck for TimeExit {
    fn trigger(&self) -> ExitTrigger {
        ExitTrigger::TimeExit
    }

    fn evaluate(&self, snapshot: &PositionSnapshot<'_>) -> Option<String> {
        (snapshot.days_held > i64::from(self.max_holding_days)).then(|| {
            format!(
                "Held {} days (limit {})",
                snapshot.days_held, self.max_holding_days
            )
        })
    }
}

/// Checks built from the configured thresholds, in fixed precedence:
/// stop-loss, take-profit, trailing stop, time exit.
pub fn default_checks(config: &RiskConfig) -> Vec<Box<dyn PositionRiskCheck>> {
    let mut checks: Vec<Box<dyn PositionRiskCheck>> = Vec::new();
    if let Some(pct) = config.stop_loss_pct {
        checks.push(Box::new(StopLoss { pct }));
    }
    if let Some(pct) = config.take_profit_pct {
        checks.push(Box::new(TakeProfit { pct }));
    }
    if let Some(pct) = config.trailing_stop_pct {
        checks.push(Box::new(TrailingStop { pct }));
    }
    if let Some(max_holding_days) = config.max_holding_days {
        checks.push(Box::new(TimeExit { max_holding_days }));
    }
    checks
}

/// An order that would break a weight limit if filled as estimated.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderWarning {
    pub symbol: String,
    pub action: OrderAction,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskMetrics {
    pub total_exposure: f64,
    pub cash_weight: f64,
    pub position_count: usize,
    pub max_position_weight: f64,
    pub herfindahl_index: f64,
    pub compliant_position_size: bool,
    pub compliant_exposure: bool,
    pub compliant_cash: bool,
}

pub struct RiskValidator {
    max_position_size: f64,
    max_total_exposure: f64,
    min_cash_reserve: f64,
    checks: Vec<Box<dyn PositionRiskCheck>>,
}

impl RiskValidator {
    pub fn new(config: &RiskConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            max_position_size: config.max_position_size,
            max_total_exposure: config.max_total_exposure,
            min_cash_reserve: config.min_cash_reserve,
            checks: default_checks(config),
        })
    }

    /// Replaces the position exit rules. Order is precedence.
    pub fn with_checks(mut self, checks: Vec<Box<dyn PositionRiskCheck>>) -> Self {
        self.checks = checks;
        self
    }

    /// Brings target weights within the configured limits.
    ///
    /// Negative symbol weights are first floored at zero. Passes then run in
    /// fixed order: position cap, exposure cap, cash-reserve floor. Any
    /// remaining deviation of the total from 1.0 is absorbed by Cash. Never
    /// fails; a weight vector that already complies comes back unchanged
    /// with an empty log.
    pub fn validate_weights(&self, target: &TargetWeights) -> WeightValidation {
        let mut weights = target.clone();
        let mut violations = Vec::new();
        let mut adjustments = Vec::new();

        // Long-only floor
        let mut floored = 0usize;
        for (symbol, weight) in weights.non_cash_mut() {
            if *weight < -LIMIT_EPSILON || !weight.is_finite() {
                violations.push(format!(
                    "{} weight {:.1}% is not a long position",
                    symbol,
                    *weight * 100.0
                ));
                *weight = 0.0;
                floored += 1;
            }
        }
        if floored > 0 {
            adjustments.push(format!("Floored {} negative weight(s) at 0%", floored));
        }

        // Position cap
        let mut capped = 0usize;
        let mut excess_total = 0.0;
        for (symbol, weight) in weights.non_cash_mut() {
            if *weight > self.max_position_size + LIMIT_EPSILON {
                violations.push(format!(
                    "{} weight {:.1}% exceeds limit {:.1}%",
                    symbol,
                    *weight * 100.0,
                    self.max_position_size * 100.0
                ));
                excess_total += *weight - self.max_position_size;
                *weight = self.max_position_size;
                capped += 1;
            }
        }
        if capped > 0 {
            let cash = weights.cash();
            weights.set_cash(cash + excess_total);
            adjustments.push(format!(
                "Capped {} position(s) at {:.0}%",
                capped,
                self.max_position_size * 100.0
            ));
        }

        // Exposure cap
        let exposure = weights.exposure();
        if exposure > self.max_total_exposure + LIMIT_EPSILON {
            let scale = self.max_total_exposure / exposure;
            for (_, weight) in weights.non_cash_mut() {
                *weight *= scale;
            }
            let new_exposure = weights.exposure();
            weights.set_cash(1.0 - new_exposure);
            violations.push(format!(
                "Total exposure {:.1}% exceeds limit {:.1}%",
                exposure * 100.0,
                self.max_total_exposure * 100.0
            ));
            adjustments.push(format!(
                "Scaled exposure from {:.1}% to {:.1}%",
                exposure * 100.0,
                self.max_total_exposure * 100.0
            ));
        }

        // Cash-reserve floor
        let cash = weights.cash();
        let invested = weights.exposure();
        if cash < self.min_cash_reserve - LIMIT_EPSILON && invested > 0.0 {
            let shortfall = self.min_cash_reserve - cash;
            let scale = ((invested - shortfall) / invested).max(0.0);
            for (_, weight) in weights.non_cash_mut() {
                *weight *= scale;
            }
            weights.set_cash(self.min_cash_reserve);
            violations.push(format!(
                "Cash {:.1}% below minimum {:.1}%",
                cash * 100.0,
                self.min_cash_reserve * 100.0
            ));
            adjustments.push(format!(
                "Increased cash reserve to {:.0}%",
                self.min_cash_reserve * 100.0
            ));
        }

        let total = weights.total();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            debug!("Renormalizing weights: total {:.8} absorbed into cash", total);
            let cash = weights.cash();
            weights.set_cash(cash + (1.0 - total));
        }

        let action = if violations.is_empty() {
            RiskAction::Approve
        } else {
            info!("Risk adjustments: {}", adjustments.join("; "));
            RiskAction::Adjust
        };

        WeightValidation {
            weights,
            violations,
            adjustments,
            action,
        }
    }

    /// Updates the trailing peak and runs the exit rules for one position.
    pub fn check_position_risk(
        &self,
        position: &Position,
        current_price: f64,
        as_of: NaiveDate,
    ) -> PositionAssessment {
        let previous_peak = position.peak_price.unwrap_or(position.average_cost);
        let peak_price = previous_peak.max(current_price);

        if position.average_cost <= 0.0 || !current_price.is_finite() {
            return PositionAssessment {
                peak_price,
                exit: None,
            };
        }

        let snapshot = PositionSnapshot {
            position,
            current_price,
            peak_price,
            pnl_pct: (current_price - position.average_cost) / position.average_cost,
            days_held: (as_of - position.opened_on).num_days(),
        };

        let exit = self.checks.iter().find_map(|check| {
            check.evaluate(&snapshot).map(|reason| ExitSignal {
                symbol: position.symbol.clone(),
                shares: position.shares,
                trigger: check.trigger(),
                reason,
                current_price,
            })
        });

        if let Some(signal) = &exit {
            info!("{} exit for {}: {}", signal.trigger.as_str(), signal.symbol, signal.reason);
        }

        PositionAssessment { peak_price, exit }
    }

    /// Flags orders whose estimated value would push the book past a limit.
    /// Advisory only; orders are not removed.
    pub fn validate_orders(
        &self,
        orders: &[Order],
        state: &PortfolioState,
        total_value: f64,
    ) -> Vec<OrderWarning> {
        if total_value <= 0.0 {
            return Vec::new();
        }

        let mut warnings = Vec::new();
        let mut cash = state.cash();
        let mut exposure = state.positions_value();

        for order in orders {
            let current_value = state
                .position(&order.symbol)
                .zip(state.price(&order.symbol))
                .map(|(position, price)| position.market_value(price))
                .unwrap_or(0.0);

            match order.action {
                OrderAction::Sell => {
                    cash += order.estimated_value;
                    exposure -= order.estimated_value.min(current_value);
                }
                OrderAction::Buy => {
                    cash -= order.estimated_value;
                    exposure += order.estimated_value;
                    let projected = (current_value + order.estimated_value) / total_value;
                    if projected > self.max_position_size + WEIGHT_TOLERANCE {
                        warnings.push(OrderWarning {
                            symbol: order.symbol.clone(),
                            action: order.action,
                            message: format!(
                                "position would reach {:.1}% (limit {:.1}%)",
                                projected * 100.0,
                                self.max_position_size * 100.0
                            ),
                        });
                    }
                    if exposure / total_value > self.max_total_exposure + WEIGHT_TOLERANCE {
                        warnings.push(OrderWarning {
                            symbol: order.symbol.clone(),
                            action: order.action,
                            message: format!(
                                "exposure would reach {:.1}% (limit {:.1}%)",
                                exposure / total_value * 100.0,
                                self.max_total_exposure * 100.0
                            ),
                        });
                    }
                    if cash / total_value < self.min_cash_reserve - WEIGHT_TOLERANCE {
                        warnings.push(OrderWarning {
                            symbol: order.symbol.clone(),
                            action: order.action,
                            message: format!(
                                "cash would fall to {:.1}% (minimum {:.1}%)",
                                cash / total_value * 100.0,
                                self.min_cash_reserve * 100.0
                            ),
                        });
                    }
                }
            }
        }

        for warning in &warnings {
            warn!("Order check {} {}: {}", warning.action, warning.symbol, warning.message);
        }
        warnings
    }

    pub fn risk_metrics(&self, weights: &TargetWeights) -> RiskMetrics {
        let total_exposure = weights.exposure();
        let cash_weight = weights.cash();
        let max_position_weight = weights
            .non_cash()
            .map(|(_, w)| w)
            .fold(0.0_f64, f64::max);

        RiskMetrics {
            total_exposure,
            cash_weight,
            position_count: weights.non_cash().filter(|(_, w)| *w > 0.0).count(),
            max_position_weight,
            herfindahl_index: weights.non_cash().map(|(_, w)| w * w).sum(),
            compliant_position_size: max_position_weight
                <= self.max_position_size + WEIGHT_TOLERANCE,
            compliant_exposure: total_exposure <= self.max_total_exposure + WEIGHT_TOLERANCE,
            compliant_cash: cash_weight >= self.min_cash_reserve - WEIGHT_TOLERANCE,
        }
    }
}
