use anyhow::anyhow;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Reserved weight key holding the uninvested fraction of the portfolio.
pub const CASH_KEY: &str = "Cash";
/// Tolerance for the "weights sum to one" invariant.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;
pub const PRICE_EPSILON: f64 = 1e-9;

/// Per-symbol directional strength in [-1, 1].
pub type Signals = BTreeMap<String, f64>;

/// Target allocation as fractions of total portfolio value, including the
/// reserved [`CASH_KEY`] entry.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetWeights {
    weights: BTreeMap<String, f64>,
}

impl TargetWeights {
    pub fn all_cash() -> Self {
        let mut weights = BTreeMap::new();
        weights.insert(CASH_KEY.to_string(), 1.0);
        Self { weights }
    }

    /// Wraps a raw weight map. A missing Cash entry is treated as zero.
    pub fn from_map(weights: BTreeMap<String, f64>) -> Self {
        Self { weights }
    }

    /// Builds weights from symbol entries and assigns the remainder to Cash.
    pub fn from_symbol_weights<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, f64)>,
    {
        let mut weights: BTreeMap<String, f64> = entries
            .into_iter()
            .filter(|(symbol, _)| symbol != CASH_KEY)
            .collect();
        let invested: f64 = weights.values().sum();
        weights.insert(CASH_KEY.to_string(), (1.0 - invested).max(0.0));
        Self { weights }
    }

    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.weights.get(symbol).copied()
    }

    pub fn cash(&self) -> f64 {
        self.weights.get(CASH_KEY).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, symbol: &str, weight: f64) {
        self.weights.insert(symbol.to_string(), weight);
    }

    pub fn set_cash(&mut self, weight: f64) {
        self.set(CASH_KEY, weight);
    }

    /// Iterates every entry except Cash, in symbol order.
    pub fn non_cash(&self) -> impl Iterator<Item = (&str, f64)> {
        self.weights
            .iter()
            .filter(|(symbol, _)| symbol.as_str() != CASH_KEY)
            .map(|(symbol, weight)| (symbol.as_str(), *weight))
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.non_cash().map(|(symbol, _)| symbol)
    }

    /// Sum of non-cash weights.
    pub fn exposure(&self) -> f64 {
        self.non_cash().map(|(_, weight)| weight).sum()
    }

    pub fn total(&self) -> f64 {
        self.weights.values().sum()
    }

    pub fn is_normalized(&self) -> bool {
        (self.total() - 1.0).abs() <= WEIGHT_TOLERANCE
    }

    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.weights
    }

    pub fn into_map(self) -> BTreeMap<String, f64> {
        self.weights
    }

    pub(crate) fn non_cash_mut(&mut self) -> impl Iterator<Item = (&String, &mut f64)> {
        self.weights
            .iter_mut()
            .filter(|(symbol, _)| symbol.as_str() != CASH_KEY)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderAction {
    Buy,
    Sell,
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Buy => "BUY",
            OrderAction::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(OrderAction::Buy),
            "sell" => Ok(OrderAction::Sell),
            other => Err(anyhow!("Unknown order action '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub action: OrderAction,
    pub symbol: String,
    pub shares: u64,
    pub estimated_value: f64,
}

impl Order {
    pub fn new(action: OrderAction, symbol: &str, shares: u64, price: f64) -> Self {
        Self {
            action,
            symbol: symbol.to_string(),
            shares,
            estimated_value: shares as f64 * price,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub shares: u64,
    pub average_cost: f64,
    /// Highest price observed since entry, for trailing-stop tracking.
    pub peak_price: Option<f64>,
    pub opened_on: NaiveDate,
}

impl Position {
    pub fn market_value(&self, price: f64) -> f64 {
        self.shares as f64 * price
    }

    pub fn cost_basis(&self) -> f64 {
        self.shares as f64 * self.average_cost
    }
}

/// The single mutable aggregate of a run: holdings, cash and last known prices.
///
/// Read access is public. Holdings and cash are only changed through an
/// [`crate::execution::OrderExecutor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioState {
    positions: BTreeMap<String, Position>,
    cash: f64,
    prices: BTreeMap<String, f64>,
}

impl PortfolioState {
    pub fn new(initial_cash: f64) -> Self {
        Self {
            positions: BTreeMap::new(),
            cash: initial_cash,
            prices: BTreeMap::new(),
        }
    }

    /// Seeds a state with existing holdings, pricing each at its average cost
    /// until a market price is recorded.
    pub fn with_positions<I>(cash: f64, positions: I) -> Self
    where
        I: IntoIterator<Item = Position>,
    {
        let mut state = Self::new(cash);
        for position in positions {
            state
                .prices
                .insert(position.symbol.clone(), position.average_cost);
            state.positions.insert(position.symbol.clone(), position);
        }
        state
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn positions(&self) -> &BTreeMap<String, Position> {
        &self.positions
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn shares_held(&self, symbol: &str) -> u64 {
        self.positions.get(symbol).map(|p| p.shares).unwrap_or(0)
    }

    pub fn prices(&self) -> &BTreeMap<String, f64> {
        &self.prices
    }

    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.prices.get(symbol).copied()
    }

    pub fn positions_value(&self) -> f64 {
        self.positions
            .values()
            .map(|position| {
                let price = self.price(&position.symbol).unwrap_or(position.average_cost);
                position.market_value(price)
            })
            .sum()
    }

    pub fn total_value(&self) -> f64 {
        self.cash + self.positions_value()
    }

    /// Current holdings expressed as weights of total value, Cash included.
    pub fn current_weights(&self) -> TargetWeights {
        let total = self.total_value();
        if total <= 0.0 {
            return TargetWeights::all_cash();
        }
        let mut weights = BTreeMap::new();
        for position in self.positions.values() {
            let price = self.price(&position.symbol).unwrap_or(position.average_cost);
            weights.insert(position.symbol.clone(), position.market_value(price) / total);
        }
        weights.insert(CASH_KEY.to_string(), self.cash / total);
        TargetWeights::from_map(weights)
    }

    pub(crate) fn record_price(&mut self, symbol: &str, price: f64) {
        self.prices.insert(symbol.to_string(), price);
    }

    pub(crate) fn set_peak_price(&mut self, symbol: &str, peak_price: f64) {
        if let Some(position) = self.positions.get_mut(symbol) {
            position.peak_price = Some(peak_price);
        }
    }

    pub(crate) fn debit_cash(&mut self, amount: f64) {
        self.cash -= amount;
    }

    pub(crate) fn credit_cash(&mut self, amount: f64) {
        self.cash += amount;
    }

    pub(crate) fn position_mut(&mut self, symbol: &str) -> Option<&mut Position> {
        self.positions.get_mut(symbol)
    }

    pub(crate) fn insert_position(&mut self, position: Position) {
        self.positions.insert(position.symbol.clone(), position);
    }

    pub(crate) fn remove_position(&mut self, symbol: &str) -> Option<Position> {
        self.positions.remove(symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FillStatus {
    Filled,
    Rejected,
}

impl FillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FillStatus::Filled => "FILLED",
            FillStatus::Rejected => "REJECTED",
        }
    }
}

/// Outcome of one order. Rejected fills carry zero shares and a reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub order: Order,
    pub date: NaiveDate,
    pub fill_price: f64,
    pub shares: u64,
    pub commission: f64,
    pub status: FillStatus,
    pub realized_pnl: Option<f64>,
    pub reason: Option<String>,
}

impl Fill {
    pub fn is_filled(&self) -> bool {
        self.status == FillStatus::Filled
    }

    pub fn gross_value(&self) -> f64 {
        self.fill_price * self.shares as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub portfolio_value: f64,
    pub cash: f64,
    pub positions_value: f64,
    pub position_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyBar {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// A BUY lot (or part of one) matched FIFO against a later SELL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedTrade {
    pub symbol: String,
    pub entry_date: NaiveDate,
    pub exit_date: NaiveDate,
    pub shares: u64,
    pub entry_price: f64,
    pub exit_price: f64,
    /// Net of the pro-rated entry and exit commissions.
    pub pnl: f64,
    pub return_pct: f64,
}

impl ClosedTrade {
    pub fn is_win(&self) -> bool {
        self.pnl > 0.0
    }

    pub fn holding_days(&self) -> i64 {
        (self.exit_date - self.entry_date).num_days()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestMetrics {
    pub total_return: f64,
    pub annualized_return: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub max_drawdown: f64,
    pub calmar_ratio: f64,
    pub annualized_volatility: f64,
    /// Historical one-day value at risk, as a positive loss fraction.
    pub var_95: f64,
    pub var_99: f64,
    /// Mean loss on days at or beyond the 95% VaR quantile.
    pub cvar_95: f64,
    /// Gains over losses around a zero return. `None` when no day lost money.
    pub omega_ratio: Option<f64>,
    pub ulcer_index: f64,
    pub trading_days: usize,
    pub filled_orders: usize,
    pub rejected_orders: usize,
    pub closed_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_commission: f64,
    pub avg_trade_pnl: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    pub rebalance_count: usize,
    pub forced_exit_count: usize,
    pub circuit_breaker_halts: usize,
}

/// Portfolio against a benchmark over the days both have a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkComparison {
    pub symbol: String,
    pub aligned_days: usize,
    pub portfolio_return: f64,
    pub benchmark_return: f64,
    pub excess_return: f64,
    /// Annualized standard deviation of daily excess returns.
    pub tracking_error: f64,
    pub beta: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResult {
    pub id: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: f64,
    pub final_value: f64,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<Fill>,
    pub round_trips: Vec<ClosedTrade>,
    pub metrics: BacktestMetrics,
    pub benchmark: Option<BenchmarkComparison>,
}

impl BacktestResult {
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebalanceCadence {
    Daily,
    Weekly,
    Monthly,
}

impl RebalanceCadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebalanceCadence::Daily => "daily",
            RebalanceCadence::Weekly => "weekly",
            RebalanceCadence::Monthly => "monthly",
        }
    }

    /// Numeric encoding used by parameter maps: 0 daily, 1 weekly, 2 monthly.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(RebalanceCadence::Daily),
            1 => Some(RebalanceCadence::Weekly),
            2 => Some(RebalanceCadence::Monthly),
            _ => None,
        }
    }
}

impl FromStr for RebalanceCadence {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "daily" => Ok(RebalanceCadence::Daily),
            "weekly" => Ok(RebalanceCadence::Weekly),
            "monthly" => Ok(RebalanceCadence::Monthly),
            other => Err(anyhow!("Unknown rebalance cadence '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}
