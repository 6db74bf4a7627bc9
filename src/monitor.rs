use crate::config::MonitorConfig;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerKind {
    DailyLoss,
    MaxDrawdown,
}

/// A tripped circuit breaker. `observed` and `limit` are fractions (negative for losses).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreak {
    pub kind: BreakerKind,
    pub observed: f64,
    pub limit: f64,
}

impl fmt::Display for CircuitBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            BreakerKind::DailyLoss => "Daily loss limit hit",
            BreakerKind::MaxDrawdown => "Maximum drawdown exceeded",
        };
        write!(
            f,
            "{}: {:.2}% (limit: {:.2}%)",
            label,
            self.observed * 100.0,
            self.limit * 100.0
        )
    }
}

/// Portfolio-level circuit breaker.
///
/// Tracks the value at the start of each day and the running peak. While a
/// limit is breached the simulation keeps marking positions and running
/// exits but skips new allocation.
#[derive(Debug, Clone)]
pub struct PortfolioMonitor {
    config: MonitorConfig,
    day_start_value: f64,
    peak_value: f64,
}

impl PortfolioMonitor {
    pub fn new(config: MonitorConfig, initial_value: f64) -> Self {
        Self {
            config,
            day_start_value: initial_value,
            peak_value: initial_value,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.daily_loss_limit.is_some() || self.config.max_drawdown_limit.is_some()
    }

    pub fn daily_pnl_pct(&self, value: f64) -> f64 {
        if self.day_start_value > 0.0 {
            (value - self.day_start_value) / self.day_start_value
        } else {
            0.0
        }
    }

    pub fn drawdown_from_peak(&self, value: f64) -> f64 {
        let peak = self.peak_value.max(value);
        if peak > 0.0 {
            (value - peak) / peak
        } else {
            0.0
        }
    }

    /// Checks the intraday value against both limits, daily loss first.
    pub fn check(&self, value: f64) -> Option<CircuitBreak> {
        if let Some(limit) = self.config.daily_loss_limit {
            let observed = self.daily_pnl_pct(value);
            if observed <= -limit {
                return Some(CircuitBreak {
                    kind: BreakerKind::DailyLoss,
                    observed,
                    limit: -limit,
                });
            }
        }
        if let Some(limit) = self.config.max_drawdown_limit {
            let observed = self.drawdown_from_peak(value);
            if observed <= -limit {
                return Some(CircuitBreak {
                    kind: BreakerKind::MaxDrawdown,
                    observed,
                    limit: -limit,
                });
            }
        }
        None
    }

    /// Records the closing value, which becomes the next day's reference.
    pub fn close_day(&mut self, value: f64) {
        self.day_start_value = value;
        if value > self.peak_value {
            self.peak_value = value;
        }
    }
}
