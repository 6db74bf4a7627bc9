use crate::error::{ConfigError, ConfigResult};
use crate::models::RebalanceCadence;
use anyhow::{anyhow, Result};
use std::collections::HashMap;

/// Which rule turns filtered signals into weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMode {
    /// Weights proportional to signal strength.
    SignalWeighted,
    EqualWeight,
}

impl AllocationMode {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => AllocationMode::EqualWeight,
            _ => AllocationMode::SignalWeighted,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AllocationMode::SignalWeighted => "signal-weighted",
            AllocationMode::EqualWeight => "equal-weight",
        }
    }
}

/// Configuration for turning signals into target weights and orders
#[derive(Debug, Clone)]
pub struct AllocationConfig {
    pub mode: AllocationMode,
    pub min_signal_threshold: f64,
    pub max_positions: usize,
    pub cash_buffer: f64,
    pub min_trade_value: f64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            mode: AllocationMode::SignalWeighted,
            min_signal_threshold: 0.3,
            max_positions: 10,
            cash_buffer: 0.10,
            min_trade_value: 100.0,
        }
    }
}

impl AllocationConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        check_interval(
            "min_signal_threshold",
            self.min_signal_threshold,
            Interval::ClosedOpen,
        )?;
        if self.max_positions < 1 {
            return Err(ConfigError::NoPositionsAllowed(self.max_positions));
        }
        check_interval("cash_buffer", self.cash_buffer, Interval::ClosedOpen)?;
        check_non_negative("min_trade_value", self.min_trade_value)
    }
}

/// Configuration for weight limits and per-position exits
#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_position_size: f64,
    pub max_total_exposure: f64,
    pub min_cash_reserve: f64,
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
    pub trailing_stop_pct: Option<f64>,
    pub max_holding_days: Option<u32>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_size: 0.20,
            max_total_exposure: 0.90,
            min_cash_reserve: 0.05,
            stop_loss_pct: Some(0.08),
            take_profit_pct: Some(0.25),
            trailing_stop_pct: Some(0.05),
            max_holding_days: None,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        check_max_position_size(self.max_position_size)?;
        check_interval("max_total_exposure", self.max_total_exposure, Interval::OpenClosed)?;
        check_interval("min_cash_reserve", self.min_cash_reserve, Interval::ClosedOpen)?;
        if self.max_total_exposure + self.min_cash_reserve > 1.0 + 1e-9 {
            return Err(ConfigError::ExposureReserveConflict {
                exposure: self.max_total_exposure,
                reserve: self.min_cash_reserve,
            });
        }
        for (name, value) in [
            ("stop_loss_pct", self.stop_loss_pct),
            ("take_profit_pct", self.take_profit_pct),
            ("trailing_stop_pct", self.trailing_stop_pct),
        ] {
            if let Some(value) = value {
                ensure_finite(name, value)?;
                if value <= 0.0 {
                    return Err(ConfigError::NonPositiveThreshold { name, value });
                }
            }
        }
        if let Some(days) = self.max_holding_days {
            if days < 1 {
                return Err(ConfigError::InvalidHoldingPeriod(days));
            }
        }
        Ok(())
    }
}

/// Transaction cost model for simulated fills
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub slippage_pct: f64,
    pub commission_per_share: f64,
    pub commission_minimum: f64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            slippage_pct: 0.001,
            commission_per_share: 0.0,
            commission_minimum: 0.0,
        }
    }
}

impl ExecutionSettings {
    /// Reads `SLIPPAGE_PCT`, `COMMISSION_PER_SHARE` and `COMMISSION_MINIMUM`.
    /// Absent or blank keys keep their defaults. The result satisfies
    /// [`Self::validate`].
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        let slippage_pct = setting_f64_or(
            settings,
            "SLIPPAGE_PCT",
            defaults.slippage_pct,
            Some(0.0),
            None,
        )?;
        if slippage_pct >= 1.0 {
            return Err(anyhow!(
                "Setting SLIPPAGE_PCT must be < 1 (value: {})",
                slippage_pct
            ));
        }
        let commission_per_share = setting_f64_or(
            settings,
            "COMMISSION_PER_SHARE",
            defaults.commission_per_share,
            Some(0.0),
            None,
        )?;
        let commission_minimum = setting_f64_or(
            settings,
            "COMMISSION_MINIMUM",
            defaults.commission_minimum,
            Some(0.0),
            None,
        )?;

        let parsed = Self {
            slippage_pct,
            commission_per_share,
            commission_minimum,
        };
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        check_interval("slippage_pct", self.slippage_pct, Interval::ClosedOpen)?;
        check_non_negative("commission_per_share", self.commission_per_share)?;
        check_non_negative("commission_minimum", self.commission_minimum)
    }

    pub fn commission_for(&self, shares: u64) -> f64 {
        (self.commission_per_share * shares as f64).max(self.commission_minimum)
    }
}

/// Circuit-breaker limits; both disabled by default
#[derive(Debug, Clone, Default)]
pub struct MonitorConfig {
    pub daily_loss_limit: Option<f64>,
    pub max_drawdown_limit: Option<f64>,
}

impl MonitorConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        for (name, value) in [
            ("daily_loss_limit", self.daily_loss_limit),
            ("max_drawdown_limit", self.max_drawdown_limit),
        ] {
            if let Some(value) = value {
                check_interval(name, value, Interval::OpenClosed)?;
            }
        }
        Ok(())
    }
}

/// Immutable configuration for one simulation run
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub initial_capital: f64,
    pub rebalance_cadence: RebalanceCadence,
    /// Calendar days of bar history handed to the signal generator.
    pub history_lookback_days: Option<usize>,
    /// Symbol whose closes the equity curve is compared against.
    pub benchmark_symbol: Option<String>,

    // Grouped configurations
    pub allocation: AllocationConfig,
    pub risk: RiskConfig,
    pub execution: ExecutionSettings,
    pub monitor: MonitorConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            initial_capital: 100_000.0,
            rebalance_cadence: RebalanceCadence::Daily,
            history_lookback_days: None,
            benchmark_symbol: None,
            allocation: AllocationConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionSettings::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// Create a SimulationConfig from a camelCase parameter map.
    ///
    /// Optional thresholds (`stopLossPct`, `maxHoldingDays`, ...) are disabled
    /// by a value <= 0. Values are not range-checked here; see [`Self::validate`].
    pub fn from_parameters(parameters: &HashMap<String, f64>) -> Self {
        use crate::param_utils::*;

        let defaults = Self::default();
        let cadence_code =
            get_param_usize_rounded_clamped(parameters, "rebalanceCadence", 0, 0, 2) as i32;

        Self {
            initial_capital: get_param(parameters, "initialCapital", defaults.initial_capital),
            rebalance_cadence: RebalanceCadence::from_code(cadence_code)
                .unwrap_or(defaults.rebalance_cadence),
            history_lookback_days: positive_param(parameters, "historyLookbackDays")
                .map(|v| v.round() as usize),
            benchmark_symbol: defaults.benchmark_symbol,
            allocation: AllocationConfig {
                mode: AllocationMode::from_code(get_rounded_param(parameters, "allocationMode", 0)),
                min_signal_threshold: get_param(
                    parameters,
                    "minSignalThreshold",
                    defaults.allocation.min_signal_threshold,
                ),
                max_positions: get_param_usize(
                    parameters,
                    "maxPositions",
                    defaults.allocation.max_positions,
                ),
                cash_buffer: get_param(parameters, "cashBuffer", defaults.allocation.cash_buffer),
                min_trade_value: get_param(
                    parameters,
                    "minTradeValue",
                    defaults.allocation.min_trade_value,
                ),
            },
            risk: RiskConfig {
                max_position_size: get_param(
                    parameters,
                    "maxPositionSize",
                    defaults.risk.max_position_size,
                ),
                max_total_exposure: get_param(
                    parameters,
                    "maxTotalExposure",
                    defaults.risk.max_total_exposure,
                ),
                min_cash_reserve: get_param(
                    parameters,
                    "minCashReserve",
                    defaults.risk.min_cash_reserve,
                ),
                stop_loss_pct: optional_param(
                    parameters,
                    "stopLossPct",
                    defaults.risk.stop_loss_pct,
                ),
                take_profit_pct: optional_param(
                    parameters,
                    "takeProfitPct",
                    defaults.risk.take_profit_pct,
                ),
                trailing_stop_pct: optional_param(
                    parameters,
                    "trailingStopPct",
                    defaults.risk.trailing_stop_pct,
                ),
                max_holding_days: match parameters.get("maxHoldingDays") {
                    Some(_) => {
                        positive_param(parameters, "maxHoldingDays").map(|v| v.round() as u32)
                    }
                    None => defaults.risk.max_holding_days,
                },
            },
            execution: ExecutionSettings {
                slippage_pct: get_param(parameters, "slippagePct", defaults.execution.slippage_pct),
                commission_per_share: get_param(
                    parameters,
                    "commissionPerShare",
                    defaults.execution.commission_per_share,
                ),
                commission_minimum: get_param(
                    parameters,
                    "commissionMinimum",
                    defaults.execution.commission_minimum,
                ),
            },
            monitor: MonitorConfig {
                daily_loss_limit: positive_param(parameters, "dailyLossLimit"),
                max_drawdown_limit: positive_param(parameters, "maxDrawdownLimit"),
            },
        }
    }

    /// Checks every setting against its allowed range.
    pub fn validate(&self) -> ConfigResult<()> {
        ensure_finite("initial_capital", self.initial_capital)?;
        if self.initial_capital <= 0.0 {
            return Err(ConfigError::NonPositiveCapital(self.initial_capital));
        }
        if let Some(days) = self.history_lookback_days {
            if days == 0 {
                return Err(ConfigError::InvalidLookback(days));
            }
        }

        self.allocation.validate()?;
        self.risk.validate()?;
        self.execution.validate()?;
        self.monitor.validate()
    }
}

#[derive(Clone, Copy)]
enum Interval {
    /// [0, 1)
    ClosedOpen,
    /// (0, 1]
    OpenClosed,
}

fn ensure_finite(name: &'static str, value: f64) -> ConfigResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::NotFinite { name, value })
    }
}

fn check_interval(name: &'static str, value: f64, interval: Interval) -> ConfigResult<()> {
    ensure_finite(name, value)?;
    let (inside, label) = match interval {
        Interval::ClosedOpen => ((0.0..1.0).contains(&value), "[0, 1)"),
        Interval::OpenClosed => (value > 0.0 && value <= 1.0, "(0, 1]"),
    };
    if inside {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            interval: label,
            value,
        })
    }
}

fn check_non_negative(name: &'static str, value: f64) -> ConfigResult<()> {
    ensure_finite(name, value)?;
    if value < 0.0 {
        return Err(ConfigError::OutOfRange {
            name,
            interval: "[0, inf)",
            value,
        });
    }
    Ok(())
}

/// Per-symbol weight cap, shared by the allocator and the risk limits.
pub(crate) fn check_max_position_size(value: f64) -> ConfigResult<()> {
    check_interval("max_position_size", value, Interval::OpenClosed)
}

fn optional_param(
    parameters: &HashMap<String, f64>,
    key: &str,
    default: Option<f64>,
) -> Option<f64> {
    match parameters.get(key) {
        Some(_) => positive_param(parameters, key),
        None => default,
    }
}

fn positive_param(parameters: &HashMap<String, f64>, key: &str) -> Option<f64> {
    crate::param_utils::finite_param(parameters, key).filter(|v| *v > 0.0)
}

fn setting_f64_or(
    settings: &HashMap<String, String>,
    key: &str,
    default: f64,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let Some(raw) = settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
    else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        assert!(SimulationConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_threshold_at_or_above_one() {
        let mut config = SimulationConfig::default();
        config.allocation.min_signal_threshold = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                name: "min_signal_threshold",
                ..
            })
        ));
    }

    #[test]
    fn rejects_negative_capital_and_conflicting_limits() {
        let mut config = SimulationConfig::default();
        config.initial_capital = -1.0;
        assert_eq!(config.validate(), Err(ConfigError::NonPositiveCapital(-1.0)));

        let mut config = SimulationConfig::default();
        config.risk.max_total_exposure = 0.97;
        config.risk.min_cash_reserve = 0.05;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ExposureReserveConflict { .. })
        ));

        let mut config = SimulationConfig::default();
        config.risk.stop_loss_pct = Some(0.0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonPositiveThreshold {
                name: "stop_loss_pct",
                ..
            })
        ));

        let mut config = SimulationConfig::default();
        config.allocation.max_positions = 0;
        assert_eq!(config.validate(), Err(ConfigError::NoPositionsAllowed(0)));
    }

    #[test]
    fn builds_from_camel_case_parameters() {
        let params: HashMap<String, f64> = [
            ("initialCapital", 50_000.0),
            ("minSignalThreshold", 0.25),
            ("maxPositions", 4.0),
            ("rebalanceCadence", 1.0),
            ("allocationMode", 1.0),
            ("trailingStopPct", 0.0),
            ("maxHoldingDays", 30.0),
            ("dailyLossLimit", 0.02),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let config = SimulationConfig::from_parameters(&params);
        assert_eq!(config.initial_capital, 50_000.0);
        assert_eq!(config.allocation.max_positions, 4);
        assert_eq!(config.allocation.mode, AllocationMode::EqualWeight);
        assert_eq!(config.rebalance_cadence, RebalanceCadence::Weekly);
        assert_eq!(config.risk.trailing_stop_pct, None);
        assert_eq!(config.risk.stop_loss_pct, Some(0.08));
        assert_eq!(config.risk.max_holding_days, Some(30));
        assert_eq!(config.monitor.daily_loss_limit, Some(0.02));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn execution_settings_parse_with_defaults_and_bounds() {
        let mut settings = HashMap::new();
        settings.insert("COMMISSION_PER_SHARE".to_string(), "0.005".to_string());
        settings.insert("COMMISSION_MINIMUM".to_string(), " ".to_string());
        let parsed = ExecutionSettings::from_settings_map(&settings).unwrap();
        assert_eq!(parsed.commission_per_share, 0.005);
        assert_eq!(parsed.commission_minimum, 0.0);
        assert_eq!(parsed.slippage_pct, 0.001);
        assert_eq!(parsed.commission_for(100), 0.5);

        settings.insert("SLIPPAGE_PCT".to_string(), "-0.1".to_string());
        let err = ExecutionSettings::from_settings_map(&settings).unwrap_err();
        assert!(err.to_string().contains("SLIPPAGE_PCT"));
    }

    #[test]
    fn settings_map_and_validate_agree_on_full_slippage() {
        let mut settings = HashMap::new();
        settings.insert("SLIPPAGE_PCT".to_string(), "1.0".to_string());
        let err = ExecutionSettings::from_settings_map(&settings).unwrap_err();
        assert!(err.to_string().contains("SLIPPAGE_PCT"));

        let direct = ExecutionSettings {
            slippage_pct: 1.0,
            ..ExecutionSettings::default()
        };
        assert!(matches!(
            direct.validate(),
            Err(ConfigError::OutOfRange {
                name: "slippage_pct",
                ..
            })
        ));

        settings.insert("SLIPPAGE_PCT".to_string(), "0.999".to_string());
        let parsed = ExecutionSettings::from_settings_map(&settings).unwrap();
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn group_configs_validate_on_their_own() {
        let allocation = AllocationConfig {
            cash_buffer: 1.5,
            ..AllocationConfig::default()
        };
        assert!(matches!(
            allocation.validate(),
            Err(ConfigError::OutOfRange {
                name: "cash_buffer",
                ..
            })
        ));

        let risk = RiskConfig {
            max_position_size: 0.0,
            ..RiskConfig::default()
        };
        assert!(matches!(
            risk.validate(),
            Err(ConfigError::OutOfRange {
                name: "max_position_size",
                ..
            })
        ));

        let monitor = MonitorConfig {
            daily_loss_limit: Some(1.5),
            max_drawdown_limit: None,
        };
        assert!(monitor.validate().is_err());
        assert!(MonitorConfig::default().validate().is_ok());
    }
}
