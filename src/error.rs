use thiserror::Error;

/// Configuration problems detected when a simulation is constructed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A fractional setting fell outside its allowed interval.
    #[error("{name} must be in {interval} (value: {value})")]
    OutOfRange {
        name: &'static str,
        interval: &'static str,
        value: f64,
    },

    #[error("{name} must be finite (value: {value})")]
    NotFinite { name: &'static str, value: f64 },

    #[error("max_positions must be >= 1 (value: {0})")]
    NoPositionsAllowed(usize),

    /// Exposure cap and cash reserve cannot both be honored.
    #[error(
        "max_total_exposure ({exposure}) + min_cash_reserve ({reserve}) must not exceed 1.0"
    )]
    ExposureReserveConflict { exposure: f64, reserve: f64 },

    #[error("initial_capital must be > 0 (value: {0})")]
    NonPositiveCapital(f64),

    #[error("{name} must be > 0 when set (value: {value})")]
    NonPositiveThreshold { name: &'static str, value: f64 },

    #[error("max_holding_days must be >= 1 when set (value: {0})")]
    InvalidHoldingPeriod(u32),

    #[error("history_lookback_days must be >= 1 when set (value: {0})")]
    InvalidLookback(usize),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_setting() {
        let err = ConfigError::OutOfRange {
            name: "min_signal_threshold",
            interval: "[0, 1)",
            value: 1.0,
        };
        assert_eq!(
            err.to_string(),
            "min_signal_threshold must be in [0, 1) (value: 1)"
        );
        assert!(ConfigError::NonPositiveCapital(-5.0)
            .to_string()
            .contains("initial_capital"));
    }
}
