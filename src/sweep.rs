use crate::config::SimulationConfig;
use crate::engine::SimulationDriver;
use crate::market_data::MarketDataSource;
use crate::models::{BacktestMetrics, ParameterRange};
use crate::param_utils::expand_parameter_grid;
use crate::signals::SignalGenerator;
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use log::{info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepObjective {
    AnnualizedReturn,
    Sharpe,
}

impl SweepObjective {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "annualized_return" | "return" | "cagr" => Ok(Self::AnnualizedReturn),
            "sharpe" | "sharpe_ratio" => Ok(Self::Sharpe),
            other => Err(anyhow!(
                "Sweep objective must be ANNUALIZED_RETURN or SHARPE (value: {})",
                other
            )),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::AnnualizedReturn => "annualized return",
            Self::Sharpe => "Sharpe ratio",
        }
    }

    fn score(self, metrics: &BacktestMetrics) -> f64 {
        let score = match self {
            Self::AnnualizedReturn => metrics.annualized_return,
            Self::Sharpe => metrics.sharpe_ratio,
        };
        if score.is_finite() {
            score
        } else {
            f64::NEG_INFINITY
        }
    }
}

/// Grid to explore on top of a base parameter map
#[derive(Debug, Clone)]
pub struct SweepRequest {
    pub base_parameters: HashMap<String, f64>,
    pub ranges: BTreeMap<String, ParameterRange>,
    pub symbols: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub objective: SweepObjective,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepResult {
    pub parameters: BTreeMap<String, f64>,
    pub score: f64,
    pub final_value: f64,
    pub metrics: BacktestMetrics,
}

pub(crate) fn parameter_signature(parameters: &HashMap<String, f64>) -> String {
    let mut sorted: Vec<_> = parameters.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    format!("{:?}", sorted)
}

/// Runs one independent simulation per grid point in parallel and returns
/// the results best-first.
///
/// Grid points whose configuration is invalid, or whose run fails, are
/// logged and left out.
pub fn run_parameter_sweep<D, S>(data: &D, signals: &S, request: &SweepRequest) -> Vec<SweepResult>
where
    D: MarketDataSource + Sync,
    S: SignalGenerator + Sync,
{
    let mut seen = HashSet::new();
    let variations: Vec<HashMap<String, f64>> =
        expand_parameter_grid(&request.base_parameters, &request.ranges)
            .into_iter()
            .filter(|params| seen.insert(parameter_signature(params)))
            .collect();

    info!(
        "Sweeping {} parameter combination(s) by {}",
        variations.len(),
        request.objective.label()
    );

    let mut results: Vec<SweepResult> = variations
        .par_iter()
        .filter_map(|params| {
            let config = SimulationConfig::from_parameters(params);
            let driver = match SimulationDriver::new(config) {
                Ok(driver) => driver,
                Err(err) => {
                    warn!("Skipping {}: {}", parameter_signature(params), err);
                    return None;
                }
            };
            match driver.run(data, signals, &request.symbols, request.start, request.end) {
                Ok(result) => Some(SweepResult {
                    parameters: params.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                    score: request.objective.score(&result.metrics),
                    final_value: result.final_value,
                    metrics: result.metrics,
                }),
                Err(err) => {
                    warn!("Run failed for {}: {:#}", parameter_signature(params), err);
                    None
                }
            }
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| format!("{:?}", a.parameters).cmp(&format!("{:?}", b.parameters)))
    });

    if let Some(best) = results.first() {
        info!(
            "Best {} {:.4} with {:?}",
            request.objective.label(),
            best.score,
            best.parameters
        );
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::InMemoryMarketData;
    use crate::models::{DailyBar, Signals};
    use crate::signals::PrecomputedSignals;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn rising_bars() -> Vec<DailyBar> {
        (2..=12)
            .map(|d| DailyBar {
                symbol: "AAA".to_string(),
                date: date(d),
                open: 100.0 + d as f64,
                high: 100.0 + d as f64,
                low: 100.0 + d as f64,
                close: 100.0 + d as f64,
                volume: 1_000,
            })
            .collect()
    }

    #[test]
    fn parses_objectives() {
        assert_eq!(
            SweepObjective::parse(" Sharpe ").unwrap(),
            SweepObjective::Sharpe
        );
        assert_eq!(
            SweepObjective::parse("cagr").unwrap(),
            SweepObjective::AnnualizedReturn
        );
        assert!(SweepObjective::parse("sortino").is_err());
    }

    #[test]
    fn larger_allocation_ranks_first_in_rising_market() {
        let data = InMemoryMarketData::from_bars(rising_bars());
        let mut signals = PrecomputedSignals::new();
        let held: Signals = [("AAA".to_string(), 0.9)].into_iter().collect();
        signals.hold_range(date(2), date(12), &held);

        let base: HashMap<String, f64> = [
            ("initialCapital", 10_000.0),
            ("slippagePct", 0.0),
            ("takeProfitPct", 0.0),
            ("minCashReserve", 0.0),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        let mut ranges = BTreeMap::new();
        ranges.insert(
            "maxPositionSize".to_string(),
            ParameterRange {
                min: 0.2,
                max: 0.6,
                step: 0.2,
            },
        );
        // 1.2 is rejected by validation and dropped from the results
        ranges.insert(
            "cashBuffer".to_string(),
            ParameterRange {
                min: 0.0,
                max: 1.2,
                step: 1.2,
            },
        );

        let request = SweepRequest {
            base_parameters: base,
            ranges,
            symbols: vec!["AAA".to_string()],
            start: date(1),
            end: date(31),
            objective: SweepObjective::AnnualizedReturn,
        };

        let results = run_parameter_sweep(&data, &signals, &request);
        assert_eq!(results.len(), 3);
        assert!((results[0].parameters["maxPositionSize"] - 0.6).abs() < 1e-9);
        assert!(results[0].score > results[2].score);
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    }
}
