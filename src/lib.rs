pub mod allocator;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod market_data;
pub mod models;
pub mod monitor;
pub mod param_utils;
pub mod performance;
pub mod risk;
pub mod schedule;
pub mod signals;
pub mod sweep;

pub use allocator::Allocator;
pub use config::SimulationConfig;
pub use engine::SimulationDriver;
pub use error::{ConfigError, ConfigResult};
pub use execution::{FillSimulator, OrderExecutor};
pub use market_data::{InMemoryMarketData, MarketDataSource};
pub use models::{BacktestResult, PortfolioState, TargetWeights};
pub use performance::PerformanceCalculator;
pub use risk::RiskValidator;
pub use signals::{PrecomputedSignals, SignalGenerator};
