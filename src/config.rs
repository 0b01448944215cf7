// src/config.rs
use crate::domain::errors::{AppError, AppResult};
use crate::trading::strategies::StrategyKind;
use chrono::NaiveTime;
use dotenv::dotenv;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Trading bot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Exchange API credentials
    pub exchange: ExchangeConfig,

    /// Call spacing and retry policy
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Trading loop configuration
    pub trading: TradingConfig,

    /// Per-instrument settings, keyed by symbol
    pub instruments: HashMap<String, InstrumentConfig>,

    /// Risk management configuration
    #[serde(default)]
    pub risk: RiskConfig,

    /// Position lifecycle configuration
    #[serde(default)]
    pub positions: PositionConfig,

    #[serde(default)]
    pub recorder: RecorderConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Exchange API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// API key
    pub api_key: String,

    /// API secret
    pub api_secret: String,

    /// Use testnet
    pub testnet: bool,

    /// Fabricate order responses locally instead of sending them
    pub simulation: bool,

    /// Balance reported by the simulated wallet
    #[serde(default = "default_paper_balance")]
    pub paper_balance: Decimal,

    /// Bybit recv_window in milliseconds
    #[serde(default = "default_recv_window")]
    pub recv_window_ms: u64,
}

fn default_paper_balance() -> Decimal {
    dec!(1000)
}

fn default_recv_window() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Minimum time between two physical exchange calls
    pub min_call_spacing_ms: u64,

    /// Attempts per call, including the first one
    pub max_retries: u32,

    /// Delay between attempts; doubled after a rate-limit rejection
    pub retry_delay_ms: u64,
}

impl GatewayConfig {
    pub fn min_call_spacing(&self) -> Duration {
        Duration::from_millis(self.min_call_spacing_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            min_call_spacing_ms: 1000,
            max_retries: 3,
            retry_delay_ms: 5000,
        }
    }
}

/// Trading configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Instruments processed every cycle, in order (e.g., ["BTCUSDT", "ETHUSDT"])
    pub symbols: Vec<String>,

    /// Kline interval in Bybit notation ("1", "5", "15", "60", "D")
    pub interval: String,

    /// Number of candles fetched per cycle
    pub kline_limit: u32,

    /// Sleep between the end of one cycle and the start of the next
    pub cycle_interval_secs: u64,

    /// Signal source used for every instrument
    pub strategy: StrategyKind,

    /// Coin used for balance queries
    pub quote_coin: String,

    /// Below this balance no new positions are opened
    pub min_balance: Decimal,

    /// Run order reconciliation every N cycles
    pub reconcile_every: u64,

    /// Periodic reporter interval
    pub report_interval_secs: u64,
}

impl TradingConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}

/// Exchange contract parameters and sizing for one instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub lot_size: Decimal,
    pub tick_size: Decimal,
    pub min_position: Decimal,
    pub max_position: Decimal,
    pub leverage: Decimal,
    /// Order size used by the built-in signal sources
    pub default_size: Decimal,
    /// Stop distance as a fraction of entry, e.g. 0.025
    pub stop_loss_pct: Decimal,
    /// Target distance as a fraction of entry, e.g. 0.05
    pub take_profit_pct: Decimal,
}

/// Daily trading window in local time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub maintenance_start: NaiveTime,
    pub maintenance_end: NaiveTime,
}

impl TradingHours {
    /// Windows whose end precedes their start wrap around midnight.
    pub fn is_trading_time(&self, now: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= now && now <= self.end
        } else {
            now >= self.start || now <= self.end
        }
    }

    pub fn is_maintenance(&self, now: NaiveTime) -> bool {
        self.maintenance_start <= now && now <= self.maintenance_end
    }
}

impl Default for TradingHours {
    fn default() -> Self {
        let hm = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN);
        Self {
            start: hm(0, 0),
            end: hm(23, 59),
            maintenance_start: hm(8, 0),
            maintenance_end: hm(8, 15),
        }
    }
}

/// Risk management configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Realized daily loss (quote currency) at which new openings stop
    pub max_daily_loss: Decimal,

    /// Realized daily loss that trips the emergency stop
    pub emergency_daily_loss: Decimal,

    /// Maximum number of closed trades per day
    pub max_daily_trades: u32,

    /// Maximum number of open positions
    pub max_open_positions: usize,

    /// Minimum reward:risk ratio
    pub min_risk_reward: Decimal,

    /// Drawdown from peak balance (fraction) that trips the emergency stop
    pub drawdown_limit: Decimal,

    /// Losing trades without a single win that trip the emergency stop
    pub max_consecutive_losses: u32,

    pub max_leverage: Decimal,

    /// Fraction of balance put at risk between entry and stop
    pub risk_per_trade: Decimal,

    /// Cap on entry notional (size * price) in quote currency
    pub max_position_value: Decimal,

    #[serde(default)]
    pub trading_hours: TradingHours,

    /// Persist risk counters and the emergency flag across restarts
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_loss: dec!(50),
            emergency_daily_loss: dec!(100),
            max_daily_trades: 32,
            max_open_positions: 4,
            min_risk_reward: dec!(1.5),
            drawdown_limit: dec!(0.15),
            max_consecutive_losses: 5,
            max_leverage: dec!(5),
            risk_per_trade: dec!(0.005),
            max_position_value: dec!(1000),
            trading_hours: TradingHours::default(),
            state_path: None,
        }
    }
}

/// Position lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionConfig {
    /// Trailing distance = multiplier * ATR
    pub trailing_atr_multiplier: Decimal,

    /// Trailing distance as a fraction of price when ATR is unavailable
    pub trailing_fallback_pct: Decimal,

    pub atr_period: usize,

    /// Positions older than this are closed
    pub max_hold_secs: i64,

    /// Adverse move in percent of entry that forces a close
    pub max_loss_pct: Decimal,

    /// Taker fee charged on entry and exit notional
    pub fee_rate: Decimal,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            trailing_atr_multiplier: dec!(2.0),
            trailing_fallback_pct: dec!(0.02),
            atr_period: 14,
            max_hold_secs: 24 * 3600,
            max_loss_pct: dec!(10),
            fee_rate: dec!(0.00055),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Performance JSON written on flush
    pub path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "warn", "error")
    pub level: String,

    /// Log to file
    pub to_file: bool,

    /// Log file path
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            to_file: false,
            file_path: None,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load from `CONFIG_PATH` if set, otherwise from the environment.
    pub fn load() -> AppResult<Self> {
        dotenv().ok();

        let mut config = match env::var("CONFIG_PATH") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::from_env()?,
        };

        if let Ok(key) = env::var("BYBIT_API_KEY") {
            config.exchange.api_key = key;
        }
        if let Ok(secret) = env::var("BYBIT_API_SECRET") {
            config.exchange.api_secret = secret;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> AppResult<Self> {
        // Load .env file if it exists
        dotenv().ok();

        let defaults = Config::default();

        let exchange = ExchangeConfig {
            api_key: env::var("BYBIT_API_KEY").unwrap_or_default(),
            api_secret: env::var("BYBIT_API_SECRET").unwrap_or_default(),
            testnet: env_or("BYBIT_TESTNET", true),
            simulation: env_or("SIMULATION", true),
            paper_balance: env_or("PAPER_BALANCE", defaults.exchange.paper_balance),
            recv_window_ms: env_or("RECV_WINDOW", defaults.exchange.recv_window_ms),
        };

        let symbols: Vec<String> = env::var("TRADING_SYMBOLS")
            .map(|s| {
                s.split(',')
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_else(|_| defaults.trading.symbols.clone());

        let strategy = match env::var("STRATEGY") {
            Ok(name) => name.parse::<StrategyKind>().map_err(AppError::Config)?,
            Err(_) => defaults.trading.strategy,
        };

        let trading = TradingConfig {
            symbols,
            interval: env::var("TRADING_INTERVAL").unwrap_or(defaults.trading.interval),
            kline_limit: env_or("KLINE_LIMIT", defaults.trading.kline_limit),
            cycle_interval_secs: env_or("CYCLE_INTERVAL", defaults.trading.cycle_interval_secs),
            strategy,
            quote_coin: env::var("QUOTE_COIN").unwrap_or(defaults.trading.quote_coin),
            min_balance: env_or("MIN_BALANCE", defaults.trading.min_balance),
            reconcile_every: env_or("RECONCILE_EVERY", defaults.trading.reconcile_every),
            report_interval_secs: env_or("REPORT_INTERVAL", defaults.trading.report_interval_secs),
        };

        let risk = RiskConfig {
            max_daily_loss: env_or("MAX_DAILY_LOSS", defaults.risk.max_daily_loss),
            emergency_daily_loss: env_or("EMERGENCY_DAILY_LOSS", defaults.risk.emergency_daily_loss),
            max_daily_trades: env_or("MAX_DAILY_TRADES", defaults.risk.max_daily_trades),
            max_open_positions: env_or("MAX_OPEN_POSITIONS", defaults.risk.max_open_positions),
            min_risk_reward: env_or("MIN_RISK_REWARD", defaults.risk.min_risk_reward),
            drawdown_limit: env_or("DRAWDOWN_LIMIT", defaults.risk.drawdown_limit),
            risk_per_trade: env_or("RISK_PER_TRADE", defaults.risk.risk_per_trade),
            state_path: env::var("RISK_STATE_PATH").ok().map(PathBuf::from),
            ..defaults.risk
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            to_file: env_or("LOG_TO_FILE", false),
            file_path: env::var("LOG_FILE_PATH").ok(),
        };

        let recorder = RecorderConfig {
            path: env::var("PERFORMANCE_PATH").ok().map(PathBuf::from),
        };

        Ok(Config {
            exchange,
            trading,
            risk,
            logging,
            recorder,
            ..defaults
        })
    }

    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let mut file = File::open(path)
            .map_err(|e| AppError::Config(format!("Failed to open config file: {}", e)))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = serde_json::from_str(&contents)
            .map_err(|e| AppError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| AppError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents)
            .map_err(|e| AppError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    pub fn instrument(&self, symbol: &str) -> Option<&InstrumentConfig> {
        self.instruments.get(symbol)
    }

    pub fn validate(&self) -> AppResult<()> {
        let mut errors = Vec::new();

        if !self.exchange.simulation
            && (self.exchange.api_key.is_empty() || self.exchange.api_secret.is_empty())
        {
            errors.push("API keys not configured".to_string());
        }
        if self.trading.symbols.is_empty() {
            errors.push("No trading symbols configured".to_string());
        }
        if self.risk.risk_per_trade < Decimal::ZERO || self.risk.risk_per_trade >= Decimal::ONE {
            errors.push("risk_per_trade must be in [0, 1)".to_string());
        }
        if self.trading.cycle_interval_secs < 5 {
            errors.push("Cycle interval too short (minimum 5 seconds)".to_string());
        }
        for symbol in &self.trading.symbols {
            match self.instruments.get(symbol) {
                None => errors.push(format!("No instrument configuration for {}", symbol)),
                Some(inst) => {
                    if inst.lot_size <= Decimal::ZERO || inst.tick_size <= Decimal::ZERO {
                        errors.push(format!("Lot and tick size must be positive for {}", symbol));
                    }
                    if inst.leverage > self.risk.max_leverage {
                        errors.push(format!("Leverage for {} exceeds maximum allowed", symbol));
                    }
                    if inst.min_position > inst.max_position {
                        errors.push(format!("min_position above max_position for {}", symbol));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::Config(errors.join("; ")))
        }
    }

    /// Initialize logging based on configuration
    pub fn init_logging(&self) -> AppResult<()> {
        let mut builder = env_logger::Builder::new();

        // Set log level
        let log_level = match self.logging.level.to_lowercase().as_str() {
            "trace" => log::LevelFilter::Trace,
            "debug" => log::LevelFilter::Debug,
            "info" => log::LevelFilter::Info,
            "warn" => log::LevelFilter::Warn,
            "error" => log::LevelFilter::Error,
            _ => log::LevelFilter::Info,
        };

        builder.filter_level(log_level);

        // Configure output
        if self.logging.to_file {
            if let Some(file_path) = &self.logging.file_path {
                let file = File::create(file_path)
                    .map_err(|e| AppError::Config(format!("Failed to create log file: {}", e)))?;

                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
        }

        // Initialize the logger
        builder.init();

        Ok(())
    }
}

fn default_instruments() -> HashMap<String, InstrumentConfig> {
    let mut instruments = HashMap::new();
    instruments.insert(
        "BTCUSDT".to_string(),
        InstrumentConfig {
            lot_size: dec!(0.0001),
            tick_size: dec!(0.01),
            min_position: dec!(0.0001),
            max_position: dec!(1.0),
            leverage: dec!(2),
            default_size: dec!(0.001),
            stop_loss_pct: dec!(0.02),
            take_profit_pct: dec!(0.04),
        },
    );
    instruments.insert(
        "ETHUSDT".to_string(),
        InstrumentConfig {
            lot_size: dec!(0.001),
            tick_size: dec!(0.01),
            min_position: dec!(0.001),
            max_position: dec!(5.0),
            leverage: dec!(5),
            default_size: dec!(0.01),
            stop_loss_pct: dec!(0.025),
            take_profit_pct: dec!(0.05),
        },
    );
    instruments.insert(
        "SOLUSDT".to_string(),
        InstrumentConfig {
            lot_size: dec!(0.01),
            tick_size: dec!(0.001),
            min_position: dec!(0.01),
            max_position: dec!(10.0),
            leverage: dec!(5),
            default_size: dec!(0.1),
            stop_loss_pct: dec!(0.03),
            take_profit_pct: dec!(0.06),
        },
    );
    instruments
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig {
                api_key: "".to_string(),
                api_secret: "".to_string(),
                testnet: true,
                simulation: true,
                paper_balance: default_paper_balance(),
                recv_window_ms: default_recv_window(),
            },
            gateway: GatewayConfig::default(),
            trading: TradingConfig {
                symbols: vec![
                    "BTCUSDT".to_string(),
                    "ETHUSDT".to_string(),
                    "SOLUSDT".to_string(),
                ],
                interval: "5".to_string(),
                kline_limit: 200,
                cycle_interval_secs: 60,
                strategy: StrategyKind::TrendFollowing,
                quote_coin: "USDT".to_string(),
                min_balance: dec!(10),
                reconcile_every: 5,
                report_interval_secs: 6 * 3600,
            },
            instruments: default_instruments(),
            risk: RiskConfig::default(),
            positions: PositionConfig::default(),
            recorder: RecorderConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_instrument_and_short_cycle() {
        let mut config = Config::default();
        config.trading.symbols.push("XRPUSDT".to_string());
        config.trading.cycle_interval_secs = 1;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("XRPUSDT"));
        assert!(err.contains("Cycle interval"));
    }

    #[test]
    fn test_live_mode_requires_keys() {
        let mut config = Config::default();
        config.exchange.simulation = false;
        assert!(config.validate().is_err());

        config.exchange.api_key = "key".to_string();
        config.exchange.api_secret = "secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_trading_hours_wrap_midnight() {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        let hours = TradingHours {
            start: t(22, 0),
            end: t(6, 0),
            ..TradingHours::default()
        };
        assert!(hours.is_trading_time(t(23, 30)));
        assert!(hours.is_trading_time(t(5, 0)));
        assert!(!hours.is_trading_time(t(12, 0)));
        assert!(TradingHours::default().is_maintenance(t(8, 5)));
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.trading.symbols, config.trading.symbols);
        assert_eq!(parsed.risk.min_risk_reward, config.risk.min_risk_reward);
    }
}
