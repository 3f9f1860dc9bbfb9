//! Configuration management for FudTrader
//!
//! Loads from YAML files + environment variables via .env

use anyhow::{bail, Context, Result};
use chrono::Duration;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    #[serde(default)]
    pub pairs: Vec<TradingPairConfig>,
    pub market: MarketConfig,
    pub exchange: ExchangeConfig,
    pub activity: ActivityConfig,
    pub advisory: AdvisoryConfig,
    pub exit: ExitConfig,
    pub fud: FudConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
    pub dashboard: DashboardConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Bot version tag for logging
    pub tag: String,
    /// Seconds between two cycles of a symbol loop
    pub poll_interval_secs: u64,
    /// Dry run mode (orders are logged, not sent)
    pub dry_run: bool,
}

/// One traded symbol and the community it is tied to
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TradingPairConfig {
    /// Exchange symbol, e.g. "DOGEUSDT"
    pub symbol: String,
    /// Community id used by the activity and advisory services
    pub community_id: String,
    pub leverage: u32,
    /// Order quantity in base units
    pub quantity: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketConfig {
    /// Market leader whose Ichimoku signal is the first layer
    pub btc_symbol: String,
    pub btc_interval: String,
    pub btc_candles: usize,
    pub coin_interval: String,
    pub coin_candles: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    pub base_url: String,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
    /// Env var holding the API key
    pub api_key_env: String,
    /// Env var holding the HMAC secret
    pub secret_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActivityConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// How far back activity series reach
    pub lookback_hours: i64,
    /// Bucket size requested from the service ("hour")
    pub period: String,
    /// Messages fed to the close analysis
    pub recent_messages: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdvisoryConfig {
    /// Sentiment / FUD-alert API base
    pub base_url: String,
    /// Env var holding the advisory API key
    pub api_key_env: String,
    /// Messages endpoint used for order validation and close recommendations
    pub messages_url: String,
    /// Env var holding the messages API key
    pub messages_api_key_env: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    /// Cached sentiment / FUD results younger than this are reused
    pub cache_ttl_secs: i64,
    /// Immediate retries after a transient fetch failure
    pub retries: usize,
    pub order_validation_enabled: bool,
    /// How long a rejected decision stays blocked
    pub rejection_cooldown_secs: i64,
    /// Run the AI close analysis every N snapshots
    pub close_analysis_every: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExitConfig {
    /// Snapshots needed before the moving-average exit activates
    pub ma_min_snapshots: usize,
    /// Close when current P/L falls under this fraction of the average
    pub ma_threshold_ratio: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FudConfig {
    /// An attack counts as fresh when its last message is this recent
    pub fresh_window_secs: i64,
    /// Override mode may end once the last attack is older than this
    pub exit_after_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Directory for CSV audit logs and the position state file
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of compact text
    pub json: bool,
    /// Filter used when RUST_LOG is not set
    pub filter: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl AdvisoryConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::seconds(self.cache_ttl_secs)
    }

    pub fn rejection_cooldown(&self) -> Duration {
        Duration::seconds(self.rejection_cooldown_secs)
    }
}

impl FudConfig {
    pub fn fresh_window(&self) -> Duration {
        Duration::seconds(self.fresh_window_secs)
    }

    pub fn exit_after(&self) -> Duration {
        Duration::seconds(self.exit_after_secs)
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self> {
        // Load .env file if exists
        dotenvy::dotenv().ok();

        let config = Self::builder_with_defaults()?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (FUDTRADER_*)
            .add_source(Environment::with_prefix("FUDTRADER").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// Built-in defaults only, no files or environment
    pub fn defaults() -> Result<Self> {
        Self::builder_with_defaults()?
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>> {
        let builder = Config::builder()
            // Bot defaults
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("bot.poll_interval_secs", 60)?
            .set_default("bot.dry_run", true)?
            // Market data defaults
            .set_default("market.btc_symbol", "BTCUSDT")?
            .set_default("market.btc_interval", "4h")?
            .set_default("market.btc_candles", 200)?
            .set_default("market.coin_interval", "1h")?
            .set_default("market.coin_candles", 350)?
            // Exchange defaults
            .set_default("exchange.base_url", "https://fapi.asterdex.com")?
            .set_default("exchange.timeout_ms", 10_000)?
            .set_default("exchange.api_key_env", "ASTERDEX_API_KEY")?
            .set_default("exchange.secret_key_env", "ASTERDEX_SECRET_KEY")?
            // Activity service defaults
            .set_default("activity.base_url", "http://localhost:8080")?
            .set_default("activity.timeout_secs", 30)?
            .set_default("activity.lookback_hours", 168)?
            .set_default("activity.period", "hour")?
            .set_default("activity.recent_messages", 50)?
            // Advisory defaults
            .set_default("advisory.base_url", "http://localhost:8081/api/external")?
            .set_default("advisory.api_key_env", "ADVISORY_API_KEY")?
            .set_default("advisory.messages_url", "https://api.anthropic.com/v1/messages")?
            .set_default("advisory.messages_api_key_env", "MESSAGES_API_KEY")?
            .set_default("advisory.model", "claude-sonnet-4-5")?
            .set_default("advisory.max_tokens", 4096)?
            .set_default("advisory.timeout_secs", 120)?
            .set_default("advisory.cache_ttl_secs", 20 * 60)?
            .set_default("advisory.retries", 1)?
            .set_default("advisory.order_validation_enabled", true)?
            .set_default("advisory.rejection_cooldown_secs", 10 * 60)?
            .set_default("advisory.close_analysis_every", 10)?
            // Exit defaults
            .set_default("exit.ma_min_snapshots", 10)?
            .set_default("exit.ma_threshold_ratio", 0.7)?
            // FUD override defaults
            .set_default("fud.fresh_window_secs", 60 * 60)?
            .set_default("fud.exit_after_secs", 12 * 60 * 60)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            // Logging defaults
            .set_default("logging.json", false)?
            .set_default("logging.filter", "fudtrader=info,warn")?
            // Dashboard defaults
            .set_default("dashboard.enabled", false)?
            .set_default("dashboard.port", 3000)?;
        Ok(builder)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pairs.is_empty() {
            bail!("No trading pairs configured (pairs is empty)");
        }
        for pair in &self.pairs {
            if pair.symbol.trim().is_empty() || pair.community_id.trim().is_empty() {
                bail!("Trading pair entries need both symbol and community_id");
            }
            if pair.leverage == 0 {
                bail!("Leverage for {} must be positive", pair.symbol);
            }
            if pair.quantity <= 0.0 {
                bail!("Quantity for {} must be positive", pair.symbol);
            }
        }
        if !(self.exit.ma_threshold_ratio > 0.0 && self.exit.ma_threshold_ratio <= 1.0) {
            bail!("exit.ma_threshold_ratio must be in (0, 1]");
        }
        if self.advisory.close_analysis_every == 0 {
            bail!("advisory.close_analysis_every must be at least 1");
        }
        if self.bot.poll_interval_secs == 0 {
            bail!("bot.poll_interval_secs must be at least 1");
        }
        Ok(())
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        let symbols: Vec<&str> = self.pairs.iter().map(|p| p.symbol.as_str()).collect();
        format!(
            "bot={} pairs={:?} poll={}s dry_run={} btc={}@{} coin@{} ai_gate={}",
            self.bot.tag,
            symbols,
            self.bot.poll_interval_secs,
            self.bot.dry_run,
            self.market.btc_symbol,
            self.market.btc_interval,
            self.market.coin_interval,
            self.advisory.order_validation_enabled
        )
    }

    /// Validate required environment variables
    pub fn validate_env(&self) -> Result<()> {
        if self.bot.dry_run {
            return Ok(());
        }

        let required = [
            self.exchange.api_key_env.as_str(),
            self.exchange.secret_key_env.as_str(),
        ];
        for var in required {
            if std::env::var(var).is_err() {
                bail!("Required environment variable {} is not set", var);
            }
        }

        Ok(())
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pair() -> TradingPairConfig {
        TradingPairConfig {
            symbol: "DOGEUSDT".to_string(),
            community_id: "1493446837214187523".to_string(),
            leverage: 5,
            quantity: 100.0,
        }
    }

    #[test]
    fn defaults_match_engine_constants() {
        let cfg = AppConfig::defaults().unwrap();
        assert_eq!(cfg.bot.poll_interval_secs, 60);
        assert_eq!(cfg.market.btc_candles, 200);
        assert_eq!(cfg.market.coin_candles, 350);
        assert_eq!(cfg.advisory.cache_ttl(), Duration::minutes(20));
        assert_eq!(cfg.advisory.rejection_cooldown(), Duration::minutes(10));
        assert_eq!(cfg.advisory.close_analysis_every, 10);
        assert_eq!(cfg.exit.ma_min_snapshots, 10);
        assert!((cfg.exit.ma_threshold_ratio - 0.7).abs() < 1e-9);
        assert_eq!(cfg.fud.fresh_window(), Duration::hours(1));
        assert_eq!(cfg.fud.exit_after(), Duration::hours(12));
        assert!(cfg.pairs.is_empty());
    }

    #[test]
    fn validate_requires_pairs() {
        let mut cfg = AppConfig::defaults().unwrap();
        assert!(cfg.validate().is_err());

        cfg.pairs.push(sample_pair());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_pair_values() {
        let mut cfg = AppConfig::defaults().unwrap();
        let mut pair = sample_pair();
        pair.leverage = 0;
        cfg.pairs.push(pair);
        assert!(cfg.validate().is_err());

        cfg.pairs[0].leverage = 3;
        cfg.pairs[0].quantity = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_ratio() {
        let mut cfg = AppConfig::defaults().unwrap();
        cfg.pairs.push(sample_pair());
        cfg.exit.ma_threshold_ratio = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn digest_lists_symbols_without_secrets() {
        let mut cfg = AppConfig::defaults().unwrap();
        cfg.pairs.push(sample_pair());
        let digest = cfg.digest();
        assert!(digest.contains("DOGEUSDT"));
        assert!(!digest.contains("ASTERDEX_SECRET_KEY"));
    }
}
