use crate::types::RiskLimits;

/// Runtime configuration, loaded from env. The controller re-reads this
/// between cycles so limit and weight changes apply without a restart; an
/// in-flight submission is never touched by a reload.
#[derive(Clone)]
pub struct Config {
    /// Comma-separated source ids, in priority order (first wins merge ties).
    pub sources: Vec<String>,
    /// Base URL per feed; source id is appended as a path segment.
    pub feed_base: String,
    pub feed_api_key: Option<String>,
    pub poll_interval_secs: u64,
    pub min_fresh_sources: usize,
    pub source_ttl_secs: u64,
    pub source_timeout_ms: u64,
    pub source_retries: u32,

    pub weight_statistical: f64,
    pub weight_tree: f64,
    pub weight_neural: f64,

    pub base_trade_size: f64,
    pub strategy_tag: String,

    pub max_position_size: f64,
    pub max_daily_loss: f64,
    pub max_drawdown: f64,
    pub min_confidence: f64,
    pub max_gas_price: f64,
    pub max_slippage: f64,

    pub gas_price: f64,
    pub gas_limit: u64,
    pub fee_bump_mult: f64,
    pub max_submit_attempts: u32,

    pub caller_address: String,
    pub contract_address: String,
    pub signing_secret: String,
    pub token_in: String,
    pub token_out: String,

    pub guard_cooldown_secs: u64,
    pub sqlite_path: String,
    pub heartbeat_secs: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            sources: env_str("SOURCES", "binance,kraken,coinbase")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            feed_base: env_str("FEED_BASE", "https://feeds.example.com/v1"),
            feed_api_key: std::env::var("FEED_API_KEY").ok(),
            poll_interval_secs: env_or("POLL_INTERVAL_SECS", 60),
            min_fresh_sources: env_or("MIN_FRESH_SOURCES", 2),
            source_ttl_secs: env_or("SOURCE_TTL_SECS", 30),
            source_timeout_ms: env_or("SOURCE_TIMEOUT_MS", 5_000),
            source_retries: env_or("SOURCE_RETRIES", 2),
            weight_statistical: env_or("WEIGHT_STATISTICAL", 1.0),
            weight_tree: env_or("WEIGHT_TREE", 1.0),
            weight_neural: env_or("WEIGHT_NEURAL", 0.5),
            base_trade_size: env_or("BASE_TRADE_SIZE", 100.0),
            strategy_tag: env_str("STRATEGY_TAG", "ensemble-v1"),
            max_position_size: env_or("MAX_POSITION_SIZE", 1_000.0),
            max_daily_loss: env_or("MAX_DAILY_LOSS", 500.0),
            max_drawdown: env_or("MAX_DRAWDOWN", 0.2),
            min_confidence: env_or("MIN_CONFIDENCE", 0.6),
            max_gas_price: env_or("MAX_GAS_PRICE", 150.0),
            max_slippage: env_or("MAX_SLIPPAGE", 0.01),
            gas_price: env_or("GAS_PRICE", 30.0),
            gas_limit: env_or("GAS_LIMIT", 350_000),
            fee_bump_mult: env_or("FEE_BUMP_MULT", 1.15),
            max_submit_attempts: env_or("MAX_SUBMIT_ATTEMPTS", 3),
            caller_address: env_str("CALLER_ADDRESS", "0xoracle"),
            contract_address: env_str("CONTRACT_ADDRESS", "0xguard"),
            signing_secret: env_str("SIGNING_SECRET", "dev-secret"),
            token_in: env_str("TOKEN_IN", "USDC"),
            token_out: env_str("TOKEN_OUT", "WETH"),
            guard_cooldown_secs: env_or("GUARD_COOLDOWN_SECS", 3_600),
            sqlite_path: env_str("SQLITE_PATH", "./oraclefx.sqlite"),
            heartbeat_secs: env_or("HEARTBEAT_SECS", 30),
        }
    }

    pub fn risk_limits(&self) -> RiskLimits {
        RiskLimits {
            max_position_size: self.max_position_size,
            max_daily_loss: self.max_daily_loss,
            max_drawdown: self.max_drawdown,
            min_confidence: self.min_confidence,
            max_gas_price: self.max_gas_price,
            max_slippage: self.max_slippage,
        }
    }
}

pub fn now_ts() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_limits_mirror_config() {
        let mut cfg = Config::from_env();
        cfg.min_confidence = 0.7;
        cfg.max_position_size = 250.0;
        let limits = cfg.risk_limits();
        assert_eq!(limits.min_confidence, 0.7);
        assert_eq!(limits.max_position_size, 250.0);
    }
}
