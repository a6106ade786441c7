use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub persist_interval: Duration,
    pub version: String,

    /// Allowed clock skew for envelope timestamps, seconds
    pub max_clock_skew: u64,
    /// Challenge nonce lifetime, seconds
    pub nonce_expiry: u64,
    /// GET /challenge calls allowed per IP per minute
    pub challenge_rate_limit: u32,

    /// Public keys auto-verified at first contact; bootstraps the trust web
    pub genesis_keys: Vec<String>,
    /// Minimum endorsement edges before baptism
    pub min_endorsements: usize,
    /// Minimum rank-decayed trust score before baptism
    pub trust_threshold: f64,

    /// Daily quotas, per device
    pub daily_oracle_calls: u64,
    pub daily_oracle_tokens: u64,
    pub daily_dreams: u64,
    pub daily_telegrams: u64,
    pub daily_postcards: u64,

    /// Random sampling draws from this many most-recent dreams
    pub feed_sample_window: usize,
    /// Telegrams older than this are garbage-collected, delivered or not
    pub telegram_expiry: Duration,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("PORT", 8080),
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            persist_interval: Duration::from_secs(env_parse("PERSIST_INTERVAL_SECS", 30)),
            version: env!("CARGO_PKG_VERSION").to_string(),

            max_clock_skew: env_parse("MAX_CLOCK_SKEW_SECS", 300),
            nonce_expiry: env_parse("NONCE_EXPIRY_SECS", 300),
            challenge_rate_limit: env_parse("CHALLENGE_RATE_LIMIT", 10),

            genesis_keys: env::var("GENESIS_KEYS")
                .map(|s| {
                    s.split(',')
                        .map(|k| k.trim().to_lowercase())
                        .filter(|k| !k.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            min_endorsements: env_parse("MIN_ENDORSEMENTS", 2),
            trust_threshold: env_parse("TRUST_THRESHOLD", 3.0),

            daily_oracle_calls: env_parse("DAILY_ORACLE_CALLS", 100),
            daily_oracle_tokens: env_parse("DAILY_ORACLE_TOKENS", 10_000),
            daily_dreams: env_parse("DAILY_DREAMS", 20),
            daily_telegrams: env_parse("DAILY_TELEGRAMS", 50),
            daily_postcards: env_parse("DAILY_POSTCARDS", 10),

            feed_sample_window: env_parse("FEED_SAMPLE_WINDOW", 100),
            telegram_expiry: Duration::from_secs(env_parse(
                "TELEGRAM_EXPIRY_SECS",
                7 * 24 * 3600,
            )),
        }
    }

    pub fn state_file_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn is_genesis_key(&self, public_key: &str) -> bool {
        self.genesis_keys.iter().any(|k| k == &public_key.to_lowercase())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
