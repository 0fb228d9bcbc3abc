use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::info;
use validator::Validate;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";

const DEV_DEFAULT_JWT_SECRET: &str =
    "this_is_a_development_secret_key_that_is_at_least_64_characters_long_for_testing";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Cache configuration (in-process TTL cache, see `crate::cache`)
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct CacheConfig {
    /// Default TTL for cached responses in seconds
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
    /// Interval for evicting expired entries
    #[serde(default = "default_cache_cleanup")]
    pub cleanup_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_cache_ttl(),
            cleanup_interval_secs: default_cache_cleanup(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_cleanup() -> u64 {
    60
}

/// M-Pesa (Daraja) gateway configuration
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct MpesaConfig {
    /// When true, payments are simulated without contacting Daraja
    #[serde(default = "default_true")]
    pub sandbox: bool,
    #[serde(default = "default_daraja_url")]
    pub base_url: String,
    #[serde(default)]
    pub consumer_key: String,
    #[serde(default)]
    pub consumer_secret: String,
    #[serde(default)]
    pub shortcode: String,
    #[serde(default)]
    pub passkey: String,
    #[serde(default)]
    pub callback_url: String,
    /// Fixed interval between gateway status polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Upper bound on status polls per attempt; the attempt times out after
    /// this many polls
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
}

impl Default for MpesaConfig {
    fn default() -> Self {
        Self {
            sandbox: true,
            base_url: default_daraja_url(),
            consumer_key: String::new(),
            consumer_secret: String::new(),
            shortcode: String::new(),
            passkey: String::new(),
            callback_url: String::new(),
            poll_interval_secs: default_poll_interval(),
            max_poll_attempts: default_max_poll_attempts(),
        }
    }
}

fn default_daraja_url() -> String {
    "https://sandbox.safaricom.co.ke".to_string()
}

fn default_poll_interval() -> u64 {
    3
}

fn default_max_poll_attempts() -> u32 {
    40
}

/// Card processor configuration
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct CardConfig {
    /// When true, charges are simulated without contacting the processor
    #[serde(default = "default_true")]
    pub sandbox: bool,
    #[serde(default = "default_card_url")]
    pub base_url: String,
    #[serde(default)]
    pub secret_key: String,
    /// Shared secret for verifying processor webhook signatures
    #[serde(default)]
    pub webhook_secret: String,
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            sandbox: true,
            base_url: default_card_url(),
            secret_key: String::new(),
            webhook_secret: String::new(),
        }
    }
}

fn default_card_url() -> String {
    "https://api.stripe.com".to_string()
}

fn default_true() -> bool {
    true
}

/// Application configuration
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Session token signing secret
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    /// Session token lifetime in seconds
    #[serde(default = "default_jwt_expiration")]
    pub jwt_expiration: i64,

    /// Server bind host
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment (development, test, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Create the schema from entities on startup (sqlite/dev convenience)
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated allowed origins; unset means permissive (dev)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Settlement currency (ISO 4217)
    #[serde(default = "default_currency")]
    pub currency: String,

    /// VAT rate applied to order subtotals (e.g. 0.16)
    #[serde(default = "default_tax_rate")]
    pub tax_rate: Decimal,

    /// Flat shipping fee, waived by FREE_SHIPPING coupons
    #[serde(default = "default_shipping_flat")]
    pub shipping_flat: Decimal,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub mpesa: MpesaConfig,

    #[serde(default)]
    pub card: CardConfig,
}

fn default_jwt_expiration() -> i64 {
    3600
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_currency() -> String {
    "KES".to_string()
}

fn default_tax_rate() -> Decimal {
    dec!(0.16)
}

fn default_shipping_flat() -> Decimal {
    dec!(500)
}

impl AppConfig {
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Minimal constructor for tests.
    pub fn for_tests(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            jwt_secret: DEV_DEFAULT_JWT_SECRET.to_string(),
            jwt_expiration: default_jwt_expiration(),
            host: "127.0.0.1".to_string(),
            port: 0,
            environment: "test".to_string(),
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: true,
            cors_allowed_origins: None,
            currency: default_currency(),
            tax_rate: default_tax_rate(),
            shipping_flat: default_shipping_flat(),
            cache: CacheConfig::default(),
            mpesa: MpesaConfig::default(),
            card: CardConfig::default(),
        }
    }
}

/// Loads configuration from `config/default.toml`, `config/{env}.toml` and
/// `APP__`-prefixed environment variables (later sources win).
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let mut builder = Config::builder()
        .set_default("database_url", "sqlite://dukani.db?mode=rwc")?
        .set_default("environment", run_env.clone())?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false));

    // jwt_secret must come from the environment or a config file in
    // production; development falls back to a fixed insecure value.
    if run_env != "production" {
        builder = builder.set_default("jwt_secret", DEV_DEFAULT_JWT_SECRET)?;
    }

    let config = builder
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;
    app_config
        .validate()
        .map_err(|e| AppConfigError::Validation(e.to_string()))?;

    if app_config.is_production() && app_config.jwt_secret == DEV_DEFAULT_JWT_SECRET {
        return Err(AppConfigError::Validation(
            "refusing to run in production with the development jwt_secret".to_string(),
        ));
    }

    Ok(app_config)
}

/// Initializes the tracing subscriber. `RUST_LOG` overrides the configured
/// level when set.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_directive = format!("dukani_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter =
        EnvFilter::try_new(filter_directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));

    if json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init();
    }
}
