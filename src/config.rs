use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";

/// Payment gateway settings.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PaymentConfig {
    /// Secret API key used for server-to-server gateway calls
    #[validate(length(min = 1))]
    pub secret_key: String,

    /// Shared secret used to sign webhook deliveries
    #[validate(length(min = 1))]
    pub webhook_secret: String,

    /// Maximum accepted age of a signed webhook timestamp
    #[serde(default = "default_webhook_tolerance_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub webhook_tolerance_secs: i64,

    #[serde(default = "default_payment_api_base")]
    pub api_base: String,

    /// Redirect target after a successful payment; `{CHECKOUT_SESSION_ID}` is
    /// substituted by the gateway.
    #[serde(default = "default_success_url")]
    pub success_url: String,

    #[serde(default = "default_cancel_url")]
    pub cancel_url: String,

    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub currency: String,

    /// Comma-separated ISO country codes accepted for shipping
    #[serde(default = "default_shipping_countries")]
    pub shipping_countries: String,
}

impl PaymentConfig {
    pub fn new(secret_key: impl Into<String>, webhook_secret: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            webhook_secret: webhook_secret.into(),
            webhook_tolerance_secs: default_webhook_tolerance_secs(),
            api_base: default_payment_api_base(),
            success_url: default_success_url(),
            cancel_url: default_cancel_url(),
            currency: default_currency(),
            shipping_countries: default_shipping_countries(),
        }
    }

    pub fn shipping_countries(&self) -> Vec<String> {
        self.shipping_countries
            .split(',')
            .map(|c| c.trim().to_uppercase())
            .filter(|c| !c.is_empty())
            .collect()
    }
}

/// Transactional email settings. Without an API key mail is only logged.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct EmailConfig {
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_email_api_base")]
    pub api_base: String,

    #[serde(default = "default_from_address")]
    #[validate(email)]
    pub from_address: String,

    #[serde(default = "default_store_name")]
    pub store_name: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: default_email_api_base(),
            from_address: default_from_address(),
            store_name: default_store_name(),
        }
    }
}

/// Business rules for the order lifecycle.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct OrderPolicyConfig {
    /// Hours after creation during which a customer may self-cancel
    #[serde(default = "default_cancellation_window_hours")]
    #[validate(range(min = 1, max = 720))]
    pub cancellation_window_hours: i64,

    /// Days a customer has to ship a requested return back
    #[serde(default = "default_return_window_days")]
    #[validate(range(min = 1, max = 365))]
    pub return_window_days: i64,

    /// How often the server sweeps overdue returns; 0 disables the task
    #[serde(default = "default_return_sweep_interval_secs")]
    pub return_sweep_interval_secs: u64,

    /// Allows the race-prone read-modify-write stock update as a last resort.
    /// Every use is logged at error level.
    #[serde(default)]
    pub stock_degraded_mode: bool,
}

impl Default for OrderPolicyConfig {
    fn default() -> Self {
        Self {
            cancellation_window_hours: default_cancellation_window_hours(),
            return_window_days: default_return_window_days(),
            return_sweep_interval_secs: default_return_sweep_interval_secs(),
            stock_degraded_mode: false,
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// JWT secret key used to verify bearer tokens
    #[validate(length(min = 32), custom = "validate_jwt_secret")]
    pub jwt_secret: String,

    #[serde(default = "default_jwt_issuer")]
    pub jwt_issuer: String,

    #[serde(default = "default_jwt_audience")]
    pub jwt_audience: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    #[validate]
    pub payment: PaymentConfig,

    #[serde(default)]
    #[validate]
    pub email: EmailConfig,

    #[serde(default)]
    #[validate]
    pub orders: OrderPolicyConfig,
}

impl AppConfig {
    /// Builds a configuration in code, used by tests and tooling.
    pub fn new(
        database_url: String,
        jwt_secret: String,
        payment: PaymentConfig,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            jwt_secret,
            jwt_issuer: default_jwt_issuer(),
            jwt_audience: default_jwt_audience(),
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            environment,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            payment,
            email: EmailConfig::default(),
            orders: OrderPolicyConfig::default(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect()
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_jwt_issuer() -> String {
    "storefront-auth".to_string()
}
fn default_jwt_audience() -> String {
    "storefront-api".to_string()
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_webhook_tolerance_secs() -> i64 {
    300
}
fn default_payment_api_base() -> String {
    "https://api.stripe.com".to_string()
}
fn default_success_url() -> String {
    "http://localhost:3000/checkout/success?session_id={CHECKOUT_SESSION_ID}".to_string()
}
fn default_cancel_url() -> String {
    "http://localhost:3000/cart".to_string()
}
fn default_currency() -> String {
    "eur".to_string()
}
fn default_shipping_countries() -> String {
    "ES,PT,FR".to_string()
}
fn default_email_api_base() -> String {
    "https://api.resend.com".to_string()
}
fn default_from_address() -> String {
    "orders@storefront.local".to_string()
}
fn default_store_name() -> String {
    "Storefront".to_string()
}
fn default_cancellation_window_hours() -> i64 {
    2
}
fn default_return_window_days() -> i64 {
    7
}
fn default_return_sweep_interval_secs() -> u64 {
    3600
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new("invalid_log_level")),
    }
}

fn validate_jwt_secret(secret: &str) -> Result<(), ValidationError> {
    let lowered = secret.to_lowercase();
    if ["secret", "changeme", "password"]
        .iter()
        .any(|weak| lowered.starts_with(weak))
    {
        return Err(ValidationError::new("weak_jwt_secret"));
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Initializes the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_api={},tower_http=debug", level);
    let filter = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter))
            .json()
            .try_init();
    } else {
        let _ = fmt().with_env_filter(EnvFilter::new(filter)).try_init();
    }
}

/// Loads configuration: defaults, then `config/default`, then
/// `config/<RUN_ENV>`, then `APP__*` environment variables.
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", run_env.clone())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    for required in ["jwt_secret", "payment.secret_key", "payment.webhook_secret"] {
        if config.get_string(required).is_err() {
            let env_name = format!("APP__{}", required.replace('.', "__").to_uppercase());
            error!("{} is not configured; set {}", required, env_name);
            return Err(AppConfigError::Load(ConfigError::NotFound(format!(
                "{required} is required; set {env_name}"
            ))));
        }
    }

    let app_config: AppConfig = config.try_deserialize()?;
    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".to_string(),
            "k3y_for_tests_that_is_long_enough_to_pass_validation".to_string(),
            PaymentConfig::new("sk_test_123", "whsec_test"),
            "test".to_string(),
        )
    }

    #[test]
    fn defaults_carry_business_windows() {
        let cfg = base_config();
        assert_eq!(cfg.orders.cancellation_window_hours, 2);
        assert_eq!(cfg.orders.return_window_days, 7);
        assert!(!cfg.orders.stock_degraded_mode);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn weak_jwt_secret_is_rejected() {
        let mut cfg = base_config();
        cfg.jwt_secret = "secret_secret_secret_secret_secret_secret".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let mut cfg = base_config();
        cfg.log_level = "loud".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn nested_policy_is_validated() {
        let mut cfg = base_config();
        cfg.orders.cancellation_window_hours = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn shipping_countries_are_normalised() {
        let mut payment = PaymentConfig::new("sk", "wh");
        payment.shipping_countries = " es, pt ,,fr".to_string();
        assert_eq!(payment.shipping_countries(), vec!["ES", "PT", "FR"]);
    }
}
