//! Layered application configuration: a YAML file, overridden by `ENRICH_`-
//! prefixed environment variables, with `DATABASE_URL` privileged over
//! `database.url` — the same precedence order and `deny_unknown_fields`
//! boundary the control-plane config loader uses.

use std::time::Duration;

use clap::Parser;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "ENRICH_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "postgres://localhost/enrichd".to_string(), max_connections: 10 }
    }
}

/// Rate-limit settings for one rate-limited stage (§4.6).
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Sustained requests per second.
    pub rate_per_sec: f64,
    /// Burst capacity above the sustained rate.
    pub burst: u32,
    /// Maximum number of in-flight requests for this stage.
    pub concurrency: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MerchantEnv {
    Production,
    Sandbox,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MerchantSearchConfig {
    pub env: MerchantEnv,
    pub consumer_key: String,
    pub client_id: Option<String>,
    /// PEM-encoded RSA private key used for OAuth 1.0a RSA-SHA256 signing.
    pub private_key_pem: String,
    #[serde(with = "humantime_serde")]
    pub poll_initial: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_max: Duration,
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub hard_deadline: Duration,
    pub webhook_secret: String,
    pub rate: RateLimitConfig,
}

impl Default for MerchantSearchConfig {
    fn default() -> Self {
        Self {
            env: MerchantEnv::Sandbox,
            consumer_key: String::new(),
            client_id: None,
            private_key_pem: String::new(),
            poll_initial: Duration::from_secs(5),
            poll_max: Duration::from_secs(120),
            max_attempts: 40,
            hard_deadline: Duration::from_secs(45 * 60),
            webhook_secret: String::new(),
            rate: RateLimitConfig { rate_per_sec: 5.0, burst: 5, concurrency: 5 },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub rate: RateLimitConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self { base_url: String::new(), api_key: String::new(), rate: RateLimitConfig { rate_per_sec: 5.0, burst: 10, concurrency: 10 } }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { rate_per_sec: 5.0, burst: 10, concurrency: 10 }
    }
}

/// Root application configuration. `deny_unknown_fields` rejects typos at
/// load time rather than silently ignoring them.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database: DatabaseConfig,

    pub enable_classify: bool,
    pub enable_finexio: bool,
    pub enable_address: bool,
    pub enable_merchant: bool,

    pub classifier: ProviderConfig,
    pub address_validator: ProviderConfig,
    pub merchant_search: MerchantSearchConfig,
    pub supplier_cache: RateLimitConfig,

    /// Fuzzy-match scores in `[ai_enhance_threshold, 0.95)` are handed to the
    /// classifier for match adjudication (§4.2 step 6) rather than accepted
    /// or rejected outright.
    pub ai_enhance_threshold: f64,
    /// §4.4: when set, a low-granularity or ambiguous address-validator
    /// result is handed to the classifier for a single AI-assisted repair
    /// pass. Independent of `ai_enhance_threshold` — one gates FM/CG match
    /// adjudication, the other gates AV/CG address repair.
    pub enable_ai_address_repair: bool,
    /// Soft deadline for the progressive API to return partial results.
    pub progressive_budget_ms: u64,

    pub enable_otel_export: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            database: DatabaseConfig::default(),
            enable_classify: true,
            enable_finexio: true,
            enable_address: true,
            enable_merchant: true,
            classifier: ProviderConfig::default(),
            address_validator: ProviderConfig::default(),
            merchant_search: MerchantSearchConfig::default(),
            supplier_cache: RateLimitConfig { rate_per_sec: 50.0, burst: 100, concurrency: 50 },
            ai_enhance_threshold: 0.90,
            enable_ai_address_repair: false,
            progressive_budget_ms: 2_000,
            enable_otel_export: false,
        }
    }
}

impl Config {
    pub fn load(args: &Args) -> Result<Self> {
        let mut figment = Figment::from(figment::providers::Serialized::defaults(Config::default()))
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("ENRICH_").split("__"));

        if let Ok(database_url) = std::env::var("DATABASE_URL") {
            figment = figment.merge(("database.url", database_url));
        }

        figment.extract().map_err(|e| Error::InputError { message: format!("invalid configuration: {e}") })
    }
}
