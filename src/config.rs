pub use config::Config;
pub use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::error::Error;

use crate::error::UpdateError;
use crate::types::{KeyspaceConfiguration, SchemaType, DEFAULT_NONSTANDARD_ADDRESS};

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

pub fn init_global_config(path: &str) -> Result<(), Box<dyn Error>> {
    let config = Config::builder()
        .add_source(config::File::with_name(path))
        .build()?;
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| "Config already set")?;
    Ok(())
}

pub fn get_global_config() -> &'static Config {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        eprintln!("FATAL: Config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

/// Load config for standalone binaries/utilities
pub fn load_config(path: &str) -> Result<Config, Box<dyn Error>> {
    Config::builder()
        .add_source(config::File::with_name(path))
        .build()
        .map_err(|e| Box::new(e) as Box<dyn Error>)
}

fn default_batch_size() -> i64 {
    10
}
fn default_safety_margin() -> i64 {
    10
}
fn default_write_batch_size() -> usize {
    2500
}
fn default_address_bucket_size() -> i32 {
    25_000
}
fn default_tx_bucket_size() -> i32 {
    25_000
}
fn default_block_bucket_size() -> i32 {
    100_000
}
fn default_relation_secondary_bucket_size() -> i32 {
    1
}
fn default_address_prefix_length() -> usize {
    5
}
fn default_tx_prefix_length() -> usize {
    5
}
fn default_fiat_currencies() -> Vec<String> {
    vec!["USD".to_string(), "EUR".to_string()]
}
fn default_nonstandard() -> String {
    DEFAULT_NONSTANDARD_ADDRESS.to_string()
}
fn default_validation_sample_size() -> usize {
    50
}
fn default_validation_interval() -> u64 {
    100
}

/// Per-currency settings under `environments.<env>.currencies.<name>`.
#[derive(Debug, Clone, Deserialize)]
pub struct CurrencyConfig {
    pub schema_type: SchemaType,
    pub raw_path: String,
    pub transformed_path: String,
    /// Directory for the advisory lock file; defaults to the transformed
    /// path's parent.
    pub lock_dir: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    /// Blocks below the raw tip considered not yet final.
    #[serde(default = "default_safety_margin")]
    pub safety_margin: i64,
    #[serde(default = "default_write_batch_size")]
    pub write_batch_size: usize,
    #[serde(default)]
    pub forward_fill_rates: bool,
    #[serde(default = "default_address_bucket_size")]
    pub address_bucket_size: i32,
    #[serde(default = "default_tx_bucket_size")]
    pub tx_bucket_size: i32,
    #[serde(default = "default_block_bucket_size")]
    pub block_bucket_size: i32,
    #[serde(default = "default_relation_secondary_bucket_size")]
    pub relation_secondary_bucket_size: i32,
    #[serde(default = "default_address_prefix_length")]
    pub address_prefix_length: usize,
    #[serde(default = "default_tx_prefix_length")]
    pub tx_prefix_length: usize,
    #[serde(default = "default_fiat_currencies")]
    pub fiat_currencies: Vec<String>,
    /// 8 for satoshi ledgers, 18 for wei ledgers.
    pub decimals: u32,
    #[serde(default = "default_nonstandard")]
    pub nonstandard_address: String,
    /// Tolerate a missing history table on keyspaces transformed before
    /// history was recorded.
    #[serde(default)]
    pub allow_missing_history: bool,
    #[serde(default = "default_validation_sample_size")]
    pub validation_sample_size: usize,
    /// Run the validator every N committed batches. 0 disables it.
    #[serde(default = "default_validation_interval")]
    pub validation_interval: u64,
}

impl CurrencyConfig {
    pub fn load(config: &Config, env: &str, currency: &str) -> Result<Self, UpdateError> {
        config
            .get::<CurrencyConfig>(&format!("environments.{}.currencies.{}", env, currency))
            .map_err(|e| UpdateError::Config {
                detail: format!("currency {} in env {}: {}", currency, env, e),
            })
    }

    /// Currencies listed for an environment, in file order.
    pub fn list_currencies(config: &Config, env: &str) -> Result<Vec<String>, UpdateError> {
        let table = config
            .get_table(&format!("environments.{}.currencies", env))
            .map_err(|e| UpdateError::Config {
                detail: format!("env {}: {}", env, e),
            })?;
        let mut names: Vec<String> = table.into_keys().collect();
        names.sort();
        Ok(names)
    }

    /// Seed a fresh keyspace's configuration row from this config.
    pub fn keyspace_configuration(&self) -> KeyspaceConfiguration {
        KeyspaceConfiguration {
            schema_type: self.schema_type,
            address_bucket_size: self.address_bucket_size,
            tx_bucket_size: self.tx_bucket_size,
            block_bucket_size: self.block_bucket_size,
            relation_secondary_bucket_size: self.relation_secondary_bucket_size,
            address_prefix_length: self.address_prefix_length,
            tx_prefix_length: self.tx_prefix_length,
            fiat_currencies: self.fiat_currencies.clone(),
            decimals: self.decimals,
        }
    }

    pub fn lock_path(&self, currency: &str) -> std::path::PathBuf {
        let dir = self
            .lock_dir
            .clone()
            .unwrap_or_else(|| self.transformed_path.clone());
        std::path::Path::new(&dir).join(format!("{}.updater.lock", currency))
    }
}
