use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use ledgerview::config::{get_global_config, init_global_config, CurrencyConfig};
use ledgerview::coordinator::{patch_exchange_rates, Coordinator, UpdateOptions};
use ledgerview::error::UpdateError;
use ledgerview::lock::UpdaterLock;
use ledgerview::metrics;
use ledgerview::raw_store::RawStore;
use ledgerview::schema::{open_raw, open_transformed};
use ledgerview::status::validate_history;
use ledgerview::telemetry::{init_tracing, TelemetryConfig};
use ledgerview::transformed_store::TransformedStore;
use ledgerview::validator::Validator;
use ledgerview::write_batcher::RetryPolicy;

#[derive(Parser, Debug)]
#[clap(name = "ledgerview")]
#[clap(about = "Delta updater for analytics keyspaces derived from raw ledger data", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[clap(long, default_value = "config.yaml")]
    config: String,

    /// Environment section of the config file to use
    #[clap(long, default_value = "dev")]
    env: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show sync status per currency
    Status {
        /// Limit to one currency
        #[clap(long)]
        currency: Option<String>,

        /// Emit machine-readable JSON instead of the one-line summary
        #[clap(long)]
        json: bool,
    },
    /// Advance the transformed keyspace by consuming new raw blocks
    Update {
        #[clap(long)]
        currency: String,

        /// Stop after this raw block (default: tip minus safety margin)
        #[clap(long)]
        end_block: Option<i64>,

        /// Override the configured write chunk size
        #[clap(long)]
        write_batch_size: Option<usize>,

        /// Bridge exchange-rate gaps with the most recent prior rate
        #[clap(long)]
        forward_fill_rates: bool,

        /// Treat validator divergences as fatal
        #[clap(long)]
        pedantic: bool,

        /// Initialize a fresh keyspace (writes the configuration row)
        #[clap(long)]
        create_schema: bool,
    },
    /// Check history monotonicity and sampled aggregate consistency
    Validate {
        #[clap(long)]
        currency: String,

        /// Number of addresses to re-derive and compare
        #[clap(long)]
        sample_size: Option<usize>,
    },
    /// Re-attach fiat vectors for an already-transformed block range
    PatchExchangeRates {
        #[clap(long)]
        currency: String,

        #[clap(long)]
        start_block: i64,

        #[clap(long)]
        end_block: i64,

        #[clap(long)]
        forward_fill_rates: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = init_tracing(TelemetryConfig::default()) {
        eprintln!("failed to initialize logging: {}", e);
        std::process::exit(1);
    }
    metrics::register_all();

    let cli = Cli::parse();
    let config_path = shellexpand::tilde(&cli.config).to_string();
    if let Err(e) = init_global_config(&config_path) {
        error!("failed to load config {}: {}", config_path, e);
        std::process::exit(1);
    }

    let code = match run(&cli).await {
        Ok(()) => 0,
        Err(e) => {
            match &e {
                UpdateError::LockHeld { path } => {
                    warn!("another updater is running (lock at {}), nothing to do", path)
                }
                UpdateError::Cancelled => warn!("cancelled, partial batch discarded"),
                _ => error!("{}", e),
            }
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: &Cli) -> Result<(), UpdateError> {
    let config = get_global_config();
    match &cli.command {
        Command::Status { currency, json } => {
            let currencies = match currency {
                Some(c) => vec![c.clone()],
                None => CurrencyConfig::list_currencies(config, &cli.env)?,
            };
            for name in currencies {
                let cfg = CurrencyConfig::load(config, &cli.env, &name)?;
                let store = open_store(&name, &cfg, None)?;
                print_status(&name, &cfg, &store, *json)?;
            }
            Ok(())
        }
        Command::Update {
            currency,
            end_block,
            write_batch_size,
            forward_fill_rates,
            pedantic,
            create_schema,
        } => {
            let cfg = CurrencyConfig::load(config, &cli.env, currency)?;
            let _lock = UpdaterLock::acquire(&cfg.lock_path(currency))?;

            let store = open_store(currency, &cfg, *write_batch_size)?;
            if *create_schema && store.get_configuration()?.is_none() {
                store.create_schema(&cfg.keyspace_configuration()).await?;
                info!(currency = %currency, "created transformed schema");
            }
            let raw = RawStore::new(
                open_raw(std::path::Path::new(&cfg.raw_path))?,
                cfg.schema_type,
            );

            let cancel = Arc::new(AtomicBool::new(false));
            spawn_cancel_listener(Arc::clone(&cancel));

            let options = UpdateOptions {
                end_block: *end_block,
                forward_fill_rates: *forward_fill_rates,
                pedantic: *pedantic,
            };
            let mut coordinator =
                Coordinator::new(currency.clone(), cfg, raw, store, options, cancel)?;
            let outcome = coordinator.run_update().await?;
            if outcome.batches == 0 {
                info!(currency = %currency, "already caught up, nothing to do");
            }
            Ok(())
        }
        Command::Validate {
            currency,
            sample_size,
        } => {
            let cfg = CurrencyConfig::load(config, &cli.env, currency)?;
            let store = open_store(currency, &cfg, None)?;
            let raw = RawStore::new(
                open_raw(std::path::Path::new(&cfg.raw_path))?,
                cfg.schema_type,
            );
            let kc = store.get_configuration()?.ok_or_else(|| UpdateError::Config {
                detail: format!("keyspace for {} has no configuration row", currency),
            })?;

            let history = validate_history(&store, cfg.allow_missing_history)?;
            info!(rows = history.len(), "history is consistent");

            let validator = Validator {
                raw: &raw,
                store: &store,
                kc: &kc,
                nonstandard_address: cfg.nonstandard_address.clone(),
                sample_size: sample_size.unwrap_or(cfg.validation_sample_size),
            };
            let report = validator.run()?;
            println!(
                "checked {} addresses, {} relations: {} divergences",
                report.checked_addresses,
                report.checked_relations,
                report.divergences.len()
            );
            match report.divergences.into_iter().next() {
                Some(d) => Err(d.into_error()),
                None => Ok(()),
            }
        }
        Command::PatchExchangeRates {
            currency,
            start_block,
            end_block,
            forward_fill_rates,
        } => {
            let cfg = CurrencyConfig::load(config, &cli.env, currency)?;
            let _lock = UpdaterLock::acquire(&cfg.lock_path(currency))?;
            let store = open_store(currency, &cfg, None)?;
            let raw = RawStore::new(
                open_raw(std::path::Path::new(&cfg.raw_path))?,
                cfg.schema_type,
            );
            let kc = store.get_configuration()?.ok_or_else(|| UpdateError::Config {
                detail: format!("keyspace for {} has no configuration row", currency),
            })?;
            let patched = patch_exchange_rates(
                &raw,
                &store,
                &kc,
                *start_block,
                *end_block,
                *forward_fill_rates || cfg.forward_fill_rates,
            )
            .await?;
            println!("patched {} exchange rate rows", patched);
            Ok(())
        }
    }
}

fn open_store(
    currency: &str,
    cfg: &CurrencyConfig,
    write_batch_size: Option<usize>,
) -> Result<TransformedStore, UpdateError> {
    let db = open_transformed(std::path::Path::new(&cfg.transformed_path))?;
    Ok(TransformedStore::new(
        db,
        format!("{}_transformed", currency),
        write_batch_size.unwrap_or(cfg.write_batch_size),
        RetryPolicy::default(),
    ))
}

fn print_status(
    name: &str,
    cfg: &CurrencyConfig,
    store: &TransformedStore,
    json: bool,
) -> Result<(), UpdateError> {
    let status = store.get_status()?;
    let summary = store.get_summary_statistics()?;
    if json {
        let doc = serde_json::json!({
            "currency": name,
            "schema_type": cfg.schema_type,
            "status": status,
            "summary": summary,
        });
        println!("{}", serde_json::to_string_pretty(&doc).unwrap_or_default());
        return Ok(());
    }
    match status {
        Some(status) => {
            println!(
                "{}: synced to block {} ({} addresses, {} txs, {} blocks), last run {}s",
                name,
                status.last_synced_block,
                summary.no_addresses,
                summary.no_transactions,
                summary.no_blocks,
                status.runtime_seconds
            );
        }
        None => {
            println!("{}: never updated ({:?} keyspace)", name, cfg.schema_type);
        }
    }
    Ok(())
}

fn spawn_cancel_listener(cancel: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown requested, finishing at the next safe point");
            cancel.store(true, Ordering::Relaxed);
        }
    });
}
