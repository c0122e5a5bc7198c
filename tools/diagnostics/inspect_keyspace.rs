/// Transformed Keyspace Inspection Tool
///
/// Dumps per-CF row counts, the configuration row, the updater status and
/// the most recent history rows for one transformed keyspace. Read-only;
/// safe to run while an updater holds the lock.
///
/// ## Usage
///
/// ```bash
/// cargo run --bin inspect-keyspace -- --transformed-path data/btc/transformed
/// ```

use clap::Parser;
use std::path::PathBuf;

use ledgerview::schema::{open_transformed, TRANSFORMED_COLUMN_FAMILIES};
use ledgerview::transformed_store::TransformedStore;
use ledgerview::write_batcher::RetryPolicy;

#[derive(Parser, Debug)]
#[clap(name = "inspect-keyspace")]
#[clap(about = "Dump row counts, status and history of a transformed keyspace", long_about = None)]
struct Args {
    /// Path to the transformed keyspace database
    #[clap(long)]
    transformed_path: String,

    /// Keyspace name used in the status row
    #[clap(long, default_value = "transformed")]
    keyspace_name: String,

    /// Number of history rows to show (newest last)
    #[clap(long, default_value_t = 10)]
    history: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let path = PathBuf::from(shellexpand::tilde(&args.transformed_path).to_string());
    if !path.exists() {
        eprintln!("transformed keyspace not found: {}", path.display());
        std::process::exit(1);
    }

    let db = open_transformed(&path)?;
    let store = TransformedStore::new(db, args.keyspace_name, 1000, RetryPolicy::default());

    println!("== configuration ==");
    match store.get_configuration()? {
        Some(kc) => {
            println!("  schema_type:                  {:?}", kc.schema_type);
            println!("  address_bucket_size:          {}", kc.address_bucket_size);
            println!("  tx_bucket_size:               {}", kc.tx_bucket_size);
            println!("  block_bucket_size:            {}", kc.block_bucket_size);
            println!(
                "  relation_secondary_bucket:    {}",
                kc.relation_secondary_bucket_size
            );
            println!("  address_prefix_length:        {}", kc.address_prefix_length);
            println!("  fiat_currencies:              {:?}", kc.fiat_currencies);
            println!("  decimals:                     {}", kc.decimals);
        }
        None => println!("  (no configuration row - keyspace never initialized)"),
    }

    println!("\n== row counts ==");
    for cf in TRANSFORMED_COLUMN_FAMILIES {
        let count = store.count_rows(cf)?;
        if count > 0 {
            println!("  {:<45} {}", cf, count);
        }
    }

    println!("\n== status ==");
    match store.get_status()? {
        Some(s) => {
            println!("  last_synced_block:     {}", s.last_synced_block);
            println!("  last_block_timestamp:  {}", s.last_synced_block_timestamp);
            println!("  highest_address_id:    {}", s.highest_address_id);
            println!("  last run:              {} ({}s)", s.timestamp, s.runtime_seconds);
        }
        None => println!("  (never updated)"),
    }

    if store.read_journal()?.is_some() {
        println!("\n  WARNING: pending batch journal present - last run was interrupted");
        println!("  (the next update run will replay it)");
    }

    let history = store.get_history()?;
    println!("\n== history ({} rows) ==", history.len());
    for row in history.iter().rev().take(args.history).rev() {
        println!(
            "  block {:>10}  ts {}  addresses {:>10}  {:.1}s",
            row.last_synced_block, row.timestamp, row.highest_address_id, row.runtime_seconds
        );
    }

    let summary = store.get_summary_statistics()?;
    println!("\n== summary ==");
    println!("  blocks:       {}", summary.no_blocks);
    println!("  transactions: {}", summary.no_transactions);
    println!("  addresses:    {}", summary.no_addresses);
    println!("  clusters:     {}", summary.no_clusters);

    Ok(())
}
