/// Keyspace Schemas
///
/// Column-family layout for the raw (read-only) and transformed
/// (read/write) keyspaces, plus the open helpers used by the engine and
/// the diagnostic tools.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{ColumnFamilyDescriptor, Options, DB};

use crate::error::UpdateError;
use crate::types::SchemaType;

/// Raw keyspace CFs. `trace` and `log` exist for account ledgers only but
/// are listed unconditionally; an empty CF costs nothing and keeps the
/// open path uniform.
pub const RAW_COLUMN_FAMILIES: [&str; 7] = [
    "block",
    "transaction",
    "trace",
    "log",
    "exchange_rates",
    "summary_statistics",
    "configuration",
];

pub const TRANSFORMED_COLUMN_FAMILIES: [&str; 23] = [
    "exchange_rates",
    "address_ids_by_address_prefix",
    "address_ids_by_address_id_group",
    "transaction_ids_by_transaction_prefix",
    "transaction_ids_by_transaction_id_group",
    "block_transactions",
    "address_transactions",
    "address_transactions_secondary_ids",
    "address",
    "address_incoming_relations",
    "address_outgoing_relations",
    "address_incoming_relations_secondary_ids",
    "address_outgoing_relations_secondary_ids",
    "balance",
    "cluster",
    "cluster_addresses",
    "address_cluster",
    "summary_statistics",
    "configuration",
    "token_configuration",
    "delta_updater_status",
    "delta_updater_history",
    "pending_batch",
];

fn descriptors(names: &[&str]) -> Vec<ColumnFamilyDescriptor> {
    names
        .iter()
        .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
        .collect()
}

/// Open the raw keyspace read-only. The ingest owns this database; we must
/// never take write locks or create CFs in it.
pub fn open_raw(path: &Path) -> Result<Arc<DB>, UpdateError> {
    let opts = Options::default();
    let db = DB::open_cf_for_read_only(&opts, path, RAW_COLUMN_FAMILIES, false)?;
    Ok(Arc::new(db))
}

/// Open the transformed keyspace read/write, creating missing CFs. The
/// advisory file lock in `lock.rs` serializes updaters above this.
pub fn open_transformed(path: &Path) -> Result<Arc<DB>, UpdateError> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);
    let db = DB::open_cf_descriptors(&opts, path, descriptors(&TRANSFORMED_COLUMN_FAMILIES))?;
    Ok(Arc::new(db))
}

/// Test-only raw keyspace writer, used by fixtures and the ingest
/// simulator in tests.
pub fn open_raw_rw(path: &Path) -> Result<Arc<DB>, UpdateError> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);
    let db = DB::open_cf_descriptors(&opts, path, descriptors(&RAW_COLUMN_FAMILIES))?;
    Ok(Arc::new(db))
}

/// CFs whose emptiness decides whether `--create-schema` may run.
pub fn data_bearing_cfs(schema: SchemaType) -> Vec<&'static str> {
    let mut cfs = vec![
        "address",
        "address_transactions",
        "address_incoming_relations",
        "address_outgoing_relations",
        "delta_updater_status",
    ];
    if schema == SchemaType::Utxo {
        cfs.push("cluster");
    }
    cfs
}
