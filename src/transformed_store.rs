/// Transformed Store Adapter
///
/// Reads for bootstrapping (id lookups, current rows, status) and the
/// grouped, idempotent batch write. Every row the engine can write is a
/// `RowOp`: a pure description of an upsert keyed by its logical
/// identity, encoded to bytes only at apply time. The same `RowOp` list
/// is also what the pending-batch journal persists, so a crash replay
/// re-writes byte-identical rows.

use std::sync::Arc;

use rocksdb::DB;
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;
use crate::keys;
use crate::types::{
    AddressBytes, AddressRow, AddressTxRow, ClusterRow, Currency, DeltaUpdaterHistory,
    DeltaUpdaterStatus, KeyspaceConfiguration, RelationRow, SummaryStatistics,
    TokenConfigurationRow,
};
use crate::write_batcher::{RetryPolicy, WriteBatcher, WriteOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationDirection {
    Incoming,
    Outgoing,
}

impl RelationDirection {
    pub fn cf_name(self) -> &'static str {
        match self {
            RelationDirection::Incoming => "address_incoming_relations",
            RelationDirection::Outgoing => "address_outgoing_relations",
        }
    }

    pub fn secondary_cf_name(self) -> &'static str {
        match self {
            RelationDirection::Incoming => "address_incoming_relations_secondary_ids",
            RelationDirection::Outgoing => "address_outgoing_relations_secondary_ids",
        }
    }
}

/// One batch's complete write group plus its commit row, as persisted in
/// the pending-batch journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingBatch {
    pub ops: Vec<RowOp>,
    pub status: DeltaUpdaterStatus,
}

/// Tagged union over all table-specific row shapes. Serializable because
/// the journal stores the whole group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RowOp {
    ExchangeRate {
        height: i64,
        fiat_values: Vec<f32>,
    },
    AddressIdByPrefix {
        prefix: String,
        address: AddressBytes,
        address_id: i32,
    },
    AddressIdGroup {
        address_id: i32,
        address: AddressBytes,
    },
    TransactionIdByPrefix {
        prefix: String,
        tx_hash: Vec<u8>,
        tx_id: i64,
    },
    TransactionIdGroup {
        tx_id: i64,
        tx_hash: Vec<u8>,
    },
    BlockTransactions {
        height: i64,
        tx_ids: Vec<i64>,
    },
    Address(AddressRow),
    AddressTransaction {
        address_id: i32,
        row: AddressTxRow,
    },
    AddressTxSecondaryIds {
        address_id: i32,
        num_secondary_ids: i32,
    },
    OutgoingRelation(RelationRow),
    IncomingRelation(RelationRow),
    OutgoingRelationSecondaryIds {
        address_id: i32,
        num_secondary_ids: i32,
    },
    IncomingRelationSecondaryIds {
        address_id: i32,
        num_secondary_ids: i32,
    },
    Balance {
        address_id: i32,
        currency: Currency,
        value: i64,
    },
    Cluster(ClusterRow),
    ClusterAddress {
        cluster_id: i32,
        address_id: i32,
    },
    AddressCluster {
        address_id: i32,
        cluster_id: i32,
    },
    SummaryStatistics(SummaryStatistics),
    Configuration(KeyspaceConfiguration),
    TokenConfiguration(TokenConfigurationRow),
    Status(DeltaUpdaterStatus),
    History(DeltaUpdaterHistory),
    DeletePendingBatch,
}

impl RowOp {
    /// Lower the logical row to its physical write. Encoding lives in one
    /// place so keys never drift between writer and readers.
    pub fn encode(&self, kc: &KeyspaceConfiguration) -> Result<WriteOp, UpdateError> {
        let op = match self {
            RowOp::ExchangeRate {
                height,
                fiat_values,
            } => WriteOp::Put {
                cf_name: "exchange_rates",
                key: keys::transformed_rate_key(*height),
                value: bincode::serialize(fiat_values)?,
            },
            RowOp::AddressIdByPrefix {
                prefix,
                address,
                address_id,
            } => WriteOp::Put {
                cf_name: "address_ids_by_address_prefix",
                key: keys::address_id_by_prefix_key(prefix, address),
                value: bincode::serialize(address_id)?,
            },
            RowOp::AddressIdGroup {
                address_id,
                address,
            } => WriteOp::Put {
                cf_name: "address_ids_by_address_id_group",
                key: keys::address_id_group_key(*address_id, kc.address_bucket_size),
                value: bincode::serialize(address)?,
            },
            RowOp::TransactionIdByPrefix {
                prefix,
                tx_hash,
                tx_id,
            } => WriteOp::Put {
                cf_name: "transaction_ids_by_transaction_prefix",
                key: keys::transaction_id_by_prefix_key(prefix, tx_hash),
                value: bincode::serialize(tx_id)?,
            },
            RowOp::TransactionIdGroup { tx_id, tx_hash } => WriteOp::Put {
                cf_name: "transaction_ids_by_transaction_id_group",
                key: keys::transaction_id_group_key(*tx_id, kc.tx_bucket_size),
                value: bincode::serialize(tx_hash)?,
            },
            RowOp::BlockTransactions { height, tx_ids } => WriteOp::Put {
                cf_name: "block_transactions",
                key: keys::block_transactions_key(*height, kc.block_bucket_size),
                value: bincode::serialize(tx_ids)?,
            },
            RowOp::Address(row) => WriteOp::Put {
                cf_name: "address",
                key: keys::address_key(row.address_id, kc.address_bucket_size),
                value: bincode::serialize(row)?,
            },
            RowOp::AddressTransaction { address_id, row } => WriteOp::Put {
                cf_name: "address_transactions",
                key: keys::address_transactions_key(
                    *address_id,
                    row.is_outgoing,
                    row.tx_id,
                    row.currency.label(),
                    kc.address_bucket_size,
                    kc.relation_secondary_bucket_size,
                ),
                value: bincode::serialize(row)?,
            },
            RowOp::AddressTxSecondaryIds {
                address_id,
                num_secondary_ids,
            } => WriteOp::Put {
                cf_name: "address_transactions_secondary_ids",
                key: keys::secondary_ids_key(*address_id, kc.address_bucket_size),
                value: bincode::serialize(num_secondary_ids)?,
            },
            RowOp::OutgoingRelation(row) => WriteOp::Put {
                cf_name: RelationDirection::Outgoing.cf_name(),
                key: keys::relation_key(
                    row.src_address_id,
                    row.dst_address_id,
                    kc.address_bucket_size,
                    kc.relation_secondary_bucket_size,
                ),
                value: bincode::serialize(row)?,
            },
            RowOp::IncomingRelation(row) => WriteOp::Put {
                cf_name: RelationDirection::Incoming.cf_name(),
                key: keys::relation_key(
                    row.dst_address_id,
                    row.src_address_id,
                    kc.address_bucket_size,
                    kc.relation_secondary_bucket_size,
                ),
                value: bincode::serialize(row)?,
            },
            RowOp::OutgoingRelationSecondaryIds {
                address_id,
                num_secondary_ids,
            } => WriteOp::Put {
                cf_name: RelationDirection::Outgoing.secondary_cf_name(),
                key: keys::secondary_ids_key(*address_id, kc.address_bucket_size),
                value: bincode::serialize(num_secondary_ids)?,
            },
            RowOp::IncomingRelationSecondaryIds {
                address_id,
                num_secondary_ids,
            } => WriteOp::Put {
                cf_name: RelationDirection::Incoming.secondary_cf_name(),
                key: keys::secondary_ids_key(*address_id, kc.address_bucket_size),
                value: bincode::serialize(num_secondary_ids)?,
            },
            RowOp::Balance {
                address_id,
                currency,
                value,
            } => WriteOp::Put {
                cf_name: "balance",
                key: keys::balance_key(*address_id, currency.label(), kc.address_bucket_size),
                value: bincode::serialize(value)?,
            },
            RowOp::Cluster(row) => WriteOp::Put {
                cf_name: "cluster",
                key: keys::cluster_key(row.cluster_id, kc.address_bucket_size),
                value: bincode::serialize(row)?,
            },
            RowOp::ClusterAddress {
                cluster_id,
                address_id,
            } => WriteOp::Put {
                cf_name: "cluster_addresses",
                key: keys::cluster_addresses_key(
                    *cluster_id,
                    *address_id,
                    kc.address_bucket_size,
                ),
                value: bincode::serialize(address_id)?,
            },
            RowOp::AddressCluster {
                address_id,
                cluster_id,
            } => WriteOp::Put {
                cf_name: "address_cluster",
                key: keys::address_cluster_key(*address_id, kc.address_bucket_size),
                value: bincode::serialize(cluster_id)?,
            },
            RowOp::SummaryStatistics(row) => WriteOp::Put {
                cf_name: "summary_statistics",
                key: keys::SUMMARY_STATISTICS_KEY.to_vec(),
                value: bincode::serialize(row)?,
            },
            RowOp::Configuration(row) => WriteOp::Put {
                cf_name: "configuration",
                key: keys::CONFIGURATION_KEY.to_vec(),
                value: bincode::serialize(row)?,
            },
            RowOp::TokenConfiguration(row) => WriteOp::Put {
                cf_name: "token_configuration",
                key: keys::token_configuration_key(&row.ticker),
                value: bincode::serialize(row)?,
            },
            RowOp::Status(row) => WriteOp::Put {
                cf_name: "delta_updater_status",
                key: keys::status_key(&row.keyspace_name),
                value: bincode::serialize(row)?,
            },
            RowOp::History(row) => WriteOp::Put {
                cf_name: "delta_updater_history",
                key: keys::history_key(row.last_synced_block),
                value: bincode::serialize(row)?,
            },
            RowOp::DeletePendingBatch => WriteOp::Delete {
                cf_name: "pending_batch",
                key: keys::PENDING_BATCH_KEY.to_vec(),
            },
        };
        Ok(op)
    }
}

pub struct TransformedStore {
    db: Arc<DB>,
    batcher: WriteBatcher,
    keyspace_name: String,
}

impl TransformedStore {
    pub fn new(
        db: Arc<DB>,
        keyspace_name: String,
        write_batch_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        let batcher = WriteBatcher::new(Arc::clone(&db), write_batch_size, retry);
        Self {
            db,
            batcher,
            keyspace_name,
        }
    }

    pub fn keyspace_name(&self) -> &str {
        &self.keyspace_name
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, UpdateError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| UpdateError::corrupt(format!("transformed CF not found: {}", name)))
    }

    fn get_decoded<T: for<'de> Deserialize<'de>>(
        &self,
        cf_name: &str,
        key: &[u8],
    ) -> Result<Option<T>, UpdateError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    // -- reads ------------------------------------------------------------

    pub fn get_configuration(&self) -> Result<Option<KeyspaceConfiguration>, UpdateError> {
        self.get_decoded("configuration", keys::CONFIGURATION_KEY)
    }

    pub fn get_address_id(
        &self,
        prefix: &str,
        address: &[u8],
    ) -> Result<Option<i32>, UpdateError> {
        self.get_decoded(
            "address_ids_by_address_prefix",
            &keys::address_id_by_prefix_key(prefix, address),
        )
    }

    pub fn get_address(
        &self,
        address_id: i32,
        kc: &KeyspaceConfiguration,
    ) -> Result<Option<AddressRow>, UpdateError> {
        self.get_decoded(
            "address",
            &keys::address_key(address_id, kc.address_bucket_size),
        )
    }

    /// Single batched read for all touched addresses of an aggregation
    /// pass.
    pub fn multi_get_addresses(
        &self,
        address_ids: &[i32],
        kc: &KeyspaceConfiguration,
    ) -> Result<Vec<Option<AddressRow>>, UpdateError> {
        let cf = self.cf("address")?;
        let keys: Vec<Vec<u8>> = address_ids
            .iter()
            .map(|id| keys::address_key(*id, kc.address_bucket_size))
            .collect();
        let results = self.db.multi_get_cf(keys.iter().map(|k| (cf, k.clone())));
        let mut rows = Vec::with_capacity(results.len());
        for res in results {
            match res? {
                Some(bytes) => rows.push(Some(bincode::deserialize(&bytes)?)),
                None => rows.push(None),
            }
        }
        Ok(rows)
    }

    pub fn get_relation(
        &self,
        direction: RelationDirection,
        partition_id: i32,
        counterpart_id: i32,
        kc: &KeyspaceConfiguration,
    ) -> Result<Option<RelationRow>, UpdateError> {
        self.get_decoded(
            direction.cf_name(),
            &keys::relation_key(
                partition_id,
                counterpart_id,
                kc.address_bucket_size,
                kc.relation_secondary_bucket_size,
            ),
        )
    }

    pub fn get_balance(
        &self,
        address_id: i32,
        currency: &Currency,
        kc: &KeyspaceConfiguration,
    ) -> Result<i64, UpdateError> {
        Ok(self
            .get_decoded(
                "balance",
                &keys::balance_key(address_id, currency.label(), kc.address_bucket_size),
            )?
            .unwrap_or(0))
    }

    pub fn get_secondary_ids(
        &self,
        cf_name: &str,
        address_id: i32,
        kc: &KeyspaceConfiguration,
    ) -> Result<i32, UpdateError> {
        Ok(self
            .get_decoded(
                cf_name,
                &keys::secondary_ids_key(address_id, kc.address_bucket_size),
            )?
            .unwrap_or(0))
    }

    pub fn get_address_cluster(
        &self,
        address_id: i32,
        kc: &KeyspaceConfiguration,
    ) -> Result<Option<i32>, UpdateError> {
        self.get_decoded(
            "address_cluster",
            &keys::address_cluster_key(address_id, kc.address_bucket_size),
        )
    }

    pub fn get_cluster(
        &self,
        cluster_id: i32,
        kc: &KeyspaceConfiguration,
    ) -> Result<Option<ClusterRow>, UpdateError> {
        self.get_decoded(
            "cluster",
            &keys::cluster_key(cluster_id, kc.address_bucket_size),
        )
    }

    pub fn get_cluster_addresses(
        &self,
        cluster_id: i32,
        kc: &KeyspaceConfiguration,
    ) -> Result<Vec<i32>, UpdateError> {
        let cf = self.cf("cluster_addresses")?;
        let prefix = keys::cluster_addresses_prefix(cluster_id, kc.address_bucket_size);
        let mut members = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            if key.len() < prefix.len() || key[..prefix.len()] != prefix[..] {
                break;
            }
            members.push(bincode::deserialize(&value)?);
        }
        Ok(members)
    }

    pub fn get_transformed_rate(&self, height: i64) -> Result<Option<Vec<f32>>, UpdateError> {
        self.get_decoded("exchange_rates", &keys::transformed_rate_key(height))
    }

    pub fn get_status(&self) -> Result<Option<DeltaUpdaterStatus>, UpdateError> {
        self.get_decoded("delta_updater_status", &keys::status_key(&self.keyspace_name))
    }

    /// All history rows, block-ascending (the key is big-endian).
    pub fn get_history(&self) -> Result<Vec<DeltaUpdaterHistory>, UpdateError> {
        let cf = self.cf("delta_updater_history")?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (_, value) = item?;
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    pub fn get_summary_statistics(&self) -> Result<SummaryStatistics, UpdateError> {
        Ok(self
            .get_decoded("summary_statistics", keys::SUMMARY_STATISTICS_KEY)?
            .unwrap_or_default())
    }

    pub fn get_token_configurations(&self) -> Result<Vec<TokenConfigurationRow>, UpdateError> {
        let cf = self.cf("token_configuration")?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (_, value) = item?;
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    /// Allocator seed when no status row exists yet (pre-existing
    /// keyspace without one). Scans the reverse index once at startup.
    pub fn scan_highest_address_id(&self) -> Result<i32, UpdateError> {
        let cf = self.cf("address_ids_by_address_id_group")?;
        let mut highest = -1i32;
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, _) = item?;
            if key.len() >= 8 {
                let id = i32::from_le_bytes(key[4..8].try_into().unwrap());
                highest = highest.max(id);
            }
        }
        Ok(highest)
    }

    /// Full dump of one CF, key-ascending. Diagnostics and byte-level
    /// comparisons in tests; never on the hot path.
    pub fn dump_cf(&self, cf_name: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, UpdateError> {
        let cf = self.cf(cf_name)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, value) = item?;
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    pub fn count_rows(&self, cf_name: &str) -> Result<u64, UpdateError> {
        let cf = self.cf(cf_name)?;
        let mut n = 0u64;
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            item?;
            n += 1;
        }
        Ok(n)
    }

    // -- writes -----------------------------------------------------------

    /// Grouped write of one batch's data rows. The group is sorted by
    /// (cf, key) before applying, so retries and journal replays produce
    /// identical byte-level writes.
    pub async fn batch_write(
        &self,
        ops: Vec<RowOp>,
        kc: &KeyspaceConfiguration,
    ) -> Result<(), UpdateError> {
        let mut writes = Vec::with_capacity(ops.len());
        for op in &ops {
            writes.push(op.encode(kc)?);
        }
        writes.sort_by(|a, b| {
            a.cf_name()
                .cmp(b.cf_name())
                .then_with(|| a.key().cmp(b.key()))
        });
        self.batcher.write(writes).await
    }

    /// Persist the pending-batch journal in one atomic write. Must happen
    /// before any data chunk of the batch lands. The journal carries the
    /// already-built status row so a crash replay can re-apply the batch
    /// byte-identically and then advance status.
    pub async fn write_journal(&self, batch: &PendingBatch) -> Result<(), UpdateError> {
        let payload = bincode::serialize(batch)?;
        self.batcher
            .write_atomic(vec![WriteOp::Put {
                cf_name: "pending_batch",
                key: keys::PENDING_BATCH_KEY.to_vec(),
                value: payload,
            }])
            .await
    }

    pub fn read_journal(&self) -> Result<Option<PendingBatch>, UpdateError> {
        self.get_decoded("pending_batch", keys::PENDING_BATCH_KEY)
    }

    /// Drop the journal without applying it (cancellation between the
    /// data write and the commit point discards the batch).
    pub async fn discard_journal(&self) -> Result<(), UpdateError> {
        self.batcher
            .write_atomic(vec![WriteOp::Delete {
                cf_name: "pending_batch",
                key: keys::PENDING_BATCH_KEY.to_vec(),
            }])
            .await
    }

    /// The commit point: status row, history row, and journal deletion in
    /// one atomic write. A crash on either side of this call leaves the
    /// keyspace recoverable.
    pub async fn commit_status(
        &self,
        status: DeltaUpdaterStatus,
        kc: &KeyspaceConfiguration,
    ) -> Result<(), UpdateError> {
        let ops = vec![
            RowOp::Status(status.clone()),
            RowOp::History(status),
            RowOp::DeletePendingBatch,
        ];
        let mut writes = Vec::with_capacity(ops.len());
        for op in &ops {
            writes.push(op.encode(kc)?);
        }
        self.batcher.write_atomic(writes).await
    }

    /// Initialize a fresh keyspace: writes the configuration row. Refuses
    /// to run against a keyspace that already holds data.
    pub async fn create_schema(
        &self,
        kc: &KeyspaceConfiguration,
    ) -> Result<(), UpdateError> {
        for cf_name in crate::schema::data_bearing_cfs(kc.schema_type) {
            if self.count_rows(cf_name)? > 0 {
                return Err(UpdateError::WriteRejected {
                    detail: format!(
                        "refusing to create schema: CF {} already holds rows",
                        cf_name
                    ),
                });
            }
        }
        self.batch_write(vec![RowOp::Configuration(kc.clone())], kc)
            .await
    }
}
