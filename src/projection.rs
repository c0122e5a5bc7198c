/// Projection Interface
///
/// A projector turns raw block bundles into flat, per-transaction money
/// flows and relation events. Projectors are pure: no store access, no
/// shared state between the UTXO and account implementations. The
/// aggregator folds the output into per-address and per-relation deltas.

use crate::error::UpdateError;
use crate::types::{AddressBytes, BlockBundle, Currency};

/// One side of one transaction for one address and one asset.
///
/// `value` is the transferred amount (0 marks zero-value participation,
/// which still counts toward tx counts and relations). `fee` is an extra
/// native debit on top of `value`; it feeds `total_spent` and the balance
/// but never the zero-value classification or any relation.
#[derive(Debug, Clone)]
pub struct Flow {
    pub tx_id: i64,
    pub block_height: i64,
    pub address: AddressBytes,
    pub currency: Currency,
    pub is_outgoing: bool,
    pub value: i64,
    pub fee: i64,
    pub mark_contract: bool,
}

/// One directed relation event. `counts_transaction` is set on exactly
/// one event per (tx, src, dst) so `no_transactions` counts transactions,
/// not assets.
#[derive(Debug, Clone)]
pub struct RelationFlow {
    pub tx_id: i64,
    pub block_height: i64,
    pub src: AddressBytes,
    pub dst: AddressBytes,
    pub currency: Currency,
    pub value: i64,
    pub counts_transaction: bool,
}

#[derive(Debug, Default)]
pub struct ProjectedBatch {
    /// Flows in first-sighting order: (block, tx position, inputs before
    /// outputs, position within each). Id allocation order derives from
    /// this.
    pub flows: Vec<Flow>,
    pub relations: Vec<RelationFlow>,
    /// Per-tx co-spent address sets (UTXO clustering input). Sentinels
    /// and coinbase never appear here.
    pub cluster_inputs: Vec<Vec<AddressBytes>>,
    /// (height, timestamp) of every projected block, ascending.
    pub blocks: Vec<(i64, i64)>,
    /// Tx ids assigned per block, for block_transactions rows.
    pub block_transactions: Vec<(i64, Vec<i64>)>,
    /// hash -> id assignments, for the account-model index tables.
    pub tx_ids: Vec<(Vec<u8>, i64)>,
    /// First id assigned by this batch (== seed passed in).
    pub first_tx_id: i64,
    /// One past the highest id assigned.
    pub next_tx_id: i64,
}

impl ProjectedBatch {
    pub fn new(first_tx_id: i64) -> Self {
        Self {
            first_tx_id,
            next_tx_id: first_tx_id,
            ..Default::default()
        }
    }

    pub fn tx_count(&self) -> i64 {
        self.next_tx_id - self.first_tx_id
    }
}

/// Raw-to-transformed projection for one ledger family.
pub trait Projector {
    /// `first_tx_id` seeds the dense (block, within-block) tx id
    /// assignment; the same seed yields the same assignment on replay.
    fn project(
        &self,
        bundles: &[BlockBundle],
        first_tx_id: i64,
    ) -> Result<ProjectedBatch, UpdateError>;
}

/// Order-preserving value sums: first occurrence fixes the position.
/// Projection uses this wherever per-address sums must not disturb the
/// id-allocation order.
#[derive(Debug, Default)]
pub struct OrderedSums {
    entries: Vec<(AddressBytes, i64)>,
    index: std::collections::HashMap<AddressBytes, usize>,
}

impl OrderedSums {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, address: &[u8], value: i64) {
        match self.index.get(address) {
            Some(&i) => self.entries[i].1 += value,
            None => {
                self.index.insert(address.to_vec(), self.entries.len());
                self.entries.push((address.to_vec(), value));
            }
        }
    }

    pub fn total(&self) -> i64 {
        self.entries.iter().map(|(_, v)| v).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AddressBytes, i64)> {
        self.entries.iter().map(|(a, v)| (a, *v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, address: &[u8]) -> bool {
        self.index.contains_key(address)
    }
}
