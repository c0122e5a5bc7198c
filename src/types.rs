/// Core Data Model
///
/// Raw-keyspace records (written by ingest, read-only here) and
/// transformed-keyspace rows (owned by this engine). All row values are
/// bincode-serialized; keys are built in `keys.rs`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Canonical binary form of an address.
///
/// UTXO ledgers use the textual address bytes as-is; account ledgers use
/// the 20-byte binary address. The partitioning prefix is always taken
/// from the textual form (`textual_address`).
pub type AddressBytes = Vec<u8>;

/// Pseudo-address crediting coinbase outputs. Never clustered.
pub const COINBASE_ADDRESS: &[u8] = b"coinbase";

/// Sentinel for outputs whose script resolves to no address.
pub const DEFAULT_NONSTANDARD_ADDRESS: &str = "nonstandard";

/// Textual rendering of a canonical address, used for prefix computation
/// and log lines.
pub fn textual_address(address: &[u8], schema: SchemaType) -> String {
    match schema {
        SchemaType::Utxo => String::from_utf8_lossy(address).to_string(),
        SchemaType::Account => hex::encode(address),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Utxo,
    Account,
}

// ---------------------------------------------------------------------------
// Raw keyspace records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBlock {
    pub height: i64,
    pub hash: Vec<u8>,
    pub timestamp: i64,
    pub tx_count: i32,
}

/// One side of a UTXO transaction. An output script can resolve to zero
/// addresses (non-standard) or several (bare multisig).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxInputOutput {
    pub addresses: Vec<String>,
    pub value: i64,
    pub address_type: i16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawUtxoTransaction {
    pub tx_hash: Vec<u8>,
    pub block_height: i64,
    pub tx_index: i32,
    pub coinbase: bool,
    pub inputs: Vec<TxInputOutput>,
    pub outputs: Vec<TxInputOutput>,
    pub timestamp: i64,
}

impl RawUtxoTransaction {
    pub fn total_input(&self) -> i64 {
        self.inputs.iter().map(|i| i.value).sum()
    }

    pub fn total_output(&self) -> i64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// Miner fee. Zero for coinbase (inputs are synthetic there).
    pub fn fee(&self) -> i64 {
        if self.coinbase {
            0
        } else {
            self.total_input() - self.total_output()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAccountTransaction {
    pub tx_hash: Vec<u8>,
    pub block_height: i64,
    pub tx_index: i32,
    pub from_address: Option<Vec<u8>>,
    pub to_address: Option<Vec<u8>>,
    pub value: i64,
    /// 1 = success, 0 = failed.
    pub status: i16,
    pub receipt_gas_used: i64,
    pub effective_gas_price: i64,
    pub receipt_contract_address: Option<Vec<u8>>,
}

impl RawAccountTransaction {
    pub fn is_success(&self) -> bool {
        self.status == 1
    }

    pub fn fee(&self) -> i64 {
        self.receipt_gas_used.saturating_mul(self.effective_gas_price)
    }
}

/// Internal call record. `trace_index` 0 is the root call of the
/// transaction; deeper calls follow in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTrace {
    pub block_height: i64,
    pub tx_hash: Vec<u8>,
    pub trace_index: i32,
    pub from_address: Option<Vec<u8>>,
    pub to_address: Option<Vec<u8>>,
    pub value: i64,
    pub trace_type: String,
    /// 1 = success, 0 = failed.
    pub status: i16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    pub block_height: i64,
    pub tx_hash: Vec<u8>,
    pub log_index: i32,
    /// Emitting contract.
    pub address: Vec<u8>,
    pub topics: Vec<Vec<u8>>,
    pub data: Vec<u8>,
}

/// Everything belonging to one raw block, as handed out by the raw store.
#[derive(Debug, Clone)]
pub struct BlockBundle {
    pub block: RawBlock,
    pub txs: BundleTxs,
}

#[derive(Debug, Clone)]
pub enum BundleTxs {
    Utxo(Vec<RawUtxoTransaction>),
    Account {
        txs: Vec<RawAccountTransaction>,
        traces: Vec<RawTrace>,
        logs: Vec<RawLog>,
    },
}

// ---------------------------------------------------------------------------
// Monetary values
// ---------------------------------------------------------------------------

/// A monetary amount in native units plus its fiat equivalents, ordered as
/// in the configured fiat list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CurrencyValue {
    pub value: i64,
    pub fiat_values: Vec<f32>,
}

impl CurrencyValue {
    pub fn new(value: i64, fiat_values: Vec<f32>) -> Self {
        Self { value, fiat_values }
    }

    pub fn zero(fiat_len: usize) -> Self {
        Self {
            value: 0,
            fiat_values: vec![0.0; fiat_len],
        }
    }

    /// Component-wise accumulate. The fiat vector of the shorter side is
    /// treated as zero-extended; rows written before a fiat currency was
    /// added keep summing correctly.
    pub fn add(&mut self, other: &CurrencyValue) {
        self.value += other.value;
        if self.fiat_values.len() < other.fiat_values.len() {
            self.fiat_values.resize(other.fiat_values.len(), 0.0);
        }
        for (i, v) in other.fiat_values.iter().enumerate() {
            self.fiat_values[i] += v;
        }
    }
}

/// Identifies the asset a value is denominated in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Currency {
    Native,
    Token(String),
}

impl Currency {
    pub fn label(&self) -> &str {
        match self {
            Currency::Native => "native",
            Currency::Token(t) => t,
        }
    }
}

// ---------------------------------------------------------------------------
// Transformed keyspace rows
// ---------------------------------------------------------------------------

/// Marker for an unset first/last tx hint on a fresh row.
pub const TX_ID_UNSET: i64 = -1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressRow {
    pub address_id: i32,
    pub address: AddressBytes,
    pub no_incoming_txs: i32,
    pub no_outgoing_txs: i32,
    pub no_incoming_txs_zero_value: i32,
    pub no_outgoing_txs_zero_value: i32,
    pub first_tx_id: i64,
    pub last_tx_id: i64,
    pub total_received: CurrencyValue,
    pub total_spent: CurrencyValue,
    pub total_tokens_received: BTreeMap<String, CurrencyValue>,
    pub total_tokens_spent: BTreeMap<String, CurrencyValue>,
    pub in_degree: i32,
    pub out_degree: i32,
    pub in_degree_zero_value: i32,
    pub out_degree_zero_value: i32,
    pub is_contract: bool,
}

impl AddressRow {
    pub fn new(address_id: i32, address: AddressBytes, fiat_len: usize) -> Self {
        Self {
            address_id,
            address,
            no_incoming_txs: 0,
            no_outgoing_txs: 0,
            no_incoming_txs_zero_value: 0,
            no_outgoing_txs_zero_value: 0,
            first_tx_id: TX_ID_UNSET,
            last_tx_id: TX_ID_UNSET,
            total_received: CurrencyValue::zero(fiat_len),
            total_spent: CurrencyValue::zero(fiat_len),
            total_tokens_received: BTreeMap::new(),
            total_tokens_spent: BTreeMap::new(),
            in_degree: 0,
            out_degree: 0,
            in_degree_zero_value: 0,
            out_degree_zero_value: 0,
            is_contract: false,
        }
    }
}

/// Directed address-to-address relation aggregates. Stored twice, once in
/// the outgoing table partitioned by source and once in the incoming table
/// partitioned by destination; the two must stay symmetric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRow {
    pub src_address_id: i32,
    pub dst_address_id: i32,
    pub no_transactions: i32,
    pub value: CurrencyValue,
    pub token_values: BTreeMap<String, CurrencyValue>,
}

impl RelationRow {
    pub fn new(src_address_id: i32, dst_address_id: i32, fiat_len: usize) -> Self {
        Self {
            src_address_id,
            dst_address_id,
            no_transactions: 0,
            value: CurrencyValue::zero(fiat_len),
            token_values: BTreeMap::new(),
        }
    }
}

/// One row per (address, direction, tx). The key carries the ordering; the
/// value records what moved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressTxRow {
    pub tx_id: i64,
    pub is_outgoing: bool,
    pub currency: Currency,
    pub value: CurrencyValue,
}

/// UTXO wallet cluster. Aggregates are a projection of member address
/// rows. A merged-away cluster keeps its row with `merged_into` set;
/// readers chase the pointer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterRow {
    pub cluster_id: i32,
    pub no_addresses: i32,
    pub no_incoming_txs: i32,
    pub no_outgoing_txs: i32,
    pub first_tx_id: i64,
    pub last_tx_id: i64,
    pub total_received: CurrencyValue,
    pub total_spent: CurrencyValue,
    pub merged_into: Option<i32>,
}

impl ClusterRow {
    pub fn new(cluster_id: i32, fiat_len: usize) -> Self {
        Self {
            cluster_id,
            no_addresses: 0,
            no_incoming_txs: 0,
            no_outgoing_txs: 0,
            first_tx_id: TX_ID_UNSET,
            last_tx_id: TX_ID_UNSET,
            total_received: CurrencyValue::zero(fiat_len),
            total_spent: CurrencyValue::zero(fiat_len),
            merged_into: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaUpdaterStatus {
    pub keyspace_name: String,
    pub last_synced_block: i64,
    pub last_synced_block_timestamp: i64,
    pub highest_address_id: i32,
    pub timestamp: i64,
    pub write_new: bool,
    pub write_dirty: bool,
    pub runtime_seconds: f64,
}

/// Append-only record of one committed batch, keyed by its
/// `last_synced_block`.
pub type DeltaUpdaterHistory = DeltaUpdaterStatus;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummaryStatistics {
    pub no_blocks: i64,
    pub no_transactions: i64,
    pub no_addresses: i64,
    pub no_clusters: i64,
    pub timestamp: i64,
}

/// Per-keyspace layout constants. Written once by `--create-schema`;
/// readers must honour the stored row over the config file so an existing
/// keyspace keeps its bucketing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyspaceConfiguration {
    pub schema_type: SchemaType,
    pub address_bucket_size: i32,
    pub tx_bucket_size: i32,
    pub block_bucket_size: i32,
    pub relation_secondary_bucket_size: i32,
    pub address_prefix_length: usize,
    pub tx_prefix_length: usize,
    pub fiat_currencies: Vec<String>,
    /// Power-of-ten scale between native integer units and whole coins
    /// (8 for satoshi ledgers, 18 for wei ledgers).
    pub decimals: u32,
}

impl KeyspaceConfiguration {
    pub fn fiat_len(&self) -> usize {
        self.fiat_currencies.len()
    }
}

/// Token eligible for log projection. Only configured tokens are
/// transformed; everything else in the logs is skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfigurationRow {
    pub ticker: String,
    pub token_address: Vec<u8>,
    pub decimals: u32,
    /// USD value of one whole token, used for fiat attachment.
    pub peg_usd: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_value_add_extends_fiat() {
        let mut a = CurrencyValue::new(10, vec![1.0]);
        a.add(&CurrencyValue::new(5, vec![0.5, 2.0]));
        assert_eq!(a.value, 15);
        assert_eq!(a.fiat_values, vec![1.5, 2.0]);
    }

    #[test]
    fn test_utxo_fee() {
        let tx = RawUtxoTransaction {
            tx_hash: vec![1],
            block_height: 5,
            tx_index: 0,
            coinbase: false,
            inputs: vec![TxInputOutput {
                addresses: vec!["a".into()],
                value: 60,
                address_type: 0,
            }],
            outputs: vec![TxInputOutput {
                addresses: vec!["b".into()],
                value: 59,
                address_type: 0,
            }],
            timestamp: 0,
        };
        assert_eq!(tx.fee(), 1);
    }

    #[test]
    fn test_coinbase_fee_is_zero() {
        let tx = RawUtxoTransaction {
            tx_hash: vec![1],
            block_height: 5,
            tx_index: 0,
            coinbase: true,
            inputs: vec![],
            outputs: vec![TxInputOutput {
                addresses: vec!["b".into()],
                value: 50,
                address_type: 0,
            }],
            timestamp: 0,
        };
        assert_eq!(tx.fee(), 0);
    }

    #[test]
    fn test_textual_address() {
        assert_eq!(
            textual_address(b"1BoatSLRHt", SchemaType::Utxo),
            "1BoatSLRHt"
        );
        assert_eq!(textual_address(&[0xab, 0xcd], SchemaType::Account), "abcd");
    }
}
