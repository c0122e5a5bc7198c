/// Account Projector
///
/// Converts account-model blocks (transactions, internal traces, token
/// logs) into flows and relation events.
///
/// RULES:
/// - When traces exist for a transaction they are the source of truth
///   for native transfers (trace 0 is the root call); without traces the
///   top-level transaction value is used. Only successful traces of
///   successful transactions move value.
/// - Failed transactions still count toward degree and zero-value stats
///   and emit a zero-valued relation, but no value.
/// - Fees (receipt_gas_used × effective_gas_price) are spent by the
///   sender, outside any relation.
/// - Logs matching the ERC-20 Transfer signature project as token
///   transfers, but only for tokens present in token_configuration.
/// - Contract creations mark the created address as a contract.

use std::collections::{HashMap, HashSet};

use crate::error::UpdateError;
use crate::projection::{Flow, OrderedSums, ProjectedBatch, Projector, RelationFlow};
use crate::types::{
    AddressBytes, BlockBundle, BundleTxs, Currency, RawAccountTransaction, RawLog, RawTrace,
    TokenConfigurationRow,
};

/// keccak256("Transfer(address,address,uint256)"), the topic0 of an
/// ERC-20 transfer event.
pub const TRANSFER_TOPIC: [u8; 32] = [
    0xdd, 0xf2, 0x52, 0xad, 0x1b, 0xe2, 0xc8, 0x9b, 0x69, 0xc2, 0xb0, 0x68, 0xfc, 0x37, 0x8d,
    0xaa, 0x95, 0x2b, 0xa7, 0xf1, 0x63, 0xc4, 0xa1, 0x16, 0x28, 0xf5, 0x5a, 0x4d, 0xf5, 0x23,
    0xb3, 0xef,
];

/// A decoded ERC-20 transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenTransfer {
    pub token_ticker: String,
    pub from: AddressBytes,
    pub to: AddressBytes,
    pub amount: i64,
}

/// Decode an ERC-20 Transfer log. Returns None for non-transfer logs,
/// malformed topics, or unconfigured tokens.
pub fn decode_token_transfer(
    log: &RawLog,
    token_configs: &HashMap<Vec<u8>, TokenConfigurationRow>,
) -> Option<TokenTransfer> {
    if log.topics.len() < 3 || log.topics[0].as_slice() != TRANSFER_TOPIC {
        return None;
    }
    let config = token_configs.get(&log.address)?;
    let from = log.topics[1].get(12..32)?.to_vec();
    let to = log.topics[2].get(12..32)?.to_vec();
    // uint256 big-endian. Malformed data is skipped; amounts beyond i64
    // saturate.
    let data = &log.data;
    if data.len() < 32 {
        return None;
    }
    let amount = if data[..16].iter().any(|b| *b != 0) {
        i64::MAX
    } else {
        let low = u128::from_be_bytes(data[16..32].try_into().ok()?);
        low.min(i64::MAX as u128) as i64
    };
    Some(TokenTransfer {
        token_ticker: config.ticker.clone(),
        from,
        to,
        amount,
    })
}

pub struct AccountProjector {
    token_configs: HashMap<Vec<u8>, TokenConfigurationRow>,
}

impl AccountProjector {
    pub fn new(tokens: Vec<TokenConfigurationRow>) -> Self {
        Self {
            token_configs: tokens
                .into_iter()
                .map(|t| (t.token_address.clone(), t))
                .collect(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn project_tx(
        &self,
        tx: &RawAccountTransaction,
        tx_id: i64,
        traces: &[&RawTrace],
        logs: &[&RawLog],
        out: &mut ProjectedBatch,
    ) {
        let height = tx.block_height;

        // Native transfers: traces when present, tx value as fallback.
        let mut transfers: Vec<(AddressBytes, AddressBytes, i64)> = Vec::new();
        let mut created: HashSet<AddressBytes> = HashSet::new();
        if tx.is_success() {
            if traces.is_empty() {
                if tx.value > 0 {
                    if let (Some(from), Some(to)) = (&tx.from_address, &tx.to_address) {
                        transfers.push((from.clone(), to.clone(), tx.value));
                    }
                }
            } else {
                for trace in traces {
                    if trace.status == 1 && trace.trace_type == "create" {
                        if let Some(to) = &trace.to_address {
                            created.insert(to.clone());
                        }
                    }
                    if trace.status != 1 || trace.value <= 0 {
                        continue;
                    }
                    if let (Some(from), Some(to)) = (&trace.from_address, &trace.to_address) {
                        transfers.push((from.clone(), to.clone(), trace.value));
                    }
                }
            }
        }
        if let Some(contract) = &tx.receipt_contract_address {
            created.insert(contract.clone());
        }

        let mut spent = OrderedSums::new();
        let mut received = OrderedSums::new();
        for (from, to, value) in &transfers {
            spent.add(from, *value);
            received.add(to, *value);
        }

        // Participation: the sender and the receiver (or created
        // contract) count toward tx stats even when nothing moved.
        if let Some(from) = &tx.from_address {
            if !spent.contains(from) {
                spent.add(from, 0);
            }
        }
        let receiver = tx
            .to_address
            .clone()
            .or_else(|| tx.receipt_contract_address.clone());
        if let Some(to) = &receiver {
            if !received.contains(to) {
                received.add(to, 0);
            }
        }

        for (address, value) in spent.iter() {
            let fee = if Some(address) == tx.from_address.as_ref() {
                tx.fee()
            } else {
                0
            };
            out.flows.push(Flow {
                tx_id,
                block_height: height,
                address: address.clone(),
                currency: Currency::Native,
                is_outgoing: true,
                value,
                fee,
                mark_contract: false,
            });
        }
        for (address, value) in received.iter() {
            out.flows.push(Flow {
                tx_id,
                block_height: height,
                address: address.clone(),
                currency: Currency::Native,
                is_outgoing: false,
                value,
                fee: 0,
                mark_contract: created.contains(address),
            });
        }

        // Relations. One tx unit per (src, dst) regardless of how many
        // assets moved between the pair.
        let mut counted: HashSet<(AddressBytes, AddressBytes)> = HashSet::new();
        let mut native_pairs = OrderedPairSums::new();
        for (from, to, value) in &transfers {
            if from != to {
                native_pairs.add(from, to, *value);
            }
        }
        if native_pairs.is_empty() {
            // Failed or value-less tx: a zero-valued edge records the
            // attempt.
            if let (Some(from), Some(to)) = (&tx.from_address, &receiver) {
                if from != to {
                    native_pairs.add(from, to, 0);
                }
            }
        }
        for ((src, dst), value) in native_pairs.iter() {
            counted.insert((src.clone(), dst.clone()));
            out.relations.push(RelationFlow {
                tx_id,
                block_height: height,
                src: src.clone(),
                dst: dst.clone(),
                currency: Currency::Native,
                value,
                counts_transaction: true,
            });
        }

        // Token transfers.
        let mut token_flows: Vec<(AddressBytes, String, bool, i64)> = Vec::new();
        let mut token_pairs: Vec<((AddressBytes, AddressBytes, String), i64)> = Vec::new();
        for log in logs {
            let Some(transfer) = decode_token_transfer(log, &self.token_configs) else {
                continue;
            };
            token_flows.push((
                transfer.from.clone(),
                transfer.token_ticker.clone(),
                true,
                transfer.amount,
            ));
            token_flows.push((
                transfer.to.clone(),
                transfer.token_ticker.clone(),
                false,
                transfer.amount,
            ));
            if transfer.from != transfer.to {
                token_pairs.push((
                    (transfer.from, transfer.to, transfer.token_ticker),
                    transfer.amount,
                ));
            }
        }
        // Fold duplicates per (address, token, direction).
        let mut folded: HashMap<(AddressBytes, String, bool), i64> = HashMap::new();
        let mut order: Vec<(AddressBytes, String, bool)> = Vec::new();
        for (addr, ticker, outgoing, amount) in token_flows {
            let key = (addr, ticker, outgoing);
            if let Some(v) = folded.get_mut(&key) {
                *v += amount;
            } else {
                folded.insert(key.clone(), amount);
                order.push(key);
            }
        }
        for key in order {
            let amount = folded[&key];
            let (address, ticker, outgoing) = key;
            out.flows.push(Flow {
                tx_id,
                block_height: height,
                address,
                currency: Currency::Token(ticker),
                is_outgoing: outgoing,
                value: amount,
                fee: 0,
                mark_contract: false,
            });
        }
        let mut pair_folded: HashMap<(AddressBytes, AddressBytes, String), i64> = HashMap::new();
        let mut pair_order: Vec<(AddressBytes, AddressBytes, String)> = Vec::new();
        for (key, amount) in token_pairs {
            if let Some(v) = pair_folded.get_mut(&key) {
                *v += amount;
            } else {
                pair_folded.insert(key.clone(), amount);
                pair_order.push(key);
            }
        }
        for key in pair_order {
            let value = pair_folded[&key];
            let (src, dst, ticker) = key;
            let counts = counted.insert((src.clone(), dst.clone()));
            out.relations.push(RelationFlow {
                tx_id,
                block_height: height,
                src,
                dst,
                currency: Currency::Token(ticker),
                value,
                counts_transaction: counts,
            });
        }
    }
}

impl Projector for AccountProjector {
    fn project(
        &self,
        bundles: &[BlockBundle],
        first_tx_id: i64,
    ) -> Result<ProjectedBatch, UpdateError> {
        let mut out = ProjectedBatch::new(first_tx_id);
        for bundle in bundles {
            let (txs, traces, logs) = match &bundle.txs {
                BundleTxs::Account { txs, traces, logs } => (txs, traces, logs),
                BundleTxs::Utxo(_) => {
                    return Err(UpdateError::corrupt(
                        "UTXO bundle handed to the account projector",
                    ))
                }
            };

            let mut traces_by_tx: HashMap<&[u8], Vec<&RawTrace>> = HashMap::new();
            for trace in traces {
                traces_by_tx
                    .entry(trace.tx_hash.as_slice())
                    .or_default()
                    .push(trace);
            }
            for list in traces_by_tx.values_mut() {
                list.sort_by_key(|t| t.trace_index);
            }
            let mut logs_by_tx: HashMap<&[u8], Vec<&RawLog>> = HashMap::new();
            for log in logs {
                logs_by_tx
                    .entry(log.tx_hash.as_slice())
                    .or_default()
                    .push(log);
            }
            for list in logs_by_tx.values_mut() {
                list.sort_by_key(|l| l.log_index);
            }

            out.blocks.push((bundle.block.height, bundle.block.timestamp));
            let mut block_tx_ids = Vec::with_capacity(txs.len());
            let mut txs_sorted: Vec<&RawAccountTransaction> = txs.iter().collect();
            txs_sorted.sort_by_key(|tx| tx.tx_index);
            for tx in txs_sorted {
                let tx_id = out.next_tx_id;
                out.next_tx_id += 1;
                block_tx_ids.push(tx_id);
                out.tx_ids.push((tx.tx_hash.clone(), tx_id));
                self.project_tx(
                    tx,
                    tx_id,
                    traces_by_tx
                        .get(tx.tx_hash.as_slice())
                        .map(|v| v.as_slice())
                        .unwrap_or(&[]),
                    logs_by_tx
                        .get(tx.tx_hash.as_slice())
                        .map(|v| v.as_slice())
                        .unwrap_or(&[]),
                    &mut out,
                );
            }
            out.block_transactions
                .push((bundle.block.height, block_tx_ids));
        }
        Ok(out)
    }
}

/// Pair sums with stable first-seen order.
#[derive(Default)]
struct OrderedPairSums {
    entries: Vec<((AddressBytes, AddressBytes), i64)>,
    index: HashMap<(AddressBytes, AddressBytes), usize>,
}

impl OrderedPairSums {
    fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, src: &[u8], dst: &[u8], value: i64) {
        let key = (src.to_vec(), dst.to_vec());
        match self.index.get(&key) {
            Some(&i) => self.entries[i].1 += value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = (&(AddressBytes, AddressBytes), i64)> {
        self.entries.iter().map(|(k, v)| (k, *v))
    }
}
