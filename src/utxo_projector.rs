/// UTXO Projector
///
/// Converts raw UTXO blocks into address-level flows, relation events and
/// cluster inputs.
///
/// RULES:
/// - Coinbase inputs are a single synthetic "coinbase" pseudo-address
///   spending the block subsidy; coinbase txs emit no relations and never
///   cluster.
/// - Outputs resolving to zero addresses are booked under the configured
///   non-standard sentinel (shielded inputs land there too).
/// - Multi-address outputs (bare multisig) credit each listed address
///   with the full output value.
/// - Relations split each output's value across inputs proportionally to
///   input value (integer floor), inputs in index-ascending order.
/// - Zero-value participations keep their flows and relation units but
///   carry no value.

use crate::error::UpdateError;
use crate::projection::{Flow, OrderedSums, ProjectedBatch, Projector, RelationFlow};
use crate::types::{
    AddressBytes, BlockBundle, BundleTxs, Currency, RawUtxoTransaction, COINBASE_ADDRESS,
};

pub struct UtxoProjector {
    nonstandard_address: AddressBytes,
}

impl UtxoProjector {
    pub fn new(nonstandard_address: &str) -> Self {
        Self {
            nonstandard_address: nonstandard_address.as_bytes().to_vec(),
        }
    }

    /// Addresses of one input/output slot; the sentinel stands in when
    /// the script resolved to nothing.
    fn resolve<'a>(&'a self, addresses: &'a [String]) -> Vec<&'a [u8]> {
        if addresses.is_empty() {
            vec![&self.nonstandard_address]
        } else {
            addresses.iter().map(|a| a.as_bytes()).collect()
        }
    }

    fn project_tx(&self, tx: &RawUtxoTransaction, tx_id: i64, out: &mut ProjectedBatch) {
        let height = tx.block_height;

        // Per-address sums, preserving (input position, output position)
        // first-sighting order.
        let mut spent = OrderedSums::new();
        if tx.coinbase {
            spent.add(COINBASE_ADDRESS, tx.total_output());
        } else {
            for input in &tx.inputs {
                for addr in self.resolve(&input.addresses) {
                    spent.add(addr, input.value);
                }
            }
        }
        let mut received = OrderedSums::new();
        for output in &tx.outputs {
            for addr in self.resolve(&output.addresses) {
                received.add(addr, output.value);
            }
        }

        for (address, value) in spent.iter() {
            out.flows.push(Flow {
                tx_id,
                block_height: height,
                address: address.clone(),
                currency: Currency::Native,
                is_outgoing: true,
                value,
                fee: 0,
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
                mark_contract: false,
            });
        }

        if tx.coinbase {
            return;
        }

        // Relations: every (input, output) address pair with distinct
        // endpoints gets one tx unit; value = output value weighted by
        // the input's share of the total, floor division.
        let total_in = spent.total();
        for (src, src_value) in spent.iter() {
            for (dst, dst_value) in received.iter() {
                if src == dst {
                    continue;
                }
                let value = if total_in > 0 {
                    ((dst_value as i128 * src_value as i128) / total_in as i128) as i64
                } else {
                    0
                };
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
        }

        // Cluster input: distinct spending addresses, sentinel excluded.
        let co_spent: Vec<AddressBytes> = spent
            .iter()
            .map(|(a, _)| a.clone())
            .filter(|a| a != &self.nonstandard_address)
            .collect();
        if !co_spent.is_empty() {
            out.cluster_inputs.push(co_spent);
        }
    }
}

impl Projector for UtxoProjector {
    fn project(
        &self,
        bundles: &[BlockBundle],
        first_tx_id: i64,
    ) -> Result<ProjectedBatch, UpdateError> {
        let mut out = ProjectedBatch::new(first_tx_id);
        for bundle in bundles {
            let txs = match &bundle.txs {
                BundleTxs::Utxo(txs) => txs,
                BundleTxs::Account { .. } => {
                    return Err(UpdateError::corrupt(
                        "account bundle handed to the UTXO projector",
                    ))
                }
            };
            out.blocks.push((bundle.block.height, bundle.block.timestamp));
            let mut block_tx_ids = Vec::with_capacity(txs.len());
            let mut txs_sorted: Vec<&RawUtxoTransaction> = txs.iter().collect();
            txs_sorted.sort_by_key(|tx| tx.tx_index);
            for tx in txs_sorted {
                let tx_id = out.next_tx_id;
                out.next_tx_id += 1;
                block_tx_ids.push(tx_id);
                out.tx_ids.push((tx.tx_hash.clone(), tx_id));
                self.project_tx(tx, tx_id, &mut out);
            }
            out.block_transactions
                .push((bundle.block.height, block_tx_ids));
        }
        Ok(out)
    }
}
