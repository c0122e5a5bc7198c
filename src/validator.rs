/// Validator
///
/// Independent cross-check of the transformed keyspace: re-derives
/// address aggregates from the raw range [0, H] for a deterministic
/// sample of addresses and compares them to the stored rows, then
/// spot-checks relation symmetry. The re-derivation does not reuse the
/// aggregator's fold.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::error::UpdateError;
use crate::id_allocator::address_prefix;
use crate::keys::mix64;
use crate::projection::{ProjectedBatch, Projector};
use crate::raw_store::RawStore;
use crate::status;
use crate::transformed_store::{RelationDirection, TransformedStore};
use crate::types::{AddressBytes, Currency, KeyspaceConfiguration, SchemaType};
use crate::utxo_projector::UtxoProjector;
use crate::account_projector::AccountProjector;

#[derive(Debug, Clone)]
pub struct Divergence {
    pub address: String,
    pub field: &'static str,
    pub expected: String,
    pub got: String,
}

impl Divergence {
    pub fn into_error(self) -> UpdateError {
        UpdateError::Divergence {
            address: format!("{} ({})", self.address, self.field),
            expected: self.expected,
            got: self.got,
        }
    }
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub checked_addresses: usize,
    pub checked_relations: usize,
    pub divergences: Vec<Divergence>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.divergences.is_empty()
    }
}

#[derive(Debug, Default, PartialEq)]
struct ExpectedAddress {
    no_incoming_txs: i32,
    no_outgoing_txs: i32,
    no_incoming_txs_zero_value: i32,
    no_outgoing_txs_zero_value: i32,
    total_received: i64,
    total_spent: i64,
    first_tx_id: i64,
    last_tx_id: i64,
}

#[derive(Debug, Default, PartialEq)]
struct ExpectedRelation {
    no_transactions: i32,
    value: i64,
}

pub struct Validator<'a> {
    pub raw: &'a RawStore,
    pub store: &'a TransformedStore,
    pub kc: &'a KeyspaceConfiguration,
    pub nonstandard_address: String,
    pub sample_size: usize,
}

impl<'a> Validator<'a> {
    /// Re-derive and compare. Store errors abort; divergences accumulate
    /// in the report for the caller to escalate (pedantic) or log.
    pub fn run(&self) -> Result<ValidationReport, UpdateError> {
        let mut report = ValidationReport::default();

        let h = status::last_synced_block(self.store)?;
        if h < 0 {
            return Ok(report);
        }

        let bundles = self.raw.fetch_range(0, h)?;
        let projected = match self.kc.schema_type {
            SchemaType::Utxo => {
                UtxoProjector::new(&self.nonstandard_address).project(&bundles, 0)?
            }
            SchemaType::Account => {
                AccountProjector::new(self.store.get_token_configurations()?)
                    .project(&bundles, 0)?
            }
        };

        let (expected_addresses, expected_relations) = self.fold_expected(&projected);

        // Deterministic sample, keyed on the address bytes and H so the
        // sample rotates as the keyspace advances.
        let mut sampled: Vec<&AddressBytes> = expected_addresses.keys().collect();
        sampled.sort_by_key(|a| mix64(hash_bytes(a) ^ h as u64));
        sampled.truncate(self.sample_size);

        for address in &sampled {
            self.check_address(address, &expected_addresses[*address], &mut report)?;
        }
        report.checked_addresses = sampled.len();

        // Relation symmetry spot-check over pairs touching the sample.
        let sample_set: HashSet<&AddressBytes> = sampled.iter().copied().collect();
        for ((src, dst), expected) in &expected_relations {
            if !sample_set.contains(src) && !sample_set.contains(dst) {
                continue;
            }
            self.check_relation(src, dst, expected, &mut report)?;
            report.checked_relations += 1;
        }

        if report.is_clean() {
            info!(
                addresses = report.checked_addresses,
                relations = report.checked_relations,
                "validation clean"
            );
        } else {
            warn!(
                divergences = report.divergences.len(),
                "validation found divergences"
            );
        }
        crate::metrics::DIVERGENCES_FOUND.set(report.divergences.len() as i64);
        Ok(report)
    }

    /// Independent fold of the projection into expected aggregates,
    /// mirroring the documented counting rules.
    fn fold_expected(
        &self,
        projected: &ProjectedBatch,
    ) -> (
        HashMap<AddressBytes, ExpectedAddress>,
        HashMap<(AddressBytes, AddressBytes), ExpectedRelation>,
    ) {
        let mut addresses: HashMap<AddressBytes, ExpectedAddress> = HashMap::new();
        let mut counted: HashSet<(AddressBytes, i64, bool)> = HashSet::new();
        for flow in &projected.flows {
            let e = addresses.entry(flow.address.clone()).or_insert_with(|| {
                ExpectedAddress {
                    first_tx_id: i64::MAX,
                    last_tx_id: i64::MIN,
                    ..Default::default()
                }
            });
            e.first_tx_id = e.first_tx_id.min(flow.tx_id);
            e.last_tx_id = e.last_tx_id.max(flow.tx_id);
            if counted.insert((flow.address.clone(), flow.tx_id, flow.is_outgoing)) {
                if flow.is_outgoing {
                    e.no_outgoing_txs += 1;
                    if flow.value == 0 {
                        e.no_outgoing_txs_zero_value += 1;
                    }
                } else {
                    e.no_incoming_txs += 1;
                    if flow.value == 0 {
                        e.no_incoming_txs_zero_value += 1;
                    }
                }
            }
            if flow.currency == Currency::Native {
                if flow.is_outgoing {
                    e.total_spent += flow.value + flow.fee;
                } else {
                    e.total_received += flow.value;
                }
            }
        }

        let mut relations: HashMap<(AddressBytes, AddressBytes), ExpectedRelation> =
            HashMap::new();
        for rel in &projected.relations {
            let e = relations
                .entry((rel.src.clone(), rel.dst.clone()))
                .or_default();
            if rel.counts_transaction {
                e.no_transactions += 1;
            }
            if rel.currency == Currency::Native {
                e.value += rel.value;
            }
        }
        (addresses, relations)
    }

    fn check_address(
        &self,
        address: &[u8],
        expected: &ExpectedAddress,
        report: &mut ValidationReport,
    ) -> Result<(), UpdateError> {
        let text = crate::types::textual_address(address, self.kc.schema_type);
        let prefix = address_prefix(address, self.kc.schema_type, self.kc.address_prefix_length);
        let Some(id) = self.store.get_address_id(&prefix, address)? else {
            report.divergences.push(Divergence {
                address: text,
                field: "address_id",
                expected: "assigned".into(),
                got: "missing".into(),
            });
            return Ok(());
        };
        let Some(row) = self.store.get_address(id, self.kc)? else {
            report.divergences.push(Divergence {
                address: text,
                field: "address_row",
                expected: "present".into(),
                got: "missing".into(),
            });
            return Ok(());
        };

        let checks: [(&'static str, i64, i64); 8] = [
            ("no_incoming_txs", expected.no_incoming_txs as i64, row.no_incoming_txs as i64),
            ("no_outgoing_txs", expected.no_outgoing_txs as i64, row.no_outgoing_txs as i64),
            (
                "no_incoming_txs_zero_value",
                expected.no_incoming_txs_zero_value as i64,
                row.no_incoming_txs_zero_value as i64,
            ),
            (
                "no_outgoing_txs_zero_value",
                expected.no_outgoing_txs_zero_value as i64,
                row.no_outgoing_txs_zero_value as i64,
            ),
            ("total_received", expected.total_received, row.total_received.value),
            ("total_spent", expected.total_spent, row.total_spent.value),
            ("first_tx_id", expected.first_tx_id, row.first_tx_id),
            ("last_tx_id", expected.last_tx_id, row.last_tx_id),
        ];
        for (field, want, got) in checks {
            if want != got {
                report.divergences.push(Divergence {
                    address: text.clone(),
                    field,
                    expected: want.to_string(),
                    got: got.to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_relation(
        &self,
        src: &[u8],
        dst: &[u8],
        expected: &ExpectedRelation,
        report: &mut ValidationReport,
    ) -> Result<(), UpdateError> {
        let label = format!(
            "{}->{}",
            crate::types::textual_address(src, self.kc.schema_type),
            crate::types::textual_address(dst, self.kc.schema_type)
        );
        let src_prefix = address_prefix(src, self.kc.schema_type, self.kc.address_prefix_length);
        let dst_prefix = address_prefix(dst, self.kc.schema_type, self.kc.address_prefix_length);
        let (Some(src_id), Some(dst_id)) = (
            self.store.get_address_id(&src_prefix, src)?,
            self.store.get_address_id(&dst_prefix, dst)?,
        ) else {
            report.divergences.push(Divergence {
                address: label,
                field: "relation_ids",
                expected: "assigned".into(),
                got: "missing".into(),
            });
            return Ok(());
        };

        let outgoing = self
            .store
            .get_relation(RelationDirection::Outgoing, src_id, dst_id, self.kc)?;
        let incoming = self
            .store
            .get_relation(RelationDirection::Incoming, dst_id, src_id, self.kc)?;

        match (&outgoing, &incoming) {
            (Some(o), Some(i)) => {
                if o != i {
                    report.divergences.push(Divergence {
                        address: label.clone(),
                        field: "relation_symmetry",
                        expected: format!("{:?}", o),
                        got: format!("{:?}", i),
                    });
                }
                if o.no_transactions != expected.no_transactions {
                    report.divergences.push(Divergence {
                        address: label.clone(),
                        field: "relation_no_transactions",
                        expected: expected.no_transactions.to_string(),
                        got: o.no_transactions.to_string(),
                    });
                }
                if o.value.value != expected.value {
                    report.divergences.push(Divergence {
                        address: label,
                        field: "relation_value",
                        expected: expected.value.to_string(),
                        got: o.value.value.to_string(),
                    });
                }
            }
            _ => {
                report.divergences.push(Divergence {
                    address: label,
                    field: "relation_row",
                    expected: "both directions present".into(),
                    got: format!(
                        "outgoing: {}, incoming: {}",
                        outgoing.is_some(),
                        incoming.is_some()
                    ),
                });
            }
        }
        Ok(())
    }
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut acc = 0xcbf2_9ce4_8422_2325u64;
    for b in bytes {
        acc ^= *b as u64;
        acc = acc.wrapping_mul(0x1000_0000_01b3);
    }
    acc
}
