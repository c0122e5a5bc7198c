/// Delta Aggregator
///
/// Folds a projected batch into per-address and per-relation deltas,
/// resolves ids, reads the current rows once, applies the deltas (all
/// increments, no subtraction) and emits the final RowOp group in
/// deterministic order: addresses by (group, id), relations by
/// (src group, src, dst). Counters are written absolute, so replaying the
/// emitted group is idempotent.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::warn;

use crate::error::UpdateError;
use crate::id_allocator::{address_prefix, IdAllocator};
use crate::projection::ProjectedBatch;
use crate::rates::RateSheet;
use crate::transformed_store::{RelationDirection, RowOp, TransformedStore};
use crate::types::{
    AddressBytes, AddressRow, AddressTxRow, ClusterRow, Currency, CurrencyValue,
    KeyspaceConfiguration, SchemaType, SummaryStatistics, TokenConfigurationRow, TX_ID_UNSET,
};
use crate::union_find::UnionFind;

#[derive(Debug, Clone)]
pub struct BatchStats {
    pub new_addresses: usize,
    pub highest_address_id: i32,
    pub next_tx_id: i64,
    pub next_cluster_id: i32,
    pub blocks: usize,
    pub transactions: i64,
    pub last_block: i64,
    pub last_block_timestamp: i64,
}

pub struct AggregationInput<'a> {
    pub store: &'a TransformedStore,
    pub kc: &'a KeyspaceConfiguration,
    pub rates: &'a RateSheet,
    pub tokens_by_ticker: &'a HashMap<String, TokenConfigurationRow>,
    pub summary: &'a SummaryStatistics,
}

#[derive(Debug, Default)]
struct AddressDelta {
    no_incoming_txs: i32,
    no_outgoing_txs: i32,
    no_incoming_txs_zero_value: i32,
    no_outgoing_txs_zero_value: i32,
    first_tx_id: i64,
    last_tx_id: i64,
    received: CurrencyValue,
    spent: CurrencyValue,
    tokens_received: BTreeMap<String, CurrencyValue>,
    tokens_spent: BTreeMap<String, CurrencyValue>,
    balance_delta: i64,
    token_balance_deltas: BTreeMap<String, i64>,
    is_contract: bool,
    tx_rows: Vec<AddressTxRow>,
}

impl AddressDelta {
    fn new(fiat_len: usize) -> Self {
        Self {
            first_tx_id: i64::MAX,
            last_tx_id: i64::MIN,
            received: CurrencyValue::zero(fiat_len),
            spent: CurrencyValue::zero(fiat_len),
            ..Default::default()
        }
    }

    fn touch_tx(&mut self, tx_id: i64) {
        self.first_tx_id = self.first_tx_id.min(tx_id);
        self.last_tx_id = self.last_tx_id.max(tx_id);
    }
}

#[derive(Debug)]
struct RelationDelta {
    no_transactions: i32,
    value: CurrencyValue,
    token_values: BTreeMap<String, CurrencyValue>,
}

impl RelationDelta {
    fn new(fiat_len: usize) -> Self {
        Self {
            no_transactions: 0,
            value: CurrencyValue::zero(fiat_len),
            token_values: BTreeMap::new(),
        }
    }

    fn is_zero_valued(&self) -> bool {
        self.value.value == 0 && self.token_values.values().all(|v| v.value == 0)
    }
}

/// Fold one projected batch and produce the complete, ordered RowOp group
/// plus the stats the coordinator needs for the status row.
pub fn aggregate(
    input: &AggregationInput<'_>,
    projected: &ProjectedBatch,
    allocator: &mut IdAllocator,
) -> Result<(Vec<RowOp>, BatchStats), UpdateError> {
    let kc = input.kc;
    let fiat_len = kc.fiat_len();

    // Per-block fiat vectors, resolved once. A missing rate aborts the
    // batch here, before anything is written.
    let mut rates_by_height: HashMap<i64, Vec<f32>> = HashMap::new();
    for (height, timestamp) in &projected.blocks {
        let date = RateSheet::date_for_timestamp(*timestamp);
        rates_by_height.insert(*height, input.rates.vector_for_date(&date)?.to_vec());
    }

    // Id resolution in first-sighting order.
    let mut order: Vec<AddressBytes> = Vec::new();
    let mut seen: HashSet<AddressBytes> = HashSet::new();
    for flow in &projected.flows {
        if seen.insert(flow.address.clone()) {
            order.push(flow.address.clone());
        }
    }
    for rel in &projected.relations {
        for addr in [&rel.src, &rel.dst] {
            if seen.insert(addr.clone()) {
                order.push(addr.clone());
            }
        }
    }
    let assignments = allocator.allocate(input.store, &order)?;
    let id_of: HashMap<AddressBytes, i32> = assignments
        .iter()
        .map(|a| (a.address.clone(), a.address_id))
        .collect();
    let new_addresses = assignments.iter().filter(|a| a.is_new).count();

    // ---- fold address deltas ---------------------------------------------

    let mut address_deltas: HashMap<i32, AddressDelta> = HashMap::new();
    let mut address_bytes_by_id: HashMap<i32, AddressBytes> = HashMap::new();
    // (address, tx, direction) participations already counted; keeps
    // no_*_txs counting transactions, not assets.
    let mut counted: HashSet<(i32, i64, bool)> = HashSet::new();

    for flow in &projected.flows {
        let id = id_of[&flow.address];
        address_bytes_by_id.insert(id, flow.address.clone());
        let delta = address_deltas
            .entry(id)
            .or_insert_with(|| AddressDelta::new(fiat_len));
        let block_rates = &rates_by_height[&flow.block_height];
        delta.touch_tx(flow.tx_id);

        if counted.insert((id, flow.tx_id, flow.is_outgoing)) {
            if flow.is_outgoing {
                delta.no_outgoing_txs += 1;
                if flow.value == 0 {
                    delta.no_outgoing_txs_zero_value += 1;
                }
            } else {
                delta.no_incoming_txs += 1;
                if flow.value == 0 {
                    delta.no_incoming_txs_zero_value += 1;
                }
            }
        }

        match &flow.currency {
            Currency::Native => {
                if flow.is_outgoing {
                    let debit = flow.value + flow.fee;
                    delta
                        .spent
                        .add(&CurrencyValue::new(debit, input.rates.fiat(block_rates, debit)));
                    delta.balance_delta -= debit;
                } else {
                    delta.received.add(&CurrencyValue::new(
                        flow.value,
                        input.rates.fiat(block_rates, flow.value),
                    ));
                    delta.balance_delta += flow.value;
                }
                delta.tx_rows.push(AddressTxRow {
                    tx_id: flow.tx_id,
                    is_outgoing: flow.is_outgoing,
                    currency: Currency::Native,
                    value: CurrencyValue::new(
                        flow.value,
                        input.rates.fiat(block_rates, flow.value),
                    ),
                });
            }
            Currency::Token(ticker) => {
                let fiat = match input.tokens_by_ticker.get(ticker) {
                    Some(t) => input.rates.token_fiat(
                        block_rates,
                        t.decimals,
                        t.peg_usd,
                        flow.value,
                    ),
                    None => vec![0.0; fiat_len],
                };
                let cv = CurrencyValue::new(flow.value, fiat);
                let (sums, balances) = if flow.is_outgoing {
                    (&mut delta.tokens_spent, -flow.value)
                } else {
                    (&mut delta.tokens_received, flow.value)
                };
                sums.entry(ticker.clone())
                    .or_insert_with(|| CurrencyValue::zero(fiat_len))
                    .add(&cv);
                *delta.token_balance_deltas.entry(ticker.clone()).or_insert(0) += balances;
                delta.tx_rows.push(AddressTxRow {
                    tx_id: flow.tx_id,
                    is_outgoing: flow.is_outgoing,
                    currency: Currency::Token(ticker.clone()),
                    value: cv,
                });
            }
        }
        if flow.mark_contract {
            delta.is_contract = true;
        }
    }

    // ---- fold relation deltas --------------------------------------------

    let mut relation_deltas: BTreeMap<(i32, i32), RelationDelta> = BTreeMap::new();
    for rel in &projected.relations {
        let src = id_of[&rel.src];
        let dst = id_of[&rel.dst];
        let delta = relation_deltas
            .entry((src, dst))
            .or_insert_with(|| RelationDelta::new(fiat_len));
        if rel.counts_transaction {
            delta.no_transactions += 1;
        }
        let block_rates = &rates_by_height[&rel.block_height];
        match &rel.currency {
            Currency::Native => delta.value.add(&CurrencyValue::new(
                rel.value,
                input.rates.fiat(block_rates, rel.value),
            )),
            Currency::Token(ticker) => {
                let fiat = match input.tokens_by_ticker.get(ticker) {
                    Some(t) => {
                        input
                            .rates
                            .token_fiat(block_rates, t.decimals, t.peg_usd, rel.value)
                    }
                    None => vec![0.0; fiat_len],
                };
                delta
                    .token_values
                    .entry(ticker.clone())
                    .or_insert_with(|| CurrencyValue::zero(fiat_len))
                    .add(&CurrencyValue::new(rel.value, fiat));
            }
        }
    }

    // ---- read current rows, apply deltas ---------------------------------

    let mut touched_ids: Vec<i32> = address_deltas.keys().copied().collect();
    touched_ids.sort_unstable();
    let base_rows = input.store.multi_get_addresses(&touched_ids, kc)?;

    let mut rows: BTreeMap<i32, AddressRow> = BTreeMap::new();
    for (id, base) in touched_ids.iter().zip(base_rows) {
        let row = base.unwrap_or_else(|| {
            AddressRow::new(*id, address_bytes_by_id[id].clone(), fiat_len)
        });
        rows.insert(*id, row);
    }

    for (&id, delta) in &address_deltas {
        let row = rows.get_mut(&id).unwrap();
        row.no_incoming_txs += delta.no_incoming_txs;
        row.no_outgoing_txs += delta.no_outgoing_txs;
        row.no_incoming_txs_zero_value += delta.no_incoming_txs_zero_value;
        row.no_outgoing_txs_zero_value += delta.no_outgoing_txs_zero_value;
        if delta.first_tx_id != i64::MAX {
            row.first_tx_id = if row.first_tx_id == TX_ID_UNSET {
                delta.first_tx_id
            } else {
                row.first_tx_id.min(delta.first_tx_id)
            };
            row.last_tx_id = row.last_tx_id.max(delta.last_tx_id);
        }
        row.total_received.add(&delta.received);
        row.total_spent.add(&delta.spent);
        for (ticker, cv) in &delta.tokens_received {
            row.total_tokens_received
                .entry(ticker.clone())
                .or_insert_with(|| CurrencyValue::zero(fiat_len))
                .add(cv);
        }
        for (ticker, cv) in &delta.tokens_spent {
            row.total_tokens_spent
                .entry(ticker.clone())
                .or_insert_with(|| CurrencyValue::zero(fiat_len))
                .add(cv);
        }
        row.is_contract |= delta.is_contract;
    }

    // Relations: read existing outgoing rows; a missing incoming twin of
    // an existing outgoing row is a repairable divergence (it gets
    // rewritten below), logged rather than fatal.
    let mut relation_rows: BTreeMap<(i32, i32), crate::types::RelationRow> = BTreeMap::new();
    for (&(src, dst), delta) in &relation_deltas {
        let existing = input
            .store
            .get_relation(RelationDirection::Outgoing, src, dst, kc)?;
        if existing.is_some()
            && input
                .store
                .get_relation(RelationDirection::Incoming, dst, src, kc)?
                .is_none()
        {
            warn!(src, dst, "incoming relation twin missing, repairing on write");
        }
        let is_new = existing.is_none();
        let mut row =
            existing.unwrap_or_else(|| crate::types::RelationRow::new(src, dst, fiat_len));
        row.no_transactions += delta.no_transactions;
        row.value.add(&delta.value);
        for (ticker, cv) in &delta.token_values {
            row.token_values
                .entry(ticker.clone())
                .or_insert_with(|| CurrencyValue::zero(fiat_len))
                .add(cv);
        }
        relation_rows.insert((src, dst), row);

        // Degree counts distinct counterparties: increment exactly when
        // the relation row is created. A relation born zero-valued counts
        // toward the zero-value degrees and never migrates.
        if is_new {
            let zero = delta.is_zero_valued();
            if let Some(src_row) = rows.get_mut(&src) {
                if zero {
                    src_row.out_degree_zero_value += 1;
                } else {
                    src_row.out_degree += 1;
                }
            }
            if let Some(dst_row) = rows.get_mut(&dst) {
                if zero {
                    dst_row.in_degree_zero_value += 1;
                } else {
                    dst_row.in_degree += 1;
                }
            }
        }
    }

    // ---- clusters (UTXO only) --------------------------------------------

    let mut cluster_ops: Vec<RowOp> = Vec::new();
    let mut next_cluster_id = input.summary.no_clusters as i32;
    if kc.schema_type == SchemaType::Utxo && !projected.cluster_inputs.is_empty() {
        next_cluster_id = fold_clusters(
            input,
            projected,
            &id_of,
            &rows,
            &address_deltas,
            next_cluster_id,
            &mut cluster_ops,
        )?;
    }

    // ---- emit -------------------------------------------------------------

    let mut ops: Vec<RowOp> = Vec::new();

    for (height, _) in &projected.blocks {
        ops.push(RowOp::ExchangeRate {
            height: *height,
            fiat_values: rates_by_height[height].clone(),
        });
    }

    for a in &assignments {
        if a.is_new {
            ops.push(RowOp::AddressIdByPrefix {
                prefix: address_prefix(&a.address, kc.schema_type, kc.address_prefix_length),
                address: a.address.clone(),
                address_id: a.address_id,
            });
            ops.push(RowOp::AddressIdGroup {
                address_id: a.address_id,
                address: a.address.clone(),
            });
        }
    }

    if kc.schema_type == SchemaType::Account {
        for (tx_hash, tx_id) in &projected.tx_ids {
            let hex_hash = hex::encode(tx_hash);
            ops.push(RowOp::TransactionIdByPrefix {
                prefix: hex_hash.chars().take(kc.tx_prefix_length).collect(),
                tx_hash: tx_hash.clone(),
                tx_id: *tx_id,
            });
            ops.push(RowOp::TransactionIdGroup {
                tx_id: *tx_id,
                tx_hash: tx_hash.clone(),
            });
        }
    }

    for (height, tx_ids) in &projected.block_transactions {
        ops.push(RowOp::BlockTransactions {
            height: *height,
            tx_ids: tx_ids.clone(),
        });
    }

    // Address rows in (group, id) order; BTreeMap iteration provides it.
    for row in rows.values() {
        ops.push(RowOp::Address(row.clone()));
    }

    // Per-address transaction lists plus secondary-shard bookkeeping.
    for &id in &touched_ids {
        let delta = &address_deltas[&id];
        if delta.tx_rows.is_empty() {
            continue;
        }
        let mut max_secondary = -1i32;
        for tx_row in &delta.tx_rows {
            max_secondary = max_secondary.max(crate::keys::secondary_id(
                tx_row.tx_id,
                kc.relation_secondary_bucket_size,
            ));
            ops.push(RowOp::AddressTransaction {
                address_id: id,
                row: tx_row.clone(),
            });
        }
        let existing =
            input
                .store
                .get_secondary_ids("address_transactions_secondary_ids", id, kc)?;
        let num = existing.max(max_secondary + 1);
        if num != existing {
            ops.push(RowOp::AddressTxSecondaryIds {
                address_id: id,
                num_secondary_ids: num,
            });
        }
    }

    // Relations, both directions, plus their secondary tables.
    let mut out_secondary: BTreeMap<i32, i32> = BTreeMap::new();
    let mut in_secondary: BTreeMap<i32, i32> = BTreeMap::new();
    for (&(src, dst), row) in &relation_rows {
        ops.push(RowOp::OutgoingRelation(row.clone()));
        ops.push(RowOp::IncomingRelation(row.clone()));
        let sec_out = crate::keys::secondary_id(dst as i64, kc.relation_secondary_bucket_size);
        let sec_in = crate::keys::secondary_id(src as i64, kc.relation_secondary_bucket_size);
        out_secondary
            .entry(src)
            .and_modify(|m| *m = (*m).max(sec_out))
            .or_insert(sec_out);
        in_secondary
            .entry(dst)
            .and_modify(|m| *m = (*m).max(sec_in))
            .or_insert(sec_in);
    }
    for (&id, &max_sec) in &out_secondary {
        let existing = input.store.get_secondary_ids(
            RelationDirection::Outgoing.secondary_cf_name(),
            id,
            kc,
        )?;
        let num = existing.max(max_sec + 1);
        if num != existing {
            ops.push(RowOp::OutgoingRelationSecondaryIds {
                address_id: id,
                num_secondary_ids: num,
            });
        }
    }
    for (&id, &max_sec) in &in_secondary {
        let existing = input.store.get_secondary_ids(
            RelationDirection::Incoming.secondary_cf_name(),
            id,
            kc,
        )?;
        let num = existing.max(max_sec + 1);
        if num != existing {
            ops.push(RowOp::IncomingRelationSecondaryIds {
                address_id: id,
                num_secondary_ids: num,
            });
        }
    }

    // Balances, absolute (current + delta).
    for &id in &touched_ids {
        let delta = &address_deltas[&id];
        if delta.balance_delta != 0 {
            let current = input.store.get_balance(id, &Currency::Native, kc)?;
            ops.push(RowOp::Balance {
                address_id: id,
                currency: Currency::Native,
                value: current + delta.balance_delta,
            });
        }
        for (ticker, token_delta) in &delta.token_balance_deltas {
            if *token_delta == 0 {
                continue;
            }
            let currency = Currency::Token(ticker.clone());
            let current = input.store.get_balance(id, &currency, kc)?;
            ops.push(RowOp::Balance {
                address_id: id,
                currency,
                value: current + token_delta,
            });
        }
    }

    ops.extend(cluster_ops);

    let stats = BatchStats {
        new_addresses,
        highest_address_id: allocator.highest_id(),
        next_tx_id: projected.next_tx_id,
        next_cluster_id,
        blocks: projected.blocks.len(),
        transactions: projected.tx_count(),
        last_block: projected.blocks.last().map(|(h, _)| *h).unwrap_or(-1),
        last_block_timestamp: projected.blocks.last().map(|(_, t)| *t).unwrap_or(0),
    };

    let summary = SummaryStatistics {
        no_blocks: input.summary.no_blocks + stats.blocks as i64,
        no_transactions: stats.next_tx_id,
        no_addresses: (stats.highest_address_id + 1) as i64,
        no_clusters: stats.next_cluster_id as i64,
        timestamp: stats.last_block_timestamp,
    };
    ops.push(RowOp::SummaryStatistics(summary));

    Ok((ops, stats))
}

/// Union co-spent address sets into cluster assignments and aggregate
/// updates. Returns the next free cluster id.
///
/// Components that touch the same pre-existing cluster are merged
/// transitively first; within a merged component the lowest existing
/// cluster id wins, losers keep a tombstone row pointing at the winner.
fn fold_clusters(
    input: &AggregationInput<'_>,
    projected: &ProjectedBatch,
    id_of: &HashMap<AddressBytes, i32>,
    rows: &BTreeMap<i32, AddressRow>,
    address_deltas: &HashMap<i32, AddressDelta>,
    mut next_cluster_id: i32,
    ops: &mut Vec<RowOp>,
) -> Result<i32, UpdateError> {
    let kc = input.kc;
    let fiat_len = kc.fiat_len();

    // Compact batch-local indices.
    let mut local_of: HashMap<i32, u32> = HashMap::new();
    let mut id_of_local: Vec<i32> = Vec::new();
    for group in &projected.cluster_inputs {
        for addr in group {
            let id = id_of[addr];
            local_of.entry(id).or_insert_with(|| {
                id_of_local.push(id);
                (id_of_local.len() - 1) as u32
            });
        }
    }

    let mut uf = UnionFind::new(id_of_local.len());
    for group in &projected.cluster_inputs {
        let locals: Vec<u32> = group.iter().map(|a| local_of[&id_of[a]]).collect();
        for pair in locals.windows(2) {
            uf.union(pair[0], pair[1]);
        }
    }
    let components = uf.components();

    // Existing cluster pointers per member.
    let mut pointer_of: HashMap<i32, Option<i32>> = HashMap::new();
    for &id in &id_of_local {
        pointer_of.insert(id, input.store.get_address_cluster(id, kc)?);
    }

    // Components sharing an existing cluster must merge transitively.
    let mut comp_uf = UnionFind::new(components.len());
    let mut comp_by_cluster: HashMap<i32, u32> = HashMap::new();
    for (ci, members) in components.iter().enumerate() {
        for &local in members {
            if let Some(cluster) = pointer_of[&id_of_local[local as usize]] {
                match comp_by_cluster.get(&cluster) {
                    Some(&other) => comp_uf.union(ci as u32, other),
                    None => {
                        comp_by_cluster.insert(cluster, ci as u32);
                    }
                }
            }
        }
    }
    let mut merged: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for (ci, members) in components.iter().enumerate() {
        let root = comp_uf.find(ci as u32);
        merged.entry(root).or_default().extend(members.iter().copied());
    }

    for (_, locals) in merged {
        let mut member_ids: BTreeSet<i32> =
            locals.iter().map(|l| id_of_local[*l as usize]).collect();
        let mut existing: BTreeSet<i32> = member_ids
            .iter()
            .filter_map(|id| pointer_of[id])
            .collect();

        let (target, target_is_new) = match existing.iter().next() {
            Some(&lowest) => (lowest, false),
            None => {
                let id = next_cluster_id;
                next_cluster_id += 1;
                (id, true)
            }
        };
        existing.remove(&target);
        let losers = existing;

        // All members: the component plus everything already in the
        // target and the losing clusters.
        let prior_target_members: Vec<i32> = if target_is_new {
            Vec::new()
        } else {
            input.store.get_cluster_addresses(target, kc)?
        };
        let mut loser_members: Vec<i32> = Vec::new();
        for &loser in &losers {
            loser_members.extend(input.store.get_cluster_addresses(loser, kc)?);
        }

        let is_merge = !losers.is_empty();
        let prior_set: BTreeSet<i32> = prior_target_members.iter().copied().collect();
        member_ids.extend(loser_members.iter().copied());

        let mut cluster = if is_merge {
            // Full recomputation from member address rows.
            let mut c = ClusterRow::new(target, fiat_len);
            let mut all: BTreeSet<i32> = member_ids.iter().copied().collect();
            all.extend(prior_set.iter().copied());
            for &member in &all {
                let row = match rows.get(&member) {
                    Some(r) => r.clone(),
                    None => match input.store.get_address(member, kc)? {
                        Some(r) => r,
                        None => {
                            warn!(member, "cluster member without address row, skipping");
                            continue;
                        }
                    },
                };
                add_row_to_cluster(&mut c, &row);
            }
            c.no_addresses = all.len() as i32;
            member_ids = all;
            c
        } else {
            let mut c = input
                .store
                .get_cluster(target, kc)?
                .unwrap_or_else(|| ClusterRow::new(target, fiat_len));
            // Newly joining members contribute their whole row; members
            // already in the cluster contribute this batch's delta.
            let mut all: BTreeSet<i32> = member_ids.iter().copied().collect();
            all.extend(prior_set.iter().copied());
            for &member in &member_ids {
                if prior_set.contains(&member) {
                    if let Some(delta) = address_deltas.get(&member) {
                        add_delta_to_cluster(&mut c, delta);
                    }
                } else if let Some(row) = rows.get(&member) {
                    add_row_to_cluster(&mut c, row);
                }
            }
            c.no_addresses = all.len() as i32;
            member_ids = all;
            c
        };
        cluster.merged_into = None;

        ops.push(RowOp::Cluster(cluster));
        for &loser in &losers {
            let mut tombstone = ClusterRow::new(loser, fiat_len);
            tombstone.merged_into = Some(target);
            ops.push(RowOp::Cluster(tombstone));
        }
        // Re-point every member not already recorded under the target:
        // fresh joiners and everything absorbed from losing clusters.
        for &member in &member_ids {
            if !prior_set.contains(&member) {
                ops.push(RowOp::ClusterAddress {
                    cluster_id: target,
                    address_id: member,
                });
                ops.push(RowOp::AddressCluster {
                    address_id: member,
                    cluster_id: target,
                });
            }
        }
    }

    Ok(next_cluster_id)
}

fn add_row_to_cluster(cluster: &mut ClusterRow, row: &AddressRow) {
    cluster.no_incoming_txs += row.no_incoming_txs;
    cluster.no_outgoing_txs += row.no_outgoing_txs;
    if row.first_tx_id != TX_ID_UNSET {
        cluster.first_tx_id = if cluster.first_tx_id == TX_ID_UNSET {
            row.first_tx_id
        } else {
            cluster.first_tx_id.min(row.first_tx_id)
        };
        cluster.last_tx_id = cluster.last_tx_id.max(row.last_tx_id);
    }
    cluster.total_received.add(&row.total_received);
    cluster.total_spent.add(&row.total_spent);
}

fn add_delta_to_cluster(cluster: &mut ClusterRow, delta: &AddressDelta) {
    cluster.no_incoming_txs += delta.no_incoming_txs;
    cluster.no_outgoing_txs += delta.no_outgoing_txs;
    if delta.first_tx_id != i64::MAX {
        cluster.first_tx_id = if cluster.first_tx_id == TX_ID_UNSET {
            delta.first_tx_id
        } else {
            cluster.first_tx_id.min(delta.first_tx_id)
        };
        cluster.last_tx_id = cluster.last_tx_id.max(delta.last_tx_id);
    }
    cluster.total_received.add(&delta.received);
    cluster.total_spent.add(&delta.spent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::{Flow, RelationFlow};
    use crate::rates::RateSheet;
    use crate::raw_store::fixtures::RawFixture;
    use crate::raw_store::RawStore;
    use crate::schema::open_transformed;
    use crate::write_batcher::RetryPolicy;
    use tempfile::TempDir;

    fn test_kc(schema: SchemaType) -> KeyspaceConfiguration {
        KeyspaceConfiguration {
            schema_type: schema,
            address_bucket_size: 10_000,
            tx_bucket_size: 10_000,
            block_bucket_size: 100_000,
            relation_secondary_bucket_size: 4,
            address_prefix_length: 5,
            tx_prefix_length: 5,
            fiat_currencies: vec!["USD".into(), "EUR".into()],
            decimals: 8,
        }
    }

    struct Fixture {
        store: TransformedStore,
        raw: RawStore,
        kc: KeyspaceConfiguration,
        _dirs: (TempDir, TempDir),
    }

    fn fixture(schema: SchemaType) -> Fixture {
        let raw_dir = TempDir::new().unwrap();
        let transformed_dir = TempDir::new().unwrap();
        let fx = RawFixture::open(raw_dir.path());
        let mut m = std::collections::BTreeMap::new();
        m.insert("USD".to_string(), 10.0f32);
        m.insert("EUR".to_string(), 9.0f32);
        fx.put_rate("2020-09-13", &m);
        let raw = RawStore::new(fx.db, schema);
        let db = open_transformed(transformed_dir.path()).unwrap();
        let store = TransformedStore::new(db, "t".into(), 1000, RetryPolicy::default());
        Fixture {
            store,
            raw,
            kc: test_kc(schema),
            _dirs: (raw_dir, transformed_dir),
        }
    }

    fn flow(tx_id: i64, address: &[u8], outgoing: bool, value: i64) -> Flow {
        Flow {
            tx_id,
            block_height: 0,
            address: address.to_vec(),
            currency: Currency::Native,
            is_outgoing: outgoing,
            value,
            fee: 0,
            mark_contract: false,
        }
    }

    fn relation(tx_id: i64, src: &[u8], dst: &[u8], value: i64) -> RelationFlow {
        RelationFlow {
            tx_id,
            block_height: 0,
            src: src.to_vec(),
            dst: dst.to_vec(),
            currency: Currency::Native,
            value,
            counts_transaction: true,
        }
    }

    fn projected(flows: Vec<Flow>, relations: Vec<RelationFlow>, next_tx: i64) -> ProjectedBatch {
        ProjectedBatch {
            flows,
            relations,
            cluster_inputs: vec![],
            blocks: vec![(0, 1_600_000_000)],
            block_transactions: vec![(0, (0..next_tx).collect())],
            tx_ids: vec![],
            first_tx_id: 0,
            next_tx_id: next_tx,
        }
    }

    async fn run(
        fx: &Fixture,
        batch: &ProjectedBatch,
        allocator: &mut IdAllocator,
    ) -> BatchStats {
        let rates = RateSheet::build(&fx.raw, &fx.kc, false).unwrap();
        let tokens = HashMap::new();
        let summary = fx.store.get_summary_statistics().unwrap();
        let input = AggregationInput {
            store: &fx.store,
            kc: &fx.kc,
            rates: &rates,
            tokens_by_ticker: &tokens,
            summary: &summary,
        };
        let (ops, stats) = aggregate(&input, batch, allocator).unwrap();
        fx.store.batch_write(ops, &fx.kc).await.unwrap();
        stats
    }

    #[tokio::test]
    async fn test_fold_accumulates_across_batches() {
        let fx = fixture(SchemaType::Utxo);
        let mut allocator = IdAllocator::new(-1, SchemaType::Utxo, 5);

        let batch1 = projected(
            vec![flow(0, b"A", false, 30), flow(1, b"A", false, 20)],
            vec![],
            2,
        );
        run(&fx, &batch1, &mut allocator).await;

        let batch2 = projected(vec![flow(2, b"A", true, 50)], vec![], 1);
        let stats = run(&fx, &batch2, &mut allocator).await;

        let a = fx.store.get_address(0, &fx.kc).unwrap().unwrap();
        assert_eq!(a.no_incoming_txs, 2);
        assert_eq!(a.no_outgoing_txs, 1);
        assert_eq!(a.total_received.value, 50);
        assert_eq!(a.total_spent.value, 50);
        assert_eq!(a.first_tx_id, 0);
        assert_eq!(a.last_tx_id, 2);
        assert_eq!(stats.new_addresses, 0);

        // balance nets out to zero; zero-balance rows are still written
        // absolute once the address has moved funds
        assert_eq!(
            fx.store.get_balance(0, &Currency::Native, &fx.kc).unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_emitted_ops_are_deterministic() {
        let fx = fixture(SchemaType::Utxo);
        let batch = projected(
            vec![
                flow(0, b"B", true, 10),
                flow(0, b"A", false, 4),
                flow(0, b"C", false, 5),
            ],
            vec![relation(0, b"B", b"A", 4), relation(0, b"B", b"C", 5)],
            1,
        );

        let encode_all = |ops: &[RowOp]| -> Vec<(String, Vec<u8>, Vec<u8>)> {
            let mut writes: Vec<(String, Vec<u8>, Vec<u8>)> = ops
                .iter()
                .map(|op| {
                    let w = op.encode(&fx.kc).unwrap();
                    match w {
                        crate::write_batcher::WriteOp::Put { cf_name, key, value } => {
                            (cf_name.to_string(), key, value)
                        }
                        crate::write_batcher::WriteOp::Delete { cf_name, key } => {
                            (cf_name.to_string(), key, vec![])
                        }
                    }
                })
                .collect();
            writes.sort();
            writes
        };

        let rates = RateSheet::build(&fx.raw, &fx.kc, false).unwrap();
        let tokens = HashMap::new();
        let summary = fx.store.get_summary_statistics().unwrap();
        let input = AggregationInput {
            store: &fx.store,
            kc: &fx.kc,
            rates: &rates,
            tokens_by_ticker: &tokens,
            summary: &summary,
        };
        let (ops1, _) = aggregate(&input, &batch, &mut IdAllocator::new(-1, SchemaType::Utxo, 5))
            .unwrap();
        let (ops2, _) = aggregate(&input, &batch, &mut IdAllocator::new(-1, SchemaType::Utxo, 5))
            .unwrap();
        assert_eq!(encode_all(&ops1), encode_all(&ops2));
    }

    #[tokio::test]
    async fn test_degree_counts_only_new_relations() {
        let fx = fixture(SchemaType::Utxo);
        let mut allocator = IdAllocator::new(-1, SchemaType::Utxo, 5);

        let batch1 = projected(
            vec![flow(0, b"A", true, 10), flow(0, b"B", false, 10)],
            vec![relation(0, b"A", b"B", 10)],
            1,
        );
        run(&fx, &batch1, &mut allocator).await;

        // second batch over the same pair must not bump degrees again
        let batch2 = projected(
            vec![flow(1, b"A", true, 5), flow(1, b"B", false, 5)],
            vec![relation(1, b"A", b"B", 5)],
            1,
        );
        run(&fx, &batch2, &mut allocator).await;

        let a = fx.store.get_address(0, &fx.kc).unwrap().unwrap();
        let b = fx.store.get_address(1, &fx.kc).unwrap().unwrap();
        assert_eq!(a.out_degree, 1);
        assert_eq!(b.in_degree, 1);

        let rel = fx
            .store
            .get_relation(RelationDirection::Outgoing, 0, 1, &fx.kc)
            .unwrap()
            .unwrap();
        assert_eq!(rel.no_transactions, 2);
        assert_eq!(rel.value.value, 15);
    }

    #[tokio::test]
    async fn test_zero_valued_relation_feeds_zero_degrees_and_never_migrates() {
        let fx = fixture(SchemaType::Utxo);
        let mut allocator = IdAllocator::new(-1, SchemaType::Utxo, 5);

        let batch1 = projected(
            vec![flow(0, b"A", true, 0), flow(0, b"B", false, 0)],
            vec![relation(0, b"A", b"B", 0)],
            1,
        );
        run(&fx, &batch1, &mut allocator).await;

        let a = fx.store.get_address(0, &fx.kc).unwrap().unwrap();
        assert_eq!(a.out_degree, 0);
        assert_eq!(a.out_degree_zero_value, 1);
        assert_eq!(a.no_outgoing_txs_zero_value, 1);

        // the relation later gains value; the degree stays where it was
        let batch2 = projected(
            vec![flow(1, b"A", true, 7), flow(1, b"B", false, 7)],
            vec![relation(1, b"A", b"B", 7)],
            1,
        );
        run(&fx, &batch2, &mut allocator).await;

        let a = fx.store.get_address(0, &fx.kc).unwrap().unwrap();
        assert_eq!(a.out_degree, 0);
        assert_eq!(a.out_degree_zero_value, 1);
    }

    #[tokio::test]
    async fn test_secondary_ids_track_shard_high_water() {
        let fx = fixture(SchemaType::Utxo);
        let mut allocator = IdAllocator::new(-1, SchemaType::Utxo, 5);

        // enough txs for one address to hit several of the 4 shards
        let flows: Vec<Flow> = (0..12).map(|i| flow(i, b"A", false, 1)).collect();
        let batch = projected(flows, vec![], 12);
        run(&fx, &batch, &mut allocator).await;

        let num = fx
            .store
            .get_secondary_ids("address_transactions_secondary_ids", 0, &fx.kc)
            .unwrap();
        let max_shard = (0..12)
            .map(|i| crate::keys::secondary_id(i, 4))
            .max()
            .unwrap();
        assert_eq!(num, max_shard + 1);
        assert_eq!(fx.store.count_rows("address_transactions").unwrap(), 12);
    }
}
