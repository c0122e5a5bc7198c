//! End-to-end batch scenarios for the coordinator, driving real raw and
//! transformed keyspaces on disk through whole update runs: catch-up,
//! UTXO and account projections, rate forward-fill, and crash recovery
//! via the pending-batch journal.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tempfile::TempDir;

use crate::config::CurrencyConfig;
use crate::coordinator::{Coordinator, UpdateOptions};
use crate::error::UpdateError;
use crate::id_allocator::IdAllocator;
use crate::aggregator::{aggregate, AggregationInput};
use crate::projection::Projector;
use crate::rates::RateSheet;
use crate::raw_store::fixtures::RawFixture;
use crate::raw_store::RawStore;
use crate::schema::{open_raw, open_transformed, TRANSFORMED_COLUMN_FAMILIES};
use crate::status;
use crate::transformed_store::{PendingBatch, RelationDirection, TransformedStore};
use crate::types::{
    Currency, RawAccountTransaction, RawBlock, RawUtxoTransaction, SchemaType, TxInputOutput,
};
use crate::utxo_projector::UtxoProjector;
use crate::write_batcher::RetryPolicy;

const DAY: i64 = 86_400;
const T0: i64 = 1_600_000_000; // 2020-09-13 UTC

fn currency_cfg(schema: SchemaType, raw: &Path, transformed: &Path) -> CurrencyConfig {
    CurrencyConfig {
        schema_type: schema,
        raw_path: raw.display().to_string(),
        transformed_path: transformed.display().to_string(),
        lock_dir: None,
        batch_size: 10,
        safety_margin: 0,
        write_batch_size: 1000,
        forward_fill_rates: false,
        address_bucket_size: 10_000,
        tx_bucket_size: 10_000,
        block_bucket_size: 100_000,
        relation_secondary_bucket_size: 1,
        address_prefix_length: 5,
        tx_prefix_length: 5,
        fiat_currencies: vec!["USD".into(), "EUR".into()],
        decimals: if schema == SchemaType::Utxo { 8 } else { 18 },
        nonstandard_address: "nonstandard".into(),
        allow_missing_history: false,
        validation_sample_size: 50,
        validation_interval: 1,
    }
}

struct Env {
    _raw_dir: TempDir,
    _transformed_dir: TempDir,
    fixture: RawFixture,
    cfg: CurrencyConfig,
}

impl Env {
    fn new(schema: SchemaType) -> Self {
        let raw_dir = TempDir::new().unwrap();
        let transformed_dir = TempDir::new().unwrap();
        let fixture = RawFixture::open(raw_dir.path());
        let cfg = currency_cfg(schema, raw_dir.path(), transformed_dir.path());
        Self {
            _raw_dir: raw_dir,
            _transformed_dir: transformed_dir,
            fixture,
            cfg,
        }
    }

    fn put_rate_usd_eur(&self, date: &str, usd: f32, eur: f32) {
        let mut m = std::collections::BTreeMap::new();
        m.insert("USD".to_string(), usd);
        m.insert("EUR".to_string(), eur);
        self.fixture.put_rate(date, &m);
    }

    async fn open_store(&self) -> TransformedStore {
        let db = open_transformed(Path::new(&self.cfg.transformed_path)).unwrap();
        let store = TransformedStore::new(
            db,
            "test_transformed".into(),
            self.cfg.write_batch_size,
            RetryPolicy::default(),
        );
        if store.get_configuration().unwrap().is_none() {
            store
                .create_schema(&self.cfg.keyspace_configuration())
                .await
                .unwrap();
        }
        store
    }

    fn open_raw_store(&self) -> RawStore {
        RawStore::new(
            open_raw(Path::new(&self.cfg.raw_path)).unwrap(),
            self.cfg.schema_type,
        )
    }

    async fn coordinator(&self, options: UpdateOptions) -> Coordinator {
        let store = self.open_store().await;
        Coordinator::new(
            "test".into(),
            self.cfg.clone(),
            self.open_raw_store(),
            store,
            options,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }
}

fn io(addrs: &[&str], value: i64) -> TxInputOutput {
    TxInputOutput {
        addresses: addrs.iter().map(|s| s.to_string()).collect(),
        value,
        address_type: 0,
    }
}

fn put_utxo_block(env: &Env, height: i64, timestamp: i64, txs: Vec<RawUtxoTransaction>) {
    env.fixture.put_block(&RawBlock {
        height,
        hash: vec![height as u8; 32],
        timestamp,
        tx_count: txs.len() as i32,
    });
    for tx in txs {
        env.fixture.put_utxo_tx(&tx);
    }
}

fn coinbase_tx(height: i64, to: &str, value: i64) -> RawUtxoTransaction {
    RawUtxoTransaction {
        tx_hash: vec![height as u8 ^ 0xcb; 32],
        block_height: height,
        tx_index: 0,
        coinbase: true,
        inputs: vec![],
        outputs: vec![io(&[to], value)],
        timestamp: T0,
    }
}

fn pedantic() -> UpdateOptions {
    UpdateOptions {
        pedantic: true,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Scenario: empty catch-up
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_empty_catch_up_is_idle() {
    let env = Env::new(SchemaType::Utxo);
    let mut coordinator = env.coordinator(pedantic()).await;

    let outcome = coordinator.run_update().await.unwrap();
    assert_eq!(outcome.batches, 0);
    assert_eq!(outcome.last_synced_block, -1);
    drop(coordinator);

    let store = env.open_store().await;
    assert!(store.get_status().unwrap().is_none());
    assert!(store.get_history().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Scenario: UTXO single-block batch (coinbase pays A)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_utxo_coinbase_block() {
    let env = Env::new(SchemaType::Utxo);
    env.put_rate_usd_eur("2020-09-13", 10.0, 9.0);
    put_utxo_block(&env, 0, T0, vec![coinbase_tx(0, "A", 50)]);

    let mut coordinator = env.coordinator(pedantic()).await;
    let outcome = coordinator.run_update().await.unwrap();
    assert_eq!(outcome.batches, 1);
    assert_eq!(outcome.last_synced_block, 0);
    drop(coordinator);

    let store = env.open_store().await;
    let kc = store.get_configuration().unwrap().unwrap();

    let st = store.get_status().unwrap().unwrap();
    assert_eq!(st.last_synced_block, 0);
    // coinbase pseudo-address got id 0 (input side first), A got id 1
    assert_eq!(st.highest_address_id, 1);
    assert_eq!(store.get_address_id("coinb", b"coinbase").unwrap(), Some(0));
    assert_eq!(store.get_address_id("A", b"A").unwrap(), Some(1));

    let a = store.get_address(1, &kc).unwrap().unwrap();
    assert_eq!(a.no_incoming_txs, 1);
    assert_eq!(a.no_outgoing_txs, 0);
    assert_eq!(a.total_received.value, 50);
    let expected_usd = (50.0 / 1e8) * 10.0;
    assert!((a.total_received.fiat_values[0] - expected_usd as f32).abs() < 1e-9);
    assert_eq!(a.first_tx_id, 0);
    assert_eq!(a.last_tx_id, 0);

    // coinbase emits no relations
    assert_eq!(store.count_rows("address_outgoing_relations").unwrap(), 0);
    assert_eq!(store.count_rows("address_incoming_relations").unwrap(), 0);
    assert_eq!(store.count_rows("cluster").unwrap(), 0);

    // attached rate vector persisted per block
    assert_eq!(store.get_transformed_rate(0).unwrap().unwrap(), vec![10.0, 9.0]);

    // balances reflect the flows
    assert_eq!(store.get_balance(1, &Currency::Native, &kc).unwrap(), 50);

    let summary = store.get_summary_statistics().unwrap();
    assert_eq!(summary.no_blocks, 1);
    assert_eq!(summary.no_transactions, 1);
    assert_eq!(summary.no_addresses, 2);

    // a second run has nothing to do and writes no second history row
    drop(store);
    let mut coordinator = env.coordinator(pedantic()).await;
    let outcome = coordinator.run_update().await.unwrap();
    assert_eq!(outcome.batches, 0);
    drop(coordinator);
    assert_eq!(env.open_store().await.get_history().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Scenario: UTXO two-input multi-output with proportional split
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_utxo_two_input_multi_output() {
    let env = Env::new(SchemaType::Utxo);
    env.put_rate_usd_eur("2020-09-13", 10.0, 9.0);
    let spend = RawUtxoTransaction {
        tx_hash: vec![0x11; 32],
        block_height: 0,
        tx_index: 0,
        coinbase: false,
        inputs: vec![io(&["A"], 50), io(&["B"], 10)],
        outputs: vec![io(&["C"], 55), io(&["D"], 4)],
        timestamp: T0,
    };
    put_utxo_block(&env, 0, T0, vec![spend]);

    let mut coordinator = env.coordinator(pedantic()).await;
    coordinator.run_update().await.unwrap();
    drop(coordinator);

    let store = env.open_store().await;
    let kc = store.get_configuration().unwrap().unwrap();

    let id = |addr: &str| {
        store
            .get_address_id(addr, addr.as_bytes())
            .unwrap()
            .unwrap()
    };
    let (a, b, c, d) = (id("A"), id("B"), id("C"), id("D"));
    assert_eq!((a, b, c, d), (0, 1, 2, 3));

    // entity union(A, B): same cluster, recorded both ways
    let cluster_a = store.get_address_cluster(a, &kc).unwrap().unwrap();
    let cluster_b = store.get_address_cluster(b, &kc).unwrap().unwrap();
    assert_eq!(cluster_a, cluster_b);
    let cluster = store.get_cluster(cluster_a, &kc).unwrap().unwrap();
    assert_eq!(cluster.no_addresses, 2);
    assert_eq!(cluster.no_outgoing_txs, 2);
    assert_eq!(cluster.total_spent.value, 60);
    assert_eq!(
        store.get_cluster_addresses(cluster_a, &kc).unwrap(),
        vec![a, b]
    );

    // proportional value split, floor division
    let rel = |src: i32, dst: i32| {
        store
            .get_relation(RelationDirection::Outgoing, src, dst, &kc)
            .unwrap()
            .unwrap()
    };
    assert_eq!(rel(a, c).value.value, 45);
    assert_eq!(rel(a, d).value.value, 3);
    assert_eq!(rel(b, c).value.value, 9);
    assert_eq!(rel(b, d).value.value, 0);
    assert!(rel(a, c).no_transactions == 1);

    // symmetry: incoming twin matches
    let incoming = store
        .get_relation(RelationDirection::Incoming, c, a, &kc)
        .unwrap()
        .unwrap();
    assert_eq!(incoming, rel(a, c));

    // first/last tx hints for the fresh outputs
    let c_row = store.get_address(c, &kc).unwrap().unwrap();
    let d_row = store.get_address(d, &kc).unwrap().unwrap();
    assert_eq!(c_row.first_tx_id, 0);
    assert_eq!(d_row.first_tx_id, 0);

    // degrees count distinct counterparties
    let a_row = store.get_address(a, &kc).unwrap().unwrap();
    assert_eq!(a_row.out_degree, 2);
    assert_eq!(c_row.in_degree, 2);
}

// ---------------------------------------------------------------------------
// Scenario: account success + failed tx
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_account_success_and_failed_tx() {
    let env = Env::new(SchemaType::Account);
    env.put_rate_usd_eur("2020-09-13", 300.0, 270.0);

    let x = vec![1u8; 20];
    let y = vec![2u8; 20];
    let z = vec![3u8; 20];
    let one_eth = 1_000_000_000_000_000_000i64;
    let mk_tx = |tag: u8, index: i32, to: &Vec<u8>, status: i16| RawAccountTransaction {
        tx_hash: vec![tag; 32],
        block_height: 0,
        tx_index: index,
        from_address: Some(x.clone()),
        to_address: Some(to.clone()),
        value: one_eth,
        status,
        receipt_gas_used: 21_000,
        effective_gas_price: 2,
        receipt_contract_address: None,
    };
    env.fixture.put_block(&RawBlock {
        height: 0,
        hash: vec![0; 32],
        timestamp: T0,
        tx_count: 2,
    });
    env.fixture.put_account_tx(&mk_tx(0xa1, 0, &y, 1));
    env.fixture.put_account_tx(&mk_tx(0xa2, 1, &z, 0));

    let mut coordinator = env.coordinator(pedantic()).await;
    coordinator.run_update().await.unwrap();
    drop(coordinator);

    let store = env.open_store().await;
    let kc = store.get_configuration().unwrap().unwrap();
    let id = |addr: &Vec<u8>| {
        store
            .get_address_id(&hex::encode(addr)[..5], addr)
            .unwrap()
            .unwrap()
    };
    let (xi, yi, zi) = (id(&x), id(&y), id(&z));

    let x_row = store.get_address(xi, &kc).unwrap().unwrap();
    assert_eq!(x_row.no_outgoing_txs, 2);
    assert_eq!(x_row.no_outgoing_txs_zero_value, 1);
    // value aggregates reflect T1 only, plus both fees
    assert_eq!(x_row.total_spent.value, one_eth + 2 * 42_000);

    let y_row = store.get_address(yi, &kc).unwrap().unwrap();
    assert_eq!(y_row.total_received.value, one_eth);
    assert_eq!(y_row.no_incoming_txs, 1);

    let z_row = store.get_address(zi, &kc).unwrap().unwrap();
    assert_eq!(z_row.no_incoming_txs, 1);
    assert_eq!(z_row.no_incoming_txs_zero_value, 1);
    assert_eq!(z_row.total_received.value, 0);

    // relation X->Z exists with zero value, X->Y with the transfer
    let xz = store
        .get_relation(RelationDirection::Outgoing, xi, zi, &kc)
        .unwrap()
        .unwrap();
    assert_eq!(xz.value.value, 0);
    assert_eq!(xz.no_transactions, 1);
    let xy = store
        .get_relation(RelationDirection::Outgoing, xi, yi, &kc)
        .unwrap()
        .unwrap();
    assert_eq!(xy.value.value, one_eth);

    // zero-valued relation feeds the zero-value degrees
    assert_eq!(x_row.out_degree, 1);
    assert_eq!(x_row.out_degree_zero_value, 1);
}

// ---------------------------------------------------------------------------
// Scenario: forward-fill across a rate gap
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_forward_fill_rates() {
    let env = Env::new(SchemaType::Utxo);
    // Rates exist only for block 0's day; blocks 1..=5 are on later days.
    env.put_rate_usd_eur("2020-09-13", 10.0, 9.0);
    for h in 0..=5i64 {
        put_utxo_block(&env, h, T0 + h * DAY, vec![coinbase_tx(h, "A", 50)]);
    }

    // Strict mode aborts the batch with RateMissing; nothing advances.
    let mut coordinator = env.coordinator(pedantic()).await;
    let err = coordinator.run_update().await.unwrap_err();
    assert!(matches!(err, UpdateError::RateMissing { .. }));
    drop(coordinator);
    let store = env.open_store().await;
    assert_eq!(status::last_synced_block(&store).unwrap(), -1);
    assert!(store.read_journal().unwrap().is_none());
    assert_eq!(store.count_rows("address").unwrap(), 0);
    drop(store);

    // Forward-fill bridges the gap with the block-0 vector.
    let mut coordinator = env
        .coordinator(UpdateOptions {
            forward_fill_rates: true,
            pedantic: true,
            ..Default::default()
        })
        .await;
    let outcome = coordinator.run_update().await.unwrap();
    assert_eq!(outcome.last_synced_block, 5);
    drop(coordinator);

    let store = env.open_store().await;
    for h in 0..=5i64 {
        assert_eq!(
            store.get_transformed_rate(h).unwrap().unwrap(),
            vec![10.0, 9.0]
        );
    }
}

// ---------------------------------------------------------------------------
// Scenario: crash after WRITING, before STATUS_UPDATE
// ---------------------------------------------------------------------------

/// Reproduce the coordinator's WRITING phase by hand, stop before the
/// commit point, and let a fresh run recover. The recovered keyspace must
/// be byte-identical (outside the status tables) to one that never
/// crashed.
#[tokio::test]
async fn test_crash_before_status_update_recovers_identically() {
    let reference = Env::new(SchemaType::Utxo);
    let crashed = Env::new(SchemaType::Utxo);
    for env in [&reference, &crashed] {
        env.put_rate_usd_eur("2020-09-13", 10.0, 9.0);
        put_utxo_block(env, 0, T0, vec![coinbase_tx(0, "A", 50)]);
        let spend = RawUtxoTransaction {
            tx_hash: vec![0x22; 32],
            block_height: 1,
            tx_index: 0,
            coinbase: false,
            inputs: vec![io(&["A"], 50)],
            outputs: vec![io(&["B"], 30), io(&["C"], 19)],
            timestamp: T0,
        };
        put_utxo_block(env, 1, T0, vec![spend]);
    }

    // Reference: a clean, uninterrupted run.
    let mut coordinator = reference.coordinator(pedantic()).await;
    coordinator.run_update().await.unwrap();
    drop(coordinator);

    // Crashed: project and aggregate the same batch, write journal and
    // data rows, then "die" before commit_status.
    {
        let store = crashed.open_store().await;
        let raw = crashed.open_raw_store();
        let kc = store.get_configuration().unwrap().unwrap();
        let bundles = raw.fetch_range(0, 1).unwrap();
        let summary = store.get_summary_statistics().unwrap();
        let projected = UtxoProjector::new("nonstandard")
            .project(&bundles, summary.no_transactions)
            .unwrap();
        let rates = RateSheet::build(&raw, &kc, false).unwrap();
        let mut allocator = IdAllocator::new(-1, SchemaType::Utxo, 5);
        let tokens = std::collections::HashMap::new();
        let input = AggregationInput {
            store: &store,
            kc: &kc,
            rates: &rates,
            tokens_by_ticker: &tokens,
            summary: &summary,
        };
        let (ops, stats) = aggregate(&input, &projected, &mut allocator).unwrap();
        let pending = PendingBatch {
            ops,
            status: status::build_status(
                store.keyspace_name(),
                stats.last_block,
                stats.last_block_timestamp,
                stats.highest_address_id,
                true,
                true,
                0.0,
            ),
        };
        store.write_journal(&pending).await.unwrap();
        store.batch_write(pending.ops, &kc).await.unwrap();
        // crash: no commit_status
        assert!(store.read_journal().unwrap().is_some());
        assert!(store.get_status().unwrap().is_none());
    }

    // Restart: recovery replays the journal (re-applying every row on
    // top of the already-written data) and advances status.
    let mut coordinator = crashed.coordinator(pedantic()).await;
    let outcome = coordinator.run_update().await.unwrap();
    assert_eq!(outcome.batches, 0); // recovery is not a new batch
    drop(coordinator);
    let store = crashed.open_store().await;
    assert!(store.read_journal().unwrap().is_none());
    assert_eq!(store.get_status().unwrap().unwrap().last_synced_block, 1);

    // Byte-identical data outside the status/history tables (those carry
    // wall-clock timestamps).
    let reference_store = reference.open_store().await;
    for cf in TRANSFORMED_COLUMN_FAMILIES {
        if matches!(
            cf,
            "delta_updater_status" | "delta_updater_history" | "pending_batch"
        ) {
            continue;
        }
        assert_eq!(
            dump_cf(&reference_store, cf),
            dump_cf(&store, cf),
            "CF {} diverged after crash recovery",
            cf
        );
    }
}

fn dump_cf(store: &TransformedStore, cf: &str) -> Vec<(Vec<u8>, Vec<u8>)> {
    store.dump_cf(cf).unwrap()
}

fn addr_id(store: &TransformedStore, addr: &str) -> i32 {
    store
        .get_address_id(addr, addr.as_bytes())
        .unwrap()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Cross-batch cluster growth and merging
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cluster_merge_across_batches() {
    let env = Env::new(SchemaType::Utxo);
    env.put_rate_usd_eur("2020-09-13", 10.0, 9.0);

    // Batch 1: {A, B} and {C, D} form two clusters.
    let tx_ab = RawUtxoTransaction {
        tx_hash: vec![0x31; 32],
        block_height: 0,
        tx_index: 0,
        coinbase: false,
        inputs: vec![io(&["A"], 5), io(&["B"], 5)],
        outputs: vec![io(&["E"], 10)],
        timestamp: T0,
    };
    let tx_cd = RawUtxoTransaction {
        tx_hash: vec![0x32; 32],
        block_height: 0,
        tx_index: 1,
        coinbase: false,
        inputs: vec![io(&["C"], 5), io(&["D"], 5)],
        outputs: vec![io(&["E"], 10)],
        timestamp: T0,
    };
    put_utxo_block(&env, 0, T0, vec![tx_ab, tx_cd]);
    let mut coordinator = env.coordinator(pedantic()).await;
    coordinator.run_update().await.unwrap();
    drop(coordinator);

    let store = env.open_store().await;
    let kc = store.get_configuration().unwrap().unwrap();
    let cluster_ab = store
        .get_address_cluster(addr_id(&store, "A"), &kc)
        .unwrap()
        .unwrap();
    let cluster_cd = store
        .get_address_cluster(addr_id(&store, "C"), &kc)
        .unwrap()
        .unwrap();
    assert_ne!(cluster_ab, cluster_cd);
    drop(store);

    // Batch 2: a tx co-spending B and C merges both clusters.
    let tx_bc = RawUtxoTransaction {
        tx_hash: vec![0x33; 32],
        block_height: 1,
        tx_index: 0,
        coinbase: false,
        inputs: vec![io(&["B"], 3), io(&["C"], 3)],
        outputs: vec![io(&["E"], 6)],
        timestamp: T0,
    };
    put_utxo_block(&env, 1, T0, vec![tx_bc]);
    let mut coordinator = env.coordinator(pedantic()).await;
    coordinator.run_update().await.unwrap();
    drop(coordinator);

    let store = env.open_store().await;
    let winner = cluster_ab.min(cluster_cd);
    let loser = cluster_ab.max(cluster_cd);
    for addr in ["A", "B", "C", "D"] {
        assert_eq!(
            store
                .get_address_cluster(addr_id(&store, addr), &kc)
                .unwrap(),
            Some(winner),
            "address {} not re-pointed",
            addr
        );
    }
    let winner_row = store.get_cluster(winner, &kc).unwrap().unwrap();
    assert_eq!(winner_row.no_addresses, 4);
    assert_eq!(winner_row.merged_into, None);
    // loser keeps a tombstone pointing at the winner
    let loser_row = store.get_cluster(loser, &kc).unwrap().unwrap();
    assert_eq!(loser_row.merged_into, Some(winner));
    assert_eq!(
        store.get_cluster_addresses(winner, &kc).unwrap().len(),
        4
    );
    // total spent over all members: 5+5+5+5 from batch 1, 3+3 from batch 2
    assert_eq!(winner_row.total_spent.value, 26);
}

// ---------------------------------------------------------------------------
// End-block bound
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_end_block_bounds_the_run() {
    let env = Env::new(SchemaType::Utxo);
    env.put_rate_usd_eur("2020-09-13", 10.0, 9.0);
    for h in 0..=7i64 {
        put_utxo_block(&env, h, T0, vec![coinbase_tx(h, "A", 50)]);
    }
    let mut coordinator = env
        .coordinator(UpdateOptions {
            end_block: Some(3),
            pedantic: true,
            ..Default::default()
        })
        .await;
    let outcome = coordinator.run_update().await.unwrap();
    assert_eq!(outcome.last_synced_block, 3);
    assert_eq!(outcome.blocks, 4);
}
