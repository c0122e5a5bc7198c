/// Metrics - Prometheus Instrumentation
///
/// One global registry; counters cover the delta-update pipeline, gauges
/// track sync position, and a histogram records per-batch runtime.
/// `dump()` renders the text exposition format for the CLI and tools.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

/// Batch runtimes range from sub-second (idle catch-up) to minutes
/// (dense blocks), hence the wide buckets.
const BATCH_RUNTIME_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 180.0, 600.0];

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Committed batches per currency.
    pub static ref BATCHES_COMMITTED: IntCounterVec = IntCounterVec::new(
        Opts::new("ledgerview_batches_committed_total", "Committed delta-update batches"),
        &["currency"]
    ).unwrap();

    /// Blocks transformed per currency.
    pub static ref BLOCKS_TRANSFORMED: IntCounterVec = IntCounterVec::new(
        Opts::new("ledgerview_blocks_transformed_total", "Raw blocks folded into the transformed keyspace"),
        &["currency"]
    ).unwrap();

    /// Transactions transformed per currency.
    pub static ref TRANSACTIONS_TRANSFORMED: IntCounterVec = IntCounterVec::new(
        Opts::new("ledgerview_transactions_transformed_total", "Transactions projected"),
        &["currency"]
    ).unwrap();

    /// New addresses allocated per currency.
    pub static ref ADDRESSES_ALLOCATED: IntCounterVec = IntCounterVec::new(
        Opts::new("ledgerview_addresses_allocated_total", "New address ids issued"),
        &["currency"]
    ).unwrap();

    /// Transient write retries.
    pub static ref WRITE_RETRIES: IntCounter = IntCounter::new(
        "ledgerview_write_retries_total",
        "Store writes retried after a transient timeout"
    ).unwrap();

    /// Batches recovered from the pending-batch journal after a crash.
    pub static ref JOURNAL_REPLAYS: IntCounter = IntCounter::new(
        "ledgerview_journal_replays_total",
        "Pending batches re-applied on startup"
    ).unwrap();

    /// Last synced block per currency.
    pub static ref LAST_SYNCED_BLOCK: IntGaugeVec = IntGaugeVec::new(
        Opts::new("ledgerview_last_synced_block", "Last block folded into the transformed keyspace"),
        &["currency"]
    ).unwrap();

    /// Highest address id per currency.
    pub static ref HIGHEST_ADDRESS_ID: IntGaugeVec = IntGaugeVec::new(
        Opts::new("ledgerview_highest_address_id", "High-water mark of the address id allocator"),
        &["currency"]
    ).unwrap();

    /// Rate gaps bridged by forward-fill.
    pub static ref RATE_GAPS_FILLED: IntCounter = IntCounter::new(
        "ledgerview_rate_gaps_filled_total",
        "Exchange-rate gaps bridged by forward-fill"
    ).unwrap();

    /// Per-batch wall time.
    pub static ref BATCH_RUNTIME: Histogram = Histogram::with_opts(
        HistogramOpts::new("ledgerview_batch_runtime_seconds", "Wall time per committed batch")
            .buckets(BATCH_RUNTIME_BUCKETS.to_vec())
    ).unwrap();

    /// Validator divergences found (pedantic or not).
    pub static ref DIVERGENCES_FOUND: IntGauge = IntGauge::new(
        "ledgerview_divergences_found",
        "Validator sample mismatches in the last validation pass"
    ).unwrap();
}

/// Register all collectors. Safe to call once; duplicate registration is a
/// programmer error surfaced in tests.
pub fn register_all() {
    REGISTRY.register(Box::new(BATCHES_COMMITTED.clone())).ok();
    REGISTRY.register(Box::new(BLOCKS_TRANSFORMED.clone())).ok();
    REGISTRY
        .register(Box::new(TRANSACTIONS_TRANSFORMED.clone()))
        .ok();
    REGISTRY
        .register(Box::new(ADDRESSES_ALLOCATED.clone()))
        .ok();
    REGISTRY.register(Box::new(WRITE_RETRIES.clone())).ok();
    REGISTRY.register(Box::new(JOURNAL_REPLAYS.clone())).ok();
    REGISTRY.register(Box::new(LAST_SYNCED_BLOCK.clone())).ok();
    REGISTRY.register(Box::new(HIGHEST_ADDRESS_ID.clone())).ok();
    REGISTRY.register(Box::new(RATE_GAPS_FILLED.clone())).ok();
    REGISTRY.register(Box::new(BATCH_RUNTIME.clone())).ok();
    REGISTRY.register(Box::new(DIVERGENCES_FOUND.clone())).ok();
}

/// Render the registry in Prometheus text format.
pub fn dump() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buf).ok();
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_dump() {
        register_all();
        BATCHES_COMMITTED.with_label_values(&["btc"]).inc();
        LAST_SYNCED_BLOCK.with_label_values(&["btc"]).set(42);
        let text = dump();
        assert!(text.contains("ledgerview_batches_committed_total"));
        assert!(text.contains("ledgerview_last_synced_block"));
    }
}
