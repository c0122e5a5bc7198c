/// Batch Coordinator
///
/// Drives the per-currency delta-update state machine:
///
///   IDLE -> PLANNING -> PROJECTING -> AGGREGATING -> WRITING
///        -> STATUS_UPDATE -> IDLE
///
/// One batch at a time; batch N+1 starts only after N's status row is
/// acknowledged. Cancellation is checked at every transition. The commit
/// point is the atomic status/history/journal-delete write; a crash on
/// either side of it leaves the keyspace recoverable: before the journal
/// is written nothing happened, after it the journal replays
/// byte-identically on the next run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::aggregator::{aggregate, AggregationInput};
use crate::account_projector::AccountProjector;
use crate::config::CurrencyConfig;
use crate::error::UpdateError;
use crate::id_allocator::IdAllocator;
use crate::metrics;
use crate::projection::Projector;
use crate::rates::RateSheet;
use crate::raw_store::RawStore;
use crate::status;
use crate::transformed_store::{PendingBatch, RowOp, TransformedStore};
use crate::types::{KeyspaceConfiguration, SchemaType, TokenConfigurationRow};
use crate::utxo_projector::UtxoProjector;
use crate::validator::Validator;

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub end_block: Option<i64>,
    pub forward_fill_rates: bool,
    pub pedantic: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Nothing to do: the transformed view has caught up with
    /// tip - safety margin (or the requested end block).
    Idle,
    Committed {
        last_synced_block: i64,
        blocks: usize,
        transactions: i64,
        new_addresses: usize,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub batches: u64,
    pub blocks: u64,
    pub transactions: u64,
    pub last_synced_block: i64,
}

pub struct Coordinator {
    currency: String,
    cfg: CurrencyConfig,
    kc: KeyspaceConfiguration,
    raw: RawStore,
    store: TransformedStore,
    cancel: Arc<AtomicBool>,
    options: UpdateOptions,
    batches_since_validation: u64,
}

impl Coordinator {
    /// The stored configuration row governs the keyspace layout; the
    /// config file only seeds it at schema creation. A keyspace without
    /// one has never been initialized.
    pub fn new(
        currency: String,
        cfg: CurrencyConfig,
        raw: RawStore,
        store: TransformedStore,
        options: UpdateOptions,
        cancel: Arc<AtomicBool>,
    ) -> Result<Self, UpdateError> {
        let kc = store.get_configuration()?.ok_or_else(|| UpdateError::Config {
            detail: format!(
                "keyspace for {} has no configuration row; run update --create-schema first",
                currency
            ),
        })?;
        if kc.schema_type != cfg.schema_type {
            return Err(UpdateError::Config {
                detail: format!(
                    "config file says {:?} but the keyspace was created as {:?}",
                    cfg.schema_type, kc.schema_type
                ),
            });
        }
        Ok(Self {
            currency,
            cfg,
            kc,
            raw,
            store,
            cancel,
            options,
            batches_since_validation: 0,
        })
    }

    pub fn keyspace_configuration(&self) -> &KeyspaceConfiguration {
        &self.kc
    }

    fn check_cancelled(&self) -> Result<(), UpdateError> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(UpdateError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run batches until caught up, cancelled, or the optional end block
    /// is reached.
    pub async fn run_update(&mut self) -> Result<UpdateOutcome, UpdateError> {
        self.recover_pending().await?;

        let mut outcome = UpdateOutcome {
            last_synced_block: status::last_synced_block(&self.store)?,
            ..Default::default()
        };
        loop {
            self.check_cancelled()?;
            match self.run_batch().await? {
                BatchOutcome::Idle => break,
                BatchOutcome::Committed {
                    last_synced_block,
                    blocks,
                    transactions,
                    ..
                } => {
                    outcome.batches += 1;
                    outcome.blocks += blocks as u64;
                    outcome.transactions += transactions as u64;
                    outcome.last_synced_block = last_synced_block;
                    self.maybe_validate()?;
                }
            }
        }
        info!(
            currency = %self.currency,
            batches = outcome.batches,
            blocks = outcome.blocks,
            last_synced_block = outcome.last_synced_block,
            "update run finished"
        );
        Ok(outcome)
    }

    /// Replay an interrupted batch found in the journal. The stored ops
    /// are absolute rows computed before the crash; re-applying them and
    /// committing the stored status reproduces exactly the state the
    /// interrupted run would have left.
    pub async fn recover_pending(&self) -> Result<(), UpdateError> {
        let Some(pending) = self.store.read_journal()? else {
            return Ok(());
        };
        warn!(
            currency = %self.currency,
            target_block = pending.status.last_synced_block,
            ops = pending.ops.len(),
            "replaying interrupted batch from journal"
        );
        metrics::JOURNAL_REPLAYS.inc();
        self.store.batch_write(pending.ops, &self.kc).await?;
        self.store.commit_status(pending.status, &self.kc).await?;
        Ok(())
    }

    /// One pass through the state machine.
    pub async fn run_batch(&mut self) -> Result<BatchOutcome, UpdateError> {
        let started = Instant::now();

        // PLANNING
        let h = status::last_synced_block(&self.store)?;
        let Some(cap) = self.raw.tip_with_margin(h, self.cfg.safety_margin)? else {
            return Ok(BatchOutcome::Idle);
        };
        let mut end = cap.min(h + self.cfg.batch_size);
        if let Some(requested_end) = self.options.end_block {
            end = end.min(requested_end);
        }
        if end <= h {
            return Ok(BatchOutcome::Idle);
        }
        let start = h + 1;
        self.check_cancelled()?;

        // PROJECTING
        let bundles = self.raw.fetch_range(start, end)?;
        let summary = self.store.get_summary_statistics()?;
        let tokens = self.store.get_token_configurations()?;
        let projected = match self.kc.schema_type {
            SchemaType::Utxo => UtxoProjector::new(&self.cfg.nonstandard_address)
                .project(&bundles, summary.no_transactions)?,
            SchemaType::Account => {
                AccountProjector::new(tokens.clone()).project(&bundles, summary.no_transactions)?
            }
        };
        self.check_cancelled()?;

        // AGGREGATING
        let forward_fill = self.cfg.forward_fill_rates || self.options.forward_fill_rates;
        let rates = RateSheet::build(&self.raw, &self.kc, forward_fill)?;
        let tokens_by_ticker: HashMap<String, TokenConfigurationRow> = tokens
            .into_iter()
            .map(|t| (t.ticker.clone(), t))
            .collect();
        let mut allocator = IdAllocator::new(
            status::highest_address_id(&self.store)?,
            self.kc.schema_type,
            self.kc.address_prefix_length,
        );
        let input = AggregationInput {
            store: &self.store,
            kc: &self.kc,
            rates: &rates,
            tokens_by_ticker: &tokens_by_ticker,
            summary: &summary,
        };
        let (ops, stats) = aggregate(&input, &projected, &mut allocator)?;
        self.check_cancelled()?;

        // WRITING: journal first, then the data chunks.
        let pending = PendingBatch {
            ops,
            status: status::build_status(
                self.store.keyspace_name(),
                stats.last_block,
                stats.last_block_timestamp,
                stats.highest_address_id,
                stats.new_addresses > 0,
                true,
                started.elapsed().as_secs_f64(),
            ),
        };
        self.store.write_journal(&pending).await?;
        self.store.batch_write(pending.ops, &self.kc).await?;
        if self.check_cancelled().is_err() {
            // Discard: drop the journal so the next run re-does the batch
            // from projection instead of replaying it.
            self.store.discard_journal().await?;
            return Err(UpdateError::Cancelled);
        }

        // STATUS_UPDATE: the commit point.
        self.store.commit_status(pending.status.clone(), &self.kc).await?;

        metrics::BATCHES_COMMITTED
            .with_label_values(&[self.currency.as_str()])
            .inc();
        metrics::BLOCKS_TRANSFORMED
            .with_label_values(&[self.currency.as_str()])
            .inc_by(stats.blocks as u64);
        metrics::TRANSACTIONS_TRANSFORMED
            .with_label_values(&[self.currency.as_str()])
            .inc_by(stats.transactions as u64);
        metrics::ADDRESSES_ALLOCATED
            .with_label_values(&[self.currency.as_str()])
            .inc_by(stats.new_addresses as u64);
        metrics::LAST_SYNCED_BLOCK
            .with_label_values(&[self.currency.as_str()])
            .set(stats.last_block);
        metrics::HIGHEST_ADDRESS_ID
            .with_label_values(&[self.currency.as_str()])
            .set(stats.highest_address_id as i64);
        metrics::BATCH_RUNTIME.observe(started.elapsed().as_secs_f64());

        info!(
            currency = %self.currency,
            start,
            end,
            transactions = stats.transactions,
            new_addresses = stats.new_addresses,
            runtime_ms = started.elapsed().as_millis() as u64,
            "batch committed"
        );

        Ok(BatchOutcome::Committed {
            last_synced_block: stats.last_block,
            blocks: stats.blocks,
            transactions: stats.transactions,
            new_addresses: stats.new_addresses,
        })
    }

    /// Periodic cross-check. Divergences are fatal under --pedantic,
    /// logged otherwise.
    fn maybe_validate(&mut self) -> Result<(), UpdateError> {
        if self.cfg.validation_interval == 0 {
            return Ok(());
        }
        self.batches_since_validation += 1;
        if self.batches_since_validation < self.cfg.validation_interval {
            return Ok(());
        }
        self.batches_since_validation = 0;

        let validator = Validator {
            raw: &self.raw,
            store: &self.store,
            kc: &self.kc,
            nonstandard_address: self.cfg.nonstandard_address.clone(),
            sample_size: self.cfg.validation_sample_size,
        };
        let report = validator.run()?;
        if report.is_clean() {
            return Ok(());
        }
        if self.options.pedantic {
            return Err(report.divergences.into_iter().next().unwrap().into_error());
        }
        for d in &report.divergences {
            warn!(
                address = %d.address,
                field = d.field,
                expected = %d.expected,
                got = %d.got,
                "validator divergence"
            );
        }
        Ok(())
    }
}

/// Re-attach fiat vectors for an already-transformed block range after a
/// rate backfill. Rewrites only the transformed exchange_rates rows; the
/// per-row fiat aggregates are not recomputed here.
pub async fn patch_exchange_rates(
    raw: &RawStore,
    store: &TransformedStore,
    kc: &KeyspaceConfiguration,
    start: i64,
    end: i64,
    forward_fill: bool,
) -> Result<usize, UpdateError> {
    let synced = status::last_synced_block(store)?;
    if synced < 0 {
        return Ok(0);
    }
    let end = end.min(synced);
    if end < start {
        return Ok(0);
    }
    let rates = RateSheet::build(raw, kc, forward_fill)?;
    let mut ops = Vec::with_capacity((end - start + 1) as usize);
    for height in start..=end {
        let block = raw
            .get_block(height)?
            .ok_or(UpdateError::GapInRaw { height })?;
        ops.push(RowOp::ExchangeRate {
            height,
            fiat_values: rates.vector_for_block(&block)?,
        });
    }
    let patched = ops.len();
    store.batch_write(ops, kc).await?;
    info!(start, end, patched, "patched exchange rates");
    Ok(patched)
}
