/// Exchange-Rate Attacher
///
/// Joins the per-day fiat rate table onto blocks and values. A RateSheet
/// is a snapshot taken at batch start: mid-batch changes to the raw rate
/// table are invisible, and every lookup inside one batch sees the same
/// data. Forward-fill resolves a missing day to the most recent prior day
/// via binary search over the date-ascending snapshot.

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::UpdateError;
use crate::metrics;
use crate::raw_store::RawStore;
use crate::types::{KeyspaceConfiguration, RawBlock};

pub struct RateSheet {
    fiat_currencies: Vec<String>,
    decimals: u32,
    /// (date, vector in fiat-list order), date-ascending.
    rows: Vec<(String, Vec<f32>)>,
    forward_fill: bool,
    usd_index: Option<usize>,
    /// Gap dates already logged; forward-fill logs once per gap.
    logged_gaps: Mutex<HashSet<String>>,
}

impl RateSheet {
    /// Snapshot the raw rate table. Rows missing any configured fiat
    /// ticker are dropped (they count as absent days).
    pub fn build(
        raw: &RawStore,
        kc: &KeyspaceConfiguration,
        forward_fill: bool,
    ) -> Result<Self, UpdateError> {
        let table = raw.exchange_rate_table()?;
        let mut rows = Vec::with_capacity(table.len());
        for (date, by_ticker) in table {
            let mut vector = Vec::with_capacity(kc.fiat_currencies.len());
            let mut complete = true;
            for ticker in &kc.fiat_currencies {
                match by_ticker.get(ticker) {
                    Some(rate) => vector.push(*rate),
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if complete {
                rows.push((date, vector));
            } else {
                warn!(date = %date, "rate row lacks a configured fiat ticker, treating day as absent");
            }
        }
        let usd_index = kc.fiat_currencies.iter().position(|c| c == "USD");
        Ok(Self {
            fiat_currencies: kc.fiat_currencies.clone(),
            decimals: kc.decimals,
            rows,
            forward_fill,
            usd_index,
            logged_gaps: Mutex::new(HashSet::new()),
        })
    }

    pub fn fiat_currencies(&self) -> &[String] {
        &self.fiat_currencies
    }

    /// UTC calendar date of a block timestamp, the join key of the raw
    /// rate table.
    pub fn date_for_timestamp(timestamp: i64) -> String {
        match DateTime::<Utc>::from_timestamp(timestamp, 0) {
            Some(dt) => dt.date_naive().format("%Y-%m-%d").to_string(),
            // Pre-epoch or absurd timestamps only appear in corrupt raw
            // data; map them to a date no rate table contains.
            None => "0000-00-00".to_string(),
        }
    }

    /// Fiat vector for a date. Strict mode requires the exact day;
    /// forward-fill falls back to the latest prior day.
    pub fn vector_for_date(&self, date: &str) -> Result<&[f32], UpdateError> {
        // partition_point: number of rows with date <= target.
        let upto = self
            .rows
            .partition_point(|(d, _)| d.as_str() <= date);
        if upto == 0 {
            return Err(UpdateError::RateMissing {
                date: date.to_string(),
            });
        }
        let (found_date, vector) = &self.rows[upto - 1];
        if found_date == date {
            return Ok(vector);
        }
        if !self.forward_fill {
            return Err(UpdateError::RateMissing {
                date: date.to_string(),
            });
        }
        let mut logged = self.logged_gaps.lock().unwrap();
        if logged.insert(date.to_string()) {
            metrics::RATE_GAPS_FILLED.inc();
            info!(missing = %date, used = %found_date, "forward-filling exchange rate gap");
        }
        Ok(vector)
    }

    pub fn vector_for_block(&self, block: &RawBlock) -> Result<Vec<f32>, UpdateError> {
        let date = Self::date_for_timestamp(block.timestamp);
        Ok(self.vector_for_date(&date)?.to_vec())
    }

    /// fiat = native × rate / 10^decimals, per configured currency.
    pub fn fiat(&self, block_rates: &[f32], native: i64) -> Vec<f32> {
        let scale = 10f64.powi(self.decimals as i32);
        block_rates
            .iter()
            .map(|rate| ((native as f64 / scale) * *rate as f64) as f32)
            .collect()
    }

    /// Token amounts are valued through their USD peg, crossed into the
    /// other fiat currencies via the block's native rates. Without a USD
    /// slot in the fiat list there is nothing to cross against and the
    /// vector is zero.
    pub fn token_fiat(
        &self,
        block_rates: &[f32],
        token_decimals: u32,
        peg_usd: f32,
        amount: i64,
    ) -> Vec<f32> {
        let scale = 10f64.powi(token_decimals as i32);
        let usd_value = (amount as f64 / scale) * peg_usd as f64;
        match self.usd_index {
            Some(usd_idx) if block_rates[usd_idx] != 0.0 => {
                let usd_rate = block_rates[usd_idx] as f64;
                block_rates
                    .iter()
                    .map(|rate| (usd_value * (*rate as f64 / usd_rate)) as f32)
                    .collect()
            }
            _ => vec![0.0; block_rates.len()],
        }
    }
}
