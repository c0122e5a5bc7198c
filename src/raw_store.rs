/// Raw Store Adapter
///
/// Read-only view of the ledger-faithful keyspace the ingest maintains.
/// Hands out block bundles in strict height-ascending order and refuses to
/// proceed over gaps.

use std::collections::BTreeMap;
use std::sync::Arc;

use rocksdb::DB;
use tracing::debug;

use crate::error::UpdateError;
use crate::keys;
use crate::types::{
    BlockBundle, BundleTxs, RawAccountTransaction, RawBlock, RawLog, RawTrace,
    RawUtxoTransaction, SchemaType,
};

pub struct RawStore {
    db: Arc<DB>,
    schema: SchemaType,
}

impl RawStore {
    pub fn new(db: Arc<DB>, schema: SchemaType) -> Self {
        Self { db, schema }
    }

    pub fn schema(&self) -> SchemaType {
        self.schema
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, UpdateError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| UpdateError::corrupt(format!("raw CF not found: {}", name)))
    }

    pub fn get_block(&self, height: i64) -> Result<Option<RawBlock>, UpdateError> {
        let cf = self.cf("block")?;
        match self.db.get_cf(cf, keys::raw_block_key(height))? {
            Some(bytes) => {
                let block: RawBlock = bincode::deserialize(&bytes)?;
                if block.height != height {
                    return Err(UpdateError::corrupt(format!(
                        "block row at height {} carries height {}",
                        height, block.height
                    )));
                }
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    /// Highest contiguous height, or None for an empty keyspace.
    ///
    /// Walks point lookups upward from `hint` (a height already known to
    /// be present, normally the transformed side's last synced block; -1
    /// for none). The walk is O(blocks above hint), which is the same
    /// work the batch is about to do anyway.
    pub fn tip_from(&self, hint: i64) -> Result<Option<i64>, UpdateError> {
        let mut height = hint.max(-1);
        loop {
            match self.get_block(height + 1)? {
                Some(_) => height += 1,
                None => break,
            }
        }
        if height < 0 {
            Ok(None)
        } else {
            Ok(Some(height))
        }
    }

    pub fn tip(&self) -> Result<Option<i64>, UpdateError> {
        self.tip_from(-1)
    }

    /// Tip minus the safety margin; blocks above this are treated as not
    /// yet final and left untransformed.
    pub fn tip_with_margin(&self, hint: i64, margin: i64) -> Result<Option<i64>, UpdateError> {
        match self.tip_from(hint)? {
            Some(tip) if tip >= margin => Ok(Some(tip - margin)),
            _ => Ok(None),
        }
    }

    /// Load `[start, end]` inclusive as bundles, height-ascending. A
    /// missing block inside the range is a `GapInRaw`.
    pub fn fetch_range(&self, start: i64, end: i64) -> Result<Vec<BlockBundle>, UpdateError> {
        let mut bundles = Vec::with_capacity((end - start + 1).max(0) as usize);
        for height in start..=end {
            let block = self
                .get_block(height)?
                .ok_or(UpdateError::GapInRaw { height })?;
            let txs = match self.schema {
                SchemaType::Utxo => BundleTxs::Utxo(self.utxo_txs(&block)?),
                SchemaType::Account => BundleTxs::Account {
                    txs: self.account_txs(&block)?,
                    traces: self.traces(height)?,
                    logs: self.logs(height)?,
                },
            };
            bundles.push(BlockBundle { block, txs });
        }
        debug!(start, end, count = bundles.len(), "fetched raw range");
        Ok(bundles)
    }

    fn utxo_txs(&self, block: &RawBlock) -> Result<Vec<RawUtxoTransaction>, UpdateError> {
        let cf = self.cf("transaction")?;
        let mut txs = Vec::with_capacity(block.tx_count as usize);
        for idx in 0..block.tx_count {
            let key = keys::raw_tx_key(block.height, idx);
            let bytes = self.db.get_cf(cf, key)?.ok_or_else(|| {
                UpdateError::corrupt(format!(
                    "block {} claims {} txs but tx {} is missing",
                    block.height, block.tx_count, idx
                ))
            })?;
            txs.push(bincode::deserialize(&bytes)?);
        }
        Ok(txs)
    }

    fn account_txs(&self, block: &RawBlock) -> Result<Vec<RawAccountTransaction>, UpdateError> {
        let cf = self.cf("transaction")?;
        let mut txs = Vec::with_capacity(block.tx_count as usize);
        for idx in 0..block.tx_count {
            let key = keys::raw_tx_key(block.height, idx);
            let bytes = self.db.get_cf(cf, key)?.ok_or_else(|| {
                UpdateError::corrupt(format!(
                    "block {} claims {} txs but tx {} is missing",
                    block.height, block.tx_count, idx
                ))
            })?;
            txs.push(bincode::deserialize(&bytes)?);
        }
        Ok(txs)
    }

    fn traces(&self, height: i64) -> Result<Vec<RawTrace>, UpdateError> {
        let cf = self.cf("trace")?;
        let prefix = keys::raw_height_prefix(height);
        let mut out = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            if key.len() < 8 || key[..8] != prefix[..] {
                break;
            }
            out.push(bincode::deserialize::<RawTrace>(&value)?);
        }
        Ok(out)
    }

    fn logs(&self, height: i64) -> Result<Vec<RawLog>, UpdateError> {
        let cf = self.cf("log")?;
        let prefix = keys::raw_height_prefix(height);
        let mut out = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            if key.len() < 8 || key[..8] != prefix[..] {
                break;
            }
            out.push(bincode::deserialize::<RawLog>(&value)?);
        }
        Ok(out)
    }

    /// Snapshot of the whole rate table, date-ascending. Rate rows are one
    /// per day, so this stays small; the attacher binary-searches it.
    pub fn exchange_rate_table(
        &self,
    ) -> Result<Vec<(String, BTreeMap<String, f32>)>, UpdateError> {
        let cf = self.cf("exchange_rates")?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (key, value) = item?;
            let date = String::from_utf8(key.to_vec())
                .map_err(|_| UpdateError::corrupt("non-utf8 exchange rate date key"))?;
            rows.push((date, bincode::deserialize(&value)?));
        }
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Test fixtures: a miniature ingest for the raw keyspace.
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod fixtures {
    use super::*;
    use crate::schema::open_raw_rw;
    use std::path::Path;

    pub struct RawFixture {
        pub db: Arc<DB>,
    }

    impl RawFixture {
        pub fn open(path: &Path) -> Self {
            Self {
                db: open_raw_rw(path).unwrap(),
            }
        }

        pub fn put_block(&self, block: &RawBlock) {
            let cf = self.db.cf_handle("block").unwrap();
            self.db
                .put_cf(cf, keys::raw_block_key(block.height), bincode::serialize(block).unwrap())
                .unwrap();
        }

        pub fn put_utxo_tx(&self, tx: &RawUtxoTransaction) {
            let cf = self.db.cf_handle("transaction").unwrap();
            self.db
                .put_cf(
                    cf,
                    keys::raw_tx_key(tx.block_height, tx.tx_index),
                    bincode::serialize(tx).unwrap(),
                )
                .unwrap();
        }

        pub fn put_account_tx(&self, tx: &RawAccountTransaction) {
            let cf = self.db.cf_handle("transaction").unwrap();
            self.db
                .put_cf(
                    cf,
                    keys::raw_tx_key(tx.block_height, tx.tx_index),
                    bincode::serialize(tx).unwrap(),
                )
                .unwrap();
        }

        pub fn put_trace(&self, trace: &RawTrace) {
            let cf = self.db.cf_handle("trace").unwrap();
            self.db
                .put_cf(
                    cf,
                    keys::raw_trace_key(trace.block_height, trace.trace_index),
                    bincode::serialize(trace).unwrap(),
                )
                .unwrap();
        }

        pub fn put_log(&self, log: &RawLog) {
            let cf = self.db.cf_handle("log").unwrap();
            self.db
                .put_cf(
                    cf,
                    keys::raw_log_key(log.block_height, log.log_index),
                    bincode::serialize(log).unwrap(),
                )
                .unwrap();
        }

        pub fn put_rate(&self, date: &str, rates: &BTreeMap<String, f32>) {
            let cf = self.db.cf_handle("exchange_rates").unwrap();
            self.db
                .put_cf(cf, keys::raw_rate_key(date), bincode::serialize(rates).unwrap())
                .unwrap();
        }
    }

    pub fn simple_block(height: i64, timestamp: i64, tx_count: i32) -> RawBlock {
        RawBlock {
            height,
            hash: vec![height as u8; 32],
            timestamp,
            tx_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use tempfile::TempDir;

    fn store_with_blocks(heights: &[i64]) -> (RawStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let fx = RawFixture::open(dir.path());
        for &h in heights {
            fx.put_block(&simple_block(h, 1_600_000_000 + h, 0));
        }
        (RawStore::new(fx.db, SchemaType::Utxo), dir)
    }

    #[test]
    fn test_tip_empty() {
        let (store, _dir) = store_with_blocks(&[]);
        assert_eq!(store.tip().unwrap(), None);
    }

    #[test]
    fn test_tip_contiguous() {
        let (store, _dir) = store_with_blocks(&[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(store.tip().unwrap(), Some(7));
    }

    #[test]
    fn test_tip_stops_at_gap() {
        let (store, _dir) = store_with_blocks(&[0, 1, 2, /* gap */ 4, 5]);
        assert_eq!(store.tip().unwrap(), Some(2));
    }

    #[test]
    fn test_tip_with_margin() {
        let (store, _dir) = store_with_blocks(&[0, 1, 2, 3, 4, 5]);
        assert_eq!(store.tip_with_margin(-1, 2).unwrap(), Some(3));
        assert_eq!(store.tip_with_margin(-1, 5).unwrap(), Some(0));
        assert_eq!(store.tip_with_margin(-1, 6).unwrap(), None);
    }

    #[test]
    fn test_tip_from_hint() {
        let (store, _dir) = store_with_blocks(&[0, 1, 2, 3, 4, 5]);
        assert_eq!(store.tip_from(3).unwrap(), Some(5));
        assert_eq!(store.tip_from(5).unwrap(), Some(5));
    }

    #[test]
    fn test_fetch_range_gap_is_fatal() {
        let (store, _dir) = store_with_blocks(&[0, 1, /* gap */ 3]);
        match store.fetch_range(0, 3) {
            Err(UpdateError::GapInRaw { height }) => assert_eq!(height, 2),
            other => panic!("expected GapInRaw, got {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn test_fetch_range_ascending_with_txs() {
        let dir = TempDir::new().unwrap();
        let fx = RawFixture::open(dir.path());
        for h in 0..3i64 {
            fx.put_block(&simple_block(h, 1_600_000_000, 1));
            fx.put_utxo_tx(&RawUtxoTransaction {
                tx_hash: vec![h as u8; 32],
                block_height: h,
                tx_index: 0,
                coinbase: true,
                inputs: vec![],
                outputs: vec![],
                timestamp: 1_600_000_000,
            });
        }
        let store = RawStore::new(fx.db, SchemaType::Utxo);
        let bundles = store.fetch_range(0, 2).unwrap();
        assert_eq!(bundles.len(), 3);
        for (i, b) in bundles.iter().enumerate() {
            assert_eq!(b.block.height, i as i64);
            match &b.txs {
                BundleTxs::Utxo(txs) => assert_eq!(txs.len(), 1),
                _ => panic!("wrong family"),
            }
        }
    }

    #[test]
    fn test_missing_tx_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let fx = RawFixture::open(dir.path());
        fx.put_block(&simple_block(0, 1_600_000_000, 2));
        let store = RawStore::new(fx.db, SchemaType::Utxo);
        assert!(matches!(
            store.fetch_range(0, 0),
            Err(UpdateError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_rate_table_is_date_ascending() {
        let dir = TempDir::new().unwrap();
        let fx = RawFixture::open(dir.path());
        let mut rates = BTreeMap::new();
        rates.insert("USD".to_string(), 10.0f32);
        fx.put_rate("2020-09-14", &rates);
        fx.put_rate("2020-09-12", &rates);
        fx.put_rate("2020-09-13", &rates);
        let store = RawStore::new(fx.db, SchemaType::Utxo);
        let table = store.exchange_rate_table().unwrap();
        let dates: Vec<&str> = table.iter().map(|(d, _)| d.as_str()).collect();
        assert_eq!(dates, vec!["2020-09-12", "2020-09-13", "2020-09-14"]);
    }
}
