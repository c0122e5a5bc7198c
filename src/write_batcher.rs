/// Chunked Atomic Writer with Retry
///
/// All operations of one chunk are committed in a single RocksDB
/// WriteBatch across column families: either the whole chunk lands or
/// none of it does. Oversized groups are split into chunks of
/// `chunk_size` operations so no single request balloons.
///
/// Transient failures (busy, try-again, timeout) retry with exponential
/// backoff: `base_delay * 2^attempt`, capped, up to `max_attempts`.
/// Anything else is surfaced immediately as a definitive failure.

use std::sync::Arc;
use std::time::Duration;

use rocksdb::{WriteBatch, DB};
use tracing::warn;

use crate::error::UpdateError;
use crate::metrics;

/// A single database operation, described before it is applied so the
/// retry layer can replay it verbatim.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put {
        cf_name: &'static str,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf_name: &'static str,
        key: Vec<u8>,
    },
}

impl WriteOp {
    pub fn cf_name(&self) -> &'static str {
        match self {
            WriteOp::Put { cf_name, .. } | WriteOp::Delete { cf_name, .. } => cf_name,
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            cap: Duration::from_secs(30),
            max_attempts: 6,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.cap)
    }
}

pub struct WriteBatcher {
    db: Arc<DB>,
    chunk_size: usize,
    retry: RetryPolicy,
}

impl WriteBatcher {
    pub fn new(db: Arc<DB>, chunk_size: usize, retry: RetryPolicy) -> Self {
        debug_assert!(chunk_size > 0);
        Self {
            db,
            chunk_size: chunk_size.max(1),
            retry,
        }
    }

    /// Write all operations, chunked, each chunk atomic, retrying
    /// transient failures per chunk. Chunks are applied in order, so a
    /// sorted input produces byte-identical writes on every retry.
    pub async fn write(&self, ops: Vec<WriteOp>) -> Result<(), UpdateError> {
        if ops.is_empty() {
            return Ok(());
        }
        for chunk in ops.chunks(self.chunk_size) {
            self.write_chunk_with_retry(chunk.to_vec()).await?;
        }
        Ok(())
    }

    /// Write one group atomically without chunking. Used for the journal
    /// and the commit point, which must not be split.
    pub async fn write_atomic(&self, ops: Vec<WriteOp>) -> Result<(), UpdateError> {
        if ops.is_empty() {
            return Ok(());
        }
        self.write_chunk_with_retry(ops).await
    }

    async fn write_chunk_with_retry(&self, chunk: Vec<WriteOp>) -> Result<(), UpdateError> {
        let mut attempt = 0u32;
        loop {
            match self.apply_chunk(chunk.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    attempt += 1;
                    metrics::WRITE_RETRIES.inc();
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient write failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(UpdateError::WriteTimeout { detail, .. }) => {
                    return Err(UpdateError::WriteTimeout {
                        attempts: attempt + 1,
                        detail,
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn apply_chunk(&self, chunk: Vec<WriteOp>) -> Result<(), UpdateError> {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut batch = WriteBatch::default();
            for op in &chunk {
                let cf = db.cf_handle(op.cf_name()).ok_or_else(|| {
                    UpdateError::WriteRejected {
                        detail: format!("column family not found: {}", op.cf_name()),
                    }
                })?;
                match op {
                    WriteOp::Put { key, value, .. } => batch.put_cf(&cf, key, value),
                    WriteOp::Delete { key, .. } => batch.delete_cf(&cf, key),
                }
            }
            // Single atomic commit for the whole chunk.
            db.write(batch).map_err(UpdateError::from)
        })
        .await
        .map_err(|e| UpdateError::Store {
            detail: format!("write task panicked: {}", e),
        })?
    }
}
