/// Key Encoding Helpers
///
/// Centralized builders for every column-family key so encodings stay
/// consistent between the writer, the readers, and the diagnostic tools.
///
/// CONVENTIONS:
/// - Ids and bucket groups are little-endian fixed-width integers.
/// - Partitioned tables put the bucket group first so one partition's rows
///   are byte-contiguous.
/// - `address_transactions` stores the transaction id bitwise-inverted so
///   a forward scan yields transactions newest-first (the table's
///   clustering order is DESC).
/// - The history table uses big-endian block ids so a forward scan is
///   chronological.

use byteorder::{ByteOrder, LittleEndian};

/// Integer-division bucket of an id space.
pub fn group(id: i64, bucket_size: i32) -> i32 {
    debug_assert!(bucket_size > 0);
    (id / bucket_size as i64) as i32
}

/// 64-bit finalizer mix (splitmix64). Used to derive secondary shard ids
/// from clustering ids; must stay stable across releases because it is
/// baked into written keys.
pub fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Secondary shard for a hot partition.
pub fn secondary_id(clustering_id: i64, secondary_bucket_size: i32) -> i32 {
    if secondary_bucket_size <= 1 {
        return 0;
    }
    (mix64(clustering_id as u64) % secondary_bucket_size as u64) as i32
}

fn push_i32(key: &mut Vec<u8>, v: i32) {
    let mut buf = [0u8; 4];
    LittleEndian::write_i32(&mut buf, v);
    key.extend_from_slice(&buf);
}

fn push_i64(key: &mut Vec<u8>, v: i64) {
    let mut buf = [0u8; 8];
    LittleEndian::write_i64(&mut buf, v);
    key.extend_from_slice(&buf);
}

// ---------------------------------------------------------------------------
// Raw keyspace
// ---------------------------------------------------------------------------

pub fn raw_block_key(height: i64) -> Vec<u8> {
    height.to_le_bytes().to_vec()
}

/// Raw transactions are keyed (height, within-block index) for point
/// lookups driven by the block's `tx_count`.
pub fn raw_tx_key(height: i64, tx_index: i32) -> Vec<u8> {
    let mut key = Vec::with_capacity(12);
    push_i64(&mut key, height);
    push_i32(&mut key, tx_index);
    key
}

/// Traces and logs share the (height, index) layout; per-height scans use
/// the 8-byte height prefix.
pub fn raw_height_prefix(height: i64) -> Vec<u8> {
    height.to_le_bytes().to_vec()
}

pub fn raw_trace_key(height: i64, trace_index: i32) -> Vec<u8> {
    raw_tx_key(height, trace_index)
}

pub fn raw_log_key(height: i64, log_index: i32) -> Vec<u8> {
    raw_tx_key(height, log_index)
}

/// Raw exchange rates are keyed by UTC calendar date. ISO dates sort
/// lexicographically in chronological order, which the forward-fill
/// binary search relies on.
pub fn raw_rate_key(date: &str) -> Vec<u8> {
    date.as_bytes().to_vec()
}

// ---------------------------------------------------------------------------
// Transformed keyspace
// ---------------------------------------------------------------------------

pub fn address_key(address_id: i32, bucket_size: i32) -> Vec<u8> {
    let mut key = Vec::with_capacity(8);
    push_i32(&mut key, group(address_id as i64, bucket_size));
    push_i32(&mut key, address_id);
    key
}

/// address_ids_by_address_prefix: exact-match lookup from canonical
/// address bytes to its id. The textual prefix leads so one prefix's
/// assignments are contiguous.
pub fn address_id_by_prefix_key(prefix: &str, address: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 1 + address.len());
    key.extend_from_slice(prefix.as_bytes());
    key.push(0);
    key.extend_from_slice(address);
    key
}

/// address_ids_by_address_id_group: reverse lookup id -> address bytes.
pub fn address_id_group_key(address_id: i32, bucket_size: i32) -> Vec<u8> {
    address_key(address_id, bucket_size)
}

pub fn transaction_id_by_prefix_key(prefix: &str, tx_hash: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 1 + tx_hash.len());
    key.extend_from_slice(prefix.as_bytes());
    key.push(0);
    key.extend_from_slice(tx_hash);
    key
}

pub fn transaction_id_group_key(tx_id: i64, bucket_size: i32) -> Vec<u8> {
    let mut key = Vec::with_capacity(12);
    push_i32(&mut key, group(tx_id, bucket_size));
    push_i64(&mut key, tx_id);
    key
}

pub fn block_transactions_key(height: i64, bucket_size: i32) -> Vec<u8> {
    let mut key = Vec::with_capacity(12);
    push_i32(&mut key, group(height, bucket_size));
    push_i64(&mut key, height);
    key
}

pub fn transformed_rate_key(height: i64) -> Vec<u8> {
    height.to_le_bytes().to_vec()
}

/// address_transactions, clustered by
/// (address_id, is_outgoing, inverted tx_id, currency). The inversion
/// makes a forward iterator return newest transactions first.
pub fn address_transactions_key(
    address_id: i32,
    is_outgoing: bool,
    tx_id: i64,
    currency_label: &str,
    bucket_size: i32,
    secondary_bucket_size: i32,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(22 + currency_label.len());
    push_i32(&mut key, group(address_id as i64, bucket_size));
    push_i32(&mut key, address_id);
    push_i32(&mut key, secondary_id(tx_id, secondary_bucket_size));
    key.push(is_outgoing as u8);
    key.extend_from_slice(&(!(tx_id as u64)).to_be_bytes());
    key.extend_from_slice(currency_label.as_bytes());
    key
}

/// Partition key of the secondary-id companion tables.
pub fn secondary_ids_key(partition_id: i32, bucket_size: i32) -> Vec<u8> {
    address_key(partition_id, bucket_size)
}

/// Outgoing relations partition by source, incoming by destination; the
/// counterpart id is the clustering column and also drives the secondary
/// shard.
pub fn relation_key(
    partition_address_id: i32,
    counterpart_address_id: i32,
    bucket_size: i32,
    secondary_bucket_size: i32,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    push_i32(&mut key, group(partition_address_id as i64, bucket_size));
    push_i32(&mut key, partition_address_id);
    push_i32(
        &mut key,
        secondary_id(counterpart_address_id as i64, secondary_bucket_size),
    );
    push_i32(&mut key, counterpart_address_id);
    key
}

/// balance: one row per (address, currency).
pub fn balance_key(address_id: i32, currency_label: &str, bucket_size: i32) -> Vec<u8> {
    let mut key = address_key(address_id, bucket_size);
    key.extend_from_slice(currency_label.as_bytes());
    key
}

pub fn cluster_key(cluster_id: i32, bucket_size: i32) -> Vec<u8> {
    address_key(cluster_id, bucket_size)
}

pub fn cluster_addresses_key(cluster_id: i32, address_id: i32, bucket_size: i32) -> Vec<u8> {
    let mut key = Vec::with_capacity(12);
    push_i32(&mut key, group(cluster_id as i64, bucket_size));
    push_i32(&mut key, cluster_id);
    push_i32(&mut key, address_id);
    key
}

pub fn cluster_addresses_prefix(cluster_id: i32, bucket_size: i32) -> Vec<u8> {
    let mut key = Vec::with_capacity(8);
    push_i32(&mut key, group(cluster_id as i64, bucket_size));
    push_i32(&mut key, cluster_id);
    key
}

pub fn address_cluster_key(address_id: i32, bucket_size: i32) -> Vec<u8> {
    address_key(address_id, bucket_size)
}

pub fn status_key(keyspace_name: &str) -> Vec<u8> {
    keyspace_name.as_bytes().to_vec()
}

/// Big-endian so history rows iterate in block order.
pub fn history_key(last_synced_block: i64) -> Vec<u8> {
    last_synced_block.to_be_bytes().to_vec()
}

pub fn history_block_from_key(key: &[u8]) -> Option<i64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(i64::from_be_bytes(bytes))
}

pub const SUMMARY_STATISTICS_KEY: &[u8] = b"summary";
pub const CONFIGURATION_KEY: &[u8] = b"configuration";
pub const PENDING_BATCH_KEY: &[u8] = b"pending";

pub fn token_configuration_key(ticker: &str) -> Vec<u8> {
    ticker.as_bytes().to_vec()
}
