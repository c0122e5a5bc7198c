/// Address-ID Allocator
///
/// Issues dense, monotone i32 ids. The in-memory counter is owned by the
/// coordinator and seeded from the persisted high-water mark; the index
/// rows for newly issued ids travel in the same write group as the first
/// aggregate row that uses them, so an id either commits with its data or
/// not at all.

use std::collections::HashSet;

use tracing::debug;

use crate::error::UpdateError;
use crate::transformed_store::TransformedStore;
use crate::types::{textual_address, AddressBytes, SchemaType};

/// Partitioning prefix: first `len` characters of the textual form.
pub fn address_prefix(address: &[u8], schema: SchemaType, len: usize) -> String {
    let text = textual_address(address, schema);
    text.chars().take(len).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub address: AddressBytes,
    pub address_id: i32,
    pub is_new: bool,
}

pub struct IdAllocator {
    next_id: i32,
    schema: SchemaType,
    prefix_length: usize,
}

impl IdAllocator {
    /// `highest_existing` is -1 for an empty keyspace.
    pub fn new(highest_existing: i32, schema: SchemaType, prefix_length: usize) -> Self {
        Self {
            next_id: highest_existing + 1,
            schema,
            prefix_length,
        }
    }

    pub fn highest_id(&self) -> i32 {
        self.next_id - 1
    }

    /// Resolve ids for `addresses`, issuing new ones in input order.
    ///
    /// The caller passes addresses in first-sighting order, mirroring
    /// (block_height, tx_position, input/output position), which makes
    /// the assignment reproducible. Duplicates are deduplicated on the
    /// first occurrence.
    pub fn allocate(
        &mut self,
        store: &TransformedStore,
        addresses: &[AddressBytes],
    ) -> Result<Vec<Assignment>, UpdateError> {
        let mut seen: HashSet<&[u8]> = HashSet::with_capacity(addresses.len());
        let mut out: Vec<Assignment> = Vec::with_capacity(addresses.len());

        for address in addresses {
            if seen.contains(address.as_slice()) {
                continue;
            }
            let prefix = address_prefix(address, self.schema, self.prefix_length);
            let (address_id, is_new) = match store.get_address_id(&prefix, address)? {
                Some(existing) => {
                    if existing > self.highest_id() {
                        return Err(UpdateError::invariant(format!(
                            "stored address id {} exceeds allocator high-water mark {}",
                            existing,
                            self.highest_id()
                        )));
                    }
                    (existing, false)
                }
                None => {
                    let id = self.next_id;
                    self.next_id = self.next_id.checked_add(1).ok_or_else(|| {
                        UpdateError::invariant("address id space exhausted")
                    })?;
                    (id, true)
                }
            };
            seen.insert(address.as_slice());
            out.push(Assignment {
                address: address.clone(),
                address_id,
                is_new,
            });
        }

        let new_count = out.iter().filter(|a| a.is_new).count();
        if new_count > 0 {
            debug!(
                new = new_count,
                highest = self.highest_id(),
                "allocated address ids"
            );
        }
        Ok(out)
    }
}
