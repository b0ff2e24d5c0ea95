//! Table construction by splicing and merging existing tables.
//!
//! Compaction never re-encodes entry records: the payload regions of the
//! source tables are copied byte-for-byte and their fingerprint indexes
//! are folded together with shifted offsets. On a duplicate fingerprint
//! the later-merged source replaces the earlier one, so callers append
//! the lower (older) file id first and the newer data wins.

use std::collections::HashMap;

use crate::error::Result;
use crate::table::format::{self, Footer};
use crate::table::Table;

pub struct MergeBuilder {
    payload: Vec<u8>,
    index: HashMap<u32, u32>,
}

impl MergeBuilder {
    /// Creates a builder expecting roughly `capacity_hint` payload bytes.
    pub fn new(capacity_hint: usize) -> Self {
        Self {
            payload: Vec::with_capacity(capacity_hint),
            index: HashMap::new(),
        }
    }

    /// Payload bytes accumulated so far. Callers snapshot this as the
    /// `base_offset` for the matching [`merge_index`](Self::merge_index)
    /// call before splicing a source table.
    pub fn payload_len(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Splices `table`'s payload region into the output, byte-for-byte.
    pub fn append_payload(&mut self, table: &Table) -> Result<()> {
        let payload = table.payload()?;
        self.payload.extend_from_slice(&payload);
        Ok(())
    }

    /// Folds a source index into the output, shifting every recorded
    /// offset by `base_offset`. Duplicate fingerprints are replaced by
    /// the later source.
    pub fn merge_index(&mut self, index: &HashMap<u32, u32>, base_offset: u32) {
        for (&fp, &offset) in index {
            self.index.insert(fp, offset + base_offset);
        }
    }

    /// Appends a single entry record, used by the load-balance split.
    /// The first record seen for a fingerprint stays the bucket head the
    /// index addresses; colliding records appended after it remain
    /// reachable through the bucket walk.
    pub fn add(&mut self, key: &[u8], value: &[u8], fp: u32) {
        let offset = self.payload.len() as u32;
        self.index.entry(fp).or_insert(offset);
        format::write_entry(&mut self.payload, key, value);
    }

    /// Number of distinct fingerprints accumulated.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Appends the serialized index and footer and returns the complete
    /// table image.
    pub fn finish(self) -> Vec<u8> {
        let mut out = self.payload;
        let meta_offset = out.len() as u32;
        let entries = self.index.len() as u32;
        let min_fp = self.index.keys().min().copied().unwrap_or(0);
        let max_fp = self.index.keys().max().copied().unwrap_or(0);

        for (&fp, &offset) in &self.index {
            format::write_index_record(&mut out, fp, offset);
        }

        let footer = Footer {
            meta_offset,
            entries,
            min_fp,
            max_fp,
            size: (out.len() + Footer::SIZE) as u32,
        };
        out.extend_from_slice(&footer.encode());
        out
    }
}
