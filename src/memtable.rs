//! Fingerprint-keyed memtable.
//!
//! The in-memory accumulator of pending writes. Point `get` is the only
//! read operation the store offers, so entries are keyed by the CRC32-C
//! fingerprint of the key rather than by the key itself; the on-disk
//! tables flushed from here use the same index key.
//!
//! A `SkipMap` is used for the same reasons the rest of the stack favors
//! it: lock-free concurrent readers against a single writer, and cheap
//! access to the smallest and largest fingerprint for the table metadata.
//! Each fingerprint maps to a small bucket of (key, value) pairs so that
//! a fingerprint collision between distinct keys cannot drop a write;
//! `set` replaces the bucket entry with an equal key or appends.
//!
//! Only the accept-write task mutates a memtable. Once rotated into the
//! immutable slot it is read-only by convention and is serialized to a
//! level 0 table by the flush task.

use crossbeam_skiplist::SkipMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Result;
use crate::fingerprint;
use crate::table::format::{self, Footer};
use crate::table::{table_path, tmp_table_path};

pub struct Memtable {
    buckets: SkipMap<u32, Vec<(Vec<u8>, Vec<u8>)>>,
    occupied: AtomicUsize,
    capacity: usize,
}

impl Memtable {
    /// Creates an empty memtable bounded by `capacity` bytes of key and
    /// value payload.
    pub fn new(capacity: usize) -> Self {
        Self {
            buckets: SkipMap::new(),
            occupied: AtomicUsize::new(0),
            capacity,
        }
    }

    /// True iff `n` more payload bytes fit the byte budget. Writers call
    /// this before `set` and rotate the memtable on false.
    pub fn is_enough_space(&self, n: usize) -> bool {
        self.occupied.load(Ordering::SeqCst) + n <= self.capacity
    }

    /// Inserts or overwrites by fingerprint. An entry with an equal key is
    /// replaced; a colliding entry with a different key is kept alongside.
    pub fn set(&self, key: Vec<u8>, value: Vec<u8>) {
        let fp = fingerprint::of(&key);
        let mut bucket = self
            .buckets
            .get(&fp)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut delta = 0isize;
        match bucket.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => {
                delta += value.len() as isize - slot.1.len() as isize;
                slot.1 = value;
            }
            None => {
                delta += (key.len() + value.len()) as isize;
                bucket.push((key, value));
            }
        }

        self.buckets.insert(fp, bucket);
        if delta >= 0 {
            self.occupied.fetch_add(delta as usize, Ordering::SeqCst);
        } else {
            self.occupied.fetch_sub(delta.unsigned_abs(), Ordering::SeqCst);
        }
    }

    /// Returns the stored value for `key`. Compares the full key to defend
    /// against fingerprint collisions.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let fp = fingerprint::of(key);
        let entry = self.buckets.get(&fp)?;
        entry
            .value()
            .iter()
            .find(|(k, _)| k.as_slice() == key)
            .map(|(_, v)| v.clone())
    }

    /// Number of distinct fingerprints.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Smallest observed fingerprint, 0 when empty.
    pub fn min_range(&self) -> u32 {
        self.buckets.front().map(|e| *e.key()).unwrap_or(0)
    }

    /// Largest observed fingerprint, 0 when empty.
    pub fn max_range(&self) -> u32 {
        self.buckets.back().map(|e| *e.key()).unwrap_or(0)
    }

    /// Key and value payload bytes currently held.
    pub fn occupied_space(&self) -> usize {
        self.occupied.load(Ordering::SeqCst)
    }

    /// Serializes the memtable in on-disk table format as table `id` under
    /// `dir`, returning the final path and the file size in bytes. The
    /// file is written to a temporary name and atomically renamed into
    /// place.
    pub fn to_disk(&self, dir: &Path, id: u32) -> Result<(PathBuf, u64)> {
        let mut payload = Vec::with_capacity(self.occupied_space());
        let mut index = Vec::with_capacity(self.len() * format::INDEX_RECORD_SIZE);

        for entry in self.buckets.iter() {
            // Bucket records are contiguous; the index addresses the first.
            format::write_index_record(&mut index, *entry.key(), payload.len() as u32);
            for (key, value) in entry.value() {
                format::write_entry(&mut payload, key, value);
            }
        }

        let footer = Footer {
            meta_offset: payload.len() as u32,
            entries: self.len() as u32,
            min_fp: self.min_range(),
            max_fp: self.max_range(),
            size: (payload.len() + index.len() + Footer::SIZE) as u32,
        };

        let tmp = tmp_table_path(dir, id);
        let path = table_path(dir, id);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&payload)?;
            file.write_all(&index)?;
            file.write_all(&footer.encode())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        Ok((path, footer.size as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_set_and_get() {
        let mt = Memtable::new(1024);
        mt.set(b"key1".to_vec(), b"value1".to_vec());
        mt.set(b"key2".to_vec(), b"value2".to_vec());

        assert_eq!(mt.get(b"key1"), Some(b"value1".to_vec()));
        assert_eq!(mt.get(b"key2"), Some(b"value2".to_vec()));
        assert_eq!(mt.get(b"missing"), None);
        assert_eq!(mt.len(), 2);
    }

    #[test]
    fn test_overwrite_replaces_and_adjusts_space() {
        let mt = Memtable::new(1024);
        mt.set(b"key".to_vec(), b"aaaa".to_vec());
        let after_first = mt.occupied_space();
        assert_eq!(after_first, 3 + 4);

        mt.set(b"key".to_vec(), b"bb".to_vec());
        assert_eq!(mt.get(b"key"), Some(b"bb".to_vec()));
        assert_eq!(mt.occupied_space(), 3 + 2);
        assert_eq!(mt.len(), 1);
    }

    #[test]
    fn test_collision_keeps_both_keys() {
        // Distinct keys, identical CRC32-C fingerprint.
        let (k1, k2) = (b"yokzxonb".to_vec(), b"xyphecky".to_vec());
        assert_eq!(fingerprint::of(&k1), fingerprint::of(&k2));

        let mt = Memtable::new(1024);
        mt.set(k1.clone(), b"v1".to_vec());
        mt.set(k2.clone(), b"v2".to_vec());

        assert_eq!(mt.get(&k1), Some(b"v1".to_vec()));
        assert_eq!(mt.get(&k2), Some(b"v2".to_vec()));
        // Distinct fingerprints, not distinct keys.
        assert_eq!(mt.len(), 1);
    }

    #[test]
    fn test_space_budget() {
        let mt = Memtable::new(16);
        assert!(mt.is_enough_space(16));
        mt.set(b"12345678".to_vec(), b"12345678".to_vec());
        assert!(mt.is_enough_space(0));
        assert!(!mt.is_enough_space(1));
    }

    #[test]
    fn test_fingerprint_range_tracking() {
        let mt = Memtable::new(1024);
        assert_eq!(mt.min_range(), 0);
        assert_eq!(mt.max_range(), 0);

        mt.set(b"a".to_vec(), b"1".to_vec());
        mt.set(b"b".to_vec(), b"2".to_vec());
        mt.set(b"c".to_vec(), b"3".to_vec());

        let fps = [
            fingerprint::of(b"a"),
            fingerprint::of(b"b"),
            fingerprint::of(b"c"),
        ];
        assert_eq!(mt.min_range(), *fps.iter().min().unwrap());
        assert_eq!(mt.max_range(), *fps.iter().max().unwrap());
    }

    #[test]
    fn test_to_disk_writes_consistent_footer() {
        let dir = TempDir::new().expect("temp dir");
        let mt = Memtable::new(1024);
        for i in 0..10 {
            mt.set(
                format!("key_{i:03}").into_bytes(),
                format!("value_{i}").into_bytes(),
            );
        }

        let (path, size) = mt.to_disk(dir.path(), 1).expect("flush failed");
        assert!(path.ends_with("00000001.table"));
        assert_eq!(std::fs::metadata(&path).expect("metadata").len(), size);

        // No temporary file left behind.
        assert!(!tmp_table_path(dir.path(), 1).exists());
    }
}
