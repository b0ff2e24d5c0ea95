//! Immutable on-disk tables.
//!
//! A table is written once, by a memtable flush or by the merge builder,
//! and never modified. The handle keeps the file open and the fingerprint
//! index resident; payload records are read on demand.

pub mod builder;
pub mod format;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::errdata;
use crate::error::Result;
use crate::fingerprint;
use format::{Footer, INDEX_RECORD_SIZE};

/// Path of table `id` under `dir`.
pub fn table_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{id:08}.table"))
}

/// Temporary path used while table `id` is being written.
pub fn tmp_table_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{id:08}.table.tmp"))
}

/// Removes table `id`'s file from `dir`.
pub fn remove_table(dir: &Path, id: u32) -> Result<()> {
    fs::remove_file(table_path(dir, id))?;
    Ok(())
}

/// Writes a finished table image to disk as table `id`, atomically via a
/// temporary file, returning the final path and file size.
pub fn write_table_file(dir: &Path, id: u32, buf: &[u8]) -> Result<(PathBuf, u64)> {
    let tmp = tmp_table_path(dir, id);
    let path = table_path(dir, id);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    Ok((path, buf.len() as u64))
}

/// Read handle for one on-disk table.
pub struct Table {
    id: u32,
    path: PathBuf,
    file: File,
    footer: Footer,
    index: HashMap<u32, u32>,
}

impl Table {
    /// Opens table `id` under `dir`, loading its footer and index.
    pub fn open(dir: &Path, id: u32) -> Result<Self> {
        let path = table_path(dir, id);
        let mut file = File::open(&path)?;
        let len = file.metadata()?.len();
        if len < Footer::SIZE as u64 {
            return errdata!("table {id} is {len} bytes, shorter than a footer");
        }

        file.seek(SeekFrom::End(-(Footer::SIZE as i64)))?;
        let mut buf = [0u8; Footer::SIZE];
        file.read_exact(&mut buf)?;
        let footer = Footer::decode(&buf)?;
        if footer.size as u64 != len {
            return errdata!(
                "table {id} footer declares {} bytes but the file holds {len}",
                footer.size
            );
        }

        let mut index_data = vec![0u8; footer.entries as usize * INDEX_RECORD_SIZE];
        file.seek(SeekFrom::Start(footer.meta_offset as u64))?;
        file.read_exact(&mut index_data)?;

        let mut index = HashMap::with_capacity(footer.entries as usize);
        let mut cursor = Cursor::new(index_data.as_slice());
        for _ in 0..footer.entries {
            let fp = cursor.read_u32::<LittleEndian>()?;
            let offset = cursor.read_u32::<LittleEndian>()?;
            if offset >= footer.meta_offset {
                return errdata!(
                    "table {id} index points fingerprint {fp:#010x} outside the payload region"
                );
            }
            if index.insert(fp, offset).is_some() {
                return errdata!("table {id} index repeats fingerprint {fp:#010x}");
            }
        }

        Ok(Self {
            id,
            path,
            file,
            footer,
            index,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total file size in bytes.
    pub fn size(&self) -> u64 {
        self.footer.size as u64
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    /// Fingerprint index, offsets relative to the payload region start.
    pub fn index(&self) -> &HashMap<u32, u32> {
        &self.index
    }

    /// True iff `fp` falls inside this table's fingerprint range.
    pub fn covers(&self, fp: u32) -> bool {
        self.footer.entries > 0 && self.footer.min_fp <= fp && fp <= self.footer.max_fp
    }

    /// Returns the value stored for `key`, whose fingerprint is `fp`.
    ///
    /// A fingerprint hit with a mismatched key walks the contiguous bucket
    /// records before reporting not-found; a collision with a different
    /// key is a legitimate miss at this table.
    pub fn get(&self, fp: u32, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .bucket(fp)?
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v))
    }

    /// Reads the live records for one fingerprint: the contiguous run of
    /// records at the indexed offset whose keys still hash to `fp`. An
    /// unindexed fingerprint yields no records. Overridden duplicates left
    /// behind by a merge are not addressed by the index and never appear
    /// here.
    pub fn bucket(&self, fp: u32) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let Some(&offset) = self.index.get(&fp) else {
            return Ok(Vec::new());
        };

        let mut reader = self.file.try_clone()?;
        reader.seek(SeekFrom::Start(offset as u64))?;
        let mut pos = offset as u64;
        let mut records = Vec::new();
        while pos < self.footer.meta_offset as u64 {
            let (k, v) = format::read_entry(&mut reader)?;
            pos += format::entry_record_len(&k, &v) as u64;
            if fingerprint::of(&k) != fp {
                break;
            }
            records.push((k, v));
        }
        Ok(records)
    }

    /// Streams the payload records from the beginning of the file.
    pub fn iter(&self) -> Result<TableIter> {
        let mut reader = self.file.try_clone()?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(TableIter {
            reader: BufReader::new(reader),
            remaining: self.footer.meta_offset as u64,
        })
    }

    /// Materializes the list of indexed fingerprints.
    pub fn entries(&self) -> Vec<u32> {
        self.index.keys().copied().collect()
    }

    /// Reads the raw payload region, for byte-for-byte splicing.
    pub fn payload(&self) -> Result<Vec<u8>> {
        let mut reader = self.file.try_clone()?;
        reader.seek(SeekFrom::Start(0))?;
        let mut buf = vec![0u8; self.footer.meta_offset as usize];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Streaming iterator over a table's payload records.
pub struct TableIter {
    reader: BufReader<File>,
    remaining: u64,
}

impl Iterator for TableIter {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match format::read_entry(&mut self.reader) {
            Ok((key, value)) => {
                let n = format::entry_record_len(&key, &value) as u64;
                if n > self.remaining {
                    self.remaining = 0;
                    return Some(errdata!("table payload record overruns the index region"));
                }
                self.remaining -= n;
                Some(Ok((key, value)))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::Memtable;
    use crate::tmpfs::TempDir;

    fn flushed_table(dir: &Path, id: u32, entries: &[(&[u8], &[u8])]) -> Table {
        let mt = Memtable::new(1 << 20);
        for (k, v) in entries {
            mt.set(k.to_vec(), v.to_vec());
        }
        mt.to_disk(dir, id).expect("flush failed");
        Table::open(dir, id).expect("open failed")
    }

    #[test]
    fn test_open_and_get() {
        let dir = TempDir::new().expect("temp dir");
        let table = flushed_table(
            dir.path(),
            1,
            &[
                (b"apple".as_slice(), b"fruit".as_slice()),
                (b"band", b"music"),
                (b"cherry", b"red"),
            ],
        );

        assert_eq!(table.id(), 1);
        assert_eq!(table.footer().entries, 3);
        for (k, v) in [
            (b"apple".as_slice(), b"fruit".as_slice()),
            (b"band", b"music"),
            (b"cherry", b"red"),
        ] {
            let fp = fingerprint::of(k);
            assert!(table.covers(fp));
            assert_eq!(table.get(fp, k).expect("get failed"), Some(v.to_vec()));
        }

        let missing = fingerprint::of(b"durian");
        assert_eq!(table.get(missing, b"durian").expect("get failed"), None);
    }

    #[test]
    fn test_collision_bucket_probing() {
        let dir = TempDir::new().expect("temp dir");
        // Both keys share fingerprint 0x3430BDFA and land in one bucket.
        let table = flushed_table(
            dir.path(),
            1,
            &[
                (b"yokzxonb".as_slice(), b"v1".as_slice()),
                (b"xyphecky", b"v2"),
                (b"other", b"v3"),
            ],
        );

        assert_eq!(table.footer().entries, 2);
        let fp = fingerprint::of(b"yokzxonb");
        assert_eq!(table.get(fp, b"yokzxonb").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(table.get(fp, b"xyphecky").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_collision_false_positive_is_a_miss() {
        let dir = TempDir::new().expect("temp dir");
        let table = flushed_table(dir.path(), 1, &[(b"yokzxonb".as_slice(), b"v1".as_slice())]);

        // Same fingerprint, different key, never written.
        let fp = fingerprint::of(b"xyphecky");
        assert_eq!(table.get(fp, b"xyphecky").unwrap(), None);
    }

    #[test]
    fn test_iter_yields_all_records() {
        let dir = TempDir::new().expect("temp dir");
        let table = flushed_table(
            dir.path(),
            1,
            &[(b"a".as_slice(), b"1".as_slice()), (b"b", b"2"), (b"c", b"3")],
        );

        let records: Result<Vec<_>> = table.iter().expect("iter failed").collect();
        let mut records = records.expect("record read failed");
        records.sort();
        assert_eq!(
            records,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn test_entries_lists_fingerprints() {
        let dir = TempDir::new().expect("temp dir");
        let table = flushed_table(dir.path(), 1, &[(b"a".as_slice(), b"1".as_slice()), (b"b", b"2")]);

        let mut fps = table.entries();
        fps.sort();
        let mut expected = vec![fingerprint::of(b"a"), fingerprint::of(b"b")];
        expected.sort();
        assert_eq!(fps, expected);
    }

    #[test]
    fn test_payload_matches_meta_offset() {
        let dir = TempDir::new().expect("temp dir");
        let table = flushed_table(dir.path(), 1, &[(b"key".as_slice(), b"value".as_slice())]);
        let payload = table.payload().expect("payload read failed");
        assert_eq!(payload.len(), table.footer().meta_offset as usize);
    }

    #[test]
    fn test_open_rejects_truncated_file() {
        let dir = TempDir::new().expect("temp dir");
        let mt = Memtable::new(1 << 20);
        mt.set(b"key".to_vec(), b"value".to_vec());
        let (path, size) = mt.to_disk(dir.path(), 7).expect("flush failed");

        let file = fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .expect("reopen failed");
        file.set_len(size - 1).expect("truncate failed");

        assert!(Table::open(dir.path(), 7).is_err());
    }

    #[test]
    fn test_open_missing_file_fails() {
        let dir = TempDir::new().expect("temp dir");
        assert!(Table::open(dir.path(), 42).is_err());
    }
}
