//! Authoritative catalog of the on-disk tables.
//!
//! The manifest records which tables exist at level 0 and level 1, the
//! fingerprint range and size of each, and the monotonic file id counter.
//! It is persisted as a single snapshot file, atomically replaced on every
//! save (write temporary, fsync, rename), so a crash leaves either the old
//! or the new catalog, never a torn one.
//!
//! All operations go through one guarding lock. The snapshot helpers copy
//! the level vectors out under the lock so that callers never hold it
//! across table I/O; the lock is held across disk I/O only inside
//! [`Manifest::save`] itself.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::errdata;
use crate::error::Result;

pub const MANIFEST_FILE: &str = "manifest";
const MANIFEST_TMP_FILE: &str = "manifest.tmp";

const MAGIC: &[u8; 8] = b"SILTDB\0M";
const VERSION: u32 = 1;

/// Per-table metadata tracked by the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableMeta {
    pub id: u32,
    pub entries: u32,
    pub min_fp: u32,
    pub max_fp: u32,
    pub size: u32,
}

impl TableMeta {
    /// True iff the fingerprint ranges intersect.
    pub fn intersects(&self, other: &TableMeta) -> bool {
        self.min_fp <= other.max_fp && other.min_fp <= self.max_fp
    }

    /// True iff this table's range contains `other`'s.
    pub fn contains(&self, other: &TableMeta) -> bool {
        self.min_fp <= other.min_fp && other.max_fp <= self.max_fp
    }

    /// Entries per byte. Small-range dense tables compact first.
    pub fn density(&self) -> f64 {
        self.entries as f64 / self.size.max(1) as f64
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.write_u32::<LittleEndian>(self.id).unwrap();
        buf.write_u32::<LittleEndian>(self.entries).unwrap();
        buf.write_u32::<LittleEndian>(self.min_fp).unwrap();
        buf.write_u32::<LittleEndian>(self.max_fp).unwrap();
        buf.write_u32::<LittleEndian>(self.size).unwrap();
    }

    fn decode_from(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Self {
            id: cursor.read_u32::<LittleEndian>()?,
            entries: cursor.read_u32::<LittleEndian>()?,
            min_fp: cursor.read_u32::<LittleEndian>()?,
            max_fp: cursor.read_u32::<LittleEndian>()?,
            size: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

/// Relation of a level 0 table's fingerprint range to the level 1 tables,
/// driving what compaction does with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// No level 1 range intersects; the table is promoted to level 1 unchanged.
    Disjoint,
    /// The named level 1 table's range contains it; the two merge into one.
    Contained(u32),
    /// Ranges overlap without containment; the two merge and the output
    /// range becomes the union.
    Overlapping(u32),
}

struct Inner {
    next_file_id: u32,
    level0: Vec<TableMeta>,
    level1: Vec<TableMeta>,
}

pub struct Manifest {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl Manifest {
    /// Reads the manifest file under `dir` if present, otherwise starts an
    /// empty catalog.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let inner = if path.exists() {
            let mut buf = Vec::new();
            File::open(&path)?.read_to_end(&mut buf)?;
            Self::decode(&buf)?
        } else {
            Inner {
                next_file_id: 0,
                level0: Vec::new(),
                level1: Vec::new(),
            }
        };
        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    /// Serializes the catalog and atomically replaces the manifest file.
    /// The guarding lock is held across the write and rename; a poisoned
    /// lock surfaces as an error here rather than a panic, since this is
    /// the durability path.
    pub fn save(&self) -> Result<()> {
        let inner = self.inner.lock()?;
        let buf = Self::encode(&inner);

        let tmp = self.path.with_file_name(MANIFEST_TMP_FILE);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Returns the next monotonic file id. Ids are never reused, across
    /// levels or across runs.
    pub fn next_file_id(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_file_id;
        inner.next_file_id += 1;
        id
    }

    /// The id the next allocation will return, without allocating.
    pub fn peek_next_file_id(&self) -> u32 {
        self.inner.lock().unwrap().next_file_id
    }

    pub fn add_l0_file(&self, meta: TableMeta) {
        self.inner.lock().unwrap().level0.push(meta);
    }

    pub fn add_l1_file(&self, meta: TableMeta) {
        self.inner.lock().unwrap().level1.push(meta);
    }

    pub fn delete_l0_table(&self, id: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.level0.len();
        inner.level0.retain(|m| m.id != id);
        inner.level0.len() != before
    }

    pub fn delete_l1_table(&self, id: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.level1.len();
        inner.level1.retain(|m| m.id != id);
        inner.level1.len() != before
    }

    /// Moves a level 0 entry to level 1 without touching its file.
    pub fn promote_l0_table(&self, id: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(pos) = inner.level0.iter().position(|m| m.id == id) else {
            return false;
        };
        let meta = inner.level0.remove(pos);
        inner.level1.push(meta);
        true
    }

    pub fn l0_len(&self) -> usize {
        self.inner.lock().unwrap().level0.len()
    }

    pub fn l1_len(&self) -> usize {
        self.inner.lock().unwrap().level1.len()
    }

    /// Snapshot of the level 0 entries, released before any I/O.
    pub fn copy_l0(&self) -> Vec<TableMeta> {
        self.inner.lock().unwrap().level0.clone()
    }

    /// Snapshot of the level 1 entries, released before any I/O.
    pub fn copy_l1(&self) -> Vec<TableMeta> {
        self.inner.lock().unwrap().level1.clone()
    }

    /// Orders the level 0 entries densest first.
    pub fn sort_l0(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.level0.sort_by(|a, b| {
            b.density()
                .partial_cmp(&a.density())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    /// Classifies a level 0 table against the current level 1 tables.
    /// When several level 1 ranges intersect, the one with the smallest
    /// `min_fp` is chosen.
    pub fn find_l1_policy(&self, l0: &TableMeta) -> Placement {
        let inner = self.inner.lock().unwrap();
        let candidate = inner
            .level1
            .iter()
            .filter(|m| m.intersects(l0))
            .min_by_key(|m| m.min_fp);
        match candidate {
            None => Placement::Disjoint,
            Some(m) if m.contains(l0) => Placement::Contained(m.id),
            Some(m) => Placement::Overlapping(m.id),
        }
    }

    /// All file ids currently referenced, both levels.
    pub fn referenced_ids(&self) -> Vec<u32> {
        let inner = self.inner.lock().unwrap();
        inner
            .level0
            .iter()
            .chain(inner.level1.iter())
            .map(|m| m.id)
            .collect()
    }

    fn encode(inner: &Inner) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.write_u32::<LittleEndian>(VERSION).unwrap();
        buf.write_u32::<LittleEndian>(inner.next_file_id).unwrap();
        buf.write_u32::<LittleEndian>(inner.level0.len() as u32)
            .unwrap();
        for meta in &inner.level0 {
            meta.encode_into(&mut buf);
        }
        buf.write_u32::<LittleEndian>(inner.level1.len() as u32)
            .unwrap();
        for meta in &inner.level1 {
            meta.encode_into(&mut buf);
        }
        buf
    }

    fn decode(buf: &[u8]) -> Result<Inner> {
        let mut cursor = Cursor::new(buf);

        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic)?;
        if magic != *MAGIC {
            return errdata!("invalid manifest magic");
        }
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != VERSION {
            return errdata!("unsupported manifest version: {version}");
        }

        let next_file_id = cursor.read_u32::<LittleEndian>()?;
        let l0_count = cursor.read_u32::<LittleEndian>()? as usize;
        let mut level0 = Vec::with_capacity(l0_count);
        for _ in 0..l0_count {
            level0.push(TableMeta::decode_from(&mut cursor)?);
        }
        let l1_count = cursor.read_u32::<LittleEndian>()? as usize;
        let mut level1 = Vec::with_capacity(l1_count);
        for _ in 0..l1_count {
            level1.push(TableMeta::decode_from(&mut cursor)?);
        }

        Ok(Inner {
            next_file_id,
            level0,
            level1,
        })
    }
}
