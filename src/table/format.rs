//! On-disk table encoding.
//!
//! A table file consists of three regions, all fields little-endian:
//!
//! ```text
//! +--------------------------------------------------+
//! | Payload: [key_len:u32][value_len:u32][key][value]|  per entry record
//! +--------------------------------------------------+
//! | Index:   [fingerprint:u32][offset:u32]           |  per distinct fingerprint
//! +--------------------------------------------------+
//! | Footer (20 bytes, fixed)                         |
//! +--------------------------------------------------+
//! ```
//!
//! An index offset is the byte position of the entry record within the
//! payload region. Records sharing a fingerprint are contiguous and the
//! index points at the first of them.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::errdata;
use crate::error::Result;

/// Fixed byte length of an entry record header.
pub const ENTRY_HEADER_SIZE: usize = 8;

/// Fixed byte length of one index record.
pub const INDEX_RECORD_SIZE: usize = 8;

/// Byte length of the record holding the given key and value.
pub fn entry_record_len(key: &[u8], value: &[u8]) -> usize {
    ENTRY_HEADER_SIZE + key.len() + value.len()
}

/// Appends one entry record to `buf`.
pub fn write_entry(buf: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    buf.write_u32::<LittleEndian>(key.len() as u32).unwrap();
    buf.write_u32::<LittleEndian>(value.len() as u32).unwrap();
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
}

/// Reads one entry record from `r`.
pub fn read_entry(r: &mut impl Read) -> Result<(Vec<u8>, Vec<u8>)> {
    let key_len = r.read_u32::<LittleEndian>()? as usize;
    let value_len = r.read_u32::<LittleEndian>()? as usize;
    let mut key = vec![0u8; key_len];
    r.read_exact(&mut key)?;
    let mut value = vec![0u8; value_len];
    r.read_exact(&mut value)?;
    Ok((key, value))
}

/// Appends one index record to `buf`.
pub fn write_index_record(buf: &mut Vec<u8>, fingerprint: u32, offset: u32) {
    buf.write_u32::<LittleEndian>(fingerprint).unwrap();
    buf.write_u32::<LittleEndian>(offset).unwrap();
}

/// Fixed-size trailer at the end of every table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    /// Start byte of the index region, equal to the total payload bytes.
    pub meta_offset: u32,
    /// Number of distinct fingerprints in the index region.
    pub entries: u32,
    /// Smallest fingerprint in the table.
    pub min_fp: u32,
    /// Largest fingerprint in the table.
    pub max_fp: u32,
    /// Total file size in bytes, footer included.
    pub size: u32,
}

impl Footer {
    pub const SIZE: usize = 20;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut w = &mut buf[..];
        w.write_u32::<LittleEndian>(self.meta_offset).unwrap();
        w.write_u32::<LittleEndian>(self.entries).unwrap();
        w.write_u32::<LittleEndian>(self.min_fp).unwrap();
        w.write_u32::<LittleEndian>(self.max_fp).unwrap();
        w.write_u32::<LittleEndian>(self.size).unwrap();
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Result<Self> {
        let mut cursor = Cursor::new(&buf[..]);
        let footer = Self {
            meta_offset: cursor.read_u32::<LittleEndian>()?,
            entries: cursor.read_u32::<LittleEndian>()?,
            min_fp: cursor.read_u32::<LittleEndian>()?,
            max_fp: cursor.read_u32::<LittleEndian>()?,
            size: cursor.read_u32::<LittleEndian>()?,
        };
        footer.validate()?;
        Ok(footer)
    }

    /// Internal consistency: the three regions must tile the declared size.
    pub fn validate(&self) -> Result<()> {
        let index_len = self.entries as u64 * INDEX_RECORD_SIZE as u64;
        let expected = self.meta_offset as u64 + index_len + Self::SIZE as u64;
        if expected != self.size as u64 {
            return errdata!(
                "table footer regions do not tile file size: payload {} + index {} + footer {} != {}",
                self.meta_offset,
                index_len,
                Self::SIZE,
                self.size
            );
        }
        if self.entries > 0 && self.min_fp > self.max_fp {
            return errdata!(
                "table footer has min fingerprint {:#010x} above max {:#010x}",
                self.min_fp,
                self.max_fp
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::NamedTempFile;
    use std::io::Write;

    #[test]
    fn test_entry_roundtrip() {
        let mut buf = Vec::new();
        write_entry(&mut buf, b"key", b"value");
        assert_eq!(buf.len(), entry_record_len(b"key", b"value"));

        let (key, value) = read_entry(&mut Cursor::new(&buf)).expect("read failed");
        assert_eq!(key, b"key");
        assert_eq!(value, b"value");
    }

    #[test]
    fn test_entry_empty_key_and_value() {
        let mut buf = Vec::new();
        write_entry(&mut buf, b"", b"");
        assert_eq!(buf.len(), ENTRY_HEADER_SIZE);

        let (key, value) = read_entry(&mut Cursor::new(&buf)).expect("read failed");
        assert!(key.is_empty());
        assert!(value.is_empty());
    }

    #[test]
    fn test_entry_truncated() {
        let mut buf = Vec::new();
        write_entry(&mut buf, b"key", b"value");
        buf.truncate(buf.len() - 1);
        assert!(read_entry(&mut Cursor::new(&buf)).is_err());
    }

    #[test]
    fn test_entry_roundtrip_through_file() {
        let mut buf = Vec::new();
        write_entry(&mut buf, b"alpha", b"one");
        write_entry(&mut buf, b"beta", b"two");

        let tmp = NamedTempFile::new().expect("temp file");
        let mut file = tmp.reopen().expect("open failed");
        file.write_all(&buf).expect("write failed");
        file.sync_all().expect("sync failed");

        // Read the records back through a fresh handle on the same path.
        let mut reader = tmp.reopen().expect("reopen failed");
        let (key, value) = read_entry(&mut reader).expect("first record");
        assert_eq!((key.as_slice(), value.as_slice()), (b"alpha".as_slice(), b"one".as_slice()));
        let (key, value) = read_entry(&mut reader).expect("second record");
        assert_eq!((key.as_slice(), value.as_slice()), (b"beta".as_slice(), b"two".as_slice()));

        // A record cut short on disk surfaces as a read error, not junk.
        let file = tmp.reopen().expect("reopen failed");
        file.set_len(buf.len() as u64 - 1).expect("truncate failed");
        let mut reader = tmp.reopen().expect("reopen failed");
        assert!(read_entry(&mut reader).is_ok());
        assert!(read_entry(&mut reader).is_err());
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = Footer {
            meta_offset: 100,
            entries: 3,
            min_fp: 7,
            max_fp: 0xFFFF_0000,
            size: 100 + 3 * 8 + Footer::SIZE as u32,
        };
        let encoded = footer.encode();
        assert_eq!(encoded.len(), Footer::SIZE);
        let decoded = Footer::decode(&encoded).expect("decode failed");
        assert_eq!(decoded, footer);
    }

    #[test]
    fn test_footer_rejects_bad_tiling() {
        let footer = Footer {
            meta_offset: 100,
            entries: 3,
            min_fp: 0,
            max_fp: 1,
            size: 50,
        };
        assert!(footer.validate().is_err());
        assert!(Footer::decode(&footer.encode()).is_err());
    }

    #[test]
    fn test_footer_rejects_inverted_range() {
        let footer = Footer {
            meta_offset: 0,
            entries: 1,
            min_fp: 10,
            max_fp: 5,
            size: 8 + Footer::SIZE as u32,
        };
        assert!(footer.validate().is_err());
    }

    #[test]
    fn test_empty_table_footer() {
        let footer = Footer {
            meta_offset: 0,
            entries: 0,
            min_fp: 0,
            max_fp: 0,
            size: Footer::SIZE as u32,
        };
        assert!(footer.validate().is_ok());
    }
}
