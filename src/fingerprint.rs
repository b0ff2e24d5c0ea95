use crc::{Crc, CRC_32_ISCSI};

/// CRC32 with the Castagnoli polynomial, the sole index key used by
/// on-disk tables.
const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Computes the fingerprint of a key.
pub fn of(key: &[u8]) -> u32 {
    CASTAGNOLI.checksum(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        // CRC-32/ISCSI check value.
        assert_eq!(of(b"123456789"), 0xE306_9283);
        assert_eq!(of(b""), 0);
    }

    #[test]
    fn test_distinct_keys_usually_differ() {
        assert_ne!(of(b"key_001"), of(b"key_002"));
        assert_ne!(of(b"a"), of(b"b"));
    }

    #[test]
    fn test_collision_pair() {
        // Two distinct keys with the same fingerprint, used by the
        // collision-handling tests across the crate.
        assert_ne!(b"yokzxonb".as_slice(), b"xyphecky".as_slice());
        assert_eq!(of(b"yokzxonb"), 0x3430_BDFA);
        assert_eq!(of(b"xyphecky"), 0x3430_BDFA);
    }
}
