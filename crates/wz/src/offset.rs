//! Obfuscation of the offsets stored in directory tables
//!
//! An offset field is XOR-ed with a key derived from the field's own position, the archive's
//! data start and the content hash of its version. Both directions are pure functions, so a
//! wrong hash simply yields a wrong offset.

/// Constant subtracted while deriving the offset key
pub const OFFSET_CONSTANT: u32 = 0x581C_3F6D;

fn offset_key(position: u32, data_start: u32, hash: u32) -> u32 {
    let key = (position.wrapping_sub(data_start) ^ u32::MAX)
        .wrapping_mul(hash)
        .wrapping_sub(OFFSET_CONSTANT);
    key.rotate_left(key & 0x1F)
}

/// Encodes `offset` for a field located at `position`
pub fn obfuscate(position: u32, data_start: u32, hash: u32, offset: u32) -> u32 {
    offset_key(position, data_start, hash) ^ offset.wrapping_sub(data_start.wrapping_mul(2))
}

/// Decodes the `encoded` value of a field located at `position`
pub fn deobfuscate(position: u32, data_start: u32, hash: u32, encoded: u32) -> u32 {
    (offset_key(position, data_start, hash) ^ encoded).wrapping_add(data_start.wrapping_mul(2))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn bijection() {
        for (position, data_start, hash) in [(62, 60, 1876), (0x1234, 60, 0x776), (61, 0, 1)] {
            for offset in [0, 1, 62, 0x7FFF_FFFF, u32::MAX] {
                let encoded = obfuscate(position, data_start, hash, offset);
                assert_eq!(deobfuscate(position, data_start, hash, encoded), offset);
            }
        }
    }

    #[traced_test]
    #[test]
    fn depends_on_hash_and_position() {
        let encoded = obfuscate(70, 60, 1876, 500);
        assert_ne!(deobfuscate(70, 60, 1877, encoded), 500);
        assert_ne!(deobfuscate(74, 60, 1876, encoded), 500);
    }
}
