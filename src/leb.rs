//! LEB128 integer encoding, shared by every section and instruction the
//! binary backend emits.

/// Appends the unsigned LEB128 encoding of `value`.
pub fn write_uleb128(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

/// Appends the signed LEB128 encoding of `value`.
pub fn write_sleb128(buf: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let sign_bit_set = byte & 0x40 != 0;
        if (value == 0 && !sign_bit_set) || (value == -1 && sign_bit_set) {
            buf.push(byte);
            break;
        }
        buf.push(byte | 0x80);
    }
}

/// Number of bytes `write_uleb128` would emit for `value`, used to size
/// deferred length prefixes before the payload itself is known.
pub fn uleb128_len(mut value: u64) -> usize {
    let mut len = 1;
    value >>= 7;
    while value != 0 {
        len += 1;
        value >>= 7;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Test-only decoder: reads back what `write_uleb128` produced, so the
    /// round-trip property can be checked without pulling a decoding crate
    /// into the library itself (this crate never decodes anything).
    fn read_uleb128(buf: &[u8]) -> (u64, usize) {
        let mut value = 0u64;
        let mut shift = 0;
        let mut i = 0;
        loop {
            let byte = buf[i];
            value |= ((byte & 0x7f) as u64) << shift;
            i += 1;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        (value, i)
    }

    fn read_sleb128(buf: &[u8]) -> (i64, usize) {
        let mut value = 0i64;
        let mut shift = 0;
        let mut i = 0;
        let mut byte;
        loop {
            byte = buf[i];
            value |= ((byte & 0x7f) as i64) << shift;
            shift += 7;
            i += 1;
            if byte & 0x80 == 0 {
                break;
            }
        }
        if shift < 64 && byte & 0x40 != 0 {
            value |= -1i64 << shift;
        }
        (value, i)
    }

    proptest! {
        #[test]
        fn uleb128_round_trips(value: u64) {
            let mut buf = Vec::new();
            write_uleb128(&mut buf, value);
            let (decoded, consumed) = read_uleb128(&buf);
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(consumed, buf.len());
        }

        #[test]
        fn sleb128_round_trips(value: i64) {
            let mut buf = Vec::new();
            write_sleb128(&mut buf, value);
            let (decoded, consumed) = read_sleb128(&buf);
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(consumed, buf.len());
        }

        /// Signed LEB128's minimal-length property: every byte but the last
        /// carries a continuation bit, and the encoding never emits a
        /// redundant final byte (e.g. `-1` is one byte, not two).
        #[test]
        fn sleb128_is_minimal_length(value: i64) {
            let mut buf = Vec::new();
            write_sleb128(&mut buf, value);
            for &byte in &buf[..buf.len() - 1] {
                prop_assert!(byte & 0x80 != 0);
            }
            prop_assert!(buf.last().unwrap() & 0x80 == 0);
        }
    }

    #[test]
    fn uleb128_small_values() {
        let mut buf = Vec::new();
        write_uleb128(&mut buf, 0);
        assert_eq!(buf, vec![0x00]);

        buf.clear();
        write_uleb128(&mut buf, 127);
        assert_eq!(buf, vec![0x7f]);

        buf.clear();
        write_uleb128(&mut buf, 128);
        assert_eq!(buf, vec![0x80, 0x01]);

        buf.clear();
        write_uleb128(&mut buf, 624485);
        assert_eq!(buf, vec![0xe5, 0x8e, 0x26]);
    }

    #[test]
    fn sleb128_signed_values() {
        let mut buf = Vec::new();
        write_sleb128(&mut buf, 0);
        assert_eq!(buf, vec![0x00]);

        buf.clear();
        write_sleb128(&mut buf, -1);
        assert_eq!(buf, vec![0x7f]);

        buf.clear();
        write_sleb128(&mut buf, -624485);
        assert_eq!(buf, vec![0x9b, 0xf1, 0x59]);

        buf.clear();
        write_sleb128(&mut buf, 624485);
        assert_eq!(buf, vec![0xe5, 0x8e, 0x26, 0x00]);
    }

    #[test]
    fn uleb128_len_matches_actual_length() {
        for value in [0u64, 1, 127, 128, 16384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_uleb128(&mut buf, value);
            assert_eq!(buf.len(), uleb128_len(value));
        }
    }
}
