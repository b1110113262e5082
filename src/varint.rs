// Variable-length integers.
//
// SQLite-style big-endian varint: bytes 1-8 carry 7 data bits below a
// continuation bit; a 9th byte, when needed, carries all 8 bits with no
// continuation. Every u64 therefore encodes in 1-9 bytes.

use crate::error::{DbError, Result};

/// Maximum encoded width of a varint.
pub const MAX_VARINT_LEN: usize = 9;

/// Returns the number of bytes `put_varint` would write for `v`.
pub fn varint_len(v: u64) -> usize {
    if v >= 1 << 56 {
        return 9;
    }
    let mut len = 1;
    let mut rest = v >> 7;
    while rest != 0 {
        len += 1;
        rest >>= 7;
    }
    len
}

/// Encodes `v` at the start of `buf`, returning the number of bytes
/// written. Fails if `buf` is shorter than the encoding requires.
pub fn put_varint(buf: &mut [u8], v: u64) -> Result<usize> {
    let n = varint_len(v);
    if buf.len() < n {
        return Err(DbError::invalid_format(format!(
            "varint needs {} bytes, buffer has {}",
            n,
            buf.len()
        )));
    }
    if n == 9 {
        // Low 8 bits go in the final byte verbatim; the remaining 56 bits
        // spread over eight continuation bytes.
        buf[8] = v as u8;
        let mut rest = v >> 8;
        for i in (0..8).rev() {
            buf[i] = (rest as u8 & 0x7f) | 0x80;
            rest >>= 7;
        }
    } else {
        let mut rest = v;
        for i in (0..n).rev() {
            buf[i] = rest as u8 & 0x7f;
            rest >>= 7;
        }
        for byte in buf.iter_mut().take(n - 1) {
            *byte |= 0x80;
        }
    }
    Ok(n)
}

/// Decodes a varint from the start of `buf`, returning the value and the
/// number of bytes consumed.
pub fn get_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        if i == 8 {
            // Ninth byte: all 8 bits, no continuation flag.
            return Ok(((value << 8) | byte as u64, 9));
        }
        value = (value << 7) | (byte & 0x7f) as u64;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(DbError::invalid_format("truncated varint"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(v: u64) {
        let mut buf = [0u8; MAX_VARINT_LEN];
        let n = put_varint(&mut buf, v).unwrap();
        assert_eq!(n, varint_len(v));
        let (decoded, consumed) = get_varint(&buf[..n]).unwrap();
        assert_eq!(decoded, v, "value {v} did not survive the round trip");
        assert_eq!(consumed, n);
    }

    #[test]
    fn test_round_trip_boundaries() {
        for v in [
            0,
            1,
            127,
            128,
            255,
            16383,
            16384,
            1 << 20,
            1 << 30,
            1 << 40,
            1 << 63,
            u64::MAX,
        ] {
            round_trip(v);
        }
    }

    #[test]
    fn test_expected_widths() {
        assert_eq!(varint_len(0), 1);
        assert_eq!(varint_len(127), 1);
        assert_eq!(varint_len(128), 2);
        assert_eq!(varint_len(16383), 2);
        assert_eq!(varint_len(16384), 3);
        assert_eq!(varint_len((1 << 56) - 1), 8);
        assert_eq!(varint_len(1 << 56), 9);
        assert_eq!(varint_len(u64::MAX), 9);
    }

    #[test]
    fn test_short_buffer() {
        let mut buf = [0u8; 1];
        assert!(put_varint(&mut buf, 128).is_err());

        // A lone continuation byte has no terminator.
        assert!(get_varint(&[0x80]).is_err());
    }
}
