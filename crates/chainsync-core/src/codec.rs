//! Invertible compressed encoding.
//!
//! Values are written as base-128 varints followed by a terminator byte
//! `0xC0 | n` where `n` is the varint byte count. The terminator lets a
//! scanner positioned at the *end* of a value walk backward to its start
//! without a leading length, which block discovery relies on when it has to
//! verify a chain tail right-to-left.

use crate::error::{ChainError, Result};

/// Terminator tag: high bits `110x_xxxx`, low nibble carries the varint
/// byte count (1..=10 for u64).
const TERM_TAG: u8 = 0xC0;
/// Longest varint a u64 can produce.
const MAX_VARINT_BYTES: usize = 10;

pub fn write_inv_u64(mut value: u64, out: &mut Vec<u8>) {
    let mut n = 1u8;
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
        n += 1;
    }
    out.push(value as u8);
    out.push(TERM_TAG | n);
}

pub fn read_inv_u64(input: &[u8], idx: &mut usize) -> Result<u64> {
    let start = *idx;
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let b = *input.get(*idx).ok_or(ChainError::Truncated)?;
        *idx += 1;
        if shift >= 64 {
            return Err(ChainError::InvalidEncoding("varint overflows u64".into()));
        }
        value |= ((b & 0x7f) as u64)
            .checked_shl(shift)
            .ok_or_else(|| ChainError::InvalidEncoding("varint overflows u64".into()))?;
        if (b & 0x80) == 0 {
            break;
        }
        shift += 7;
    }
    let n = *idx - start;
    let term = *input.get(*idx).ok_or(ChainError::Truncated)?;
    *idx += 1;
    if term != TERM_TAG | n as u8 {
        return Err(ChainError::InvalidEncoding(format!(
            "bad terminator {term:#04x} for {n}-byte varint"
        )));
    }
    Ok(value)
}

/// Decode the value whose encoding *ends* at `end` (exclusive), moving `end`
/// back to the start of the encoding.
pub fn read_inv_u64_back(input: &[u8], end: &mut usize) -> Result<u64> {
    if *end == 0 || *end > input.len() {
        return Err(ChainError::Truncated);
    }
    let term = input[*end - 1];
    let n = (term & 0x1f) as usize;
    if term & 0xe0 != TERM_TAG || n == 0 || n > MAX_VARINT_BYTES {
        return Err(ChainError::InvalidEncoding(format!(
            "bad terminator {term:#04x}"
        )));
    }
    if *end < n + 1 {
        return Err(ChainError::Truncated);
    }
    let start = *end - 1 - n;
    let mut idx = start;
    let value = read_inv_u64(input, &mut idx)?;
    debug_assert_eq!(idx, *end);
    *end = start;
    Ok(value)
}

pub fn write_inv_i64(value: i64, out: &mut Vec<u8>) {
    write_inv_u64(zigzag(value), out);
}

pub fn read_inv_i64(input: &[u8], idx: &mut usize) -> Result<i64> {
    Ok(unzigzag(read_inv_u64(input, idx)?))
}

pub fn read_inv_i64_back(input: &[u8], end: &mut usize) -> Result<i64> {
    Ok(unzigzag(read_inv_u64_back(input, end)?))
}

/// Byte blob bracketed by its invertible length on both sides.
pub fn write_inv_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    write_inv_u64(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
    write_inv_u64(bytes.len() as u64, out);
}

pub fn read_inv_bytes(input: &[u8], idx: &mut usize) -> Result<Vec<u8>> {
    let len = read_inv_u64(input, idx)? as usize;
    if input.len() - *idx < len {
        return Err(ChainError::Truncated);
    }
    let out = input[*idx..*idx + len].to_vec();
    *idx += len;
    let trailing = read_inv_u64(input, idx)? as usize;
    if trailing != len {
        return Err(ChainError::InvalidEncoding(format!(
            "length brackets disagree: {len} vs {trailing}"
        )));
    }
    Ok(out)
}

pub fn read_inv_bytes_back(input: &[u8], end: &mut usize) -> Result<Vec<u8>> {
    let len = read_inv_u64_back(input, end)? as usize;
    if *end < len {
        return Err(ChainError::Truncated);
    }
    let start = *end - len;
    let out = input[start..*end].to_vec();
    *end = start;
    let leading = read_inv_u64_back(input, end)? as usize;
    if leading != len {
        return Err(ChainError::InvalidEncoding(format!(
            "length brackets disagree: {leading} vs {len}"
        )));
    }
    Ok(out)
}

pub fn write_inv_str(s: &str, out: &mut Vec<u8>) {
    write_inv_bytes(s.as_bytes(), out);
}

pub fn read_inv_str(input: &[u8], idx: &mut usize) -> Result<String> {
    let bytes = read_inv_bytes(input, idx)?;
    String::from_utf8(bytes).map_err(|e| ChainError::InvalidEncoding(format!("invalid utf-8: {e}")))
}

pub fn read_inv_str_back(input: &[u8], end: &mut usize) -> Result<String> {
    let bytes = read_inv_bytes_back(input, end)?;
    String::from_utf8(bytes).map_err(|e| ChainError::InvalidEncoding(format!("invalid utf-8: {e}")))
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}
