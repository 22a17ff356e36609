//! Canonical byte encoding
//!
//! Identifiers (txids, block hashes) and signing hashes are computed over a
//! deterministic binary encoding rather than over JSON, so that the same
//! logical value always hashes the same way. Integers are little-endian,
//! variable-length fields carry a VarInt length prefix.

use crate::crypto::Hash256;
use chrono::{DateTime, Utc};

/// Types with a canonical byte encoding
pub trait Encode {
    /// Append the canonical encoding of `self` to `buf`
    fn encode_to(&self, buf: &mut Vec<u8>);

    /// Canonical encoding as a fresh buffer
    fn encoded(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }

    /// Length of the canonical encoding in bytes
    fn encoded_len(&self) -> usize {
        self.encoded().len()
    }
}

/// Write a variable-length integer (VarInt)
pub fn write_varint(buf: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => buf.push(value as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Write bytes with length prefix (VarInt length + data)
pub fn write_var_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    write_varint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

pub fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_var_bytes(buf, s.as_bytes());
}

pub fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn write_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn write_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn write_hash(buf: &mut Vec<u8>, hash: &Hash256) {
    buf.extend_from_slice(hash.as_bytes());
}

/// Timestamps are encoded as whole unix seconds
pub fn write_time(buf: &mut Vec<u8>, time: &DateTime<Utc>) {
    write_i64(buf, time.timestamp());
}

/// Optional values are a presence byte followed by the value
pub fn write_option<T, F>(buf: &mut Vec<u8>, value: Option<&T>, mut write: F)
where
    F: FnMut(&mut Vec<u8>, &T),
{
    match value {
        Some(v) => {
            buf.push(1);
            write(buf, v);
        }
        None => buf.push(0),
    }
}

/// Write a VarInt count followed by each item
pub fn write_list<T: Encode>(buf: &mut Vec<u8>, items: &[T]) {
    write_varint(buf, items.len() as u64);
    for item in items {
        item.encode_to(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_sizes() {
        let cases = [(100u64, 1usize), (1000, 3), (100_000, 5), (u64::MAX, 9)];
        for (value, len) in cases {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            assert_eq!(buf.len(), len, "value {}", value);
        }
    }

    #[test]
    fn test_var_bytes_prefix() {
        let mut buf = Vec::new();
        write_var_bytes(&mut buf, b"hello");
        assert_eq!(buf, vec![5, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_option_presence_byte() {
        let mut some = Vec::new();
        write_option(&mut some, Some(&7u32), |b, v| write_u32(b, *v));
        assert_eq!(some, vec![1, 7, 0, 0, 0]);

        let mut none = Vec::new();
        write_option::<u32, _>(&mut none, None, |b, v| write_u32(b, *v));
        assert_eq!(none, vec![0]);
    }
}
