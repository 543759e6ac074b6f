use crate::*;
use chrono::{DateTime, Utc};

/// Manifest bytes used in the tagform binary format.
///
/// Every top-level field is written as `[tag][manifest][payload]`. The low bits of the manifest
/// select the base type, the two flag bits mark sequences and optional values.
///
/// - Base types `1..=13` are stable and part of the wire format.
/// - `FLAG_ARRAY` and `FLAG_NULLABLE` may be OR-ed onto any base type, each at most once.
pub const MANIFEST_BOOL: u8 = 1;
pub const MANIFEST_BYTE: u8 = 2;
pub const MANIFEST_SBYTE: u8 = 3;
pub const MANIFEST_INT16: u8 = 4;
pub const MANIFEST_UINT16: u8 = 5;
/// Zigzag varint.
pub const MANIFEST_INT32: u8 = 6;
pub const MANIFEST_UINT32: u8 = 7;
/// Zigzag varint.
pub const MANIFEST_INT64: u8 = 8;
pub const MANIFEST_UINT64: u8 = 9;
/// UTF-8, length framed.
pub const MANIFEST_STRING: u8 = 10;
pub const MANIFEST_GUID: u8 = 11;
/// 100 ns ticks since 0001-01-01T00:00:00Z, 8 bytes little-endian.
pub const MANIFEST_DATETIME: u8 = 12;
/// Nested record, length framed.
pub const MANIFEST_OBJECT: u8 = 13;

pub const FLAG_ARRAY: u8 = 16;
pub const FLAG_NULLABLE: u8 = 32;

/// Length prefix marking an absent framed value.
pub const NULL_LENGTH: i16 = -1;
/// Width of the little-endian length prefix in front of framed values.
pub const LENGTH_PREFIX: usize = 2;
/// Width of the `[tag][manifest]` pair in front of a top-level field.
pub const FIELD_HEADER: usize = 2;

pub const MAX_VARINT32: usize = 5;
pub const MAX_VARINT64: usize = 10;

pub const TICKS_PER_SECOND: i64 = 10_000_000;
/// Ticks between 0001-01-01T00:00:00Z and the Unix epoch.
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

#[inline]
pub fn is_array(manifest: u8) -> bool {
    manifest & FLAG_ARRAY != 0
}

#[inline]
pub fn is_nullable(manifest: u8) -> bool {
    manifest & FLAG_NULLABLE != 0
}

/// Strips both flag bits, leaving the base type.
#[inline]
pub fn base_type(manifest: u8) -> u8 {
    manifest & !(FLAG_ARRAY | FLAG_NULLABLE)
}

/// Returns true for base types decoded without recursing into a nested record.
#[inline]
pub fn is_primitive(base: u8) -> bool {
    (MANIFEST_BOOL..MANIFEST_OBJECT).contains(&base)
}

/// Returns the payload width of fixed-width base types.
pub fn fixed_width(base: u8) -> Option<usize> {
    match base {
        MANIFEST_BOOL | MANIFEST_BYTE | MANIFEST_SBYTE => Some(1),
        MANIFEST_INT16 | MANIFEST_UINT16 => Some(2),
        MANIFEST_GUID => Some(16),
        MANIFEST_DATETIME => Some(8),
        _ => None,
    }
}

// --- zigzag ---
/// Maps a signed 32-bit integer onto an unsigned one so that small magnitudes stay small.
#[inline]
pub fn zigzag32(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

#[inline]
pub fn unzigzag32(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

#[inline]
pub fn zigzag64(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub fn unzigzag64(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

// --- varint ---
/// Number of bytes `value` occupies as a base-128 varint.
#[inline]
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Writes `value` as a base-128 varint into `dst` and returns the number of bytes used.
///
/// `dst` must hold at least `varint_len(value)` bytes.
#[inline]
pub fn encode_varint(mut value: u64, dst: &mut [u8]) -> usize {
    let mut count = 0;
    loop {
        let low = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            dst[count] = low;
            return count + 1;
        }
        dst[count] = low | 0x80;
        count += 1;
    }
}

/// Reads a 32-bit varint from the front of `src`, returning the value and the bytes consumed.
///
/// # Errors
/// `VarintOverflow` if the fifth byte carries more than the remaining 4 value bits or a
/// continuation bit, `InsufficientData` if `src` ends before the terminating byte.
pub fn decode_varint32(src: &[u8]) -> Result<(u32, usize)> {
    let mut value: u32 = 0;
    for (i, &byte) in src.iter().take(MAX_VARINT32).enumerate() {
        if i == MAX_VARINT32 - 1 && byte > 0x0F {
            return Err(DecodeError::VarintOverflow {
                max_bytes: MAX_VARINT32,
            }
            .into());
        }
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(EncoderError::InsufficientData)
}

/// Reads a 64-bit varint from the front of `src`, returning the value and the bytes consumed.
pub fn decode_varint64(src: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in src.iter().take(MAX_VARINT64).enumerate() {
        // only one value bit is left for the tenth byte
        if i == MAX_VARINT64 - 1 && byte > 0x01 {
            return Err(DecodeError::VarintOverflow {
                max_bytes: MAX_VARINT64,
            }
            .into());
        }
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(EncoderError::InsufficientData)
}

// --- datetime ---
/// Converts a UTC timestamp into 100 ns ticks counted from 0001-01-01T00:00:00Z.
///
/// Timestamps outside the tick range saturate instead of wrapping.
pub fn datetime_to_ticks(value: &DateTime<Utc>) -> i64 {
    value
        .timestamp()
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add(i64::from(value.timestamp_subsec_nanos() / 100))
        .saturating_add(UNIX_EPOCH_TICKS)
}

/// Converts 100 ns ticks back into a UTC timestamp.
///
/// # Errors
/// `InvalidDateTime` if the ticks fall outside the range chrono can represent.
pub fn ticks_to_datetime(ticks: i64) -> Result<DateTime<Utc>> {
    let since_epoch = ticks
        .checked_sub(UNIX_EPOCH_TICKS)
        .ok_or(DecodeError::InvalidDateTime(ticks))?;
    let seconds = since_epoch.div_euclid(TICKS_PER_SECOND);
    let nanos = (since_epoch.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(seconds, nanos)
        .ok_or_else(|| DecodeError::InvalidDateTime(ticks).into())
}
